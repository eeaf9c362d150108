//! Durable local cache: emergency templates and the offline trigger queue
//!
//! Everything lives in one JSON file rewritten atomically (temp file then
//! rename), so a crash never leaves a half-written queue behind.

use cityarray_contracts::{EmergencyKind, EmergencyTemplate, OfflineReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    pub seq: u64,
    pub content: String,
    #[serde(default)]
    pub template: Option<EmergencyKind>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub sent: bool,
}

impl QueueEntry {
    pub fn to_report(&self) -> OfflineReport {
        OfflineReport {
            entry_id: self.id.clone(),
            content: self.content.clone(),
            template: self.template,
            created_at: self.created_at,
        }
    }
}

fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    templates: Vec<EmergencyTemplate>,
    #[serde(default)]
    queue: Vec<QueueEntry>,
    #[serde(default)]
    next_seq: u64,
}

pub struct LocalCache {
    path: PathBuf,
    data: CacheFile,
}

impl LocalCache {
    /// Loads the cache, seeding the built-in emergency catalog when absent.
    /// An unreadable file is set aside as `*.corrupt` rather than blocking startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Cache {} unreadable ({}), starting fresh", path.display(), e);
                    std::fs::rename(&path, path.with_extension("corrupt"))?;
                    CacheFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheFile::default(),
            Err(e) => return Err(e.into()),
        };

        let mut cache = Self { path, data };
        if cache.data.templates.is_empty() {
            cache.data.templates = EmergencyKind::catalog();
            cache.persist()?;
        }
        info!(
            "Local cache ready: {} templates, {} queued",
            cache.data.templates.len(),
            cache.pending().len()
        );
        Ok(cache)
    }

    pub fn template(&self, kind: EmergencyKind) -> Option<&EmergencyTemplate> {
        self.data.templates.iter().find(|t| t.kind == kind)
    }

    /// Replaces cached templates with the kernel's copy. Kinds the kernel
    /// omits keep their previous (or built-in) version.
    pub fn cache_templates(&mut self, templates: Vec<EmergencyTemplate>) -> Result<(), CacheError> {
        for template in templates {
            match self.data.templates.iter_mut().find(|t| t.kind == template.kind) {
                Some(existing) => *existing = template,
                None => self.data.templates.push(template),
            }
        }
        self.persist()
    }

    pub fn enqueue(&mut self, content: impl Into<String>, template: Option<EmergencyKind>) -> Result<QueueEntry, CacheError> {
        self.data.next_seq += 1;
        let entry = QueueEntry {
            id: new_entry_id(),
            seq: self.data.next_seq,
            content: content.into(),
            template,
            created_at: OffsetDateTime::now_utc(),
            sent: false,
        };
        self.data.queue.push(entry.clone());
        self.persist()?;
        Ok(entry)
    }

    /// Unsent entries, oldest first.
    pub fn pending(&self) -> Vec<QueueEntry> {
        let mut pending: Vec<QueueEntry> = self.data.queue.iter().filter(|e| !e.sent).cloned().collect();
        pending.sort_by_key(|e| e.seq);
        pending
    }

    pub fn mark_sent(&mut self, seq: u64) -> Result<(), CacheError> {
        if let Some(entry) = self.data.queue.iter_mut().find(|e| e.seq == seq) {
            entry.sent = true;
            self.persist()?;
        }
        Ok(())
    }

    pub fn prune_sent(&mut self) -> Result<usize, CacheError> {
        let before = self.data.queue.len();
        self.data.queue.retain(|e| !e.sent);
        let removed = before - self.data.queue.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(&self.data)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_seeds_builtin_templates() {
        let dir = tempdir().unwrap();
        let cache = LocalCache::open(dir.path().join("cache.json")).unwrap();
        for kind in EmergencyKind::ALL {
            assert!(cache.template(kind).is_some(), "missing {kind}");
        }
        assert_eq!(
            cache.template(EmergencyKind::Evacuate).unwrap().content,
            "EVACUATE NOW\nFollow exit signs\nStay calm"
        );
    }

    #[test]
    fn test_queue_survives_reopen_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        {
            let mut cache = LocalCache::open(&path).unwrap();
            cache.enqueue("OFFLINE: evacuate", Some(EmergencyKind::Evacuate)).unwrap();
            cache.enqueue("OFFLINE: shelter", Some(EmergencyKind::Shelter)).unwrap();
        }
        let mut cache = LocalCache::open(&path).unwrap();
        let pending = cache.pending();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].seq < pending[1].seq);
        assert_eq!(pending[0].content, "OFFLINE: evacuate");

        cache.mark_sent(pending[0].seq).unwrap();
        let third = cache.enqueue("OFFLINE: medical", None).unwrap();
        assert!(third.seq > pending[1].seq);
        assert_eq!(cache.prune_sent().unwrap(), 1);

        let cache = LocalCache::open(&path).unwrap();
        let seqs: Vec<u64> = cache.pending().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![pending[1].seq, third.seq]);
    }

    #[test]
    fn test_kernel_templates_override_builtin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut cache = LocalCache::open(&path).unwrap();
        let mut custom = EmergencyKind::Weather.template();
        custom.content = "STORM WARNING\nSeek cover".into();
        cache.cache_templates(vec![custom]).unwrap();

        let cache = LocalCache::open(&path).unwrap();
        assert_eq!(cache.template(EmergencyKind::Weather).unwrap().content, "STORM WARNING\nSeek cover");
        assert!(cache.template(EmergencyKind::AllClear).is_some());
    }

    #[test]
    fn test_corrupt_file_is_set_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();

        let cache = LocalCache::open(&path).unwrap();
        assert!(cache.pending().is_empty());
        assert!(dir.path().join("cache.corrupt").exists());
    }

    #[test]
    fn test_entry_ids_unique_across_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let before = LocalCache::open(&path).unwrap().enqueue("OFFLINE: evacuate", None).unwrap();

        std::fs::write(&path, "{not json").unwrap();
        let mut cache = LocalCache::open(&path).unwrap();
        let after = cache.enqueue("OFFLINE: medical", None).unwrap();

        // seq restarts with the fresh file, the report id does not repeat
        assert_eq!(after.seq, before.seq);
        assert_ne!(after.to_report().entry_id, before.to_report().entry_id);
    }
}
