//! Kernel-assigned sign identity, persisted across restarts

use std::path::Path;
use tracing::warn;

/// Returns the stored device id, if any. Blank files count as missing.
pub async fn load_device_id(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let id = content.trim();
            (!id.is_empty()).then(|| id.to_string())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to read device id {}: {}", path.display(), e);
            None
        }
    }
}

pub async fn save_device_id(path: &Path, device_id: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, device_id).await?;
    tokio::fs::rename(&tmp, path).await
}
