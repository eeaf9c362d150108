//! Heartbeat telemetry and periodic system metrics
//!
//! Reads what a sign can cheaply observe about itself:
//! - Battery level from `/sys/class/power_supply`
//! - Wireless link quality from `/proc/net/wireless`
//! - Uptime, load and memory via sysinfo

use crate::network::ActivePath;
use cityarray_contracts::Telemetry;
use serde_json::{json, Value};
use std::path::Path;
use sysinfo::System;

pub fn collect(active: Option<&ActivePath>, current_message_id: Option<String>) -> Telemetry {
    Telemetry {
        battery: read_battery(Path::new("/sys/class/power_supply")),
        signal_strength: active.and_then(|path| {
            std::fs::read_to_string("/proc/net/wireless")
                .ok()
                .and_then(|content| parse_wireless(&content, &path.interface))
        }),
        network_path: active.map(|p| p.kind),
        interface: active.map(|p| p.interface.clone()),
        uptime_seconds: Some(System::uptime()),
        current_message_id,
        ..Default::default()
    }
}

/// Load and memory snapshot relayed to analytics as a `metrics` signal.
pub fn system_metrics() -> Value {
    let mut sys = System::new();
    sys.refresh_memory();
    let load = System::load_average();
    json!({
        "uptime_seconds": System::uptime(),
        "load_avg": [load.one, load.five, load.fifteen],
        "memory_used_mb": sys.used_memory() / 1024 / 1024,
        "memory_total_mb": sys.total_memory() / 1024 / 1024,
    })
}

/// First battery-type supply's capacity, as a percentage.
fn read_battery(root: &Path) -> Option<u8> {
    let entries = std::fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let dir = entry.path();
        let kind = std::fs::read_to_string(dir.join("type")).unwrap_or_default();
        if kind.trim() != "Battery" {
            continue;
        }
        if let Some(level) = std::fs::read_to_string(dir.join("capacity"))
            .ok()
            .and_then(|c| c.trim().parse::<u8>().ok())
        {
            return Some(level.min(100));
        }
    }
    None
}

/// Signal level (dBm) for `interface` out of `/proc/net/wireless`.
pub fn parse_wireless(content: &str, interface: &str) -> Option<i32> {
    content.lines().skip(2).find_map(|line| {
        let (name, rest) = line.trim().split_once(':')?;
        if name.trim() != interface {
            return None;
        }
        // status, link quality, signal level, noise
        let level = rest.split_whitespace().nth(2)?;
        level.trim_end_matches('.').parse::<f32>().ok().map(|v| v as i32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cityarray_contracts::PathKind;
    use tempfile::tempdir;

    const WIRELESS: &str = "Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
 wlan0: 0000   54.  -56.  -256        0      0      0      0      0        0
";

    #[test]
    fn test_parse_wireless() {
        assert_eq!(parse_wireless(WIRELESS, "wlan0"), Some(-56));
        assert_eq!(parse_wireless(WIRELESS, "eth0"), None);
    }

    #[test]
    fn test_read_battery() {
        let dir = tempdir().unwrap();
        let ac = dir.path().join("AC");
        std::fs::create_dir(&ac).unwrap();
        std::fs::write(ac.join("type"), "Mains\n").unwrap();
        assert_eq!(read_battery(dir.path()), None);

        let bat = dir.path().join("BAT0");
        std::fs::create_dir(&bat).unwrap();
        std::fs::write(bat.join("type"), "Battery\n").unwrap();
        std::fs::write(bat.join("capacity"), "87\n").unwrap();
        assert_eq!(read_battery(dir.path()), Some(87));
    }

    #[test]
    fn test_collect_reports_path() {
        let active = ActivePath { interface: "ppp0".into(), kind: PathKind::Cellular };
        let telemetry = collect(Some(&active), Some("msg-1".into()));
        assert_eq!(telemetry.network_path, Some(PathKind::Cellular));
        assert_eq!(telemetry.interface.as_deref(), Some("ppp0"));
        assert_eq!(telemetry.current_message_id.as_deref(), Some("msg-1"));
        assert!(telemetry.uptime_seconds.is_some());
    }
}
