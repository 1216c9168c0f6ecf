//! Timestamp of the last successful connection, as reported by the server

use std::path::PathBuf;
use tracing::warn;

/// Value reported when no connection has ever succeeded
pub const NEVER_CONNECTED: &str = "None";

/// Plain-text file holding the last `connected_timestamp`
#[derive(Debug, Clone)]
pub struct LastConnected {
    path: Option<PathBuf>,
}

impl LastConnected {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        LastConnected {
            path: Some(path.into()),
        }
    }

    /// Never persisted; always reads as `None`
    pub fn in_memory() -> Self {
        LastConnected { path: None }
    }

    pub fn get(&self) -> String {
        let Some(path) = &self.path else {
            return NEVER_CONNECTED.to_string();
        };
        match std::fs::read_to_string(path) {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            Ok(_) => NEVER_CONNECTED.to_string(),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {}", path.display(), e);
                }
                NEVER_CONNECTED.to_string()
            }
        }
    }

    pub fn set(&self, timestamp: &str) {
        let Some(path) = &self.path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, timestamp) {
            warn!("Failed to write {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_none() {
        assert_eq!(LastConnected::in_memory().get(), "None");

        let path = std::env::temp_dir().join(format!("relay-tunnel-lc-{}", rand::random::<u64>()));
        assert_eq!(LastConnected::new(&path).get(), "None");
    }

    #[test]
    fn test_set_and_get() {
        let dir = std::env::temp_dir().join(format!("relay-tunnel-lc-{}", rand::random::<u64>()));
        let stamp = LastConnected::new(dir.join("last_connected"));
        stamp.set("2024-05-01T10:00:00.000Z");
        assert_eq!(stamp.get(), "2024-05-01T10:00:00.000Z");
        let _ = std::fs::remove_dir_all(dir);
    }
}
