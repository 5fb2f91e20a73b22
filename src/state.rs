//! Persisted manager state: `<conf_dir>/endpoint.json` (`spec.md` §6).
//!
//! Grounded on `register_endpoint.py`'s `json.dump(reg_info, fp)` into the
//! same file; the Rust rewrite only round-trips the one field the manager
//! itself needs back (`endpoint_id`), since the rest of the registration
//! response is transport configuration consumed once at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub endpoint_id: String,
}

impl PersistedState {
    pub fn load(conf_dir: &Path) -> std::io::Result<Option<PersistedState>> {
        let path = conf_dir.join("endpoint.json");
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let state = serde_json::from_str(&text).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                })?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, conf_dir: &Path) -> std::io::Result<()> {
        let path = conf_dir.join("endpoint.json");
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_temp_directory() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistedState {
            endpoint_id: "11111111-1111-1111-1111-111111111111".into(),
        };
        state.save(dir.path()).unwrap();
        let loaded = PersistedState::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.endpoint_id, state.endpoint_id);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PersistedState::load(dir.path()).unwrap().is_none());
    }
}
