//! Engine tuning constants.
//!
//! Loaded once at startup from a RON file; every participant must use the
//! same values, so the session setup exchanges or verifies them out of band.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// How many queued path requests the kernel services per tick.
    pub path_requests_per_tick: usize,
    /// Write a gzipped JSON state dump every tick when set.
    pub state_log_path: Option<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            path_requests_per_tick: 8,
            state_log_path: None,
        }
    }
}

impl SimConfig {
    pub fn load_from_str(source: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(source)
    }

    pub fn load_from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::load_from_str(&source).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad config {}: {}", path.display(), e),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_ron() {
        let config = SimConfig::default();
        let text = ron::to_string(&config).unwrap();
        let back = SimConfig::load_from_str(&text).unwrap();
        assert_eq!(back.path_requests_per_tick, config.path_requests_per_tick);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config = SimConfig::load_from_str("(path_requests_per_tick: 3)").unwrap();
        assert_eq!(config.path_requests_per_tick, 3);
        assert!(config.state_log_path.is_none());
    }
}
