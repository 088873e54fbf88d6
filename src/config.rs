use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Task queue and batching settings
    pub tasking: TaskingConfig,

    /// Background maintenance settings
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskingConfig {
    /// Maximum tasks drained into one outbound envelope
    pub max_batch_tasks: usize,
    /// Byte budget for one outbound envelope
    pub max_batch_bytes: usize,
    /// Default wait for a synchronous task before resolving to timeout
    pub sync_wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval between archive/statistics sweeps
    pub sweep_interval_seconds: u64,
    /// Completed tasks older than this are archived out of memory
    pub archive_after_seconds: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
                file_path: None,
            },
            tasking: TaskingConfig {
                max_batch_tasks: 64,
                max_batch_bytes: 4 * 1024 * 1024,
                sync_wait_seconds: 60,
            },
            maintenance: MaintenanceConfig {
                sweep_interval_seconds: 60,
                archive_after_seconds: 3600,
            },
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| crate::NocturneError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::NocturneError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nocturne.toml");

        let config = ServerConfig::default();
        config.save_to_file(&path).unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.tasking.max_batch_tasks, config.tasking.max_batch_tasks);
        assert_eq!(loaded.tasking.max_batch_bytes, config.tasking.max_batch_bytes);
        assert_eq!(
            loaded.maintenance.sweep_interval_seconds,
            config.maintenance.sweep_interval_seconds
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let path = PathBuf::from("/nonexistent/nocturne.toml");
        assert!(ServerConfig::from_file(&path).is_err());
    }
}
