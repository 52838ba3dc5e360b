use std::path::Path;

use crate::config::schema::EngineConfig;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.max_workers == 0 {
        return Err(ConfigError::Validation {
            message: "max_workers must be at least 1".to_string(),
        });
    }

    if config.baud_rate == 0 {
        return Err(ConfigError::Validation {
            message: "baud_rate must be positive".to_string(),
        });
    }

    if config.chip_type.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "chip_type must not be empty".to_string(),
        });
    }

    if config.flash_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "flash_timeout_secs must be positive".to_string(),
        });
    }

    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Validation {
            message: "poll_interval_ms must be positive".to_string(),
        });
    }

    if config.metrics_retry.attempts == 0 {
        return Err(ConfigError::Validation {
            message: "metrics_retry.attempts must be at least 1".to_string(),
        });
    }

    if config.job_history_limit == 0 {
        return Err(ConfigError::Validation {
            message: "job_history_limit must be at least 1".to_string(),
        });
    }

    if config.port_patterns.is_empty() {
        return Err(ConfigError::Validation {
            message: "port_patterns must list at least one pattern".to_string(),
        });
    }

    for pattern in &config.port_patterns {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            });
        }
    }

    Ok(())
}
