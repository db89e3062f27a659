use std::{env, fmt::Debug, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use command_feed::LeaseConfig;
use export_writer::ExportWriterConfig;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub instance_id: Option<String>,
    pub listen_addr: String,
    pub state_store_path: String,
    pub blob_storage: BlobStorageConfig,
    /// Directory for rows of unknown commands. Unset disables dead lettering.
    pub dead_letter_path: Option<String>,
    pub structured_logging: bool,
    pub lease: LeaseConfig,
    pub deferred_delete_sweep_secs: u64,
    pub export_writer: ExportWriterConfig,
    pub test_hooks_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let state_store_path = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("command_feed_storage/state");
        ServerConfig {
            env: "local".to_string(),
            instance_id: None,
            listen_addr: "0.0.0.0:8900".to_string(),
            state_store_path: state_store_path.to_string_lossy().to_string(),
            blob_storage: Default::default(),
            dead_letter_path: None,
            structured_logging: false,
            lease: Default::default(),
            deferred_delete_sweep_secs: 30,
            export_writer: Default::default(),
            test_hooks_enabled: false,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.state_store_path.trim().is_empty() {
            return Err(anyhow!("state_store_path must not be empty"));
        }
        if self.deferred_delete_sweep_secs == 0 {
            return Err(anyhow!(
                "deferred_delete_sweep_secs must be greater than zero"
            ));
        }
        self.lease.validate()?;
        self.export_writer.validate()?;
        Ok(())
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, nanoid::nanoid!(8)))
    }

    pub fn deferred_delete_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.deferred_delete_sweep_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_with_defaults() -> Result<()> {
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(
                r#"
env: prod
listen_addr: 127.0.0.1:9000
blob_storage:
  path: s3://exports/staging
dead_letter_path: /var/lib/command-feed/deadletter
lease:
  default_lease_duration_secs: 600
export_writer:
  transient_failure_mode: assume_non_transient
"#,
            ))
            .extract()?;
        config.validate()?;
        assert_eq!(config.env, "prod");
        assert_eq!(config.blob_storage.path, "s3://exports/staging");
        assert_eq!(config.lease.default_lease_duration_secs, 600);
        assert_eq!(config.lease.max_batch_size, LeaseConfig::default().max_batch_size);
        assert_eq!(
            config.export_writer.transient_failure_mode,
            export_writer::TransientFailureMode::AssumeNonTransient
        );
        assert_eq!(config.deferred_delete_sweep_secs, 30);
        assert!(!config.test_hooks_enabled);
        Ok(())
    }

    #[test]
    fn test_invalid_listen_addr() {
        let config = ServerConfig {
            listen_addr: "not-an-addr".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
