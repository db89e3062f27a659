use std::path::PathBuf;

use anyhow::Result;
use blob_store::BlobStorageConfig;
use data_model::{test_objects::tests::mock_command, CommandPayload, PrivacyCommand};
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, service::Service};

pub struct TestService {
    pub service: Service,
    // dropping the dir removes state, blobs and dead letters
    temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().to_path_buf();
        let cfg = ServerConfig {
            state_store_path: root.join("state_store").to_string_lossy().to_string(),
            blob_storage: BlobStorageConfig::new(&root.join("blob_store").to_string_lossy()),
            dead_letter_path: Some(root.join("deadletter_root").to_string_lossy().to_string()),
            test_hooks_enabled: true,
            ..Default::default()
        };
        let srv = Service::new(cfg).await?;

        Ok(Self {
            service: srv,
            temp_dir,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Destination for export commands, on local disk so that writers and
    /// the archive builder see the same files.
    pub fn export_uri(&self) -> String {
        format!("file://{}", self.path().join("exports").to_string_lossy())
    }

    pub fn export_command(&self) -> PrivacyCommand {
        mock_command(CommandPayload::Export {
            data_types: vec!["BrowsingHistory".to_string()],
            storage_uri: self.export_uri(),
        })
    }
}
