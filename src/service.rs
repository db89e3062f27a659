use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::BlobStorage;
use command_feed::{CommandFeed, CompletionAggregator, DeferredDeleteSweeper};
use export_writer::{
    BlobExportPipelineFactory,
    CommandDataWriterFactory,
    DeadLetterStore,
    DiskDeadLetterStore,
    ExportArchiveBuilder,
};
use state_store::CommandFeedState;
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use super::routes::RouteState;
use crate::{
    config::ServerConfig,
    exports::{ExportFinalizer, FeedStateTable, LocalCommandFeedClientProvider},
    routes::create_routes,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_storage: Arc<BlobStorage>,
    pub state: Arc<CommandFeedState>,
    pub feed: Arc<CommandFeed>,
    pub aggregator: Arc<CompletionAggregator>,
    pub sweeper: Arc<DeferredDeleteSweeper>,
    pub writer_factory: Arc<CommandDataWriterFactory>,
    pub finalizer: Arc<ExportFinalizer>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );
        let state = CommandFeedState::new(config.state_store_path.parse()?)
            .await
            .context("error initializing state store")?;
        let feed = Arc::new(CommandFeed::new(state.clone(), config.lease.clone()));
        let aggregator = Arc::new(CompletionAggregator::new(state.clone()));
        let sweeper = Arc::new(DeferredDeleteSweeper::new(
            state.clone(),
            config.deferred_delete_sweep_interval(),
        ));

        let dead_letter_store = config.dead_letter_path.as_ref().map(|path| {
            info!(path = %path, "dead lettering enabled");
            Arc::new(DiskDeadLetterStore::new(path)) as Arc<dyn DeadLetterStore>
        });
        let writer_factory = Arc::new(CommandDataWriterFactory::new(
            Arc::new(FeedStateTable::new(state.clone())),
            Arc::new(LocalCommandFeedClientProvider::new(feed.clone())),
            Arc::new(BlobExportPipelineFactory),
            dead_letter_store,
            config.export_writer.clone(),
        ));
        let finalizer = Arc::new(ExportFinalizer::new(
            aggregator.clone(),
            ExportArchiveBuilder::new(config.export_writer.archive_format),
            blob_storage.clone(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            blob_storage,
            state,
            feed,
            aggregator,
            sweeper,
            writer_factory,
            finalizer,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            feed: self.feed.clone(),
            aggregator: self.aggregator.clone(),
            finalizer: self.finalizer.clone(),
            test_hooks_enabled: self.config.test_hooks_enabled,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let sweeper = self.sweeper.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            sweeper.start(shutdown_rx).await;
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state());
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    if shutdown_tx.send(()).is_err() {
        info!("no background task left to notify");
    }
    info!("signal received, shutting down server gracefully");
}
