use std::{future::Future, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{AgentId, CommandId, CommandState, CommandType, PrivacyCommand};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::ExportWriterConfig,
    dead_letter::DeadLetterStore,
    status::AbandonReason,
    storage::{ExportPipelineFactory, StorageSink},
    writer::DataWriter,
};

/// Persisted per agent × command state.
#[async_trait]
pub trait CommandStateTable: Send + Sync {
    async fn get_command_state(
        &self,
        agent_id: &AgentId,
        command_id: &CommandId,
    ) -> Result<Option<CommandState>>;
}

#[async_trait]
pub trait CommandFeedClient: Send + Sync {
    /// The live command, or `None` once the feed no longer has it.
    async fn query_command(
        &self,
        command_id: &CommandId,
        lease_receipt: &str,
    ) -> Result<Option<PrivacyCommand>>;
}

#[async_trait]
pub trait CommandFeedClientProvider: Send + Sync {
    async fn create_client(&self, agent_id: &AgentId) -> Result<Arc<dyn CommandFeedClient>>;
}

/// One logical unit of work. The command feed client is created on first use
/// and shared by every writer made with this context.
#[derive(Default)]
pub struct ExecutionContext {
    client: OnceCell<Arc<dyn CommandFeedClient>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn client(
        &self,
        provider: &dyn CommandFeedClientProvider,
        agent_id: &AgentId,
    ) -> Result<Arc<dyn CommandFeedClient>> {
        self.client
            .get_or_try_init(|| provider.create_client(agent_id))
            .await
            .cloned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("invalid argument: {0} must not be empty")]
    InvalidArgument(&'static str),

    #[error("command {command_id} is a {command_type:?} command, expected an export")]
    UnexpectedCommand {
        command_id: CommandId,
        command_type: CommandType,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("{phase} failed: {error:#}")]
    Failed {
        phase: &'static str,
        error: anyhow::Error,
    },
}

/// Picks the writer for an agent's export of a command.
pub struct CommandDataWriterFactory {
    state_table: Arc<dyn CommandStateTable>,
    client_provider: Arc<dyn CommandFeedClientProvider>,
    pipeline_factory: Arc<dyn ExportPipelineFactory>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    config: ExportWriterConfig,
}

impl CommandDataWriterFactory {
    pub fn new(
        state_table: Arc<dyn CommandStateTable>,
        client_provider: Arc<dyn CommandFeedClientProvider>,
        pipeline_factory: Arc<dyn ExportPipelineFactory>,
        dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
        config: ExportWriterConfig,
    ) -> Self {
        Self {
            state_table,
            client_provider,
            pipeline_factory,
            dead_letter_store,
            config,
        }
    }

    pub fn config(&self) -> &ExportWriterConfig {
        &self.config
    }

    #[tracing::instrument(
        skip_all,
        fields(agent_id = %agent_id, command_id = %command_id, file_name = %file_name)
    )]
    pub async fn create(
        &self,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        agent_id: &AgentId,
        command_id: &CommandId,
        file_name: &str,
    ) -> Result<DataWriter, FactoryError> {
        if agent_id.is_empty() {
            return Err(FactoryError::InvalidArgument("agent_id"));
        }
        if command_id.is_empty() {
            return Err(FactoryError::InvalidArgument("command_id"));
        }
        if file_name.trim().is_empty() {
            return Err(FactoryError::InvalidArgument("file_name"));
        }
        let cancel = cancel.child_token();
        let no_op = |reason: AbandonReason| -> Result<DataWriter, FactoryError> {
            info!(reason = %reason, "export rows will be dropped");
            Ok(DataWriter::no_op(
                agent_id.clone(),
                command_id.clone(),
                file_name,
                cancel.clone(),
                reason,
            ))
        };

        let state = run_phase(
            &cancel,
            "command state lookup",
            self.state_table.get_command_state(agent_id, command_id),
        )
        .await?;
        let Some(state) = state else {
            info!("no command state, writing to dead letter");
            return Ok(DataWriter::dead_letter(
                agent_id.clone(),
                command_id.clone(),
                file_name,
                cancel.clone(),
                self.dead_letter_store.clone(),
            ));
        };
        if state.not_applicable {
            return no_op(AbandonReason::NotApplicable);
        }
        if state.is_complete {
            return no_op(AbandonReason::AlreadyComplete);
        }
        if state.ignore_command {
            return no_op(AbandonReason::Test);
        }
        let Some(lease_receipt) = state.lease_receipt.as_deref() else {
            return no_op(AbandonReason::NoCommand);
        };

        let client = run_phase(
            &cancel,
            "command feed client creation",
            context.client(self.client_provider.as_ref(), agent_id),
        )
        .await?;
        let command = run_phase(
            &cancel,
            "command query",
            client.query_command(command_id, lease_receipt),
        )
        .await?;
        let Some(command) = command else {
            return no_op(AbandonReason::NoCommand);
        };
        let Some(destination) = command.export_destination() else {
            error!(command_type = ?command.command_type(), "command is not an export");
            return Err(FactoryError::UnexpectedCommand {
                command_id: command_id.clone(),
                command_type: command.command_type(),
            });
        };

        let pipeline = self
            .pipeline_factory
            .create(agent_id, command_id, destination)
            .map_err(|error| phase_failed("export pipeline creation", error))?;
        Ok(DataWriter::new(
            agent_id.clone(),
            command_id.clone(),
            file_name,
            cancel.clone(),
            Box::new(StorageSink::new(
                pipeline,
                self.config.transient_failure_mode,
                self.config.append_timeout(),
            )),
        ))
    }
}

async fn run_phase<T>(
    cancel: &CancellationToken,
    phase: &'static str,
    future: impl Future<Output = Result<T>>,
) -> Result<T, FactoryError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FactoryError::Cancelled),
        result = future => result.map_err(|error| phase_failed(phase, error)),
    }
}

fn phase_failed(phase: &'static str, error: anyhow::Error) -> FactoryError {
    error!(phase, "creating data writer failed: {:#}", error);
    FactoryError::Failed { phase, error }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use data_model::test_objects::tests::{mock_delete_command, mock_export_command};

    use super::*;
    use crate::{
        error::PipelineError,
        status::WriterKind,
        storage::ExportPipeline,
    };

    const AGENT: &str = "agent-1";
    const FILE: &str = "Browsing.json";

    #[derive(Default)]
    struct MockStateTable {
        states: Mutex<HashMap<(AgentId, CommandId), CommandState>>,
    }

    impl MockStateTable {
        fn with(state: CommandState) -> Self {
            let table = Self::default();
            table.states.lock().unwrap().insert(
                (state.agent_id.clone(), state.command_id.clone()),
                state,
            );
            table
        }
    }

    #[async_trait]
    impl CommandStateTable for MockStateTable {
        async fn get_command_state(
            &self,
            agent_id: &AgentId,
            command_id: &CommandId,
        ) -> Result<Option<CommandState>> {
            Ok(self
                .states
                .lock()
                .unwrap()
                .get(&(agent_id.clone(), command_id.clone()))
                .cloned())
        }
    }

    struct MockClient {
        command: Option<PrivacyCommand>,
        fail: bool,
        queries: Mutex<Vec<(CommandId, String)>>,
    }

    #[async_trait]
    impl CommandFeedClient for MockClient {
        async fn query_command(
            &self,
            command_id: &CommandId,
            lease_receipt: &str,
        ) -> Result<Option<PrivacyCommand>> {
            self.queries
                .lock()
                .unwrap()
                .push((command_id.clone(), lease_receipt.to_string()));
            if self.fail {
                return Err(anyhow::anyhow!("feed unavailable"));
            }
            Ok(self.command.clone())
        }
    }

    struct MockProvider {
        client: Arc<MockClient>,
        created: AtomicUsize,
    }

    impl MockProvider {
        fn new(command: Option<PrivacyCommand>, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                client: Arc::new(MockClient {
                    command,
                    fail,
                    queries: Mutex::new(Vec::new()),
                }),
                created: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CommandFeedClientProvider for MockProvider {
        async fn create_client(&self, _agent_id: &AgentId) -> Result<Arc<dyn CommandFeedClient>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.client.clone())
        }
    }

    struct NullPipeline;

    #[async_trait]
    impl ExportPipeline for NullPipeline {
        async fn export(&mut self, _: &str, _: &str, data: &str) -> Result<u64, PipelineError> {
            Ok(data.len() as u64)
        }

        async fn finish(&mut self) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn abort(&mut self) {}
    }

    #[derive(Default)]
    struct MockPipelineFactory {
        created: Mutex<Vec<(CommandId, String)>>,
    }

    impl ExportPipelineFactory for MockPipelineFactory {
        fn create(
            &self,
            _agent_id: &AgentId,
            command_id: &CommandId,
            destination_uri: &str,
        ) -> Result<Box<dyn ExportPipeline>> {
            self.created
                .lock()
                .unwrap()
                .push((command_id.clone(), destination_uri.to_string()));
            Ok(Box::new(NullPipeline))
        }
    }

    struct Fixture {
        factory: CommandDataWriterFactory,
        provider: Arc<MockProvider>,
        pipelines: Arc<MockPipelineFactory>,
    }

    fn fixture(states: MockStateTable, provider: Arc<MockProvider>) -> Fixture {
        let pipelines = Arc::new(MockPipelineFactory::default());
        let factory = CommandDataWriterFactory::new(
            Arc::new(states),
            provider.clone(),
            pipelines.clone(),
            None,
            ExportWriterConfig::default(),
        );
        Fixture {
            factory,
            provider,
            pipelines,
        }
    }

    fn leased_state(command: &PrivacyCommand) -> CommandState {
        let mut state = CommandState::new(AGENT.into(), command.id.clone());
        state.lease_receipt = Some("receipt-1".to_string());
        state
    }

    #[tokio::test]
    async fn test_empty_identifiers_are_rejected() {
        let f = fixture(MockStateTable::default(), MockProvider::new(None, false));
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        let err = f
            .factory
            .create(&ctx, &cancel, &"".into(), &"cmd".into(), FILE)
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::InvalidArgument("agent_id")));
        let err = f
            .factory
            .create(&ctx, &cancel, &AGENT.into(), &"cmd".into(), " ")
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::InvalidArgument("file_name")));
    }

    #[tokio::test]
    async fn test_missing_state_goes_to_dead_letter() -> anyhow::Result<()> {
        let f = fixture(MockStateTable::default(), MockProvider::new(None, false));
        let writer = f
            .factory
            .create(
                &ExecutionContext::new(),
                &CancellationToken::new(),
                &AGENT.into(),
                &"cmd".into(),
                FILE,
            )
            .await?;
        assert!(writer.status().is_dead_letter());
        assert!(writer.status().has_reason(AbandonReason::NoDeadLetter));
        assert_eq!(f.provider.created.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_states_give_no_op_writers() -> anyhow::Result<()> {
        let command = mock_export_command();
        let cases: [(fn(&mut CommandState), AbandonReason); 3] = [
            (|s| s.not_applicable = true, AbandonReason::NotApplicable),
            (|s| s.is_complete = true, AbandonReason::AlreadyComplete),
            (|s| s.ignore_command = true, AbandonReason::Test),
        ];
        for (mutate, reason) in cases {
            let mut state = leased_state(&command);
            mutate(&mut state);
            let f = fixture(MockStateTable::with(state), MockProvider::new(None, false));
            let writer = f
                .factory
                .create(
                    &ExecutionContext::new(),
                    &CancellationToken::new(),
                    &AGENT.into(),
                    &command.id,
                    FILE,
                )
                .await?;
            assert_eq!(writer.status().kind, WriterKind::NoOp);
            assert!(writer.status().has_reason(reason));
            assert_eq!(f.provider.created.load(Ordering::SeqCst), 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_command_gives_no_op() -> anyhow::Result<()> {
        let command = mock_export_command();
        let f = fixture(
            MockStateTable::with(leased_state(&command)),
            MockProvider::new(None, false),
        );
        let writer = f
            .factory
            .create(
                &ExecutionContext::new(),
                &CancellationToken::new(),
                &AGENT.into(),
                &command.id,
                FILE,
            )
            .await?;
        assert!(writer.status().has_reason(AbandonReason::NoCommand));
        let queries = f.provider.client.queries.lock().unwrap().clone();
        assert_eq!(queries, vec![(command.id.clone(), "receipt-1".to_string())]);
        Ok(())
    }

    #[tokio::test]
    async fn test_client_errors_propagate() {
        let command = mock_export_command();
        let f = fixture(
            MockStateTable::with(leased_state(&command)),
            MockProvider::new(None, true),
        );
        let err = f
            .factory
            .create(
                &ExecutionContext::new(),
                &CancellationToken::new(),
                &AGENT.into(),
                &command.id,
                FILE,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FactoryError::Failed {
                phase: "command query",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_export_command_is_unexpected() {
        let command = mock_delete_command();
        let f = fixture(
            MockStateTable::with(leased_state(&command)),
            MockProvider::new(Some(command.clone()), false),
        );
        let err = f
            .factory
            .create(
                &ExecutionContext::new(),
                &CancellationToken::new(),
                &AGENT.into(),
                &command.id,
                FILE,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FactoryError::UnexpectedCommand {
                command_type: CommandType::Delete,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_export_command_gets_storage_writer() -> anyhow::Result<()> {
        let command = mock_export_command();
        let f = fixture(
            MockStateTable::with(leased_state(&command)),
            MockProvider::new(Some(command.clone()), false),
        );
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let writer = f
                .factory
                .create(&ctx, &cancel, &AGENT.into(), &command.id, FILE)
                .await?;
            assert_eq!(writer.status().kind, WriterKind::Storage);
            assert!(!writer.status().is_abandoned());
        }
        // one client per execution context
        assert_eq!(f.provider.created.load(Ordering::SeqCst), 1);
        let created = f.pipelines.created.lock().unwrap().clone();
        assert_eq!(created.len(), 2);
        assert_eq!(
            created[0],
            (
                command.id.clone(),
                command.export_destination().unwrap().to_string()
            )
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_create() {
        let command = mock_export_command();
        let f = fixture(
            MockStateTable::with(leased_state(&command)),
            MockProvider::new(Some(command.clone()), false),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f
            .factory
            .create(
                &ExecutionContext::new(),
                &cancel,
                &AGENT.into(),
                &command.id,
                FILE,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::Cancelled));
    }
}
