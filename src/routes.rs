use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json,
    Router,
};
use command_feed::{CommandFeed, CommandFeedError, CompletionAggregator};
use data_model::{AgentId, CommandId, CommandStatusResponse, DeliveredCommand, PrivacyCommand};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    exports::ExportFinalizer,
    http_objects::{
        CheckpointRequest,
        CheckpointResult,
        CommandFeedApiError,
        ExportArchive,
        GetCommandsRequest,
        PublishCommand,
        QueryCommandParams,
        ReceiveRequest,
        RegisterAgent,
        StatusQueryParams,
        SubjectQueryParams,
        CHECKPOINT_DELAY_HEADER,
    },
};

#[derive(Clone)]
pub struct RouteState {
    pub feed: Arc<CommandFeed>,
    pub aggregator: Arc<CompletionAggregator>,
    pub finalizer: Arc<ExportFinalizer>,
    pub test_hooks_enabled: bool,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_origin(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/", get(index))
        .route("/agents/{agent_id}", put(register_agent))
        .route("/agents/{agent_id}/commands", post(publish_command))
        .route("/agents/{agent_id}/commands/batch", post(get_commands))
        .route("/agents/{agent_id}/commands/{command_id}", get(query_command))
        .route("/agents/{agent_id}/receive", post(receive_command))
        .route("/agents/{agent_id}/checkpoint", post(checkpoint))
        .route("/status/commands/{command_id}", get(command_status))
        .route("/status/requester/{requester}", get(status_by_requester))
        .route("/status/subject", get(status_by_subject))
        .route("/exports/{command_id}/archive", post(build_export_archive));

    #[cfg(any(test, feature = "test-hooks"))]
    let router = router.route(
        "/test/commands/{command_id}/force_complete",
        post(force_complete),
    );

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(route_state)
}

async fn index() -> &'static str {
    "command feed server"
}

async fn register_agent(
    Path(agent_id): Path<String>,
    State(state): State<RouteState>,
    Json(request): Json<RegisterAgent>,
) -> Result<(), CommandFeedApiError> {
    state
        .feed
        .register_agent(request.into_agent(&agent_id))
        .await?;
    Ok(())
}

async fn publish_command(
    Path(agent_id): Path<String>,
    State(state): State<RouteState>,
    Json(request): Json<PublishCommand>,
) -> Result<(), CommandFeedApiError> {
    let targets = request.targets(&agent_id);
    state.feed.publish(request.command, targets).await?;
    Ok(())
}

async fn receive_command(
    Path(agent_id): Path<String>,
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<Response, CommandFeedApiError> {
    let agent_id: AgentId = agent_id.into();
    // an empty body receives the next visible command
    let request: ReceiveRequest = if body.is_empty() {
        ReceiveRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| CommandFeedApiError::bad_request(&e.to_string()))?
    };
    let delivered = match (&request.command_id, &request.superseded_command_id) {
        (Some(command_id), Some(superseded)) => {
            state
                .feed
                .receive_with_filtering(&agent_id, command_id, superseded)
                .await
        }
        (None, Some(_)) => {
            return Err(CommandFeedApiError::bad_request(
                "superseded_command_id needs a command_id",
            ))
        }
        (command_id, None) => state.feed.receive(&agent_id, command_id.as_ref()).await,
    };
    match delivered {
        Ok(delivered) => Ok(Json(delivered).into_response()),
        Err(CommandFeedError::NotFound { .. }) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(err) => Err(err.into()),
    }
}

async fn get_commands(
    Path(agent_id): Path<String>,
    State(state): State<RouteState>,
    Json(request): Json<GetCommandsRequest>,
) -> Result<Json<Vec<DeliveredCommand>>, CommandFeedApiError> {
    let delivered = state
        .feed
        .get_commands(&agent_id.into(), request.max_commands)
        .await?;
    Ok(Json(delivered))
}

async fn checkpoint(
    Path(agent_id): Path<String>,
    State(state): State<RouteState>,
    Json(request): Json<CheckpointRequest>,
) -> Result<Response, CommandFeedApiError> {
    let response = state
        .feed
        .checkpoint(&agent_id.into(), request.into())
        .await?;
    let mut http_response = Json(CheckpointResult::from(&response)).into_response();
    if let Some(delay) = response.deferred_delete_delay {
        http_response.headers_mut().insert(
            CHECKPOINT_DELAY_HEADER,
            HeaderValue::from(delay.as_secs()),
        );
    }
    Ok(http_response)
}

async fn query_command(
    Path((agent_id, command_id)): Path<(String, String)>,
    Query(params): Query<QueryCommandParams>,
    State(state): State<RouteState>,
) -> Result<Json<PrivacyCommand>, CommandFeedApiError> {
    let command = state
        .feed
        .query_command(&agent_id.into(), &command_id.into(), &params.lease_receipt)
        .await?;
    command
        .map(Json)
        .ok_or_else(|| CommandFeedApiError::not_found("command not found"))
}

async fn command_status(
    Path(command_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<CommandStatusResponse>, CommandFeedApiError> {
    Ok(Json(state.aggregator.command_status(&command_id.into())?))
}

async fn status_by_requester(
    Path(requester): Path<String>,
    Query(params): Query<StatusQueryParams>,
    State(state): State<RouteState>,
) -> Result<Json<Vec<CommandStatusResponse>>, CommandFeedApiError> {
    Ok(Json(
        state
            .aggregator
            .status_by_requester(&requester, params.command_type)?,
    ))
}

async fn status_by_subject(
    Query(params): Query<SubjectQueryParams>,
    State(state): State<RouteState>,
) -> Result<Json<Vec<CommandStatusResponse>>, CommandFeedApiError> {
    Ok(Json(
        state
            .aggregator
            .status_by_subject(&params.subject, params.command_type)?,
    ))
}

async fn build_export_archive(
    Path(command_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<ExportArchive>, CommandFeedApiError> {
    let command_id: CommandId = command_id.into();
    let Some(summary) = state.finalizer.finalize(&command_id).await? else {
        return Err(CommandFeedApiError::new(
            StatusCode::CONFLICT,
            "export is not complete",
        ));
    };
    info!(
        command_id = %command_id,
        entries = summary.entries.len(),
        "export archive built"
    );
    Ok(Json(ExportArchive {
        key: ExportFinalizer::archive_key(&command_id),
        command_id,
        entries: summary.entries,
        size_bytes: summary.size_bytes,
    }))
}

#[cfg(any(test, feature = "test-hooks"))]
async fn force_complete(
    Path(command_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<(), CommandFeedApiError> {
    if !state.test_hooks_enabled {
        return Err(CommandFeedApiError::not_found("test hooks are disabled"));
    }
    info!(command_id = %command_id, "force complete requested");
    state.feed.force_complete(&command_id.into()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use data_model::test_objects::tests::mock_agent;
    use state_store::requests::CommandTarget;

    use super::*;
    use crate::testing::TestService;

    fn agent_target() -> Vec<CommandTarget> {
        vec![CommandTarget {
            agent_id: "agent-1".into(),
            asset_group_id: "ag-1".into(),
        }]
    }

    #[tokio::test]
    async fn test_receive_without_commands_is_no_content() -> Result<()> {
        let test_srv = TestService::new().await?;
        let response = receive_command(
            Path("agent-1".to_string()),
            State(test_srv.service.route_state()),
            Bytes::new(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        Ok(())
    }

    #[tokio::test]
    async fn test_query_command_checks_the_receipt_agent() -> Result<()> {
        let test_srv = TestService::new().await?;
        let service = &test_srv.service;
        service.feed.register_agent(mock_agent("agent-1")).await?;
        let command = test_srv.export_command();
        service.feed.publish(command.clone(), agent_target()).await?;
        let delivered = service.feed.receive(&"agent-1".into(), None).await?;

        let Ok(Json(found)) = query_command(
            Path(("agent-1".to_string(), command.id.to_string())),
            Query(QueryCommandParams {
                lease_receipt: delivered.lease_receipt.clone(),
            }),
            State(service.route_state()),
        )
        .await
        else {
            panic!("command should be found");
        };
        assert_eq!(found.id, command.id);

        let Err(err) = query_command(
            Path(("agent-2".to_string(), command.id.to_string())),
            Query(QueryCommandParams {
                lease_receipt: delivered.lease_receipt,
            }),
            State(service.route_state()),
        )
        .await
        else {
            panic!("receipt of another agent must be rejected");
        };
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_checkpoint_returns_new_receipt() -> Result<()> {
        let test_srv = TestService::new().await?;
        let service = &test_srv.service;
        service.feed.register_agent(mock_agent("agent-1")).await?;
        let command = test_srv.export_command();
        service.feed.publish(command.clone(), agent_target()).await?;
        let delivered = service.feed.receive(&"agent-1".into(), None).await?;

        let response = checkpoint(
            Path("agent-1".to_string()),
            State(service.route_state()),
            Json(CheckpointRequest {
                command_id: command.id.clone(),
                lease_receipt: delivered.lease_receipt.clone(),
                status: data_model::CheckpointStatus::Pending,
                affected_row_count: None,
                lease_extension_secs: Some(60),
                agent_state: Some("page 2".to_string()),
            }),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CHECKPOINT_DELAY_HEADER).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_force_complete_route() -> Result<()> {
        let test_srv = TestService::new().await?;
        let service = &test_srv.service;
        service.feed.register_agent(mock_agent("agent-1")).await?;
        let command = test_srv.export_command();
        service.feed.publish(command.clone(), agent_target()).await?;

        force_complete(
            Path(command.id.to_string()),
            State(service.route_state()),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        let Json(status) = command_status(
            Path(command.id.to_string()),
            State(service.route_state()),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert!(status.is_globally_complete);
        assert!(status.asset_group_statuses[0].force_completed);
        Ok(())
    }
}
