//! HTTP surface over [`PushServer`].
//!
//! Clients create and inspect jobs and follow job event feeds; nodes post
//! protocol messages and read their command stream as server-sent events.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{PushyError, Result};
use crate::node::session::{Disposition, MessageKind, NodeMessage};
use crate::node::NodeView;
use crate::scheduler::{JobId, JobOptions, JobView};
use crate::server::PushServer;

#[derive(Clone)]
pub struct ApiState {
    pub server: Arc<PushServer>,
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    command: String,
    nodes: Vec<String>,
    #[serde(default)]
    quorum: Option<usize>,
    #[serde(default)]
    run_timeout: Option<u64>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateJobResponse {
    id: String,
    uri: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    node_fsm_count: usize,
}

#[derive(Debug, Deserialize)]
struct NodeMessageBody {
    /// Defaults to the server's clock when the node leaves it out.
    #[serde(default)]
    sent_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    kind: MessageKind,
}

#[derive(Debug, Serialize)]
struct NodeMessageResponse {
    disposition: Disposition,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for PushyError {
    fn into_response(self) -> Response {
        let status = match &self {
            PushyError::JobNotFound(_) | PushyError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            PushyError::Validation(_) | PushyError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/_status", get(status_handler))
        .route("/pushy/jobs", get(list_jobs_handler).post(create_job_handler))
        .route("/pushy/jobs/:id", get(get_job_handler))
        .route("/pushy/job_status_feed/:id", get(job_feed_handler))
        .route("/pushy/node_states", get(list_node_states_handler))
        .route("/pushy/node_states/:name", get(node_state_handler))
        .route("/pushy/nodes/:name/messages", post(node_message_handler))
        .route("/pushy/nodes/:name/commands", get(node_commands_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return Err(e.into());
        }
    };
    tracing::info!(addr = %addr, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok",
        node_fsm_count: state.server.online_node_count().await,
    })
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let jobs: Vec<JobView> = state
        .server
        .list_jobs()
        .await
        .iter()
        .map(|job| job.view())
        .collect();
    Json(jobs)
}

async fn create_job_handler(
    State(state): State<ApiState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>)> {
    let options = JobOptions {
        quorum: request.quorum,
        run_timeout: request.run_timeout,
        user: request.user,
    };
    let job_id = state
        .server
        .create_job(&request.command, request.nodes, options)
        .await?;
    let id = job_id.simple().to_string();
    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            uri: format!("/pushy/jobs/{}", id),
            id,
        }),
    ))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobView>> {
    let job = state.server.get_job(job_id).await?;
    Ok(Json(job.view()))
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

async fn job_feed_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, axum::Error>>>> {
    let subscription = state
        .server
        .subscribe_job_events(job_id, last_event_id(&headers))?;
    let stream = subscription.into_stream().map(|event| {
        SseEvent::default()
            .id(event.id.to_string())
            .event(event.name.to_string())
            .json_data(&event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_node_states_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let nodes: Vec<NodeView> = state
        .server
        .list_node_states()
        .await
        .iter()
        .map(|record| record.view())
        .collect();
    Json(nodes)
}

async fn node_state_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<NodeView>> {
    let record = state.server.get_node_state(&name).await?;
    Ok(Json(record.view()))
}

async fn node_message_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<NodeMessageBody>,
) -> impl IntoResponse {
    let sent_at = body.sent_at.unwrap_or_else(|| state.server.clock().now());
    let disposition = state
        .server
        .receive(NodeMessage::new(name, sent_at, body.kind))
        .await;
    Json(NodeMessageResponse { disposition })
}

async fn node_commands_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    state.server.register_node(&name).await;
    let commands = state.server.transport().connect(&name);
    tracing::info!(node = %name, "Node attached to command stream");

    let stream = UnboundedReceiverStream::new(commands).map(|command| {
        let data = serde_json::to_string(&command).unwrap_or_default();
        Ok(SseEvent::default().event("command").data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::scheduler::{AllowAll, CommandWhitelist};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app_with(whitelist: Arc<dyn crate::scheduler::Whitelist>) -> (Router, Arc<PushServer>) {
        let server = Arc::new(PushServer::new(ServerConfig::default(), whitelist).unwrap());
        let app = router(ApiState {
            server: server.clone(),
        });
        (app, server)
    }

    fn app() -> (Router, Arc<PushServer>) {
        app_with(Arc::new(AllowAll))
    }

    async fn body_json(response: Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_status_counts_online_nodes() {
        let (app, server) = app();
        server.heartbeat("DONKEY", None).await;
        server.register_node("FIONA").await;

        let response = app.oneshot(get("/_status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["node_fsm_count"], 1);
    }

    #[tokio::test]
    async fn test_create_job_for_offline_node_fails_quorum() {
        let (app, _server) = app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/pushy/jobs",
                json!({"command": "sleep 1", "nodes": ["DONKEY"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let uri = created["uri"].as_str().unwrap().to_string();

        let job = body_json(app.oneshot(get(&uri)).await.unwrap()).await;
        assert_eq!(job["status"], "quorum_failed");
        assert_eq!(job["nodes"], json!({"unavailable": ["DONKEY"]}));
        assert_eq!(job["run_timeout"], 3600);
    }

    #[tokio::test]
    async fn test_create_job_rejects_empty_node_list() {
        let (app, _server) = app();
        let response = app
            .oneshot(post_json(
                "/pushy/jobs",
                json!({"command": "sleep 1", "nodes": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("at least one node"));
    }

    #[tokio::test]
    async fn test_unknown_job_and_node_are_not_found() {
        let (app, _server) = app();
        let uri = format!("/pushy/jobs/{}", uuid::Uuid::new_v4().simple());
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get("/pushy/node_states/FARQUAD"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heartbeat_message_brings_node_online() {
        let (app, _server) = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/pushy/nodes/DONKEY/messages",
                json!({"type": "heartbeat"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["disposition"], "accepted");

        let state = body_json(
            app.clone()
                .oneshot(get("/pushy/node_states/DONKEY"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(state["status"], "online");
        assert_eq!(state["availability"], "available");

        let all = body_json(app.oneshot(get("/pushy/node_states")).await.unwrap()).await;
        assert_eq!(all.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_message_reported() {
        let (app, server) = app();
        let sent_at = server.clock().now() - chrono::Duration::seconds(1000);
        let response = app
            .oneshot(post_json(
                "/pushy/nodes/DONKEY/messages",
                json!({"type": "heartbeat", "sent_at": sent_at}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["disposition"], "stale");
        assert!(server.get_node_state("DONKEY").await.is_err());
    }

    #[tokio::test]
    async fn test_job_feed_replays_finished_job() {
        let (app, server) = app_with(Arc::new(CommandWhitelist::new().allow("chef-client")));
        let job_id = server
            .create_job("echo nevereverever", vec!["DONKEY".to_string()], JobOptions::default())
            .await
            .unwrap();

        let uri = format!("/pushy/job_status_feed/{}", job_id.simple());
        let response = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let start = text.find("event: start").unwrap();
        let complete = text.find("event: job_complete").unwrap();
        let summary = text.find("event: summary").unwrap();
        assert!(start < complete && complete < summary);
        assert!(text.contains("\"status\":\"quorum_failed\""));
    }

    #[tokio::test]
    async fn test_job_feed_honours_last_event_id() {
        let (app, server) = app_with(Arc::new(CommandWhitelist::new()));
        let job_id = server
            .create_job("sleep 1", vec!["DONKEY".to_string()], JobOptions::default())
            .await
            .unwrap();
        let events: Vec<_> = {
            let mut sub = server.subscribe_job_events(job_id, None).unwrap();
            let mut events = Vec::new();
            while let Some(event) = sub.next().await {
                events.push(event);
            }
            events
        };
        let last_but_one = events[events.len() - 2].id;

        let request = Request::builder()
            .uri(format!("/pushy/job_status_feed/{}", job_id.simple()))
            .header("Last-Event-ID", last_but_one.to_string())
            .body(Body::empty())
            .unwrap();
        let body = app
            .oneshot(request)
            .await
            .unwrap()
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: summary"));
        assert!(!text.contains("event: start"));
        assert!(!text.contains("event: job_complete"));
    }
}
