use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use postsync_api::PostSyncApi;
use postsync_core::{Channel, UpsertOutcome, INTEGRITY_ERROR_MESSAGE, STORED_MESSAGE};
use serde::Serialize;
use tracing::info;

mod channel;
mod logging;

use logging::LogFormat;

#[derive(Debug, Clone)]
struct ServiceState {
    api: PostSyncApi,
}

#[derive(Debug, Clone, Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: String,
}

#[derive(Debug, Parser)]
#[command(name = "postsync-service")]
#[command(about = "Fetches upstream posts into SQLite and serves echo websockets")]
struct Args {
    #[arg(long, default_value = "./database.db")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { error: message.into() }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/fetch-data", get(fetch_data))
        .route(Channel::Ping.path(), get(ws_ping))
        .route(Channel::Echo.path(), get(ws_echo))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_format);

    let api = PostSyncApi::new(args.db.clone());
    api.initialize()?;

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %listener.local_addr()?, db = %args.db.display(), "postsync service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

fn outcome_response(outcome: UpsertOutcome) -> Result<Json<MessageResponse>, ServiceError> {
    match outcome {
        UpsertOutcome::Success(_) => Ok(Json(MessageResponse { message: STORED_MESSAGE })),
        UpsertOutcome::ConstraintViolation { .. } => {
            Ok(Json(MessageResponse { message: INTEGRITY_ERROR_MESSAGE }))
        }
        UpsertOutcome::OtherError { detail } => Err(ServiceState::error(detail)),
    }
}

async fn fetch_data(
    State(state): State<ServiceState>,
) -> Result<Json<MessageResponse>, ServiceError> {
    let api = state.api.clone();
    let outcome = tokio::task::spawn_blocking(move || api.fetch_and_store())
        .await
        .map_err(|err| ServiceState::error(format!("fetch task failed: {err}")))?;
    outcome_response(outcome)
}

async fn ws_ping(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| channel::run_channel(socket, Channel::Ping))
}

async fn ws_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| channel::run_channel(socket, Channel::Echo))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use axum::body::to_bytes;
    use futures_util::{SinkExt, StreamExt};
    use http::Request;
    use postsync_core::{Post, SyncError};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("postsync-service-{}.db", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    fn state_with_posts(db_path: PathBuf, posts: Vec<Post>) -> ServiceState {
        let source = move || -> Result<Vec<Post>, SyncError> { Ok(posts.clone()) };
        let api = PostSyncApi::with_source(db_path, Arc::new(source));
        if let Err(err) = api.initialize() {
            panic!("failed to initialize schema: {err:#}");
        }
        ServiceState { api }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn get_fetch_data(router: Router) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri("/fetch-data")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn spawn_server(state: ServiceState) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app(state)).await;
        });
        Ok(addr)
    }

    async fn connect(addr: SocketAddr, channel: Channel) -> Result<ClientSocket> {
        let (socket, _) = connect_async(format!("ws://{addr}{}", channel.path())).await?;
        Ok(socket)
    }

    async fn round_trip(socket: &mut ClientSocket, text: &str) -> Result<String> {
        socket.send(WsMessage::Text(text.to_string())).await?;
        match socket.next().await {
            Some(Ok(WsMessage::Text(reply))) => Ok(reply),
            other => Err(anyhow::anyhow!("expected text reply, got {other:?}")),
        }
    }

    fn idle_state() -> ServiceState {
        let source = || -> Result<Vec<Post>, SyncError> { Ok(Vec::new()) };
        ServiceState { api: PostSyncApi::with_source(unique_temp_db_path(), Arc::new(source)) }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn fetch_data_stores_posts_and_reports_success() -> Result<()> {
        let db_path = unique_temp_db_path();
        let state = state_with_posts(
            db_path.clone(),
            vec![Post::new("first", "one"), Post::new("second", "two")],
        );
        let api = state.api.clone();

        let response = get_fetch_data(app(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value, serde_json::json!({ "message": "Data stored successfully!" }));

        let records = api.list_records()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].title, "second");
        assert_eq!(records[1].body, "two");

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn fetch_data_reports_integrity_error_with_ok_status() -> Result<()> {
        let db_path = unique_temp_db_path();
        let state = state_with_posts(
            db_path.clone(),
            vec![Post::new("fine", "body"), Post::new("poison", "body")],
        );
        {
            let conn = rusqlite::Connection::open(&db_path)?;
            conn.execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON data
                 WHEN NEW.title = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poison title rejected'); END;",
            )?;
        }
        let api = state.api.clone();

        let response = get_fetch_data(app(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value,
            serde_json::json!({ "message": "IntegrityError occurred while storing data" })
        );
        assert!(api.list_records()?.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn fetch_data_upstream_failure_is_a_server_error() {
        let db_path = unique_temp_db_path();
        let source = || -> Result<Vec<Post>, SyncError> {
            Err(SyncError::Decode("expected a sequence".to_string()))
        };
        let api = PostSyncApi::with_source(db_path.clone(), Arc::new(source));
        let state = ServiceState { api };

        let response = get_fetch_data(app(state)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value = response_json(response).await;
        assert_eq!(
            value.get("error").and_then(serde_json::Value::as_str),
            Some("decode error: expected a sequence")
        );

        cleanup(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn fetch_data_twice_is_idempotent() -> Result<()> {
        let db_path = unique_temp_db_path();
        let state =
            state_with_posts(db_path.clone(), vec![Post::new("A", "b1"), Post::new("A", "b2")]);
        let api = state.api.clone();
        let router = app(state);

        for _ in 0..2 {
            let response = get_fetch_data(router.clone()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let records = api.list_records()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, "b2");

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn ping_channel_prefixes_each_message() -> Result<()> {
        let addr = spawn_server(idle_state()).await?;
        let mut socket = connect(addr, Channel::Ping).await?;

        assert_eq!(round_trip(&mut socket, "x").await?, "Pong! You sent: x");
        assert_eq!(round_trip(&mut socket, "second").await?, "Pong! You sent: second");

        socket.close(None).await?;
        Ok(())
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn echo_channel_returns_text_unchanged() -> Result<()> {
        let addr = spawn_server(idle_state()).await?;
        let mut socket = connect(addr, Channel::Echo).await?;

        assert_eq!(round_trip(&mut socket, "hello").await?, "hello");
        assert_eq!(round_trip(&mut socket, "").await?, "");

        socket.close(None).await?;
        Ok(())
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn channel_ignores_binary_frames() -> Result<()> {
        let addr = spawn_server(idle_state()).await?;
        let mut socket = connect(addr, Channel::Echo).await?;

        socket.send(WsMessage::Binary(vec![1, 2, 3])).await?;
        assert_eq!(round_trip(&mut socket, "after binary").await?, "after binary");

        socket.close(None).await?;
        Ok(())
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn server_accepts_new_connections_after_disconnect() -> Result<()> {
        let addr = spawn_server(idle_state()).await?;

        let mut first = connect(addr, Channel::Ping).await?;
        assert_eq!(round_trip(&mut first, "one").await?, "Pong! You sent: one");
        first.close(None).await?;
        drop(first);

        let mut abrupt = connect(addr, Channel::Echo).await?;
        assert_eq!(round_trip(&mut abrupt, "two").await?, "two");
        drop(abrupt);

        let mut second = connect(addr, Channel::Echo).await?;
        assert_eq!(round_trip(&mut second, "three").await?, "three");
        second.close(None).await?;
        Ok(())
    }
}
