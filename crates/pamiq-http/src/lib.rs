//! The HTTP control plane: one axum server exposing status reads and
//! pause/resume/shutdown/save-state commands, backed by a bounded queue the
//! control thread drains on its own schedule.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::{Json, Router};
use pamiq_control::{CommandQueue, ControlCommand, ControlPlaneServer, SystemStatusProvider};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tower_http::catch_panic::CatchPanicLayer;

#[derive(Clone)]
struct AppState {
    status: SystemStatusProvider,
    queue: CommandQueue,
}

enum ApiError {
    QueueFull,
    NotFound,
    MethodNotAllowed,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Command queue is full, try again later".to_string(),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not Found".to_string()),
            ApiError::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// `CatchPanicLayer`'s custom panic handler: turns a caught handler panic
/// into the same `{"error": ...}` shape as every other failure response,
/// per the §4.13 "On internal error" row.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "internal error".to_string()
    };
    ApiError::Internal(message).into_response()
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": state.status.status().name() }))
}

fn enqueue(state: &AppState, command: ControlCommand) -> Result<Json<Value>, ApiError> {
    if state.queue.try_push(command) {
        Ok(Json(json!({ "result": "ok" })))
    } else {
        Err(ApiError::QueueFull)
    }
}

async fn pause_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    enqueue(&state, ControlCommand::Pause)
}

async fn resume_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    enqueue(&state, ControlCommand::Resume)
}

async fn shutdown_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    enqueue(&state, ControlCommand::Shutdown)
}

async fn save_state_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    enqueue(&state, ControlCommand::SaveCheckpoint)
}

/// Adds a JSON 405 fallback to a single-method route (axum's default 405
/// has an empty body, which this control plane's clients don't expect).
fn endpoint(method: MethodRouter<AppState>) -> MethodRouter<AppState> {
    method.fallback(method_not_allowed)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", endpoint(get(status_handler)))
        .route("/api/pause", endpoint(axum::routing::post(pause_handler)))
        .route("/api/resume", endpoint(axum::routing::post(resume_handler)))
        .route("/api/shutdown", endpoint(axum::routing::post(shutdown_handler)))
        .route(
            "/api/save-state",
            endpoint(axum::routing::post(save_state_handler)),
        )
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
}

/// A running control-plane server, owned by the control thread. Dropping a
/// handle without calling `shutdown` leaks the background thread; the
/// control thread always calls `shutdown` from `on_finally`.
pub struct HttpControlServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl ControlPlaneServer for HttpControlServer {
    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HttpControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Starts the control plane on its own thread with a dedicated
/// single-threaded tokio runtime, bound to `addr`. Returns once the
/// listener is ready; intended to be passed as `ControlThread`'s
/// `spawn_server` factory.
pub fn spawn(addr: SocketAddr, status: SystemStatusProvider, queue: CommandQueue) -> HttpControlServer {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join_handle = std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(error) => {
                let _ = ready_tx.send(Err(error.to_string()));
                return;
            }
        };
        runtime.block_on(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(error) => {
                    let _ = ready_tx.send(Err(error.to_string()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            let app = router(AppState { status, queue });
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                });
            if let Err(error) = serve.await {
                tracing::error!(%error, "http control plane exited with an error");
            }
        });
    });
    if let Ok(Err(error)) = ready_rx.recv() {
        tracing::error!(%error, "http control plane failed to bind");
    }
    HttpControlServer {
        shutdown_tx: Some(shutdown_tx),
        join_handle: Some(join_handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pamiq_control::ControlThreadConfig;
    use pamiq_threads::{ThreadController, ThreadStatusesMonitor};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn app() -> (Router, CommandQueue) {
        let controller = ThreadController::new();
        let monitor = ThreadStatusesMonitor::new(HashMap::new());
        let status = SystemStatusProvider::new(controller.read_only(), monitor);
        let queue = CommandQueue::new(ControlThreadConfig::default().command_queue_capacity);
        (router(AppState { status, queue: queue.clone() }), queue)
    }

    #[tokio::test]
    async fn status_endpoint_reports_active_by_default() {
        let (app, _queue) = app();
        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (app, _queue) = app();
        let response = app
            .oneshot(Request::get("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_method_on_a_known_path_is_405() {
        let (app, _queue) = app();
        let response = app
            .oneshot(Request::post("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn pause_command_is_enqueued() {
        let (app, queue) = app();
        let response = app
            .oneshot(Request::post("/api/pause").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.drain(), vec![ControlCommand::Pause]);
    }

    #[test]
    fn a_caught_panic_reports_500_with_an_error_body() {
        let response = handle_panic(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn a_full_queue_answers_503() {
        let (app, queue) = app();
        assert!(queue.try_push(ControlCommand::Pause));
        let response = app
            .oneshot(Request::post("/api/resume").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
