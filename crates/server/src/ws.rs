//! WebSocket endpoint and HTTP routes.

use crate::protocol::{error_frame, ClientCommand, StartConfig};
use crate::session::{SessionManager, SessionOptions};
use crate::Hub;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub manager: Arc<SessionManager>,
}

/// Build the full router: the WebSocket session endpoint plus health and
/// catalog probes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api", get(api_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for `GET /health` - liveness probe.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "clients": state.hub.client_count(),
    }))
}

/// Handler for `GET /api` - project catalog.
async fn api_handler() -> impl IntoResponse {
    Json(json!({
        "name": "distlab simulation API",
        "version": env!("CARGO_PKG_VERSION"),
        "projects": distlab_projects::PROJECT_IDS,
    }))
}

/// Handler for `GET /ws` - upgrade to the session channel.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

/// One connected observer: a write pump draining the hub queue and a read
/// loop dispatching commands. Endpoint I/O failures close this observer's
/// subscription without disturbing the simulation.
async fn client_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (client_id, mut rx) = state.hub.register();

    // Write pump: coalesce queued frames into one newline-separated text
    // message, like the reference server does under load.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = coalesce_pending(frame, &mut rx);
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&state, client_id, &text),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // binary/ping/pong ignored
        }
    }

    state.hub.unregister(client_id);
    writer.abort();
}

/// Parse and dispatch one inbound frame. Failures answer an `error` frame
/// to the originating client only; the session continues.
fn handle_frame(state: &AppState, client_id: u64, text: &str) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(client = client_id, error = %e, "malformed frame");
            send_error(state, client_id, "parse_error", &e.to_string());
            return;
        }
    };

    match command {
        ClientCommand::StartSimulation {
            project,
            scenario,
            config,
        } => {
            let scenario = scenario.unwrap_or_default();
            debug!(client = client_id, project, scenario, "start_simulation");
            if let Err(e) = state
                .manager
                .start(&project, &scenario, options_from(config))
            {
                warn!(error = %e, "simulation start failed");
                send_error(state, client_id, "start_error", &e.to_string());
            }
        }
        ClientCommand::PauseSimulation => state.manager.pause(),
        ClientCommand::ResumeSimulation => state.manager.resume(),
        ClientCommand::StopSimulation => state.manager.stop(),
        ClientCommand::StepForward => state.manager.step(),
        ClientCommand::SetSpeed { speed } => state.manager.set_speed(speed),
        ClientCommand::InjectCrash { node_id } => {
            if let Err(e) = state.manager.crash_node(&node_id.as_str().into()) {
                send_error(state, client_id, "crash_error", &e.to_string());
            }
        }
        ClientCommand::RecoverNode { node_id } => {
            if let Err(e) = state.manager.recover_node(&node_id.as_str().into()) {
                send_error(state, client_id, "recover_error", &e.to_string());
            }
        }
        ClientCommand::InjectPartition {
            from,
            to,
            bidirectional,
        } => state
            .manager
            .inject_partition(&from.as_str().into(), &to.as_str().into(), bidirectional),
        ClientCommand::HealPartition {
            from,
            to,
            bidirectional,
        } => state
            .manager
            .heal_partition(&from.as_str().into(), &to.as_str().into(), bidirectional),
        ClientCommand::GetState => {
            let frame = state.manager.get_state();
            if let Ok(text) = serde_json::to_string(&frame) {
                state.hub.send_to(client_id, text);
            }
        }
    }
}

/// Append every frame already queued, newline-separated, so one socket
/// write can carry a burst. Consumers split on newlines.
fn coalesce_pending(first: String, rx: &mut tokio::sync::mpsc::Receiver<String>) -> String {
    let mut text = first;
    while let Ok(next) = rx.try_recv() {
        text.push('\n');
        text.push_str(&next);
    }
    text
}

fn options_from(config: StartConfig) -> SessionOptions {
    SessionOptions {
        node_count: config.node_count,
        speed: config.speed,
        step_mode: config.step_mode,
        seed: None,
    }
}

fn send_error(state: &AppState, client_id: u64, code: &str, message: &str) {
    if let Ok(text) = serde_json::to_string(&error_frame(code, message)) {
        state.hub.send_to(client_id, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let hub = Arc::new(Hub::new());
        let manager = crate::session::SessionManager::new(
            Arc::clone(&hub) as Arc<dyn crate::session::Broadcaster>
        );
        AppState { hub, manager }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let router = create_router(test_state());
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["clients"], json!(0));
    }

    #[tokio::test]
    async fn test_api_route_lists_projects() {
        let router = create_router(test_state());
        let response = router
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let projects = body["projects"].as_array().unwrap();
        assert!(projects.contains(&json!("two-generals")));
        assert!(projects.contains(&json!("byzantine")));
    }

    #[tokio::test]
    async fn test_coalesced_frames_split_back_into_objects() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        tx.try_send(r#"{"type":"b"}"#.to_string()).unwrap();
        tx.try_send(r#"{"type":"c"}"#.to_string()).unwrap();

        let text = coalesce_pending(r#"{"type":"a"}"#.to_string(), &mut rx);
        let types: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(types.len(), 3);
        assert_eq!(types[0]["type"], json!("a"));
        assert_eq!(types[2]["type"], json!("c"));
    }

    #[tokio::test]
    async fn test_handle_frame_reports_parse_errors() {
        let state = test_state();
        let (client, mut rx) = state.hub.register();
        handle_frame(&state, client, "{not json");
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], json!("error"));
        assert_eq!(frame["code"], json!("parse_error"));
    }

    #[tokio::test]
    async fn test_handle_frame_get_state_answers_caller() {
        let state = test_state();
        let (client, mut rx) = state.hub.register();
        handle_frame(&state, client, r#"{"type":"get_state"}"#);
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], json!("simulation_state"));
        assert_eq!(frame["running"], json!(false));
    }
}
