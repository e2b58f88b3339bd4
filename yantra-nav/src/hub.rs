//! Wire hub: one TCP port, WebSocket endpoints keyed by path.
//!
//! | path        | direction        | payload                          |
//! |-------------|------------------|----------------------------------|
//! | `/arduino`  | server → client  | remapped telemetry JSON lines    |
//! | `/imu`      | server → client  | phone IMU JSON lines             |
//! | `/camera`   | server → client  | whole JPEG frames (binary)       |
//! | `/flir`     | server → client  | packed thermal frames (binary)   |
//! | `/control`  | client → server  | command JSON, responses echoed   |
//! | `/firmware` | bidirectional    | hex blob in, progress JSON out   |
//!
//! `GET /status` answers a JSON summary; any other non-WebSocket path is
//! a 404 and an unknown WebSocket path is closed with a policy
//! violation. Publish endpoints fan out through broadcast channels; a
//! client is dropped from its endpoint on close or on any send error,
//! and failures never cascade across clients.
//!
//! The server owns a small tokio runtime on a dedicated thread; the rest
//! of the daemon stays on plain threads and publishes into the broadcast
//! senders synchronously.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use crossbeam_channel::Sender;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::status::RuntimeStatus;

/// Broadcast queue depth per endpoint. Slow clients that fall further
/// behind than this skip frames instead of stalling the publisher.
const BROADCAST_DEPTH: usize = 64;

/// Motor command log decimation on `/control`.
const MOTOR_LOG_EVERY: u64 = 20;

/// Outbound payload on a publish endpoint.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// One publish endpoint: broadcast sender plus a live client count.
pub struct Endpoint {
    name: &'static str,
    tx: broadcast::Sender<Frame>,
    clients: AtomicUsize,
}

impl Endpoint {
    fn new(name: &'static str) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_DEPTH);
        Self {
            name,
            tx,
            clients: AtomicUsize::new(0),
        }
    }

    pub fn broadcast_text(&self, text: impl Into<String>) {
        // Send fails only when no client is subscribed; that is fine.
        let _ = self.tx.send(Frame::Text(text.into()));
    }

    pub fn broadcast_binary(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(Frame::Binary(bytes));
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

/// All hub endpoints, shared with the supervisor's fan-out threads.
pub struct Endpoints {
    pub arduino: Endpoint,
    pub imu: Endpoint,
    pub camera: Endpoint,
    pub flir: Endpoint,
    pub firmware: Endpoint,
    /// `/control` has no broadcast side but still reports a client count.
    pub control: Endpoint,
}

impl Endpoints {
    pub(crate) fn new() -> Self {
        Self {
            arduino: Endpoint::new("arduino"),
            imu: Endpoint::new("imu"),
            camera: Endpoint::new("camera"),
            flir: Endpoint::new("flir"),
            firmware: Endpoint::new("firmware"),
            control: Endpoint::new("control"),
        }
    }

    fn all(&self) -> [&Endpoint; 6] {
        [
            &self.arduino,
            &self.imu,
            &self.camera,
            &self.flir,
            &self.firmware,
            &self.control,
        ]
    }
}

/// A `/control` message forwarded to the supervisor, with the reply
/// handle for this client's socket.
pub struct ControlRequest {
    pub payload: Value,
    pub reply: mpsc::UnboundedSender<String>,
}

struct HubState {
    endpoints: Arc<Endpoints>,
    control_tx: Sender<ControlRequest>,
    firmware_tx: Sender<String>,
    status: Arc<RuntimeStatus>,
    motor_messages: AtomicU64,
}

/// Handle to the running hub server.
pub struct WireHub {
    endpoints: Arc<Endpoints>,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl WireHub {
    /// Bind and serve on a dedicated thread.
    pub fn start(
        bind_address: SocketAddr,
        control_tx: Sender<ControlRequest>,
        firmware_tx: Sender<String>,
        status: Arc<RuntimeStatus>,
    ) -> crate::error::Result<Self> {
        let endpoints = Arc::new(Endpoints::new());
        let shutdown = Arc::new(Notify::new());

        let state = Arc::new(HubState {
            endpoints: Arc::clone(&endpoints),
            control_tx,
            firmware_tx,
            status,
            motor_messages: AtomicU64::new(0),
        });

        // Bind synchronously so startup failures surface here.
        let listener = std::net::TcpListener::bind(bind_address)?;
        listener.set_nonblocking(true)?;
        log::info!("wire hub listening on {}", bind_address);

        let shutdown_clone = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("wire-hub".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("wire hub runtime failed to start: {}", e);
                        return;
                    }
                };
                runtime.block_on(async move {
                    let app = router(state);
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(l) => l,
                        Err(e) => {
                            log::error!("wire hub listener conversion failed: {}", e);
                            return;
                        }
                    };
                    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                        shutdown_clone.notified().await;
                    });
                    if let Err(e) = serve.await {
                        log::error!("wire hub server error: {}", e);
                    }
                });
            })
            .map_err(crate::error::NavError::Io)?;

        Ok(Self {
            endpoints,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn endpoints(&self) -> Arc<Endpoints> {
        Arc::clone(&self.endpoints)
    }

    pub fn shutdown(mut self) {
        // notify_one stores a permit, so the signal is not lost even if
        // the server task has not reached its await yet.
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/arduino", get(publish_handler::<0>))
        .route("/imu", get(publish_handler::<1>))
        .route("/camera", get(publish_handler::<2>))
        .route("/flir", get(publish_handler::<3>))
        .route("/firmware", get(firmware_handler))
        .route("/control", get(control_handler))
        .route("/status", get(status_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn publish_endpoint(state: &HubState, index: usize) -> &Endpoint {
    match index {
        0 => &state.endpoints.arduino,
        1 => &state.endpoints.imu,
        2 => &state.endpoints.camera,
        _ => &state.endpoints.flir,
    }
}

/// Server→client endpoints: subscribe the client to the endpoint's
/// broadcast stream until it closes or a send fails.
async fn publish_handler<const INDEX: usize>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let endpoint = publish_endpoint(&state, INDEX);
        run_publish_client(socket, endpoint).await;
    })
}

async fn run_publish_client(mut socket: WebSocket, endpoint: &Endpoint) {
    let mut rx = endpoint.tx.subscribe();
    endpoint.clients.fetch_add(1, Ordering::Relaxed);
    log::info!(
        "/{} client connected ({} total)",
        endpoint.name,
        endpoint.client_count()
    );

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(Frame::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Binary(bytes)) => {
                    if socket.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                // Slow client: drop the missed frames and continue.
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("/{} client lagged {} frames", endpoint.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {} // publish endpoints ignore client chatter
                _ => break,
            },
        }
    }

    endpoint.clients.fetch_sub(1, Ordering::Relaxed);
    log::info!(
        "/{} client disconnected ({} total)",
        endpoint.name,
        endpoint.client_count()
    );
}

/// `/control`: parse each text message as JSON and hand it to the
/// supervisor; responses stream back on this socket.
async fn control_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> Response {
    ws.on_upgrade(move |socket| run_control_client(socket, state))
}

async fn run_control_client(mut socket: WebSocket, state: Arc<HubState>) {
    let endpoint = &state.endpoints.control;
    endpoint.clients.fetch_add(1, Ordering::Relaxed);
    log::info!("/control client connected");

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_control_message(&state, &text, &reply_tx);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary on /control is ignored
                Some(Err(_)) => break,
            },
        }
    }

    endpoint.clients.fetch_sub(1, Ordering::Relaxed);
    log::info!("/control client disconnected");
}

fn handle_control_message(
    state: &Arc<HubState>,
    text: &str,
    reply: &mpsc::UnboundedSender<String>,
) {
    let payload: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("malformed control message dropped: {}", e);
            return;
        }
    };

    // Motor traffic arrives continuously while driving; log a sample.
    if is_motor_command(&payload) {
        let n = state.motor_messages.fetch_add(1, Ordering::Relaxed);
        if n % MOTOR_LOG_EVERY == 0 {
            log::info!("motor command #{}: {}", n + 1, text.trim());
        }
    }

    let _ = state.control_tx.send(ControlRequest {
        payload,
        reply: reply.clone(),
    });
}

/// A motor command is `target:"arduino"` carrying opcode 7, either as an
/// embedded `cmd` string or inline.
fn is_motor_command(payload: &Value) -> bool {
    if payload.get("target").and_then(Value::as_str) != Some("arduino") {
        return false;
    }
    if payload.get("N").and_then(Value::as_u64) == Some(7) {
        return true;
    }
    payload
        .get("cmd")
        .and_then(Value::as_str)
        .and_then(|cmd| serde_json::from_str::<Value>(cmd).ok())
        .and_then(|inner| inner.get("N").and_then(Value::as_u64))
        == Some(7)
}

/// `/firmware`: a text payload is a complete Intel-HEX blob; progress
/// for any running upload is broadcast to every firmware client.
async fn firmware_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> Response {
    ws.on_upgrade(move |socket| run_firmware_client(socket, state))
}

async fn run_firmware_client(mut socket: WebSocket, state: Arc<HubState>) {
    let endpoint = &state.endpoints.firmware;
    let mut rx = endpoint.tx.subscribe();
    endpoint.clients.fetch_add(1, Ordering::Relaxed);
    log::info!("/firmware client connected");

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(Frame::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Binary(_)) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(hex))) => {
                    log::info!("firmware payload received ({} bytes)", hex.len());
                    let _ = state.firmware_tx.send(hex);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    endpoint.clients.fetch_sub(1, Ordering::Relaxed);
    log::info!("/firmware client disconnected");
}

/// `GET /status`.
async fn status_handler(State(state): State<Arc<HubState>>) -> Response {
    let mut endpoints = serde_json::Map::new();
    for endpoint in state.endpoints.all() {
        endpoints.insert(
            endpoint.name.to_string(),
            json!({"clients": endpoint.client_count()}),
        );
    }
    let body = json!({
        "server": "yantra",
        "app_version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.status.uptime_secs(),
        "endpoints": endpoints,
    });
    Json(body).into_response()
}

/// Unknown paths: WebSocket upgrades get a policy-violation close,
/// plain HTTP gets 404.
async fn fallback_handler(ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(upgrade) => upgrade.on_upgrade(|mut socket: WebSocket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "unknown endpoint".into(),
                })))
                .await;
        }),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}
