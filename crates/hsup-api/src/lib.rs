//! Local control API over a unix-domain socket.
//!
//! Three endpoints: `GET /health` for liveness probing of stale socket
//! files, `GET /status` for a per-type process report, and
//! `POST /control/stop` to retire processes by type. The API taps the
//! release-generation channel so it always reports the current generation.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::info;

use hsup_core::{DynoInput, Processes};

/// Mode of the control socket once bound.
const SOCKET_PERM: u32 = 0o770;

/// Budget for probing a possibly-stale socket.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Control API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Another live supervisor already owns the socket.
    #[error("socket in use")]
    SocketInUse,

    #[error("control API server: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for control API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Per-process entry in the status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "ProcessID")]
    pub process_id: u32,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

/// `GET /status` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "Processes")]
    pub processes: BTreeMap<String, ProcessStatus>,
}

/// `POST /control/stop` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(rename = "Processes")]
    pub processes: Vec<String>,
}

/// `POST /control/stop` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    #[serde(rename = "StoppedProcesses")]
    pub stopped_processes: Vec<String>,
}

struct ApiState {
    current: RwLock<Option<Arc<Processes>>>,
}

/// The control API server.
pub struct ControlApi {
    socket: PathBuf,
    state: Arc<ApiState>,
}

impl ControlApi {
    /// Creates an API bound (later) to `socket`.
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            state: Arc::new(ApiState {
                current: RwLock::new(None),
            }),
        }
    }

    /// Taps the generation channel: every generation is recorded for
    /// status reporting and forwarded to the returned channel.
    #[must_use]
    pub fn tee(&self, mut procs: mpsc::Receiver<Arc<Processes>>) -> mpsc::Receiver<Arc<Processes>> {
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(p) = procs.recv().await {
                *state.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&p));
                if tx.send(p).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    /// Binds the socket and serves until the process exits.
    ///
    /// When the path is already in use, a live owner (one that answers
    /// `/health`) wins and this call fails; a dead one's stale socket file
    /// is removed and the bind retried.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::SocketInUse`] for a live owner, or the
    /// underlying bind/accept error.
    pub async fn listen(&self) -> Result<()> {
        let listener = match UnixListener::bind(&self.socket) {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                if self.ping().await.is_ok() {
                    return Err(ApiError::SocketInUse);
                }
                std::fs::remove_file(&self.socket)?;
                UnixListener::bind(&self.socket)?
            }
            Err(e) => return Err(e.into()),
        };

        std::fs::set_permissions(&self.socket, std::fs::Permissions::from_mode(SOCKET_PERM))?;
        info!("control API listening on {}", self.socket.display());

        let app = self.router().layer(TraceLayer::new_for_http());
        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| ApiError::Server(e.to_string()))?;

            let tower_service = app.clone();
            tokio::spawn(async move {
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .await
                {
                    let err_str = err.to_string().to_lowercase();
                    if !err_str.contains("shutting down") && !err_str.contains("connection reset") {
                        tracing::error!("error serving control connection: {err}");
                    }
                }
            });
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/control/stop", post(handle_stop))
            .with_state(Arc::clone(&self.state))
    }

    /// Asks whichever process owns the socket whether it is alive.
    async fn ping(&self) -> Result<()> {
        let probe = async {
            let stream = UnixStream::connect(&self.socket).await?;
            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| ApiError::Server(e.to_string()))?;
            tokio::spawn(conn);

            let request = hyper::Request::builder()
                .uri("/health")
                .header(hyper::header::HOST, "hsup")
                .body(Empty::<Bytes>::new())
                .map_err(|e| ApiError::Server(e.to_string()))?;
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ApiError::Server(e.to_string()))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(ApiError::Server(format!(
                    "health probe answered {}",
                    response.status()
                )))
            }
        };

        tokio::time::timeout(PING_TIMEOUT, probe)
            .await
            .map_err(|_| ApiError::Server("health probe timed out".to_string()))?
    }
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let mut processes = BTreeMap::new();
    let current = state
        .current
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    if let Some(procs) = current {
        for ex in procs.executors() {
            let (ip_address, port) = {
                let slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
                (
                    slots.ip_address.clone().unwrap_or_default(),
                    slots.port.unwrap_or_default(),
                )
            };
            processes.insert(
                ex.process_type.clone(),
                ProcessStatus {
                    status: ex.state().to_string(),
                    process_id: ex.process_id,
                    ip_address,
                    port,
                },
            );
        }
    }

    Json(StatusResponse { processes })
}

async fn handle_stop(
    State(state): State<Arc<ApiState>>,
    Json(stop): Json<StopRequest>,
) -> Json<StopResponse> {
    let current = state
        .current
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let mut stopped = Vec::new();
    if let Some(procs) = current {
        for requested in &stop.processes {
            for ex in procs.executors() {
                if &ex.process_type == requested {
                    info!("retiring {requested}");
                    ex.trigger(DynoInput::Retire).await;
                    stopped.push(requested.clone());
                }
            }
        }
    }

    Json(StopResponse {
        stopped_processes: stopped,
    })
}
