//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use proxy_box::config::EffectiveConfig;
use proxy_box::supervisor::{DownloadError, Downloader, Role};

/// What the mock config endpoint saw.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRequest {
    pub uuid: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Clone)]
struct ConfigState {
    status: StatusCode,
    body: Value,
    requests: Arc<Mutex<Vec<ConfigRequest>>>,
}

/// Start a cluster server that answers `GET /config` with `body`.
#[allow(dead_code)]
pub async fn start_mock_config_server(
    addr: SocketAddr,
    status: StatusCode,
    body: Value,
) -> Arc<Mutex<Vec<ConfigRequest>>> {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = ConfigState {
        status,
        body,
        requests: requests.clone(),
    };

    let app = Router::new()
        .route("/config", get(config_handler))
        .with_state(state);
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    requests
}

async fn config_handler(
    State(state): State<ConfigState>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.requests.lock().unwrap().push(ConfigRequest {
        uuid: query.get("uuid").cloned(),
        authorization: headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    });
    (state.status, Json(state.body.clone()))
}

/// Things a test can make the mock socket server do.
#[derive(Debug, Clone)]
pub enum ServerAction {
    Send(String),
    Close,
}

/// A WebSocket server standing in for the cluster `/connection` endpoint.
#[allow(dead_code)]
pub struct MockSocketServer {
    pub connections: Arc<AtomicUsize>,
    pub paths: Arc<Mutex<Vec<String>>>,
    pub frames: mpsc::UnboundedReceiver<String>,
    actions: broadcast::Sender<ServerAction>,
}

#[allow(dead_code)]
impl MockSocketServer {
    pub async fn start(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (actions, _) = broadcast::channel(16);

        let server = Self {
            connections: connections.clone(),
            paths: paths.clone(),
            frames,
            actions: actions.clone(),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let paths = paths.clone();
                let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    let target = request
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_default();
                    paths.lock().unwrap().push(target);
                    Ok(response)
                };
                let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };
                connections.fetch_add(1, Ordering::SeqCst);

                let frames_tx = frames_tx.clone();
                let mut actions = actions.subscribe();
                tokio::spawn(async move {
                    let (mut sink, mut source) = socket.split();
                    loop {
                        tokio::select! {
                            message = source.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = frames_tx.send(text.as_str().to_string());
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            action = actions.recv() => match action {
                                Ok(ServerAction::Send(frame)) => {
                                    if sink.send(Message::Text(frame.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(ServerAction::Close) | Err(_) => {
                                    let _ = sink.close().await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        server
    }

    pub fn send(&self, frame: &str) {
        let _ = self.actions.send(ServerAction::Send(frame.to_string()));
    }

    /// Drop every open connection from the server side.
    pub fn close_all(&self) {
        let _ = self.actions.send(ServerAction::Close);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn next_frame(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("no frame within 5s")
            .expect("frame channel closed")
    }

    /// Wait until at least `count` connections have been accepted.
    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.connection_count() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("connection not established within 5s");
    }
}

/// Hands out a fixed shell script as the downloaded executable.
#[allow(dead_code)]
pub struct ScriptDownloader {
    pub script: &'static str,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptDownloader {
    pub fn new(script: &'static str) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Downloader for ScriptDownloader {
    async fn fetch(&self, _role: Role, _config: &EffectiveConfig) -> Result<Vec<u8>, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.as_bytes().to_vec())
    }
}

/// Core stand-in: swallows its config, reports ready, then idles.
#[allow(dead_code)]
pub const READY_CORE: &str = "#!/bin/sh\ncat > /dev/null\necho '[Warning] core: Xray 1.8.0 started'\nexec sleep 30\n";

/// Core stand-in that crashes shortly after reporting ready.
#[allow(dead_code)]
pub const CRASHING_CORE: &str =
    "#!/bin/sh\ncat > /dev/null\necho '[Warning] core: Xray 1.8.0 started'\nsleep 0.3\nexit 5\n";
