//! Persistent WebSocket link to the cluster server.
//!
//! # Responsibilities
//! - Connect, announce liveness (and the keep-alive URL when known)
//! - Turn inbound frames into [`LinkEvent`]s
//! - Reconnect after any drop until closed locally

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::cluster::protocol::{self, ClusterCommand};
use crate::cluster::reconnect::{Decision, Reconnector, DEFAULT_RECONNECT_DELAY};
use crate::cluster::LinkError;

/// What the socket task reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Open,
    Message(ClusterCommand),
    /// Follows an `Open`; failed connect attempts are not reported.
    Closed,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub endpoint: Url,
    /// Announced once per connection as `keepalive_url`.
    pub keepalive_url: Option<String>,
    pub reconnect_delay: Duration,
}

impl LinkOptions {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            keepalive_url: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_keepalive_url(mut self, url: Option<String>) -> Self {
        self.keepalive_url = url;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

#[derive(Debug)]
enum Control {
    Send(String),
    Close,
}

/// Handle to the running link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClusterLink {
    control: mpsc::UnboundedSender<Control>,
}

impl ClusterLink {
    /// Spawn the socket task and return its handle and event stream.
    pub fn connect(options: LinkOptions) -> (ClusterLink, mpsc::UnboundedReceiver<LinkEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = LinkTask {
            reconnector: Reconnector::new(options.reconnect_delay),
            options,
            control: control_rx,
            events: events_tx,
        };
        tokio::spawn(task.run());

        (ClusterLink { control: control_tx }, events_rx)
    }

    /// Queue a text frame. Frames sent while disconnected are dropped.
    pub fn send(&self, frame: String) -> Result<(), LinkError> {
        self.control
            .send(Control::Send(frame))
            .map_err(|_| LinkError::Closed)
    }

    /// Close the socket and stop reconnecting.
    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

enum SessionEnd {
    /// The connection never got as far as [`LinkEvent::Open`].
    Unreachable,
    /// An open connection went away.
    Dropped,
    /// `close()` was called (or every handle is gone).
    UserClosed,
}

struct LinkTask {
    options: LinkOptions,
    reconnector: Reconnector,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkTask {
    async fn run(mut self) {
        loop {
            match self.session().await {
                SessionEnd::UserClosed => {
                    self.reconnector.close();
                    tracing::info!("[Cluster] Connection closed");
                    return;
                }
                SessionEnd::Dropped => {
                    tracing::info!("[Cluster] Server closed");
                    let _ = self.events.send(LinkEvent::Closed);
                }
                SessionEnd::Unreachable => {}
            }

            let at = match self.reconnector.on_closed(tokio::time::Instant::now()) {
                Decision::Schedule(at) => at,
                Decision::AlreadyPending => match self.reconnector.pending() {
                    Some(at) => at,
                    None => continue,
                },
                Decision::Stopped => return,
            };
            tracing::info!(
                delay_secs = self.options.reconnect_delay.as_secs_f64(),
                "[Cluster] Reconnecting"
            );

            if !self.wait_until(at).await {
                self.reconnector.close();
                tracing::info!("[Cluster] Reconnect cancelled");
                return;
            }
            if !self.reconnector.fire() {
                return;
            }
        }
    }

    /// Sleep until the reconnect is due. `false` if closed meanwhile.
    async fn wait_until(&mut self, at: tokio::time::Instant) -> bool {
        let timer = tokio::time::sleep_until(at);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return true,
                control = self.control.recv() => match control {
                    Some(Control::Send(_)) => tracing::debug!("Dropping frame while disconnected"),
                    Some(Control::Close) | None => return false,
                },
            }
        }
    }

    async fn session(&mut self) -> SessionEnd {
        let endpoint = self.options.endpoint.as_str().to_string();
        tracing::debug!(url = %endpoint, "Connecting to cluster server");

        let connect = connect_async(endpoint);
        tokio::pin!(connect);
        let stream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok((stream, _response)) => break stream,
                    Err(err) => {
                        tracing::warn!(error = %err, "[Cluster] Connection failed");
                        return SessionEnd::Unreachable;
                    }
                },
                control = self.control.recv() => match control {
                    Some(Control::Send(_)) => tracing::debug!("Dropping frame while connecting"),
                    Some(Control::Close) | None => return SessionEnd::UserClosed,
                },
            }
        };

        let (mut sink, mut source) = stream.split();

        tracing::info!("[Cluster] Server connected");
        if let Err(err) = sink.send(WsMessage::Text(protocol::PING_FRAME.into())).await {
            tracing::warn!(error = %err, "[Cluster] Failed to send ping");
            return SessionEnd::Unreachable;
        }
        if let Some(url) = &self.options.keepalive_url {
            if let Err(err) = sink.send(WsMessage::Text(protocol::keepalive_frame(url).into())).await {
                tracing::warn!(error = %err, "[Cluster] Failed to announce keep-alive url");
                return SessionEnd::Unreachable;
            }
        }
        let _ = self.events.send(LinkEvent::Open);

        loop {
            tokio::select! {
                message = source.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => self.deliver(text.as_str()),
                    Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.deliver(text),
                        Err(_) => tracing::debug!("Dropping non-UTF-8 frame"),
                    },
                    // tungstenite queues the pong for pings on its own
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "[Cluster] Socket error");
                        return SessionEnd::Dropped;
                    }
                },
                control = self.control.recv() => match control {
                    Some(Control::Send(frame)) => {
                        if let Err(err) = sink.send(WsMessage::Text(frame.into())).await {
                            tracing::warn!(error = %err, "[Cluster] Send failed");
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(Control::Close) | None => {
                        let _ = sink.close().await;
                        return SessionEnd::UserClosed;
                    }
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        match protocol::parse_frame(text) {
            Some(command) => {
                let _ = self.events.send(LinkEvent::Message(command));
            }
            None => tracing::debug!(len = text.len(), "Dropping malformed frame"),
        }
    }
}
