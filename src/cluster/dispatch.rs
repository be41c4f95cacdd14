//! Turns cluster commands into actions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cluster::link::{ClusterLink, LinkEvent};
use crate::cluster::protocol::{self, ClusterCommand};
use crate::config::{ConfigCell, Resolver};
use crate::supervisor::Supervisor;

/// Receives `push_tasks` payloads.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, tasks: Vec<Value>);
}

/// Acknowledges tasks in the log and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTasks;

#[async_trait]
impl TaskDispatcher for LoggingTasks {
    async fn dispatch(&self, tasks: Vec<Value>) {
        tracing::info!(count = tasks.len(), "[Cluster] Received tasks");
    }
}

/// The single consumer of a link's events.
pub struct Dispatcher {
    resolver: Resolver,
    config: Arc<ConfigCell>,
    supervisor: Arc<Supervisor>,
    link: ClusterLink,
    tasks: Arc<dyn TaskDispatcher>,
}

impl Dispatcher {
    pub fn new(
        resolver: Resolver,
        config: Arc<ConfigCell>,
        supervisor: Arc<Supervisor>,
        link: ClusterLink,
    ) -> Self {
        Self {
            resolver,
            config,
            supervisor,
            link,
            tasks: Arc::new(LoggingTasks),
        }
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn TaskDispatcher>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Handle events until the link task is gone.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        tracing::debug!("Cluster event stream ended");
    }

    pub async fn handle(&self, event: LinkEvent) {
        match event {
            LinkEvent::Open => tracing::debug!("Cluster link open"),
            LinkEvent::Closed => tracing::debug!("Cluster link closed"),
            LinkEvent::Message(command) => self.execute(command).await,
        }
    }

    async fn execute(&self, command: ClusterCommand) {
        match command {
            ClusterCommand::RefreshConfig => {
                let config = self.resolver.resolve().await;
                self.config.replace(config);
                tracing::info!("[Cluster] Configuration refreshed");
            }
            ClusterCommand::GetEnv => {
                let frame = protocol::env_frame(&protocol::env_snapshot());
                if let Err(err) = self.link.send(frame) {
                    tracing::warn!(error = %err, "[Cluster] Failed to reply to get_env");
                }
            }
            ClusterCommand::ProcessRestart => self.restart(false),
            ClusterCommand::ProcessUpdate => self.restart(true),
            ClusterCommand::PushTasks(tasks) => {
                if !self.config.load().cluster_exec_enabled {
                    tracing::warn!(count = tasks.len(), "[Cluster] Ignoring tasks, execution is disabled");
                    return;
                }
                self.tasks.dispatch(tasks).await;
            }
            ClusterCommand::Unknown { kind, .. } => {
                tracing::debug!(kind = %kind, "Ignoring unknown cluster command");
            }
        }
    }

    // Runs beside the event loop; a relaunch can wait on readiness for a
    // long time.
    fn restart(&self, update: bool) {
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            if let Err(err) = supervisor.restart(update).await {
                tracing::error!(update, error = %err, "[Cluster] Restart failed");
            }
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("resolver", &self.resolver)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}
