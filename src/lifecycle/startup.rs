//! Instance startup and run loop.
//!
//! # Responsibilities
//! - Start the status listener and the cluster link
//! - Run the supervisor's startup sequence in the background
//! - Wait for a fatal condition or a stop request, then tear down
//!
//! # Design Decisions
//! - The listener and the link come up before the supervised processes, so
//!   the control plane can reach an instance whose startup is stuck
//! - This loop alone turns a [`Fatal`] into the instance's exit status

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use crate::cluster::{self, ClusterLink, Dispatcher};
use crate::config::{ConfigCell, EffectiveConfig, Resolver};
use crate::http::StatusServer;
use crate::lifecycle::fatal::{self, Fatal, FatalReceiver, FatalSender};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals;
use crate::supervisor::{Downloader, Supervisor};

#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    /// Serve the status listener on the configured port.
    pub listen: bool,
    /// Announced to the cluster server on every connect.
    pub keepalive_url: Option<String>,
}

/// Why [`Instance::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Interrupted,
    Fatal(Fatal),
}

impl Exit {
    pub fn code(&self) -> ExitCode {
        match self {
            Exit::Interrupted => ExitCode::SUCCESS,
            Exit::Fatal(_) => ExitCode::from(1),
        }
    }
}

/// One running proxy-box instance.
pub struct Instance {
    resolver: Resolver,
    config: Arc<ConfigCell>,
    supervisor: Arc<Supervisor>,
    fatal_tx: FatalSender,
    fatal_rx: FatalReceiver,
    shutdown: Shutdown,
    options: InstanceOptions,
}

impl Instance {
    pub fn new(
        resolver: Resolver,
        config: EffectiveConfig,
        downloader: Arc<dyn Downloader>,
        options: InstanceOptions,
    ) -> Self {
        let config = Arc::new(ConfigCell::new(config));
        let (fatal_tx, fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(config.clone(), downloader, fatal_tx.clone());

        Self {
            resolver,
            config,
            supervisor,
            fatal_tx,
            fatal_rx,
            shutdown: Shutdown::new(),
            options,
        }
    }

    pub fn config(&self) -> &Arc<ConfigCell> {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Run until a fatal condition or Ctrl+C / SIGTERM.
    pub async fn run(self) -> Exit {
        self.run_until(signals::wait_for_signal()).await
    }

    /// Run until a fatal condition or until `stop` completes.
    pub async fn run_until<F>(mut self, stop: F) -> Exit
    where
        F: Future<Output = ()>,
    {
        let config = self.config.load();
        tracing::info!(config = %config.redacted(), "[Initialization] Effective configuration");

        if self.options.listen {
            let server = StatusServer::from_config(&config);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(err) = server.run(shutdown).await {
                    tracing::error!(error = %err, "[Main] Status listener failed");
                }
            });
        }

        let link = self.start_cluster(&config);

        let supervisor = self.supervisor.clone();
        let fatal_tx = self.fatal_tx.clone();
        let startup = tokio::spawn(async move {
            if let Err(err) = supervisor.start_all().await {
                let _ = fatal_tx.send(Fatal::StartFailed {
                    reason: err.to_string(),
                });
            }
        });

        tokio::pin!(stop);
        let exit = tokio::select! {
            Some(fatal) = self.fatal_rx.recv() => {
                tracing::error!("[Main] {}", fatal);
                Exit::Fatal(fatal)
            }
            _ = &mut stop => Exit::Interrupted,
        };

        startup.abort();
        if let Some(link) = link {
            link.close();
        }
        self.shutdown.trigger();
        self.supervisor.terminate_all().await;
        tracing::info!("Shutdown complete");

        exit
    }

    fn start_cluster(&self, config: &EffectiveConfig) -> Option<ClusterLink> {
        match cluster::connect(config, self.options.keepalive_url.clone()) {
            Ok(Some((link, events))) => {
                let dispatcher = Dispatcher::new(
                    self.resolver.clone(),
                    self.config.clone(),
                    self.supervisor.clone(),
                    link.clone(),
                );
                tokio::spawn(dispatcher.run(events));
                Some(link)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "[Cluster] Not connecting");
                None
            }
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("supervisor", &self.supervisor)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
