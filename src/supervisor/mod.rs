//! Process supervision subsystem.
//!
//! # Data Flow
//! ```text
//! ConfigCell snapshot
//!     → download.rs (ensure the executable exists)
//!     → process.rs (chmod, spawn, stdin feed, wait for readiness marker)
//!     → Supervisor (track handle + status per role)
//!
//! child exit
//!     → monitor task → Supervisor::on_exit
//!     → Fatal channel (only after readiness, not retired, protection active)
//!
//! restart / update
//!     → protection.rs (suppress) → terminate tracked → [delete binaries]
//!     → start_all → guard restores protection
//! ```
//!
//! # Design Decisions
//! - Tunnel is fully started (or skipped) before the core
//! - No readiness timeout; a silent child blocks its caller
//! - Killed-on-purpose processes are marked retired before the kill
//! - The supervisor never exits the instance itself

pub mod download;
pub mod process;
pub mod protection;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::config::ConfigCell;
use crate::core_config;
use crate::lifecycle::fatal::{Fatal, FatalSender};

pub use download::{Downloader, DownloadError, EnsureOutcome, HttpDownloader};
pub use process::{ExitInfo, ProcessState, Role};
pub use protection::{ExitProtection, SuppressionGuard};

use process::{LaunchSpec, ProcessExit, ProcessHandle, ReadinessMarker};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {role} ({}): {source}", program.display())]
    Spawn {
        role: Role,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{role} exited before it was ready ({exit})")]
    ExitedBeforeReady { role: Role, exit: ExitInfo },

    #[error("{role} monitor stopped unexpectedly")]
    MonitorLost { role: Role },

    #[error("invalid readiness pattern: {0}")]
    Marker(#[from] regex::Error),

    #[error("failed to serialize core config: {0}")]
    Document(#[from] serde_json::Error),
}

/// Observable state of one role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
}

#[derive(Debug, Default)]
struct Slot {
    handle: Option<ProcessHandle>,
    status: ProcessStatus,
}

#[derive(Debug, Default)]
struct Tracked {
    core: Slot,
    tunnel: Slot,
}

impl Tracked {
    fn slot(&mut self, role: Role) -> &mut Slot {
        match role {
            Role::Core => &mut self.core,
            Role::Tunnel => &mut self.tunnel,
        }
    }
}

/// Owns the core and tunnel processes.
pub struct Supervisor {
    config: Arc<ConfigCell>,
    downloader: Arc<dyn Downloader>,
    protection: ExitProtection,
    fatal: FatalSender,
    tracked: Mutex<Tracked>,
    /// Held for a whole restart so two restarts never interleave.
    restarts: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(config: Arc<ConfigCell>, downloader: Arc<dyn Downloader>, fatal: FatalSender) -> Arc<Self> {
        Arc::new(Self {
            config,
            downloader,
            protection: ExitProtection::new(),
            fatal,
            tracked: Mutex::new(Tracked::default()),
            restarts: tokio::sync::Mutex::new(()),
        })
    }

    pub fn protection(&self) -> &ExitProtection {
        &self.protection
    }

    /// Whether a failure right now should end the instance.
    pub fn protection_active(&self) -> bool {
        self.protection.is_active(self.config.load().disable_exit_protect)
    }

    pub fn status(&self, role: Role) -> ProcessStatus {
        self.tracked().slot(role).status.clone()
    }

    pub fn pid(&self, role: Role) -> Option<u32> {
        self.tracked().slot(role).status.pid
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, role: Role, state: ProcessState) {
        let mut tracked = self.tracked();
        let slot = tracked.slot(role);
        slot.status.state = state;
        if slot.handle.is_none() {
            slot.status.pid = None;
        }
    }

    /// Download the executable for `role` if it is missing.
    ///
    /// Failures are logged and reported as `false`; the following start
    /// attempt is what decides whether the instance survives.
    pub async fn ensure_present(&self, role: Role) -> bool {
        let config = self.config.load();
        let path = download::resolve_path(executable_path(role, &config));

        if download::is_present(&path).await {
            tracing::debug!(%role, path = %path.display(), "Executable already present");
            return true;
        }

        self.set_state(role, ProcessState::Downloading);
        match download::ensure_present(&path, role, &config, self.downloader.as_ref()).await {
            Ok(EnsureOutcome::AlreadyPresent) => {
                tracing::debug!(%role, path = %path.display(), "Executable already present");
                true
            }
            Ok(EnsureOutcome::Downloaded { bytes }) => {
                tracing::info!(
                    %role,
                    bytes,
                    "[Initialization] {} Download Success {}",
                    role,
                    download::format_size(bytes)
                );
                true
            }
            Err(err) => {
                tracing::error!(%role, error = %err, "[Initialization] {} Download Failed", role);
                false
            }
        }
    }

    /// Launch the core with a freshly built config document.
    pub async fn start_core(self: &Arc<Self>) -> Result<u32, SupervisorError> {
        let config = self.config.load();
        let program = download::resolve_path(&config.core_path);

        self.set_state(Role::Core, ProcessState::Starting);
        process::make_executable(&program).await;
        tracing::info!("[Initialization] Core chmod Completed");

        let spec = LaunchSpec {
            role: Role::Core,
            program,
            args: process::core_args(),
            stdin: Some(core_config::build_json(&config)?),
            marker: ReadinessMarker::core()?,
        };
        self.launch(spec).await
    }

    /// Launch the tunnel client in token or quick mode.
    pub async fn start_tunnel(self: &Arc<Self>) -> Result<u32, SupervisorError> {
        let config = self.config.load();
        let program = download::resolve_path(&config.cloudflared_path);

        self.set_state(Role::Tunnel, ProcessState::Starting);
        process::make_executable(&program).await;
        tracing::info!("[Initialization] Tunnel chmod Completed");

        let spec = LaunchSpec {
            role: Role::Tunnel,
            program,
            args: process::tunnel_args(&config),
            stdin: None,
            marker: ReadinessMarker::tunnel()?,
        };
        self.launch(spec).await
    }

    async fn launch(self: &Arc<Self>, spec: LaunchSpec) -> Result<u32, SupervisorError> {
        let role = spec.role;

        // At most one live process per role.
        let previous = self.tracked().slot(role).handle.take();
        if let Some(previous) = previous {
            previous.terminate().await;
        }

        let supervisor = Arc::downgrade(self);
        let on_exit = Box::new(move |exit: ProcessExit| {
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.on_exit(exit);
            }
        });

        match process::launch(spec, on_exit).await {
            Ok(handle) => {
                let pid = handle.pid();
                let mut tracked = self.tracked();
                let slot = tracked.slot(role);
                slot.handle = Some(handle);
                slot.status = ProcessStatus {
                    state: ProcessState::Ready,
                    pid: Some(pid),
                };
                Ok(pid)
            }
            Err(err) => {
                self.set_state(role, ProcessState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    fn on_exit(&self, exit: ProcessExit) {
        {
            let mut tracked = self.tracked();
            let slot = tracked.slot(exit.role);
            if slot.status.pid == Some(exit.pid) {
                slot.handle = None;
                slot.status = ProcessStatus {
                    state: ProcessState::Exited(exit.exit),
                    pid: None,
                };
            }
        }

        // Exits before readiness surface as start errors instead.
        if exit.retired || !exit.was_ready {
            return;
        }

        if self.protection_active() {
            tracing::error!(role = %exit.role, pid = exit.pid, "[Main] {} exited unexpectedly", exit.role);
            let _ = self.fatal.send(Fatal::ProcessExited {
                role: exit.role,
                pid: exit.pid,
                exit: exit.exit,
            });
        } else {
            tracing::warn!(
                role = %exit.role,
                pid = exit.pid,
                "[Main] {} exited, exit protection is off",
                exit.role
            );
        }
    }

    /// Full startup sequence: tunnel (when enabled), then core.
    ///
    /// A start failure is returned only while exit-protection is active;
    /// otherwise it is logged and the sequence carries on.
    pub async fn start_all(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let config = self.config.load();

        if config.cloudflared_enabled {
            self.ensure_present(Role::Tunnel).await;
            match self.start_tunnel().await {
                Ok(pid) => tracing::info!(pid, "[Initialization] Tunnel Start Success"),
                Err(err) => self.start_failed(err)?,
            }
        }

        self.ensure_present(Role::Core).await;
        match self.start_core().await {
            Ok(pid) => tracing::info!(pid, "[Initialization] Core Start Success"),
            Err(err) => self.start_failed(err)?,
        }

        Ok(())
    }

    fn start_failed(&self, err: SupervisorError) -> Result<(), SupervisorError> {
        if self.protection_active() {
            tracing::error!(error = %err, "[Initialization] Start Failed");
            return Err(err);
        }
        tracing::warn!(error = %err, "[Initialization] Start Failed, exit protection is off");
        Ok(())
    }

    /// Kill every tracked process and forget its identifier.
    pub async fn terminate_all(&self) {
        let handles: Vec<ProcessHandle> = {
            let mut tracked = self.tracked();
            [Role::Tunnel, Role::Core]
                .into_iter()
                .filter_map(|role| {
                    let slot = tracked.slot(role);
                    slot.status = ProcessStatus::default();
                    slot.handle.take()
                })
                .collect()
        };

        for handle in handles {
            tracing::info!(role = %handle.role(), pid = handle.pid(), "Terminating process");
            handle.terminate().await;
        }
    }

    /// Kill and relaunch both processes without touching the listener.
    ///
    /// With `update`, the executables are deleted first so the relaunch
    /// downloads fresh copies. Exit-protection is suppressed for the whole
    /// operation and restored afterwards, whatever the outcome.
    ///
    /// Restarts queue behind each other; each one owns the processes from
    /// the first kill to the end of its relaunch.
    pub async fn restart(self: &Arc<Self>, update: bool) -> Result<(), SupervisorError> {
        let _serial = self.restarts.lock().await;
        let _guard = self.protection.suppress();
        tracing::info!(update, "[Cluster] Restarting supervised processes");

        self.terminate_all().await;

        if update {
            let config = self.config.load();
            for role in [Role::Core, Role::Tunnel] {
                let path = download::resolve_path(executable_path(role, &config));
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => tracing::info!(%role, path = %path.display(), "Removed executable for update"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        tracing::warn!(%role, path = %path.display(), error = %err, "Failed to remove executable")
                    }
                }
            }
        }

        self.start_all().await
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("protection", &self.protection)
            .field("tracked", &self.tracked.lock().map(|t| (t.core.status.clone(), t.tunnel.status.clone())).ok())
            .finish_non_exhaustive()
    }
}

fn executable_path(role: Role, config: &crate::config::EffectiveConfig) -> &str {
    match role {
        Role::Core => &config.core_path,
        Role::Tunnel => &config.cloudflared_path,
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::EffectiveConfig;
    use crate::lifecycle::fatal;

    const READY_CORE: &str = "#!/bin/sh\ncat > /dev/null\necho '[Warning] core: Xray started'\nexec sleep 30\n";
    const SLOW_CORE: &str =
        "#!/bin/sh\ncat > /dev/null\nsleep 0.4\necho '[Warning] core: Xray started'\nexec sleep 30\n";
    const CRASHING_CORE: &str = "#!/bin/sh\ncat > /dev/null\necho '[Warning] core: Xray started'\nsleep 0.2\nexit 9\n";

    /// Writes a fixed script and records what the supervisor was tracking at
    /// the moment it was asked to download.
    struct ScriptDownloader {
        script: &'static str,
        calls: AtomicUsize,
        supervisor: OnceLock<std::sync::Weak<Supervisor>>,
        pids_at_download: Mutex<Vec<Option<u32>>>,
    }

    impl ScriptDownloader {
        fn new(script: &'static str) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
                supervisor: OnceLock::new(),
                pids_at_download: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Downloader for ScriptDownloader {
        async fn fetch(&self, role: Role, _config: &EffectiveConfig) -> Result<Vec<u8>, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(supervisor) = self.supervisor.get().and_then(|weak| weak.upgrade()) {
                self.pids_at_download.lock().unwrap().push(supervisor.pid(role));
            }
            Ok(self.script.as_bytes().to_vec())
        }
    }

    fn write_script(path: &Path, script: &str) {
        // Renamed into place so a script that is still running is never rewritten.
        let staging = path.with_extension("new");
        std::fs::write(&staging, script).unwrap();
        std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::rename(&staging, path).unwrap();
    }

    fn config_in(dir: &Path) -> EffectiveConfig {
        EffectiveConfig {
            core_path: dir.join("core").display().to_string(),
            cloudflared_path: dir.join("cloudflared").display().to_string(),
            cloudflared_enabled: false,
            ..EffectiveConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_all_downloads_and_starts_core() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(ConfigCell::new(config_in(dir.path())));
        let downloader = ScriptDownloader::new(READY_CORE);
        let (fatal_tx, _fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(cell, downloader.clone(), fatal_tx);

        supervisor.start_all().await.unwrap();

        let status = supervisor.status(Role::Core);
        assert_eq!(status.state, ProcessState::Ready);
        assert!(status.pid.is_some());
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.status(Role::Tunnel), ProcessStatus::default());

        supervisor.terminate_all().await;
        assert_eq!(supervisor.pid(Role::Core), None);
    }

    #[tokio::test]
    async fn test_crash_after_ready_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(ConfigCell::new(config_in(dir.path())));
        write_script(&dir.path().join("core"), CRASHING_CORE);
        let (fatal_tx, mut fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(cell, ScriptDownloader::new(READY_CORE), fatal_tx);

        let pid = supervisor.start_core().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Fatal::ProcessExited {
                role: Role::Core,
                pid,
                exit: ExitInfo { code: Some(9), signal: None },
            }
        );
    }

    #[tokio::test]
    async fn test_crash_with_protection_disabled_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.disable_exit_protect = true;
        write_script(&dir.path().join("core"), CRASHING_CORE);
        let (fatal_tx, mut fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(
            Arc::new(ConfigCell::new(config)),
            ScriptDownloader::new(READY_CORE),
            fatal_tx,
        );

        supervisor.start_core().await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert!(fatal_rx.try_recv().is_err());
        assert!(matches!(supervisor.status(Role::Core).state, ProcessState::Exited(_)));
    }

    #[tokio::test]
    async fn test_start_failure_returned_while_protected() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(ConfigCell::new(config_in(dir.path())));
        write_script(&dir.path().join("core"), "#!/bin/sh\nexit 1\n");
        let (fatal_tx, _fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(cell, ScriptDownloader::new(READY_CORE), fatal_tx);

        let err = supervisor.start_all().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedBeforeReady { role: Role::Core, .. }));
        assert!(matches!(supervisor.status(Role::Core).state, ProcessState::Failed(_)));
    }

    #[tokio::test]
    async fn test_update_clears_pids_before_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(ConfigCell::new(config_in(dir.path())));
        let downloader = ScriptDownloader::new(READY_CORE);
        let (fatal_tx, mut fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(cell, downloader.clone(), fatal_tx);
        let _ = downloader.supervisor.set(Arc::downgrade(&supervisor));

        supervisor.start_all().await.unwrap();
        let first = supervisor.pid(Role::Core).unwrap();

        supervisor.restart(true).await.unwrap();

        let second = supervisor.pid(Role::Core).unwrap();
        assert_ne!(first, second);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*downloader.pids_at_download.lock().unwrap(), vec![None, None]);
        assert!(!supervisor.protection().is_suppressed());
        assert!(fatal_rx.try_recv().is_err());

        supervisor.terminate_all().await;
    }

    #[tokio::test]
    async fn test_overlapping_restarts_restore_protection() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(ConfigCell::new(config_in(dir.path())));
        write_script(&dir.path().join("core"), SLOW_CORE);
        let (fatal_tx, mut fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(cell, ScriptDownloader::new(SLOW_CORE), fatal_tx);

        supervisor.start_all().await.unwrap();

        let first = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.restart(false).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.restart(false).await })
        };
        assert!(supervisor.protection().is_suppressed());

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert!(!supervisor.protection().is_suppressed());
        assert!(supervisor.protection_active());
        assert_eq!(supervisor.status(Role::Core).state, ProcessState::Ready);
        assert!(fatal_rx.try_recv().is_err());

        supervisor.terminate_all().await;
    }

    #[tokio::test]
    async fn test_present_executable_is_not_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(ConfigCell::new(config_in(dir.path())));
        let downloader = ScriptDownloader::new(READY_CORE);
        let (fatal_tx, _fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(cell, downloader.clone(), fatal_tx);

        assert!(supervisor.ensure_present(Role::Core).await);
        assert_eq!(supervisor.status(Role::Core).state, ProcessState::Downloading);

        assert!(supervisor.ensure_present(Role::Core).await);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);

        let idle = Supervisor::new(
            Arc::new(ConfigCell::new(config_in(dir.path()))),
            downloader.clone(),
            fatal::channel().0,
        );
        assert!(idle.ensure_present(Role::Core).await);
        assert_eq!(idle.status(Role::Core).state, ProcessState::Idle);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_relaunch_restores_protection() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(ConfigCell::new(config_in(dir.path())));
        let (fatal_tx, mut fatal_rx) = fatal::channel();
        let supervisor = Supervisor::new(cell, ScriptDownloader::new("#!/bin/sh\nexit 2\n"), fatal_tx);
        write_script(&dir.path().join("core"), READY_CORE);

        supervisor.start_all().await.unwrap();
        // Relaunch will now pick up a core that dies immediately.
        write_script(&dir.path().join("core"), "#!/bin/sh\nexit 2\n");

        supervisor.restart(false).await.unwrap();

        assert!(matches!(supervisor.status(Role::Core).state, ProcessState::Failed(_)));
        assert!(!supervisor.protection().is_suppressed());
        assert!(supervisor.protection_active());
        assert!(fatal_rx.try_recv().is_err());
    }
}
