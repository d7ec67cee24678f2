//! Short-lived bridge sessions to the platform API
//!
//! Each session is a local bridge process (by default `kubectl proxy`) bound to
//! its own port. Opening a session:
//!
//! 1. claims a pseudo-random free port from the configured range
//! 2. launches the bridge on it
//! 3. dials the port until the bridge answers, a bounded number of times
//!
//! Any failure terminates the bridge and releases the port before the whole
//! sequence is retried. Cancellation unwinds the same way.
//!
//! The [`PortRegistry`] is owned by its [`SessionManager`]; two managers never
//! share reservations.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::{KubeError, Result};

/// An open bridge session
#[derive(Debug, PartialEq, Eq)]
pub struct Session {
    port: u16,
}

impl Session {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL of the platform API behind the bridge
    pub fn url(&self) -> String {
        format!("http://{}:{}", Ipv4Addr::LOCALHOST, self.port)
    }
}

/// A running bridge process
#[async_trait]
pub trait BridgeProcess: Send {
    /// Ask the bridge to stop and wait up to `grace` for it to exit
    async fn terminate(&mut self, grace: Duration) -> Result<()>;

    /// Diagnostic output if the bridge has already exited
    async fn exit_diagnostic(&mut self) -> Option<String>;
}

/// Starts bridge processes
#[async_trait]
pub trait BridgeLauncher: Send + Sync {
    async fn launch(&self, port: u16) -> Result<Box<dyn BridgeProcess>>;
}

enum Slot {
    Claimed,
    Running(Box<dyn BridgeProcess>),
}

/// Ports held by sessions, each either claimed or running a bridge
#[derive(Default)]
pub struct PortRegistry {
    slots: Mutex<HashMap<u16, Slot>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u16, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `port` unless someone already holds it
    pub fn try_claim(&self, port: u16) -> bool {
        match self.slots().entry(port) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Slot::Claimed);
                true
            }
        }
    }

    /// Free `port`; a bridge still attached to it is dropped
    pub fn release(&self, port: u16) -> bool {
        self.slots().remove(&port).is_some()
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.slots().contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Held ports in ascending order
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.slots().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    fn attach(&self, port: u16, process: Box<dyn BridgeProcess>) {
        self.slots().insert(port, Slot::Running(process));
    }

    /// Take the bridge off `port`, leaving the port claimed
    fn detach(&self, port: u16) -> Option<Box<dyn BridgeProcess>> {
        let mut slots = self.slots();
        let slot = slots.get_mut(&port)?;
        match std::mem::replace(slot, Slot::Claimed) {
            Slot::Running(process) => Some(process),
            Slot::Claimed => None,
        }
    }
}

/// Releases a claimed port when dropped, unless kept
struct Claim<'a> {
    registry: &'a PortRegistry,
    port: u16,
    kept: bool,
}

impl Claim<'_> {
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.registry.release(self.port);
        }
    }
}

/// Opens and closes bridge sessions
pub struct SessionManager<L> {
    launcher: L,
    config: SessionConfig,
    registry: PortRegistry,
}

impl<L: BridgeLauncher> SessionManager<L> {
    pub fn new(launcher: L, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            launcher,
            config,
            registry: PortRegistry::new(),
        })
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    /// Open a session, retrying the whole sequence on failure
    pub async fn open(&self, cancel: &CancellationToken) -> Result<Session> {
        let attempts = self.config.open_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(KubeError::Cancelled);
            }
            match self.try_open(cancel).await {
                Ok(session) => {
                    tracing::info!(port = session.port, attempt, "Session opened");
                    return Ok(session);
                }
                Err(e @ KubeError::Cancelled) => return Err(e),
                // Missing kubeconfig contexts or binaries do not come back on retry
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "Failed to open session");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(KubeError::Cancelled),
                    _ = tokio::time::sleep(self.config.open_backoff) => {}
                }
            }
        }

        Err(KubeError::Session(format!(
            "no session after {} attempts: {}",
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Stop the session's bridge; the port is released even if that fails
    pub async fn close(&self, session: Session) -> Result<()> {
        if !self.registry.is_claimed(session.port) {
            return Err(KubeError::Session(format!(
                "no session on port {}",
                session.port
            )));
        }
        let result = self.stop(session.port).await;
        match &result {
            Ok(()) => tracing::info!(port = session.port, "Session closed"),
            Err(e) => tracing::warn!(port = session.port, error = %e, "Bridge did not stop cleanly"),
        }
        result
    }

    /// Close every open session
    pub async fn shutdown(&self) {
        for port in self.registry.ports() {
            if let Err(e) = self.stop(port).await {
                tracing::warn!(port, error = %e, "Bridge did not stop cleanly");
            }
        }
    }

    async fn try_open(&self, cancel: &CancellationToken) -> Result<Session> {
        let claim = self.claim_port()?;
        let port = claim.port;

        let mut process = tokio::select! {
            _ = cancel.cancelled() => return Err(KubeError::Cancelled),
            launched = self.launcher.launch(port) => launched?,
        };
        tracing::debug!(port, "Bridge started");

        match self.wait_ready(port, process.as_mut(), cancel).await {
            Ok(()) => {
                self.registry.attach(port, process);
                claim.keep();
                Ok(Session { port })
            }
            Err(e) => {
                if let Err(stop_error) = process.terminate(self.config.termination_grace).await {
                    tracing::warn!(port, error = %stop_error, "Bridge did not stop cleanly");
                }
                Err(e)
            }
        }
    }

    fn claim_port(&self) -> Result<Claim<'_>> {
        let ports = self.config.ports;
        let offset = rand::rng().random_range(0..ports.len());
        (0..ports.len())
            .filter_map(|i| ports.nth_wrapping(offset + i))
            .find(|port| self.registry.try_claim(*port))
            .map(|port| Claim {
                registry: &self.registry,
                port,
                kept: false,
            })
            .ok_or_else(|| {
                KubeError::Session(format!("no free port in {}-{}", ports.start, ports.end))
            })
    }

    async fn wait_ready(
        &self,
        port: u16,
        process: &mut dyn BridgeProcess,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for attempt in 1..=self.config.dial_attempts {
            let dialed = tokio::select! {
                _ = cancel.cancelled() => return Err(KubeError::Cancelled),
                dialed = TcpStream::connect((Ipv4Addr::LOCALHOST, port)) => dialed,
            };
            match dialed {
                Ok(_) => return Ok(()),
                Err(e) => tracing::trace!(port, attempt, error = %e, "Bridge not answering yet"),
            }

            if let Some(diagnostic) = process.exit_diagnostic().await {
                return Err(KubeError::classify_diagnostic(
                    &format!("bridge on port {}", port),
                    "bridge dependency",
                    diagnostic.trim(),
                    &diagnostic,
                ));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(KubeError::Cancelled),
                _ = tokio::time::sleep(self.config.dial_interval) => {}
            }
        }

        Err(KubeError::Session(format!(
            "bridge on port {} did not answer after {} attempts",
            port, self.config.dial_attempts
        )))
    }

    async fn stop(&self, port: u16) -> Result<()> {
        let result = match self.registry.detach(port) {
            Some(mut process) => process.terminate(self.config.termination_grace).await,
            None => Ok(()),
        };
        self.registry.release(port);
        result
    }
}

/// Launches `kubectl proxy` bound to the loopback interface
pub struct KubectlProxyLauncher {
    kubectl: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl KubectlProxyLauncher {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            kubectl: config.kubectl_path.clone(),
            kubeconfig: config.kubeconfig.clone(),
        }
    }
}

#[async_trait]
impl BridgeLauncher for KubectlProxyLauncher {
    async fn launch(&self, port: u16) -> Result<Box<dyn BridgeProcess>> {
        let mut command = Command::new(&self.kubectl);
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        command
            .arg("proxy")
            .arg(format!("--port={}", port))
            .arg("--address=127.0.0.1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KubeError::not_found("executable", self.kubectl.display().to_string())
            } else {
                KubeError::command(format!("kubectl proxy --port={}", port), e.to_string())
            }
        })?;
        tracing::debug!(port, pid = ?child.id(), "Started kubectl proxy");
        Ok(Box::new(KubectlProxy { child, port }))
    }
}

struct KubectlProxy {
    child: Child,
    port: u16,
}

#[async_trait]
impl BridgeProcess for KubectlProxy {
    /// SIGTERM, wait out `grace`, then SIGKILL
    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        if request_stop(&self.child) {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => {
                    status?;
                    return Ok(());
                }
                Err(_) => {
                    tracing::warn!(
                        port = self.port,
                        ?grace,
                        "kubectl proxy ignored SIGTERM, killing"
                    );
                }
            }
        }
        self.child.start_kill()?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status?;
                Ok(())
            }
            Err(_) => Err(KubeError::Session(format!(
                "kubectl proxy on port {} did not exit after SIGKILL",
                self.port
            ))),
        }
    }

    async fn exit_diagnostic(&mut self) -> Option<String> {
        let status = self.child.try_wait().ok()??;
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take()
            && let Err(e) = pipe.read_to_string(&mut stderr).await
        {
            tracing::debug!(port = self.port, error = %e, "Could not read kubectl proxy stderr");
        }
        Some(if stderr.trim().is_empty() {
            format!("kubectl proxy exited with {}", status)
        } else {
            stderr
        })
    }
}

/// Ask the bridge to exit; false when no signal could be delivered
#[cfg(unix)]
fn request_stop(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, error = %e, "SIGTERM not delivered");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    #[derive(Clone, Copy)]
    enum Behavior {
        Listen,
        Silent,
        Crash,
    }

    struct FakeLauncher {
        behavior: Behavior,
        launched: Arc<AtomicUsize>,
        terminated: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                launched: Arc::new(AtomicUsize::new(0)),
                terminated: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct FakeBridge {
        task: Option<JoinHandle<()>>,
        diagnostic: Option<String>,
        terminated: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BridgeLauncher for FakeLauncher {
        async fn launch(&self, port: u16) -> Result<Box<dyn BridgeProcess>> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            let mut bridge = FakeBridge {
                task: None,
                diagnostic: None,
                terminated: self.terminated.clone(),
            };
            match self.behavior {
                Behavior::Listen => {
                    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
                    bridge.task = Some(tokio::spawn(async move {
                        while listener.accept().await.is_ok() {}
                    }));
                }
                Behavior::Silent => {}
                Behavior::Crash => {
                    bridge.diagnostic = Some("error: context \"prod\" not found\n".to_string());
                }
            }
            Ok(Box::new(bridge))
        }
    }

    #[async_trait]
    impl BridgeProcess for FakeBridge {
        async fn terminate(&mut self, _grace: Duration) -> Result<()> {
            if let Some(task) = self.task.take() {
                task.abort();
                let _ = task.await;
            }
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn exit_diagnostic(&mut self) -> Option<String> {
            self.diagnostic.clone()
        }
    }

    fn config(start: u16, end: u16) -> SessionConfig {
        SessionConfig {
            ports: PortRange::new(start, end),
            dial_attempts: 3,
            dial_interval: Duration::from_millis(5),
            open_attempts: 2,
            open_backoff: Duration::from_millis(5),
            termination_grace: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_registry_claim_is_exclusive() {
        let registry = PortRegistry::new();
        assert!(registry.try_claim(50001));
        assert!(!registry.try_claim(50001));
        assert!(registry.is_claimed(50001));
        assert!(registry.release(50001));
        assert!(!registry.release(50001));
        assert!(registry.try_claim(50001));
        assert_eq!(registry.ports(), vec![50001]);
    }

    #[tokio::test]
    async fn test_concurrent_opens_get_distinct_ports() {
        let manager =
            SessionManager::new(FakeLauncher::new(Behavior::Listen), config(42100, 42199)).unwrap();
        let cancel = CancellationToken::new();

        let opened = futures::future::join_all((0..8).map(|_| manager.open(&cancel))).await;
        let sessions: Vec<Session> = opened.into_iter().map(|s| s.unwrap()).collect();
        let ports: HashSet<u16> = sessions.iter().map(Session::port).collect();
        assert_eq!(ports.len(), 8);
        assert_eq!(manager.registry().len(), 8);

        let mut sessions = sessions.into_iter();
        let first = sessions.next().unwrap();
        let port = first.port();
        manager.close(first).await.unwrap();
        assert!(!manager.registry().is_claimed(port));
        assert_eq!(manager.registry().len(), 7);

        manager.shutdown().await;
        assert!(manager.registry().is_empty());
        assert_eq!(manager.launcher.terminated.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_closed_port_is_reused() {
        let mut settings = config(42300, 42300);
        settings.open_attempts = 1;
        let manager = SessionManager::new(FakeLauncher::new(Behavior::Listen), settings).unwrap();
        let cancel = CancellationToken::new();

        let session = manager.open(&cancel).await.unwrap();
        assert_eq!(session.port(), 42300);
        assert_eq!(session.url(), "http://127.0.0.1:42300");

        let err = manager.open(&cancel).await.unwrap_err();
        assert!(matches!(err, KubeError::Session(_)));

        manager.close(session).await.unwrap();
        let session = manager.open(&cancel).await.unwrap();
        assert_eq!(session.port(), 42300);
        manager.close(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_bridge_is_stopped_and_released() {
        let manager =
            SessionManager::new(FakeLauncher::new(Behavior::Silent), config(42400, 42409)).unwrap();

        let err = manager.open(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KubeError::Session(_)));
        assert!(manager.registry().is_empty());
        assert_eq!(manager.launcher.launched.load(Ordering::SeqCst), 2);
        assert_eq!(manager.launcher.terminated.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_crashed_bridge_is_classified_without_retry() {
        let manager =
            SessionManager::new(FakeLauncher::new(Behavior::Crash), config(42500, 42509)).unwrap();

        let err = manager.open(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.registry().is_empty());
        assert_eq!(manager.launcher.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_open() {
        let manager =
            SessionManager::new(FakeLauncher::new(Behavior::Listen), config(42600, 42609)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager.open(&cancel).await.unwrap_err();
        assert!(matches!(err, KubeError::Cancelled));
        assert!(manager.registry().is_empty());
        assert_eq!(manager.launcher.launched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_dialing_unwinds() {
        let mut settings = config(42700, 42709);
        settings.dial_attempts = 10_000;
        settings.dial_interval = Duration::from_millis(10);
        let manager = SessionManager::new(FakeLauncher::new(Behavior::Silent), settings).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = manager.open(&cancel).await.unwrap_err();
        assert!(matches!(err, KubeError::Cancelled));
        assert!(manager.registry().is_empty());
        assert_eq!(manager.launcher.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let manager =
            SessionManager::new(FakeLauncher::new(Behavior::Listen), config(42800, 42809)).unwrap();
        let err = manager.close(Session { port: 42800 }).await.unwrap_err();
        assert!(matches!(err, KubeError::Session(_)));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = SessionManager::new(FakeLauncher::new(Behavior::Listen), config(10, 9));
        assert!(matches!(result, Err(KubeError::InvalidConfig(_))));
    }

    /// Shell stand-in for `kubectl proxy`, returned once its TERM trap is set
    #[cfg(unix)]
    async fn shell_bridge(on_term: &str) -> KubectlProxy {
        use tokio::io::AsyncBufReadExt;

        let script = format!("trap {} TERM; echo ready; sleep 30 & wait", on_term);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut line = String::new();
        tokio::io::BufReader::new(stdout)
            .read_line(&mut line)
            .await
            .unwrap();
        assert_eq!(line.trim(), "ready");
        KubectlProxy { child, port: 0 }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_asks_politely_first() {
        let mut bridge = shell_bridge("'exit 7'").await;
        bridge.terminate(Duration::from_secs(5)).await.unwrap();
        let status = bridge.child.try_wait().unwrap().unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        use std::os::unix::process::ExitStatusExt;

        let mut bridge = shell_bridge("''").await;
        bridge.terminate(Duration::from_millis(200)).await.unwrap();
        let status = bridge.child.try_wait().unwrap().unwrap();
        assert_eq!(status.signal(), Some(9));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_diagnostic_reads_stderr() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("echo 'error: context \"lab\" not found' >&2; exit 1")
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        child.wait().await.unwrap();
        let mut bridge = KubectlProxy { child, port: 0 };
        let diagnostic = bridge.exit_diagnostic().await.unwrap();
        assert!(diagnostic.contains("not found"));
    }
}
