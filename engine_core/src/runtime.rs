use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::client::VoicevoxClient;
use crate::error::{EngineError, EngineResult};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle of the engine process, as seen by the pipeline.
#[async_trait]
pub trait EngineRuntime: Send + Sync {
    /// Wait until the engine answers, starting it first if this runtime owns it.
    async fn ensure_ready(&self) -> EngineResult<()>;

    /// Base URL the engine listens on.
    fn address(&self) -> &str;

    /// Stop the engine if this runtime started it. No-op otherwise.
    async fn shutdown(&self) -> EngineResult<()>;
}

async fn wait_until_ready(client: &VoicevoxClient, deadline: Instant) -> EngineResult<String> {
    loop {
        match client.version().await {
            Ok(version) => return Ok(version),
            Err(err) if Instant::now() >= deadline => return Err(err),
            Err(_) => sleep(POLL_INTERVAL).await,
        }
    }
}

fn not_ready(client: &VoicevoxClient, wait: Duration) -> EngineError {
    EngineError::Unavailable {
        endpoint: client.base_url().to_string(),
        reason: format!("engine did not become ready within {}s", wait.as_secs()),
    }
}

/// An engine started and stopped by someone else.
pub struct ExternalRuntime {
    client: VoicevoxClient,
    ready_timeout: Duration,
}

impl ExternalRuntime {
    pub fn new(client: VoicevoxClient, ready_timeout: Duration) -> Self {
        Self {
            client,
            ready_timeout,
        }
    }
}

#[async_trait]
impl EngineRuntime for ExternalRuntime {
    async fn ensure_ready(&self) -> EngineResult<()> {
        let deadline = Instant::now() + self.ready_timeout;
        match wait_until_ready(&self.client, deadline).await {
            Ok(version) => {
                info!("Engine at {} is ready (version {})", self.client.base_url(), version);
                Ok(())
            }
            Err(_) => Err(not_ready(&self.client, self.ready_timeout)),
        }
    }

    fn address(&self) -> &str {
        self.client.base_url()
    }

    async fn shutdown(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// An engine executable spawned on demand and terminated on shutdown.
///
/// If something already answers on the configured address, that engine is
/// reused and left running on shutdown.
pub struct ManagedRuntime {
    executable: PathBuf,
    client: VoicevoxClient,
    host: String,
    port: u16,
    cpu_threads: Option<usize>,
    ready_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl ManagedRuntime {
    pub fn new(
        executable: impl Into<PathBuf>,
        client: VoicevoxClient,
        ready_timeout: Duration,
    ) -> EngineResult<Self> {
        let url = reqwest::Url::parse(client.base_url())
            .map_err(|e| EngineError::Runtime(format!("invalid engine URL {}: {e}", client.base_url())))?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Runtime(format!("engine URL {} has no host", client.base_url())))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(50021);
        Ok(Self {
            executable: executable.into(),
            client,
            host,
            port,
            cpu_threads: None,
            ready_timeout,
            child: Mutex::new(None),
        })
    }

    pub fn with_cpu_threads(mut self, threads: usize) -> Self {
        self.cpu_threads = Some(threads);
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(self.port.to_string());
        if let Some(threads) = self.cpu_threads {
            command.arg("--cpu_num_threads").arg(threads.to_string());
        }
        if let Some(dir) = self.executable.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl EngineRuntime for ManagedRuntime {
    async fn ensure_ready(&self) -> EngineResult<()> {
        let mut guard = self.child.lock().await;
        if self.client.version().await.is_ok() {
            return Ok(());
        }
        if guard.is_none() {
            if !self.executable.exists() {
                return Err(EngineError::Runtime(format!(
                    "engine executable not found: {}",
                    self.executable.display()
                )));
            }
            info!("Starting engine {} on {}:{}", self.executable.display(), self.host, self.port);
            let child = self
                .command()
                .spawn()
                .map_err(|e| EngineError::Runtime(format!("failed to start engine: {e}")))?;
            *guard = Some(child);
        }

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if let Some(child) = guard.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    *guard = None;
                    return Err(EngineError::Runtime(format!(
                        "engine exited before becoming ready ({status})"
                    )));
                }
            }
            if self.client.version().await.is_ok() {
                info!("Managed engine is ready at {}", self.client.base_url());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(not_ready(&self.client, self.ready_timeout));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn address(&self) -> &str {
        self.client.base_url()
    }

    async fn shutdown(&self) -> EngineResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        info!("Stopping managed engine");
        child
            .start_kill()
            .map_err(|e| EngineError::Runtime(format!("failed to signal engine: {e}")))?;
        match timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Runtime(format!("failed to reap engine: {e}"))),
            Err(_) => {
                warn!("Engine did not exit within {}s", SHUTDOWN_GRACE.as_secs());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_runtime_parses_host_and_port() {
        let client = VoicevoxClient::new("http://127.0.0.1:50123", Duration::from_secs(1)).unwrap();
        let runtime = ManagedRuntime::new("/opt/voicevox/run", client, Duration::from_secs(1)).unwrap();
        assert_eq!(runtime.host, "127.0.0.1");
        assert_eq!(runtime.port, 50123);
        assert_eq!(runtime.address(), "http://127.0.0.1:50123");
    }

    #[tokio::test]
    async fn test_managed_runtime_missing_executable() {
        // Port 9 (discard) is not an engine; nothing answers /version there.
        let client = VoicevoxClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let runtime =
            ManagedRuntime::new("/nonexistent/voicevox/run", client, Duration::from_millis(200)).unwrap();
        let err = runtime.ensure_ready().await.unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)));
        runtime.shutdown().await.unwrap();
    }
}
