//! Remote command execution on fleet devices.
//!
//! [`RemoteExecutor`] is the seam between the orchestrator and the devices it
//! drives. It offers two ways to run an ordered list of shell commands inside
//! the device's working directory and prepared environment:
//!
//! - [`RemoteExecutor::run`] blocks until the session ends and returns the
//!   captured output. A non-zero remote exit is *reported*, not raised, so the
//!   caller decides whether it matters.
//! - [`RemoteExecutor::spawn`] returns a [`RemoteTaskHandle`] at once and lets
//!   the session run as a detached task. It is used whenever several devices
//!   must act concurrently (worker start, power sampling), since one device's
//!   setup must never delay another's.
//!
//! An unreachable device surfaces as [`FleetError::Connectivity`].
//!
//! [`ssh::SshExecutor`] is the production backend; [`mock::MockExecutor`]
//! records calls for tests.

pub mod mock;
pub mod ssh;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{AppResult, FleetError};
use crate::error_recovery::{with_retry, RetryPolicy};

pub use mock::MockExecutor;
pub use ssh::{SshExecutor, SshSettings};

/// Network identity of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Login identity (also used as the device's name in logs)
    pub identity: String,
    /// Host name or IP address
    pub address: String,
}

impl Device {
    /// Device logged into as `identity` at `address`.
    pub fn new(identity: &str, address: &str) -> Self {
        Self {
            identity: identity.to_string(),
            address: address.to_string(),
        }
    }

    /// `identity@address`
    pub fn login(&self) -> String {
        format!("{}@{}", self.identity, self.address)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.address)
    }
}

/// Captured result of one remote session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit status of the session
    pub exit_code: i32,
}

impl CommandOutput {
    /// A zero-exit output carrying `stdout`.
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }

    /// Whether the session exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Fresh token used to recognise our own output among login banners.
pub fn probe_token() -> String {
    format!("probe-{}", uuid::Uuid::new_v4().simple())
}

/// Per-device remote execution capability.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `commands` in one session and wait for it to end.
    async fn run(&self, device: &Device, commands: &[String]) -> AppResult<CommandOutput>;

    /// Start `commands` in one session without waiting for it.
    fn spawn(&self, device: &Device, commands: &[String]) -> AppResult<RemoteTaskHandle>;

    /// Recursively copy `remote_path` (relative to the working directory) into `local_dir`.
    async fn fetch(&self, device: &Device, remote_path: &str, local_dir: &Path) -> AppResult<()>;

    /// Check that the device answers, retrying per `policy`.
    async fn probe(&self, device: &Device, policy: &RetryPolicy) -> AppResult<()> {
        let what = format!("liveness probe of {}", device);
        with_retry(policy, &what, move |_| async move {
            let token = probe_token();
            let output = self.run(device, &[format!("echo {}", token)]).await?;
            if output.stdout.contains(&token) {
                Ok(())
            } else {
                Err(FleetError::connectivity(
                    device.identity.clone(),
                    "probe token not echoed",
                ))
            }
        })
        .await
    }
}

/// Handle to a detached remote session.
pub struct RemoteTaskHandle {
    device: Device,
    task: JoinHandle<AppResult<CommandOutput>>,
}

impl RemoteTaskHandle {
    /// Handle over a session already running on `device`.
    pub fn new(device: Device, task: JoinHandle<AppResult<CommandOutput>>) -> Self {
        Self { device, task }
    }

    /// Device the session runs on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether the local side of the session has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Re-probe the device for a process whose command line matches `pattern`.
    pub async fn still_running(
        &self,
        executor: &dyn RemoteExecutor,
        pattern: &str,
    ) -> AppResult<bool> {
        let token = probe_token();
        let output = executor
            .run(
                &self.device,
                &[format!("pgrep -f '{}' > /dev/null && echo {}", pattern, token)],
            )
            .await?;
        Ok(output.stdout.contains(&token))
    }

    /// Wait for the session to end.
    pub async fn wait(self) -> AppResult<CommandOutput> {
        let device = self.device.identity.clone();
        self.task
            .await
            .map_err(|err| FleetError::connectivity(device, format!("session task failed: {}", err)))?
    }

    /// Drop the local session task.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl fmt::Debug for RemoteTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTaskHandle")
            .field("device", &self.device)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
