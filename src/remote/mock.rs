//! Recording [`RemoteExecutor`] for tests.
//!
//! Every call is recorded. By default a session answers like a tiny shell:
//! `echo X` prints `X`, and `[ -d P ] && echo X` / `[ -f P ] && echo X` print
//! `X` when `P` exists among the mock's remote files. Scripted responses,
//! unreachable devices and failing transfers can be configured per test.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{CommandOutput, Device, RemoteExecutor, RemoteTaskHandle};
use crate::error::{AppResult, FleetError};

/// How a recorded call reached the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// [`RemoteExecutor::run`](super::RemoteExecutor::run)
    Run,
    /// [`RemoteExecutor::spawn`](super::RemoteExecutor::spawn)
    Spawn,
    /// [`RemoteExecutor::fetch`](super::RemoteExecutor::fetch)
    Fetch,
}

/// One recorded executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Executor entry point used
    pub kind: CallKind,
    /// Identity of the target device
    pub device: String,
    /// Commands for run/spawn, the remote path for fetch
    pub commands: Vec<String>,
}

#[derive(Debug, Default)]
struct Responder {
    pattern: String,
    device: Option<String>,
    output: CommandOutput,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    unreachable: HashSet<String>,
    responders: Vec<Responder>,
    /// (device, remote path) -> contents
    files: BTreeMap<(String, String), Vec<u8>>,
    failing_fetches: HashSet<String>,
}

/// Cloneable handle to shared mock state.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    state: Arc<Mutex<MockState>>,
}

impl MockExecutor {
    /// Empty mock on which every device answers.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded calls.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every call to `identity` fails as unreachable.
    pub fn set_unreachable(&self, identity: &str) {
        self.lock().unreachable.insert(identity.to_string());
    }

    /// Answer any session containing `pattern` with `output`.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.lock().responders.push(Responder {
            pattern: pattern.to_string(),
            device: None,
            output,
        });
    }

    /// Like [`respond`](Self::respond), only for sessions on `identity`.
    pub fn respond_on(&self, identity: &str, pattern: &str, output: CommandOutput) {
        self.lock().responders.push(Responder {
            pattern: pattern.to_string(),
            device: Some(identity.to_string()),
            output,
        });
    }

    /// Place a file on a device, relative to its working directory.
    pub fn add_remote_file(&self, identity: &str, path: &str, contents: &[u8]) {
        self.lock()
            .files
            .insert((identity.to_string(), path.to_string()), contents.to_vec());
    }

    /// Every fetch from `identity` fails.
    pub fn fail_fetches_from(&self, identity: &str) {
        self.lock().failing_fetches.insert(identity.to_string());
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Calls made to `identity`.
    pub fn calls_to(&self, identity: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.device == identity)
            .cloned()
            .collect()
    }

    /// Number of run/spawn calls on any device with a command containing `needle`.
    pub fn count_commands(&self, needle: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind != CallKind::Fetch)
            .filter(|c| c.commands.iter().any(|cmd| cmd.contains(needle)))
            .count()
    }

    fn record(&self, kind: CallKind, device: &Device, commands: Vec<String>) {
        self.lock().calls.push(RecordedCall {
            kind,
            device: device.identity.clone(),
            commands,
        });
    }

    fn answer(&self, device: &Device, commands: &[String]) -> AppResult<CommandOutput> {
        let state = self.lock();
        if state.unreachable.contains(&device.identity) {
            return Err(FleetError::connectivity(
                device.identity.clone(),
                "connection refused",
            ));
        }

        let scripted = state.responders.iter().find(|r| {
            r.device.as_ref().map_or(true, |d| *d == device.identity)
                && commands.iter().any(|c| c.contains(&r.pattern))
        });
        if let Some(responder) = scripted {
            return Ok(responder.output.clone());
        }

        let mut stdout = String::new();
        for command in commands {
            if let Some(line) = emulate(&state, &device.identity, command) {
                stdout.push_str(&line);
                stdout.push('\n');
            }
        }
        Ok(CommandOutput::ok(&stdout))
    }
}

fn exists(state: &MockState, device: &str, path: &str, directory: bool) -> bool {
    state.files.keys().any(|(d, p)| {
        d == device
            && if directory {
                p.starts_with(&format!("{}/", path.trim_end_matches('/')))
            } else {
                p == path
            }
    })
}

fn emulate(state: &MockState, device: &str, command: &str) -> Option<String> {
    let command = command.trim().trim_end_matches(';').trim();
    if let Some(text) = command.strip_prefix("echo ") {
        return Some(text.trim().to_string());
    }
    for (flag, directory) in [("[ -d ", true), ("[ -f ", false)] {
        if let Some(rest) = command.strip_prefix(flag) {
            let (path, tail) = rest.split_once(" ]")?;
            let token = tail.trim().strip_prefix("&& echo ")?;
            return exists(state, device, path.trim(), directory).then(|| token.trim().to_string());
        }
    }
    None
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run(&self, device: &Device, commands: &[String]) -> AppResult<CommandOutput> {
        self.record(CallKind::Run, device, commands.to_vec());
        self.answer(device, commands)
    }

    fn spawn(&self, device: &Device, commands: &[String]) -> AppResult<RemoteTaskHandle> {
        self.record(CallKind::Spawn, device, commands.to_vec());
        let result = self.answer(device, commands);
        let task = tokio::spawn(async move { result });
        Ok(RemoteTaskHandle::new(device.clone(), task))
    }

    async fn fetch(&self, device: &Device, remote_path: &str, local_dir: &Path) -> AppResult<()> {
        self.record(CallKind::Fetch, device, vec![remote_path.to_string()]);

        let matches: Vec<(PathBuf, Vec<u8>)> = {
            let state = self.lock();
            if state.unreachable.contains(&device.identity)
                || state.failing_fetches.contains(&device.identity)
            {
                return Err(FleetError::transfer(
                    device.identity.clone(),
                    "lost connection",
                ));
            }
            let remote_path = remote_path.trim_end_matches('/');
            let base = Path::new(remote_path)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_default();
            state
                .files
                .iter()
                .filter(|((d, _), _)| *d == device.identity)
                .filter_map(|((_, p), contents)| {
                    if p == remote_path {
                        Some((base.clone(), contents.clone()))
                    } else {
                        p.strip_prefix(&format!("{}/", remote_path))
                            .map(|rest| (base.join(rest), contents.clone()))
                    }
                })
                .collect()
        };

        if matches.is_empty() {
            return Err(FleetError::transfer(
                device.identity.clone(),
                format!("{}: No such file or directory", remote_path),
            ));
        }
        for (relative, contents) in matches {
            let target = local_dir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, contents).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_recovery::RetryPolicy;
    use std::time::Duration;

    fn rpi() -> Device {
        Device::new("rpi1", "10.8.1.41")
    }

    #[tokio::test]
    async fn probe_succeeds_through_echo_emulation() {
        let mock = MockExecutor::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        mock.probe(&rpi(), &policy).await.unwrap();
        assert_eq!(mock.calls_to("rpi1").len(), 1);
    }

    #[tokio::test]
    async fn unreachable_device_exhausts_probe_attempts() {
        let mock = MockExecutor::new();
        mock.set_unreachable("rpi1");
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let err = mock.probe(&rpi(), &policy).await.unwrap_err();
        assert!(matches!(err, FleetError::Connectivity { .. }));
        assert_eq!(mock.calls_to("rpi1").len(), 3);
    }

    #[tokio::test]
    async fn scripted_response_wins() {
        let mock = MockExecutor::new();
        mock.respond_on("rpi1", "pair.sh", CommandOutput::failed(1, "no tester"));
        let out = mock.run(&rpi(), &["./pair.sh AA".to_string()]).await.unwrap();
        assert!(!out.success());
        let other = Device::new("rpi2", "10.8.1.42");
        let out = mock.run(&other, &["./pair.sh AA".to_string()]).await.unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn directory_test_consults_remote_files() {
        let mock = MockExecutor::new();
        mock.add_remote_file("rpi1", "Outputs/run/log.txt", b"x");
        let out = mock
            .run(&rpi(), &["[ -d Outputs/run ] && echo yes".to_string()])
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "yes");
        let out = mock
            .run(&rpi(), &["[ -d Outputs/other ] && echo yes".to_string()])
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "");
    }

    #[tokio::test]
    async fn fetch_copies_directory_under_its_basename() {
        let mock = MockExecutor::new();
        mock.add_remote_file("rpi1", "Outputs/run/a/b.txt", b"hello");
        let dir = tempfile::tempdir().unwrap();
        mock.fetch(&rpi(), "Outputs/run", dir.path()).await.unwrap();
        let copied = std::fs::read_to_string(dir.path().join("run/a/b.txt")).unwrap();
        assert_eq!(copied, "hello");
    }

    #[tokio::test]
    async fn fetch_of_missing_path_is_a_transfer_error() {
        let mock = MockExecutor::new();
        let dir = tempfile::tempdir().unwrap();
        let err = mock.fetch(&rpi(), "nothing", dir.path()).await.unwrap_err();
        assert!(matches!(err, FleetError::Transfer { .. }));
    }

    #[tokio::test]
    async fn spawned_session_reports_unreachable_on_wait() {
        let mock = MockExecutor::new();
        mock.set_unreachable("rpi1");
        let handle = mock.spawn(&rpi(), &["python client.py".to_string()]).unwrap();
        assert!(handle.wait().await.is_err());
        assert_eq!(mock.count_commands("client.py"), 1);
    }
}
