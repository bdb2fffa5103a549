//! `ssh`/`scp` backed [`RemoteExecutor`].
//!
//! Argument vectors are built by pure functions so they can be tested without
//! spawning anything; [`SshExecutor`] hands them to `tokio::process`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, Device, RemoteExecutor, RemoteTaskHandle};
use crate::error::{AppResult, FleetError};

/// Exit status `ssh` itself reports when the connection could not be made.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Session settings shared by every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Working directory every session starts in
    pub workdir: String,
    /// Environment preparation run before the commands
    pub env_setup: String,
    /// SSH port when not the default
    pub port: Option<u16>,
    /// Private key passed with `-i`
    pub identity_file: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    /// Passed as `ConnectTimeout`
    pub connect_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            workdir: "~/Energy-FL".to_string(),
            env_setup: "source venv/bin/activate".to_string(),
            port: None,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

fn connection_options(settings: &SshSettings, port_flag: &str) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", settings.connect_timeout.as_secs().max(1)),
    ];
    if let Some(port) = settings.port {
        args.push(port_flag.to_string());
        args.push(port.to_string());
    }
    if let Some(key) = &settings.identity_file {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    args
}

/// The shell line run remotely: enter the working directory, prepare the
/// environment, then run `commands` in order. The session exits after the
/// last command.
pub fn session_script(settings: &SshSettings, commands: &[String]) -> String {
    let mut script = format!("cd {}", settings.workdir);
    if !settings.env_setup.is_empty() {
        script.push_str(" && ");
        script.push_str(&settings.env_setup);
    }
    if !commands.is_empty() {
        script.push_str(" && { ");
        script.push_str(&commands.join("; "));
        script.push_str("; }");
    }
    script
}

/// Arguments for `ssh` running `commands` on `device`.
pub fn build_ssh_args(settings: &SshSettings, device: &Device, commands: &[String]) -> Vec<String> {
    let mut args = connection_options(settings, "-p");
    args.push(device.login());
    args.push(session_script(settings, commands));
    args
}

/// `remote_path` resolved against the working directory, in the form `scp`
/// expects (home-relative paths lose their `~/`).
pub fn remote_path_in_workdir(settings: &SshSettings, remote_path: &str) -> String {
    let workdir = settings.workdir.trim_end_matches('/');
    let joined = if remote_path.starts_with('/') {
        remote_path.to_string()
    } else {
        format!("{}/{}", workdir, remote_path)
    };
    joined
        .strip_prefix("~/")
        .map(str::to_string)
        .unwrap_or(joined)
}

/// Arguments for a recursive `scp` of `remote_path` into `local_dir`.
pub fn build_scp_args(
    settings: &SshSettings,
    device: &Device,
    remote_path: &str,
    local_dir: &Path,
) -> Vec<String> {
    let mut args = vec!["-r".to_string()];
    args.extend(connection_options(settings, "-P"));
    args.push(format!(
        "{}:{}",
        device.login(),
        remote_path_in_workdir(settings, remote_path)
    ));
    args.push(local_dir.display().to_string());
    args
}

/// Production executor spawning the system `ssh` and `scp` clients.
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    settings: SshSettings,
}

impl SshExecutor {
    /// Executor using `settings` for every session.
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    /// Settings applied to every session.
    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }
}

async fn run_ssh(settings: SshSettings, device: Device, commands: Vec<String>) -> AppResult<CommandOutput> {
    let args = build_ssh_args(&settings, &device, &commands);
    debug!(device = %device, "ssh {}", args.join(" "));

    let output = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| FleetError::connectivity(device.identity.clone(), format!("cannot start ssh: {}", err)))?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if exit_code == SSH_CONNECTION_FAILURE {
        return Err(FleetError::connectivity(device.identity, stderr.trim().to_string()));
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr,
        exit_code,
    })
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, device: &Device, commands: &[String]) -> AppResult<CommandOutput> {
        run_ssh(self.settings.clone(), device.clone(), commands.to_vec()).await
    }

    fn spawn(&self, device: &Device, commands: &[String]) -> AppResult<RemoteTaskHandle> {
        let task = tokio::spawn(run_ssh(
            self.settings.clone(),
            device.clone(),
            commands.to_vec(),
        ));
        Ok(RemoteTaskHandle::new(device.clone(), task))
    }

    async fn fetch(&self, device: &Device, remote_path: &str, local_dir: &Path) -> AppResult<()> {
        tokio::fs::create_dir_all(local_dir).await?;
        let args = build_scp_args(&self.settings, device, remote_path, local_dir);
        debug!(device = %device, "scp {}", args.join(" "));

        let output = Command::new("scp")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| FleetError::transfer(device.identity.clone(), format!("cannot start scp: {}", err)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(FleetError::transfer(
                device.identity.clone(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("rpi1", "10.8.1.41")
    }

    #[test]
    fn ssh_args_basic() {
        let settings = SshSettings::default();
        let args = build_ssh_args(&settings, &device(), &["ls".to_string()]);
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "rpi1@10.8.1.41",
                "cd ~/Energy-FL && source venv/bin/activate && { ls; }",
            ]
        );
    }

    #[test]
    fn ssh_args_with_port_and_key() {
        let settings = SshSettings {
            port: Some(2222),
            identity_file: Some(PathBuf::from("/home/op/.ssh/id_fleet")),
            ..SshSettings::default()
        };
        let args = build_ssh_args(&settings, &device(), &[]);
        let joined = args.join(" ");
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("-i /home/op/.ssh/id_fleet"));
        assert_eq!(
            args.last().unwrap(),
            "cd ~/Energy-FL && source venv/bin/activate"
        );
    }

    #[test]
    fn commands_run_in_order() {
        let settings = SshSettings {
            env_setup: String::new(),
            ..SshSettings::default()
        };
        let script = session_script(&settings, &["a".to_string(), "b".to_string()]);
        assert_eq!(script, "cd ~/Energy-FL && { a; b; }");
    }

    #[test]
    fn scp_uses_uppercase_port_flag() {
        let settings = SshSettings {
            port: Some(2222),
            ..SshSettings::default()
        };
        let args = build_scp_args(
            &settings,
            &device(),
            "Outputs/Experiments/run",
            Path::new("/tmp/results"),
        );
        assert_eq!(args[0], "-r");
        assert!(args.join(" ").contains("-P 2222"));
        assert_eq!(args[args.len() - 2], "rpi1@10.8.1.41:Energy-FL/Outputs/Experiments/run");
        assert_eq!(args[args.len() - 1], "/tmp/results");
    }

    #[test]
    fn absolute_remote_paths_are_kept() {
        let settings = SshSettings::default();
        assert_eq!(remote_path_in_workdir(&settings, "/var/log/x"), "/var/log/x");
    }
}
