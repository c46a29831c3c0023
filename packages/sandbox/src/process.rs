// ABOUTME: Preview server process supervision: spawn, readiness polling and termination
// ABOUTME: Holds no bookkeeping beyond OS handles; callers track which pid belongs to which sandbox

use crate::config::CommandLine;
use crate::error::{Result, SandboxError};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Checks after SIGTERM before escalating, every 500ms for 5 seconds
const TERM_ATTEMPTS: u32 = 10;
/// Checks after SIGKILL, every 500ms for 2 seconds
const KILL_ATTEMPTS: u32 = 4;

/// A spawned preview server. Dropping it kills the child.
#[derive(Debug)]
pub struct PreviewProcess {
    pub pid: u32,
    pub port: u16,
    child: Child,
}

impl PreviewProcess {
    /// Reap the child if it has exited. Returns true while it is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

pub struct ProcessManager {
    command: CommandLine,
    startup_grace: Duration,
    http: reqwest::Client,
}

impl ProcessManager {
    pub fn new(command: CommandLine, startup_grace: Duration) -> Self {
        Self {
            command,
            startup_grace,
            // Probes target local ports; never route them through a proxy
            http: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_default(),
        }
    }

    /// Spawn the preview command in `dir` bound to `port`.
    ///
    /// `{port}` in the arguments is substituted and `PORT` is exported. Fails
    /// with [`SandboxError::StartupFailed`] if the process cannot be spawned
    /// or exits before the startup grace period elapses.
    pub async fn start_server(&self, dir: &Path, port: u16) -> Result<PreviewProcess> {
        let args = self.command.args_with_port(port);
        let command_str = CommandLine {
            program: self.command.program.clone(),
            args: args.clone(),
        }
        .display();

        let mut command = Command::new(&self.command.program);
        command
            .args(&args)
            .current_dir(dir)
            .env("PORT", port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| SandboxError::StartupFailed {
            command: command_str.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| SandboxError::StartupFailed {
            command: command_str.clone(),
            reason: "process exited before a PID was assigned".to_string(),
        })?;
        info!("Spawned preview server '{}' with PID {} on port {}", command_str, pid, port);

        capture_process_logs(pid, &mut child);

        sleep(self.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            error!("Preview server PID {} exited during startup: {}", pid, status);
            return Err(SandboxError::StartupFailed {
                command: command_str,
                reason: format!("process exited during startup with {}", status),
            });
        }

        Ok(PreviewProcess { pid, port, child })
    }

    /// Poll `url` with GET until it answers 2xx or `timeout` elapses
    pub async fn wait_for_ready(&self, url: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("{} not ready after {:?}", url, timeout);
                return false;
            }

            match self.http.get(url).timeout(remaining).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => debug!("{} answered {}", url, response.status()),
                Err(e) => debug!("{} not reachable yet: {}", url, e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }

    /// SIGTERM, then SIGKILL if the process outlives the grace period.
    /// A pid that is already gone counts as terminated.
    pub async fn terminate_process(&self, pid: u32) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let nix_pid = Pid::from_raw(pid as i32);

        match kill(nix_pid, Signal::SIGTERM) {
            Ok(_) => info!("Sent SIGTERM to process with PID: {}", pid),
            Err(Errno::ESRCH) => {
                debug!("Process {} already exited", pid);
                return Ok(());
            }
            Err(e) => {
                warn!("Failed to send SIGTERM to PID {}: {}", pid, e);
                return Err(SandboxError::ProcessKill {
                    pid,
                    reason: format!("Failed to send SIGTERM: {}", e),
                });
            }
        }

        for _ in 0..TERM_ATTEMPTS {
            sleep(POLL_INTERVAL).await;
            if !self.is_process_running(pid) {
                info!("Process {} terminated gracefully after SIGTERM", pid);
                return Ok(());
            }
        }

        warn!("Process {} did not respond to SIGTERM, sending SIGKILL", pid);
        match kill(nix_pid, Signal::SIGKILL) {
            Ok(_) => info!("Sent SIGKILL to process with PID: {}", pid),
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => {
                return Err(SandboxError::ProcessKill {
                    pid,
                    reason: format!("Failed to send SIGKILL: {}", e),
                });
            }
        }

        for _ in 0..KILL_ATTEMPTS {
            sleep(POLL_INTERVAL).await;
            if !self.is_process_running(pid) {
                info!("Process {} terminated after SIGKILL", pid);
                return Ok(());
            }
        }

        error!("Process {} did not terminate even after SIGKILL", pid);
        Err(SandboxError::ProcessKill {
            pid,
            reason: "Process did not terminate even after SIGKILL".to_string(),
        })
    }

    /// Zombies count as not running: they are dead, only unreaped
    pub fn is_process_running(&self, pid: u32) -> bool {
        use sysinfo::{Pid, ProcessStatus, System};

        let mut system = System::new();
        system.refresh_processes();
        system
            .process(Pid::from_u32(pid))
            .map(|p| p.status() != ProcessStatus::Zombie)
            .unwrap_or(false)
    }
}

/// Forward the child's stdout/stderr lines to tracing
fn capture_process_logs(pid: u32, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[preview {}] {}", pid, line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[preview {} stderr] {}", pid, line);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh", &["-c", script])
    }

    #[tokio::test]
    async fn test_start_and_terminate() {
        let dir = TempDir::new().unwrap();
        let manager = ProcessManager::new(sh("sleep 30"), Duration::from_millis(200));

        let mut process = manager.start_server(dir.path(), 4555).await.unwrap();
        assert_eq!(process.port, 4555);
        assert!(process.is_alive());
        assert!(manager.is_process_running(process.pid));

        manager.terminate_process(process.pid).await.unwrap();
        assert!(!manager.is_process_running(process.pid));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_port_is_substituted_and_exported() {
        let dir = TempDir::new().unwrap();
        let manager = ProcessManager::new(
            sh("echo \"$PORT {port}\" > port.txt; sleep 30"),
            Duration::from_millis(300),
        );

        let process = manager.start_server(dir.path(), 4321).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("port.txt")).unwrap();
        assert_eq!(written.trim(), "4321 4321");

        manager.terminate_process(process.pid).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_during_grace_is_startup_failure() {
        let dir = TempDir::new().unwrap();
        let manager = ProcessManager::new(sh("exit 3"), Duration::from_millis(300));

        let err = manager.start_server(dir.path(), 4000).await.unwrap_err();
        assert!(matches!(err, SandboxError::StartupFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_startup_failure() {
        let dir = TempDir::new().unwrap();
        let manager = ProcessManager::new(
            CommandLine::new("definitely-not-a-real-binary-xyz", &["-p", "{port}"]),
            Duration::from_millis(10),
        );

        let err = manager.start_server(dir.path(), 4000).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::StartupFailed { ref command, .. } if command == "definitely-not-a-real-binary-xyz -p 4000"
        ));
    }

    #[tokio::test]
    async fn test_terminate_dead_pid_is_ok() {
        let manager = ProcessManager::new(sh("true"), Duration::ZERO);
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        manager.terminate_process(pid).await.unwrap();
        assert!(!manager.is_process_running(pid));
    }

    #[tokio::test]
    async fn test_wait_for_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let manager = ProcessManager::new(sh("true"), Duration::ZERO);
        assert!(
            manager
                .wait_for_ready(&format!("{}/", server.uri()), Duration::from_secs(2))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out_on_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let manager = ProcessManager::new(sh("true"), Duration::ZERO);
        let started = std::time::Instant::now();
        assert!(
            !manager
                .wait_for_ready(&format!("{}/", server.uri()), Duration::from_millis(800))
                .await
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
