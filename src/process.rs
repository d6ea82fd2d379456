//! OS process plumbing: spawning wallet-rpc, stopping it, and probing pids.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::WalletRpcConfig;
use crate::error::{Error, Result};
use crate::node::Node;

/// Upper bound on stderr kept for start-failure reports.
const STDERR_CAPTURE_LIMIT: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A running (or exited) wallet-rpc process owned by the supervisor.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    fn is_running(&mut self) -> bool;

    /// Ask the process to exit, escalating to a forced kill after `grace`.
    fn stop(&mut self, grace: Duration) -> impl Future<Output = Result<()>> + Send;
}

/// Produces a started [`ProcessHandle`] for a node.
pub trait Launcher: Send + Sync {
    type Handle: ProcessHandle;

    fn launch(&self, node: &Node) -> impl Future<Output = Result<Self::Handle>> + Send;
}

/// Read-only view of the host process table, plus the forced kill used for stale pids.
pub trait ProcessProbe: Send + Sync {
    /// Signal-0 existence test.
    fn exists(&self, pid: u32) -> bool;

    /// Full command line, or [`Error::IntrospectionUnavailable`].
    fn cmdline(&self, pid: u32) -> Result<String>;

    /// SIGKILL `pid` if it exists. Returns whether a signal was sent.
    fn force_kill(&self, pid: u32) -> Result<bool>;
}

/// [`ProcessProbe`] backed by the real OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn exists(&self, pid: u32) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                use nix::errno::Errno;
                use nix::sys::signal::{kill, Signal};

                let Some(pid) = unix_pid(pid) else {
                    return false;
                };
                match kill(pid, None::<Signal>) {
                    Ok(()) => true,
                    Err(Errno::EPERM) => true,
                    Err(_) => false,
                }
            } else {
                let _ = pid;
                false
            }
        }
    }

    fn cmdline(&self, pid: u32) -> Result<String> {
        if pid == 0 {
            return Err(Error::IntrospectionUnavailable);
        }

        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                match std::fs::read(format!("/proc/{pid}/cmdline")) {
                    Ok(raw) => Ok(String::from_utf8_lossy(&raw)
                        .split('\0')
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ")),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
                    Err(_) => ps_command(pid),
                }
            } else if #[cfg(unix)] {
                ps_command(pid)
            } else {
                Err(Error::IntrospectionUnavailable)
            }
        }
    }

    fn force_kill(&self, pid: u32) -> Result<bool> {
        if !self.exists(pid) {
            return Ok(false);
        }

        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                use nix::errno::Errno;
                use nix::sys::signal::{kill, Signal};

                let Some(os_pid) = unix_pid(pid) else {
                    return Ok(false);
                };
                match kill(os_pid, Signal::SIGKILL) {
                    Ok(()) => Ok(true),
                    Err(Errno::ESRCH) => Ok(false),
                    Err(e) => Err(std::io::Error::from(e).into()),
                }
            } else {
                Ok(false)
            }
        }
    }
}

/// Guards against pid 0 and values that would wrap to a negative (group) pid.
#[cfg(unix)]
fn unix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(nix::unistd::Pid::from_raw)
}

#[cfg(unix)]
fn ps_command(pid: u32) -> Result<String> {
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command="])
        .stdin(Stdio::null())
        .output()
        .map_err(|_| Error::IntrospectionUnavailable)?;

    // ps exits 1 when the pid is gone, which is an answer, not an introspection failure.
    if !output.status.success() && !output.stderr.is_empty() {
        return Err(Error::IntrospectionUnavailable);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Spawns `monero-wallet-rpc` for local nodes.
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
    program: PathBuf,
    wallet_dir: PathBuf,
    log_dir: PathBuf,
    settle_delay: Duration,
    stop_grace: Duration,
}

impl DaemonLauncher {
    pub fn from_config(cfg: &WalletRpcConfig) -> Self {
        // Resolve binary path using which crate
        let program = which::which(&cfg.execute_path).unwrap_or_else(|_| {
            log::warn!(
                "{} not found in PATH, using it as a literal path",
                cfg.execute_path
            );
            PathBuf::from(&cfg.execute_path)
        });

        Self {
            program,
            wallet_dir: cfg.wallet_dir.clone(),
            log_dir: cfg.log_dir.clone(),
            settle_delay: cfg.settle_delay(),
            stop_grace: cfg.stop_grace(),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    pub fn log_file(&self, node: &Node) -> PathBuf {
        self.log_dir.join(format!("{}.log", node.name))
    }

    /// Arguments passed to wallet-rpc for `node`, credentials included when set.
    pub fn command_args(&self, node: &Node) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--wallet-dir".into(),
            self.wallet_dir.clone().into(),
            "--rpc-bind-port".into(),
            node.port.to_string().into(),
            "--daemon-address".into(),
            node.daemon.clone().unwrap_or_default().into(),
            "--log-file".into(),
            self.log_file(node).into(),
            "--non-interactive".into(),
        ];
        if let Some(user) = node.username.as_deref().filter(|u| !u.is_empty()) {
            args.push("--rpc-login".into());
            args.push(format!("{user}:{}", node.password.as_deref().unwrap_or_default()).into());
        }
        args
    }
}

impl Launcher for DaemonLauncher {
    type Handle = DaemonProcess;

    async fn launch(&self, node: &Node) -> Result<DaemonProcess> {
        tokio::fs::create_dir_all(&self.wallet_dir).await?;
        tokio::fs::create_dir_all(&self.log_dir).await?;

        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_args(node))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            binary: self.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        log::debug!("{} wallet-rpc spawned (pid: {pid:?})", node.name);

        let captured = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let name = node.name.clone();
            let captured = Arc::clone(&captured);
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::error!("[{name}] {line}");
                    let mut buf = captured.lock().unwrap_or_else(|e| e.into_inner());
                    if buf.len() < STDERR_CAPTURE_LIMIT {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
            })
        });

        let mut process = DaemonProcess {
            name: node.name.clone(),
            pid,
            child,
            stderr_task,
        };

        tokio::time::sleep(self.settle_delay).await;

        let stderr = captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .trim()
            .to_string();
        if !stderr.is_empty() {
            if process.is_running()
                && let Err(e) = process.stop(self.stop_grace).await
            {
                log::warn!("Failed to stop failed wallet-rpc for {}: {e}", node.name);
            }
            return Err(Error::StartFailure {
                node: node.name.clone(),
                stderr,
            });
        }

        if let Ok(Some(status)) = process.child.try_wait() {
            return Err(Error::StartFailure {
                node: node.name.clone(),
                stderr: format!("exited during startup: {status}"),
            });
        }

        Ok(process)
    }
}

/// Handle to a wallet-rpc child spawned by [`DaemonLauncher`].
#[derive(Debug)]
pub struct DaemonProcess {
    name: String,
    pid: Option<u32>,
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
}

impl DaemonProcess {
    async fn wait_exit(&mut self, deadline: Duration) -> Result<bool> {
        let start = tokio::time::Instant::now();
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(true);
            }
            if start.elapsed() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl ProcessHandle for DaemonProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.is_running() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};

                if let Some(pid) = self.pid.and_then(unix_pid) {
                    match kill(pid, Signal::SIGTERM) {
                        Ok(()) => log::info!("Sent SIGTERM to {} (pid: {pid})", self.name),
                        Err(e) => log::warn!("Failed SIGTERM to {}: {e}", self.name),
                    }
                }
            }

            if !self.wait_exit(grace).await? {
                log::warn!(
                    "{} did not exit within {grace:?}, escalating to SIGKILL",
                    self.name
                );
                self.child.start_kill()?;
                if !self.wait_exit(KILL_WAIT).await? {
                    return Err(Error::Io(std::io::Error::other(format!(
                        "{} did not respond to SIGKILL after {KILL_WAIT:?} (pid: {:?})",
                        self.name, self.pid
                    ))));
                }
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::fixture;

    fn launcher(program: PathBuf, dir: &std::path::Path) -> DaemonLauncher {
        DaemonLauncher {
            program,
            wallet_dir: dir.join("wallets"),
            log_dir: dir.join("logs"),
            settle_delay: Duration::from_millis(300),
            stop_grace: Duration::from_secs(1),
        }
    }

    #[test]
    fn command_args_include_login_only_with_username() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(PathBuf::from("monero-wallet-rpc"), dir.path());
        let mut node = fixture(1, 18082);

        let args = launcher.command_args(&node);
        assert_eq!(args.len(), 9);
        assert_eq!(args[3], OsString::from("18082"));
        assert_eq!(args[5], OsString::from("127.0.0.1:18081"));
        assert_eq!(args[7], OsString::from(dir.path().join("logs").join("node-1.log")));
        assert_eq!(args[8], OsString::from("--non-interactive"));

        node.username = Some("rpc".into());
        node.password = Some("secret".into());
        let args = launcher.command_args(&node);
        assert_eq!(&args[9..], &[OsString::from("--rpc-login"), OsString::from("rpc:secret")]);
    }

    #[test]
    fn probe_sees_own_process() {
        let me = std::process::id();
        assert!(SystemProbe.exists(me));
    }

    #[test]
    fn probe_rejects_zero_and_out_of_range_pids() {
        assert!(!SystemProbe.exists(0));
        assert!(!SystemProbe.exists(u32::MAX));
        assert!(matches!(SystemProbe.cmdline(0), Err(Error::IntrospectionUnavailable)));
    }

    #[test]
    fn force_kill_of_missing_pid_is_a_no_op() {
        assert!(!SystemProbe.force_kill(u32::MAX).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cmdline_of_own_process_names_the_test_binary() {
        let cmdline = SystemProbe.cmdline(std::process::id()).unwrap();
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy();
        assert!(cmdline.contains(name.as_ref()), "{cmdline}");
    }

    #[cfg(unix)]
    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-wallet-rpc");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_then_stop_a_quiet_process() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(script(dir.path(), "exec sleep 30"), dir.path());

        let mut process = launcher.launch(&fixture(1, 18082)).await.unwrap();
        assert!(process.pid().is_some());
        assert!(process.is_running());
        assert!(dir.path().join("wallets").is_dir());

        process.stop(Duration::from_secs(2)).await.unwrap();
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_escalates_to_sigkill_when_sigterm_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(script(dir.path(), "trap '' TERM\nexec sleep 30"), dir.path());

        let mut process = launcher.launch(&fixture(1, 18082)).await.unwrap();
        assert!(process.is_running());

        let started = tokio::time::Instant::now();
        process.stop(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_output_during_settle_is_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(
            script(dir.path(), "echo 'Failed to bind port 18082' >&2\nexec sleep 30"),
            dir.path(),
        );

        let err = launcher.launch(&fixture(1, 18082)).await.unwrap_err();
        match err {
            Error::StartFailure { node, stderr } => {
                assert_eq!(node, "node-1");
                assert!(stderr.contains("Failed to bind"), "{stderr}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_early_exit_is_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(script(dir.path(), "exit 3"), dir.path());

        let err = launcher.launch(&fixture(1, 18082)).await.unwrap_err();
        assert!(matches!(err, Error::StartFailure { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path().join("does-not-exist"), dir.path());

        let err = launcher.launch(&fixture(1, 18082)).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }), "{err}");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    /// Scripted process table. `None` command lines simulate hosts without introspection.
    #[derive(Default)]
    pub struct FakeProbe {
        processes: HashMap<u32, Option<String>>,
        killed: Mutex<Vec<u32>>,
    }

    impl FakeProbe {
        pub fn with_process(mut self, pid: u32, cmdline: &str) -> Self {
            self.processes.insert(pid, Some(cmdline.to_string()));
            self
        }

        pub fn with_opaque_process(mut self, pid: u32) -> Self {
            self.processes.insert(pid, None);
            self
        }

        pub fn killed(&self) -> Vec<u32> {
            self.killed.lock().unwrap().clone()
        }
    }

    impl ProcessProbe for FakeProbe {
        fn exists(&self, pid: u32) -> bool {
            self.processes.contains_key(&pid) && !self.killed.lock().unwrap().contains(&pid)
        }

        fn cmdline(&self, pid: u32) -> Result<String> {
            match self.processes.get(&pid) {
                Some(Some(cmdline)) => Ok(cmdline.clone()),
                Some(None) => Err(Error::IntrospectionUnavailable),
                None => Ok(String::new()),
            }
        }

        fn force_kill(&self, pid: u32) -> Result<bool> {
            if !self.exists(pid) {
                return Ok(false);
            }
            self.killed.lock().unwrap().push(pid);
            Ok(true)
        }
    }

    /// Launcher that hands out in-memory handles instead of spawning.
    pub struct FakeLauncher {
        next_pid: AtomicU32,
        launched: Mutex<Vec<(u64, Arc<AtomicBool>)>>,
        stopped: Arc<Mutex<Vec<u32>>>,
        fail_with: Mutex<Option<String>>,
    }

    impl Default for FakeLauncher {
        fn default() -> Self {
            Self {
                next_pid: AtomicU32::new(5000),
                launched: Mutex::default(),
                stopped: Arc::default(),
                fail_with: Mutex::default(),
            }
        }
    }

    impl FakeLauncher {
        pub fn launches(&self) -> usize {
            self.launched.lock().unwrap().len()
        }

        pub fn launched_for(&self, node_id: u64) -> usize {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| *id == node_id)
                .count()
        }

        /// Simulate the most recent process of `node_id` dying on its own.
        pub fn crash(&self, node_id: u64) {
            if let Some((_, running)) = self
                .launched
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(id, _)| *id == node_id)
            {
                running.store(false, Ordering::SeqCst);
            }
        }

        pub fn stopped(&self) -> Vec<u32> {
            self.stopped.lock().unwrap().clone()
        }

        pub fn fail_next(&self, stderr: &str) {
            *self.fail_with.lock().unwrap() = Some(stderr.to_string());
        }
    }

    pub struct FakeHandle {
        pid: u32,
        running: Arc<AtomicBool>,
        stopped: Arc<Mutex<Vec<u32>>>,
    }

    impl ProcessHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_running(&mut self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn stop(&mut self, _grace: Duration) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            self.stopped.lock().unwrap().push(self.pid);
            Ok(())
        }
    }

    impl Launcher for FakeLauncher {
        type Handle = FakeHandle;

        async fn launch(&self, node: &Node) -> Result<FakeHandle> {
            if let Some(stderr) = self.fail_with.lock().unwrap().take() {
                return Err(Error::StartFailure {
                    node: node.name.clone(),
                    stderr,
                });
            }
            let running = Arc::new(AtomicBool::new(true));
            self.launched
                .lock()
                .unwrap()
                .push((node.id, Arc::clone(&running)));
            Ok(FakeHandle {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                running,
                stopped: Arc::clone(&self.stopped),
            })
        }
    }
}
