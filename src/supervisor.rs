/// Child process lifecycle: spawn, observe for one window, terminate, reap.
///
/// stdout and stderr share a single pipe so the reader sees one combined
/// stream in write order. The child runs in its own process group so
/// termination reaches anything it started.
use crate::config::TargetConfig;
use crate::extract::Extractor;
use crate::reader;
use crate::window::{self, WindowEnd, WindowOutcome, WindowTiming};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Interval between liveness checks while a leaderless group winds down.
const GROUP_POLL: Duration = Duration::from_millis(25);

/// Failure to launch the target. Fatal to the whole run.
#[derive(Debug)]
pub enum LaunchError {
    /// The executable does not exist.
    NotFound { command: String },
    /// The OS refused to start the process.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The combined output pipe could not be created.
    Pipe { source: std::io::Error },
    /// The output reader thread could not be started.
    Reader { source: std::io::Error },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::NotFound { command } => write!(f, "executable not found: {}", command),
            LaunchError::Spawn { command, source } => {
                write!(f, "failed to start process {}: {}", command, source)
            }
            LaunchError::Pipe { source } => {
                write!(f, "failed to create output pipe: {}", source)
            }
            LaunchError::Reader { source } => {
                write!(f, "failed to start output reader: {}", source)
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::NotFound { .. } => None,
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::Pipe { source } => Some(source),
            LaunchError::Reader { source } => Some(source),
        }
    }
}

/// Failure while stopping the child. Logged, never propagated.
#[derive(Debug)]
pub enum TerminationError {
    /// Delivering a signal to the process group failed.
    #[cfg(unix)]
    Signal {
        signal: nix::sys::signal::Signal,
        source: nix::Error,
    },
    /// Waiting on the child failed.
    Wait { source: std::io::Error },
    /// Force-killing the child failed.
    Kill { source: std::io::Error },
}

impl std::fmt::Display for TerminationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            TerminationError::Signal { signal, source } => {
                write!(f, "failed to send {} to process group: {}", signal, source)
            }
            TerminationError::Wait { source } => write!(f, "failed to wait on child: {}", source),
            TerminationError::Kill { source } => write!(f, "failed to kill child: {}", source),
        }
    }
}

impl std::error::Error for TerminationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            #[cfg(unix)]
            TerminationError::Signal { source, .. } => Some(source),
            TerminationError::Wait { source } => Some(source),
            TerminationError::Kill { source } => Some(source),
        }
    }
}

/// Best-effort cleanup result for one child.
#[derive(Debug)]
pub enum TerminationOutcome {
    /// Exited on its own; reaped without signalling.
    AlreadyExited(ExitStatus),
    /// Stopped within the grace period after SIGTERM.
    Graceful(ExitStatus),
    /// Ignored SIGTERM and was killed.
    Forced,
    /// Cleanup failed; the child may still be running.
    Failed(TerminationError),
}

impl TerminationOutcome {
    pub fn is_reaped(&self) -> bool {
        !matches!(self, TerminationOutcome::Failed(_))
    }

    /// Log the outcome. This is the only place termination errors surface.
    pub fn log(&self, pid: Option<u32>) {
        match self {
            TerminationOutcome::AlreadyExited(status) => {
                tracing::debug!(?pid, code = ?status.code(), "child already exited, reaped")
            }
            TerminationOutcome::Graceful(status) => {
                tracing::debug!(?pid, code = ?status.code(), "child stopped after SIGTERM")
            }
            TerminationOutcome::Forced => {
                tracing::warn!(?pid, "child ignored SIGTERM, force-killed")
            }
            TerminationOutcome::Failed(e) => {
                tracing::warn!(?pid, error = %e, "failed to terminate child, continuing")
            }
        }
    }
}

/// Lifecycle phase of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPhase {
    NotStarted,
    Running,
    ExitedNaturally,
    WindowExpired,
    Terminating,
    Reaped,
}

/// A spawned target with its line queue.
pub struct RunningChild {
    child: Child,
    pid: Option<u32>,
    lines: UnboundedReceiver<String>,
    phase: ChildPhase,
    /// Set once the whole process group has been signalled to stop.
    group_stopped: bool,
}

/// Build the command with stdout and stderr pointed at the same pipe writer.
fn build_command(target: &TargetConfig, writer: std::io::PipeWriter) -> std::io::Result<Command> {
    let writer_stderr = writer.try_clone()?;
    let mut cmd = Command::new(&target.command);
    cmd.args(&target.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(writer_stderr))
        .kill_on_drop(true);
    if let Some(dir) = &target.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    Ok(cmd)
}

/// Launch the target and start its output reader.
pub fn spawn(target: &TargetConfig) -> Result<RunningChild, LaunchError> {
    let (pipe_reader, pipe_writer) =
        std::io::pipe().map_err(|e| LaunchError::Pipe { source: e })?;
    let mut cmd = build_command(target, pipe_writer).map_err(|e| LaunchError::Pipe { source: e })?;

    tracing::debug!(
        command = %target.command,
        args = ?target.args,
        working_dir = ?target.working_dir,
        "spawning target"
    );

    let spawned = cmd.spawn();
    // The command holds the parent's copies of the write end; the reader only
    // sees end-of-stream once they are closed.
    drop(cmd);

    let mut child = spawned.map_err(|e| {
        let missing_dir = target.working_dir.as_ref().is_some_and(|d| !d.is_dir());
        if e.kind() == std::io::ErrorKind::NotFound && !missing_dir {
            LaunchError::NotFound {
                command: target.command.clone(),
            }
        } else {
            LaunchError::Spawn {
                command: target.command.clone(),
                source: e,
            }
        }
    })?;

    let pid = child.id();
    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(e) = reader::spawn_reader(pipe_reader, tx, pid) {
        abort_launch(&mut child, pid);
        return Err(LaunchError::Reader { source: e });
    }

    tracing::debug!(?pid, "target started");

    let mut running = RunningChild {
        child,
        pid,
        lines: rx,
        phase: ChildPhase::NotStarted,
        group_stopped: false,
    };
    running.set_phase(ChildPhase::Running);
    Ok(running)
}

/// Kill a child whose launch could not be completed, group and all.
fn abort_launch(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = force_kill_group(pid) {
        tracing::debug!(?pid, error = %e, "process group kill failed");
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(?pid, error = %e, "child kill failed");
    }
}

impl RunningChild {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn phase(&self) -> ChildPhase {
        self.phase
    }

    fn set_phase(&mut self, next: ChildPhase) {
        tracing::trace!(pid = ?self.pid, from = ?self.phase, to = ?next, "child phase");
        self.phase = next;
    }

    /// Watch output until the window budget elapses or the child exits.
    pub async fn observe(&mut self, extractor: &Extractor, timing: &WindowTiming) -> WindowOutcome {
        let outcome =
            window::await_window(&mut self.child, &mut self.lines, extractor, timing).await;
        self.set_phase(match outcome.end {
            WindowEnd::Expired => ChildPhase::WindowExpired,
            WindowEnd::ProcessExited => ChildPhase::ExitedNaturally,
        });
        outcome
    }

    /// Stop the child if it is still running and reap it.
    ///
    /// SIGTERM to the process group, wait up to `grace`, then SIGKILL. Once
    /// the child is reaped, anything it left behind in its group gets the
    /// same treatment.
    pub async fn terminate(&mut self, grace: Duration) -> TerminationOutcome {
        self.set_phase(ChildPhase::Terminating);
        let outcome = match self.child.try_wait() {
            Ok(Some(status)) => TerminationOutcome::AlreadyExited(status),
            Ok(None) => escalate(&mut self.child, self.pid, grace).await,
            Err(e) => TerminationOutcome::Failed(TerminationError::Wait { source: e }),
        };
        if outcome.is_reaped() {
            // A forced kill already hit the whole group.
            if !matches!(outcome, TerminationOutcome::Forced) {
                sweep_group(self.pid, grace).await;
            }
            self.group_stopped = true;
            self.set_phase(ChildPhase::Reaped);
        }
        outcome
    }
}

impl Drop for RunningChild {
    fn drop(&mut self) {
        // Abandoned mid-cycle (shutdown): take the whole group down, not just
        // the direct child that kill_on_drop covers. The group outlives a
        // reaped leader while any member is alive.
        if self.group_stopped {
            return;
        }
        if let Err(e) = force_kill_group(self.pid) {
            tracing::trace!(pid = ?self.pid, error = %e, "process group kill on drop failed");
        }
    }
}

async fn escalate(child: &mut Child, pid: Option<u32>, grace: Duration) -> TerminationOutcome {
    if let Err(e) = request_stop(pid) {
        tracing::debug!(?pid, error = %e, "graceful stop request failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => TerminationOutcome::Graceful(status),
        Ok(Err(e)) => TerminationOutcome::Failed(TerminationError::Wait { source: e }),
        Err(_) => {
            if let Err(e) = force_kill_group(pid) {
                tracing::debug!(?pid, error = %e, "process group kill failed");
            }
            match child.kill().await {
                Ok(()) => TerminationOutcome::Forced,
                Err(e) => TerminationOutcome::Failed(TerminationError::Kill { source: e }),
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) -> Result<(), TerminationError> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return Ok(());
    };
    // Spawned with process_group(0), so the PGID equals the PID.
    killpg(Pid::from_raw(pid as i32), signal)
        .map_err(|e| TerminationError::Signal { signal, source: e })
}

#[cfg(unix)]
fn request_stop(pid: Option<u32>) -> Result<(), TerminationError> {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn force_kill_group(pid: Option<u32>) -> Result<(), TerminationError> {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

/// Stop members left in the group after its leader has been reaped.
#[cfg(unix)]
async fn sweep_group(pid: Option<u32>, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return,
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to signal leftover process group");
            return;
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if killpg(pgid, None) == Err(Errno::ESRCH) {
            tracing::debug!(pid, "leftover process group stopped");
            return;
        }
        tokio::time::sleep(GROUP_POLL).await;
    }

    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => tracing::warn!(pid, "leftover process group ignored SIGTERM, force-killed"),
        Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill leftover process group"),
    }
}

#[cfg(not(unix))]
async fn sweep_group(_pid: Option<u32>, _grace: Duration) {}

#[cfg(not(unix))]
fn request_stop(_pid: Option<u32>) -> Result<(), TerminationError> {
    Ok(())
}

#[cfg(not(unix))]
fn force_kill_group(_pid: Option<u32>) -> Result<(), TerminationError> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> TargetConfig {
        TargetConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
        }
    }

    fn timing(budget_ms: u64) -> WindowTiming {
        WindowTiming {
            budget: Duration::from_millis(budget_ms),
            poll_interval: Duration::from_millis(50),
            final_drain: Duration::from_millis(200),
        }
    }

    fn extractor() -> Extractor {
        Extractor::new("importSharedTexture")
    }

    fn is_alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    /// True while any non-zombie process is in group `pgid`.
    #[cfg(target_os = "linux")]
    fn group_has_live_members(pgid: u32) -> bool {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return false;
        };
        entries.flatten().any(|entry| {
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                return false;
            };
            // Fields after "pid (comm)": state ppid pgrp ...
            let Some(close) = stat.rfind(')') else {
                return false;
            };
            let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
            fields.len() > 2 && fields[0] != "Z" && fields[2] == pgid.to_string()
        })
    }

    #[cfg(target_os = "linux")]
    async fn wait_for_group_gone(pgid: u32, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if !group_has_live_members(pgid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_is_not_found() {
        let target = TargetConfig {
            command: "nonexistent-binary-xyz".to_string(),
            args: vec![],
            working_dir: None,
        };
        let err = spawn(&target).err().unwrap();
        assert!(matches!(err, LaunchError::NotFound { .. }));
        assert!(err.to_string().contains("nonexistent-binary-xyz"));
    }

    #[tokio::test]
    async fn test_spawn_bad_working_dir_is_launch_error() {
        let mut target = sh("echo hi");
        target.working_dir = Some("/nonexistent-dir/impossible".into());
        let err = spawn(&target).err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_early_exit_line_is_captured() {
        let mut child = spawn(&sh("echo 'importSharedTexture total=345'")).unwrap();
        assert_eq!(child.phase(), ChildPhase::Running);

        let start = Instant::now();
        let outcome = child.observe(&extractor(), &timing(10_000)).await;
        assert_eq!(outcome.end, WindowEnd::ProcessExited);
        assert_eq!(child.phase(), ChildPhase::ExitedNaturally);
        let obs = outcome.last.unwrap();
        assert_eq!(obs.value, 345);
        assert_eq!(obs.line, "importSharedTexture total=345");
        assert!(start.elapsed() < Duration::from_secs(5));

        let term = child.terminate(Duration::from_secs(1)).await;
        assert!(matches!(term, TerminationOutcome::AlreadyExited(_)));
        assert_eq!(child.phase(), ChildPhase::Reaped);
    }

    #[tokio::test]
    async fn test_stderr_is_merged_into_stream() {
        let mut child = spawn(&sh(
            "echo 'importSharedTexture 1'; echo 'importSharedTexture 2' >&2",
        ))
        .unwrap();
        let outcome = child.observe(&extractor(), &timing(5_000)).await;
        assert_eq!(outcome.lines_seen, 2);
        assert_eq!(outcome.last.unwrap().value, 2);
        child.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_working_dir_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("value.txt"), "importSharedTexture 77\n").unwrap();
        let mut target = sh("cat value.txt");
        target.working_dir = Some(dir.path().to_path_buf());

        let mut child = spawn(&target).unwrap();
        let outcome = child.observe(&extractor(), &timing(5_000)).await;
        assert_eq!(outcome.last.unwrap().value, 77);
        child.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_window_expiry_then_graceful_stop() {
        let mut child = spawn(&sh("echo 'importSharedTexture 12'; sleep 30")).unwrap();
        let pid = child.pid().unwrap();

        let outcome = child.observe(&extractor(), &timing(300)).await;
        assert_eq!(outcome.end, WindowEnd::Expired);
        assert_eq!(child.phase(), ChildPhase::WindowExpired);
        assert_eq!(outcome.last.unwrap().value, 12);

        let term = child.terminate(Duration::from_secs(2)).await;
        assert!(matches!(term, TerminationOutcome::Graceful(_)));
        assert_eq!(child.phase(), ChildPhase::Reaped);
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_sigterm_ignoring_child_is_force_killed() {
        let mut child = spawn(&sh("trap '' TERM; echo ready; while :; do sleep 1; done")).unwrap();
        let pid = child.pid().unwrap();

        let outcome = child.observe(&extractor(), &timing(300)).await;
        assert_eq!(outcome.end, WindowEnd::Expired);
        assert!(outcome.last.is_none());

        let start = Instant::now();
        let term = child.terminate(Duration::from_millis(300)).await;
        assert!(matches!(term, TerminationOutcome::Forced));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(child.phase(), ChildPhase::Reaped);
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_dropped_not_fatal() {
        let mut child = spawn(&sh(r"printf 'importSharedTexture \377\376 88\n'")).unwrap();
        let outcome = child.observe(&extractor(), &timing(5_000)).await;
        let obs = outcome.last.unwrap();
        assert_eq!(obs.value, 88);
        assert_eq!(obs.line, "importSharedTexture  88");
        child.terminate(Duration::from_secs(1)).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_helper_stopped_after_child_exits() {
        let mut child = spawn(&sh("sleep 30 & echo 'importSharedTexture 1'")).unwrap();
        let pgid = child.pid().unwrap();

        let outcome = child.observe(&extractor(), &timing(5_000)).await;
        assert_eq!(outcome.end, WindowEnd::ProcessExited);
        assert_eq!(outcome.last.unwrap().value, 1);

        let term = child.terminate(Duration::from_secs(1)).await;
        assert!(matches!(term, TerminationOutcome::AlreadyExited(_)));
        assert_eq!(child.phase(), ChildPhase::Reaped);
        assert!(wait_for_group_gone(pgid, Duration::from_secs(3)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sigterm_ignoring_helper_killed_after_child_exits() {
        let mut child = spawn(&sh(
            "(trap '' TERM; while :; do sleep 1; done) & echo 'importSharedTexture 2'",
        ))
        .unwrap();
        let pgid = child.pid().unwrap();

        let outcome = child.observe(&extractor(), &timing(5_000)).await;
        assert_eq!(outcome.end, WindowEnd::ProcessExited);

        let start = Instant::now();
        let term = child.terminate(Duration::from_millis(300)).await;
        assert!(matches!(term, TerminationOutcome::AlreadyExited(_)));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(wait_for_group_gone(pgid, Duration::from_secs(3)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_child_takes_group_down() {
        let mut child = spawn(&sh("sleep 30 & echo 'importSharedTexture 3'")).unwrap();
        let pgid = child.pid().unwrap();
        child.observe(&extractor(), &timing(5_000)).await;
        drop(child);
        assert!(wait_for_group_gone(pgid, Duration::from_secs(3)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abort_launch_kills_group() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30 & sleep 30"])
            .stdout(Stdio::null())
            .process_group(0);
        let mut child = cmd.spawn().unwrap();
        let pgid = child.id().unwrap();

        abort_launch(&mut child, Some(pgid));
        child.wait().await.unwrap();
        assert!(wait_for_group_gone(pgid, Duration::from_secs(3)).await);
    }

    #[test]
    fn test_termination_outcome_reaped() {
        assert!(TerminationOutcome::Forced.is_reaped());
        let failed = TerminationOutcome::Failed(TerminationError::Kill {
            source: std::io::Error::other("nope"),
        });
        assert!(!failed.is_reaped());
        let err = TerminationError::Wait {
            source: std::io::Error::other("gone"),
        };
        assert!(err.to_string().contains("failed to wait on child"));
    }
}
