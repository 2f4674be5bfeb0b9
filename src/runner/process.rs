//! Runner backed by a real OS process.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{line_channel, LineReceiver, LineSender, Runner, RunnerError};
use crate::config::ProcessConfig;

/// Longest stdout line delivered, in bytes. Anything past it up to the next
/// newline is dropped.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Cloneable handle that kills a runner's process from outside the run.
///
/// Kill requests latch: a request made before the process is spawned kills
/// it as soon as it starts.
#[derive(Debug, Clone)]
pub struct KillHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl KillHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Kill the process. Lines already delivered stay delivered and the line
    /// stream closes right away, so a `Task::run` in progress returns `Ok`.
    pub fn kill(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_killed(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Spawns the command with `tokio::process` and streams its stdout line by
/// line from a dedicated reader task.
///
/// One runner starts one process. The process is killed if the runner is
/// dropped while it is still running.
pub struct ProcessRunner {
    config: ProcessConfig,
    kill: KillHandle,
    reader: Option<JoinHandle<Option<ExitStatus>>>,
    stdout: Option<LineReceiver>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::with_config(ProcessConfig::default())
    }

    pub fn with_config(config: ProcessConfig) -> Self {
        Self {
            config,
            kill: KillHandle::new(),
            reader: None,
            stdout: None,
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Handle for cancelling the process while a task holds the runner.
    pub fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    /// Wait for the output reader to finish and reap the child.
    ///
    /// Returns `None` if nothing was started. If the line stream was never
    /// taken it is dropped first, so the reader does not block on a consumer
    /// that will never come.
    pub async fn wait(&mut self) -> Result<Option<ExitStatus>, RunnerError> {
        self.stdout = None;
        match self.reader.take() {
            Some(handle) => Ok(handle.await?),
            None => Ok(None),
        }
    }

    /// Kill the running process. See [`KillHandle::kill`].
    pub fn kill(&self) {
        self.kill.kill();
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        // The reader task owns the child, so kill_on_drop alone never fires
        if self.reader.is_some() {
            self.kill.kill();
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(&mut self, program: &str, args: &[String]) -> Result<(), RunnerError> {
        if self.reader.is_some() {
            return Err(RunnerError::AlreadyStarted);
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if self.config.log_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.envs {
            cmd.env(key, value);
        }

        info!(
            "Spawning process: program={}, args={:?}, working_dir={:?}",
            program, args, self.config.working_dir
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn '{}': {}", program, e);
            RunnerError::Spawn {
                program: program.to_string(),
                source: e,
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(RunnerError::StdoutUnavailable)?;

        if let Some(stderr) = child.stderr.take() {
            let program = program.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("{} stderr: {}", program, line);
                }
            });
        }

        let (tx, rx) = line_channel();
        let kill_rx = self.kill.subscribe();
        let program = program.to_string();

        let reader = tokio::spawn(supervise(child, stdout, tx, kill_rx, program));

        self.reader = Some(reader);
        self.stdout = Some(rx);
        Ok(())
    }

    fn take_stdout(&mut self) -> Option<LineReceiver> {
        self.stdout.take()
    }
}

/// Reader task: pump stdout into the line channel, then reap the child,
/// killing it whenever a kill is requested.
async fn supervise(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    tx: LineSender,
    mut kill_rx: watch::Receiver<bool>,
    program: String,
) -> Option<ExitStatus> {
    let mut kill_sent = false;
    let mut pump = Box::pin(pump_lines(BufReader::new(stdout), tx));

    tokio::select! {
        count = &mut pump => {
            debug!("Output of '{}' closed after {} lines", program, count);
        }
        _ = kill_requested(&mut kill_rx) => {
            kill_sent = true;
            start_kill(&mut child, &program);
        }
    }

    // The line stream is closed before the child is reaped
    drop(pump);

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = kill_requested(&mut kill_rx), if !kill_sent => {
                kill_sent = true;
                start_kill(&mut child, &program);
            }
        }
    };

    match status {
        Ok(status) => {
            if status.success() {
                debug!("'{}' exited successfully", program);
            } else {
                warn!("'{}' exited with status: {}", program, status);
            }
            Some(status)
        }
        Err(e) => {
            error!("Failed to wait for '{}': {}", program, e);
            None
        }
    }
}

/// Resolves once a kill is requested or every handle (runner included) is gone.
async fn kill_requested(kill_rx: &mut watch::Receiver<bool>) {
    let _ = kill_rx.wait_for(|killed| *killed).await;
}

fn start_kill(child: &mut Child, program: &str) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill '{}': {}", program, e);
    } else {
        info!("Killed '{}'", program);
    }
}

/// Forward every line of `reader` to `tx` until EOF, a read error, or the
/// receiver going away. Returns the number of lines delivered.
async fn pump_lines<R>(mut reader: R, tx: LineSender) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut delivered = 0;
    loop {
        match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(None) => break,
            Ok(Some(truncated)) => {
                if truncated {
                    warn!("Stdout line longer than {} bytes truncated", MAX_LINE_BYTES);
                }
                if tx.send(decode_line(&buf)).await.is_err() {
                    debug!("Line receiver dropped, stopping output reader");
                    break;
                }
                delivered += 1;
            }
            Err(e) => {
                warn!("Failed to read process stdout: {}", e);
                break;
            }
        }
    }
    delivered
}

/// Read one line into `buf` without its `\n`, keeping at most `limit` bytes
/// and discarding the rest of the line. Returns `None` at EOF, otherwise
/// whether the line was truncated.
async fn read_line_capped<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut seen_any = false;
    let mut truncated = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(seen_any.then_some(truncated));
        }
        seen_any = true;

        let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (&available[..end], true),
            None => (available, false),
        };
        let room = limit.saturating_sub(buf.len());
        if chunk.len() > room {
            truncated = true;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let used = chunk.len() + usize::from(complete);
        reader.consume(used);
        if complete {
            return Ok(Some(truncated));
        }
    }
}

/// Strip the line terminator (`\n` or `\r\n`) and decode lossily.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect(rx: &mut LineReceiver) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"abc\n"), "abc");
        assert_eq!(decode_line(b"abc\r\n"), "abc");
        assert_eq!(decode_line(b"abc\r"), "abc");
        assert_eq!(decode_line(b"abc"), "abc");
        assert_eq!(decode_line(b"\n"), "");
        assert_eq!(decode_line(b"\xffok\n"), "\u{FFFD}ok");
    }

    #[tokio::test]
    async fn test_read_line_capped() {
        // Tiny buffer so lines span several fill_buf calls
        let mut reader = BufReader::with_capacity(2, &b"abcdef\nxy\n\nlast"[..]);
        let mut buf = Vec::new();

        assert_eq!(read_line_capped(&mut reader, &mut buf, 3).await.unwrap(), Some(true));
        assert_eq!(buf, b"abc");
        assert_eq!(read_line_capped(&mut reader, &mut buf, 3).await.unwrap(), Some(false));
        assert_eq!(buf, b"xy");
        assert_eq!(read_line_capped(&mut reader, &mut buf, 3).await.unwrap(), Some(false));
        assert!(buf.is_empty());
        assert_eq!(read_line_capped(&mut reader, &mut buf, 3).await.unwrap(), Some(true));
        assert_eq!(buf, b"las");
        assert_eq!(read_line_capped(&mut reader, &mut buf, 3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_long_line_is_truncated() {
        let mut runner = ProcessRunner::new();
        runner
            .run("sh", &sh("head -c 70000 /dev/zero | tr '\\0' a; echo; echo tail"))
            .await
            .unwrap();
        let lines = collect(&mut runner.take_stdout().unwrap()).await;

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert!(lines[0].bytes().all(|b| b == b'a'));
        assert_eq!(lines[1], "tail");
    }

    #[tokio::test]
    async fn test_echo_first_line() {
        let mut runner = ProcessRunner::new();
        runner.run("echo", &["Hello".to_string()]).await.unwrap();
        let mut stdout = runner.take_stdout().unwrap();
        assert_eq!(stdout.recv().await, Some("Hello".to_string()));
    }

    #[tokio::test]
    async fn test_lines_arrive_in_order() {
        let mut runner = ProcessRunner::new();
        runner
            .run("sh", &sh("printf 'a\\nb\\r\\nc'"))
            .await
            .unwrap();
        let mut stdout = runner.take_stdout().unwrap();
        assert_eq!(collect(&mut stdout).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stdout_is_taken_once() {
        let mut runner = ProcessRunner::new();
        runner.run("true", &[]).await.unwrap();
        assert!(runner.take_stdout().is_some());
        assert!(runner.take_stdout().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let mut runner = ProcessRunner::new();
        let err = runner
            .run("/nonexistent/cmdtask-missing-binary", &[])
            .await
            .unwrap_err();
        match err {
            RunnerError::Spawn { program, source } => {
                assert_eq!(program, "/nonexistent/cmdtask-missing-binary");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("Expected Spawn error, got {:?}", other),
        }
        assert!(runner.take_stdout().is_none());
    }

    #[tokio::test]
    async fn test_second_run_rejected() {
        let mut runner = ProcessRunner::new();
        runner.run("true", &[]).await.unwrap();
        assert!(matches!(
            runner.run("true", &[]).await,
            Err(RunnerError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_wait_reports_exit_status() {
        let mut runner = ProcessRunner::new();
        runner.run("sh", &sh("echo done; exit 3")).await.unwrap();
        let mut stdout = runner.take_stdout().unwrap();
        assert_eq!(collect(&mut stdout).await, vec!["done"]);

        let status = runner.wait().await.unwrap().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_wait_without_consumer() {
        let mut runner = ProcessRunner::new();
        runner.run("sh", &sh("seq 1 100")).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), runner.wait())
            .await
            .expect("wait should not block on an unread stream")
            .unwrap();
        // Exit code depends on whether seq hit the closed pipe
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn test_working_dir_and_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ProcessConfig::default()
            .with_working_dir(dir.path())
            .with_env("CMDTASK_TEST_VALUE", "42");
        let mut runner = ProcessRunner::with_config(config);
        runner
            .run("sh", &sh("pwd; echo $CMDTASK_TEST_VALUE"))
            .await
            .unwrap();
        let lines = collect(&mut runner.take_stdout().unwrap()).await;

        assert_eq!(lines.len(), 2);
        assert_eq!(
            std::fs::canonicalize(&lines[0]).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(lines[1], "42");
    }

    #[tokio::test]
    async fn test_stderr_is_not_on_stdout() {
        let config = ProcessConfig::default().with_stderr_logging(true);
        let mut runner = ProcessRunner::with_config(config);
        runner
            .run("sh", &sh("echo out; echo err >&2"))
            .await
            .unwrap();
        let lines = collect(&mut runner.take_stdout().unwrap()).await;
        assert_eq!(lines, vec!["out"]);
    }

    #[tokio::test]
    async fn test_kill_closes_stream() {
        let mut runner = ProcessRunner::new();
        runner.run("sleep", &["30".to_string()]).await.unwrap();
        let mut stdout = runner.take_stdout().unwrap();

        runner.kill();
        let next = tokio::time::timeout(Duration::from_secs(10), stdout.recv())
            .await
            .expect("stream should close after kill");
        assert_eq!(next, None);

        let status = runner.wait().await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_kill_before_spawn_latches() {
        let mut runner = ProcessRunner::new();
        let handle = runner.kill_handle();
        handle.kill();
        assert!(handle.is_killed());

        runner.run("sleep", &["30".to_string()]).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), runner.wait())
            .await
            .expect("latched kill should stop the process")
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_drop_kills_child() {
        let mut runner = ProcessRunner::new();
        runner
            .run("sh", &sh("echo $$; exec sleep 30"))
            .await
            .unwrap();
        let mut stdout = runner.take_stdout().unwrap();
        let pid = stdout.recv().await.unwrap();
        let proc_dir = std::path::PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(proc_dir.exists());

        drop(stdout);
        drop(runner);

        let gone = tokio::time::timeout(Duration::from_secs(10), async {
            while proc_dir.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "process {} outlived its runner", pid);
    }
}
