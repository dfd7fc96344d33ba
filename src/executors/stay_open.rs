use crate::error::ExiferError;
use log::{debug, warn};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

const READY_SENTINEL: &str = "{ready}";
const EXECUTE_COMMAND: &str = "-execute";
const STDERR_POLL_INTERVAL: Duration = Duration::from_millis(5);
const STDERR_POLL_TIMEOUT: Duration = Duration::from_millis(50);
const GRACEFUL_EXIT_WAIT: Duration = Duration::from_millis(500);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A persistent worker process speaking the stay-open line protocol.
///
/// Stdout and stderr are pumped by reader threads onto channels, so the
/// request cycle can receive lines against a deadline instead of blocking on
/// the pipe directly. The deadline is enforced at the receive site and the
/// process is killed only after it has actually passed, so a response that
/// arrives in time never races the kill.
#[derive(Debug)]
pub struct WorkerProcess {
    executable: String,
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout_rx: Receiver<String>,
    stderr_rx: Receiver<String>,
}

impl WorkerProcess {
    /// Launches the worker in stay-open mode.
    ///
    /// The charset flag must precede `-@ -`: the worker decodes the argument
    /// stream itself in that charset.
    pub fn spawn(executable: &str) -> Result<Self, ExiferError> {
        let mut child = Command::new(executable)
            .args(["-stay_open", "True", "-charset", "utf8", "-@", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExiferError::Startup {
                executable: executable.to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture stderr"))?;

        let (stdout_tx, stdout_rx) = mpsc::channel();
        let stdout_reader = BufReader::new(stdout);
        thread::spawn(move || {
            for line in stdout_reader.lines().map_while(Result::ok) {
                if stdout_tx.send(line).is_err() {
                    break;
                }
            }
        });

        let (stderr_tx, stderr_rx) = mpsc::channel();
        let stderr_reader = BufReader::new(stderr);
        thread::spawn(move || {
            for line in stderr_reader.lines().map_while(Result::ok) {
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        debug!("spawned worker '{}' (pid {})", executable, child.id());

        Ok(Self {
            executable: executable.to_string(),
            child,
            stdin: BufWriter::new(stdin),
            stdout_rx,
            stderr_rx,
        })
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// One request/response cycle: each argument on its own line, then the
    /// execute command, then stdout lines collected until the ready sentinel.
    pub fn execute(&mut self, args: &[String], timeout: Duration) -> Result<String, ExiferError> {
        // Discard stale stderr from a previous command so errors are not
        // misattributed.
        while self.stderr_rx.try_recv().is_ok() {}

        if let Err(err) = self.send_request(args) {
            if self.is_alive() {
                return Err(err.into());
            }
            // The write failed because the worker is already gone.
            let stderr = self.drain_stderr().unwrap_or_default().join("\n");
            return Err(ExiferError::ProcessTerminated {
                executable: self.executable.clone(),
                stderr,
            });
        }

        let body = self.read_until_ready(timeout)?;

        let stderr_lines = self.drain_stderr()?;
        if !stderr_lines.is_empty() {
            let command = args.join(" ");
            for line in &stderr_lines {
                if line.contains("Error:") {
                    return Err(ExiferError::Worker {
                        message: line.clone(),
                        command,
                    });
                } else if line.contains("Warning:") {
                    warn!("worker '{}': {}", self.executable, line);
                }
            }
        }

        Ok(body)
    }

    fn send_request(&mut self, args: &[String]) -> std::io::Result<()> {
        for arg in args {
            writeln!(self.stdin, "{arg}")?;
        }
        writeln!(self.stdin, "{EXECUTE_COMMAND}")?;
        self.stdin.flush()
    }

    fn read_until_ready(&mut self, timeout: Duration) -> Result<String, ExiferError> {
        let deadline = Instant::now() + timeout;
        let mut body = String::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.stdout_rx.recv_timeout(remaining) {
                Ok(line) if line == READY_SENTINEL => return Ok(body),
                Ok(line) => {
                    if !body.is_empty() {
                        body.push('\n');
                    }
                    body.push_str(&line);
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("worker '{}' exceeded its deadline, killing", self.executable);
                    self.kill();
                    return Err(ExiferError::Timeout {
                        executable: self.executable.clone(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // EOF before the sentinel: the worker died mid-call.
                    // Partial output is never returned as valid.
                    let stderr = self.drain_stderr().unwrap_or_default().join("\n");
                    let _ = self.child.wait();
                    return Err(ExiferError::ProcessTerminated {
                        executable: self.executable.clone(),
                        stderr,
                    });
                }
            }
        }
    }

    /// Drains the stderr channel, collecting recent error messages.
    ///
    /// Messages can trail the stdout response slightly, so after the quick
    /// drain we poll briefly and assume errors arrive in one burst.
    fn drain_stderr(&mut self) -> Result<Vec<String>, ExiferError> {
        let mut lines = Vec::new();
        let start = Instant::now();

        loop {
            match self.stderr_rx.try_recv() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(ExiferError::StderrDisconnected),
            }
        }

        while start.elapsed() < STDERR_POLL_TIMEOUT {
            match self.stderr_rx.try_recv() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty) => {
                    if !lines.is_empty() {
                        break;
                    }
                    thread::sleep(STDERR_POLL_INTERVAL);
                }
                Err(TryRecvError::Disconnected) => {
                    if lines.is_empty() {
                        return Err(ExiferError::StderrDisconnected);
                    }
                    break;
                }
            }
        }

        Ok(lines)
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Asks the worker to leave stay-open mode; force-kills it if it lingers.
    pub fn stop(&mut self) {
        let _ = writeln!(self.stdin, "-stay_open");
        let _ = writeln!(self.stdin, "False");
        let _ = self.stdin.flush();

        let start = Instant::now();
        while start.elapsed() < GRACEFUL_EXIT_WAIT {
            if !self.is_alive() {
                return;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        warn!("worker '{}' did not exit gracefully, killing", self.executable);
        self.kill();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_helpers::{write_stub_worker, StubBehavior};
    use assert_matches::assert_matches;

    const RESPONSE: &str = r#"[{"SourceFile":"a.tif","XMP-dc:Title":"hello"}]"#;

    #[test]
    fn collects_body_up_to_ready_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_worker(dir.path(), "worker", RESPONSE, StubBehavior::Normal);

        let mut worker = WorkerProcess::spawn(stub.to_str().unwrap()).unwrap();
        let body = worker
            .execute(&["-json".into(), "a.tif".into()], Duration::from_secs(5))
            .unwrap();
        assert_eq!(body, RESPONSE);
        assert!(worker.is_alive());

        // The sentinel was consumed; a second cycle starts clean.
        let body2 = worker
            .execute(&["-json".into(), "a.tif".into()], Duration::from_secs(5))
            .unwrap();
        assert_eq!(body2, RESPONSE);
    }

    #[test]
    fn deadline_kills_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_worker(dir.path(), "worker", RESPONSE, StubBehavior::Normal);

        let mut worker = WorkerProcess::spawn(stub.to_str().unwrap()).unwrap();
        let result = worker.execute(&["-SLOW".into()], Duration::from_millis(200));
        assert_matches!(result, Err(ExiferError::Timeout { .. }));
        assert!(!worker.is_alive());
    }

    #[test]
    fn death_before_sentinel_is_a_desync() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_worker(dir.path(), "worker", RESPONSE, StubBehavior::CrashOnExecute);

        let mut worker = WorkerProcess::spawn(stub.to_str().unwrap()).unwrap();
        let result = worker.execute(&["a.tif".into()], Duration::from_secs(5));
        assert_matches!(result, Err(ExiferError::ProcessTerminated { .. }));
    }

    #[test]
    fn missing_executable_is_a_startup_failure() {
        let result = WorkerProcess::spawn("definitely-not-a-real-worker-binary");
        assert_matches!(result, Err(ExiferError::Startup { .. }));
    }
}
