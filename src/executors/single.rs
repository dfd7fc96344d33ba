use crate::error::ExiferError;
use log::warn;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs one single-shot worker invocation.
///
/// Arguments are fed through stdin as one stream, the same argfile framing as
/// the persistent channel minus the execute command; the worker runs the
/// command once it sees EOF. The process must complete within `timeout` or it
/// is killed.
pub fn execute(
    executable: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String, ExiferError> {
    let mut child = Command::new(executable)
        .args(["-charset", "utf8", "-@", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ExiferError::Startup {
            executable: executable.to_string(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = feed_args(&mut stdin, args) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err.into());
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("Failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("Failed to capture stderr"))?;

    let stdout_handle = thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let mut reader = stdout;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    });
    let stderr_handle = thread::spawn(move || -> std::io::Result<String> {
        let mut reader = stderr;
        let mut buf = String::new();
        reader.read_to_string(&mut buf)?;
        Ok(buf)
    });

    let status = wait_with_deadline(&mut child, executable, timeout)?;

    let stdout_bytes = stdout_handle
        .join()
        .map_err(|_| std::io::Error::other("stdout reader thread panicked"))??;
    let stderr_text = stderr_handle
        .join()
        .map_err(|_| std::io::Error::other("stderr reader thread panicked"))??;

    for line in stderr_text.lines() {
        if line.contains("Error:") {
            return Err(ExiferError::Worker {
                message: line.to_string(),
                command: args.join(" "),
            });
        } else if line.contains("Warning:") {
            warn!("worker '{executable}': {line}");
        }
    }

    if !status.success() {
        return Err(ExiferError::Worker {
            message: format!("worker exited with status {status}"),
            command: args.join(" "),
        });
    }

    let output = String::from_utf8(stdout_bytes)?;
    Ok(output.trim_end_matches(['\r', '\n']).to_string())
}

/// Variant of [`execute`] for argument lists whose values embed line breaks.
///
/// Each `-Tag=value` argument with a line break in the value is rewritten to
/// the `-Tag<=file` redirection form, with the value written to a private
/// temp file. The temp files live until the invocation returns and are
/// removed on drop, success or not.
pub fn execute_rewriting_multiline(
    executable: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String, ExiferError> {
    let (rewritten, _redirect_files) = rewrite_multiline_args(args)?;
    execute(executable, &rewritten, timeout)
}

fn feed_args(stdin: &mut std::process::ChildStdin, args: &[String]) -> std::io::Result<()> {
    for arg in args {
        writeln!(stdin, "{arg}")?;
    }
    stdin.flush()
}

fn wait_with_deadline(
    child: &mut Child,
    executable: &str,
    timeout: Duration,
) -> Result<ExitStatus, ExiferError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExiferError::Timeout {
                executable: executable.to_string(),
            });
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn rewrite_multiline_args(
    args: &[String],
) -> Result<(Vec<String>, Vec<NamedTempFile>), ExiferError> {
    let mut rewritten = Vec::with_capacity(args.len());
    let mut files = Vec::new();

    for arg in args {
        match split_tag_assignment(arg) {
            Some((name, value)) if value.contains('\n') => {
                let mut file = NamedTempFile::new()?;
                file.write_all(value.as_bytes())?;
                file.flush()?;
                rewritten.push(format!("{}<={}", name, file.path().display()));
                files.push(file);
            }
            _ => rewritten.push(arg.clone()),
        }
    }

    Ok((rewritten, files))
}

/// Splits `-Tag=value` into (`-Tag`, value). Only assignment-form arguments
/// qualify; bare flags and file paths pass through untouched.
fn split_tag_assignment(arg: &str) -> Option<(&str, &str)> {
    if !arg.starts_with('-') {
        return None;
    }
    let eq = arg.find('=')?;
    Some((&arg[..eq], &arg[eq + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_helpers::{
        write_failing_worker, write_stub_worker, StubBehavior,
    };
    use assert_matches::assert_matches;
    use std::fs;

    #[test]
    fn captures_output_of_a_single_shot_run() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_worker(dir.path(), "worker", "one-shot ok", StubBehavior::Normal);

        let output = execute(
            stub.to_str().unwrap(),
            &["-json".into(), "a.tif".into()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(output, "one-shot ok");
    }

    #[test]
    fn nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_failing_worker(dir.path(), "worker");

        let result = execute(
            stub.to_str().unwrap(),
            &["a.tif".into()],
            Duration::from_secs(5),
        );
        assert_matches!(result, Err(ExiferError::Worker { .. }));
    }

    #[test]
    fn slow_single_shot_run_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_worker(dir.path(), "worker", "late", StubBehavior::Normal);

        // The stay-open loop never sees EOF here because the stub blocks in
        // its sleep before reading further input.
        let result = execute(
            stub.to_str().unwrap(),
            &["-SLOW".into(), "-execute".into()],
            Duration::from_millis(200),
        );
        assert_matches!(result, Err(ExiferError::Timeout { .. }));
    }

    #[test]
    fn multiline_values_are_redirected_through_temp_files() {
        let args = vec![
            "-overwrite_original".to_string(),
            "-XMP-dc:Description=line one\nline two".to_string(),
            "-XMP-dc:Title=plain".to_string(),
            "a.tif".to_string(),
        ];

        let (rewritten, files) = rewrite_multiline_args(&args).unwrap();
        assert_eq!(rewritten.len(), 4);
        assert_eq!(rewritten[0], "-overwrite_original");
        assert_eq!(rewritten[2], "-XMP-dc:Title=plain");
        assert_eq!(rewritten[3], "a.tif");
        assert_eq!(files.len(), 1);

        let redirect = &rewritten[1];
        let path = redirect
            .strip_prefix("-XMP-dc:Description<=")
            .expect("redirection form");
        assert_eq!(fs::read_to_string(path).unwrap(), "line one\nline two");

        // Cleanup is tied to the handles, not to success.
        let tmp_path = files[0].path().to_path_buf();
        drop(files);
        assert!(!tmp_path.exists());
    }

    #[test]
    fn append_form_arguments_are_rewritten_too() {
        let args = vec!["-XMP-xmpMM:History+={action=edited,\nchanged=x}".to_string()];
        let (rewritten, files) = rewrite_multiline_args(&args).unwrap();
        assert!(rewritten[0].starts_with("-XMP-xmpMM:History+<="));
        assert_eq!(files.len(), 1);
    }
}
