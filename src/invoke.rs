use std::{
    ffi::OsString,
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context as _;

use crate::error::{ProcessErrorKind, TexcastError, TexcastResult};

/// Injected locations of the external toolchain binaries.
///
/// Defaults resolve bare names on PATH; hosting environments override these
/// with absolute paths.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
    pub latex: PathBuf,
    pub dvisvgm: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            latex: PathBuf::from("latex"),
            dvisvgm: PathBuf::from("dvisvgm"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

/// Check whether a tool binary responds to `--version`.
pub fn is_tool_available(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Cooperative cancellation flag shared between a caller and an in-flight
/// render. Cancelling terminates the currently running subprocess.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resource bounds applied to every subprocess invocation.
#[derive(Clone, Copy, Debug)]
pub struct InvokeLimits {
    /// Hard wall-clock limit; the subprocess is killed when exceeded.
    pub timeout: Duration,
    /// Cap on captured bytes per stream; output beyond this is discarded and
    /// the result is flagged truncated.
    pub output_cap: usize,
}

impl Default for InvokeLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            output_cap: 2 * 1024 * 1024,
        }
    }
}

/// Captured result of a completed subprocess.
///
/// A nonzero exit is not an error at this level; stages classify exit status
/// and log contents themselves.
#[derive(Debug)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined stdout + stderr as lossy UTF-8, for log classification.
    pub fn log_lossy(&self) -> String {
        let mut s = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !s.is_empty() {
                s.push('\n');
            }
            s.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        s
    }
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Run one external tool to completion inside `cwd`.
///
/// Fails with `ProcessError{SpawnFailure}` when the binary cannot start,
/// `ProcessError{Timeout}` when the wall clock expires (the child is killed
/// first), `ProcessError{KilledBySignal}` when the child dies without an exit
/// code, and `Cancelled` when `cancel` fires mid-run. Never retries.
pub fn run_tool(
    program: &Path,
    args: &[OsString],
    cwd: &Path,
    limits: &InvokeLimits,
    cancel: &CancelToken,
) -> TexcastResult<ToolOutput> {
    let name = program
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());

    if cancel.is_cancelled() {
        return Err(TexcastError::cancelled(format!(
            "cancelled before invoking {name}"
        )));
    }

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            TexcastError::process(
                ProcessErrorKind::SpawnFailure,
                format!("failed to spawn {name}: {e}"),
            )
        })?;

    // Readers run on their own threads so a chatty tool can never fill the
    // pipe and deadlock against our wait loop.
    let out_reader = spawn_capped_reader(child.stdout.take(), limits.output_cap);
    let err_reader = spawn_capped_reader(child.stderr.take(), limits.output_cap);

    let deadline = Instant::now() + limits.timeout;
    let status = loop {
        if cancel.is_cancelled() {
            kill_and_reap(&mut child);
            join_reader(out_reader);
            join_reader(err_reader);
            return Err(TexcastError::cancelled(format!("{name} cancelled by caller")));
        }

        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    kill_and_reap(&mut child);
                    join_reader(out_reader);
                    join_reader(err_reader);
                    tracing::warn!(tool = %name, timeout_secs = limits.timeout.as_secs(), "tool timed out");
                    return Err(TexcastError::process(
                        ProcessErrorKind::Timeout,
                        format!("{name} exceeded {:?} wall-clock limit", limits.timeout),
                    ));
                }
                std::thread::sleep(WAIT_POLL_INTERVAL);
            }
            Err(e) => {
                kill_and_reap(&mut child);
                join_reader(out_reader);
                join_reader(err_reader);
                return Err(TexcastError::Other(
                    anyhow::Error::new(e).context(format!("wait on {name}")),
                ));
            }
        }
    };

    let (stdout, out_trunc) = join_reader(out_reader);
    let (stderr, err_trunc) = join_reader(err_reader);

    let Some(exit_code) = status.code() else {
        return Err(TexcastError::process(
            ProcessErrorKind::KilledBySignal,
            format!("{name} was killed by a signal"),
        ));
    };

    tracing::debug!(tool = %name, exit_code, "tool finished");
    Ok(ToolOutput {
        exit_code,
        stdout,
        stderr,
        truncated: out_trunc || err_trunc,
    })
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

type ReaderHandle = Option<std::thread::JoinHandle<(Vec<u8>, bool)>>;

fn spawn_capped_reader<R: Read + Send + 'static>(stream: Option<R>, cap: usize) -> ReaderHandle {
    let mut stream = stream?;
    Some(std::thread::spawn(move || {
        let mut buf = Vec::new();
        let mut truncated = false;
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let room = cap.saturating_sub(buf.len());
                    if room < n {
                        truncated = true;
                    }
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                    // Keep draining past the cap so the child never blocks on
                    // a full pipe.
                }
                Err(_) => break,
            }
        }
        (buf, truncated)
    }))
}

fn join_reader(handle: ReaderHandle) -> (Vec<u8>, bool) {
    match handle {
        Some(h) => h.join().unwrap_or((Vec::new(), false)),
        None => (Vec::new(), false),
    }
}

/// Create a private, disposable working directory for one invocation.
///
/// The directory and its contents are removed when the handle drops, on every
/// exit path.
pub fn scratch_dir() -> TexcastResult<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("texcast-")
        .tempdir()
        .context("create scratch directory")
        .map_err(TexcastError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn captures_stdout_of_successful_tool() {
        let dir = scratch_dir().unwrap();
        let out = run_tool(
            Path::new("sh"),
            &sh(&["-c", "printf hello"]),
            dir.path(),
            &InvokeLimits::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, b"hello");
        assert!(!out.truncated);
    }

    #[test]
    fn nonzero_exit_is_not_a_process_error() {
        let dir = scratch_dir().unwrap();
        let out = run_tool(
            Path::new("sh"),
            &sh(&["-c", "echo oops >&2; exit 3"]),
            dir.path(),
            &InvokeLimits::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.log_lossy().contains("oops"));
    }

    #[test]
    fn missing_binary_is_spawn_failure() {
        let dir = scratch_dir().unwrap();
        let err = run_tool(
            Path::new("/nonexistent/texcast-no-such-tool"),
            &[],
            dir.path(),
            &InvokeLimits::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TexcastError::Process {
                kind: ProcessErrorKind::SpawnFailure,
                ..
            }
        ));
    }

    #[test]
    fn timeout_kills_the_child() {
        let dir = scratch_dir().unwrap();
        let limits = InvokeLimits {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let started = Instant::now();
        let err = run_tool(
            Path::new("sh"),
            &sh(&["-c", "sleep 30"]),
            dir.path(),
            &limits,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TexcastError::Process {
                kind: ProcessErrorKind::Timeout,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn pre_cancelled_token_short_circuits() {
        let dir = scratch_dir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_tool(
            Path::new("sh"),
            &sh(&["-c", "sleep 30"]),
            dir.path(),
            &InvokeLimits::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, TexcastError::Cancelled(_)));
    }

    #[test]
    fn output_beyond_cap_is_truncated_and_flagged() {
        let dir = scratch_dir().unwrap();
        let limits = InvokeLimits {
            output_cap: 1024,
            ..Default::default()
        };
        let out = run_tool(
            Path::new("sh"),
            &sh(&["-c", "i=0; while [ $i -lt 1000 ]; do echo 0123456789abcdef; i=$((i+1)); done"]),
            dir.path(),
            &limits,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(out.truncated);
        assert_eq!(out.stdout.len(), 1024);
    }

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let dir = scratch_dir().unwrap();
        let path = dir.path().to_path_buf();
        std::fs::write(path.join("leftover.tmp"), b"x").unwrap();
        drop(dir);
        assert!(!path.exists());
    }
}
