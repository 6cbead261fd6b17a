//! Running build scripts as child processes.
//!
//! Output from the child's stdout and stderr is merged and forwarded line by
//! line to a writer with an indent. While the child runs, termination signals
//! sent to this process are caught by an [`InterruptGuard`] and passed on to
//! the child; once the child is gone the caller re-delivers them to itself
//! with [`reraise`].

use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, IoContext, Result};

/// Signals caught and passed on to the child while it runs.
pub const FORWARDED_SIGNALS: &[libc::c_int] =
    &[libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGQUIT];

/// How often the output loop checks for a caught signal when the child is
/// quiet.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ExitFailure(i32),
    SignalTerminated(i32),
}

impl Outcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => Outcome::Success,
            (Some(code), _) => Outcome::ExitFailure(code),
            (None, Some(signal)) => Outcome::SignalTerminated(signal),
            // Neither code nor signal: treat as a generic failure.
            (None, None) => Outcome::ExitFailure(1),
        }
    }
}

/// Name of a signal number, e.g. `SIGKILL` for 9.
pub fn signal_name(signal: i32) -> Option<&'static str> {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        _ => return None,
    };
    Some(name)
}

/// Spawns commands and streams their output.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    indent: String,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new("    ")
    }
}

impl ProcessRunner {
    pub fn new(indent: impl Into<String>) -> Self {
        Self {
            indent: indent.into(),
        }
    }

    /// Run `program` with `args` in `work_dir`, forwarding merged output to
    /// `out`, and block until it exits.
    pub fn run<I, S, W>(
        &self,
        program: &Path,
        args: I,
        work_dir: &Path,
        out: &mut W,
    ) -> Result<Outcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
        W: Write,
    {
        self.run_with(program, args, work_dir, out, None)
    }

    /// Like [`ProcessRunner::run`], but signals caught by `guard` while the
    /// child runs are passed on to the child.
    pub fn run_guarded<I, S, W>(
        &self,
        guard: &InterruptGuard,
        program: &Path,
        args: I,
        work_dir: &Path,
        out: &mut W,
    ) -> Result<Outcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
        W: Write,
    {
        self.run_with(program, args, work_dir, out, Some(guard))
    }

    fn run_with<I, S, W>(
        &self,
        program: &Path,
        args: I,
        work_dir: &Path,
        out: &mut W,
        guard: Option<&InterruptGuard>,
    ) -> Result<Outcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
        W: Write,
    {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .io_context(|| format!("spawning '{}'", program.display()))?;
        let pid = child.id() as libc::pid_t;
        debug!("spawned {} (pid {pid})", program.display());

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        // Ends once both pipes are closed. A failed write kills the child
        // and the rest of its output is discarded, so the child is always
        // reaped before returning.
        let mut write_error = None;
        let mut forwarded = 0;
        loop {
            match rx.recv_timeout(SIGNAL_POLL_INTERVAL) {
                Ok(line) => {
                    if write_error.is_none() {
                        if let Err(err) = writeln!(out, "{}{}", self.indent, line) {
                            warn!(
                                "build output closed ({err}); stopping {}",
                                program.display()
                            );
                            let _ = child.kill();
                            write_error = Some(err);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if let Some(guard) = guard {
                forward_caught_signal(guard, pid, &mut forwarded);
            }
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child
            .wait()
            .io_context(|| format!("waiting for '{}'", program.display()))?;
        if let Some(err) = write_error {
            return Err(Error::io("writing build output", err));
        }
        out.flush().io_context(|| "flushing build output")?;
        Ok(Outcome::from_status(status))
    }
}

/// Pass the signal caught by `guard`, if any, on to `pid` once.
fn forward_caught_signal(guard: &InterruptGuard, pid: libc::pid_t, forwarded: &mut i32) {
    let Some(signal) = guard.pending() else {
        return;
    };
    if signal == *forwarded {
        return;
    }
    debug!("forwarding signal {signal} to pid {pid}");
    // SAFETY: plain kill(2) on the child we spawned and have not reaped yet.
    unsafe {
        libc::kill(pid, signal);
    }
    *forwarded = signal;
}

fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Held for as long as an [`InterruptGuard`] is live. Signal dispositions
/// and [`PENDING_SIGNAL`] are process-wide, so only one guard may own them.
static GUARD_LOCK: Mutex<()> = Mutex::new(());

extern "C" fn record_signal(signal: libc::c_int) {
    PENDING_SIGNAL.store(signal, Ordering::SeqCst);
}

/// Catches termination signals for the lifetime of the guard.
///
/// A caught signal is recorded instead of killing this process, and
/// [`ProcessRunner::run_guarded`] passes it on to its child. At most one guard is
/// live at a time; [`InterruptGuard::install`] blocks until any other guard
/// in the process is dropped. The previous dispositions are restored on drop.
pub struct InterruptGuard {
    previous: Vec<(libc::c_int, libc::sigaction)>,
    _lock: MutexGuard<'static, ()>,
}

impl InterruptGuard {
    pub fn install() -> Result<Self> {
        let lock = GUARD_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        PENDING_SIGNAL.store(0, Ordering::SeqCst);
        let mut guard = Self {
            previous: Vec::with_capacity(FORWARDED_SIGNALS.len()),
            _lock: lock,
        };
        for &signal in FORWARDED_SIGNALS {
            // SAFETY: the handler only performs an atomic store, which is
            // async-signal-safe; both sigaction structs are fully initialized.
            let old = unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = record_signal as extern "C" fn(libc::c_int) as usize;
                action.sa_flags = libc::SA_RESTART;
                libc::sigemptyset(&mut action.sa_mask);
                let mut old: libc::sigaction = std::mem::zeroed();
                if libc::sigaction(signal, &action, &mut old) != 0 {
                    // Dropping `guard` restores whatever was already replaced.
                    return Err(std::io::Error::last_os_error())
                        .io_context(|| format!("installing handler for signal {signal}"));
                }
                old
            };
            guard.previous.push((signal, old));
        }
        Ok(guard)
    }

    /// Signal received since the guard was installed, if any.
    pub fn pending(&self) -> Option<i32> {
        match PENDING_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        for (signal, old) in self.previous.drain(..) {
            // SAFETY: restoring a disposition previously returned by sigaction.
            unsafe {
                libc::sigaction(signal, &old, std::ptr::null_mut());
            }
        }
        PENDING_SIGNAL.store(0, Ordering::SeqCst);
    }
}

/// Restore the default action for `signal` and raise it on this process, so
/// it terminates the way a shell expects rather than with an exit code.
pub fn reraise(signal: i32) {
    // SAFETY: plain libc calls with a valid signal number.
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("script.sh");
        fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
        path
    }

    fn run_bash(body: &str) -> (Outcome, String) {
        let temp = TempDir::new().unwrap();
        let path = script(temp.path(), body);
        let mut out = Vec::new();
        let outcome = ProcessRunner::new("> ")
            .run(Path::new("/bin/bash"), [path.as_os_str()], temp.path(), &mut out)
            .unwrap();
        (outcome, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_success() {
        let (outcome, _) = run_bash("exit 0");
        assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn test_exit_failure_keeps_code() {
        let (outcome, _) = run_bash("exit 3");
        assert_eq!(outcome, Outcome::ExitFailure(3));
    }

    #[test]
    fn test_signal_terminated() {
        let (outcome, _) = run_bash("kill -9 $$");
        assert_eq!(outcome, Outcome::SignalTerminated(9));
    }

    #[test]
    fn test_output_is_merged_and_indented() {
        let (outcome, out) = run_bash("echo to-stdout\necho to-stderr >&2");
        assert_eq!(outcome, Outcome::Success);
        assert!(out.contains("> to-stdout\n"), "{out}");
        assert!(out.contains("> to-stderr\n"), "{out}");
    }

    #[test]
    fn test_unterminated_last_line_is_forwarded() {
        let (_, out) = run_bash("printf 'no newline'");
        assert_eq!(out, "> no newline\n");
    }

    #[test]
    fn test_runs_in_work_dir() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let path = script(temp.path(), "pwd");
        let mut out = Vec::new();
        ProcessRunner::new("")
            .run(Path::new("/bin/bash"), [path.as_os_str()], &work, &mut out)
            .unwrap();
        let printed = String::from_utf8(out).unwrap();
        assert_eq!(
            fs::canonicalize(printed.trim()).unwrap(),
            fs::canonicalize(&work).unwrap()
        );
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut out = Vec::new();
        let result = ProcessRunner::default().run(
            &temp.path().join("nope"),
            std::iter::empty::<&str>(),
            temp.path(),
            &mut out,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_guard_starts_without_pending_signal() {
        let guard = InterruptGuard::install().unwrap();
        assert_eq!(guard.pending(), None);
    }

    /// Accepts nothing, like stdout piped into a reader that has exited.
    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_error_stops_child_before_returning() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("after");
        let path = script(temp.path(), "echo first\nsleep 1\ntouch \"$1\"");

        let result = ProcessRunner::default().run(
            Path::new("/bin/bash"),
            [path.as_os_str(), marker.as_os_str()],
            temp.path(),
            &mut ClosedPipe,
        );

        let err = result.unwrap_err();
        assert!(err.to_string().contains("writing build output"), "{err}");
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "child kept running after run returned");
    }

    #[test]
    fn test_guarded_run_forwards_caught_signal() {
        let temp = TempDir::new().unwrap();
        let path = script(
            temp.path(),
            "kill -TERM $PPID\nsleep 2\necho still-running",
        );
        let guard = InterruptGuard::install().unwrap();
        let mut out = Vec::new();

        let outcome = ProcessRunner::new("")
            .run_guarded(
                &guard,
                Path::new("/bin/bash"),
                [path.as_os_str()],
                temp.path(),
                &mut out,
            )
            .unwrap();

        assert_eq!(guard.pending(), Some(libc::SIGTERM));
        drop(guard);
        assert_eq!(outcome, Outcome::SignalTerminated(libc::SIGTERM));
        let out = String::from_utf8(out).unwrap();
        assert!(!out.contains("still-running"), "{out}");
    }

    #[test]
    fn test_only_one_guard_is_live() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let first = InterruptGuard::install().unwrap();
        let installed = Arc::new(AtomicBool::new(false));
        let second = {
            let installed = Arc::clone(&installed);
            thread::spawn(move || {
                let guard = InterruptGuard::install().unwrap();
                installed.store(true, Ordering::SeqCst);
                guard.pending()
            })
        };

        thread::sleep(Duration::from_millis(200));
        assert!(!installed.load(Ordering::SeqCst));
        drop(first);
        assert_eq!(second.join().unwrap(), None);
        assert!(installed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(9), Some("SIGKILL"));
        assert_eq!(signal_name(libc::SIGINT), Some("SIGINT"));
        assert_eq!(signal_name(0), None);
    }
}
