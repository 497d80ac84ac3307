//! Child processes with timeouts, cancellation and bounded output.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::cancel::CancelToken;

/// Upper bound on a single blocking wait, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(200);
const READER_GRACE: Duration = Duration::from_secs(2);

/// Bytes kept from one output stream: a head, a tail, and a count of what
/// was dropped between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub head: Vec<u8>,
    pub tail: Vec<u8>,
    pub omitted: usize,
}

impl Captured {
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Head and tail joined, with a marker where bytes were dropped.
    pub fn to_string_lossy(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.head).into_owned();
        if self.omitted > 0 {
            out.push_str(&format!("\n[... {} bytes omitted ...]\n", self.omitted));
        }
        out.push_str(&String::from_utf8_lossy(&self.tail));
        out
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    /// Exit code, or `None` when the child was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    /// Leading bytes of each stream kept in memory.
    pub head_bytes: usize,
    /// Trailing bytes of each stream kept in memory. The middle is drained.
    pub tail_bytes: usize,
}

/// Run a command to completion, killing it on timeout or cancellation.
///
/// Output is read concurrently while the child runs, so a chatty child can
/// never deadlock on a full pipe.
#[instrument(
    skip_all,
    fields(
        timeout_secs = limits.timeout.as_secs(),
        head_bytes = limits.head_bytes,
        tail_bytes = limits.tail_bytes
    )
)]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = StreamReader::spawn(stdout, limits);
    let stderr_reader = StreamReader::spawn(stderr, limits);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        match child_stdin.write_all(input) {
            Ok(()) => {}
            // The child may exit without reading its input.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                warn!("child closed stdin early");
            }
            Err(e) => return Err(e).context("write stdin"),
        }
    }

    let (status, timed_out, cancelled) = wait_bounded(&mut child, limits.timeout, cancel)?;

    // A killed child can leave grandchildren holding the pipes open, so the
    // readers only get a grace period in that case.
    let grace = (timed_out || cancelled).then_some(READER_GRACE);
    let stdout = stdout_reader.finish(grace).context("join stdout")?;
    let stderr = stderr_reader.finish(grace).context("join stderr")?;

    if stdout.omitted > 0 || stderr.omitted > 0 {
        warn!(
            stdout_omitted = stdout.omitted,
            stderr_omitted = stderr.omitted,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
        cancelled,
    })
}

fn wait_bounded(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(ExitStatus, bool, bool)> {
    let started = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if let Some(status) = child
            .wait_timeout(remaining.min(WAIT_SLICE))
            .context("wait for command")?
        {
            return Ok((status, false, false));
        }
        let cancelled = cancel.is_cancelled();
        let timed_out = started.elapsed() >= timeout;
        if cancelled || timed_out {
            warn!(
                timeout_secs = timeout.as_secs(),
                cancelled, "stopping command, killing"
            );
            child.kill().context("kill command")?;
            let status = child.wait().context("wait command after kill")?;
            return Ok((status, timed_out && !cancelled, cancelled));
        }
    }
}

#[derive(Default)]
struct StreamState {
    captured: Captured,
    tail: VecDeque<u8>,
}

impl StreamState {
    fn push(&mut self, mut bytes: &[u8], limits: ProcessLimits) {
        let room = limits.head_bytes.saturating_sub(self.captured.head.len());
        if room > 0 {
            let keep = bytes.len().min(room);
            self.captured.head.extend_from_slice(&bytes[..keep]);
            bytes = &bytes[keep..];
        }
        self.tail.extend(bytes);
        if self.tail.len() > limits.tail_bytes {
            let excess = self.tail.len() - limits.tail_bytes;
            self.tail.drain(..excess);
            self.captured.omitted += excess;
        }
    }

    fn snapshot(&self) -> Captured {
        let mut captured = self.captured.clone();
        captured.tail = self.tail.iter().copied().collect();
        captured
    }
}

struct StreamReader {
    state: Arc<Mutex<StreamState>>,
    handle: thread::JoinHandle<Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(mut reader: R, limits: ProcessLimits) -> Self {
        let state = Arc::new(Mutex::new(StreamState::default()));
        let shared = Arc::clone(&state);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                let n = reader.read(&mut chunk).context("read output")?;
                if n == 0 {
                    return Ok(());
                }
                shared
                    .lock()
                    .map_err(|_| anyhow!("output buffer poisoned"))?
                    .push(&chunk[..n], limits);
            }
        });
        Self { state, handle }
    }

    /// Collect what was read. With a grace period, gives up waiting for EOF
    /// after it and returns what has arrived so far.
    fn finish(self, grace: Option<Duration>) -> Result<Captured> {
        let Self { state, handle } = self;
        if let Some(grace) = grace {
            let deadline = Instant::now() + grace;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if !handle.is_finished() {
                warn!("output pipe still open after kill, detaching reader");
                return snapshot(&state);
            }
        }
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("output reader thread panicked")),
        }
        snapshot(&state)
    }
}

fn snapshot(state: &Mutex<StreamState>) -> Result<Captured> {
    let state = state
        .lock()
        .map_err(|_| anyhow!("output buffer poisoned"))?;
    Ok(state.snapshot())
}
