use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use signal_hook::consts::SIGCHLD;
use signal_hook_mio::v1_0::Signals;

use crate::error::EngineError;
use crate::launch::ChildHandle;
use crate::status::{canonicalize, status_pid};
use crate::transport::{Stream, Transport};

const TOKEN_IO: Token = Token(0);
const TOKEN_STDERR: Token = Token(1);
const TOKEN_SIGNAL: Token = Token(2);

/// Per-frame / total byte caps negotiated with the transport layer.
#[derive(Debug, Clone, Copy)]
pub struct PumpLimits {
    /// v2 per-frame payload cap.
    pub max_output: usize,
    /// v1 total accumulated-output cap.
    pub max_output_v1: usize,
}

/// What the pump produced, handed back to the dispatcher for the terminating
/// frame — the pump itself never emits the final status/status+output frame.
pub struct PumpOutcome {
    pub exit_status: i32,
    pub reaped: bool,
    /// Only populated (and only meaningful) under protocol v1.
    pub output_v1: Vec<u8>,
    /// Set when the loop broke on a non-recoverable error.
    pub broke: bool,
}

enum V1State {
    Accumulating,
    Discarding,
}

struct RegisteredFd {
    fd: RawFd,
    registered: bool,
}

impl RegisteredFd {
    fn new(fd: RawFd) -> Self {
        Self { fd, registered: false }
    }

    fn set_interest(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interest: Option<Interest>,
    ) -> Result<(), EngineError> {
        match (interest, self.registered) {
            (Some(i), true) => registry
                .reregister(&mut SourceFd(&self.fd), token, i)
                .map_err(EngineError::Poll),
            (Some(i), false) => {
                registry
                    .register(&mut SourceFd(&self.fd), token, i)
                    .map_err(EngineError::Poll)?;
                self.registered = true;
                Ok(())
            }
            (None, true) => {
                registry
                    .deregister(&mut SourceFd(&self.fd))
                    .map_err(EngineError::Poll)?;
                self.registered = false;
                Ok(())
            }
            (None, false) => Ok(()),
        }
    }
}

/// Outcome of a single nonblocking `waitpid(pid, WNOHANG)` probe.
enum ReapProbe {
    StillAlive,
    Reaped(i32),
    /// `ECHILD`: the child was already reaped by a probe elsewhere (or, in
    /// principle, by some other caller); there is no status left to read.
    AlreadyGone,
}

/// Nonblocking check for whether `pid` has exited, without depending on
/// SIGCHLD delivery. Called both before the loop (to catch a child that
/// exited in the window between `fork()` in `launch()` and this function
/// installing its own SIGCHLD source, during which the signal's disposition
/// was still `SIG_DFL` and any SIGCHLD delivered was silently discarded) and
/// on every iteration before committing to a blocking `poll` (to catch a
/// SIGCHLD lost for the same reason — `Signals` coalesces, but a signal that
/// arrives before registration never reaches its queue at all).
fn probe_reap(pid: nix::unistd::Pid) -> Result<ReapProbe, EngineError> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) | Ok(WaitStatus::Continued(_)) => Ok(ReapProbe::StillAlive),
        Ok(status) if status_pid(&status) == Some(pid) => Ok(ReapProbe::Reaped(canonicalize(&status))),
        Ok(_) => Ok(ReapProbe::StillAlive),
        Err(nix::Error::ECHILD) => Ok(ReapProbe::AlreadyGone),
        Err(e) => Err(EngineError::Wait(e)),
    }
}

/// Classifies a read/write `io::Error` for the interest-update logic below.
enum IoOutcome {
    WouldBlock,
    PeerGone,
    Fatal(io::Error),
}

fn classify(err: io::Error) -> IoOutcome {
    match err.raw_os_error() {
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => IoOutcome::WouldBlock,
        Some(code) if code == libc::EPIPE || code == libc::ECONNRESET => IoOutcome::PeerGone,
        _ => IoOutcome::Fatal(err),
    }
}

/// Raw nonblocking `read(2)`/`write(2)` on a plain fd, bypassing `nix`'s
/// fd-ownership generics the same way `launch::set_nonblocking` does.
fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Run the pump to completion: writes `stdin_payload` (if any) into the
/// child, streams stdout/stderr frames to `transport` (v2) or accumulates
/// them (v1), reaps the child, and drains any output left in flight after
/// reap.
pub fn pump(
    handle: ChildHandle,
    mut stdin_payload: Option<Vec<u8>>,
    is_v1: bool,
    transport: &mut dyn Transport,
    limits: PumpLimits,
) -> Result<PumpOutcome, EngineError> {
    let pid = handle.pid;
    let io_fd = handle.stdinout_fd.as_raw_fd();
    let stderr_fd = handle.stderr_fd.as_ref().map(|fd| fd.as_raw_fd());

    let mut poll = Poll::new().map_err(EngineError::Poll)?;
    let registry = poll.registry().try_clone().map_err(EngineError::Poll)?;

    let mut io_source = RegisteredFd::new(io_fd);
    let mut stderr_source = stderr_fd.map(RegisteredFd::new);

    let mut signals = Signals::new([SIGCHLD]).map_err(EngineError::Poll)?;
    registry
        .register(&mut signals, TOKEN_SIGNAL, Interest::READABLE)
        .map_err(EngineError::Poll)?;

    let mut write_done = stdin_payload.is_none();
    let mut write_offset = 0usize;
    let mut stdout_eof = false;
    let mut stderr_eof = stderr_fd.is_none();

    let mut v1_buffer: Vec<u8> = Vec::new();
    let mut v1_state = V1State::Accumulating;

    let io_interest = |write_done: bool, stdout_eof: bool| -> Option<Interest> {
        match (write_done, stdout_eof) {
            (true, true) => None,
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        }
    };
    io_source.set_interest(&registry, TOKEN_IO, io_interest(write_done, stdout_eof))?;
    if let Some(src) = &mut stderr_source {
        src.set_interest(&registry, TOKEN_STDERR, Some(Interest::READABLE))?;
    }

    let mut events = Events::with_capacity(8);
    let mut reaped = false;
    let mut exit_status = -1;
    let mut broke = false;

    loop {
        // `fork()` in `launch()` happens well before `signals` was
        // registered above, so a fast child (or an `execve` failure exiting
        // 255 immediately) can exit in that window: its SIGCHLD, delivered
        // while the disposition was still `SIG_DFL`, is discarded and never
        // re-raised. Re-probe with WNOHANG before every blocking `poll` —
        // on the first iteration this catches that already-exited child;
        // on later iterations it catches a SIGCHLD lost the same way — so a
        // missed edge can never wedge the loop on a signal that will never
        // come.
        if !reaped {
            match probe_reap(pid)? {
                ReapProbe::StillAlive => {}
                ReapProbe::Reaped(status) => {
                    reaped = true;
                    exit_status = status;
                }
                ReapProbe::AlreadyGone => {
                    reaped = true;
                }
            }
        }

        let timeout = if reaped { Some(Duration::ZERO) } else { None };
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(EngineError::Poll(e));
        }

        let mut saw_output = false;

        for event in events.iter() {
            match event.token() {
                TOKEN_IO if event.is_writable() && !write_done => {
                    if let Some(payload) = &stdin_payload {
                        match raw_write(io_fd, &payload[write_offset..]) {
                            Ok(n) => {
                                write_offset += n;
                                if write_offset >= payload.len() {
                                    write_done = true;
                                    unsafe { libc::shutdown(io_fd, libc::SHUT_WR) };
                                }
                            }
                            Err(e) => match classify(e) {
                                IoOutcome::WouldBlock => {}
                                IoOutcome::PeerGone => {
                                    write_done = true;
                                }
                                IoOutcome::Fatal(err) => {
                                    tracing::error!(error = %err, "write error on child stdin");
                                    broke = true;
                                }
                            },
                        }
                    }
                }
                TOKEN_IO if event.is_readable() && !stdout_eof => {
                    match drain_readable(io_fd, limits.max_output) {
                        Ok(chunks) => {
                            for chunk in &chunks.data {
                                saw_output = true;
                                if is_v1 {
                                    accumulate_v1(&mut v1_buffer, &mut v1_state, chunk, limits.max_output_v1);
                                } else if transport.send_output_v2(Stream::Stdout, chunk).is_err() {
                                    broke = true;
                                }
                            }
                            if chunks.eof {
                                stdout_eof = true;
                            }
                            if let Some(err) = chunks.fatal {
                                tracing::error!(error = %err, "read error on child stdout");
                                broke = true;
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                TOKEN_STDERR if event.is_readable() && !stderr_eof => {
                    if let Some(fd) = stderr_fd {
                        match drain_readable(fd, limits.max_output) {
                            Ok(chunks) => {
                                for chunk in &chunks.data {
                                    saw_output = true;
                                    if transport.send_output_v2(Stream::Stderr, chunk).is_err() {
                                        broke = true;
                                    }
                                }
                                if chunks.eof {
                                    stderr_eof = true;
                                }
                                if let Some(err) = chunks.fatal {
                                    tracing::error!(error = %err, "read error on child stderr");
                                    broke = true;
                                }
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                TOKEN_SIGNAL => {
                    for signum in signals.pending() {
                        if signum == SIGCHLD {
                            match probe_reap(pid)? {
                                ReapProbe::StillAlive => {}
                                ReapProbe::Reaped(status) => {
                                    reaped = true;
                                    exit_status = status;
                                }
                                ReapProbe::AlreadyGone => {
                                    reaped = true;
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if broke {
            break;
        }

        io_source.set_interest(&registry, TOKEN_IO, io_interest(write_done, stdout_eof))?;
        if !stderr_eof {
            if let Some(src) = &mut stderr_source {
                src.set_interest(&registry, TOKEN_STDERR, Some(Interest::READABLE))?;
            }
        } else if let Some(src) = &mut stderr_source {
            src.set_interest(&registry, TOKEN_STDERR, None)?;
        }

        if reaped && !saw_output {
            break;
        }
    }

    if !write_done {
        let _ = stdin_payload.take();
    }

    Ok(PumpOutcome {
        exit_status,
        reaped,
        output_v1: v1_buffer,
        broke,
    })
}

struct DrainedChunks {
    data: Vec<Vec<u8>>,
    eof: bool,
    fatal: Option<io::Error>,
}

/// Read everything currently available on `fd`, in frames of at most `cap`
/// bytes each. Loops until `EWOULDBLOCK`/`EAGAIN` because mio's readiness notification is
/// edge-triggered: a single event can mean "there's more than one frame's
/// worth of data sitting in the socket buffer".
fn drain_readable(fd: RawFd, cap: usize) -> Result<DrainedChunks, EngineError> {
    let mut data = Vec::new();
    let mut eof = false;
    let mut fatal = None;
    let mut buf = vec![0u8; cap.max(1)];

    loop {
        match raw_read(fd, &mut buf) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => {
                data.push(buf[..n].to_vec());
            }
            Err(e) => match classify(e) {
                IoOutcome::WouldBlock => break,
                IoOutcome::PeerGone => {
                    eof = true;
                    break;
                }
                IoOutcome::Fatal(err) => {
                    fatal = Some(err);
                    break;
                }
            },
        }
    }

    Ok(DrainedChunks { data, eof, fatal })
}

/// Apply the v1 accumulating/discarding state machine to one chunk
/// just read off the wire.
fn accumulate_v1(buffer: &mut Vec<u8>, state: &mut V1State, chunk: &[u8], cap: usize) {
    match state {
        V1State::Discarding => {}
        V1State::Accumulating => {
            let room = cap.saturating_sub(buffer.len());
            let take = room.min(chunk.len());
            buffer.extend_from_slice(&chunk[..take]);
            if buffer.len() >= cap {
                *state = V1State::Discarding;
            }
        }
    }
}
