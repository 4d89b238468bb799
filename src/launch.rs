use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};

use crate::env::ClientIdentity;
use crate::error::EngineError;
use crate::rule::Rule;

/// The fd range the child sweeps closed before exec. Covers
/// descriptors host libraries sometimes leak without setting close-on-exec;
/// fds 0-2 are the ones we deliberately wire up and must survive the sweep.
const CHILD_FD_SWEEP_RANGE: std::ops::Range<RawFd> = 3..16;

pub struct LaunchRequest<'a> {
    pub rule: &'a Rule,
    pub argv: &'a [Vec<u8>],
    pub stdin_payload: Option<&'a [u8]>,
    pub identity: &'a ClientIdentity,
    pub command_token: &'a str,
    /// `true` selects the v1 merged-stream wiring.
    pub protocol_v1: bool,
}

/// Parent-side handle to a launched child.
pub struct ChildHandle {
    pub pid: Pid,
    /// Parent-side end of the combined stdin/stdout socketpair (and, for v1,
    /// stderr too — all three muxed onto one descriptor).
    pub stdinout_fd: OwnedFd,
    /// Parent-side end of the dedicated stderr socketpair, protocol >= 2 only.
    pub stderr_fd: Option<OwnedFd>,
}

fn make_socketpair() -> Result<(OwnedFd, OwnedFd), EngineError> {
    // CLOEXEC on both ends: the surviving end gets re-dup'd onto 0/1/2 in the
    // child (dup2 clears CLOEXEC on the new descriptor), and the parent never
    // execs, so this only ever prevents an accidental leak.
    socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(EngineError::Socketpair)
}

/// Set `fd` nonblocking via raw `fcntl`, bypassing `nix`'s fd-ownership
/// generics: this fd is a borrowed view into an `OwnedFd` the caller still
/// holds, not a value we're prepared to hand over.
fn set_nonblocking(fd: &OwnedFd) -> Result<(), EngineError> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(EngineError::Io(std::io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(EngineError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn to_cstring(bytes: &[u8]) -> Result<CString, EngineError> {
    CString::new(bytes).map_err(|_| EngineError::ChildSetup(nix::Error::EINVAL))
}

/// Launch the child described by `req`. On success, returns the parent-side
/// descriptors; the caller hands these to the pump loop.
///
/// Every argv/env/identity string is converted to `CString` (and `/dev/null`
/// opened, if needed) before the fork below, so the forked child never
/// allocates or opens anything of its own before `exec` — only syscalls on
/// already-prepared values.
pub fn launch(req: &LaunchRequest<'_>) -> Result<ChildHandle, EngineError> {
    let (parent_io, child_io) = make_socketpair()?;
    let stderr_pair = if req.protocol_v1 {
        None
    } else {
        Some(make_socketpair()?)
    };

    // Prepare everything that needs allocation before forking.
    let program_path = to_cstring(req.rule.program.as_bytes())?;
    let argv_c: Vec<CString> = req
        .argv
        .iter()
        .map(|a| to_cstring(a))
        .collect::<Result<_, _>>()?;
    let argv_ptrs: Vec<&std::ffi::CStr> = argv_c.iter().map(|c| c.as_c_str()).collect();

    let overlay =
        crate::env::build_child_env(req.identity, req.command_token).map_err(|_| {
            EngineError::ChildSetup(nix::Error::EINVAL)
        })?;
    let env_c: Vec<CString> = crate::env::merged_environment(overlay)
        .into_iter()
        .map(|kv| to_cstring(&kv))
        .collect::<Result<_, _>>()?;
    let env_ptrs: Vec<&std::ffi::CStr> = env_c.iter().map(|c| c.as_c_str()).collect();

    let drop_identity = req
        .rule
        .drops_privileges()
        .then(|| -> Result<(CString, Uid, Gid), EngineError> {
            let user_c = to_cstring(req.rule.run_as_user.as_ref().unwrap().as_bytes())?;
            Ok((
                user_c,
                Uid::from_raw(req.rule.run_as_uid as libc::uid_t),
                Gid::from_raw(req.rule.run_as_gid as libc::gid_t),
            ))
        })
        .transpose()?;

    let stdin_present = req.stdin_payload.is_some();

    // Opened here, not post-fork: the child only dup2s this, never opens it
    // itself, so it performs no allocation or syscall that could race another
    // thread's malloc arena lock at fork time.
    let devnull = if stdin_present {
        None
    } else {
        std::fs::File::open("/dev/null").ok()
    };

    // SAFETY: single-threaded per request; the child performs only syscalls
    // on the already-prepared CStrings/fds above before exec.
    match unsafe { unistd::fork() }.map_err(EngineError::Fork)? {
        ForkResult::Parent { child } => {
            // Close the child-side ends in the parent (descriptor hygiene).
            drop(child_io);
            drop(devnull);
            set_nonblocking(&parent_io)?;
            let stderr_fd = match stderr_pair {
                Some((parent_stderr, child_stderr)) => {
                    drop(child_stderr);
                    set_nonblocking(&parent_stderr)?;
                    Some(parent_stderr)
                }
                None => None,
            };
            Ok(ChildHandle {
                pid: child,
                stdinout_fd: parent_io,
                stderr_fd,
            })
        }
        ForkResult::Child => {
            child_setup_and_exec(
                parent_io,
                child_io,
                stderr_pair,
                stdin_present,
                devnull,
                program_path,
                &argv_ptrs,
                &env_ptrs,
                drop_identity,
            );
            unreachable!("child_setup_and_exec always exits the process");
        }
    }
}

/// Runs entirely in the forked child. Any failure exits with status 255
/// and never writes to stdout/stderr — only
/// to the process's own stderr as a last resort, which is acceptable because
/// at that point the wiring that would deliver it to the client has not been
/// established yet.
fn child_setup_and_exec(
    parent_io: OwnedFd,
    child_io: OwnedFd,
    stderr_pair: Option<(OwnedFd, OwnedFd)>,
    stdin_present: bool,
    devnull: Option<std::fs::File>,
    program_path: CString,
    argv: &[&std::ffi::CStr],
    envp: &[&std::ffi::CStr],
    drop_identity: Option<(CString, Uid, Gid)>,
) -> ! {
    let bail = || -> ! { std::process::exit(255) };

    // 1. Close parent-side ends.
    drop(parent_io);
    let child_stderr_fd = stderr_pair.map(|(parent, child)| {
        drop(parent);
        child
    });

    // 2. stdin: dup child_io onto fd 0 if a payload exists, else the
    //    already-opened /dev/null handed down from before the fork.
    if stdin_present {
        if unsafe { libc::dup2(child_io.as_raw_fd(), libc::STDIN_FILENO) } < 0 {
            bail();
        }
    } else {
        unsafe { libc::close(libc::STDIN_FILENO) };
        // Best-effort: failure (here or in the pre-fork open) leaves fd 0
        // closed, child sees immediate EOF.
        if let Some(f) = devnull {
            let _ = unsafe { libc::dup2(f.as_raw_fd(), libc::STDIN_FILENO) };
        }
    }

    // 3. stdout (and, for v1, stderr) onto child_io; v2 stderr onto its own pair.
    if unsafe { libc::dup2(child_io.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
        bail();
    }
    match child_stderr_fd {
        Some(child_stderr) => {
            if unsafe { libc::dup2(child_stderr.as_raw_fd(), libc::STDERR_FILENO) } < 0 {
                bail();
            }
            drop(child_stderr);
        }
        None => {
            if unsafe { libc::dup2(child_io.as_raw_fd(), libc::STDERR_FILENO) } < 0 {
                bail();
            }
        }
    }

    // 4. Close the now-duplicated original.
    drop(child_io);

    // 5. Defensive fd sweep against fork-inheritance hazards.
    for fd in CHILD_FD_SWEEP_RANGE {
        unsafe { libc::close(fd) };
    }

    // 7. Identity drop (env is inherited via execve's envp, not setenv, so no
    //    separate step is needed for step 6 beyond building envp below).
    if let Some((user_c, uid, gid)) = drop_identity {
        if unistd::initgroups(&user_c, gid).is_err() {
            bail();
        }
        if unistd::setgid(gid).is_err() {
            bail();
        }
        if unistd::setuid(uid).is_err() {
            bail();
        }
    }

    // 8. exec.
    let _ = unistd::execve(&program_path, argv, envp);
    bail();
}
