use nix::sys::wait::WaitStatus;

/// Collapse a decoded `waitpid` status into the wire's canonical form: a
/// non-negative exit code, or `-1` meaning "did not exit normally" (killed by
/// signal, core-dumped, or never successfully exec'd).
pub fn canonicalize(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => *code,
        _ => -1,
    }
}

/// The pid a `WaitStatus` is reporting on, for callers that filter by pid
/// before trusting a reap (e.g. the pump's SIGCHLD handler, which can be
/// woken for statuses unrelated to its own child under `WNOHANG`).
pub fn status_pid(status: &WaitStatus) -> Option<nix::unistd::Pid> {
    match status {
        WaitStatus::Exited(p, _)
        | WaitStatus::Signaled(p, _, _)
        | WaitStatus::Stopped(p, _)
        | WaitStatus::Continued(p) => Some(*p),
        _ => None,
    }
}
