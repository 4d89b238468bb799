use std::io;

/// Never shown to the client verbatim — the dispatcher is the single place
/// that turns one of these into the wire-level `INTERNAL` error code plus a
/// `tracing::error!` line, per the information-hiding policy that no
/// diagnostic detail about *why* a command failed to launch should leak to
/// the requester.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("socketpair() failed: {0}")]
    Socketpair(#[source] nix::Error),

    #[error("fork() failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("child setup failed before exec: {0}")]
    ChildSetup(#[source] nix::Error),

    #[error("waitpid() failed: {0}")]
    Wait(#[source] nix::Error),

    #[error("failed to register mio event source: {0}")]
    Poll(#[source] io::Error),

    #[error("I/O error on child channel: {0}")]
    Io(#[source] io::Error),
}
