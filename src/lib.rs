#[cfg(not(unix))]
compile_error!("remctl-engine requires a unix target (fork/exec/socketpair)");

pub mod acl;
pub mod audit;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod launch;
pub mod pump;
pub mod request;
pub mod rule;
pub mod status;
pub mod transport;

/// v2 per-frame output payload cap, negotiated with the transport layer.
/// Fixed here because the engine, not the transport, is what enforces it
/// against the child's output.
pub const TOKEN_MAX_OUTPUT: usize = 1024 * 1024;

/// v1 total accumulated-output cap.
pub const TOKEN_MAX_OUTPUT_V1: usize = 1024 * 1024;

pub use acl::AclChecker;
pub use audit::AuditSink;
pub use dispatch::run;
pub use error::EngineError;
pub use request::Chunk;
pub use rule::{MatchToken, Rule, RuleTable};
pub use transport::{ClientInfo, ErrorCode, Stream, Transport};
