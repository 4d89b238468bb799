/// Identity and protocol negotiated by the session-setup layer.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub user: String,
    pub ipaddress: String,
    pub hostname: Option<String>,
    /// `1` selects the merged-stream, buffer-then-send protocol; `>= 2`
    /// selects the separated-stream, per-frame protocol.
    pub protocol: u32,
}

impl ClientInfo {
    pub fn is_v1(&self) -> bool {
        self.protocol == 1
    }
}

/// Which child stream an output frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout = 1,
    Stderr = 2,
}

/// The wire error-code enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadCommand,
    UnknownCommand,
    Access,
    TooManyArgs,
    NoHelp,
    Internal,
}

/// Everything the engine needs to send to the client.
///
/// Implementations must uphold two invariants: no call to `send_output_*`
/// happens before the dispatcher has confirmed ACL permission, and exactly
/// one status frame terminates a request.
pub trait Transport {
    fn send_output_v2(&mut self, stream: Stream, bytes: &[u8]) -> std::io::Result<()>;
    fn send_status_v2(&mut self, status: i32) -> std::io::Result<()>;
    fn send_output_v1(&mut self, bytes: &[u8], status: i32) -> std::io::Result<()>;
    fn send_error(&mut self, code: ErrorCode, message: &str) -> std::io::Result<()>;
}
