use std::io;

/// Fails before any listener binds. Surfaced to the user; the process exits 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid tunnel URL: {0}")]
    InvalidUrl(String),
    #[error("tunnel address {0} did not resolve")]
    UnresolvableTunnelAddress(String),
    #[error("tls=2 requires both `crt` and `key` query parameters")]
    MissingTlsMaterial,
}

/// A read/write/dial error on the control channel, or a keepalive write
/// failure. Fails the runtime; the supervisor sleeps `serviceCooldown` and
/// restarts.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("control channel io error: {0}")]
    Io(#[from] io::Error),
    #[error("control channel closed by peer")]
    Closed,
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// An unparseable or unexpected signal. Logged, the line is dropped, the
/// tunnel continues.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("line is not URL-shaped: {0:?}")]
    Malformed(String),
    #[error("unknown fragment code {0:?}")]
    UnknownFragment(String),
}

/// `Get` returned nothing. The current flow is dropped; persistent depletion
/// triggers a `Flush` and recount.
#[derive(Debug, thiserror::Error)]
#[error("pool has no available entry for id {0}")]
pub struct PoolDepletion(pub String);

/// Logged, not fatal.
#[derive(Debug, thiserror::Error)]
#[error("shutdown did not complete within the deadline")]
pub struct ShutdownTimeout;
