use std::net::SocketAddr;

use thiserror::Error;

/// SOCKS5 reply codes per RFC 1928 §6, mapped to Rust variants.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("SOCKS5 server rejected the no-auth handshake")]
    HandshakeRejected,
    #[error("SOCKS5 general server failure")]
    GeneralFailure,
    #[error("SOCKS5 connection not allowed by ruleset")]
    NotAllowed,
    #[error("SOCKS5 network unreachable")]
    NetworkUnreachable,
    #[error("SOCKS5 host unreachable")]
    HostUnreachable,
    #[error("SOCKS5 connection refused")]
    ConnectionRefused,
    #[error("SOCKS5 TTL expired")]
    TtlExpired,
    #[error("SOCKS5 command not supported")]
    CommandNotSupported,
    #[error("SOCKS5 address type not supported")]
    AddressTypeNotSupported,
    #[error("SOCKS5 reply carried unknown status byte {0:#04x}")]
    UnknownStatus(u8),
    #[error("I/O error talking to SOCKS5 server: {0}")]
    Io(#[from] std::io::Error),
}

impl SocksError {
    pub fn from_status_byte(byte: u8) -> Self {
        match byte {
            0x01 => SocksError::GeneralFailure,
            0x02 => SocksError::NotAllowed,
            0x03 => SocksError::NetworkUnreachable,
            0x04 => SocksError::HostUnreachable,
            0x05 => SocksError::ConnectionRefused,
            0x06 => SocksError::TtlExpired,
            0x07 => SocksError::CommandNotSupported,
            0x08 => SocksError::AddressTypeNotSupported,
            other => SocksError::UnknownStatus(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpConnectError {
    #[error("upstream rejected CONNECT: {status} {reason}")]
    UpstreamRejected { status: u16, reason: String },
    #[error("malformed status line from upstream: {0:?}")]
    MalformedStatusLine(String),
    #[error("I/O error talking to HTTP-CONNECT upstream: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("name resolution yielded no addresses for {0}")]
    NoAddresses(String),
    #[error("I/O error dialing {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error resolving or dialing: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("upstream type {0:?} is not supported for dialing")]
    UnsupportedUpstreamType(String),
    #[error("connect/handshake with {0} did not complete within the 10s deadline")]
    Timeout(String),
    #[error("all {} configured upstreams failed: {}", .0.len(), .0.iter().map(|(label, cause)| format!("{label}: {cause}")).collect::<Vec<_>>().join("; "))]
    AllUpstreamsFailed(Vec<(String, String)>),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Socks(#[from] SocksError),
    #[error(transparent)]
    HttpConnect(#[from] HttpConnectError),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("client sent no bytes before the classify deadline")]
    ClassifyTimeout,
    #[error("client disconnected before sending a request")]
    ClientDisconnect,
    #[error("client attempted TLS but no server certificate is configured")]
    TlsNotEnabled,
    #[error("TLS handshake with client failed: {0}")]
    TlsHandshakeFailure(#[source] std::io::Error),
    #[error("malformed proxy request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch process {file_name:?}: {source}")]
    LaunchFailure {
        file_name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process {file_name:?} exited during startup delay with status {status:?}")]
    ExitedDuringStartup { file_name: String, status: Option<i32> },
    #[error("maximum restart attempts ({0}) reached")]
    MaxRestartsReached(u32),
    #[error("process supervision is not implemented on this platform")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("health probe to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: SocketAddr, timeout_ms: u64 },
    #[error("health probe to {addr} was rejected: {source}")]
    Rejected {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
