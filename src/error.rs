use std::{
    error::Error as StdError,
    io::{self, ErrorKind},
};

use thiserror::Error;

/// Marker found in errors caused by the peer abruptly resetting the session.
pub const PEER_RESET_MARKER: &str = "PublicReset:";

/// Marker found in errors caused by exceeding a session or stream limit.
pub const RESOURCE_EXHAUSTED_MARKER: &str = "TooMany";

/// Marker found in errors caused by failing to read from a session.
pub const READ_FAILURE_MARKER: &str = "cannot read ";

type BoxError = Box<dyn StdError + Send + Sync>;

/// An error returned by a [`RoundTrip`](crate::transport::RoundTrip) implementation.
///
/// The first five variants describe transient conditions, after which a request may succeed
/// on a brand new session. See [`TransportError::is_transient`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no cached session available")]
    NoCachedSession,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("session reset by peer: {0}")]
    PeerReset(String),

    #[error("session or stream limit reached: {0}")]
    ResourceExhausted(String),

    #[error("cannot read from session: {0}")]
    ReadFailure(String),

    #[error("invalid proxy address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("{0}")]
    Other(#[source] BoxError),
}

impl TransportError {
    /// Whether a new attempt that is allowed to establish a fresh session might succeed where
    /// this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoCachedSession | Self::Timeout(_) | Self::PeerReset(_) | Self::ResourceExhausted(_) | Self::ReadFailure(_)
        )
    }

    /// Classifies an error that carries no structure the transport could match on.
    ///
    /// Timeouts are detected only by walking the source chain for [`io::ErrorKind::TimedOut`],
    /// an elapsed tokio timer or a quinn idle timeout, never by the error text. The textual
    /// markers for the other transient kinds are a best effort and don't cover every transient
    /// failure a QUIC library may report.
    pub fn classify<E: Into<BoxError>>(error: E) -> Self {
        let error = error.into();
        let message = error.to_string();

        if is_timeout(&*error) {
            Self::Timeout(message)
        } else if message.contains(PEER_RESET_MARKER) {
            Self::PeerReset(message)
        } else if message.contains(RESOURCE_EXHAUSTED_MARKER) {
            Self::ResourceExhausted(message)
        } else if message.contains(READ_FAILURE_MARKER) {
            Self::ReadFailure(message)
        } else {
            Self::Other(error)
        }
    }

    pub(crate) fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into().into())
    }
}

fn is_timeout(error: &(dyn StdError + Send + Sync + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(error) = current {
        if let Some(io_error) = error.downcast_ref::<io::Error>() {
            if io_error.kind() == ErrorKind::TimedOut {
                return true;
            }
        }

        if error.is::<tokio::time::error::Elapsed>() {
            return true;
        }

        if let Some(quinn::ConnectionError::TimedOut) = error.downcast_ref::<quinn::ConnectionError>() {
            return true;
        }

        current = error.source();
    }

    false
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            ErrorKind::TimedOut => Self::Timeout(value.to_string()),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Self::PeerReset(value.to_string()),
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe => Self::ReadFailure(value.to_string()),
            _ => Self::classify(value),
        }
    }
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(value.to_string())
    }
}

impl From<quinn::ConnectionError> for TransportError {
    fn from(value: quinn::ConnectionError) -> Self {
        use quinn::ConnectionError;

        match value {
            ConnectionError::TimedOut => Self::Timeout(value.to_string()),
            ConnectionError::Reset => Self::PeerReset(value.to_string()),
            ConnectionError::ConnectionClosed(_) | ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed => {
                Self::ReadFailure(value.to_string())
            }
            other => Self::classify(other),
        }
    }
}

impl From<quinn::ConnectError> for TransportError {
    fn from(value: quinn::ConnectError) -> Self {
        use quinn::ConnectError;

        match value {
            ConnectError::TooManyConnections => Self::ResourceExhausted(value.to_string()),
            ConnectError::InvalidDnsName(ref name) => Self::InvalidAddress {
                address: name.clone(),
                reason: value.to_string(),
            },
            other => Self::Other(Box::new(other)),
        }
    }
}

impl From<h3::Error> for TransportError {
    fn from(value: h3::Error) -> Self {
        Self::classify(value)
    }
}

/// An error returned when dialing through a proxy.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("proxy: no support for QUIC proxy connections of type {0}")]
    UnsupportedNetwork(String),

    #[error("proxy: invalid destination address {addr}: {reason}")]
    InvalidDestination { addr: String, reason: String },

    #[error("proxy: {0}")]
    Transport(#[from] TransportError),

    #[error("proxy: failed to read greeting from HTTP proxy at {addr}: {status}")]
    ProxyRejected { addr: String, status: String },

    #[error("proxy: failed to convert the CONNECT response body to a stream")]
    StreamUnwrapFailed,

    #[error("proxy: {0}")]
    Io(#[from] io::Error),
}

impl From<DialError> for io::Error {
    fn from(value: DialError) -> Self {
        match value {
            DialError::Io(error) => error,
            DialError::UnsupportedNetwork(_) | DialError::InvalidDestination { .. } => io::Error::new(ErrorKind::InvalidInput, value),
            DialError::Transport(TransportError::Timeout(_)) => io::Error::new(ErrorKind::TimedOut, value),
            DialError::ProxyRejected { .. } => io::Error::new(ErrorKind::ConnectionRefused, value),
            other => io::Error::new(ErrorKind::Other, other),
        }
    }
}

impl From<TransportError> for io::Error {
    fn from(value: TransportError) -> Self {
        DialError::Transport(value).into()
    }
}
