use std::fmt;

use async_trait::async_trait;
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;

mod config;
mod endpoint;
mod http3;
mod tunnel;

pub use config::*;
pub use endpoint::*;
pub use http3::*;
pub use tunnel::*;

/// Options for a single [`RoundTrip::round_trip`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTripOpt {
    /// Only use a session that is already pooled. When none is available the round trip fails
    /// with [`TransportError::NoCachedSession`] instead of performing a handshake.
    pub only_cached_session: bool,
}

impl RoundTripOpt {
    pub const fn cached_only() -> Self {
        Self { only_cached_session: true }
    }

    pub const fn full() -> Self {
        Self { only_cached_session: false }
    }
}

/// Sends a request over a pooled, multiplexed session and returns the response head along with
/// the response's body stream, if there is one.
///
/// Implementations must be safe to call concurrently and coordinate session creation
/// themselves.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn round_trip(&self, request: &Request<()>, opt: RoundTripOpt) -> Result<Response<Option<Self::Stream>>, TransportError>;
}

/// Decides where a transport connects and how its sessions are pooled.
pub trait SessionRouter: Send + Sync + fmt::Debug {
    /// The "host:port" address a new session for this request authority dials.
    fn dial_target(&self, authority: &str) -> String;

    /// The key a session for this request authority is pooled under.
    fn client_key(&self, authority: &str) -> String;
}

/// Routes every request to the same proxy address and pools everything under that address, so
/// a transport keeps at most one session regardless of the requested destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedProxy {
    address: String,
}

impl FixedProxy {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

impl SessionRouter for FixedProxy {
    fn dial_target(&self, _authority: &str) -> String {
        self.address.clone()
    }

    fn client_key(&self, _authority: &str) -> String {
        self.address.clone()
    }
}

/// Copies a bodiless request so it can be sent more than once.
pub(crate) fn clone_request(request: &Request<()>) -> Request<()> {
    let mut clone = Request::new(());
    *clone.method_mut() = request.method().clone();
    *clone.uri_mut() = request.uri().clone();
    *clone.version_mut() = request.version();
    *clone.headers_mut() = request.headers().clone();
    clone
}
