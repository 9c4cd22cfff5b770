//! Dials TCP connections through an HTTP/3 CONNECT proxy.
//!
//! A [`ProxyClient`] keeps one pooled QUIC session to its proxy and opens a CONNECT request
//! stream on it for every [`ProxyClient::dial`]. The returned stream behaves like a raw socket
//! towards the requested destination.

pub mod addr;
pub mod auth;
pub mod dialer;
pub mod error;
pub mod proxy;
pub mod transport;

pub use addr::ProxyEndpoint;
pub use auth::Auth;
pub use dialer::{BoxConn, Conn, Dialer, Direct, Resolver, SystemResolver, TcpNetwork};
pub use error::{DialError, TransportError};
pub use proxy::ProxyClient;
pub use transport::{FixedProxy, H3Transport, RoundTrip, RoundTripOpt, SessionRouter, TlsTrust, TransportConfig, TunnelStream};
