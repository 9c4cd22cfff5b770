use std::{fmt, sync::Arc};

use async_trait::async_trait;
use http::{header::PROXY_AUTHORIZATION, HeaderValue, Method, Request, StatusCode};
use tracing::trace;

use crate::{
    addr::ProxyEndpoint,
    auth::Auth,
    dialer::{BoxConn, Dialer, Resolver, SystemResolver, TcpNetwork},
    error::DialError,
    transport::{FixedProxy, H3Transport, RoundTrip, RoundTripOpt, TransportConfig},
};

/// Dials TCP destinations through a CONNECT proxy reached over QUIC.
///
/// Every dial opens a new request stream on the client's pooled session, so any number of
/// tunnels to different destinations share a single QUIC session (and a single handshake).
pub struct ProxyClient<T = H3Transport> {
    endpoint: ProxyEndpoint,
    auth: Option<Auth>,
    send_proxy_authorization: bool,
    forward: Option<Arc<dyn Dialer>>,
    resolver: Arc<dyn Resolver>,
    transport: Arc<T>,
}

impl ProxyClient<H3Transport> {
    /// Creates a client for the proxy at `addr` with the default transport settings. If `addr`
    /// has no port, 443 is assumed.
    ///
    /// The forward dialer is stored for chaining, the resolver is used to look up the proxy's
    /// address when establishing sessions.
    pub fn new(
        network: &str,
        addr: &str,
        auth: Option<Auth>,
        forward: Option<Arc<dyn Dialer>>,
        resolver: Option<Arc<dyn Resolver>>,
    ) -> Self {
        Self::with_config(network, addr, auth, forward, resolver, TransportConfig::default())
    }

    pub fn with_config(
        network: &str,
        addr: &str,
        auth: Option<Auth>,
        forward: Option<Arc<dyn Dialer>>,
        resolver: Option<Arc<dyn Resolver>>,
        mut config: TransportConfig,
    ) -> Self {
        let endpoint = ProxyEndpoint::new(network, addr);
        let resolver = resolver.unwrap_or_else(|| Arc::new(SystemResolver) as Arc<dyn Resolver>);

        if config.server_name.is_none() {
            config.server_name = Some(endpoint.hostname().to_owned());
        }

        let router = Arc::new(FixedProxy::new(endpoint.address()));
        let transport = Arc::new(H3Transport::new(config, router, Arc::clone(&resolver)));

        Self {
            endpoint,
            auth,
            send_proxy_authorization: false,
            forward,
            resolver,
            transport,
        }
    }
}

impl<T: RoundTrip> ProxyClient<T> {
    /// Creates a client that sends its CONNECT requests through an existing transport.
    pub fn with_transport(endpoint: ProxyEndpoint, auth: Option<Auth>, transport: Arc<T>) -> Self {
        Self {
            endpoint,
            auth,
            send_proxy_authorization: false,
            forward: None,
            resolver: Arc::new(SystemResolver),
            transport,
        }
    }

    /// Whether to attach the credentials, if any, to each CONNECT request as a Basic
    /// `Proxy-Authorization` header. Disabled by default.
    pub fn send_proxy_authorization(mut self, enabled: bool) -> Self {
        self.send_proxy_authorization = enabled;
        self
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    pub fn network(&self) -> &str {
        self.endpoint.network()
    }

    pub fn address(&self) -> &str {
        self.endpoint.address()
    }

    pub fn hostname(&self) -> &str {
        self.endpoint.hostname()
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    pub fn forward(&self) -> Option<&Arc<dyn Dialer>> {
        self.forward.as_ref()
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Builds the CONNECT request for tunneling towards `addr`.
    pub fn connect_request(&self, addr: &str) -> Result<Request<()>, DialError> {
        let mut builder = Request::builder().method(Method::CONNECT).uri(format!("https://{addr}"));

        if let (true, Some(auth)) = (self.send_proxy_authorization, &self.auth) {
            let value = HeaderValue::from_str(&auth.basic_authorization()).map_err(|e| DialError::InvalidDestination {
                addr: addr.to_owned(),
                reason: e.to_string(),
            })?;

            builder = builder.header(PROXY_AUTHORIZATION, value);
        }

        builder.body(()).map_err(|e| DialError::InvalidDestination {
            addr: addr.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Connects to `addr` through the proxy, returning the tunneled stream.
    ///
    /// The request is first sent over the pooled session, if there is one. Only when that
    /// fails in a way a fresh session might fix (no session pooled, a timeout, the peer reset
    /// the session, a session or stream limit, a read failure) is it sent again, this time
    /// allowed to perform a new handshake. Any other failure is returned as-is.
    #[tracing::instrument(level = "debug", skip(self), fields(proxy = %self.endpoint.address()))]
    pub async fn dial(&self, network: &str, addr: &str) -> Result<T::Stream, DialError> {
        if TcpNetwork::parse(network).is_none() {
            return Err(DialError::UnsupportedNetwork(network.to_owned()));
        }

        let request = self.connect_request(addr)?;

        let result = match self.transport.round_trip(&request, RoundTripOpt::cached_only()).await {
            Err(error) if error.is_transient() => {
                trace!("Retrying with a full handshake after: {error}");
                self.transport.round_trip(&request, RoundTripOpt::full()).await
            }
            result => result,
        };

        let response = result.map_err(DialError::Transport)?;

        if response.status() != StatusCode::OK {
            return Err(DialError::ProxyRejected {
                addr: self.endpoint.address().to_owned(),
                status: status_text(response.status()),
            });
        }

        response.into_body().ok_or(DialError::StreamUnwrapFailed)
    }
}

/// Formats a status code the way it appears in a status line, e.g. "407 Proxy Authentication
/// Required".
fn status_text(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_str()),
        None => status.as_str().to_owned(),
    }
}

#[async_trait]
impl<T: RoundTrip> Dialer for ProxyClient<T> {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxConn, DialError> {
        let stream = ProxyClient::dial(self, network, addr).await?;
        Ok(Box::new(stream))
    }
}

impl<T> fmt::Debug for ProxyClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyClient")
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth)
            .field("send_proxy_authorization", &self.send_proxy_authorization)
            .field("forward", &self.forward.is_some())
            .finish()
    }
}
