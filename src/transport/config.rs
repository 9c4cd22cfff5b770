use std::time::Duration;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Which certificates a transport trusts when verifying the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsTrust {
    /// The Mozilla root certificates bundled by `webpki-roots`.
    #[default]
    WebPki,

    /// Only these DER-encoded certificates.
    Certificates(Vec<Vec<u8>>),

    /// Accept any certificate. Only meant for testing against self-signed proxies.
    InsecureSkipVerify,
}

/// Session lifecycle settings of an [`H3Transport`](super::H3Transport). Fixed once the transport
/// is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// How long establishing a new QUIC session (and its HTTP/3 control streams) may take.
    pub handshake_timeout: Duration,

    /// The QUIC idle timeout, after which a silent session is closed.
    pub idle_timeout: Duration,

    /// Whether to send keep-alive packets, at half the idle timeout.
    pub keep_alive: bool,

    /// How long a pooled session may go without being used before it's evicted.
    pub keep_alive_timeout: Duration,

    /// How long to wait for the proxy's response to a CONNECT request.
    pub response_header_timeout: Duration,

    /// Use shortened local connection IDs.
    pub connection_id_truncation: bool,

    /// The TLS server name to present. Defaults to the proxy's hostname.
    pub server_name: Option<String>,

    pub tls: TlsTrust,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            keep_alive: true,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            response_header_timeout: DEFAULT_RESPONSE_HEADER_TIMEOUT,
            connection_id_truncation: true,
            server_name: None,
            tls: TlsTrust::WebPki,
        }
    }
}

impl TransportConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool, timeout: Duration) -> Self {
        self.keep_alive = keep_alive;
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn with_response_header_timeout(mut self, timeout: Duration) -> Self {
        self.response_header_timeout = timeout;
        self
    }

    pub fn with_connection_id_truncation(mut self, truncate: bool) -> Self {
        self.connection_id_truncation = truncate;
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsTrust) -> Self {
        self.tls = tls;
        self
    }

    /// The interval keep-alive packets are sent at, if enabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        match self.keep_alive {
            true => Some(self.idle_timeout / 2),
            false => None,
        }
    }
}
