use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    sync::Arc,
};

use quinn::{ClientConfig, Endpoint, EndpointConfig, IdleTimeout, TokioRuntime};
use quinn_proto::{ConnectionIdGenerator, RandomConnectionIdGenerator};
use rustls::{OwnedTrustAnchor, RootCertStore};

use super::{TlsTrust, TransportConfig};
use crate::error::TransportError;

/// The ALPN protocol identifier for HTTP/3.
pub const H3_ALPN: &[u8] = b"h3";

/// The length of local connection IDs when connection ID truncation is enabled. Quinn uses 8
/// bytes otherwise.
pub const TRUNCATED_CONNECTION_ID_LEN: usize = 4;

/// An empty IPv4 [`SocketAddr`] with port 0
pub const UNSPECIFIED_SOCKADDR_V4: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// An empty IPv6 [`SocketAddr`] with port, flowinfo, and scope_id all set to 0.
pub const UNSPECIFIED_SOCKADDR_V6: SocketAddr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0));

/// Binds a client-only QUIC endpoint able to reach `remote`.
pub fn make_client_endpoint(remote: SocketAddr, config: &TransportConfig) -> Result<Endpoint, TransportError> {
    let runtime = Arc::new(TokioRuntime);

    let bind_address = match remote {
        SocketAddr::V4(_) => UNSPECIFIED_SOCKADDR_V4,
        SocketAddr::V6(_) => UNSPECIFIED_SOCKADDR_V6,
    };

    let mut endpoint_config = EndpointConfig::default();
    if config.connection_id_truncation {
        endpoint_config.cid_generator(|| {
            Box::new(RandomConnectionIdGenerator::new(TRUNCATED_CONNECTION_ID_LEN)) as Box<dyn ConnectionIdGenerator>
        });
    }

    let socket = std::net::UdpSocket::bind(bind_address)?;
    let mut endpoint = Endpoint::new(endpoint_config, None, socket, runtime)?;
    endpoint.set_default_client_config(configure_client(config)?);

    Ok(endpoint)
}

pub fn configure_client(config: &TransportConfig) -> Result<ClientConfig, TransportError> {
    let builder = rustls::ClientConfig::builder().with_safe_defaults();

    let mut crypto = match &config.tls {
        TlsTrust::WebPki => builder.with_root_certificates(webpki_root_store()).with_no_client_auth(),
        TlsTrust::Certificates(certificates) => {
            let mut roots = RootCertStore::empty();
            for der in certificates {
                roots.add(&rustls::Certificate(der.clone()))?;
            }

            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsTrust::InsecureSkipVerify => builder
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth(),
    };

    crypto.alpn_protocols = vec![H3_ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(crypto));

    let idle_timeout = IdleTimeout::try_from(config.idle_timeout)
        .map_err(|_| TransportError::other(format!("Idle timeout out of range: {:?}", config.idle_timeout)))?;

    let mut transport_config = quinn::TransportConfig::default();
    transport_config.max_idle_timeout(Some(idle_timeout));
    transport_config.keep_alive_interval(config.keep_alive_interval());
    client_config.transport_config(Arc::new(transport_config));

    Ok(client_config)
}

fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(anchor.subject, anchor.spki, anchor.name_constraints)
    }));

    roots
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn client_config_builds_for_every_trust_mode() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.serialize_der().unwrap();

        for tls in [TlsTrust::WebPki, TlsTrust::Certificates(vec![cert_der]), TlsTrust::InsecureSkipVerify] {
            let config = TransportConfig::default().with_tls(tls);
            assert!(configure_client(&config).is_ok());
        }
    }

    #[test]
    fn rejects_garbage_certificates() {
        let config = TransportConfig::default().with_tls(TlsTrust::Certificates(vec![vec![1, 2, 3]]));
        assert!(matches!(configure_client(&config), Err(TransportError::Tls(_))));
    }

    #[test]
    fn rejects_out_of_range_idle_timeout() {
        let config = TransportConfig::default().with_idle_timeout(Duration::from_secs(u64::MAX / 2));
        assert!(configure_client(&config).is_err());
    }

    #[tokio::test]
    async fn binds_endpoint_of_the_remote_family() {
        let config = TransportConfig::default();

        let endpoint = make_client_endpoint("127.0.0.1:443".parse().unwrap(), &config).unwrap();
        assert!(endpoint.local_addr().unwrap().is_ipv4());

        let config = config.with_connection_id_truncation(false);
        let endpoint = make_client_endpoint("127.0.0.1:443".parse().unwrap(), &config).unwrap();
        assert_ne!(endpoint.local_addr().unwrap().port(), 0);
    }
}
