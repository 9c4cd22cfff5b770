//! Dials through a local HTTP/3 CONNECT proxy that echoes every tunnel back.

use std::{
    error::Error,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Buf, Bytes};
use http::{Method, Request, Response, StatusCode};
use quic_connect::{DialError, ProxyClient, RoundTrip, RoundTripOpt, TlsTrust, TransportConfig, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

type BoxError = Box<dyn Error + Send + Sync>;
type ServerStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// The test proxy holds back its answer to CONNECTs for this destination.
const SLOW_DESTINATION: &str = "slow.example.com:1";
const SLOW_RESPONSE_DELAY: Duration = Duration::from_secs(3);

struct TestProxy {
    address: SocketAddr,
    cert_der: Vec<u8>,
    handshakes: Arc<AtomicUsize>,
}

impl TestProxy {
    /// Starts a proxy answering every CONNECT with `status`. Accepted tunnels echo their data.
    fn start(status: StatusCode) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.serialize_der().unwrap();
        let key_der = cert.serialize_private_key_der();

        let mut crypto = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![rustls::Certificate(cert_der.clone())], rustls::PrivateKey(key_der))
            .unwrap();
        crypto.alpn_protocols = vec![b"h3".to_vec()];

        let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        let endpoint = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
        let address = endpoint.local_addr().unwrap();

        let handshakes = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::clone(&handshakes);
        tokio::spawn(async move {
            while let Some(connecting) = endpoint.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(connecting, status).await {
                        eprintln!("Test proxy connection ended with error: {error}");
                    }
                });
            }
        });

        Self {
            address,
            cert_der,
            handshakes,
        }
    }

    fn client(&self) -> ProxyClient {
        self.client_with(TransportConfig::default())
    }

    fn client_with(&self, config: TransportConfig) -> ProxyClient {
        let config = config
            .with_tls(TlsTrust::Certificates(vec![self.cert_der.clone()]))
            .with_server_name("localhost");

        ProxyClient::with_config("udp", &self.address.to_string(), None, None, None, config)
    }

    fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

async fn serve_connection(connecting: quinn::Connecting, status: StatusCode) -> Result<(), BoxError> {
    let connection = connecting.await?;
    let mut h3_connection: h3::server::Connection<h3_quinn::Connection, Bytes> =
        h3::server::Connection::new(h3_quinn::Connection::new(connection)).await?;

    while let Some((request, stream)) = h3_connection.accept().await? {
        tokio::spawn(async move {
            if let Err(error) = serve_request(request, stream, status).await {
                eprintln!("Test proxy request ended with error: {error}");
            }
        });
    }

    Ok(())
}

async fn serve_request(request: Request<()>, mut stream: ServerStream, status: StatusCode) -> Result<(), BoxError> {
    let status = match request.method() == Method::CONNECT && request.uri().authority().is_some() {
        true => status,
        false => StatusCode::BAD_REQUEST,
    };

    if request.uri().authority().is_some_and(|authority| authority.as_str() == SLOW_DESTINATION) {
        tokio::time::sleep(SLOW_RESPONSE_DELAY).await;
    }

    stream.send_response(Response::builder().status(status).body(())?).await?;

    if status == StatusCode::OK {
        while let Some(mut chunk) = stream.recv_data().await? {
            let bytes = chunk.copy_to_bytes(chunk.remaining());
            stream.send_data(bytes).await?;
        }
    }

    stream.finish().await?;
    Ok(())
}

fn connect_request(destination: &str) -> Request<()> {
    Request::builder()
        .method(Method::CONNECT)
        .uri(format!("https://{destination}"))
        .body(())
        .unwrap()
}

async fn echo(client: &ProxyClient, destination: &str, message: &[u8]) -> Vec<u8> {
    let mut stream = client.dial("tcp", destination).await.unwrap();
    stream.write_all(message).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    received
}

#[tokio::test]
async fn tunnel_carries_bytes_both_ways() {
    let proxy = TestProxy::start(StatusCode::OK);
    let client = proxy.client();

    let received = echo(&client, "example.com:80", b"hello through the tunnel").await;

    assert_eq!(received, b"hello through the tunnel");
    assert_eq!(proxy.handshakes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dials_share_one_handshake() {
    let proxy = TestProxy::start(StatusCode::OK);
    let client = Arc::new(proxy.client());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let message = format!("tunnel number {i}");
                let received = echo(&client, &format!("host{i}.example.com:443"), message.as_bytes()).await;
                assert_eq!(received, message.as_bytes());
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(proxy.handshakes(), 1);
    assert_eq!(client.transport().pooled_sessions(), 1);

    // Later dials keep reusing the pooled session.
    echo(&client, "example.com:22", b"again").await;
    assert_eq!(proxy.handshakes(), 1);
}

#[tokio::test]
async fn dial_after_closing_sessions_handshakes_again() {
    let proxy = TestProxy::start(StatusCode::OK);
    let client = proxy.client();

    echo(&client, "example.com:80", b"first").await;
    client.transport().close_idle_sessions();
    assert_eq!(client.transport().pooled_sessions(), 0);

    let received = echo(&client, "example.com:80", b"second").await;

    assert_eq!(received, b"second");
    assert_eq!(proxy.handshakes(), 2);
}

#[tokio::test]
async fn rejected_connect_reports_proxy_and_status() {
    let proxy = TestProxy::start(StatusCode::FORBIDDEN);
    let client = proxy.client();

    let result = client.dial("tcp", "example.com:80").await;

    match result {
        Err(DialError::ProxyRejected { addr, status }) => {
            assert_eq!(addr, proxy.address.to_string());
            assert_eq!(status, "403 Forbidden");
        }
        Err(error) => panic!("Expected a rejection, got {error}"),
        Ok(_) => panic!("Expected a rejection, got a tunnel"),
    }
}

#[tokio::test]
async fn untrusted_proxy_certificate_is_fatal() {
    let proxy = TestProxy::start(StatusCode::OK);
    let config = TransportConfig::default().with_server_name("localhost");
    let client = ProxyClient::with_config("udp", &proxy.address.to_string(), None, None, None, config);

    let result = client.dial("tcp", "example.com:80").await;

    assert!(matches!(result, Err(DialError::Transport(_))));
    assert_eq!(client.transport().pooled_sessions(), 0);
}

#[tokio::test]
async fn slow_destination_leaves_sibling_tunnels_open() {
    let proxy = TestProxy::start(StatusCode::OK);
    let client = proxy.client_with(TransportConfig::default().with_response_header_timeout(Duration::from_millis(300)));

    let mut healthy = client.dial("tcp", "fast.example.com:80").await.unwrap();
    healthy.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    healthy.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one");

    let result = client.dial("tcp", SLOW_DESTINATION).await;
    assert!(matches!(result, Err(DialError::Transport(TransportError::Timeout(_)))));
    assert_eq!(proxy.handshakes(), 1);
    assert_eq!(client.transport().pooled_sessions(), 1);

    healthy.write_all(b"two").await.unwrap();
    healthy.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");

    assert_eq!(echo(&client, "example.com:80", b"three").await, b"three");
    assert_eq!(proxy.handshakes(), 1);
}

#[tokio::test]
async fn failed_cached_round_trip_keeps_pooled_session() {
    let proxy = TestProxy::start(StatusCode::OK);
    let client = proxy.client_with(TransportConfig::default().with_response_header_timeout(Duration::from_millis(300)));

    echo(&client, "example.com:80", b"warm up").await;
    assert_eq!(client.transport().pooled_sessions(), 1);

    let result = client
        .transport()
        .round_trip(&connect_request(SLOW_DESTINATION), RoundTripOpt::cached_only())
        .await;

    assert!(matches!(result, Err(TransportError::Timeout(_))));
    assert_eq!(client.transport().pooled_sessions(), 1);
    assert_eq!(proxy.handshakes(), 1);

    assert_eq!(echo(&client, "example.com:80", b"still pooled").await, b"still pooled");
    assert_eq!(proxy.handshakes(), 1);
}

#[tokio::test]
async fn non_ok_success_status_carries_no_tunnel() {
    let proxy = TestProxy::start(StatusCode::CREATED);
    let client = proxy.client();

    let response = client
        .transport()
        .round_trip(&connect_request("example.com:80"), RoundTripOpt::full())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.body().is_none());

    let result = client.dial("tcp", "example.com:80").await;
    assert!(matches!(result, Err(DialError::ProxyRejected { status, .. }) if status == "201 Created"));
}
