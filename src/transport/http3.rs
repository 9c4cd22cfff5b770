use std::{
    collections::HashMap,
    fmt,
    future::poll_fn,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use quinn::{Connection, Endpoint, VarInt};
use tokio::{
    task::JoinHandle,
    time::{timeout, timeout_at},
};
use tracing::{debug, trace};

use super::{
    clone_request, make_client_endpoint, ActiveStreamGuard, FixedProxy, RoundTrip, RoundTripOpt, SessionRouter, TransportConfig,
    TunnelStream,
};
use crate::{
    addr::parse_host_port,
    dialer::{Resolver, SystemResolver},
    error::TransportError,
};

/// The HTTP/3 error code for closing a connection without an error.
const H3_NO_ERROR: u32 = 0x100;

type SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

/// A pooled QUIC session with its HTTP/3 state.
struct Session {
    // Kept so the endpoint outlives the pool entry even after the connection is replaced.
    _endpoint: Endpoint,
    connection: Connection,
    send_request: SendRequest,
    driver: JoinHandle<()>,
    active_streams: Arc<AtomicUsize>,
    last_used: Instant,
}

impl Session {
    fn is_alive(&self) -> bool {
        self.connection.close_reason().is_none() && !self.driver.is_finished()
    }

    fn is_expired(&self, now: Instant, keep_alive_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_used) > keep_alive_timeout && self.active_streams.load(Ordering::Relaxed) == 0
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            send_request: self.send_request.clone(),
            stable_id: self.connection.stable_id(),
            active_streams: Arc::clone(&self.active_streams),
        }
    }

    fn close(&self, reason: &[u8]) {
        self.connection.close(VarInt::from_u32(H3_NO_ERROR), reason);
    }
}

/// What a single round trip needs from a pooled session.
struct SessionHandle {
    send_request: SendRequest,
    stable_id: usize,
    active_streams: Arc<AtomicUsize>,
}

/// A [`RoundTrip`] implementation sending requests as HTTP/3 over QUIC sessions established
/// with quinn.
///
/// Sessions are pooled under the key given by the [`SessionRouter`], and new sessions connect
/// to the address the router gives, resolved through the [`Resolver`]. With a [`FixedProxy`]
/// router the transport keeps at most one session, used for every destination.
///
/// Concurrent full round trips wait on each other while a session is being established, so
/// only one handshake is done for a key at a time.
pub struct H3Transport {
    config: TransportConfig,
    router: Arc<dyn SessionRouter>,
    resolver: Arc<dyn Resolver>,
    sessions: Mutex<HashMap<String, Session>>,
    dial_lock: tokio::sync::Mutex<()>,
}

impl H3Transport {
    pub fn new(config: TransportConfig, router: Arc<dyn SessionRouter>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            config,
            router,
            resolver,
            sessions: Mutex::new(HashMap::new()),
            dial_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A transport whose sessions all go to the proxy at `proxy_address`.
    pub fn for_proxy(config: TransportConfig, proxy_address: &str) -> Self {
        Self::new(config, Arc::new(FixedProxy::new(proxy_address)), Arc::new(SystemResolver))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The amount of sessions currently pooled.
    pub fn pooled_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Closes and forgets every pooled session. Open tunnels on them are closed too.
    pub fn close_idle_sessions(&self) {
        for (key, session) in self.lock_sessions().drain() {
            debug!("Closing pooled session {key}");
            session.close(b"closed by client");
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a usable pooled session. A dead or expired session is left in place, to be
    /// replaced by the next session established for its key.
    fn cached_session(&self, key: &str) -> Result<SessionHandle, TransportError> {
        let now = Instant::now();
        let sessions = self.lock_sessions();

        match sessions.get(key) {
            Some(session) if session.is_alive() && !session.is_expired(now, self.config.keep_alive_timeout) => {
                trace!("Reusing pooled session {key}");
                Ok(session.handle())
            }
            Some(_) => {
                trace!("Pooled session {key} is stale");
                Err(TransportError::NoCachedSession)
            }
            None => Err(TransportError::NoCachedSession),
        }
    }

    async fn get_or_dial_session(&self, key: &str, authority: &str) -> Result<SessionHandle, TransportError> {
        if let Ok(handle) = self.cached_session(key) {
            return Ok(handle);
        }

        let _dial_guard = self.dial_lock.lock().await;

        // Another task might have finished a handshake while we waited for the lock.
        if let Ok(handle) = self.cached_session(key) {
            return Ok(handle);
        }

        let session = self.dial_session(authority).await?;
        let handle = session.handle();
        if let Some(previous) = self.lock_sessions().insert(key.to_owned(), session) {
            debug!("Replacing stale session {key}");
            previous.close(b"replaced");
        }

        Ok(handle)
    }

    async fn dial_session(&self, authority: &str) -> Result<Session, TransportError> {
        let target = self.router.dial_target(authority);
        let (host, port) = parse_host_port(&target).map_err(|reason| TransportError::InvalidAddress {
            address: target.clone(),
            reason,
        })?;

        let deadline = tokio::time::Instant::now() + self.config.handshake_timeout;

        let addresses = timeout_at(deadline, self.resolver.resolve(host, port)).await??;
        let remote = match addresses.first() {
            Some(address) => *address,
            None => {
                return Err(TransportError::InvalidAddress {
                    address: target.clone(),
                    reason: String::from("resolved to no addresses"),
                })
            }
        };

        let server_name = self.config.server_name.as_deref().unwrap_or(host);
        debug!("Dialing new QUIC session to {target} ({remote}) as {server_name}");

        let endpoint = make_client_endpoint(remote, &self.config)?;
        let connecting = endpoint.connect(remote, server_name)?;
        let connection = timeout_at(deadline, connecting).await??;

        let h3_connection = h3_quinn::Connection::new(connection.clone());
        let (mut driver, send_request) = timeout_at(deadline, h3::client::new(h3_connection)).await??;

        let driver = tokio::spawn(async move {
            match poll_fn(|cx| driver.poll_close(cx)).await {
                Ok(()) => trace!("HTTP/3 session closed"),
                Err(error) => debug!("HTTP/3 session closed with error: {error}"),
            }
        });

        debug!("QUIC session to {target} established from {}", endpoint.local_addr()?);

        Ok(Session {
            _endpoint: endpoint,
            connection,
            send_request,
            driver,
            active_streams: Arc::new(AtomicUsize::new(0)),
            last_used: Instant::now(),
        })
    }

    async fn send(&self, handle: SessionHandle, request: &Request<()>) -> Result<Response<Option<TunnelStream>>, TransportError> {
        let SessionHandle {
            mut send_request,
            active_streams,
            ..
        } = handle;

        let exchange = async {
            let mut stream = send_request.send_request(clone_request(request)).await?;
            let response = stream.recv_response().await?;
            Ok::<_, h3::Error>((stream, response))
        };

        let (stream, response) = timeout(self.config.response_header_timeout, exchange).await??;
        let (parts, ()) = response.into_parts();

        let body = match parts.status == StatusCode::OK {
            true => Some(TunnelStream::spawn(stream, ActiveStreamGuard::new(&active_streams))),
            false => None,
        };

        Ok(Response::from_parts(parts, body))
    }

    /// Marks the pooled session a request succeeded on as used.
    fn touch(&self, key: &str, stable_id: usize) {
        let mut sessions = self.lock_sessions();
        if let Some(session) = sessions.get_mut(key).filter(|session| session.connection.stable_id() == stable_id) {
            session.last_used = Instant::now();
        }
    }

    /// Forgets the pooled session a request failed on, if the failure took the whole session
    /// down. Sessions that are still alive keep serving their other tunnels.
    fn evict_if_dead(&self, key: &str, stable_id: usize) {
        let mut sessions = self.lock_sessions();
        let is_dead = sessions
            .get(key)
            .is_some_and(|session| session.connection.stable_id() == stable_id && !session.is_alive());

        if is_dead {
            debug!("Evicting dead session {key} after a failed request");
            sessions.remove(key);
        }
    }
}

#[async_trait]
impl RoundTrip for H3Transport {
    type Stream = TunnelStream;

    async fn round_trip(&self, request: &Request<()>, opt: RoundTripOpt) -> Result<Response<Option<TunnelStream>>, TransportError> {
        let authority = request.uri().authority().map(|a| a.as_str()).unwrap_or_default();
        let key = self.router.client_key(authority);

        let handle = match opt.only_cached_session {
            true => self.cached_session(&key)?,
            false => self.get_or_dial_session(&key, authority).await?,
        };

        let stable_id = handle.stable_id;
        let result = self.send(handle, request).await;

        // Only full round trips may evict, a failed only-cached round trip leaves the pool as is.
        match &result {
            Ok(_) => self.touch(&key, stable_id),
            Err(_) if !opt.only_cached_session => self.evict_if_dead(&key, stable_id),
            Err(_) => {}
        }

        result
    }
}

impl fmt::Debug for H3Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H3Transport")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("pooled_sessions", &self.pooled_sessions())
            .finish()
    }
}
