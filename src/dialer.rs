use std::{
    io::{self, Error, ErrorKind},
    net::{IpAddr, SocketAddr},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{addr::parse_host_port, error::DialError};

/// A full-duplex byte connection, as handed out by a [`Dialer`].
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

/// Anything able to open a connection to an address on a network, so dialers can be chained.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxConn, DialError>;
}

/// Resolves a hostname into the socket addresses it points to.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// The TCP network family tags a dialer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpNetwork {
    Tcp,
    Tcp4,
    Tcp6,
}

impl TcpNetwork {
    pub fn parse(network: &str) -> Option<Self> {
        match network {
            "tcp" => Some(Self::Tcp),
            "tcp4" => Some(Self::Tcp4),
            "tcp6" => Some(Self::Tcp6),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        }
    }

    /// Whether a socket address belongs to this family.
    pub fn accepts(self, address: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => address.is_ipv4(),
            Self::Tcp6 => address.is_ipv6(),
        }
    }
}

/// Resolves hostnames with the operating system's resolver. IP literals are returned without
/// doing a lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addresses: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        match addresses.is_empty() {
            true => Err(Error::new(
                ErrorKind::NotFound,
                format!("The domainname \"{host}\" could not be resolved to any addresses"),
            )),
            false => Ok(addresses),
        }
    }
}

/// Connects directly over TCP, without going through any proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct Direct;

#[async_trait]
impl Dialer for Direct {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxConn, DialError> {
        let family = TcpNetwork::parse(network).ok_or_else(|| DialError::UnsupportedNetwork(network.to_owned()))?;
        let (host, port) = parse_host_port(addr).map_err(|reason| DialError::InvalidDestination {
            addr: addr.to_owned(),
            reason,
        })?;

        let mut last_error = None;
        for address in SystemResolver.resolve(host, port).await? {
            if !family.accepts(&address) {
                continue;
            }

            match TcpStream::connect(address).await {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(error) => last_error = Some(error),
            }
        }

        Err(DialError::Io(last_error.unwrap_or_else(|| {
            let msg = format!("No {} address found for {addr}", family.as_str());
            Error::new(ErrorKind::NotFound, msg)
        })))
    }
}
