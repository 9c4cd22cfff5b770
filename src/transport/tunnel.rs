use std::{
    io::{self, Error, ErrorKind},
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use h3::client::RequestStream;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    join,
};
use tracing::trace;

/// The capacity of the in-memory pipe between a [`TunnelStream`] and its HTTP/3 stream.
pub const TUNNEL_BUFFER_SIZE: usize = 64 * 1024;

pub(crate) type H3RequestStream = RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// Counts the tunnels open on a session. A pooled session with open tunnels is never evicted
/// for being idle.
#[derive(Debug)]
pub(crate) struct ActiveStreamGuard {
    counter: Arc<AtomicUsize>,
}

impl ActiveStreamGuard {
    pub fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The body of an accepted CONNECT request: a byte stream towards the requested destination.
///
/// Shutting down the write side finishes the request stream towards the proxy. The read side
/// returns EOF once the proxy finishes its side.
#[derive(Debug)]
pub struct TunnelStream {
    inner: DuplexStream,
}

impl TunnelStream {
    pub(crate) fn spawn(stream: H3RequestStream, guard: ActiveStreamGuard) -> Self {
        let (local, remote) = tokio::io::duplex(TUNNEL_BUFFER_SIZE);

        tokio::spawn(async move {
            let _guard = guard;
            let (sent, received) = pump(stream, remote).await;
            match (sent, received) {
                (Ok(sent), Ok(received)) => trace!("Tunnel ended after {sent} bytes sent and {received} bytes received"),
                (sent, received) => trace!("Tunnel ended with errors, upload: {sent:?}, download: {received:?}"),
            }
        });

        Self { inner: local }
    }
}

async fn pump(stream: H3RequestStream, remote: DuplexStream) -> (io::Result<u64>, io::Result<u64>) {
    let (mut send_stream, mut recv_stream) = stream.split();
    let (mut reader, mut writer) = tokio::io::split(remote);

    let upload = async {
        let mut total = 0;
        let mut buf = BytesMut::with_capacity(TUNNEL_BUFFER_SIZE);
        loop {
            buf.reserve(TUNNEL_BUFFER_SIZE);
            let read = reader.read_buf(&mut buf).await?;
            if read == 0 {
                break;
            }

            total += read as u64;
            send_stream.send_data(buf.split().freeze()).await.map_err(h3_to_io)?;
        }

        send_stream.finish().await.map_err(h3_to_io)?;
        Ok::<u64, Error>(total)
    };

    let download = async {
        let mut total = 0;
        while let Some(mut chunk) = recv_stream.recv_data().await.map_err(h3_to_io)? {
            let bytes = chunk.copy_to_bytes(chunk.remaining());
            total += bytes.len() as u64;
            writer.write_all(&bytes).await?;
        }

        writer.shutdown().await?;
        Ok::<u64, Error>(total)
    };

    join!(upload, download)
}

fn h3_to_io(error: h3::Error) -> Error {
    Error::new(ErrorKind::Other, error)
}

impl AsyncRead for TunnelStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
