// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The switchable transport stack.
//!
//! A [`TransportStack`] owns the connection and a peek buffer. `read_ahead`
//! pulls bytes off the socket without consuming them; later `read` calls
//! drain the buffer first. That is what lets the auto-detecting server
//! sniff a connection and then swap the active layer underneath, losing
//! nothing: when TLS is switched in, the peeked bytes are replayed into
//! the handshake.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;

/// A stream that first replays buffered bytes, then reads the inner
/// stream. Used to hand already-peeked bytes to the TLS handshake.
pub struct ReplayStream<S> {
    inner: S,
    replay: BytesMut,
}

impl<S> ReplayStream<S> {
    pub fn new(inner: S, replay: BytesMut) -> ReplayStream<S> {
        ReplayStream { inner, replay }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.replay.is_empty() {
            let n = self.replay.len().min(buf.remaining());
            buf.put_slice(&self.replay[..n]);
            self.replay.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

enum ActiveLayer {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<ReplayStream<TcpStream>>>),
    /// Transitional state while a switch is in flight.
    Detached,
}

/// Layered, runtime-switchable transport with non-destructive lookahead.
pub struct TransportStack {
    layer: ActiveLayer,
    peek_buf: BytesMut,
    /// Peer address; a proxy-protocol preamble overrides the socket's.
    pub peer_addr: Option<SocketAddr>,
}

impl TransportStack {
    pub fn new_tcp(stream: TcpStream) -> TransportStack {
        let peer_addr = stream.peer_addr().ok();
        TransportStack {
            layer: ActiveLayer::Tcp(stream),
            peek_buf: BytesMut::new(),
            peer_addr,
        }
    }

    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            matches!(self.layer, ActiveLayer::Tls(_))
        }
        #[cfg(not(feature = "tls"))]
        false
    }

    async fn layer_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.layer {
            ActiveLayer::Tcp(stream) => stream.read(buf).await,
            #[cfg(feature = "tls")]
            ActiveLayer::Tls(stream) => stream.read(buf).await,
            ActiveLayer::Detached => Err(io::Error::other("transport is switching layers")),
        }
    }

    /// Read, draining previously peeked bytes first.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.peek_buf.is_empty() {
            let n = self.peek_buf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.peek_buf[..n]);
            self.peek_buf.advance(n);
            return Ok(n);
        }
        self.layer_read(buf).await
    }

    /// Non-destructive lookahead of up to `n` bytes.
    ///
    /// Returns the currently buffered prefix and whether this call made
    /// progress. Zero bytes buffered after a progress-free call means
    /// EOF.
    pub async fn read_ahead(&mut self, n: usize) -> io::Result<(&[u8], bool)> {
        if self.peek_buf.len() >= n {
            return Ok((&self.peek_buf[..n], false));
        }
        let mut chunk = vec![0u8; n - self.peek_buf.len()];
        let got = self.layer_read(&mut chunk).await?;
        self.peek_buf.extend_from_slice(&chunk[..got]);
        let len = self.peek_buf.len().min(n);
        Ok((&self.peek_buf[..len], got > 0))
    }

    /// Drop `n` peeked bytes (a consumed preamble).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.peek_buf.len());
        self.peek_buf.advance(n);
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.layer {
            ActiveLayer::Tcp(stream) => stream.write_all(buf).await,
            #[cfg(feature = "tls")]
            ActiveLayer::Tls(stream) => stream.write_all(buf).await,
            ActiveLayer::Detached => Err(io::Error::other("transport is switching layers")),
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match &mut self.layer {
            ActiveLayer::Tcp(stream) => stream.shutdown().await,
            #[cfg(feature = "tls")]
            ActiveLayer::Tls(stream) => stream.shutdown().await,
            ActiveLayer::Detached => Ok(()),
        }
    }

    /// Swap the TLS layer in over the plain socket. The peeked bytes
    /// (the ClientHello so far) are replayed into the handshake.
    #[cfg(feature = "tls")]
    pub async fn switch_to_tls(&mut self, config: Arc<rustls::ServerConfig>) -> io::Result<()> {
        let layer = std::mem::replace(&mut self.layer, ActiveLayer::Detached);
        let ActiveLayer::Tcp(stream) = layer else {
            self.layer = layer;
            return Err(io::Error::other("TLS can only wrap a plain stream"));
        };
        let replay = std::mem::take(&mut self.peek_buf);
        let acceptor = TlsAcceptor::from(config);
        match acceptor.accept(ReplayStream::new(stream, replay)).await {
            Ok(tls) => {
                self.layer = ActiveLayer::Tls(Box::new(tls));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Parse and consume a HAProxy PROXY protocol v1 preamble if one is
/// present, returning the advertised (source, destination) addresses.
///
/// The preamble is at most 107 bytes and ends with CRLF; `PROXY UNKNOWN`
/// is accepted and yields no addresses. A connection that does not start
/// with `PROXY ` is left untouched.
pub async fn strip_proxy_protocol(
    stack: &mut TransportStack,
) -> io::Result<Option<(SocketAddr, SocketAddr)>> {
    const MAX_PREAMBLE: usize = 107;

    let is_proxy = loop {
        let (prefix, moved) = stack.read_ahead(6).await?;
        if prefix.len() >= 6 {
            break &prefix[..6] == b"PROXY ";
        }
        if !moved {
            break false;
        }
    };
    if !is_proxy {
        return Ok(None);
    }

    let mut want = 16;
    let line_end = loop {
        let (buf, moved) = stack.read_ahead(want).await?;
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            break pos;
        }
        if buf.len() >= MAX_PREAMBLE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "PROXY preamble too long",
            ));
        }
        if !moved && buf.len() < want {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside PROXY preamble",
            ));
        }
        want = (want + 16).min(MAX_PREAMBLE);
    };

    let line = String::from_utf8_lossy(&stack.peek_buf[..line_end]).to_string();
    stack.consume(line_end + 2);

    let mut parts = line.split(' ');
    let _proxy = parts.next();
    let proto = parts.next().unwrap_or_default();
    if proto == "UNKNOWN" {
        return Ok(None);
    }
    let (Some(src), Some(dst), Some(sport), Some(dport)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed PROXY preamble",
        ));
    };
    let parse = |host: &str, port: &str| -> io::Result<SocketAddr> {
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad PROXY port"))?;
        let ip: std::net::IpAddr = host
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad PROXY address"))?;
        Ok(SocketAddr::new(ip, port))
    };
    let src = parse(src, sport)?;
    let dst = parse(dst, dport)?;
    stack.peer_addr = Some(src);
    tracing::debug!(%src, %dst, "proxy protocol preamble consumed");
    Ok(Some((src, dst)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn read_ahead_is_non_destructive() {
        let (mut client, server) = pair().await;
        client.write_all(b"<13>hello\n").await.unwrap();

        let mut stack = TransportStack::new_tcp(server);
        let (peeked, moved) = stack.read_ahead(4).await.unwrap();
        assert_eq!(peeked, b"<13>");
        assert!(moved);

        // the peeked bytes come back out of read()
        let mut buf = [0u8; 10];
        let n = stack.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<13>");
        let n = stack.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[tokio::test]
    async fn proxy_preamble_is_stripped() {
        let (mut client, server) = pair().await;
        client
            .write_all(b"PROXY TCP4 192.168.0.1 10.0.0.1 56324 514\r\n<13>m\n")
            .await
            .unwrap();

        let mut stack = TransportStack::new_tcp(server);
        let addrs = strip_proxy_protocol(&mut stack).await.unwrap();
        let (src, dst) = addrs.unwrap();
        assert_eq!(src.to_string(), "192.168.0.1:56324");
        assert_eq!(dst.to_string(), "10.0.0.1:514");
        assert_eq!(stack.peer_addr, Some(src));

        let mut buf = [0u8; 16];
        let n = stack.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<13>m\n");
    }

    #[tokio::test]
    async fn non_proxy_connections_pass_through() {
        let (mut client, server) = pair().await;
        client.write_all(b"<13>direct\n").await.unwrap();

        let mut stack = TransportStack::new_tcp(server);
        assert!(strip_proxy_protocol(&mut stack).await.unwrap().is_none());
        let mut buf = [0u8; 16];
        let n = stack.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<13>direct\n");
    }
}
