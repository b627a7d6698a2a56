// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The protocol auto-detecting server.
//!
//! A freshly accepted stream connection is sniffed (up to 16 bytes,
//! non-destructively) and routed to octet-counted framing, newline
//! framing, or a TLS handshake whose decrypted stream is sniffed again.
//! The state machine:
//!
//! ```text
//! Detect ──TLS──▶ TlsHandshake ──▶ Detect (tls no longer eligible)
//!   │ digit  ─▶ Framed ──▶ ... records ... ──▶ Closed
//!   │ '<'    ─▶ Text   ──▶ ... records ... ──▶ Closed
//!   │ binary ─▶ Error
//!   └ timeout ─▶ Text (best effort)
//! ```

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::detect::{self, Detection};
use crate::framing::{FramingError, LineDecoder, OctetCountedDecoder};
use crate::transport::TransportStack;

const DETECT_WINDOW: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("peer sent a TLS alert (level {level}, description {desc})")]
    TlsAlert { level: u8, desc: u8 },
    #[error("unrecognizable binary data on connection")]
    BinaryData,
    #[error("TLS connection attempted but no TLS context is configured")]
    TlsNotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Detect,
    TlsHandshake,
    Framed,
    Text,
    Error,
    Closed,
}

pub struct AutoDetectServerOptions {
    /// Fall back to text framing when the sniff window does not fill in
    /// time.
    pub detect_timeout: Duration,
    pub max_record: usize,
    #[cfg(feature = "tls")]
    pub tls_config: Option<std::sync::Arc<rustls::ServerConfig>>,
}

impl Default for AutoDetectServerOptions {
    fn default() -> Self {
        AutoDetectServerOptions {
            detect_timeout: Duration::from_secs(10),
            max_record: 64 * 1024,
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

/// Server side of one connection; yields complete records.
pub struct AutoDetectServer {
    stack: TransportStack,
    state: ServerState,
    opts: AutoDetectServerOptions,
    buf: BytesMut,
    octet: OctetCountedDecoder,
    line: LineDecoder,
    tls_done: bool,
    eof: bool,
}

impl AutoDetectServer {
    pub fn new(stack: TransportStack, opts: AutoDetectServerOptions) -> AutoDetectServer {
        let max_record = opts.max_record;
        AutoDetectServer {
            stack,
            state: ServerState::Detect,
            opts,
            buf: BytesMut::with_capacity(8 * 1024),
            octet: OctetCountedDecoder { max_record },
            line: LineDecoder {
                max_line: max_record,
                ..Default::default()
            },
            tls_done: false,
            eof: false,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn stack(&self) -> &TransportStack {
        &self.stack
    }

    /// Fetch the next record; `None` means the peer closed cleanly.
    pub async fn fetch(&mut self) -> Result<Option<Bytes>, ProtoError> {
        loop {
            match self.state {
                ServerState::Detect => self.run_detection().await?,
                ServerState::TlsHandshake => self.run_tls_handshake().await?,
                ServerState::Framed | ServerState::Text => {
                    match self.next_frame().await {
                        Ok(frame) => return Ok(frame),
                        Err(err) => {
                            self.state = ServerState::Error;
                            return Err(err);
                        }
                    }
                }
                ServerState::Error | ServerState::Closed => return Ok(None),
            }
        }
    }

    async fn run_detection(&mut self) -> Result<(), ProtoError> {
        let deadline = tokio::time::Instant::now() + self.opts.detect_timeout;
        let tls_eligible = self.tls_eligible();
        loop {
            let sniff =
                tokio::time::timeout_at(deadline, self.stack.read_ahead(DETECT_WINDOW)).await;
            let (prefix_len, moved, decision) = match sniff {
                Ok(result) => {
                    let (prefix, moved) = result?;
                    (prefix.len(), moved, detect::detect(prefix, tls_eligible))
                }
                Err(_elapsed) => {
                    tracing::debug!("detection window timed out, assuming text framing");
                    self.state = ServerState::Text;
                    return Ok(());
                }
            };
            if prefix_len == 0 && !moved {
                self.state = ServerState::Closed;
                return Ok(());
            }

            match decision {
                Detection::NeedMoreData => {
                    if prefix_len >= DETECT_WINDOW || !moved {
                        // never going to know more; best-effort text
                        self.state = ServerState::Text;
                        return Ok(());
                    }
                }
                Detection::TlsHandshake => {
                    self.state = ServerState::TlsHandshake;
                    return Ok(());
                }
                Detection::TlsAlert(level, desc) => {
                    tracing::info!(level, desc, "TLS alert during detection, closing");
                    self.state = ServerState::Error;
                    return Err(ProtoError::TlsAlert { level, desc });
                }
                Detection::Framed => {
                    tracing::debug!("auto-detected octet-counted framing");
                    self.state = ServerState::Framed;
                    return Ok(());
                }
                Detection::Text => {
                    tracing::debug!("auto-detected non-transparent framing");
                    self.state = ServerState::Text;
                    return Ok(());
                }
                Detection::Binary => {
                    self.state = ServerState::Error;
                    return Err(ProtoError::BinaryData);
                }
            }
        }
    }

    fn tls_eligible(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            !self.tls_done
        }
        #[cfg(not(feature = "tls"))]
        {
            !self.tls_done && false
        }
    }

    #[cfg(feature = "tls")]
    async fn run_tls_handshake(&mut self) -> Result<(), ProtoError> {
        let Some(config) = self.opts.tls_config.clone() else {
            self.state = ServerState::Error;
            return Err(ProtoError::TlsNotConfigured);
        };
        self.stack.switch_to_tls(config).await?;
        self.tls_done = true;
        // sniff the decrypted stream for its actual framing
        self.state = ServerState::Detect;
        tracing::debug!("TLS handshake detected, switched to TLS");
        Ok(())
    }

    #[cfg(not(feature = "tls"))]
    async fn run_tls_handshake(&mut self) -> Result<(), ProtoError> {
        self.state = ServerState::Error;
        Err(ProtoError::TlsNotConfigured)
    }

    async fn next_frame(&mut self) -> Result<Option<Bytes>, ProtoError> {
        loop {
            let frame = match self.state {
                ServerState::Framed => self.octet.decode(&mut self.buf)?,
                _ => {
                    if self.eof {
                        self.line.decode_eof(&mut self.buf)?
                    } else {
                        self.line.decode(&mut self.buf)?
                    }
                }
            };
            if let Some(frame) = frame {
                return Ok(Some(frame));
            }
            if self.eof {
                self.state = ServerState::Closed;
                return Ok(None);
            }

            let mut chunk = [0u8; 8192];
            let n = self.stack.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Tear the connection down.
    pub async fn close(&mut self) {
        let _ = self.stack.shutdown().await;
        self.state = ServerState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn server_for(payload: &'static [u8]) -> AutoDetectServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(payload).await.unwrap();
            // close the write side so the server sees EOF
        });
        let (stream, _) = listener.accept().await.unwrap();
        AutoDetectServer::new(
            TransportStack::new_tcp(stream),
            AutoDetectServerOptions::default(),
        )
    }

    #[tokio::test]
    async fn detects_text_framing() {
        let mut server = server_for(b"<13>first message\n<14>second message\n").await;
        let rec = server.fetch().await.unwrap().unwrap();
        assert_eq!(rec, "<13>first message");
        assert_eq!(server.state(), ServerState::Text);
        let rec = server.fetch().await.unwrap().unwrap();
        assert_eq!(rec, "<14>second message");
        assert!(server.fetch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detects_octet_counted_framing() {
        let mut server = server_for(b"17 <13>hello framed!19 <14>a second record").await;
        let rec = server.fetch().await.unwrap().unwrap();
        assert_eq!(rec, "<13>hello framed!");
        assert_eq!(server.state(), ServerState::Framed);
        let rec = server.fetch().await.unwrap().unwrap();
        assert_eq!(rec, "<14>a second record");
        assert!(server.fetch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn binary_data_is_rejected() {
        let mut server = server_for(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05]).await;
        assert!(matches!(
            server.fetch().await,
            Err(ProtoError::BinaryData)
        ));
        assert_eq!(server.state(), ServerState::Error);
    }

    #[tokio::test]
    async fn tls_alert_is_rejected_with_fields() {
        let mut server = server_for(&[0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x28, 0, 0]).await;
        match server.fetch().await {
            Err(ProtoError::TlsAlert { level, desc }) => {
                assert_eq!(level, 2);
                assert_eq!(desc, 0x28);
            }
            other => panic!("expected TLS alert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_text_line_is_delivered_on_eof() {
        // fewer than 16 bytes and no newline: detection settles via EOF,
        // the partial line flushes as one record
        let mut server = server_for(b"<13>tiny").await;
        let rec = server.fetch().await.unwrap().unwrap();
        assert_eq!(rec, "<13>tiny");
        assert!(server.fetch().await.unwrap().is_none());
    }
}
