// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The TCP socket source driver.
//!
//! Accepts connections, runs the auto-detecting protocol server over
//! each, parses records with the syslog parser and queues them into the
//! pipeline head. With flow control enabled every in-flight record holds
//! a window slot; the slot frees when the record's ack arrives, so a
//! congested destination suspends the reader instead of flooding it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log_event::{LogRecord, PathOptions, StampKind, UnixTime};
use log_pipeline::{NodeRef, PipelineNode, SyslogParser};
use log_proto::{
    strip_proxy_protocol, AutoDetectServer, AutoDetectServerOptions, TransportStack,
};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{SourceConfig, TlsFiles};

/// In-flight records per source before the reader suspends.
const FLOW_CONTROL_WINDOW: usize = 1024;

pub struct SocketSource {
    pub id: String,
    listener: TcpListener,
    pipeline: NodeRef,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    proxy_protocol: bool,
    flow_control: bool,
    host_id: u32,
    cancel: CancellationToken,
    window: Arc<Semaphore>,
}

/// Load server-side TLS material from PEM files.
pub fn load_tls_config(files: &TlsFiles) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        &files.cert_file,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        &files.key_file,
    )?))?
    .ok_or_else(|| anyhow::anyhow!("no private key in {}", files.key_file.display()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

impl SocketSource {
    /// Bind the listener; returns the actual local address (useful with
    /// port 0).
    pub async fn bind(
        config: &SourceConfig,
        pipeline: NodeRef,
        cancel: CancellationToken,
    ) -> anyhow::Result<(SocketSource, SocketAddr)> {
        let listener = TcpListener::bind(&config.listen).await?;
        let local = listener.local_addr()?;
        let tls_config = match &config.tls {
            Some(files) => Some(load_tls_config(files)?),
            None => None,
        };
        let mut hasher = DefaultHasher::new();
        config.id.hash(&mut hasher);
        let source = SocketSource {
            id: config.id.clone(),
            listener,
            pipeline,
            tls_config,
            proxy_protocol: config.proxy_protocol,
            flow_control: config.flow_control,
            host_id: hasher.finish() as u32,
            cancel,
            window: Arc::new(Semaphore::new(FLOW_CONTROL_WINDOW)),
        };
        Ok((source, local))
    }

    /// Accept loop; runs until cancelled.
    pub async fn run(self) {
        tracing::info!(source = self.id, "source listening");
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(source = self.id, %err, "accept failed");
                    continue;
                }
            };
            tracing::debug!(source = self.id, %peer, "connection accepted");
            let conn = Connection {
                source_id: self.id.clone(),
                pipeline: self.pipeline.clone(),
                tls_config: self.tls_config.clone(),
                proxy_protocol: self.proxy_protocol,
                flow_control: self.flow_control,
                host_id: self.host_id,
                window: Arc::clone(&self.window),
                cancel: self.cancel.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = conn.run(stream).await {
                    tracing::debug!(%err, "connection closed with error");
                }
            });
        }
        tracing::info!(source = self.id, "source stopped");
    }
}

/// Datagram source: one datagram, one record.
///
/// Datagrams cannot back-pressure the sender, so flow control never
/// applies; when a queue is full the record is dropped and counted
/// there.
pub struct UdpSource {
    pub id: String,
    socket: UdpSocket,
    pipeline: NodeRef,
    host_id: u32,
    cancel: CancellationToken,
}

impl UdpSource {
    pub async fn bind(
        config: &SourceConfig,
        pipeline: NodeRef,
        cancel: CancellationToken,
    ) -> anyhow::Result<(UdpSource, SocketAddr)> {
        let socket = UdpSocket::bind(&config.listen).await?;
        let local = socket.local_addr()?;
        let mut hasher = DefaultHasher::new();
        config.id.hash(&mut hasher);
        let source = UdpSource {
            id: config.id.clone(),
            socket,
            pipeline,
            host_id: hasher.finish() as u32,
            cancel,
        };
        Ok((source, local))
    }

    pub async fn run(self) {
        tracing::info!(source = self.id, "source listening (udp)");
        let parser = SyslogParser::default();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, peer) = match received {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(source = self.id, %err, "recv failed");
                    continue;
                }
            };
            if len == 0 {
                continue;
            }
            let frame = &buf[..len];
            let mut record = LogRecord::new_sized(frame.len() + 256);
            record.set_timestamp(StampKind::Received, UnixTime::now());
            record.host_id = self.host_id;
            record.proto = 17; // IPPROTO_UDP
            record.set_source_addr(peer);
            if let Err(err) = parser.parse(&mut record, frame) {
                tracing::debug!(source = self.id, %err, "unparseable datagram dropped");
                continue;
            }
            self.pipeline
                .queue(record.into_message(), &PathOptions::default());
        }
        tracing::info!(source = self.id, "source stopped");
    }
}

struct Connection {
    source_id: String,
    pipeline: NodeRef,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    proxy_protocol: bool,
    flow_control: bool,
    host_id: u32,
    window: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self, stream: TcpStream) -> Result<(), log_proto::ProtoError> {
        let mut stack = TransportStack::new_tcp(stream);
        if self.proxy_protocol {
            strip_proxy_protocol(&mut stack).await?;
        }
        let peer = stack.peer_addr;

        let opts = AutoDetectServerOptions {
            tls_config: self.tls_config.clone(),
            ..Default::default()
        };
        let mut server = AutoDetectServer::new(stack, opts);
        let parser = SyslogParser::default();

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = server.fetch() => frame?,
            };
            let Some(frame) = frame else {
                break;
            };
            if frame.is_empty() {
                continue;
            }
            self.post(&parser, &frame, peer).await;
        }
        server.close().await;
        Ok(())
    }

    /// Turn one wire record into an event and hand it to the pipeline.
    async fn post(&self, parser: &SyslogParser, frame: &[u8], peer: Option<SocketAddr>) {
        let mut record = LogRecord::new_sized(frame.len() + 256);
        record.set_timestamp(StampKind::Received, UnixTime::now());
        record.host_id = self.host_id;
        record.proto = 6; // IPPROTO_TCP
        if let Some(peer) = peer {
            record.set_source_addr(peer);
        }
        if let Err(err) = parser.parse(&mut record, frame) {
            tracing::debug!(source = self.source_id, %err, "unparseable record dropped");
            return;
        }

        let path_options = PathOptions {
            ack_needed: self.flow_control,
            flow_control_requested: self.flow_control,
            matched: None,
        };
        if self.flow_control {
            // suspend the reader while the window is exhausted
            let permit = match Arc::clone(&self.window).acquire_owned().await {
                Ok(permit) => permit,
                Err(_closed) => return,
            };
            let slot = Mutex::new(Some(permit));
            record.set_ack_callback(Arc::new(move |_msg, _outcome| {
                slot.lock().unwrap().take();
            }));
        }
        let msg = record.into_message();
        msg.add_ack(&path_options);
        self.pipeline.queue(msg, &path_options);
    }
}
