// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination drivers: the pipeline node feeding a durable queue and
//! the worker that drains it.
//!
//! The node side is synchronous and cheap: push into the queue, wake
//! the worker. The worker renders each record through the destination's
//! template and writes it to the transport; a failed write rewinds the
//! record into the queue head and backs off exponentially before
//! reconnecting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log_event::{LogMessage, PathOptions};
use log_pipeline::{PipelineNode, Template, TemplateOptions};
use log_queue::LogQueue;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::worker::Checkpoint;

/// Queue handle shared by the node (producer side) and worker
/// (consumer side). The mutex is the queue's one internal lock; all
/// operations on it are short.
pub type SharedQueue = Arc<Mutex<Box<dyn LogQueue>>>;

pub struct DestinationNode {
    id: String,
    queue: SharedQueue,
    notify: Arc<Notify>,
}

impl DestinationNode {
    pub fn new(id: String, queue: SharedQueue, notify: Arc<Notify>) -> DestinationNode {
        DestinationNode { id, queue, notify }
    }
}

impl PipelineNode for DestinationNode {
    fn queue(&self, msg: LogMessage, path_options: &PathOptions<'_>) {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push_tail(msg, path_options);
        }
        self.notify.notify_one();
    }

    fn node_info(&self) -> &str {
        &self.id
    }
}

/// Where rendered records go.
pub enum DestTarget {
    Tcp { address: String },
    File { path: PathBuf },
}

enum DestConnection {
    Disconnected,
    Tcp(TcpStream),
    File(tokio::fs::File),
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Drains one destination queue; one loop per destination on the
/// engine's worker pool, parking at its checkpoint between deliveries.
pub struct DestinationWorker {
    pub id: String,
    queue: SharedQueue,
    notify: Arc<Notify>,
    template: Template,
    template_opts: TemplateOptions,
    target: DestTarget,
    connection: DestConnection,
    backoff: Duration,
    seq_num: u32,
    /// Set by the control socket's REOPEN to cycle file handles.
    reopen: Arc<AtomicBool>,
}

impl DestinationWorker {
    pub fn new(
        id: String,
        queue: SharedQueue,
        notify: Arc<Notify>,
        template: Template,
        template_opts: TemplateOptions,
        target: DestTarget,
        reopen: Arc<AtomicBool>,
    ) -> DestinationWorker {
        DestinationWorker {
            id,
            queue,
            notify,
            template,
            template_opts,
            target,
            connection: DestConnection::Disconnected,
            backoff: INITIAL_BACKOFF,
            seq_num: 0,
            reopen,
        }
    }

    async fn connect(&mut self) -> std::io::Result<()> {
        match &self.target {
            DestTarget::Tcp { address } => {
                let stream = TcpStream::connect(address).await?;
                tracing::info!(destination = self.id, address, "connected");
                self.connection = DestConnection::Tcp(stream);
            }
            DestTarget::File { path } => {
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                self.connection = DestConnection::File(file);
            }
        }
        self.backoff = INITIAL_BACKOFF;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.reopen.swap(false, Ordering::AcqRel) {
            self.connection = DestConnection::Disconnected;
        }
        if matches!(self.connection, DestConnection::Disconnected) {
            self.connect().await?;
        }
        match &mut self.connection {
            DestConnection::Tcp(stream) => stream.write_all(bytes).await,
            DestConnection::File(file) => file.write_all(bytes).await,
            DestConnection::Disconnected => unreachable!("connect() either errors or connects"),
        }
    }

    fn pop(&self) -> Option<LogMessage> {
        self.queue.lock().unwrap().pop_head().map(|item| item.msg)
    }

    /// Deliver one record; `false` means the transport failed and the
    /// record was rewound.
    async fn deliver(&mut self, msg: &LogMessage) -> bool {
        self.seq_num = self.seq_num.wrapping_add(1);
        let mut out = String::new();
        self.template
            .format(msg, &self.template_opts, self.seq_num, &mut out);
        match self.write(out.as_bytes()).await {
            Ok(()) => {
                self.queue.lock().unwrap().ack_backlog(1);
                true
            }
            Err(err) => {
                tracing::warn!(
                    destination = self.id,
                    rcpt_id = msg.rcpt_id,
                    %err,
                    "delivery failed, backing off"
                );
                self.connection = DestConnection::Disconnected;
                self.queue.lock().unwrap().rewind_backlog(1);
                self.seq_num = self.seq_num.wrapping_sub(1);
                false
            }
        }
    }

    async fn run_once(&mut self, checkpoint: &Checkpoint) {
        match self.pop() {
            Some(msg) => {
                if !self.deliver(&msg).await {
                    // back off, but fall through to the checkpoint when
                    // the pool wants to quiesce
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = checkpoint.drain_signalled() => {}
                    }
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                }
            }
            None => {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = checkpoint.drain_signalled() => {}
                }
            }
        }
    }

    /// Drive the queue until the pool shuts down.
    pub async fn run(mut self, checkpoint: Checkpoint) {
        // anything left over from an interrupted run goes out again
        let backlog_len = {
            let mut queue = self.queue.lock().unwrap();
            queue.rewind_backlog(usize::MAX);
            queue.len()
        };
        if backlog_len > 0 {
            tracing::debug!(
                destination = self.id,
                pending = backlog_len,
                "resuming with queued records"
            );
        }
        while checkpoint.pause_point().await {
            self.run_once(&checkpoint).await;
        }
        tracing::debug!(destination = self.id, "worker loop exited");
    }
}
