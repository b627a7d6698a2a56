// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The main loop.
//!
//! The main task owns the configuration, the control socket, signal
//! handling and the timer wheel. Sources and destination workers run on
//! the shared runtime; reconfiguration quiesces them through the worker
//! sync barrier, persists the queues, rebuilds the graph from the new
//! configuration and restarts. A reload that fails validation leaves
//! the running configuration untouched.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use log_event::LogRecord;
use log_pipeline::{Fork, NodeRef, PipelineNode, Template, TemplateOptions};
use log_queue::{DiskQueue, DiskQueueOptions, LogQueue, MemQueue, QDiskOptions};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{
    DestinationConfig, DestinationTarget, EngineConfig, QueueKind, SourceTransport,
};
use crate::control::{ControlCommand, ControlRequest, ControlResponse, ControlServer};
use crate::dest::{DestTarget, DestinationNode, DestinationWorker, SharedQueue};
use crate::logging::LogController;
use crate::source::{SocketSource, UdpSource};
use crate::timer::{TimerWheel, WakeUp};
use crate::worker::WorkerPool;

struct Destination {
    id: String,
    queue: SharedQueue,
    notify: Arc<Notify>,
    node: NodeRef,
    reopen: Arc<AtomicBool>,
}

struct RunningGraph {
    source_cancel: CancellationToken,
    source_tasks: Vec<JoinHandle<()>>,
    source_addrs: Vec<(String, std::net::SocketAddr)>,
    destinations: Vec<Destination>,
    pool: WorkerPool,
    /// Workers built but not yet spawned onto the pool.
    pending_workers: Vec<DestinationWorker>,
}

fn build_queue(
    cfg: &EngineConfig,
    dest: &DestinationConfig,
) -> anyhow::Result<Box<dyn LogQueue>> {
    Ok(match dest.queue.kind {
        QueueKind::Memory => Box::new(MemQueue::new(dest.queue.capacity)),
        QueueKind::Disk | QueueKind::DiskReliable => {
            let path = cfg
                .queue_file(dest)
                .context("disk queue without persist_dir")?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let opts = DiskQueueOptions {
                reliable: dest.queue.kind == QueueKind::DiskReliable,
                disk: QDiskOptions {
                    max_size: dest.queue.disk_max_bytes,
                    sync_freq: dest.queue.sync_freq,
                },
                front_cache_size: dest.queue.front_cache_size,
                window_size: dest.queue.window_size,
            };
            Box::new(
                DiskQueue::start(&path, opts)
                    .with_context(|| format!("opening queue file {}", path.display()))?,
            )
        }
    })
}

async fn build_graph(cfg: &EngineConfig) -> anyhow::Result<RunningGraph> {
    let mut destinations = Vec::new();
    let mut pending_workers = Vec::new();

    for dest_cfg in &cfg.destinations {
        let queue: SharedQueue = Arc::new(Mutex::new(build_queue(cfg, dest_cfg)?));
        let notify = Arc::new(Notify::new());
        let reopen = Arc::new(AtomicBool::new(false));
        let template = Template::compile(&dest_cfg.template)
            .with_context(|| format!("destination {:?}", dest_cfg.id))?;
        let target = match &dest_cfg.target {
            DestinationTarget::Tcp { address } => DestTarget::Tcp {
                address: address.clone(),
            },
            DestinationTarget::File { path } => DestTarget::File { path: path.clone() },
        };

        let node: NodeRef = Arc::new(DestinationNode::new(
            dest_cfg.id.clone(),
            Arc::clone(&queue),
            Arc::clone(&notify),
        ));
        let worker = DestinationWorker::new(
            dest_cfg.id.clone(),
            Arc::clone(&queue),
            Arc::clone(&notify),
            template,
            TemplateOptions::default(),
            target,
            Arc::clone(&reopen),
        );
        pending_workers.push(worker);
        destinations.push(Destination {
            id: dest_cfg.id.clone(),
            queue,
            notify,
            node,
            reopen,
        });
    }

    // every source feeds every destination; richer topologies belong to
    // the configuration grammar, which lives outside the core
    let root: NodeRef = Arc::new(Fork::new(
        destinations.iter().map(|d| d.node.clone()).collect(),
    ));

    let source_cancel = CancellationToken::new();
    let mut source_tasks = Vec::new();
    let mut source_addrs = Vec::new();
    for source_cfg in &cfg.sources {
        match source_cfg.transport {
            SourceTransport::Tcp => {
                let (source, addr) =
                    SocketSource::bind(source_cfg, root.clone(), source_cancel.child_token())
                        .await
                        .with_context(|| format!("source {:?}", source_cfg.id))?;
                source_addrs.push((source_cfg.id.clone(), addr));
                source_tasks.push(tokio::spawn(source.run()));
            }
            SourceTransport::Udp => {
                let (source, addr) =
                    UdpSource::bind(source_cfg, root.clone(), source_cancel.child_token())
                        .await
                        .with_context(|| format!("source {:?}", source_cfg.id))?;
                source_addrs.push((source_cfg.id.clone(), addr));
                source_tasks.push(tokio::spawn(source.run()));
            }
        }
    }

    Ok(RunningGraph {
        source_cancel,
        source_tasks,
        source_addrs,
        destinations,
        pool: WorkerPool::new(),
        pending_workers,
    })
}

impl RunningGraph {
    fn start_workers(&mut self, rt: &Handle) {
        for worker in self.pending_workers.drain(..) {
            let name = worker.id.clone();
            self.pool
                .spawn(&name, rt, move |checkpoint| worker.run(checkpoint));
        }
    }

    /// Quiesce everything and persist the queues. Returns how many
    /// records were persisted across destinations.
    ///
    /// Workers stop through the pool's barrier, so no delivery is in
    /// flight when the queues fold their state back to disk.
    async fn teardown(mut self) -> usize {
        self.source_cancel.cancel();
        for task in &mut self.source_tasks {
            let _ = task.await;
        }
        self.pool.shutdown().await;
        let mut persisted = 0;
        for dest in &self.destinations {
            let mut queue = dest.queue.lock().unwrap();
            let kept = queue.len();
            if queue.stop() {
                persisted += kept;
            }
        }
        persisted
    }

    fn stats(&self) -> String {
        let mut out = String::new();
        for dest in &self.destinations {
            let queue = dest.queue.lock().unwrap();
            out.push_str(&format!(
                "destination {} queued={} dropped={} memory_bytes={}\n",
                dest.id,
                queue.len(),
                queue.dropped(),
                queue.memory_usage_bytes()
            ));
        }
        out
    }

    fn emit_mark(&self) {
        for dest in &self.destinations {
            let mark = LogRecord::new_mark().into_message();
            dest.node
                .queue(mark, &log_event::PathOptions::default());
            dest.notify.notify_one();
        }
    }
}

pub struct Engine {
    cfg: EngineConfig,
    cfg_path: Option<PathBuf>,
    log_controller: Option<LogController>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        cfg_path: Option<PathBuf>,
        log_controller: Option<LogController>,
    ) -> Engine {
        Engine {
            cfg,
            cfg_path,
            log_controller,
        }
    }

    /// Run until STOP or a termination signal.
    pub async fn run(mut self) -> anyhow::Result<()> {
        log_pipeline::macros::mark_process_start();
        let rt = Handle::current();

        let mut graph = build_graph(&self.cfg).await?;
        graph.start_workers(&rt);
        tracing::info!(config_id = self.cfg.config_id(), "engine started");

        let control_cancel = CancellationToken::new();
        let (control_tx, mut control_rx) = mpsc::channel::<ControlCommand>(16);
        if let Some(path) = self.cfg.control_socket.clone() {
            let server = ControlServer::bind(&path, control_tx.clone(), control_cancel.clone())?;
            tokio::spawn(server.run());
        }

        let mut wheel = TimerWheel::new(256, Duration::from_secs(1));
        wheel.schedule(
            Duration::from_secs(self.cfg.mark_interval_secs),
            WakeUp::Mark,
        );
        let mut ticker = tokio::time::interval(wheel.tick_len());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("termination signal received, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    if let Err(err) = self.reload(&mut graph, &rt).await {
                        tracing::error!(%err, "reload failed, keeping previous configuration");
                    }
                }
                _ = ticker.tick() => {
                    for wakeup in wheel.advance() {
                        match wakeup {
                            WakeUp::Mark => {
                                graph.emit_mark();
                                wheel.schedule(
                                    Duration::from_secs(self.cfg.mark_interval_secs),
                                    WakeUp::Mark,
                                );
                            }
                            WakeUp::RetryDestination { id } => {
                                if let Some(dest) =
                                    graph.destinations.iter().find(|d| d.id == id)
                                {
                                    dest.notify.notify_one();
                                }
                            }
                        }
                    }
                }
                command = control_rx.recv() => {
                    let Some(command) = command else { continue };
                    if self.handle_command(command, &mut graph, &rt).await {
                        break;
                    }
                }
            }
        }

        control_cancel.cancel();
        let persisted = graph.teardown().await;
        tracing::info!(persisted, "engine stopped");
        Ok(())
    }

    /// Returns true when the engine should stop.
    async fn handle_command(
        &mut self,
        command: ControlCommand,
        graph: &mut RunningGraph,
        rt: &Handle,
    ) -> bool {
        let ControlCommand { request, respond } = command;
        let response = match request {
            ControlRequest::Stop => {
                let _ = respond.send(ControlResponse::Ok);
                return true;
            }
            ControlRequest::Reload => match self.reload(graph, rt).await {
                Ok(()) => ControlResponse::Ok,
                Err(err) => ControlResponse::Fail(err.to_string()),
            },
            ControlRequest::Reopen => {
                // flip every handle behind the sync barrier so no write
                // races the cycle
                graph
                    .pool
                    .sync_call(|| {
                        for dest in &graph.destinations {
                            dest.reopen.store(true, Ordering::Release);
                        }
                    })
                    .await;
                for dest in &graph.destinations {
                    dest.notify.notify_one();
                }
                ControlResponse::Ok
            }
            ControlRequest::LogLevel(level) => match &self.log_controller {
                Some(controller) => match controller.set_level(level) {
                    Ok(()) => ControlResponse::Ok,
                    Err(reason) => ControlResponse::Fail(reason),
                },
                None => ControlResponse::Fail("log controller unavailable".into()),
            },
            ControlRequest::ConfigId => ControlResponse::OkPayload(self.cfg.config_id()),
            ControlRequest::ConfigGet => match serde_json::to_string_pretty(&self.cfg) {
                Ok(json) => ControlResponse::OkPayload(json),
                Err(err) => ControlResponse::Fail(err.to_string()),
            },
            ControlRequest::ConfigVerify => match self.load_candidate() {
                Ok(_) => ControlResponse::Ok,
                Err(err) => ControlResponse::Fail(err.to_string()),
            },
            ControlRequest::ListFiles => {
                let mut listing = String::new();
                if let Some(path) = &self.cfg_path {
                    listing.push_str(&format!("config {}\n", path.display()));
                }
                for dest_cfg in &self.cfg.destinations {
                    if let Some(path) = self.cfg.queue_file(dest_cfg) {
                        listing.push_str(&format!("queue {}\n", path.display()));
                    }
                }
                ControlResponse::OkPayload(listing)
            }
            ControlRequest::ExportConfigGraph => {
                let mut out = String::new();
                for (id, addr) in &graph.source_addrs {
                    out.push_str(&format!("source {id} listen {addr}\n"));
                }
                for dest in &graph.destinations {
                    for (id, _) in &graph.source_addrs {
                        out.push_str(&format!("edge {id} -> {}\n", dest.id));
                    }
                }
                ControlResponse::OkPayload(out)
            }
            ControlRequest::Stats => ControlResponse::OkPayload(graph.stats()),
            ControlRequest::AttachLogs { seconds, level } => {
                if let (Some(level), Some(controller)) = (level, &self.log_controller) {
                    let _ = controller.set_level(level);
                }
                ControlResponse::AttachLogs { seconds }
            }
        };
        let _ = respond.send(response);
        false
    }

    fn load_candidate(&self) -> anyhow::Result<EngineConfig> {
        let path = self
            .cfg_path
            .as_ref()
            .context("engine was started without a configuration file")?;
        Ok(EngineConfig::load(path)?)
    }

    /// Replace the running graph with one built from the on-disk
    /// configuration. In-flight records survive via the durable queues'
    /// `stop()`.
    async fn reload(&mut self, graph: &mut RunningGraph, rt: &Handle) -> anyhow::Result<()> {
        let candidate = self.load_candidate()?;
        tracing::info!(config_id = candidate.config_id(), "reloading");

        let old = std::mem::replace(graph, build_placeholder());
        let persisted = old.teardown().await;
        tracing::debug!(persisted, "previous graph drained");

        match build_graph(&candidate).await {
            Ok(mut fresh) => {
                fresh.start_workers(rt);
                *graph = fresh;
                self.cfg = candidate;
                tracing::info!("reload complete");
                Ok(())
            }
            Err(err) => {
                // try to restore the previous configuration
                tracing::error!(%err, "new configuration failed to start, rolling back");
                let mut rollback = build_graph(&self.cfg).await?;
                rollback.start_workers(rt);
                *graph = rollback;
                Err(err)
            }
        }
    }
}

fn build_placeholder() -> RunningGraph {
    RunningGraph {
        source_cancel: CancellationToken::new(),
        source_tasks: Vec::new(),
        source_addrs: Vec::new(),
        destinations: Vec::new(),
        pool: WorkerPool::new(),
        pending_workers: Vec::new(),
    }
}
