// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine logging: a layered `tracing` subscriber with a runtime
//! reloadable filter (the control socket's `LOG LEVEL` command) and a
//! fan-out writer that lets a control connection attach to the live log
//! stream for a while.

use std::io::Write;
use std::sync::OnceLock;

use tokio::sync::broadcast;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

static ATTACH_CHANNEL: OnceLock<broadcast::Sender<Vec<u8>>> = OnceLock::new();

fn attach_channel() -> &'static broadcast::Sender<Vec<u8>> {
    ATTACH_CHANNEL.get_or_init(|| broadcast::channel(1024).0)
}

/// Subscribe to the live log stream (`ATTACH LOGS`).
pub fn attach_subscribe() -> broadcast::Receiver<Vec<u8>> {
    attach_channel().subscribe()
}

/// Writes to stderr and tees into the attach channel when anyone
/// listens.
#[derive(Clone, Default)]
pub struct FanoutWriter;

pub struct FanoutGuard;

impl Write for FanoutGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let sender = attach_channel();
        if sender.receiver_count() > 0 {
            let _ = sender.send(buf.to_vec());
        }
        std::io::stderr().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for FanoutWriter {
    type Writer = FanoutGuard;

    fn make_writer(&'a self) -> FanoutGuard {
        FanoutGuard
    }
}

/// Handle for adjusting the log level at runtime.
pub struct LogController {
    filter_handle: reload::Handle<EnvFilter, Registry>,
}

impl LogController {
    /// Map the control protocol's numeric verbosity to a filter.
    pub fn set_level(&self, level: u8) -> Result<(), String> {
        let filter = match level {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        self.filter_handle
            .reload(EnvFilter::default().add_directive(filter.into()))
            .map_err(|err| err.to_string())
    }
}

/// Install the global subscriber. Returns the reload handle; errors if a
/// subscriber is already set (tests).
pub fn init() -> Option<LogController> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::INFO.into()));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(FanoutWriter)
        .with_target(true);

    let result = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init();
    match result {
        Ok(()) => Some(LogController { filter_handle }),
        Err(_) => None,
    }
}
