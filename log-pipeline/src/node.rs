// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The uniform pipeline node contract.
//!
//! Every pipeline element (filters, rewrites, parsers, destinations)
//! implements [`PipelineNode`]. `queue` takes ownership of one reference
//! to the message and either consumes it (acking it) or forwards it to
//! the node's next hop. Traversal within a worker is synchronous and
//! never suspends; nodes that must wait (a full queue under back-pressure)
//! hand the message over and return.

use std::sync::Arc;

use log_event::{AckOutcome, LogMessage, PathOptions};

/// Node behavior flags.
pub mod node_flags {
    /// Branch is only taken when no other branch matched.
    pub const FALLBACK: u32 = 0x0001;
    /// The node absorbs messages instead of letting them continue.
    pub const FINAL: u32 = 0x0002;
    /// Ack as soon as the node matched, without waiting for delivery.
    pub const MATCH_ACK: u32 = 0x0004;
    /// Debugger breakpoint marker.
    pub const BREAKPOINT: u32 = 0x0008;
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("node {node}: {reason}")]
    InitFailed { node: String, reason: String },
    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),
    #[error("invalid rewrite: {0}")]
    InvalidRewrite(String),
}

/// Shared handle to a pipeline node.
pub type NodeRef = Arc<dyn PipelineNode>;

pub trait PipelineNode: Send + Sync {
    /// Prepare the node; called once before traffic, in graph order.
    fn init(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Tear the node down; called on shutdown or config replacement.
    fn deinit(&self) {}

    /// Process one message, consuming one reference.
    fn queue(&self, msg: LogMessage, path_options: &PathOptions<'_>);

    fn flags(&self) -> u32 {
        0
    }

    /// Human-readable location for diagnostics.
    fn node_info(&self) -> &str;
}

/// Forward to `next` when present, otherwise the path ends here and the
/// message is acked as processed.
pub fn forward_or_ack(next: Option<&NodeRef>, msg: LogMessage, path_options: &PathOptions<'_>) {
    match next {
        Some(node) => node.queue(msg, path_options),
        None => msg.ack(path_options, AckOutcome::Processed),
    }
}

/// Consume a message without delivering it.
pub fn drop_message(msg: LogMessage, path_options: &PathOptions<'_>) {
    msg.ack(path_options, AckOutcome::Processed);
}
