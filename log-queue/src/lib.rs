// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable queueing for the log pipeline.
//!
//! Destinations buffer through a [`LogQueue`]: either the in-memory
//! [`MemQueue`] or the hybrid [`DiskQueue`] backed by a ring file. Both
//! deliver FIFO, track a backlog of delivered-but-unconfirmed messages
//! for rewind after transport failures, and account every in-RAM copy.

pub mod qdisk;
pub mod queue;
pub mod serialize;

pub use qdisk::{QDisk, QDiskError, QDiskOptions};
pub use queue::{DiskQueue, DiskQueueOptions, LogQueue, MemQueue, QueueError, QueueItem};
pub use serialize::{decode_record, encode_record, SerializeError};
