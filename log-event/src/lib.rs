// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Core event data model for the log pipeline.
//!
//! The crate provides the reference-counted, copy-on-write event record
//! ([`LogRecord`]/[`LogMessage`]), its packed name-value storage
//! ([`NvTable`]), the process-global name and tag registries, typed
//! values, multi-layer timestamps and the lock-free acknowledgement
//! tracker that drives back-pressure end to end.

pub mod ack;
pub mod nvtable;
pub mod record;
pub mod registry;
pub mod tags;
pub mod timestamp;
pub mod value;

pub use ack::{AckCallback, AckOutcome};
pub use nvtable::{NvTable, NvTableError};
pub use record::{lf, LogMessage, LogRecord, PathOptions};
pub use registry::{builtin, get_handle, NVHandle};
pub use tags::{get_tag_id, TagId, TagSet};
pub use timestamp::{StampKind, UnixTime};
pub use value::ValueType;
