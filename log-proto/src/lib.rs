// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol plumbing: the switchable transport stack with
//! non-destructive lookahead, syslog framings, and the server state
//! machine that sniffs a connection's first bytes to choose between
//! octet-counted framing, newline framing and TLS.

pub mod detect;
pub mod framing;
pub mod server;
pub mod transport;

pub use detect::{detect, Detection, Probe};
pub use framing::{FramingError, LineDecoder, OctetCountedDecoder, OCTET_COUNT_LIMIT};
pub use server::{AutoDetectServer, AutoDetectServerOptions, ProtoError, ServerState};
pub use transport::{strip_proxy_protocol, ReplayStream, TransportStack};
