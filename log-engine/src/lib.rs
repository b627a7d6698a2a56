// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine assembly: configuration, logging, the worker pool, the timer
//! wheel, the control socket, and the reference socket source and
//! tcp/file destination drivers wired around the core crates.

pub mod config;
pub mod control;
pub mod dest;
pub mod engine;
pub mod logging;
pub mod source;
pub mod timer;
pub mod worker;

pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use worker::{Checkpoint, WorkerPool};
