// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline node graph and the template engine.
//!
//! Pipeline elements implement the uniform [`PipelineNode`] contract and
//! compose into a DAG: [`Fork`] makes branching cheap via copy-on-write
//! clones, [`Junction`] picks the first matching branch, filters drop,
//! rewrites mutate and parsers extract. [`Template`] renders a record
//! into its serialized form at the destinations.

pub mod filter;
pub mod fork;
pub mod macros;
pub mod node;
pub mod parser;
pub mod rewrite;
pub mod template;

pub use filter::{FilterExpr, FilterNode};
pub use fork::{Fork, Junction, JunctionBranch};
pub use node::{node_flags, NodeRef, PipelineError, PipelineNode};
pub use parser::{FailurePolicy, ParserNode, SyslogParser};
pub use rewrite::{RewriteNode, RewriteOp};
pub use template::{Template, TemplateError, TemplateOptions, TimestampFormat};
