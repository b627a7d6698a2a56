// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rewrite nodes mutate the record in place (after `make_writable`).

use log_event::{LogMessage, LogRecord, NVHandle, PathOptions, ValueType};
use regex::Regex;

use crate::filter::FilterExpr;
use crate::node::{self, NodeRef, PipelineError, PipelineNode};
use crate::template::{Template, TemplateOptions};

pub enum RewriteOp {
    /// Set a value from an expanded template.
    Set { handle: NVHandle, value: Template },
    /// Unset a value.
    Unset { handle: NVHandle },
    /// Regex substitution on an existing value.
    Subst {
        handle: NVHandle,
        pattern: Regex,
        replacement: String,
        global: bool,
    },
    /// Set a tag by id.
    SetTag(log_event::TagId),
    /// Clear a tag by id.
    ClearTag(log_event::TagId),
}

pub struct RewriteNode {
    op: RewriteOp,
    /// Only rewrite matching records; others pass through unchanged.
    condition: Option<FilterExpr>,
    next: Option<NodeRef>,
    info: String,
}

impl RewriteNode {
    pub fn new(op: RewriteOp, condition: Option<FilterExpr>, next: Option<NodeRef>) -> RewriteNode {
        RewriteNode {
            op,
            condition,
            next,
            info: "rewrite".to_string(),
        }
    }

    fn apply(&self, record: &mut LogRecord) {
        match &self.op {
            RewriteOp::Set { handle, value } => {
                crate::template::with_scratch(|buf| {
                    value.format(record, &TemplateOptions::default(), 0, buf);
                    record.set_value(*handle, buf.as_bytes(), ValueType::String);
                });
            }
            RewriteOp::Unset { handle } => record.unset_value(*handle),
            RewriteOp::Subst {
                handle,
                pattern,
                replacement,
                global,
            } => {
                let current = match record.get_value(*handle) {
                    Some((bytes, _)) => String::from_utf8_lossy(bytes).to_string(),
                    None => return,
                };
                let replaced = if *global {
                    pattern.replace_all(&current, replacement.as_str())
                } else {
                    pattern.replace(&current, replacement.as_str())
                };
                if replaced != current {
                    record.set_value(*handle, replaced.as_bytes(), ValueType::String);
                }
            }
            RewriteOp::SetTag(id) => record.set_tag(*id),
            RewriteOp::ClearTag(id) => record.clear_tag(*id),
        }
    }
}

impl PipelineNode for RewriteNode {
    fn init(&self) -> Result<(), PipelineError> {
        if let Some(next) = &self.next {
            next.init()?;
        }
        Ok(())
    }

    fn deinit(&self) {
        if let Some(next) = &self.next {
            next.deinit();
        }
    }

    fn queue(&self, mut msg: LogMessage, path_options: &PathOptions<'_>) {
        let wants_rewrite = self
            .condition
            .as_ref()
            .map(|c| c.eval(&msg))
            .unwrap_or(true);
        if wants_rewrite {
            let record = LogRecord::make_writable(&mut msg, path_options);
            self.apply(record);
        }
        node::forward_or_ack(self.next.as_ref(), msg, path_options);
    }

    fn node_info(&self) -> &str {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log_event::builtin;

    fn record(host: &str, message: &str) -> LogMessage {
        let mut r = LogRecord::new_empty();
        r.set_value(builtin::HOST, host.as_bytes(), ValueType::String);
        r.set_value(builtin::MESSAGE, message.as_bytes(), ValueType::String);
        r.into_message()
    }

    #[test]
    fn set_from_template() {
        let node = RewriteNode::new(
            RewriteOp::Set {
                handle: builtin::HOST,
                value: Template::compile("normalized-$HOST").unwrap(),
            },
            None,
            None,
        );
        let msg = record("web-1", "m");
        let probe = LogMessage::clone(&msg);
        node.queue(msg, &PathOptions::default());
        // the original stayed intact (copy-on-write), probe still sees it
        assert_eq!(probe.get_value(builtin::HOST).unwrap().0, b"web-1");
    }

    #[test]
    fn subst_rewrites_message() {
        struct Capture(std::sync::Mutex<Vec<String>>);
        impl PipelineNode for Capture {
            fn queue(&self, msg: LogMessage, path_options: &PathOptions<'_>) {
                let m = msg
                    .get_value(builtin::MESSAGE)
                    .map(|(v, _)| String::from_utf8_lossy(v).to_string())
                    .unwrap_or_default();
                self.0.lock().unwrap().push(m);
                node::drop_message(msg, path_options);
            }
            fn node_info(&self) -> &str {
                "capture"
            }
        }

        let capture = std::sync::Arc::new(Capture(std::sync::Mutex::new(Vec::new())));
        let node = RewriteNode::new(
            RewriteOp::Subst {
                handle: builtin::MESSAGE,
                pattern: Regex::new("secret=[^ ]+").unwrap(),
                replacement: "secret=***".to_string(),
                global: true,
            },
            None,
            Some(capture.clone() as NodeRef),
        );

        node.queue(
            record("h", "login secret=hunter2 ok secret=x"),
            &PathOptions::default(),
        );
        assert_eq!(
            capture.0.lock().unwrap().as_slice(),
            &["login secret=*** ok secret=***".to_string()]
        );
    }

    #[test]
    fn conditional_rewrite_skips_non_matches() {
        let node = RewriteNode::new(
            RewriteOp::Set {
                handle: builtin::HOST,
                value: Template::compile("rewritten").unwrap(),
            },
            Some(FilterExpr::host_literal("db-1")),
            None,
        );
        let msg = record("web-1", "m");
        let probe = LogMessage::clone(&msg);
        node.queue(msg, &PathOptions::default());
        assert_eq!(probe.get_value(builtin::HOST).unwrap().0, b"web-1");
    }
}
