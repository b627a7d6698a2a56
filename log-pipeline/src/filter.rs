// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filter expressions and the filter node.

use log_event::{builtin, LogMessage, LogRecord, PathOptions, TagId};
use regex::Regex;

use crate::node::{self, NodeRef, PipelineError, PipelineNode};
use crate::template::{Template, TemplateOptions};

/// A predicate over one record. The set is closed; drivers extend the
/// pipeline through nodes, not through new expression kinds.
pub enum FilterExpr {
    /// Bit per syslog facility (0..=23).
    FacilityMask(u32),
    /// Bit per syslog severity (0..=7).
    SeverityMask(u8),
    Host(Regex),
    Program(Regex),
    Message(Regex),
    Tag(TagId),
    /// Expand the template and match the result.
    TemplateMatch { template: Template, pattern: Regex },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    pub fn facility(facility: u16) -> FilterExpr {
        FilterExpr::FacilityMask(1 << facility)
    }

    pub fn severity_at_least(severity: u16) -> FilterExpr {
        // severities grow downwards: 0 is emergency
        let mut mask = 0u8;
        for s in 0..=severity.min(7) {
            mask |= 1 << s;
        }
        FilterExpr::SeverityMask(mask)
    }

    /// Anchored literal host comparison.
    pub fn host_literal(host: &str) -> FilterExpr {
        let pattern = format!("^{}$", regex::escape(host));
        FilterExpr::Host(Regex::new(&pattern).unwrap_or_else(|_| Regex::new("$^").unwrap()))
    }

    pub fn eval(&self, msg: &LogRecord) -> bool {
        match self {
            FilterExpr::FacilityMask(mask) => {
                let facility = (msg.pri >> 3) as u32;
                facility < 24 && mask & (1 << facility) != 0
            }
            FilterExpr::SeverityMask(mask) => {
                let severity = (msg.pri & 7) as u8;
                mask & (1 << severity) != 0
            }
            FilterExpr::Host(re) => value_matches(msg, builtin::HOST, re),
            FilterExpr::Program(re) => value_matches(msg, builtin::PROGRAM, re),
            FilterExpr::Message(re) => value_matches(msg, builtin::MESSAGE, re),
            FilterExpr::Tag(id) => msg.has_tag(*id),
            FilterExpr::TemplateMatch { template, pattern } => {
                crate::template::with_scratch(|buf| {
                    template.format(msg, &TemplateOptions::default(), 0, buf);
                    pattern.is_match(buf)
                })
            }
            FilterExpr::And(terms) => terms.iter().all(|t| t.eval(msg)),
            FilterExpr::Or(terms) => terms.iter().any(|t| t.eval(msg)),
            FilterExpr::Not(term) => !term.eval(msg),
        }
    }
}

fn value_matches(msg: &LogRecord, handle: log_event::NVHandle, re: &Regex) -> bool {
    msg.get_value(handle)
        .and_then(|(bytes, _)| std::str::from_utf8(bytes).ok())
        .map(|s| re.is_match(s))
        .unwrap_or(false)
}

/// A node dropping every message its expression rejects.
pub struct FilterNode {
    expr: FilterExpr,
    next: Option<NodeRef>,
    info: String,
}

impl FilterNode {
    pub fn new(expr: FilterExpr, next: Option<NodeRef>) -> FilterNode {
        FilterNode {
            expr,
            next,
            info: "filter".to_string(),
        }
    }
}

impl PipelineNode for FilterNode {
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

    fn queue(&self, msg: LogMessage, path_options: &PathOptions<'_>) {
        if self.expr.eval(&msg) {
            if let Some(matched) = path_options.matched {
                matched.store(true, std::sync::atomic::Ordering::Relaxed);
            }
            node::forward_or_ack(self.next.as_ref(), msg, path_options);
        } else {
            node::drop_message(msg, path_options);
        }
    }

    fn node_info(&self) -> &str {
        &self.info
    }
}
