// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Branching nodes: fork (deliver to all) and junction (first match).

use log_event::{LogMessage, LogRecord, PathOptions};

use crate::filter::FilterExpr;
use crate::node::{self, node_flags, NodeRef, PipelineError, PipelineNode};

/// Delivers every message to all branches via copy-on-write clones.
///
/// Each branch gets its own clone so acknowledgements aggregate on the
/// parent: the source callback fires once, after every branch finished.
pub struct Fork {
    branches: Vec<NodeRef>,
    info: String,
}

impl Fork {
    pub fn new(branches: Vec<NodeRef>) -> Fork {
        Fork {
            branches,
            info: "fork".to_string(),
        }
    }
}

impl PipelineNode for Fork {
    fn init(&self) -> Result<(), PipelineError> {
        for branch in &self.branches {
            branch.init()?;
        }
        Ok(())
    }

    fn deinit(&self) {
        for branch in &self.branches {
            branch.deinit();
        }
    }

    fn queue(&self, msg: LogMessage, path_options: &PathOptions<'_>) {
        for branch in &self.branches {
            let clone = LogRecord::clone_cow(&msg, path_options);
            branch.queue(clone, path_options);
        }
        // release the unit this node consumed; the branches hold their own
        node::drop_message(msg, path_options);
    }

    fn node_info(&self) -> &str {
        &self.info
    }
}

/// One alternative of a junction.
pub struct JunctionBranch {
    /// `None` matches everything.
    pub filter: Option<FilterExpr>,
    pub node: NodeRef,
    pub flags: u32,
}

/// First-match/catch-all branching.
///
/// Branches are evaluated in declaration order; the first whose filter
/// matches consumes the message. Non-matches go to the `FALLBACK` branch
/// when one exists, otherwise they continue to `next`, unless the
/// junction is `FINAL`, which absorbs them.
pub struct Junction {
    branches: Vec<JunctionBranch>,
    next: Option<NodeRef>,
    flags: u32,
    info: String,
}

impl Junction {
    pub fn new(branches: Vec<JunctionBranch>, next: Option<NodeRef>, flags: u32) -> Junction {
        Junction {
            branches,
            next,
            flags,
            info: "junction".to_string(),
        }
    }
}

impl PipelineNode for Junction {
    fn init(&self) -> Result<(), PipelineError> {
        for branch in &self.branches {
            branch.node.init()?;
        }
        if let Some(next) = &self.next {
            next.init()?;
        }
        Ok(())
    }

    fn deinit(&self) {
        for branch in &self.branches {
            branch.node.deinit();
        }
        if let Some(next) = &self.next {
            next.deinit();
        }
    }

    fn queue(&self, msg: LogMessage, path_options: &PathOptions<'_>) {
        for branch in &self.branches {
            if branch.flags & node_flags::FALLBACK != 0 {
                continue;
            }
            let matches = branch
                .filter
                .as_ref()
                .map(|filter| filter.eval(&msg))
                .unwrap_or(true);
            if matches {
                if let Some(matched) = path_options.matched {
                    matched.store(true, std::sync::atomic::Ordering::Relaxed);
                }
                branch.node.queue(msg, path_options);
                return;
            }
        }
        if let Some(fallback) = self
            .branches
            .iter()
            .find(|b| b.flags & node_flags::FALLBACK != 0)
        {
            fallback.node.queue(msg, path_options);
            return;
        }
        if self.flags & node_flags::FINAL != 0 {
            node::drop_message(msg, path_options);
            return;
        }
        node::forward_or_ack(self.next.as_ref(), msg, path_options);
    }

    fn flags(&self) -> u32 {
        self.flags
    }

    fn node_info(&self) -> &str {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PipelineNode;
    use log_event::{builtin, AckOutcome, LogRecord, ValueType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Terminal node recording what it saw, then acking.
    struct Recorder {
        seen: Mutex<Vec<String>>,
        info: String,
    }

    impl Recorder {
        fn new(info: &str) -> Arc<Recorder> {
            Arc::new(Recorder {
                seen: Mutex::new(Vec::new()),
                info: info.to_string(),
            })
        }
    }

    impl PipelineNode for Recorder {
        fn queue(&self, msg: LogMessage, path_options: &PathOptions<'_>) {
            let host = msg
                .get_value(builtin::HOST)
                .map(|(v, _)| String::from_utf8_lossy(v).to_string())
                .unwrap_or_default();
            self.seen.lock().unwrap().push(host);
            msg.ack(path_options, AckOutcome::Processed);
        }

        fn node_info(&self) -> &str {
            &self.info
        }
    }

    fn sourced_message(acks: &Arc<AtomicUsize>) -> LogMessage {
        let mut record = LogRecord::new_empty();
        record.set_value(builtin::HOST, b"origin", ValueType::String);
        let acked = Arc::clone(acks);
        record.set_ack_callback(Arc::new(move |_, _| {
            acked.fetch_add(1, Ordering::SeqCst);
        }));
        let msg = record.into_message();
        msg.add_ack(&PathOptions::with_ack());
        msg
    }

    #[test]
    fn fork_delivers_to_all_branches_and_acks_once() {
        let left = Recorder::new("left");
        let right = Recorder::new("right");
        let fork = Fork::new(vec![left.clone() as NodeRef, right.clone() as NodeRef]);

        let acks = Arc::new(AtomicUsize::new(0));
        let msg = sourced_message(&acks);
        fork.queue(msg, &PathOptions::with_ack());

        assert_eq!(left.seen.lock().unwrap().len(), 1);
        assert_eq!(right.seen.lock().unwrap().len(), 1);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn junction_takes_first_match() {
        let yes = Recorder::new("yes");
        let no = Recorder::new("no");
        let junction = Junction::new(
            vec![
                JunctionBranch {
                    filter: Some(FilterExpr::host_literal("origin")),
                    node: yes.clone() as NodeRef,
                    flags: 0,
                },
                JunctionBranch {
                    filter: None,
                    node: no.clone() as NodeRef,
                    flags: 0,
                },
            ],
            None,
            0,
        );

        let acks = Arc::new(AtomicUsize::new(0));
        junction.queue(sourced_message(&acks), &PathOptions::with_ack());
        assert_eq!(yes.seen.lock().unwrap().len(), 1);
        assert!(no.seen.lock().unwrap().is_empty());
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn junction_uses_fallback_branch() {
        let primary = Recorder::new("primary");
        let fallback = Recorder::new("fallback");
        let junction = Junction::new(
            vec![
                JunctionBranch {
                    filter: Some(FilterExpr::host_literal("elsewhere")),
                    node: primary.clone() as NodeRef,
                    flags: 0,
                },
                JunctionBranch {
                    filter: None,
                    node: fallback.clone() as NodeRef,
                    flags: node_flags::FALLBACK,
                },
            ],
            None,
            0,
        );

        let acks = Arc::new(AtomicUsize::new(0));
        junction.queue(sourced_message(&acks), &PathOptions::with_ack());
        assert!(primary.seen.lock().unwrap().is_empty());
        assert_eq!(fallback.seen.lock().unwrap().len(), 1);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn final_junction_absorbs_non_matches() {
        let primary = Recorder::new("primary");
        let junction = Junction::new(
            vec![JunctionBranch {
                filter: Some(FilterExpr::host_literal("elsewhere")),
                node: primary.clone() as NodeRef,
                flags: 0,
            }],
            None,
            node_flags::FINAL,
        );

        let acks = Arc::new(AtomicUsize::new(0));
        junction.queue(sourced_message(&acks), &PathOptions::with_ack());
        assert!(primary.seen.lock().unwrap().is_empty());
        // absorbed and acked
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }
}
