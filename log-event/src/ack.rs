// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Acknowledgement tracking.
//!
//! Every record carries one packed atomic word holding its outstanding ack
//! count and the abort/suspend outcome flags. Producers fork (incrementing
//! the parent's count) and consumers ack without taking a lock; the
//! delivery callback fires at the unique 1→0 transition of the count with
//! the aggregated outcome. Clones forward their final ack to `original`,
//! so outcomes aggregate along the fork tree: a child abort always turns
//! into a parent abort.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::record::{LogRecord, PathOptions};

/// Aggregated delivery outcome reported to the ack callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// All consumers processed the record.
    Processed,
    /// At least one consumer dropped the record permanently.
    Aborted,
    /// At least one consumer wants the record re-delivered later.
    Suspended,
}

/// Callback invoked once per source record when the last consumer acked.
pub type AckCallback = Arc<dyn Fn(&LogRecord, AckOutcome) + Send + Sync>;

/// Bit layout of `ack_and_flags`.
pub const ACK_COUNT_MASK: u32 = 0x3FFF;
pub const ABORT_FLAG: u32 = 1 << 30;
pub const SUSPEND_FLAG: u32 = 1 << 31;

static_assertions::const_assert_eq!(ACK_COUNT_MASK & (ABORT_FLAG | SUSPEND_FLAG), 0);

impl LogRecord {
    /// Register one more expected ack. No-op unless the path needs acking.
    pub fn add_ack(&self, path_options: &PathOptions<'_>) {
        if !path_options.ack_needed {
            return;
        }
        let prev = self.ack_and_flags.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            prev & ACK_COUNT_MASK < ACK_COUNT_MASK,
            "ack counter overflow"
        );
    }

    /// Outstanding acks on this record.
    pub fn pending_acks(&self) -> u32 {
        self.ack_and_flags.load(Ordering::Acquire) & ACK_COUNT_MASK
    }

    /// Report one consumer's outcome.
    ///
    /// Decrements the packed counter, folding the outcome into the abort/
    /// suspend flags; the final decrement fires the callback (or forwards
    /// to the clone's original).
    pub fn ack(&self, path_options: &PathOptions<'_>, outcome: AckOutcome) {
        if !path_options.ack_needed {
            return;
        }
        let mut current = self.ack_and_flags.load(Ordering::Acquire);
        loop {
            debug_assert!(current & ACK_COUNT_MASK > 0, "ack without matching add_ack");
            let mut next = current;
            match outcome {
                AckOutcome::Processed => {}
                AckOutcome::Aborted => next |= ABORT_FLAG,
                AckOutcome::Suspended => next |= SUSPEND_FLAG,
            }
            next = (next & !ACK_COUNT_MASK) | ((next & ACK_COUNT_MASK).saturating_sub(1));
            match self.ack_and_flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next & ACK_COUNT_MASK == 0 {
                        self.fire_ack(aggregate_outcome(next));
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn fire_ack(&self, outcome: AckOutcome) {
        if let Some(original) = &self.original {
            original.ack(&PathOptions::with_ack(), outcome);
        } else if let Some(callback) = &self.ack_callback {
            callback(self, outcome);
        }
    }
}

fn aggregate_outcome(word: u32) -> AckOutcome {
    if word & ABORT_FLAG != 0 {
        AckOutcome::Aborted
    } else if word & SUSPEND_FLAG != 0 {
        AckOutcome::Suspended
    } else {
        AckOutcome::Processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn with_callback(record: &mut LogRecord) -> Arc<Mutex<Vec<AckOutcome>>> {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        record.set_ack_callback(Arc::new(move |_, outcome| {
            sink.lock().unwrap().push(outcome);
        }));
        outcomes
    }

    #[test]
    fn single_consumer_fires_once() {
        let mut record = LogRecord::new_empty();
        let outcomes = with_callback(&mut record);
        let msg = record.into_message();
        let path = PathOptions::with_ack();

        msg.add_ack(&path);
        msg.ack(&path, AckOutcome::Processed);
        assert_eq!(&*outcomes.lock().unwrap(), &[AckOutcome::Processed]);
    }

    #[test]
    fn ack_is_skipped_without_ack_needed() {
        let mut record = LogRecord::new_empty();
        let outcomes = with_callback(&mut record);
        let msg = record.into_message();
        let path = PathOptions::default();

        msg.add_ack(&path);
        msg.ack(&path, AckOutcome::Processed);
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn forked_clones_aggregate_to_one_callback() {
        let mut record = LogRecord::new_empty();
        let outcomes = with_callback(&mut record);
        let msg = record.into_message();
        let path = PathOptions::with_ack();

        msg.add_ack(&path);
        let left = LogRecord::clone_cow(&msg, &path);
        let right = LogRecord::clone_cow(&msg, &path);
        // the fork consumed its own unit
        msg.ack(&path, AckOutcome::Processed);
        assert!(outcomes.lock().unwrap().is_empty());

        left.ack(&path, AckOutcome::Processed);
        assert!(outcomes.lock().unwrap().is_empty());
        right.ack(&path, AckOutcome::Processed);
        assert_eq!(&*outcomes.lock().unwrap(), &[AckOutcome::Processed]);
    }

    #[test]
    fn child_abort_wins_over_processed() {
        let mut record = LogRecord::new_empty();
        let outcomes = with_callback(&mut record);
        let msg = record.into_message();
        let path = PathOptions::with_ack();

        msg.add_ack(&path);
        let left = LogRecord::clone_cow(&msg, &path);
        let right = LogRecord::clone_cow(&msg, &path);
        msg.ack(&path, AckOutcome::Processed);

        left.ack(&path, AckOutcome::Aborted);
        right.ack(&path, AckOutcome::Processed);
        assert_eq!(&*outcomes.lock().unwrap(), &[AckOutcome::Aborted]);
    }

    #[test]
    fn suspend_reported_when_no_abort() {
        let mut record = LogRecord::new_empty();
        let outcomes = with_callback(&mut record);
        let msg = record.into_message();
        let path = PathOptions::with_ack();

        msg.add_ack(&path);
        let child = LogRecord::clone_cow(&msg, &path);
        msg.ack(&path, AckOutcome::Processed);
        child.ack(&path, AckOutcome::Suspended);
        assert_eq!(&*outcomes.lock().unwrap(), &[AckOutcome::Suspended]);
    }

    #[test]
    fn concurrent_acks_fire_exactly_once() {
        let mut record = LogRecord::new_empty();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        record.set_ack_callback(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let msg = record.into_message();
        let path = PathOptions::with_ack();

        const THREADS: usize = 8;
        for _ in 0..THREADS {
            msg.add_ack(&path);
        }
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                let msg = Arc::clone(&msg);
                scope.spawn(move || msg.ack(&PathOptions::with_ack(), AckOutcome::Processed));
            }
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
