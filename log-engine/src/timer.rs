// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hashed timer wheel driven from the main loop.
//!
//! Timed work (MARK emission, destination retry wake-ups) is scheduled
//! here instead of one OS timer per event; the main loop ticks the wheel
//! and posts the expired wake-ups to the affected workers.

use std::time::Duration;

/// What an expired timer asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeUp {
    /// Emit the periodic `-- MARK --` record.
    Mark,
    /// Re-try a suspended destination.
    RetryDestination { id: String },
}

struct TimerEntry {
    deadline_tick: u64,
    wakeup: WakeUp,
}

/// Fixed-slot hashed wheel; entries hash into `deadline % slots`.
pub struct TimerWheel {
    slots: Vec<Vec<TimerEntry>>,
    tick_len: Duration,
    current_tick: u64,
}

impl TimerWheel {
    pub fn new(slot_count: usize, tick_len: Duration) -> TimerWheel {
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, Vec::new);
        TimerWheel {
            slots,
            tick_len,
            current_tick: 0,
        }
    }

    pub fn tick_len(&self) -> Duration {
        self.tick_len
    }

    /// Schedule `wakeup` to fire after `delay`.
    pub fn schedule(&mut self, delay: Duration, wakeup: WakeUp) {
        let ticks = delay.as_nanos().div_ceil(self.tick_len.as_nanos().max(1)) as u64;
        let deadline_tick = self.current_tick + ticks.max(1);
        let slot = (deadline_tick % self.slots.len() as u64) as usize;
        self.slots[slot].push(TimerEntry {
            deadline_tick,
            wakeup,
        });
    }

    /// Advance one tick and collect everything that expired.
    pub fn advance(&mut self) -> Vec<WakeUp> {
        self.current_tick += 1;
        let tick = self.current_tick;
        let slot = (tick % self.slots.len() as u64) as usize;
        let entries = &mut self.slots[slot];
        let mut expired = Vec::new();
        entries.retain_mut(|entry| {
            if entry.deadline_tick <= tick {
                expired.push(entry.wakeup.clone());
                false
            } else {
                true
            }
        });
        expired
    }
}
