// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide tag registry and the per-record tag bitset.
//!
//! Tag ids are small integers handed out in registration order. A record
//! stores its tags inline in one word while every id fits; the first id
//! past the word width promotes the set to a heap bitmap.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

pub type TagId = u32;

const INLINE_BITS: u32 = u64::BITS;

struct TagRegistry {
    by_name: HashMap<Box<str>, TagId>,
    names: Vec<Box<str>>,
}

fn tag_registry() -> &'static RwLock<TagRegistry> {
    static REGISTRY: OnceLock<RwLock<TagRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        RwLock::new(TagRegistry {
            by_name: HashMap::new(),
            names: Vec::new(),
        })
    })
}

/// Look up (registering on first use) the id for a tag name.
pub fn get_tag_id(name: &str) -> TagId {
    {
        let guard = tag_registry().read().unwrap();
        if let Some(&id) = guard.by_name.get(name) {
            return id;
        }
    }
    let mut guard = tag_registry().write().unwrap();
    if let Some(&id) = guard.by_name.get(name) {
        return id;
    }
    let id = guard.names.len() as TagId;
    guard.names.push(name.into());
    guard.by_name.insert(name.into(), id);
    id
}

/// Resolve a tag id back to its name.
pub fn tag_name(id: TagId) -> Option<String> {
    let guard = tag_registry().read().unwrap();
    guard.names.get(id as usize).map(|n| n.to_string())
}

/// Tag membership bitset carried by every record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TagSet {
    #[default]
    Empty,
    Inline(u64),
    Heap(Vec<u64>),
}

impl TagSet {
    pub fn set(&mut self, id: TagId) {
        match self {
            TagSet::Empty if id < INLINE_BITS => *self = TagSet::Inline(1 << id),
            TagSet::Empty => {
                let mut bits = vec![0u64; (id / INLINE_BITS + 1) as usize];
                bits[(id / INLINE_BITS) as usize] |= 1 << (id % INLINE_BITS);
                *self = TagSet::Heap(bits);
            }
            TagSet::Inline(word) if id < INLINE_BITS => *word |= 1 << id,
            TagSet::Inline(word) => {
                let mut bits = vec![0u64; (id / INLINE_BITS + 1) as usize];
                bits[0] = *word;
                bits[(id / INLINE_BITS) as usize] |= 1 << (id % INLINE_BITS);
                *self = TagSet::Heap(bits);
            }
            TagSet::Heap(bits) => {
                let idx = (id / INLINE_BITS) as usize;
                if idx >= bits.len() {
                    bits.resize(idx + 1, 0);
                }
                bits[idx] |= 1 << (id % INLINE_BITS);
            }
        }
    }

    pub fn clear(&mut self, id: TagId) {
        match self {
            TagSet::Empty => {}
            TagSet::Inline(word) => {
                if id < INLINE_BITS {
                    *word &= !(1 << id);
                }
            }
            TagSet::Heap(bits) => {
                let idx = (id / INLINE_BITS) as usize;
                if idx < bits.len() {
                    bits[idx] &= !(1 << (id % INLINE_BITS));
                }
            }
        }
    }

    pub fn is_set(&self, id: TagId) -> bool {
        match self {
            TagSet::Empty => false,
            TagSet::Inline(word) => id < INLINE_BITS && word & (1 << id) != 0,
            TagSet::Heap(bits) => {
                let idx = (id / INLINE_BITS) as usize;
                idx < bits.len() && bits[idx] & (1 << (id % INLINE_BITS)) != 0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TagSet::Empty => true,
            TagSet::Inline(word) => *word == 0,
            TagSet::Heap(bits) => bits.iter().all(|w| *w == 0),
        }
    }

    /// Visit every set tag id in ascending order.
    pub fn foreach(&self, mut f: impl FnMut(TagId, &str)) {
        let visit_word = |base: u32, mut word: u64, f: &mut dyn FnMut(TagId, &str)| {
            while word != 0 {
                let bit = word.trailing_zeros();
                let id = base + bit;
                if let Some(name) = tag_name(id) {
                    f(id, &name);
                }
                word &= word - 1;
            }
        };
        match self {
            TagSet::Empty => {}
            TagSet::Inline(word) => visit_word(0, *word, &mut f),
            TagSet::Heap(bits) => {
                for (i, word) in bits.iter().enumerate() {
                    visit_word(i as u32 * INLINE_BITS, *word, &mut f);
                }
            }
        }
    }

    pub fn memory_usage(&self) -> usize {
        match self {
            TagSet::Heap(bits) => bits.capacity() * std::mem::size_of::<u64>(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_idempotent() {
        let a = get_tag_id("tags.test.alpha");
        assert_eq!(get_tag_id("tags.test.alpha"), a);
        assert_eq!(tag_name(a).as_deref(), Some("tags.test.alpha"));
    }

    #[test]
    fn inline_set_clear() {
        let mut tags = TagSet::default();
        tags.set(3);
        tags.set(63);
        assert!(tags.is_set(3));
        assert!(tags.is_set(63));
        assert!(!tags.is_set(4));
        tags.clear(3);
        assert!(!tags.is_set(3));
        assert!(matches!(tags, TagSet::Inline(_)));
    }

    #[test]
    fn promotes_to_heap_past_word_width() {
        let mut tags = TagSet::default();
        tags.set(5);
        tags.set(130);
        assert!(matches!(tags, TagSet::Heap(_)));
        assert!(tags.is_set(5));
        assert!(tags.is_set(130));
        assert!(!tags.is_set(64));
    }

    #[test]
    fn foreach_ascending() {
        let a = get_tag_id("tags.test.first");
        let b = get_tag_id("tags.test.second");
        let mut tags = TagSet::default();
        tags.set(b);
        tags.set(a);
        let mut seen = Vec::new();
        tags.foreach(|id, _| seen.push(id));
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
        assert!(seen.contains(&a) && seen.contains(&b));
    }
}
