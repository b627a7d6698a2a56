// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Packed name-value table backing one event record.
//!
//! Values live in a single appendable arena. Built-in handles index a fixed
//! direct-slot prefix; dynamic handles go through a dense sorted index. An
//! entry either stores its value inline (*direct*) or references a slice of
//! another entry's value (*indirect*), which lets parsers alias substrings
//! of MESSAGE without copying.
//!
//! Growth doubles the arena up to a configured maximum. Hitting the maximum
//! is not fatal: the offending write is dropped and reported, everything
//! already stored stays intact.

use crate::registry::{self, NVHandle};
use crate::value::ValueType;

/// Default cap for one table's arena. Individual tables may override it,
/// the absolute limit is just under 4 GiB.
pub const DEFAULT_MAX_ARENA: usize = 1 << 24;

/// Hard ceiling on arena size; offsets are stored as `u32`.
pub const ABSOLUTE_MAX_ARENA: usize = u32::MAX as usize - 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NvTableError {
    /// The arena is at its maximum size and the value does not fit. The
    /// write is dropped, previously stored entries are unaffected.
    #[error("value of {requested} bytes does not fit, arena at {limit} byte limit")]
    Full { requested: usize, limit: usize },
    #[error("handle {0:?} cannot hold an indirect value")]
    NotIndirectable(NVHandle),
    #[error("handle {0:?} cannot be referenced by an indirect value")]
    NotReferencable(NVHandle),
    #[error("indirect range {ofs}+{len} is out of bounds of the referenced value ({value_len})")]
    RangeOutOfBounds { ofs: u32, len: u32, value_len: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Span {
    ofs: u32,
    len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SlotValue {
    #[default]
    Unset,
    Direct {
        value: Span,
        ty: ValueType,
    },
    Indirect {
        target: NVHandle,
        ofs: u32,
        len: u32,
        ty: ValueType,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// Name bytes in the arena; empty for built-ins whose names are static.
    name: Span,
    value: SlotValue,
}

/// Outcome of a successful `set`, telling the owner whether a brand new
/// entry appeared (drives the record's structured-data index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOutcome {
    pub inserted_new_entry: bool,
}

#[derive(Debug, Clone)]
pub struct NvTable {
    arena: Vec<u8>,
    builtin: [Slot; registry::builtin::MAX as usize + 1],
    dynamic: Vec<(NVHandle, Slot)>,
    /// Bytes occupied by overwritten (dead) spans, reclaimable by compaction.
    dead_bytes: usize,
    max_arena: usize,
}

impl NvTable {
    pub fn new(initial_capacity: usize) -> Self {
        NvTable {
            arena: Vec::with_capacity(initial_capacity.min(ABSOLUTE_MAX_ARENA)),
            builtin: Default::default(),
            dynamic: Vec::new(),
            dead_bytes: 0,
            max_arena: DEFAULT_MAX_ARENA,
        }
    }

    /// Lower (or raise, up to the absolute cap) the arena limit.
    pub fn set_max_arena(&mut self, max: usize) {
        self.max_arena = max.min(ABSOLUTE_MAX_ARENA);
    }

    pub fn memory_usage(&self) -> usize {
        self.arena.capacity()
            + self.dynamic.capacity() * std::mem::size_of::<(NVHandle, Slot)>()
            + std::mem::size_of::<Self>()
    }

    fn slot(&self, handle: NVHandle) -> Option<&Slot> {
        if registry::is_builtin(handle) {
            return Some(&self.builtin[handle.as_u32() as usize]);
        }
        self.dynamic
            .binary_search_by_key(&handle, |(h, _)| *h)
            .ok()
            .map(|i| &self.dynamic[i].1)
    }

    fn ensure_fits(&mut self, additional: usize) -> Result<(), NvTableError> {
        if self.arena.len() + additional <= self.max_arena {
            return Ok(());
        }
        if self.arena.len() + additional - self.dead_bytes <= self.max_arena {
            self.compact();
            return Ok(());
        }
        Err(NvTableError::Full {
            requested: additional,
            limit: self.max_arena,
        })
    }

    /// Rewrite the arena dropping dead spans. Runs only when an insert
    /// would otherwise exceed the limit.
    fn compact(&mut self) {
        let mut fresh = Vec::with_capacity(self.arena.len() - self.dead_bytes);
        let mut relocate = |span: &mut Span, arena: &[u8]| {
            let ofs = fresh.len() as u32;
            fresh.extend_from_slice(&arena[span.ofs as usize..(span.ofs + span.len) as usize]);
            span.ofs = ofs;
        };
        for slot in self
            .builtin
            .iter_mut()
            .chain(self.dynamic.iter_mut().map(|(_, s)| s))
        {
            if slot.name.len > 0 {
                relocate(&mut slot.name, &self.arena);
            }
            if let SlotValue::Direct { value, .. } = &mut slot.value {
                relocate(value, &self.arena);
            }
        }
        self.arena = fresh;
        self.dead_bytes = 0;
    }

    fn append(&mut self, bytes: &[u8]) -> Span {
        let ofs = self.arena.len() as u32;
        self.arena.extend_from_slice(bytes);
        Span {
            ofs,
            len: bytes.len() as u32,
        }
    }

    fn slot_mut(&mut self, handle: NVHandle) -> &mut Slot {
        if registry::is_builtin(handle) {
            return &mut self.builtin[handle.as_u32() as usize];
        }
        match self.dynamic.binary_search_by_key(&handle, |(h, _)| *h) {
            Ok(i) => &mut self.dynamic[i].1,
            Err(i) => {
                self.dynamic.insert(i, (handle, Slot::default()));
                &mut self.dynamic[i].1
            }
        }
    }

    /// Store a direct value. Overwrites in place when the new value fits
    /// the old span, otherwise the old span goes dead and the value is
    /// re-appended.
    pub fn set(
        &mut self,
        handle: NVHandle,
        value: &[u8],
        ty: ValueType,
    ) -> Result<SetOutcome, NvTableError> {
        let needs_name = !registry::is_builtin(handle)
            && self
                .slot(handle)
                .map(|s| s.name.len == 0)
                .unwrap_or(true);
        let name_len = if needs_name {
            registry::name_of(handle).map(|n| n.len()).unwrap_or(0)
        } else {
            0
        };

        let existing = self.slot(handle).map(|s| s.value);
        let fits_in_place = matches!(
            existing,
            Some(SlotValue::Direct { value: old, .. }) if value.len() as u32 <= old.len
        );
        if !fits_in_place {
            self.ensure_fits(value.len() + name_len)?;
        }

        if needs_name && name_len > 0 {
            let name = registry::name_of(handle).unwrap_or_default();
            let span = self.append(name.as_bytes());
            self.slot_mut(handle).name = span;
        }

        let inserted_new_entry = matches!(existing, None | Some(SlotValue::Unset));
        match existing {
            Some(SlotValue::Direct { value: old, .. }) if value.len() as u32 <= old.len => {
                let start = old.ofs as usize;
                self.arena[start..start + value.len()].copy_from_slice(value);
                self.dead_bytes += (old.len as usize) - value.len();
                self.slot_mut(handle).value = SlotValue::Direct {
                    value: Span {
                        ofs: old.ofs,
                        len: value.len() as u32,
                    },
                    ty,
                };
            }
            _ => {
                if let Some(SlotValue::Direct { value: old, .. }) = existing {
                    self.dead_bytes += old.len as usize;
                }
                let span = self.append(value);
                self.slot_mut(handle).value = SlotValue::Direct { value: span, ty };
            }
        }
        Ok(SetOutcome { inserted_new_entry })
    }

    /// Store a `(target, ofs, len)` slice reference.
    ///
    /// Built-in handles cannot hold indirect values and macros/matches
    /// cannot be referenced; the referenced range is bounds-checked against
    /// the target's current value.
    pub fn set_indirect(
        &mut self,
        handle: NVHandle,
        target: NVHandle,
        ofs: u32,
        len: u32,
        ty: ValueType,
    ) -> Result<SetOutcome, NvTableError> {
        if registry::is_builtin(handle) {
            return Err(NvTableError::NotIndirectable(handle));
        }
        if registry::is_macro(target) || registry::is_match(target) || handle == target {
            return Err(NvTableError::NotReferencable(target));
        }
        // flatten indirect-to-indirect chains at creation
        let (target, ofs, value_len) = match self.slot(target).map(|s| s.value) {
            Some(SlotValue::Direct { value, .. }) => (target, ofs, value.len),
            Some(SlotValue::Indirect {
                target: inner,
                ofs: inner_ofs,
                len: inner_len,
                ..
            }) => (inner, inner_ofs.saturating_add(ofs), inner_len),
            _ => return Err(NvTableError::NotReferencable(target)),
        };
        if ofs.saturating_add(len) > value_len {
            return Err(NvTableError::RangeOutOfBounds {
                ofs,
                len,
                value_len,
            });
        }

        let needs_name = self
            .slot(handle)
            .map(|s| s.name.len == 0)
            .unwrap_or(true);
        if needs_name {
            if let Some(name) = registry::name_of(handle) {
                self.ensure_fits(name.len())?;
                let span = self.append(name.as_bytes());
                self.slot_mut(handle).name = span;
            }
        }

        let slot = self.slot_mut(handle);
        let inserted_new_entry = matches!(slot.value, SlotValue::Unset);
        slot.value = SlotValue::Indirect {
            target,
            ofs,
            len,
            ty,
        };
        Ok(SetOutcome { inserted_new_entry })
    }

    /// Fetch a value; indirect entries resolve through their target.
    /// Returns `None` when the handle is unset.
    pub fn get(&self, handle: NVHandle) -> Option<(&[u8], ValueType)> {
        match self.slot(handle)?.value {
            SlotValue::Unset => None,
            SlotValue::Direct { value, ty } => Some((self.span_bytes(value), ty)),
            SlotValue::Indirect {
                target,
                ofs,
                len,
                ty,
            } => match self.slot(target)?.value {
                SlotValue::Direct { value, .. } => {
                    // the target may have shrunk since the alias was created
                    let start = ofs.min(value.len);
                    let end = ofs.saturating_add(len).min(value.len);
                    let span = Span {
                        ofs: value.ofs + start,
                        len: end - start,
                    };
                    Some((self.span_bytes(span), ty))
                }
                _ => None,
            },
        }
    }

    pub fn is_set(&self, handle: NVHandle) -> bool {
        self.slot(handle)
            .map(|s| !matches!(s.value, SlotValue::Unset))
            .unwrap_or(false)
    }

    /// Mark an entry absent; its arena span stays reserved until compaction.
    pub fn unset(&mut self, handle: NVHandle) {
        let dead = match self.slot(handle).map(|s| s.value) {
            Some(SlotValue::Direct { value, .. }) => value.len as usize,
            Some(SlotValue::Indirect { .. }) => 0,
            _ => return,
        };
        self.slot_mut(handle).value = SlotValue::Unset;
        self.dead_bytes += dead;
    }

    /// Iterate all set entries, direct and indirect, with resolved bytes.
    pub fn foreach(&self, mut f: impl FnMut(NVHandle, &str, &[u8], ValueType)) {
        let mut visit = |handle: NVHandle, slot: &Slot| {
            if matches!(slot.value, SlotValue::Unset) {
                return;
            }
            let name_owned;
            let name: &str = if slot.name.len > 0 {
                std::str::from_utf8(self.span_bytes(slot.name)).unwrap_or("")
            } else {
                name_owned = registry::name_of(handle).unwrap_or_default();
                &name_owned
            };
            if let Some((bytes, ty)) = self.get(handle) {
                f(handle, name, bytes, ty);
            }
        };
        for idx in 1..=registry::builtin::MAX {
            visit(NVHandle(idx), &self.builtin[idx as usize]);
        }
        for (handle, slot) in &self.dynamic {
            visit(*handle, slot);
        }
    }

    /// Deep copy with `extra` bytes of reserved headroom.
    pub fn clone_with_headroom(&self, extra: usize) -> NvTable {
        let mut copy = self.clone();
        copy.arena.reserve(extra);
        copy
    }

    fn span_bytes(&self, span: Span) -> &[u8] {
        &self.arena[span.ofs as usize..(span.ofs + span.len) as usize]
    }
}

impl Default for NvTable {
    fn default() -> Self {
        NvTable::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{builtin, get_handle};

    #[test]
    fn set_get_round_trip() {
        let mut table = NvTable::new(64);
        let dynamic = get_handle("nv.test.round_trip").unwrap();
        table.set(builtin::HOST, b"web-1", ValueType::String).unwrap();
        table.set(dynamic, b"42", ValueType::Integer).unwrap();

        assert_eq!(
            table.get(builtin::HOST),
            Some((&b"web-1"[..], ValueType::String))
        );
        assert_eq!(table.get(dynamic), Some((&b"42"[..], ValueType::Integer)));
        assert_eq!(table.get(builtin::PROGRAM), None);
    }

    #[test]
    fn overwrite_in_place_and_regrow() {
        let mut table = NvTable::new(64);
        table
            .set(builtin::MESSAGE, b"longer message", ValueType::String)
            .unwrap();
        let out = table.set(builtin::MESSAGE, b"short", ValueType::String).unwrap();
        assert!(!out.inserted_new_entry);
        assert_eq!(
            table.get(builtin::MESSAGE),
            Some((&b"short"[..], ValueType::String))
        );

        table
            .set(builtin::MESSAGE, b"now considerably longer again", ValueType::String)
            .unwrap();
        assert_eq!(
            table.get(builtin::MESSAGE),
            Some((&b"now considerably longer again"[..], ValueType::String))
        );
    }

    #[test]
    fn indirect_aliases_a_slice() {
        let mut table = NvTable::new(64);
        let part = get_handle("nv.test.part").unwrap();
        table
            .set(builtin::MESSAGE, b"error: disk failure", ValueType::String)
            .unwrap();
        table
            .set_indirect(part, builtin::MESSAGE, 7, 4, ValueType::String)
            .unwrap();
        assert_eq!(table.get(part), Some((&b"disk"[..], ValueType::String)));

        // rewriting the target does not corrupt the table
        table
            .set(builtin::MESSAGE, b"ok", ValueType::String)
            .unwrap();
        let (bytes, _) = table.get(part).unwrap_or((b"", ValueType::String));
        assert!(bytes.len() <= 4);
    }

    #[test]
    fn indirect_rejects_bad_targets() {
        let mut table = NvTable::new(64);
        let h = get_handle("nv.test.reject").unwrap();
        table
            .set(builtin::MESSAGE, b"0123456789", ValueType::String)
            .unwrap();

        assert_eq!(
            table.set_indirect(builtin::HOST, builtin::MESSAGE, 0, 2, ValueType::String),
            Err(NvTableError::NotIndirectable(builtin::HOST))
        );
        assert_eq!(
            table.set_indirect(h, builtin::MESSAGE, 8, 4, ValueType::String),
            Err(NvTableError::RangeOutOfBounds {
                ofs: 8,
                len: 4,
                value_len: 10
            })
        );
        let m = crate::registry::match_handle(1);
        assert!(matches!(
            table.set_indirect(h, m, 0, 1, ValueType::String),
            Err(NvTableError::NotReferencable(_))
        ));
    }

    #[test]
    fn full_arena_drops_write_but_keeps_entries() {
        let mut table = NvTable::new(64);
        table.set_max_arena(128);
        table
            .set(builtin::MESSAGE, &[b'x'; 100], ValueType::String)
            .unwrap();
        let err = table
            .set(builtin::HOST, &[b'y'; 100], ValueType::String)
            .unwrap_err();
        assert!(matches!(err, NvTableError::Full { .. }));

        // previous entry intact, small writes still succeed
        assert_eq!(table.get(builtin::MESSAGE).unwrap().0.len(), 100);
        table.set(builtin::HOST, b"ok", ValueType::String).unwrap();
        assert_eq!(table.get(builtin::HOST), Some((&b"ok"[..], ValueType::String)));
    }

    #[test]
    fn compaction_reclaims_dead_spans() {
        let mut table = NvTable::new(64);
        table.set_max_arena(512);
        table
            .set(builtin::MESSAGE, &[b'a'; 300], ValueType::String)
            .unwrap();
        // in-place shrink leaves 296 dead bytes behind
        table.set(builtin::MESSAGE, b"live", ValueType::String).unwrap();
        // does not fit without compaction (300 + 250 > 512)
        table
            .set(builtin::HOST, &[b'b'; 250], ValueType::String)
            .unwrap();
        assert_eq!(table.get(builtin::MESSAGE).unwrap().0, b"live");
        assert_eq!(table.get(builtin::HOST).unwrap().0.len(), 250);
    }

    #[test]
    fn unset_marks_absent() {
        let mut table = NvTable::new(64);
        table.set(builtin::HOST, b"web-1", ValueType::String).unwrap();
        table.unset(builtin::HOST);
        assert_eq!(table.get(builtin::HOST), None);
        assert!(!table.is_set(builtin::HOST));
    }

    #[test]
    fn foreach_visits_set_entries() {
        let mut table = NvTable::new(64);
        let dynamic = get_handle("nv.test.foreach").unwrap();
        table.set(builtin::HOST, b"web-1", ValueType::String).unwrap();
        table.set(dynamic, b"v", ValueType::String).unwrap();
        table.unset(builtin::HOST);

        let mut seen = Vec::new();
        table.foreach(|_, name, value, _| {
            seen.push((name.to_string(), value.to_vec()));
        });
        assert_eq!(seen, vec![("nv.test.foreach".into(), b"v".to_vec())]);
    }
}
