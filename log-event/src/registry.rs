// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-global name registry issuing stable [`NVHandle`]s.
//!
//! Handles are issued once per name and never recycled, so they can be
//! embedded in long-lived structures (templates, persisted queues are
//! re-mapped by name on load). The registry is read-mostly after startup;
//! writes take a short exclusive section.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Stable integer identifier for a registered name. Zero is "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NVHandle(pub(crate) u32);

impl NVHandle {
    pub const NONE: NVHandle = NVHandle(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Handle kind bits, kept alongside every registered name.
pub mod handle_flags {
    /// The name resolves through the template macro table, it has no stored value.
    pub const MACRO: u16 = 0x0001;
    /// The name is a `.SDATA.block.id.key` style structured-data member.
    pub const SDATA: u16 = 0x0002;
    /// The name is a numeric match-group capture (`$0`..`$255`).
    pub const MATCH: u16 = 0x0004;
}

/// Built-in handles, registered in fixed order so their values live in the
/// direct-slot prefix of every table.
pub mod builtin {
    use super::NVHandle;

    pub const HOST: NVHandle = NVHandle(1);
    pub const HOST_FROM: NVHandle = NVHandle(2);
    pub const MESSAGE: NVHandle = NVHandle(3);
    pub const PROGRAM: NVHandle = NVHandle(4);
    pub const PID: NVHandle = NVHandle(5);
    pub const MSGID: NVHandle = NVHandle(6);
    pub const SOURCE: NVHandle = NVHandle(7);
    pub const LEGACY_MSGHDR: NVHandle = NVHandle(8);
    pub const RAWMSG: NVHandle = NVHandle(9);
    pub const TRANSPORT: NVHandle = NVHandle(10);

    /// Number of built-in handles; handles `1..=MAX` get direct slots.
    pub const MAX: u32 = 10;

    pub(super) const NAMES: [&str; MAX as usize] = [
        "HOST",
        "HOST_FROM",
        "MESSAGE",
        "PROGRAM",
        "PID",
        "MSGID",
        "SOURCE",
        "LEGACY_MSGHDR",
        "RAWMSG",
        "TRANSPORT",
    ];
}

#[derive(Debug, Clone)]
struct HandleDesc {
    name: Box<str>,
    flags: u16,
    aux: u8,
}

struct Registry {
    by_name: HashMap<Box<str>, NVHandle>,
    descs: Vec<HandleDesc>,
}

impl Registry {
    fn new() -> Self {
        let mut registry = Registry {
            by_name: HashMap::new(),
            descs: vec![HandleDesc {
                name: "".into(),
                flags: 0,
                aux: 0,
            }],
        };
        for name in builtin::NAMES {
            registry.intern(name, 0, 0);
        }
        registry
    }

    fn intern(&mut self, name: &str, flags: u16, aux: u8) -> NVHandle {
        if let Some(&handle) = self.by_name.get(name) {
            return handle;
        }
        let handle = NVHandle(self.descs.len() as u32);
        self.descs.push(HandleDesc {
            name: name.into(),
            flags,
            aux,
        });
        self.by_name.insert(name.into(), handle);
        handle
    }
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::new()))
}

/// Errors raised when a name cannot be registered.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("empty names cannot be registered")]
    EmptyName,
    #[error("structured data name {0:?} is malformed, expected .SDATA.block.id.key")]
    MalformedSdata(String),
}

/// Classify `name` and return its flags and auxiliary byte.
///
/// All-digit names in `0..=255` are match-group captures; names under the
/// `.SDATA.` prefix must carry at least block, id and key components. The
/// aux byte holds the capture index for matches and the length of the
/// `.SDATA.block.id.` prefix for structured data.
fn classify(name: &str) -> Result<(u16, u8), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::EmptyName);
    }
    if name.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(index) = name.parse::<u16>() {
            if index <= 255 {
                return Ok((handle_flags::MATCH, index as u8));
            }
        }
        // out-of-range digit runs degrade to plain dynamic names
        return Ok((0, 0));
    }
    if let Some(rest) = name.strip_prefix(".SDATA") {
        // needs the leading dot plus at least a block.key separator
        if rest.bytes().filter(|&b| b == b'.').count() < 2 {
            return Err(RegistryError::MalformedSdata(name.to_string()));
        }
        // aux: length of ".SDATA.block.id." including the trailing dot
        let last_dot = name.rfind('.').unwrap_or(0);
        let prefix_len = (last_dot + 1).min(255);
        return Ok((handle_flags::SDATA, prefix_len as u8));
    }
    Ok((0, 0))
}

/// Look up (registering on first use) the handle for `name`.
pub fn get_handle(name: &str) -> Result<NVHandle, RegistryError> {
    {
        let guard = registry().read().unwrap();
        if let Some(&handle) = guard.by_name.get(name) {
            return Ok(handle);
        }
    }
    let (flags, aux) = classify(name)?;
    Ok(registry().write().unwrap().intern(name, flags, aux))
}

/// Handle for the match-group capture `$index`.
pub fn match_handle(index: u8) -> NVHandle {
    get_handle(&index.to_string()).unwrap_or(NVHandle::NONE)
}

/// Register `name` as a template macro backed by `macro_id`.
///
/// Macro names never hold stored values; tables refuse them as indirection
/// targets and the template compiler resolves them through its own table.
pub fn register_macro(name: &str, macro_id: u8) -> NVHandle {
    registry()
        .write()
        .unwrap()
        .intern(name, handle_flags::MACRO, macro_id)
}

/// Flags and aux byte of `handle`, or `None` for unregistered handles.
pub fn handle_flags_of(handle: NVHandle) -> Option<(u16, u8)> {
    let guard = registry().read().unwrap();
    guard
        .descs
        .get(handle.0 as usize)
        .map(|d| (d.flags, d.aux))
}

/// Resolve a handle back to its name.
pub fn name_of(handle: NVHandle) -> Option<String> {
    let guard = registry().read().unwrap();
    guard
        .descs
        .get(handle.0 as usize)
        .filter(|_| !handle.is_none())
        .map(|d| d.name.to_string())
}

pub fn is_macro(handle: NVHandle) -> bool {
    handle_flags_of(handle).is_some_and(|(f, _)| f & handle_flags::MACRO != 0)
}

pub fn is_match(handle: NVHandle) -> bool {
    handle_flags_of(handle).is_some_and(|(f, _)| f & handle_flags::MATCH != 0)
}

pub fn is_sdata(handle: NVHandle) -> bool {
    handle_flags_of(handle).is_some_and(|(f, _)| f & handle_flags::SDATA != 0)
}

pub fn is_builtin(handle: NVHandle) -> bool {
    handle.0 >= 1 && handle.0 <= builtin::MAX
}

/// The `.SDATA.block.id.` prefix of a structured-data handle's name.
pub fn sdata_prefix_of(handle: NVHandle) -> Option<String> {
    let guard = registry().read().unwrap();
    let desc = guard.descs.get(handle.0 as usize)?;
    if desc.flags & handle_flags::SDATA == 0 {
        return None;
    }
    Some(desc.name[..desc.aux as usize].to_string())
}
