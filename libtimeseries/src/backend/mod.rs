//! Backend framework: registry, vtable-style dispatch, and lifecycle.
//!
//! The original C library holds one descriptor per backend id in a
//! process-wide array (`timeseries->backends[TIMESERIES_BACKEND_MAX]`,
//! `timeseries_int.h`/`timeseries.c`) and dispatches through a
//! function-pointer struct. Here each backend is a `Box<dyn Backend>` behind
//! a dense backend-id index — the "vtable" is just Rust's trait object
//! vtable.

pub mod ascii;
pub mod broker;
pub mod kafka;
pub mod storage;

use crate::error::BackendError;
use std::fmt;

/// Dense backend identifier, in registry iteration order. Mirrors
/// `TIMESERIES_BACKEND_ID_*` / `TIMESERIES_FOREACH_BACKEND_ID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BackendId {
    Ascii = 0,
    Kafka = 1,
    Storage = 2,
    Broker = 3,
}

impl BackendId {
    pub const COUNT: usize = 4;
    pub const ALL: [BackendId; Self::COUNT] = [
        BackendId::Ascii,
        BackendId::Kafka,
        BackendId::Storage,
        BackendId::Broker,
    ];

    fn idx(self) -> usize {
        self as u8 as usize
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendId::Ascii => "ascii",
            BackendId::Kafka => "kafka",
            BackendId::Storage => "storage",
            BackendId::Broker => "broker",
        })
    }
}

/// One live (key, value, enabled) entry a backend sees during a flush. Built
/// from the Key Package's key array; backends that need the backend-native
/// id resolved earlier via `resolve_key` receive it in `backend_key`.
pub struct FlushEntry<'a> {
    pub key: &'a str,
    pub value: u64,
    pub backend_key: Option<&'a [u8]>,
}

/// The uniform operation table every backend implements. Operations a given
/// backend cannot meaningfully support return `Err(BackendError::Unsupported)`
/// — callers must not rely on them (the text and bus backends, for
/// instance, do not support `set_single_by_id` or bulk-by-id).
pub trait Backend: Send {
    fn id(&self) -> BackendId;
    fn name(&self) -> &'static str;

    /// Parse `argv` (already tokenized from the option string), acquire
    /// resources, and mark the backend ready. Called once by
    /// `Registry::enable_backend`.
    fn init(&mut self, argv: &[String]) -> Result<(), BackendError>;

    /// Release all resources. Must be safe to call on a backend whose
    /// `init` failed partway through.
    fn free(&mut self) {}

    /// Allocate per-KP state for this backend. Most backends need none.
    fn kp_init(&mut self) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(None)
    }

    /// Release per-KP state previously returned by `kp_init`.
    fn kp_free(&mut self, _kp_state: Option<Vec<u8>>) {}

    /// Notify the backend that the KP's key count changed (after
    /// `add_key`). The KP itself owns the per-key slot array; this is a
    /// pure notification hook for backends that track their own shadow
    /// bookkeeping alongside it.
    fn kp_ki_update(&mut self, _key_count: usize) -> Result<(), BackendError> {
        Ok(())
    }

    /// Release per-key state for one key, called once per key on KP free.
    fn kp_ki_free(&mut self, _key_id: u32, _ki_state: Option<Vec<u8>>) {}

    /// Serialize and transmit every enabled entry at `time`.
    fn kp_flush(&mut self, entries: &[FlushEntry<'_>], time: u32) -> Result<(), BackendError>;

    /// Ad-hoc write outside any KP.
    fn set_single(&mut self, _key: &str, _value: u64, _time: u32) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }

    /// Ad-hoc write using a previously resolved backend-native key.
    fn set_single_by_id(
        &mut self,
        _backend_key: &[u8],
        _value: u64,
        _time: u32,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }

    /// Translate a user key string into the backend's native opaque id.
    fn resolve_key(&mut self, _key: &str) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Unsupported)
    }

    /// Batched resolve. Returns one id per input key plus whether the ids
    /// share a contiguous allocation (callers may use this to free them
    /// as a single block).
    fn resolve_key_bulk(&mut self, keys: &[&str]) -> Result<(Vec<Vec<u8>>, bool), BackendError> {
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            out.push(self.resolve_key(k)?);
        }
        Ok((out, false))
    }

    /// Begin an ordered bulk write of `count` values at `time`.
    fn set_bulk_init(&mut self, _count: u32, _time: u32) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }

    /// Write the next value in an ordered bulk write started by
    /// `set_bulk_init`.
    fn set_bulk_by_id(&mut self, _backend_key: &[u8], _value: u64) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }
}

/// Splits a backend option string into argv-like tokens, honoring single-
/// and double-quoted substrings (so `-f "/path with spaces/out.txt"`
/// survives), the way `timeseries.c`'s `parse_cmd` tokenizes before handing
/// argv off to a backend's `init`.
pub fn tokenize_options(options: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    for c in options.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Construct a fresh, un-initialized backend instance by name, the way a
/// caller turns a config file's `timeseries-backend: storage` string into a
/// concrete type before calling `Registry::enable_backend`.
pub fn by_name(name: &str) -> Option<Box<dyn Backend>> {
    match name.to_ascii_lowercase().as_str() {
        "ascii" | "text" => Some(Box::new(ascii::AsciiBackend::new())),
        "kafka" => Some(Box::new(kafka::KafkaBackend::new())),
        "storage" | "dbats" => Some(Box::new(storage::StorageBackend::new())),
        "broker" | "tsmq" => Some(Box::new(broker::BrokerBackend::new())),
        _ => None,
    }
}

/// The umbrella registry. One descriptor slot per backend id, created once
/// and shared by every Key Package bound to it.
pub struct Registry {
    slots: [Option<Box<dyn Backend>>; BackendId::COUNT],
    enabled: [bool; BackendId::COUNT],
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            slots: [None, None, None, None],
            enabled: [false; BackendId::COUNT],
        }
    }

    /// Register a backend instance under its id (a no-side-effect
    /// descriptor, not yet initialized, not yet enabled).
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.slots[backend.id().idx()] = Some(backend);
    }

    /// Tokenize `options` and invoke the given backend's `init`. Only on
    /// success is the backend marked enabled — `registered_ids` (the KP
    /// flush dispatch order) only yields enabled backends, matching
    /// `timeseries_t->backends[i]->enabled` in the original.
    pub fn enable_backend(&mut self, id: BackendId, options: &str) -> Result<(), BackendError> {
        let argv = tokenize_options(options);
        let backend = self
            .slots
            .get_mut(id.idx())
            .and_then(|s| s.as_mut())
            .ok_or_else(|| BackendError::UnknownBackend(id.to_string()))?;
        backend.init(&argv)?;
        self.enabled[id.idx()] = true;
        Ok(())
    }

    pub fn get_by_id(&self, id: BackendId) -> Option<&dyn Backend> {
        self.slots[id.idx()].as_deref()
    }

    pub fn get_mut_by_id(&mut self, id: BackendId) -> Option<&mut (dyn Backend + 'static)> {
        self.slots[id.idx()].as_mut().map(|b| b.as_mut())
    }

    /// Case-insensitive lookup by name, matching `timeseries_get_backend_by_name`.
    pub fn get_by_name(&self, name: &str) -> Option<BackendId> {
        BackendId::ALL.into_iter().find(|&id| {
            self.slots[id.idx()]
                .as_ref()
                .is_some_and(|b| b.name().eq_ignore_ascii_case(name))
        })
    }

    /// Iterate ids of backends that are both registered and successfully
    /// enabled, in `BackendId::ALL` order — the dispatch order used by KP
    /// flush and by per-key notification hooks.
    pub fn registered_ids(&self) -> impl Iterator<Item = BackendId> + '_ {
        BackendId::ALL
            .into_iter()
            .filter(move |&id| self.slots[id.idx()].is_some() && self.enabled[id.idx()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_handles_quoted_spaces() {
        let toks = tokenize_options(r#"-b broker1,broker2 -f "text" -p "my prefix""#);
        assert_eq!(toks, vec!["-b", "broker1,broker2", "-f", "text", "-p", "my prefix"]);
    }

    #[test]
    fn tokenize_empty_string() {
        assert!(tokenize_options("").is_empty());
        assert!(tokenize_options("   ").is_empty());
    }

    #[test]
    fn backend_id_display_matches_name() {
        assert_eq!(BackendId::Ascii.to_string(), "ascii");
        assert_eq!(BackendId::Kafka.to_string(), "kafka");
    }

    #[test]
    fn registered_but_not_enabled_backend_is_excluded_from_dispatch() {
        let mut reg = Registry::new();
        reg.register(Box::new(ascii::AsciiBackend::new()));
        assert!(reg.registered_ids().next().is_none());

        reg.enable_backend(BackendId::Ascii, "-f /dev/null").unwrap();
        assert_eq!(reg.registered_ids().collect::<Vec<_>>(), vec![BackendId::Ascii]);
    }

    #[test]
    fn enable_backend_with_bad_options_leaves_backend_disabled() {
        let mut reg = Registry::new();
        reg.register(Box::new(ascii::AsciiBackend::new()));
        assert!(reg.enable_backend(BackendId::Ascii, "-x").is_err());
        assert!(reg.registered_ids().next().is_none());
    }
}
