//! Key Package: a named, ordered set of counters flushed together across
//! every enabled backend.
//!
//! Grounded on `timeseries_kp_pub.h` for the operation set (`create`,
//! `add_key`, `set`, `enable_key`, `flush`, `free`) and on
//! `cognitod/src/handler/mod.rs`'s `HandlerList` for the "own a registry,
//! dispatch to every member, collect failures without stopping" pattern
//! this crate reuses for fan-out across backends.

use crate::backend::{BackendId, FlushEntry, Registry};
use crate::error::{BackendError, KpError};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

struct KeyEntry {
    name: String,
    value: u64,
    enabled: bool,
    /// Backend-native ids resolved via `Backend::resolve_key`, one slot per
    /// backend id. Owned by the Key Package; populated lazily by backends
    /// that support resolution.
    backend_keys: [Option<Vec<u8>>; BackendId::COUNT],
}

/// The single policy a KP is created with: it fixes both whether added
/// keys start enabled and whether a flush resets values and enable flags
/// afterward. The two are not independent knobs — `ResetOnFlush` always
/// pairs with enable-all, `ExplicitEnable` always pairs with no reset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KpMode {
    /// Every added key is enabled by default; enable bits are forced true
    /// at the start of every flush, then cleared (with values) after a
    /// successful flush.
    ResetOnFlush,
    /// Added keys start disabled; `set` enables them; flush does not reset
    /// values or enable flags. Used by the proxy, where a key with no
    /// update in the current interval must not be flushed as a phantom
    /// zero.
    ExplicitEnable,
}

pub struct Kp {
    registry: Rc<RefCell<Registry>>,
    keys: Vec<KeyEntry>,
    key_index: HashMap<String, u32>,
    mode: KpMode,
    /// Per-backend state returned by `Backend::kp_init`, released in `free`
    /// by the matching `Backend::kp_free`.
    kp_state: Vec<(BackendId, Option<Vec<u8>>)>,
    freed: bool,
}

impl Kp {
    pub fn create(registry: Rc<RefCell<Registry>>, mode: KpMode) -> Self {
        let backend_ids: Vec<BackendId> = registry.borrow().registered_ids().collect();
        let mut kp_state = Vec::with_capacity(backend_ids.len());
        for backend_id in backend_ids {
            let state = match registry.borrow_mut().get_mut_by_id(backend_id) {
                Some(b) => b.kp_init().unwrap_or_else(|e| {
                    log::warn!("backend {backend_id} failed kp_init: {e}");
                    None
                }),
                None => None,
            };
            kp_state.push((backend_id, state));
        }

        Kp {
            registry,
            keys: Vec::new(),
            key_index: HashMap::new(),
            mode,
            kp_state,
            freed: false,
        }
    }

    /// Intern `name`, returning its stable key id. Re-adding an existing
    /// name returns its existing id rather than creating a duplicate.
    pub fn add_key(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.key_index.get(name) {
            return id;
        }
        let id = self.keys.len() as u32;
        self.keys.push(KeyEntry {
            name: name.to_string(),
            value: 0,
            enabled: self.mode == KpMode::ResetOnFlush,
            backend_keys: Default::default(),
        });
        self.key_index.insert(name.to_string(), id);
        for backend_id in self.registry.borrow().registered_ids().collect::<Vec<_>>() {
            if let Some(b) = self.registry.borrow_mut().get_mut_by_id(backend_id) {
                let _ = b.kp_ki_update(self.keys.len());
            }
        }
        id
    }

    pub fn get_key(&self, name: &str) -> Option<u32> {
        self.key_index.get(name).copied()
    }

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn enabled_size(&self) -> usize {
        self.keys.iter().filter(|k| k.enabled).count()
    }

    pub fn set(&mut self, id: u32, value: u64) -> Result<(), KpError> {
        let explicit = self.mode == KpMode::ExplicitEnable;
        let entry = self.entry_mut(id)?;
        entry.value = value;
        if explicit {
            entry.enabled = true;
        }
        Ok(())
    }

    pub fn set_by_name(&mut self, name: &str, value: u64) -> Result<u32, KpError> {
        let id = self
            .key_index
            .get(name)
            .copied()
            .ok_or(KpError::UnknownKeyId(u32::MAX))?;
        self.set(id, value)?;
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<u64, KpError> {
        Ok(self.entry(id)?.value)
    }

    pub fn enable_key(&mut self, id: u32, enabled: bool) -> Result<(), KpError> {
        self.entry_mut(id)?.enabled = enabled;
        Ok(())
    }

    pub fn is_enabled(&self, id: u32) -> Result<bool, KpError> {
        Ok(self.entry(id)?.enabled)
    }

    fn entry(&self, id: u32) -> Result<&KeyEntry, KpError> {
        self.keys
            .get(id as usize)
            .ok_or(KpError::UnknownKeyId(id))
    }

    fn entry_mut(&mut self, id: u32) -> Result<&mut KeyEntry, KpError> {
        self.keys
            .get_mut(id as usize)
            .ok_or(KpError::UnknownKeyId(id))
    }

    /// Flush every enabled key to every backend registered in this KP's
    /// registry, in registry order. Every enabled backend is called
    /// unconditionally, even with zero currently-enabled keys — a backend
    /// may still need the call to advance its own bookkeeping (flushing a
    /// time-bucketed send buffer, for instance). Backends that fail do not
    /// prevent the remaining backends from being attempted. Returns
    /// `Err(KpError::Flush { .. })` if at least one backend failed, after
    /// all have been attempted.
    pub fn flush(&mut self, time: u32) -> Result<(), KpError> {
        // in enable-all mode the enable bits are unconditionally true at
        // the start of every flush, independent of whatever a prior reset
        // left them at.
        if self.mode == KpMode::ResetOnFlush {
            for k in self.keys.iter_mut() {
                k.enabled = true;
            }
        }

        let backend_ids: Vec<BackendId> = self.registry.borrow().registered_ids().collect();
        let mut attempted = 0;
        let mut failed = 0;

        for backend_id in backend_ids {
            let entries: Vec<FlushEntry<'_>> = self
                .keys
                .iter()
                .filter(|k| k.enabled)
                .map(|k| FlushEntry {
                    key: k.name.as_str(),
                    value: k.value,
                    backend_key: k.backend_keys[backend_id as u8 as usize].as_deref(),
                })
                .collect();

            attempted += 1;
            let result: Result<(), BackendError> = {
                let mut registry = self.registry.borrow_mut();
                match registry.get_mut_by_id(backend_id) {
                    Some(b) => b.kp_flush(&entries, time),
                    None => continue,
                }
            };
            if let Err(e) = result {
                log::warn!("backend {backend_id} failed to flush: {e}");
                failed += 1;
            }
        }

        if self.mode == KpMode::ResetOnFlush {
            for k in self.keys.iter_mut() {
                k.value = 0;
                k.enabled = false;
            }
        }

        if failed > 0 {
            Err(KpError::Flush { failed, attempted })
        } else {
            Ok(())
        }
    }

    /// Release per-key state for every key on every backend, then release
    /// each backend's per-KP state acquired in `create`. Idempotent — safe
    /// to call more than once, and called automatically on drop.
    pub fn free(&mut self) {
        if self.freed {
            return;
        }
        self.freed = true;

        for key_id in 0..self.keys.len() as u32 {
            for (backend_id, _) in &self.kp_state {
                if let Some(b) = self.registry.borrow_mut().get_mut_by_id(*backend_id) {
                    b.kp_ki_free(key_id, None);
                }
            }
        }

        for (backend_id, state) in self.kp_state.drain(..) {
            if let Some(b) = self.registry.borrow_mut().get_mut_by_id(backend_id) {
                b.kp_free(state);
            }
        }

        self.keys.clear();
        self.key_index.clear();
    }
}

impl Drop for Kp {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ascii::AsciiBackend;

    fn registry_with_ascii_to(path: &std::path::Path) -> Rc<RefCell<Registry>> {
        let mut reg = Registry::new();
        reg.register(Box::new(AsciiBackend::new()));
        reg.enable_backend(
            BackendId::Ascii,
            &format!("-f {}", path.to_string_lossy()),
        )
        .unwrap();
        Rc::new(RefCell::new(reg))
    }

    #[test]
    fn add_key_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_with_ascii_to(&dir.path().join("out.txt"));
        let mut kp = Kp::create(reg, KpMode::ResetOnFlush);
        let a = kp.add_key("metric.a");
        let b = kp.add_key("metric.a");
        assert_eq!(a, b);
        assert_eq!(kp.size(), 1);
    }

    #[test]
    fn enable_all_mode_enables_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_with_ascii_to(&dir.path().join("out.txt"));
        let mut kp = Kp::create(reg, KpMode::ResetOnFlush);
        let id = kp.add_key("metric.a");
        assert!(kp.is_enabled(id).unwrap());
    }

    #[test]
    fn explicit_mode_starts_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_with_ascii_to(&dir.path().join("out.txt"));
        let mut kp = Kp::create(reg, KpMode::ExplicitEnable);
        let id = kp.add_key("metric.a");
        assert!(!kp.is_enabled(id).unwrap());
    }

    #[test]
    fn flush_writes_enabled_keys_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let reg = registry_with_ascii_to(&path);
        let mut kp = Kp::create(reg, KpMode::ResetOnFlush);
        let id = kp.add_key("metric.a");
        kp.set(id, 42).unwrap();
        kp.flush(1_700_000_000).unwrap();
        assert_eq!(kp.get(id).unwrap(), 0);
        assert_eq!(kp.enabled_size(), 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "metric.a 42 1700000000\n");
    }

    #[test]
    fn explicit_mode_skips_unset_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let reg = registry_with_ascii_to(&path);
        let mut kp = Kp::create(reg, KpMode::ExplicitEnable);
        kp.add_key("k");
        kp.flush(10).unwrap();
        assert_eq!(kp.size(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn unknown_key_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_with_ascii_to(&dir.path().join("out.txt"));
        let kp = Kp::create(reg, KpMode::ResetOnFlush);
        assert!(matches!(kp.get(99), Err(KpError::UnknownKeyId(99))));
    }

    #[test]
    fn free_clears_keys_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry_with_ascii_to(&dir.path().join("out.txt"));
        let mut kp = Kp::create(reg, KpMode::ResetOnFlush);
        kp.add_key("metric.a");
        assert_eq!(kp.size(), 1);

        kp.free();
        assert_eq!(kp.size(), 0);
        kp.free();
        assert_eq!(kp.size(), 0);
    }

    #[test]
    fn flush_attempts_backend_even_with_no_enabled_keys() {
        // an enabled backend with zero entries must still be called, so a
        // backend whose own kp_flush has bookkeeping to do on every call
        // (draining a send buffer, for instance) doesn't get skipped.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let reg = registry_with_ascii_to(&path);
        let mut kp = Kp::create(reg, KpMode::ExplicitEnable);
        assert!(kp.flush(1).is_ok());
    }
}
