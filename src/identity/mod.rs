//! Identity Interning
//!
//! Dense, collision-free integer ids for strings and composite task keys,
//! shared by every worker thread of every processor.
//!
//! - Same key -> same id for the lifetime of the registry (or until `reset`).
//! - Distinct keys never share an id, across both key kinds.
//! - Ids are allocated densely from 0, so downstream consumers may use them
//!   as array indices.

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::path::Path;

// =============================================================================
// TASK KEY
// =============================================================================

/// Composite key identifying one logical task on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub device_id: u32,
    pub stream_id: u32,
    pub task_id: u32,
    pub subtask_id: u32,
    pub batch_id: u32,
}

impl TaskKey {
    pub fn new(device_id: u32, stream_id: u32, task_id: u32, subtask_id: u32, batch_id: u32) -> Self {
        Self {
            device_id,
            stream_id,
            task_id,
            subtask_id,
            batch_id,
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Debug, Default)]
struct Tables {
    strings: HashMap<String, u64>,
    tasks: HashMap<TaskKey, u64>,
    next_id: u64,
}

impl Tables {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Process-wide interning table.
///
/// Lookups take the read lock; a miss takes an upgradable lock so only one
/// thread at a time can allocate, and re-checks before inserting.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    tables: RwLock<Tables>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the id for a string.
    pub fn intern_string(&self, value: &str) -> u64 {
        if let Some(&id) = self.tables.read().strings.get(value) {
            return id;
        }

        let guard = self.tables.upgradable_read();
        if let Some(&id) = guard.strings.get(value) {
            return id;
        }
        let mut tables = RwLockUpgradableReadGuard::upgrade(guard);
        let id = tables.allocate();
        tables.strings.insert(value.to_string(), id);
        id
    }

    /// Get or create the global task id for a composite key.
    pub fn intern_tuple(&self, key: TaskKey) -> u64 {
        if let Some(&id) = self.tables.read().tasks.get(&key) {
            return id;
        }

        let guard = self.tables.upgradable_read();
        if let Some(&id) = guard.tasks.get(&key) {
            return id;
        }
        let mut tables = RwLockUpgradableReadGuard::upgrade(guard);
        let id = tables.allocate();
        tables.tasks.insert(key, id);
        id
    }

    /// Namespace id for a session, derived from its path.
    ///
    /// Returns `None` once more than 2^32 ids have been handed out.
    pub fn session_namespace(&self, session: &Path) -> Option<u32> {
        let id = self.intern_string(&session.to_string_lossy());
        u32::try_from(id).ok()
    }

    /// Number of ids allocated so far.
    pub fn len(&self) -> usize {
        self.tables.read().next_id as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All interned strings ordered by id.
    pub fn snapshot_strings(&self) -> Vec<(u64, String)> {
        let tables = self.tables.read();
        let mut out: Vec<(u64, String)> = tables
            .strings
            .iter()
            .map(|(value, &id)| (id, value.clone()))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    /// Forget every key and restart allocation at 0.
    pub fn reset(&self) {
        let mut tables = self.tables.write();
        tables.strings.clear();
        tables.tasks.clear();
        tables.next_id = 0;
    }
}

// =============================================================================
// NAMESPACED IDS
// =============================================================================

/// 64-bit id with a namespace in the high half and a local id in the low half.
///
/// Used for `pid + tid` thread ids and `session + connection` ids so that
/// independent sources merged into one report cannot collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedId(u64);

impl NamespacedId {
    pub const LOCAL_BITS: u32 = 32;

    #[inline]
    pub fn pack(namespace: u32, local: u32) -> u64 {
        ((namespace as u64) << Self::LOCAL_BITS) | local as u64
    }

    #[inline]
    pub fn unpack(value: u64) -> (u32, u32) {
        ((value >> Self::LOCAL_BITS) as u32, value as u32)
    }

    #[inline]
    pub fn new(namespace: u32, local: u32) -> Self {
        Self(Self::pack(namespace, local))
    }

    #[inline]
    pub fn namespace(&self) -> u32 {
        Self::unpack(self.0).0
    }

    #[inline]
    pub fn local(&self) -> u32 {
        Self::unpack(self.0).1
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_intern_string_is_idempotent() {
        let registry = IdentityRegistry::new();
        let a = registry.intern_string("aicore_time");
        let b = registry.intern_string("aic_total_cycles");
        assert_ne!(a, b);
        assert_eq!(registry.intern_string("aicore_time"), a);
        assert_eq!(registry.intern_string("aic_total_cycles"), b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ids_are_dense_across_key_kinds() {
        let registry = IdentityRegistry::new();
        let s = registry.intern_string("MatMul");
        let t = registry.intern_tuple(TaskKey::new(0, 1, 2, 3, 0));
        let u = registry.intern_string("Add");
        assert_eq!((s, t, u), (0, 1, 2));
    }

    #[test]
    fn test_intern_tuple_distinguishes_every_field() {
        let registry = IdentityRegistry::new();
        let base = TaskKey::new(0, 1, 2, 3, 4);
        let variants = [
            base,
            TaskKey { device_id: 9, ..base },
            TaskKey { stream_id: 9, ..base },
            TaskKey { task_id: 9, ..base },
            TaskKey { subtask_id: 9, ..base },
            TaskKey { batch_id: 9, ..base },
        ];
        let ids: HashSet<u64> = variants.iter().map(|k| registry.intern_tuple(*k)).collect();
        assert_eq!(ids.len(), variants.len());
        assert_eq!(registry.intern_tuple(base), 0);
    }

    #[test]
    fn test_concurrent_interning_agrees() {
        let registry = Arc::new(IdentityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mut seen = Vec::with_capacity(200);
                    // Each worker walks the same keys in a different order.
                    for i in 0..200u32 {
                        let k = (i * 7 + worker * 13) % 200;
                        let s = registry.intern_string(&format!("kernel_{}", k));
                        let t = registry.intern_tuple(TaskKey::new(0, k, k, 0, 0));
                        seen.push((k, s, t));
                    }
                    seen
                })
            })
            .collect();

        let mut by_key: HashMap<u32, (u64, u64)> = HashMap::new();
        for handle in handles {
            for (k, s, t) in handle.join().unwrap() {
                let entry = by_key.entry(k).or_insert((s, t));
                assert_eq!(*entry, (s, t), "key {} resolved to two ids", k);
            }
        }

        assert_eq!(registry.len(), 400);
        let all: HashSet<u64> = by_key.values().flat_map(|(s, t)| [*s, *t]).collect();
        assert_eq!(all.len(), 400);
        assert!(all.iter().all(|&id| id < 400));
    }

    #[test]
    fn test_reset_restarts_allocation() {
        let registry = IdentityRegistry::new();
        registry.intern_string("a");
        registry.intern_string("b");
        registry.reset();
        assert!(registry.is_empty());
        assert_eq!(registry.intern_string("b"), 0);
    }

    #[test]
    fn test_snapshot_strings_is_id_ordered() {
        let registry = IdentityRegistry::new();
        registry.intern_string("z");
        registry.intern_tuple(TaskKey::new(0, 0, 0, 0, 0));
        registry.intern_string("a");
        assert_eq!(
            registry.snapshot_strings(),
            vec![(0, "z".to_string()), (2, "a".to_string())]
        );
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let packed = NamespacedId::pack(4242, 17);
        assert_eq!(NamespacedId::unpack(packed), (4242, 17));
        assert_eq!(packed, (4242u64 << 32) | 17);

        let id = NamespacedId::new(u32::MAX, u32::MAX);
        assert_eq!(id.namespace(), u32::MAX);
        assert_eq!(id.local(), u32::MAX);
        assert_eq!(id.as_u64(), u64::MAX);
    }

    #[test]
    fn test_session_namespace_is_stable() {
        let registry = IdentityRegistry::new();
        let a = registry.session_namespace(Path::new("/data/session_a"));
        let b = registry.session_namespace(Path::new("/data/session_b"));
        assert_ne!(a, b);
        assert_eq!(registry.session_namespace(Path::new("/data/session_a")), a);
    }
}
