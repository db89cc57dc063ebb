use crate::error::ApplierError;
use crate::id::WorkerId;
use crate::signal::WakeHook;
use crate::slab::{Slab, SlabHandle};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// Reserved key used for groups that touch too many partitions to track.
pub const OVERFLOW_PARTITION: &str = "*";

#[derive(Debug)]
struct PartitionEntry {
    key: String,
    worker: Option<WorkerId>,
    usage: u64,
    side_state: Vec<String>,
}

/// Point-in-time view of one partition entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSnapshot {
    pub key: String,
    pub worker: Option<WorkerId>,
    pub usage: u64,
    pub side_state: Vec<String>,
}

struct TableState {
    entries: Slab<PartitionEntry>,
    index: HashMap<String, SlabHandle>,
}

impl TableState {
    fn entry_mut(&mut self, key: &str) -> Option<&mut PartitionEntry> {
        let handle = *self.index.get(key)?;
        self.entries.get_mut(handle)
    }

    /// Drops idle entries that carry no side state to make room.
    fn evict_idle(&mut self) -> usize {
        let idle: Vec<SlabHandle> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.usage == 0 && entry.side_state.is_empty())
            .map(|(handle, _)| handle)
            .collect();
        for handle in &idle {
            if let Some(entry) = self.entries.remove(*handle) {
                self.index.remove(&entry.key);
            }
        }
        idle.len()
    }
}

/// Partition key to worker mapping with per-key usage counts.
///
/// Entries live in a fixed-capacity slab; the table is mutated only under its
/// single mutex and the condvar fires whenever a key's usage drops to zero.
pub struct PartitionTable {
    state: Mutex<TableState>,
    released: Condvar,
    poll: Duration,
}

impl PartitionTable {
    pub fn new(capacity: usize, poll: Duration) -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: Slab::with_capacity(capacity.max(1)),
                index: HashMap::new(),
            }),
            released: Condvar::new(),
            poll,
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().entries.capacity()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Worker holding `key` while at least one of its groups is in flight.
    pub fn owner(&self, key: &str) -> Option<WorkerId> {
        let mut guard = self.state.lock();
        guard
            .entry_mut(key)
            .filter(|entry| entry.usage > 0)
            .and_then(|entry| entry.worker)
    }

    pub fn usage(&self, key: &str) -> u64 {
        let mut guard = self.state.lock();
        guard.entry_mut(key).map_or(0, |entry| entry.usage)
    }

    /// Pins `key` to `worker` and bumps its usage, returning any parked side
    /// state. Waits while another worker still has groups on the key.
    pub fn acquire(
        &self,
        key: &str,
        worker: WorkerId,
        hook: &dyn WakeHook,
    ) -> Result<Vec<String>, ApplierError> {
        let mut guard = self.state.lock();
        loop {
            if let Some(entry) = guard.entry_mut(key) {
                if entry.usage == 0 || entry.worker == Some(worker) {
                    if entry.worker != Some(worker) {
                        debug!(partition = key, worker = %worker, "partition re-pinned");
                    }
                    entry.worker = Some(worker);
                    entry.usage += 1;
                    return Ok(std::mem::take(&mut entry.side_state));
                }
                self.released.wait_for(&mut guard, self.poll);
                MutexGuard::unlocked(&mut guard, || hook.on_wake())?;
                continue;
            }
            if guard.entries.is_full() && guard.evict_idle() == 0 {
                return Err(ApplierError::Resource(format!(
                    "partition table full ({} entries)",
                    guard.entries.capacity()
                )));
            }
            let entry = PartitionEntry {
                key: key.to_string(),
                worker: Some(worker),
                usage: 1,
                side_state: Vec::new(),
            };
            let handle = guard.entries.insert(entry).map_err(|_| {
                ApplierError::Resource(format!("partition table refused {key}"))
            })?;
            guard.index.insert(key.to_string(), handle);
            return Ok(Vec::new());
        }
    }

    /// Drops one usage of `key`. When usage reaches zero the worker's side
    /// state for the key moves out of `session` into the entry.
    pub fn release(
        &self,
        key: &str,
        worker: WorkerId,
        session: &mut BTreeMap<String, Vec<String>>,
    ) -> u64 {
        let mut guard = self.state.lock();
        let Some(entry) = guard.entry_mut(key) else {
            return 0;
        };
        if entry.worker != Some(worker) {
            return entry.usage;
        }
        entry.usage = entry.usage.saturating_sub(1);
        let usage = entry.usage;
        if usage == 0 {
            if let Some(objects) = session.remove(key) {
                entry.side_state.extend(objects);
            }
            drop(guard);
            self.released.notify_all();
        }
        usage
    }

    /// Blocks until no key has in-flight usage.
    pub fn wait_all_idle(&self, hook: &dyn WakeHook) -> Result<(), ApplierError> {
        let mut guard = self.state.lock();
        while guard.entries.iter().any(|(_, entry)| entry.usage > 0) {
            self.released.wait_for(&mut guard, self.poll);
            MutexGuard::unlocked(&mut guard, || hook.on_wake())?;
        }
        Ok(())
    }

    /// Barrier-time cleanup: unpins idle keys and drops the ones with nothing
    /// parked. Returns the number of side-state objects still parked.
    pub fn reconcile(&self) -> usize {
        let mut guard = self.state.lock();
        guard.evict_idle();
        let mut parked = 0;
        let handles: Vec<SlabHandle> = guard.entries.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            if let Some(entry) = guard.entries.get_mut(handle) {
                if entry.usage == 0 {
                    entry.worker = None;
                }
                parked += entry.side_state.len();
            }
        }
        parked
    }

    pub fn snapshot(&self) -> Vec<PartitionSnapshot> {
        let guard = self.state.lock();
        let mut entries: Vec<PartitionSnapshot> = guard
            .entries
            .iter()
            .map(|(_, entry)| PartitionSnapshot {
                key: entry.key.clone(),
                worker: entry.worker,
                usage: entry.usage,
                side_state: entry.side_state.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn notify_all(&self) {
        self.released.notify_all();
    }
}

impl std::fmt::Debug for PartitionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionTable")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::PoolSignal;

    #[test]
    fn side_state_parks_when_usage_drops_to_zero() {
        let table = PartitionTable::new(4, Duration::from_millis(5));
        let signal = PoolSignal::new();
        let w0 = WorkerId::new(0);
        let w1 = WorkerId::new(1);
        assert!(table.acquire("orders", w0, &signal).unwrap().is_empty());
        assert_eq!(table.owner("orders"), Some(w0));

        let mut session = BTreeMap::new();
        session.insert("orders".to_string(), vec!["tmp_totals".to_string()]);
        assert_eq!(table.release("orders", w0, &mut session), 0);
        assert!(session.is_empty());
        assert_eq!(table.owner("orders"), None);

        let handoff = table.acquire("orders", w1, &signal).unwrap();
        assert_eq!(handoff, vec!["tmp_totals".to_string()]);
        assert_eq!(table.owner("orders"), Some(w1));
    }

    #[test]
    fn full_table_evicts_idle_entries_before_failing() {
        let table = PartitionTable::new(1, Duration::from_millis(5));
        let signal = PoolSignal::new();
        let w0 = WorkerId::new(0);
        table.acquire("a", w0, &signal).unwrap();
        let err = table.acquire("b", w0, &signal).unwrap_err();
        assert!(matches!(err, ApplierError::Resource(_)));

        table.release("a", w0, &mut BTreeMap::new());
        table.acquire("b", w0, &signal).unwrap();
        assert_eq!(table.usage("a"), 0);
        assert_eq!(table.usage("b"), 1);
    }
}
