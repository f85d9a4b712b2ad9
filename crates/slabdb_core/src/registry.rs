//! Registry of live snapshot versions.
//!
//! Every transaction pins the version it works on by grabbing a read lock.
//! The registry is an arena of slots `{version, top_ref, file_size, count}`;
//! the allocator may only reclaim storage of versions older than every
//! slot with a non-zero count (and never of the latest version).
//!
//! A pin is a [`ReadLockGuard`]. Dropping the guard releases it, so every
//! control path (including unwinding) gives the pin back. The only way to
//! keep a version pinned forever is [`ReadLockGuard::leak`].

use crate::error::{CoreError, CoreResult};
use crate::types::{Version, VersionId};
use parking_lot::{Condvar, Mutex};
use slabdb_storage::Ref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Descriptor of a pinned snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLockInfo {
    /// Version number.
    pub version: Version,
    /// Root of the snapshot.
    pub top_ref: Ref,
    /// Logical file size of the snapshot.
    pub file_size: u64,
    /// Registry slot holding the version.
    pub slot_index: usize,
}

impl ReadLockInfo {
    /// Returns the id that pins exactly this version.
    #[must_use]
    pub const fn version_id(&self) -> VersionId {
        VersionId::At {
            version: self.version,
            index: self.slot_index,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    version: Version,
    top_ref: Ref,
    file_size: u64,
    count: usize,
}

#[derive(Debug)]
struct Slots {
    slots: Vec<Slot>,
    latest: usize,
    leaked: u64,
}

impl Slots {
    fn info(&self, index: usize) -> ReadLockInfo {
        let slot = self.slots[index];
        ReadLockInfo {
            version: slot.version,
            top_ref: slot.top_ref,
            file_size: slot.file_size,
            slot_index: index,
        }
    }
}

/// Shared table of live versions.
#[derive(Debug)]
pub struct ReadLockRegistry {
    slots: Mutex<Slots>,
    changed: Condvar,
}

impl ReadLockRegistry {
    /// Creates a registry whose latest version is `version`.
    #[must_use]
    pub fn new(version: Version, top_ref: Ref, file_size: u64) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Slots {
                slots: vec![Slot {
                    version,
                    top_ref,
                    file_size,
                    count: 0,
                }],
                latest: 0,
                leaked: 0,
            }),
            changed: Condvar::new(),
        })
    }

    /// Pins a version and returns a guard that releases it on drop.
    ///
    /// # Errors
    ///
    /// Returns `BadVersion` if an explicit version is no longer retained.
    pub fn grab_read_lock(self: &Arc<Self>, id: VersionId) -> CoreResult<ReadLockGuard> {
        let mut slots = self.slots.lock();
        let index = match id {
            VersionId::Latest => slots.latest,
            VersionId::At { version, index } => {
                let retained = slots.slots.get(index).map_or(false, |slot| {
                    slot.version == version && (slot.count > 0 || index == slots.latest)
                });
                if !retained {
                    return Err(CoreError::BadVersion { version });
                }
                index
            }
        };
        slots.slots[index].count += 1;
        Ok(ReadLockGuard {
            registry: Arc::clone(self),
            info: slots.info(index),
            released: false,
        })
    }

    fn release_read_lock(&self, info: &ReadLockInfo) {
        let mut slots = self.slots.lock();
        let slot = &mut slots.slots[info.slot_index];
        debug_assert_eq!(slot.version, info.version);
        debug_assert!(slot.count > 0, "read lock released twice");
        slot.count = slot.count.saturating_sub(1);
    }

    fn leak_read_lock(&self, info: &ReadLockInfo) {
        let mut slots = self.slots.lock();
        slots.leaked += 1;
        warn!(
            version = info.version,
            "read lock leaked; storage of this version stays pinned until reopen"
        );
    }

    /// Installs `version` as the latest version and wakes waiters.
    ///
    /// A slot that is neither pinned nor latest is reused when available.
    pub fn publish(&self, version: Version, top_ref: Ref, file_size: u64) -> ReadLockInfo {
        let mut slots = self.slots.lock();
        debug_assert!(version > slots.slots[slots.latest].version);
        let slot = Slot {
            version,
            top_ref,
            file_size,
            count: 0,
        };
        let latest = slots.latest;
        let reusable = slots
            .slots
            .iter()
            .enumerate()
            .position(|(i, s)| s.count == 0 && i != latest);
        let index = match reusable {
            Some(index) => {
                slots.slots[index] = slot;
                index
            }
            None => {
                slots.slots.push(slot);
                slots.slots.len() - 1
            }
        };
        slots.latest = index;
        let info = slots.info(index);
        drop(slots);
        self.changed.notify_all();
        info
    }

    /// Returns the latest version without pinning it.
    #[must_use]
    pub fn latest(&self) -> ReadLockInfo {
        let slots = self.slots.lock();
        slots.info(slots.latest)
    }

    /// Returns the oldest version that is still pinned, or the latest
    /// version if that is older.
    #[must_use]
    pub fn oldest_live_version(&self) -> Version {
        let slots = self.slots.lock();
        let latest = slots.slots[slots.latest].version;
        slots
            .slots
            .iter()
            .filter(|s| s.count > 0)
            .map(|s| s.version)
            .fold(latest, Version::min)
    }

    /// Number of pins currently held on `version`.
    #[must_use]
    pub fn pin_count(&self, version: Version) -> usize {
        self.slots
            .lock()
            .slots
            .iter()
            .filter(|s| s.version == version)
            .map(|s| s.count)
            .sum()
    }

    /// Number of read locks leaked so far.
    #[must_use]
    pub fn leaked(&self) -> u64 {
        self.slots.lock().leaked
    }

    /// Blocks until the latest version differs from `version`.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_for_change(&self, version: Version, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slots = self.slots.lock();
        loop {
            if slots.slots[slots.latest].version != version {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut slots, deadline).timed_out() {
                        return slots.slots[slots.latest].version != version;
                    }
                }
                None => self.changed.wait(&mut slots),
            }
        }
    }
}

/// A pinned version. Releases the pin when dropped.
#[derive(Debug)]
pub struct ReadLockGuard {
    registry: Arc<ReadLockRegistry>,
    info: ReadLockInfo,
    released: bool,
}

impl ReadLockGuard {
    /// Returns the pinned snapshot.
    #[must_use]
    pub fn info(&self) -> ReadLockInfo {
        self.info
    }

    /// Keeps the version pinned forever.
    pub fn leak(mut self) {
        self.registry.leak_read_lock(&self.info);
        self.released = true;
    }
}

impl Drop for ReadLockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.registry.release_read_lock(&self.info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn latest_is_pinned_and_released() {
        let registry = ReadLockRegistry::new(1, 24, 100);
        {
            let guard = registry.grab_read_lock(VersionId::Latest).unwrap();
            assert_eq!(guard.info().version, 1);
            assert_eq!(registry.pin_count(1), 1);
        }
        assert_eq!(registry.pin_count(1), 0);
    }

    #[test]
    fn explicit_version_survives_while_pinned() {
        let registry = ReadLockRegistry::new(1, 24, 100);
        let pin = registry.grab_read_lock(VersionId::Latest).unwrap();
        registry.publish(2, 200, 300);

        let again = registry.grab_read_lock(pin.info().version_id()).unwrap();
        assert_eq!(again.info().top_ref, 24);
    }

    #[test]
    fn reclaimed_version_is_rejected() {
        let registry = ReadLockRegistry::new(1, 24, 100);
        let id = registry.latest().version_id();
        registry.publish(2, 200, 300);

        let result = registry.grab_read_lock(id);
        assert!(matches!(result, Err(CoreError::BadVersion { version: 1 })));
    }

    #[test]
    fn publish_reuses_free_slots() {
        let registry = ReadLockRegistry::new(1, 24, 100);
        let first = registry.publish(2, 200, 300);
        let second = registry.publish(3, 400, 500);
        assert_eq!(first.slot_index, 1);
        assert_eq!(second.slot_index, 0);
    }

    #[test]
    fn oldest_live_version_tracks_pins() {
        let registry = ReadLockRegistry::new(1, 24, 100);
        let pin = registry.grab_read_lock(VersionId::Latest).unwrap();
        registry.publish(2, 200, 300);
        registry.publish(3, 400, 500);
        assert_eq!(registry.oldest_live_version(), 1);
        drop(pin);
        assert_eq!(registry.oldest_live_version(), 3);
    }

    #[test]
    fn leaked_pin_is_never_released() {
        let registry = ReadLockRegistry::new(1, 24, 100);
        registry
            .grab_read_lock(VersionId::Latest)
            .unwrap()
            .leak();
        registry.publish(2, 200, 300);
        assert_eq!(registry.pin_count(1), 1);
        assert_eq!(registry.oldest_live_version(), 1);
        assert_eq!(registry.leaked(), 1);
    }

    #[test]
    fn wait_for_change_times_out() {
        let registry = ReadLockRegistry::new(1, 24, 100);
        assert!(!registry.wait_for_change(1, Some(Duration::from_millis(10))));
        registry.publish(2, 200, 300);
        assert!(registry.wait_for_change(1, Some(Duration::from_millis(10))));
    }

    #[test]
    fn wait_for_change_wakes_on_publish() {
        let registry = ReadLockRegistry::new(1, 24, 100);
        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.wait_for_change(1, None))
        };
        std::thread::sleep(Duration::from_millis(20));
        registry.publish(2, 200, 300);
        assert!(waiter.join().unwrap());
    }

    proptest! {
        #[test]
        fn pinned_versions_are_exactly_the_live_ones(ops in proptest::collection::vec(0u8..3, 1..60)) {
            let registry = ReadLockRegistry::new(1, 24, 100);
            let mut guards: Vec<ReadLockGuard> = Vec::new();
            let mut version = 1;

            for op in ops {
                match op {
                    0 => guards.push(registry.grab_read_lock(VersionId::Latest).unwrap()),
                    1 => {
                        version += 1;
                        registry.publish(version, version * 8, version * 16);
                    }
                    _ => {
                        if !guards.is_empty() {
                            guards.remove(0);
                        }
                    }
                }

                let expected = guards
                    .iter()
                    .map(|g| g.info().version)
                    .fold(version, u64::min);
                prop_assert_eq!(registry.oldest_live_version(), expected);
                for guard in &guards {
                    prop_assert!(registry.grab_read_lock(guard.info().version_id()).is_ok());
                }
            }
        }
    }
}
