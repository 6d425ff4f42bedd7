// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bounded, timestamp-indexed store for transient per-frame metadata.
//!
//! Producers [`edit`](TimeWindowedStore::edit) a slot for a timestamp and
//! [`publish`](EditSlot::publish) it; consumers query by time window and get
//! either owned copies or pinned [`Snapshot`]s. The ring holds `capacity`
//! visible entries plus `backup` spare slots. A slot pinned by a reader is
//! never handed to a writer, and the spare slots guarantee a writer finds
//! an unpinned slot while readers hold fewer than `backup` snapshots.
//!
//! Slot selection and reference counts live under one index lock; each
//! slot's payload has its own lock which is only contended by readers of
//! the same slot.
//!
//! Several producers and consumers share one store through a
//! [`StoreContext`], created once at pipeline start and passed to each of
//! them.

use crate::error::{Error, Result};
use std::{
    collections::BTreeSet,
    fmt,
    ops::{Deref, DerefMut, RangeInclusive},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard},
};
use tracing::{debug, trace};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Writing,
    Published,
}

#[derive(Copy, Clone, Debug)]
struct SlotMeta {
    state: SlotState,
    timestamp: u64,
    refs: usize,
}

#[derive(Debug)]
struct Index {
    slots: Vec<SlotMeta>,
    cursor: usize,
    published: usize,
}

impl Index {
    /// Published slots whose timestamp satisfies `filter`, in time order.
    fn select(&self, filter: impl Fn(u64) -> bool) -> Vec<usize> {
        let mut selected: Vec<usize> = (0..self.slots.len())
            .filter(|&i| {
                let meta = &self.slots[i];
                meta.state == SlotState::Published && filter(meta.timestamp)
            })
            .collect();
        selected.sort_by_key(|&i| self.slots[i].timestamp);
        selected
    }

    fn evict_oldest(&mut self) {
        let oldest = (0..self.slots.len())
            .filter(|&i| self.slots[i].state == SlotState::Published)
            .min_by_key(|&i| self.slots[i].timestamp);
        if let Some(i) = oldest {
            self.slots[i].state = SlotState::Free;
            self.published -= 1;
        }
    }
}

/// Owned copy of one published entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry<T> {
    pub timestamp: u64,
    pub value: T,
}

/// Fixed-capacity ring of timestamped entries, safe for concurrent writers
/// and readers.
pub struct TimeWindowedStore<T> {
    capacity: usize,
    backup: usize,
    index: Mutex<Index>,
    data: Vec<RwLock<T>>,
}

impl<T: Default + Clone> TimeWindowedStore<T> {
    /// Creates a store showing at most `capacity` entries, with `backup`
    /// extra slots reserved for writes that overlap long reads.
    ///
    /// # Errors
    ///
    /// Returns `BadValue` if either size is zero.
    pub fn new(capacity: usize, backup: usize) -> Result<Self> {
        if capacity == 0 || backup == 0 {
            return Err(Error::bad_value(format!(
                "store sizes must be non-zero, got capacity={capacity} backup={backup}"
            )));
        }
        let total = capacity + backup;
        Ok(Self {
            capacity,
            backup,
            index: Mutex::new(Index {
                slots: vec![
                    SlotMeta {
                        state: SlotState::Free,
                        timestamp: 0,
                        refs: 0,
                    };
                    total
                ],
                cursor: 0,
                published: 0,
            }),
            data: (0..total).map(|_| RwLock::new(T::default())).collect(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves a slot for an entry at `timestamp`. The slot starts from
    /// `T::default()` and becomes visible to readers only once published.
    ///
    /// # Errors
    ///
    /// Returns `NoMemory` when every slot is being written or is pinned by
    /// a reader.
    pub fn edit(&self, timestamp: u64) -> Result<EditSlot<'_, T>> {
        let mut index = self.lock();
        let total = index.slots.len();
        let slot = (0..total)
            .map(|offset| (index.cursor + offset) % total)
            .find(|&i| index.slots[i].state == SlotState::Free && index.slots[i].refs == 0)
            .or_else(|| {
                // recycle the oldest published entry nobody is reading
                (0..total)
                    .filter(|&i| {
                        index.slots[i].state == SlotState::Published && index.slots[i].refs == 0
                    })
                    .min_by_key(|&i| index.slots[i].timestamp)
            })
            .ok_or_else(|| Error::no_memory("every metadata slot is busy"))?;

        if index.slots[slot].state == SlotState::Published {
            index.published -= 1;
        }
        index.slots[slot].state = SlotState::Writing;
        index.cursor = (slot + 1) % total;
        trace!(slot, timestamp, "metadata slot reserved");

        Ok(EditSlot {
            store: self,
            slot,
            timestamp,
            value: T::default(),
            published: false,
        })
    }

    fn publish_slot(&self, slot: usize, timestamp: u64, value: &mut T) {
        {
            let mut data = self.data[slot].write().unwrap_or_else(PoisonError::into_inner);
            std::mem::swap(&mut *data, value);
        }
        let mut index = self.lock();
        index.slots[slot].state = SlotState::Published;
        index.slots[slot].timestamp = timestamp;
        index.published += 1;
        while index.published > self.capacity {
            index.evict_oldest();
        }
        trace!(slot, timestamp, "metadata published");
    }

    fn abandon_slot(&self, slot: usize) {
        let mut index = self.lock();
        index.slots[slot].state = SlotState::Free;
    }

    fn pin(&self, filter: impl Fn(u64) -> bool) -> Vec<(usize, u64)> {
        let mut index = self.lock();
        let selected = index.select(filter);
        selected
            .into_iter()
            .map(|i| {
                index.slots[i].refs += 1;
                (i, index.slots[i].timestamp)
            })
            .collect()
    }

    fn unpin(&self, slot: usize) {
        let mut index = self.lock();
        index.slots[slot].refs -= 1;
    }

    fn copy_pinned(&self, pinned: Vec<(usize, u64)>) -> Vec<Entry<T>> {
        pinned
            .into_iter()
            .map(|(slot, timestamp)| {
                let value = self.data[slot]
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                self.unpin(slot);
                Entry { timestamp, value }
            })
            .collect()
    }

    /// Copies of every visible entry, oldest first.
    pub fn query(&self) -> Vec<Entry<T>> {
        self.copy_pinned(self.pin(|_| true))
    }

    /// Copies of the entries with `start <= timestamp <= end`, oldest first.
    pub fn query_range(&self, range: RangeInclusive<u64>) -> Vec<Entry<T>> {
        self.copy_pinned(self.pin(|ts| range.contains(&ts)))
    }

    /// Copies of the entries whose timestamp is exactly one of `timestamps`,
    /// oldest first. Timestamps with no entry are skipped.
    pub fn query_timestamps(&self, timestamps: &[u64]) -> Vec<Entry<T>> {
        self.copy_pinned(self.pin(|ts| timestamps.contains(&ts)))
    }

    pub fn query_latest(&self) -> Option<Entry<T>> {
        self.query().pop()
    }

    /// Copy of the entry closest in time to `timestamp`; ties go to the
    /// older entry.
    pub fn query_nearest(&self, timestamp: u64) -> Option<Entry<T>> {
        let nearest = {
            let mut index = self.lock();
            let nearest = index
                .select(|_| true)
                .into_iter()
                .min_by_key(|&i| index.slots[i].timestamp.abs_diff(timestamp));
            if let Some(i) = nearest {
                index.slots[i].refs += 1;
            }
            nearest.map(|i| (i, index.slots[i].timestamp))
        };
        nearest.and_then(|pinned| self.copy_pinned(vec![pinned]).pop())
    }

    /// Pins the entries in `range` without copying them. Each snapshot keeps
    /// its slot out of reach of writers until it is dropped or passed to
    /// [`return_info`](Self::return_info).
    pub fn lock_range(&self, range: RangeInclusive<u64>) -> Vec<Snapshot<'_, T>> {
        self.pin(|ts| range.contains(&ts))
            .into_iter()
            .map(|(slot, timestamp)| Snapshot {
                store: self,
                slot,
                timestamp,
                guard: self.data[slot].read().unwrap_or_else(PoisonError::into_inner),
            })
            .collect()
    }

    /// Gives a pinned snapshot back to the store.
    pub fn return_info(&self, snapshot: Snapshot<'_, T>) {
        drop(snapshot);
    }

    /// Number of visible entries.
    pub fn len(&self) -> usize {
        self.lock().published
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn backup(&self) -> usize {
        self.backup
    }
}

impl<T> fmt::Debug for TimeWindowedStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWindowedStore")
            .field("capacity", &self.capacity)
            .field("backup", &self.backup)
            .finish_non_exhaustive()
    }
}

/// Entry being written; invisible to readers until published. Dropping it
/// without publishing gives the slot back.
#[derive(Debug)]
pub struct EditSlot<'a, T: Default + Clone> {
    store: &'a TimeWindowedStore<T>,
    slot: usize,
    timestamp: u64,
    value: T,
    published: bool,
}

impl<T: Default + Clone> EditSlot<'_, T> {
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn publish(mut self) {
        self.store
            .publish_slot(self.slot, self.timestamp, &mut self.value);
        self.published = true;
    }
}

impl<T: Default + Clone> Deref for EditSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default + Clone> DerefMut for EditSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Default + Clone> Drop for EditSlot<'_, T> {
    fn drop(&mut self) {
        if !self.published {
            self.store.abandon_slot(self.slot);
        }
    }
}

/// Pinned, read-only view of one published entry.
pub struct Snapshot<'a, T: Default + Clone> {
    store: &'a TimeWindowedStore<T>,
    slot: usize,
    timestamp: u64,
    guard: RwLockReadGuard<'a, T>,
}

impl<T: Default + Clone> Snapshot<'_, T> {
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

impl<T: Default + Clone> Deref for Snapshot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: Default + Clone> Drop for Snapshot<'_, T> {
    fn drop(&mut self) {
        self.store.unpin(self.slot);
    }
}

struct ContextState<T> {
    store: Option<Arc<TimeWindowedStore<T>>>,
    users: BTreeSet<String>,
    generation: u64,
}

/// Owner of the shared metadata store.
///
/// Users attach by id and receive a [`StoreHandle`]; all handles alive at
/// the same time see the same store. When the last user detaches the
/// storage is released, and the next attach starts a new generation.
pub struct StoreContext<T> {
    capacity: usize,
    backup: usize,
    state: Mutex<ContextState<T>>,
}

impl<T: Default + Clone> StoreContext<T> {
    /// # Errors
    ///
    /// Returns `BadValue` if either size is zero.
    pub fn new(capacity: usize, backup: usize) -> Result<Arc<Self>> {
        if capacity == 0 || backup == 0 {
            return Err(Error::bad_value(format!(
                "store sizes must be non-zero, got capacity={capacity} backup={backup}"
            )));
        }
        Ok(Arc::new(Self {
            capacity,
            backup,
            state: Mutex::new(ContextState {
                store: None,
                users: BTreeSet::new(),
                generation: 0,
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ContextState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `user` and returns its view of the shared store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `user` is already attached.
    pub fn attach(self: &Arc<Self>, user: impl Into<String>) -> Result<StoreHandle<T>> {
        let user = user.into();
        let mut state = self.lock();
        if state.users.contains(&user) {
            return Err(Error::invalid_operation(format!(
                "metadata user {user} is already attached"
            )));
        }

        let store = match &state.store {
            Some(store) => Arc::clone(store),
            None => {
                let store = Arc::new(TimeWindowedStore::new(self.capacity, self.backup)?);
                state.generation += 1;
                state.store = Some(Arc::clone(&store));
                debug!(generation = state.generation, "metadata store created");
                store
            }
        };
        state.users.insert(user.clone());
        debug!(%user, users = state.users.len(), "metadata user attached");

        Ok(StoreHandle {
            context: Arc::clone(self),
            user,
            store,
        })
    }

    fn detach(&self, user: &str) {
        let mut state = self.lock();
        state.users.remove(user);
        debug!(%user, users = state.users.len(), "metadata user detached");
        if state.users.is_empty() {
            state.store = None;
        }
    }

    pub fn users(&self) -> usize {
        self.lock().users.len()
    }

    /// Number of stores created so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}

/// One user's attachment to a [`StoreContext`].
pub struct StoreHandle<T: Default + Clone> {
    context: Arc<StoreContext<T>>,
    user: String,
    store: Arc<TimeWindowedStore<T>>,
}

impl<T: Default + Clone> StoreHandle<T> {
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl<T: Default + Clone> Deref for StoreHandle<T> {
    type Target = TimeWindowedStore<T>;

    fn deref(&self) -> &TimeWindowedStore<T> {
        &self.store
    }
}

impl<T: Default + Clone> Drop for StoreHandle<T> {
    fn drop(&mut self) {
        self.context.detach(&self.user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_slot_is_not_reused() {
        let store = TimeWindowedStore::<u32>::new(1, 1).unwrap();
        let mut slot = store.edit(10).unwrap();
        *slot = 1;
        slot.publish();

        let pinned = store.lock_range(0..=100);
        assert_eq!(pinned.len(), 1);

        // the only unpinned slot is the backup one
        let mut slot = store.edit(20).unwrap();
        *slot = 2;
        slot.publish();
        assert_eq!(*pinned[0], 1);

        // both slots are now taken: one pinned, one visible but unread
        let mut slot = store.edit(30).unwrap();
        *slot = 3;
        assert!(matches!(store.edit(40), Err(Error::NoMemory(_))));
        slot.publish();
        drop(pinned);

        let latest = store.query_latest().unwrap();
        assert_eq!(latest.timestamp, 30);
        assert_eq!(latest.value, 3);
    }

    #[test]
    fn abandoned_edit_frees_slot() {
        let store = TimeWindowedStore::<u32>::new(1, 1).unwrap();
        drop(store.edit(5).unwrap());
        assert!(store.is_empty());
        store.edit(6).unwrap().publish();
        store.edit(7).unwrap().publish();
        assert_eq!(store.len(), 1);
    }
}
