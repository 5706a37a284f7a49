//! The generation-checked handle table.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::error;

use crate::dispatcher::Dispatcher;
use crate::error::{SystemError, SystemResult};
use crate::handle::Handle;
use crate::sync::lock;

/// Default upper bound on live handles.
pub const DEFAULT_MAX_HANDLES: usize = 1_000_000;

enum Entry {
    Ready(Dispatcher),
    /// Attached to a message that is being written.
    Busy(Dispatcher),
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Maps handles to dispatchers.
///
/// Slots live in a sharded map so unrelated handles never contend on one
/// lock. A released slot's generation is bumped before the index is reused,
/// so stale handles are rejected.
pub struct HandleTable {
    slots: DashMap<u32, Slot>,
    free: Mutex<Vec<u32>>,
    next_index: AtomicU32,
    live: AtomicUsize,
    max_handles: usize,
}

impl HandleTable {
    /// Create a table that holds at most `max_handles` live handles.
    #[must_use]
    pub fn new(max_handles: usize) -> Self {
        Self {
            slots: DashMap::new(),
            free: Mutex::new(Vec::new()),
            next_index: AtomicU32::new(0),
            live: AtomicUsize::new(0),
            max_handles,
        }
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Whether the table holds no handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a dispatcher and return its new handle.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ResourceExhausted`] when the table is full. The
    /// rejected dispatcher is closed.
    pub fn add(&self, dispatcher: Dispatcher) -> SystemResult<Handle> {
        let max = self.max_handles;
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_add(1).filter(|next| *next <= max)
            });
        if reserved.is_err() {
            error!(max_handles = max, "Handle table full");
            dispatcher.close();
            return Err(SystemError::ResourceExhausted(format!(
                "handle table full ({max} handles)"
            )));
        }

        let index = lock(&self.free)
            .pop()
            .unwrap_or_else(|| self.next_index.fetch_add(1, Ordering::Relaxed));
        let mut slot = self.slots.entry(index).or_insert(Slot {
            generation: 1,
            entry: None,
        });
        slot.entry = Some(Entry::Ready(dispatcher));
        Ok(Handle::new(index, slot.generation))
    }

    /// Look up the dispatcher behind `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::InvalidArgument`] for unknown or stale handles
    /// and [`SystemError::Busy`] while the handle is attached to a write.
    pub fn get(&self, handle: Handle) -> SystemResult<Dispatcher> {
        let slot = self.slot(handle)?;
        match &slot.entry {
            Some(Entry::Ready(d)) => Ok(d.clone()),
            Some(Entry::Busy(_)) => Err(SystemError::Busy),
            None => Err(unknown(handle)),
        }
    }

    /// Remove `handle` from the table without closing its dispatcher.
    ///
    /// # Errors
    ///
    /// Same conditions as [`HandleTable::get`].
    pub fn remove(&self, handle: Handle) -> SystemResult<Dispatcher> {
        let dispatcher = {
            let mut slot = self.slot_mut(handle)?;
            match slot.entry.take() {
                Some(Entry::Ready(d)) => {
                    slot.generation = next_generation(slot.generation);
                    d
                },
                Some(busy @ Entry::Busy(_)) => {
                    slot.entry = Some(busy);
                    return Err(SystemError::Busy);
                },
                None => return Err(unknown(handle)),
            }
        };
        self.release_index(handle.index());
        Ok(dispatcher)
    }

    /// Mark `handles` busy and return their dispatchers.
    ///
    /// Either every handle is marked or none is.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Busy`] or [`SystemError::InvalidArgument`] for
    /// the first handle that cannot be marked.
    pub fn begin_transit(&self, handles: &[Handle]) -> SystemResult<Vec<Dispatcher>> {
        let mut marked = Vec::with_capacity(handles.len());
        for (i, handle) in handles.iter().enumerate() {
            let result = self.slot_mut(*handle).and_then(|mut slot| {
                match slot.entry.take() {
                    Some(Entry::Ready(d)) => {
                        slot.entry = Some(Entry::Busy(d.clone()));
                        Ok(d)
                    },
                    Some(busy @ Entry::Busy(_)) => {
                        slot.entry = Some(busy);
                        Err(SystemError::Busy)
                    },
                    None => Err(unknown(*handle)),
                }
            });
            match result {
                Ok(d) => marked.push(d),
                Err(e) => {
                    self.cancel_transit(&handles[..i]);
                    return Err(e);
                },
            }
        }
        Ok(marked)
    }

    /// Drop busy `handles` from the table after a successful write.
    pub fn complete_transit(&self, handles: &[Handle]) {
        for handle in handles {
            let released = self.slot_mut(*handle).is_ok_and(|mut slot| {
                if matches!(slot.entry, Some(Entry::Busy(_))) {
                    slot.entry = None;
                    slot.generation = next_generation(slot.generation);
                    true
                } else {
                    false
                }
            });
            if released {
                self.release_index(handle.index());
            }
        }
    }

    /// Return busy `handles` to the ready state after a failed write.
    pub fn cancel_transit(&self, handles: &[Handle]) {
        for handle in handles {
            if let Ok(mut slot) = self.slot_mut(*handle)
                && let Some(Entry::Busy(d)) = slot.entry.take()
            {
                slot.entry = Some(Entry::Ready(d));
            }
        }
    }

    /// Remove and return every dispatcher, leaving the table empty.
    pub fn drain(&self) -> Vec<Dispatcher> {
        let indices: Vec<u32> = self.slots.iter().map(|e| *e.key()).collect();
        let mut drained = Vec::new();
        for index in indices {
            let taken = self.slots.get_mut(&index).and_then(|mut slot| {
                let entry = slot.entry.take()?;
                slot.generation = next_generation(slot.generation);
                Some(entry)
            });
            if let Some(Entry::Ready(d) | Entry::Busy(d)) = taken {
                self.release_index(index);
                drained.push(d);
            }
        }
        drained
    }

    fn slot(&self, handle: Handle) -> SystemResult<dashmap::mapref::one::Ref<'_, u32, Slot>> {
        self.slots
            .get(&handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .ok_or_else(|| unknown(handle))
    }

    fn slot_mut(
        &self,
        handle: Handle,
    ) -> SystemResult<dashmap::mapref::one::RefMut<'_, u32, Slot>> {
        self.slots
            .get_mut(&handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .ok_or_else(|| unknown(handle))
    }

    fn release_index(&self, index: u32) {
        lock(&self.free).push(index);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.len())
            .field("max_handles", &self.max_handles)
            .finish_non_exhaustive()
    }
}

fn next_generation(generation: u32) -> u32 {
    generation.wrapping_add(1).max(1)
}

fn unknown(handle: Handle) -> SystemError {
    SystemError::invalid(format!("unknown handle {handle}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatcherKind, MessagePipeEndpoint, SharedBufferDispatcher};

    fn buffer() -> Dispatcher {
        Dispatcher::SharedBuffer(SharedBufferDispatcher::create(8).unwrap())
    }

    #[test]
    fn test_add_get_remove() {
        let table = HandleTable::new(16);
        let h = table.add(buffer()).unwrap();
        assert_eq!(table.get(h).unwrap().kind(), DispatcherKind::SharedBuffer);
        assert_eq!(table.len(), 1);

        table.remove(h).unwrap();
        assert!(matches!(table.get(h), Err(SystemError::InvalidArgument(_))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_rejected_after_slot_reuse() {
        let table = HandleTable::new(16);
        let old = table.add(buffer()).unwrap();
        table.remove(old).unwrap();

        let new = table.add(buffer()).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(table.get(old).is_err());
        assert!(table.get(new).is_ok());
    }

    #[test]
    fn test_full_table() {
        let table = HandleTable::new(2);
        table.add(buffer()).unwrap();
        table.add(buffer()).unwrap();

        let rejected = buffer();
        let err = table.add(rejected.clone()).unwrap_err();
        assert!(matches!(err, SystemError::ResourceExhausted(_)));
        if let Dispatcher::SharedBuffer(b) = rejected {
            assert!(!b.is_open());
        }
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_transit_marks_busy() {
        let table = HandleTable::new(16);
        let a = table.add(buffer()).unwrap();
        let b = table.add(buffer()).unwrap();

        let dispatchers = table.begin_transit(&[a, b]).unwrap();
        assert_eq!(dispatchers.len(), 2);
        assert_eq!(table.get(a).unwrap_err(), SystemError::Busy);
        assert_eq!(table.begin_transit(&[a]).unwrap_err(), SystemError::Busy);
        assert_eq!(table.remove(b).unwrap_err(), SystemError::Busy);

        table.cancel_transit(&[a, b]);
        assert!(table.get(a).is_ok());

        table.begin_transit(&[a, b]).unwrap();
        table.complete_transit(&[a, b]);
        assert!(table.get(a).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_transit_is_all_or_nothing() {
        let table = HandleTable::new(16);
        let a = table.add(buffer()).unwrap();
        let bogus = Handle::new(99, 1);
        assert!(table.begin_transit(&[a, bogus]).is_err());
        assert!(table.get(a).is_ok());
    }

    #[test]
    fn test_concurrent_add_remove() {
        let table = std::sync::Arc::new(HandleTable::new(10_000));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = std::sync::Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let (a, _b) = MessagePipeEndpoint::pair();
                        let h = table.add(Dispatcher::MessagePipe(a)).unwrap();
                        assert!(table.get(h).is_ok());
                        table.remove(h).unwrap();
                        assert!(table.get(h).is_err());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain() {
        let table = HandleTable::new(16);
        let h = table.add(buffer()).unwrap();
        table.add(buffer()).unwrap();
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
        assert!(table.get(h).is_err());
    }
}
