// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use dashmap::DashMap;

/// An object that can be recycled through a pool.
pub trait Reusable: Default + Send + 'static {
    /// Restore the object to its hand-out state. Called before the object
    /// re-enters a free list.
    fn reset(&mut self);
}

struct Slot<T> {
    value: T,
    // the free list this slot grew out of; frees always go back there
    owner: async_channel::Sender<Box<Slot<T>>>,
}

/// RAII handle to a pooled object. Dropping it resets the object and pushes
/// it back onto the free list of the thread that allocated it.
pub struct Pooled<T: Reusable> {
    slot: Option<Box<Slot<T>>>,
}

impl<T: Reusable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.slot.as_ref().unwrap().value
    }
}

impl<T: Reusable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.slot.as_mut().unwrap().value
    }
}

impl<T: Reusable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.value.reset();
            let owner = slot.owner.clone();
            let _ = owner.try_send(slot);
        }
    }
}

struct FreeList<T> {
    tx: async_channel::Sender<Box<Slot<T>>>,
    rx: async_channel::Receiver<Box<Slot<T>>>,
}

/// Object pool with one free list per calling thread.
///
/// Growth happens in fixed chunks and only ever on the allocating thread;
/// every slot records the list it grew out of, so freeing from any other
/// thread is a single lock-free push onto the owning list rather than a push
/// onto the caller's. Chunks are never reclaimed: the pool trades monotonic
/// memory growth for contention-free allocate/free pairs on a steady thread.
pub struct LocalPool<T: Reusable> {
    chunk_size: usize,
    lists: DashMap<ThreadId, FreeList<T>>,
}

impl<T: Reusable> LocalPool<T> {
    pub fn new(chunk_size: usize) -> LocalPool<T> {
        LocalPool {
            chunk_size: chunk_size.max(1),
            lists: DashMap::new(),
        }
    }

    /// Take an object from the calling thread's free list, growing the list
    /// by one chunk when it is empty. Never fails.
    pub fn allocate(&self) -> Pooled<T> {
        let (tx, rx) = {
            let entry = self.lists.entry(thread::current().id()).or_insert_with(|| {
                let (tx, rx) = async_channel::unbounded();
                FreeList { tx, rx }
            });
            (entry.tx.clone(), entry.rx.clone())
        };

        loop {
            match rx.try_recv() {
                Ok(slot) => return Pooled { slot: Some(slot) },
                Err(_) => {
                    for _ in 0..self.chunk_size {
                        let slot = Box::new(Slot {
                            value: T::default(),
                            owner: tx.clone(),
                        });
                        let _ = tx.try_send(slot);
                    }
                }
            }
        }
    }

    /// Return an object to the free list it grew out of. Equivalent to
    /// dropping the handle.
    pub fn free(&self, pooled: Pooled<T>) {
        drop(pooled);
    }

    /// Number of threads that have allocated from this pool so far.
    pub fn list_count(&self) -> usize {
        self.lists.len()
    }
}
