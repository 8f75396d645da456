//! Per-thread command pool multiplexer.
//!
//! # Overview
//!
//! Native command pools may only be used by one thread at a time, so
//! [`ThreadedCommandPool`] keeps one native pool per `(thread, queue type)`
//! pair and hands out [`CommandList`]s from the pool of the calling thread.
//!
//! Lists are handed out by value. Once the GPU has finished with them they
//! come back through [`reclaim`](ThreadedCommandPool::reclaim), and the next
//! [`new_frame`](ThreadedCommandPool::new_frame) resets the native pools and
//! moves every reclaimed list to the idle list for reuse. Lists are never
//! freed during normal operation; [`trim`](ThreadedCommandPool::trim) frees
//! them only during idle windows.
//!
//! Thread ids are never reused, so a pool whose thread handed out no list
//! during a whole cycle is destroyed by `new_frame` together with its lists.
//! Recording on short-lived threads therefore keeps at most two pools per
//! worker alive: the one in use and the one waiting to be released.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendFeature, NativeCommandPool};
use crate::command_list::CommandList;
use crate::error::RhiResult;
use crate::types::QueueType;

type PoolKey = (ThreadId, QueueType);

/// One native pool and the lists allocated from it.
#[derive(Debug)]
struct Pool {
    native: NativeCommandPool,
    /// Reset lists ready to be handed out.
    idle: Vec<CommandList>,
    /// Lists handed back since the last pool reset.
    returned: Vec<CommandList>,
    /// Lists allocated from the native pool and not yet freed.
    allocated: usize,
    /// Set when a list is handed out, cleared by each pool reset.
    used: bool,
}

impl Pool {
    fn free_lists(&mut self, backend: &dyn Backend) {
        for mut list in self.idle.drain(..).chain(self.returned.drain(..)) {
            list.reset(backend);
            backend.command_list_free(self.native, list.native());
            self.allocated -= 1;
        }
    }

    /// No list handed out since the last reset and every list is back home.
    fn is_stale(&self) -> bool {
        !self.used && self.idle.len() + self.returned.len() == self.allocated
    }
}

/// Command list allocator keyed by calling thread and queue type.
#[derive(Debug, Default)]
pub struct ThreadedCommandPool {
    pools: Mutex<HashMap<PoolKey, Pool>>,
}

impl ThreadedCommandPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a recording command list from the calling thread's pool for
    /// `queue`, creating the pool and the list as needed.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the pool or list could not be created,
    /// or if recording could not begin.
    pub fn allocate_cmd_list(&self, backend: &dyn Backend, queue: QueueType) -> RhiResult<CommandList> {
        let thread = thread::current().id();
        let mut pools = self.pools.lock();

        let pool = match pools.entry((thread, queue)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let native = backend.command_pool_create(queue)?;
                debug!("Command pool {:?} created for {:?} on {:?}", native, queue, thread);
                entry.insert(Pool {
                    native,
                    idle: Vec::new(),
                    returned: Vec::new(),
                    allocated: 0,
                    used: false,
                })
            }
        };
        pool.used = true;

        let mut list = match pool.idle.pop() {
            Some(list) => list,
            None => {
                let native = backend.command_list_allocate(pool.native)?;
                pool.allocated += 1;
                CommandList::new(native, pool.native, queue, thread)
            }
        };
        if let Err(err) = list.begin(backend) {
            pool.idle.push(list);
            return Err(err);
        }
        Ok(list)
    }

    /// Hands a list back to the pool it came from. It becomes available again
    /// after the next [`new_frame`](Self::new_frame).
    ///
    /// # Panics
    ///
    /// Panics if the list was not allocated from this pool.
    pub fn reclaim(&self, list: CommandList) {
        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(&(list.thread(), list.queue_type()))
            .filter(|pool| pool.native == list.pool());
        match pool {
            Some(pool) => pool.returned.push(list),
            None => panic!("command list {:?} reclaimed by a foreign pool", list.native()),
        }
    }

    /// Destroys the pools that handed out no list since the previous call,
    /// then resets every remaining native pool and every reclaimed list.
    ///
    /// # Errors
    ///
    /// Returns the backend error of the first pool that failed to reset.
    pub fn new_frame(&self, backend: &dyn Backend) -> RhiResult<()> {
        let mut pools = self.pools.lock();

        let stale: Vec<PoolKey> = pools
            .iter()
            .filter(|(_, pool)| pool.is_stale())
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(mut pool) = pools.remove(&key) {
                pool.free_lists(backend);
                backend.command_pool_destroy(pool.native);
                debug!("Command pool {:?} of {:?} released after an unused cycle", pool.native, key.0);
            }
        }

        for pool in pools.values_mut() {
            backend.command_pool_reset(pool.native)?;
            pool.used = false;
            for mut list in pool.returned.drain(..) {
                list.reset(backend);
                pool.idle.push(list);
            }
        }
        Ok(())
    }

    /// Frees every list held by the pools and, when the backend supports it,
    /// lets the native pools release their reserved memory.
    ///
    /// Lists still handed out are not affected; call this only while no list
    /// is recording or in flight.
    pub fn trim(&self, backend: &dyn Backend) {
        let trim_native = backend.support_feature(BackendFeature::CommandPoolTrim);
        let mut pools = self.pools.lock();
        for pool in pools.values_mut() {
            pool.free_lists(backend);
            if trim_native {
                backend.command_pool_trim(pool.native);
            }
        }
    }

    /// Frees every list and destroys every native pool.
    pub fn destroy(&self, backend: &dyn Backend) {
        let mut pools = self.pools.lock();
        for (_, mut pool) in pools.drain() {
            pool.free_lists(backend);
            if pool.allocated != 0 {
                warn!(
                    "Command pool {:?} destroyed with {} lists still handed out",
                    pool.native,
                    pool.allocated
                );
            }
            backend.command_pool_destroy(pool.native);
        }
    }

    /// Number of native pools.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Number of lists currently allocated from the native pools.
    pub fn list_count(&self) -> usize {
        self.pools.lock().values().map(|pool| pool.allocated).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_pool_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ThreadedCommandPool>();
    }

    #[test]
    fn test_lists_are_reused_after_new_frame() {
        let backend = HeadlessBackend::new();
        let pool = ThreadedCommandPool::new();

        let list = pool.allocate_cmd_list(&backend, QueueType::Graphics).unwrap();
        assert!(list.is_recording());
        let native = list.native();
        pool.reclaim(list);

        pool.new_frame(&backend).unwrap();
        let list = pool.allocate_cmd_list(&backend, QueueType::Graphics).unwrap();
        assert_eq!(list.native(), native);
        assert_eq!(pool.list_count(), 1);
        pool.reclaim(list);

        assert_eq!(backend.stats().command_lists_allocated, 1);
        assert_eq!(backend.stats().pool_resets, 1);
        pool.destroy(&backend);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_reclaimed_list_waits_for_reset() {
        let backend = HeadlessBackend::new();
        let pool = ThreadedCommandPool::new();

        let first = pool.allocate_cmd_list(&backend, QueueType::Transfer).unwrap();
        pool.reclaim(first);
        let second = pool.allocate_cmd_list(&backend, QueueType::Transfer).unwrap();
        assert_eq!(pool.list_count(), 2);
        pool.reclaim(second);
        pool.destroy(&backend);
    }

    #[test]
    fn test_one_pool_per_thread_and_queue() {
        let backend = HeadlessBackend::new();
        let pool = ThreadedCommandPool::new();

        let graphics = pool.allocate_cmd_list(&backend, QueueType::Graphics).unwrap();
        let compute = pool.allocate_cmd_list(&backend, QueueType::Compute).unwrap();
        let remote = thread::scope(|s| {
            s.spawn(|| pool.allocate_cmd_list(&backend, QueueType::Graphics).unwrap())
                .join()
                .unwrap()
        });
        assert_eq!(pool.pool_count(), 3);
        assert_ne!(graphics.pool(), remote.pool());
        assert_ne!(graphics.thread(), remote.thread());

        for list in [graphics, compute, remote] {
            pool.reclaim(list);
        }
        pool.destroy(&backend);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_trim_frees_idle_lists() {
        let backend = HeadlessBackend::new();
        let pool = ThreadedCommandPool::new();

        let list = pool.allocate_cmd_list(&backend, QueueType::Graphics).unwrap();
        pool.reclaim(list);
        pool.trim(&backend);

        assert_eq!(pool.list_count(), 0);
        assert_eq!(backend.stats().command_lists_freed, 1);
        assert_eq!(backend.stats().pool_trims, 1);

        // The pool itself survives and allocates fresh lists.
        let list = pool.allocate_cmd_list(&backend, QueueType::Graphics).unwrap();
        pool.reclaim(list);
        assert_eq!(pool.pool_count(), 1);
        pool.destroy(&backend);
    }

    #[test]
    fn test_pool_of_finished_thread_is_released() {
        let backend = HeadlessBackend::new();
        let pool = ThreadedCommandPool::new();

        let list = thread::scope(|s| {
            s.spawn(|| pool.allocate_cmd_list(&backend, QueueType::Graphics).unwrap())
                .join()
                .unwrap()
        });
        pool.reclaim(list);

        // The cycle that handed out the list keeps the pool.
        pool.new_frame(&backend).unwrap();
        assert_eq!(pool.pool_count(), 1);

        // A whole cycle without allocations releases it.
        pool.new_frame(&backend).unwrap();
        assert_eq!(pool.pool_count(), 0);
        assert_eq!(pool.list_count(), 0);
        assert_eq!(backend.stats().command_lists_freed, 1);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_pool_with_outstanding_list_is_kept() {
        let backend = HeadlessBackend::new();
        let pool = ThreadedCommandPool::new();

        let list = pool.allocate_cmd_list(&backend, QueueType::Compute).unwrap();
        pool.new_frame(&backend).unwrap();
        pool.new_frame(&backend).unwrap();
        assert_eq!(pool.pool_count(), 1);

        pool.reclaim(list);
        pool.destroy(&backend);
        assert_eq!(backend.live_objects(), 0);
    }
}
