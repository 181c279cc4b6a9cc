// Page cache with in-flight read coalescing.
//
// A fixed set of page-sized slots fronts the volume file. Cache metadata
// (the physical-page mapping, slot bookkeeping, and the bounded pending
// read queue) lives under one mutex; the slot buffers themselves are read
// lock-free under the pending-search protocol:
//
// * A searcher, holding the state mutex, publishes which page it is about
//   to read into its zone's search counter, then drops the mutex and
//   reads the buffer.
// * An evictor first unmaps the slot under the mutex (so no new searcher
//   can reach it), then waits until no zone's counter names the page
//   before reusing the buffer.
//
// Because counters are only published under the mutex, an evictor that
// holds the mutex sees every searcher that could still be touching the
// slot, and searchers never take the mutex while their counter is set.
//
// Reads are coalesced: at most one disk read is ever in flight per
// physical page, with every interested request attached to it. Reader
// threads drain the queue, honor a STOP state that pauses dequeues
// without losing work, and hand completed requests back to the request
// pipeline through the registered restarter.

use crate::error::Result;
use crate::request::Request;
use crate::volume::storage::IndexStorage;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

/// Bound on the pending read queue. As a ring it keeps one slot open, so
/// at most `MAX_QUEUED_READS - 1` pages can be waiting at once.
pub const MAX_QUEUED_READS: usize = 4096;

/// Result of handing a request to the read queue.
pub enum EnqueueOutcome {
    /// The page arrived in the cache meanwhile; the request comes back.
    AlreadyCached(Box<Request>),
    /// The request is now owned by the read; it will be restarted.
    Queued,
    /// The queue is full; the request comes back and the caller must
    /// retry by other means.
    Full(Box<Request>),
}

type Restarter = Box<dyn Fn(Box<Request>) + Send + Sync>;

struct CacheSlot {
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: slot buffers are only written by a thread that unmapped the
// slot under the state mutex and drained the search counters, and only
// read under a published search counter. See the module comment.
unsafe impl Sync for CacheSlot {}

#[derive(Clone, Copy)]
struct SlotMeta {
    // Physical page held by the slot, 0 = empty. Data pages are 1-based
    // (page 0 is the volume header and is never cached).
    physical_page: u32,
    last_used: u64,
}

struct PendingRead {
    requests: Vec<Box<Request>>,
}

struct CacheState {
    mapping: HashMap<u32, usize>,
    meta: Vec<SlotMeta>,
    queue: VecDeque<u32>,
    pending: HashMap<u32, PendingRead>,
    stopped: bool,
    shutdown: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub reads_issued: u64,
    pub invalidations: u64,
}

pub struct PageCache {
    storage: Arc<IndexStorage>,
    slots: Vec<CacheSlot>,
    search_counters: Vec<CachePadded<AtomicU64>>,
    state: Mutex<CacheState>,
    read_ready: Condvar,
    read_done: Condvar,
    clock: AtomicU64,
    restarter: OnceLock<Restarter>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    reads_issued: AtomicU64,
    invalidations: AtomicU64,
}

impl PageCache {
    pub fn new(
        storage: Arc<IndexStorage>,
        cache_pages: usize,
        zone_count: usize,
        read_threads: usize,
    ) -> Arc<Self> {
        let bytes_per_page = storage.bytes_per_page();
        let cache = Arc::new(Self {
            storage,
            slots: (0..cache_pages)
                .map(|_| CacheSlot {
                    data: UnsafeCell::new(vec![0u8; bytes_per_page].into_boxed_slice()),
                })
                .collect(),
            search_counters: (0..zone_count)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            state: Mutex::new(CacheState {
                mapping: HashMap::new(),
                meta: vec![
                    SlotMeta {
                        physical_page: 0,
                        last_used: 0,
                    };
                    cache_pages
                ],
                queue: VecDeque::new(),
                pending: HashMap::new(),
                stopped: false,
                shutdown: false,
            }),
            read_ready: Condvar::new(),
            read_done: Condvar::new(),
            clock: AtomicU64::new(1),
            restarter: OnceLock::new(),
            readers: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            reads_issued: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        });
        let mut readers = cache.readers.lock();
        for reader in 0..read_threads {
            let cache = Arc::clone(&cache);
            readers.push(
                std::thread::Builder::new()
                    .name(format!("volume-reader-{}", reader))
                    .spawn(move || cache.reader_loop())
                    .expect("spawn volume reader thread"),
            );
        }
        drop(readers);
        cache
    }

    /// Register the function that hands restarted requests back to the
    /// request pipeline. Must be called before any request is enqueued.
    pub fn set_restarter(&self, restarter: Restarter) {
        let _ = self.restarter.set(restarter);
    }

    // ------------------------------------------------------------------
    // Hit path
    // ------------------------------------------------------------------

    /// Run `f` over the cached page, if present. The pending-search
    /// protocol protects the buffer for the duration of the call.
    pub fn with_page<R>(
        &self,
        physical_page: u32,
        zone_number: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let slot = {
            let mut state = self.state.lock();
            let Some(&slot) = state.mapping.get(&physical_page) else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            state.meta[slot].last_used = self.clock.fetch_add(1, Ordering::Relaxed);
            self.begin_pending_search(physical_page, zone_number);
            slot
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the search counter was published while holding the
        // state mutex, so any evictor will wait for it before reusing
        // this slot's buffer.
        let result = f(unsafe { &**self.slots[slot].data.get() });
        self.end_pending_search(zone_number);
        Some(result)
    }

    #[inline]
    fn begin_pending_search(&self, physical_page: u32, zone_number: usize) {
        self.search_counters[zone_number]
            .store(((physical_page as u64 + 1) << 1) | 1, Ordering::Release);
    }

    #[inline]
    fn end_pending_search(&self, zone_number: usize) {
        self.search_counters[zone_number].store(0, Ordering::Release);
    }

    fn wait_for_pending_searches(&self, physical_page: u32) {
        let marker = ((physical_page as u64 + 1) << 1) | 1;
        for counter in &self.search_counters {
            while counter.load(Ordering::Acquire) == marker {
                std::thread::yield_now();
            }
        }
    }

    // ------------------------------------------------------------------
    // Miss path
    // ------------------------------------------------------------------

    /// Attach a request to a (possibly new) pending read of the page.
    pub fn enqueue_read(&self, physical_page: u32, request: Box<Request>) -> EnqueueOutcome {
        let mut state = self.state.lock();
        if state.shutdown {
            // No readers left to drain the queue; callers fall back to a
            // blocking read.
            return EnqueueOutcome::Full(request);
        }
        if state.mapping.contains_key(&physical_page) {
            return EnqueueOutcome::AlreadyCached(request);
        }
        if let Some(pending) = state.pending.get_mut(&physical_page) {
            pending.requests.push(request);
            return EnqueueOutcome::Queued;
        }
        if state.queue.len() >= MAX_QUEUED_READS - 1 {
            return EnqueueOutcome::Full(request);
        }
        state.pending.insert(
            physical_page,
            PendingRead {
                requests: vec![request],
            },
        );
        state.queue.push_back(physical_page);
        drop(state);
        self.read_ready.notify_one();
        EnqueueOutcome::Queued
    }

    /// Read a page through the cache, blocking the calling thread. Used
    /// by maintenance paths and as the fallback when the read queue is
    /// full.
    pub fn read_page_blocking(&self, physical_page: u32, zone_number: usize) -> Result<Vec<u8>> {
        loop {
            if let Some(data) = self.with_page(physical_page, zone_number, |page| page.to_vec()) {
                return Ok(data);
            }
            let mut state = self.state.lock();
            if state.mapping.contains_key(&physical_page) {
                continue;
            }
            if state.pending.contains_key(&physical_page) {
                // A reader thread owns this page; wait for it.
                self.read_done.wait(&mut state);
                continue;
            }
            // Read it ourselves on this thread.
            drop(state);
            let data = self.storage.read_page(physical_page)?;
            self.reads_issued.fetch_add(1, Ordering::Relaxed);
            let mut state = self.state.lock();
            if !state.mapping.contains_key(&physical_page) {
                self.install_page(&mut state, physical_page, &data);
            }
            return Ok(data);
        }
    }

    // ------------------------------------------------------------------
    // Reader threads
    // ------------------------------------------------------------------

    fn reader_loop(&self) {
        loop {
            let physical_page = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        break;
                    }
                    if !state.stopped && !state.queue.is_empty() {
                        break;
                    }
                    self.read_ready.wait(&mut state);
                }
                if state.shutdown && state.queue.is_empty() {
                    return;
                }
                match state.queue.pop_front() {
                    Some(page) => page,
                    None => continue,
                }
            };

            let result = self.storage.read_page(physical_page);
            self.reads_issued.fetch_add(1, Ordering::Relaxed);

            let requests = {
                let mut state = self.state.lock();
                let pending = state.pending.remove(&physical_page);
                if let Ok(data) = &result {
                    if !state.mapping.contains_key(&physical_page) {
                        self.install_page(&mut state, physical_page, data);
                    }
                }
                pending.map(|p| p.requests).unwrap_or_default()
            };
            self.read_done.notify_all();

            let error = result.err();
            for mut request in requests {
                if let Some(error) = &error {
                    request.status = Err(error.clone());
                }
                if let Some(restarter) = self.restarter.get() {
                    restarter(request);
                }
            }
        }
    }

    // Install page data into a slot, evicting if needed. Called with the
    // state mutex held.
    fn install_page(&self, state: &mut CacheState, physical_page: u32, data: &[u8]) {
        debug_assert!(!state.mapping.contains_key(&physical_page));
        let slot = self.claim_slot(state);
        // SAFETY: the slot was just unmapped under the mutex and its
        // pending searches drained, so this thread has exclusive access
        // to the buffer.
        unsafe {
            (&mut (*self.slots[slot].data.get()))[..].copy_from_slice(data);
        }
        state.meta[slot] = SlotMeta {
            physical_page,
            last_used: self.clock.fetch_add(1, Ordering::Relaxed),
        };
        state.mapping.insert(physical_page, slot);
    }

    fn claim_slot(&self, state: &mut CacheState) -> usize {
        let mut victim = 0usize;
        let mut best = u64::MAX;
        for (slot, meta) in state.meta.iter().enumerate() {
            if meta.physical_page == 0 {
                victim = slot;
                best = 0;
                break;
            }
            if meta.last_used < best {
                best = meta.last_used;
                victim = slot;
            }
        }
        let old_page = state.meta[victim].physical_page;
        if old_page != 0 {
            state.mapping.remove(&old_page);
            state.meta[victim].physical_page = 0;
            self.wait_for_pending_searches(old_page);
        }
        victim
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Drop any cache entry for the page. No disk effect.
    pub fn invalidate_page(&self, physical_page: u32) {
        let mut state = self.state.lock();
        if let Some(slot) = state.mapping.remove(&physical_page) {
            state.meta[slot].physical_page = 0;
            self.wait_for_pending_searches(physical_page);
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict every page of an expiring chapter.
    pub fn invalidate_chapter(&self, first_page: u32, page_count: u32) {
        for page in first_page..first_page + page_count {
            self.invalidate_page(page);
        }
    }

    // ------------------------------------------------------------------
    // Reader control
    // ------------------------------------------------------------------

    /// Pause dequeues. Queued reads are kept, in order.
    pub fn stop_readers(&self) {
        self.state.lock().stopped = true;
    }

    /// Resume dequeues.
    pub fn start_readers(&self) {
        self.state.lock().stopped = false;
        self.read_ready.notify_all();
    }

    /// Stop the reader pool for good, draining any queued reads first.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.stopped = false;
        }
        self.read_ready.notify_all();
        let readers = std::mem::take(&mut *self.readers.lock());
        for reader in readers {
            let _ = reader.join();
        }
    }

    pub fn queued_reads(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn stats(&self) -> PageCacheStats {
        PageCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reads_issued: self.reads_issued.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RecordName;
    use crate::request::{Request, RequestType};
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn storage(pages: u32) -> Arc<IndexStorage> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("volume.dat");
        let storage = Arc::new(IndexStorage::create(&path, 512, pages as u64).unwrap());
        for page in 0..pages {
            let mut data = vec![0u8; 512];
            data[0..4].copy_from_slice(&page.to_le_bytes());
            data[511] = 0x5a;
            storage.write_page(page, &data).unwrap();
        }
        // Leak the tempdir so the file outlives the helper
        std::mem::forget(dir);
        storage
    }

    fn request() -> Box<Request> {
        Box::new(Request::new(RequestType::Query, RecordName([0u8; 32])))
    }

    #[test]
    fn test_blocking_read_and_hit() {
        let cache = PageCache::new(storage(16), 4, 1, 1);
        let data = cache.read_page_blocking(3, 0).unwrap();
        assert_eq!(&data[0..4], &3u32.to_le_bytes());
        // Second access is a pure cache hit
        let hit = cache.with_page(3, 0, |page| page[511]).unwrap();
        assert_eq!(hit, 0x5a);
        assert_eq!(cache.stats().reads_issued, 1);
        cache.shutdown();
    }

    #[test]
    fn test_concurrent_reads_coalesce_to_one_disk_read() {
        let storage = storage(16);
        let reads_before = storage.stats().reads;
        let cache = PageCache::new(Arc::clone(&storage), 4, 1, 2);
        let (sender, receiver) = mpsc::channel::<Box<Request>>();
        cache.set_restarter(Box::new(move |request| {
            sender.send(request).unwrap();
        }));

        cache.stop_readers();
        for _ in 0..8 {
            match cache.enqueue_read(7, request()) {
                EnqueueOutcome::Queued => {}
                _ => panic!("expected queued"),
            }
        }
        assert_eq!(cache.queued_reads(), 1);
        cache.start_readers();

        let mut restarted = 0;
        for _ in 0..8 {
            let request = receiver.recv().unwrap();
            assert!(request.status.is_ok());
            restarted += 1;
        }
        assert_eq!(restarted, 8);
        // One disk read served all eight requests
        assert_eq!(storage.stats().reads - reads_before, 1);
        let bytes = cache.with_page(7, 0, |page| page[0..4].to_vec()).unwrap();
        assert_eq!(&bytes, &7u32.to_le_bytes());
        cache.shutdown();
    }

    #[test]
    fn test_queue_bound_reports_full() {
        let cache = PageCache::new(storage(8), 4, 1, 1);
        let (sender, receiver) = mpsc::channel::<Box<Request>>();
        cache.set_restarter(Box::new(move |request| {
            sender.send(request).unwrap();
        }));
        cache.stop_readers();

        // Distinct synthetic pages fill the queue to its ring bound
        let mut queued = 0usize;
        for page in 1..MAX_QUEUED_READS as u32 {
            match cache.enqueue_read(page, request()) {
                EnqueueOutcome::Queued => queued += 1,
                _ => panic!("expected queued at {}", page),
            }
        }
        assert_eq!(queued, MAX_QUEUED_READS - 1);
        // The next page cannot be queued
        match cache.enqueue_read(MAX_QUEUED_READS as u32 + 7, request()) {
            EnqueueOutcome::Full(_) => {}
            _ => panic!("expected full"),
        }

        // Restart the readers; every queued request eventually fires.
        // Reads of pages beyond the file fail, but they still complete
        // with a status.
        cache.start_readers();
        for _ in 0..queued {
            let _ = receiver.recv().unwrap();
        }
        cache.shutdown();
    }

    #[test]
    fn test_eviction_keeps_single_entry_per_page() {
        let cache = PageCache::new(storage(64), 4, 1, 1);
        for page in 1..40u32 {
            let data = cache.read_page_blocking(page, 0).unwrap();
            assert_eq!(&data[0..4], &page.to_le_bytes());
        }
        // Far more pages than slots were read; the cache still answers
        // correctly for whatever it holds.
        let mut cached = 0;
        for page in 1..40u32 {
            if let Some(bytes) = cache.with_page(page, 0, |p| p[0..4].to_vec()) {
                assert_eq!(&bytes, &page.to_le_bytes());
                cached += 1;
            }
        }
        assert!(cached <= 4);
        cache.shutdown();
    }

    #[test]
    fn test_invalidate_page() {
        let cache = PageCache::new(storage(8), 4, 1, 1);
        cache.read_page_blocking(2, 0).unwrap();
        assert!(cache.with_page(2, 0, |_| ()).is_some());
        cache.invalidate_page(2);
        assert!(cache.with_page(2, 0, |_| ()).is_none());
        assert_eq!(cache.stats().invalidations, 1);
        cache.shutdown();
    }

    #[test]
    fn test_read_error_propagates_status() {
        let cache = PageCache::new(storage(4), 4, 1, 1);
        let (sender, receiver) = mpsc::channel::<Box<Request>>();
        cache.set_restarter(Box::new(move |request| {
            sender.send(request).unwrap();
        }));
        // Page far past the end of the file
        match cache.enqueue_read(10_000, request()) {
            EnqueueOutcome::Queued => {}
            _ => panic!("expected queued"),
        }
        let request = receiver.recv().unwrap();
        assert!(request.status.is_err());
        cache.shutdown();
    }
}
