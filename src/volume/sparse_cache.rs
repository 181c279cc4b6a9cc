// Sparse cache: decoded chapter indexes for chapters beyond the dense
// horizon.
//
// Every zone must agree on the cache's contents, so membership changes
// ride a barrier: a chapter is only added while every zone thread is
// parked inside `update_at_barrier` for the same generation, and the last
// zone to arrive performs the mutation alone. Searches take the read lock
// only, which is uncontended outside a barrier.

use crate::common::{RecordName, VirtualChapter};
use crate::delta::{search_page, validate_page, DeltaPageHeader};
use crate::error::Result;
use crate::geometry::Geometry;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

struct CachedChapterIndex {
    virtual_chapter: VirtualChapter,
    pages: Vec<Vec<u8>>,
    headers: Vec<DeltaPageHeader>,
    last_used: AtomicU64,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SparseCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub chapters_cached: usize,
}

pub struct SparseCache {
    geometry: Geometry,
    capacity: usize,
    zone_count: usize,
    entries: RwLock<Vec<CachedChapterIndex>>,
    barrier: Mutex<BarrierState>,
    barrier_done: Condvar,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SparseCache {
    pub fn new(geometry: Geometry, capacity: usize, zone_count: usize) -> Self {
        Self {
            geometry,
            capacity,
            zone_count,
            entries: RwLock::new(Vec::with_capacity(capacity)),
            barrier: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            barrier_done: Condvar::new(),
            clock: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn contains(&self, virtual_chapter: VirtualChapter) -> bool {
        self.entries
            .read()
            .iter()
            .any(|entry| entry.virtual_chapter == virtual_chapter)
    }

    /// Search the cached chapter index for the record page holding
    /// `name`. `None` if the chapter is not cached or has no entry.
    pub fn search(
        &self,
        virtual_chapter: VirtualChapter,
        name: &RecordName,
    ) -> Result<Option<u32>> {
        let entries = self.entries.read();
        let Some(entry) = entries
            .iter()
            .find(|entry| entry.virtual_chapter == virtual_chapter)
        else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        entry
            .last_used
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);

        let list = self.geometry.chapter_delta_list(name);
        let key = self.geometry.chapter_key(name);
        let coding = self.geometry.chapter_coding();
        for (page, header) in entry.pages.iter().zip(&entry.headers) {
            let first = header.first_list as u32;
            if list < first || list >= first + header.list_count as u32 {
                continue;
            }
            return Ok(search_page(page, header, &coding, list, key, name)?
                .map(|value| value as u32));
        }
        Ok(None)
    }

    /// Barrier-coordinated membership update. Every zone calls this with
    /// the same chapter, in the same queue order; the last zone to arrive
    /// mutates the cache while the others are parked, so there is never a
    /// concurrent reader. The loader reads and returns the chapter's raw
    /// index pages.
    pub fn update_at_barrier(
        &self,
        virtual_chapter: VirtualChapter,
        oldest: VirtualChapter,
        nonce: u64,
        loader: impl FnOnce() -> Result<Vec<Vec<u8>>>,
    ) -> Result<()> {
        if self.zone_count == 1 {
            return self.admit_chapter(virtual_chapter, oldest, nonce, loader);
        }
        let mut barrier = self.barrier.lock();
        let generation = barrier.generation;
        barrier.arrived += 1;
        if barrier.arrived < self.zone_count {
            while barrier.generation == generation {
                self.barrier_done.wait(&mut barrier);
            }
            return Ok(());
        }
        // Last zone in: every peer is parked on the condvar, mutate alone
        let result = self.admit_chapter(virtual_chapter, oldest, nonce, loader);
        barrier.arrived = 0;
        barrier.generation += 1;
        drop(barrier);
        self.barrier_done.notify_all();
        result
    }

    fn admit_chapter(
        &self,
        virtual_chapter: VirtualChapter,
        oldest: VirtualChapter,
        nonce: u64,
        loader: impl FnOnce() -> Result<Vec<Vec<u8>>>,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        entries.retain(|entry| entry.virtual_chapter >= oldest);
        if virtual_chapter < oldest
            || entries
                .iter()
                .any(|entry| entry.virtual_chapter == virtual_chapter)
        {
            return Ok(());
        }
        let pages = match loader() {
            Ok(pages) => pages,
            Err(error) => {
                warn!(virtual_chapter, %error, "sparse chapter index unreadable");
                return Ok(());
            }
        };
        let mut headers = Vec::with_capacity(pages.len());
        let mut valid = true;
        for page in &pages {
            match validate_page(page, nonce) {
                Ok(header) if header.virtual_chapter == virtual_chapter => headers.push(header),
                Ok(_) | Err(_) => {
                    valid = false;
                    break;
                }
            }
        }
        if !valid {
            warn!(virtual_chapter, "sparse chapter index failed validation");
            return Ok(());
        }
        if entries.len() >= self.capacity {
            // Approximate LRU victim
            if let Some(victim) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(index, _)| index)
            {
                entries.swap_remove(victim);
            }
        }
        entries.push(CachedChapterIndex {
            virtual_chapter,
            pages,
            headers,
            last_used: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed)),
        });
        Ok(())
    }

    /// Drop an expired chapter.
    pub fn forget_chapter(&self, virtual_chapter: VirtualChapter) {
        self.entries
            .write()
            .retain(|entry| entry.virtual_chapter != virtual_chapter);
    }

    pub fn stats(&self) -> SparseCacheStats {
        SparseCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            chapters_cached: self.entries.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter::{close_chapter, ChapterIndex};
    use crate::common::RecordData;

    const NONCE: u64 = 0x7d31_9097_55d2_0f5b;

    fn geometry() -> Geometry {
        Geometry::new(4096, 16, 4, 16, 12, 4).unwrap()
    }

    fn name(seed: u32) -> RecordName {
        let mut bytes = [0u8; 32];
        let mut state = (seed as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        for chunk in bytes.chunks_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            chunk.copy_from_slice(&state.to_le_bytes());
        }
        RecordName(bytes)
    }

    fn chapter_pages(virtual_chapter: VirtualChapter, seeds: std::ops::Range<u32>) -> Vec<Vec<u8>> {
        let geometry = geometry();
        let mut builder = ChapterIndex::new(geometry).unwrap();
        let records: Vec<(RecordName, RecordData)> =
            seeds.map(|i| (name(i), RecordData([i as u8; 16]))).collect();
        close_chapter(&geometry, &mut builder, NONCE, virtual_chapter, records)
            .unwrap()
            .index_pages
    }

    #[test]
    fn test_single_zone_admit_and_search() {
        let cache = SparseCache::new(geometry(), 2, 1);
        cache
            .update_at_barrier(3, 0, NONCE, || Ok(chapter_pages(3, 0..30)))
            .unwrap();
        assert!(cache.contains(3));
        let page = cache.search(3, &name(7)).unwrap();
        assert!(page.is_some());
        assert_eq!(cache.search(3, &name(999)).unwrap(), None);
        assert_eq!(cache.search(4, &name(7)).unwrap(), None);
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let cache = SparseCache::new(geometry(), 2, 1);
        for chapter in 0..3u64 {
            cache
                .update_at_barrier(chapter, 0, NONCE, || {
                    Ok(chapter_pages(chapter, 0..10))
                })
                .unwrap();
            // Touch the newest so the oldest is the LRU victim
            let _ = cache.search(chapter, &name(1));
        }
        assert_eq!(cache.stats().chapters_cached, 2);
        assert!(!cache.contains(0));
        assert!(cache.contains(2));
    }

    #[test]
    fn test_expired_chapters_dropped() {
        let cache = SparseCache::new(geometry(), 4, 1);
        for chapter in 0..3u64 {
            cache
                .update_at_barrier(chapter, 0, NONCE, || {
                    Ok(chapter_pages(chapter, 0..10))
                })
                .unwrap();
        }
        // Updating with a newer oldest expires chapters 0 and 1
        cache
            .update_at_barrier(5, 2, NONCE, || Ok(chapter_pages(5, 0..10)))
            .unwrap();
        assert!(!cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(5));
        cache.forget_chapter(2);
        assert!(!cache.contains(2));
    }

    #[test]
    fn test_multi_zone_barrier() {
        use std::sync::Arc;
        let cache = Arc::new(SparseCache::new(geometry(), 2, 4));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            threads.push(std::thread::spawn(move || {
                cache
                    .update_at_barrier(6, 0, NONCE, || Ok(chapter_pages(6, 0..20)))
                    .unwrap();
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(cache.contains(6));
        assert_eq!(cache.stats().chapters_cached, 1);
    }

    #[test]
    fn test_unreadable_chapter_is_skipped() {
        let cache = SparseCache::new(geometry(), 2, 1);
        cache
            .update_at_barrier(9, 0, NONCE, || {
                Err(crate::error::IndexError::CorruptData("torn".to_string()))
            })
            .unwrap();
        assert!(!cache.contains(9));
    }
}
