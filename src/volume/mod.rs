// The volume: every closed chapter on disk, fronted by the page cache
// and, for sparse geometries, the sparse chapter-index cache.
//
// Physical layout: page 0 is the volume header; chapter slot `c` occupies
// pages [1 + c * pages_per_chapter ..), index pages first, then record
// pages. Virtual chapters map onto slots modulo chapters_per_volume.

pub mod page_cache;
pub mod sparse_cache;
pub mod storage;

pub use page_cache::{EnqueueOutcome, PageCache, PageCacheStats, MAX_QUEUED_READS};
pub use sparse_cache::{SparseCache, SparseCacheStats};
pub use storage::{IndexStorage, StorageStats};

use crate::chapter::{search_record_page, ClosedChapter, IndexPageMap};
use crate::common::{RecordData, RecordName, VirtualChapter};
use crate::config::IndexConfig;
use crate::delta::{search_page, validate_page};
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::request::Request;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const VOLUME_MAGIC: &[u8; 8] = b"DEDUPVOL";
const VOLUME_VERSION: u32 = 1;

/// Outcome of probing the on-disk volume for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSearch {
    Found(RecordData),
    NotFound,
    /// The chapter is no longer readable (overwritten or torn)
    Unavailable,
    /// The request was parked on a page read and will be restarted
    Parked,
}

enum IndexPageProbe {
    Unreadable,
    WrongChapter,
    Miss,
    RecordPage(u32),
}

pub struct Volume {
    geometry: Geometry,
    nonce: u64,
    storage: Arc<IndexStorage>,
    page_cache: Arc<PageCache>,
    sparse_cache: Option<SparseCache>,
    index_page_map: RwLock<IndexPageMap>,
}

impl Volume {
    pub fn create(config: &IndexConfig, path: &Path) -> Result<Self> {
        let geometry = config.geometry;
        let nonce: u64 = rand::random();
        let storage = Arc::new(IndexStorage::create(
            path,
            geometry.bytes_per_page,
            geometry.total_pages(),
        )?);
        let header = encode_volume_header(&geometry, nonce);
        storage.write_page(0, &header)?;
        storage.sync()?;
        Ok(Self::assemble(config, storage, nonce))
    }

    pub fn open(config: &IndexConfig, path: &Path) -> Result<Self> {
        let geometry = config.geometry;
        let storage = Arc::new(IndexStorage::open(path, geometry.bytes_per_page)?);
        let header = storage.read_page(0)?;
        let nonce = decode_volume_header(&geometry, &header)?;
        Ok(Self::assemble(config, storage, nonce))
    }

    fn assemble(config: &IndexConfig, storage: Arc<IndexStorage>, nonce: u64) -> Self {
        let geometry = config.geometry;
        let page_cache = PageCache::new(
            Arc::clone(&storage),
            config.cache_pages,
            config.zone_count,
            config.read_threads,
        );
        let sparse_cache = geometry.has_sparse_chapters().then(|| {
            SparseCache::new(geometry, config.sparse_cache_chapters, config.zone_count)
        });
        Self {
            geometry,
            nonce,
            storage,
            page_cache,
            sparse_cache,
            index_page_map: RwLock::new(IndexPageMap::new(&geometry)),
        }
    }

    #[inline]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[inline]
    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    #[inline]
    pub fn sparse_cache(&self) -> Option<&SparseCache> {
        self.sparse_cache.as_ref()
    }

    pub fn storage_stats(&self) -> StorageStats {
        self.storage.stats()
    }

    // ------------------------------------------------------------------
    // Chapter write path
    // ------------------------------------------------------------------

    /// Write a closed chapter into its slot, displacing whatever chapter
    /// the slot held. Cached copies of the overwritten pages are dropped.
    pub fn write_chapter(&self, chapter: &ClosedChapter) -> Result<()> {
        let physical = self.geometry.physical_chapter(chapter.virtual_chapter);
        for (number, page) in chapter.index_pages.iter().enumerate() {
            self.storage
                .write_page(self.geometry.index_page_number(physical, number as u32), page)?;
        }
        for (number, page) in chapter.record_pages.iter().enumerate() {
            self.storage
                .write_page(self.geometry.record_page_number(physical, number as u32), page)?;
        }
        self.storage.sync()?;
        self.page_cache.invalidate_chapter(
            self.geometry.chapter_first_page(physical),
            self.geometry.pages_per_chapter as u32,
        );
        self.index_page_map
            .write()
            .update(physical, &chapter.index_page_bounds)?;
        Ok(())
    }

    /// Expire a chapter: evict its pages and its sparse cache entry.
    pub fn forget_chapter(&self, virtual_chapter: VirtualChapter) {
        let physical = self.geometry.physical_chapter(virtual_chapter);
        self.page_cache.invalidate_chapter(
            self.geometry.chapter_first_page(physical),
            self.geometry.pages_per_chapter as u32,
        );
        if let Some(sparse) = &self.sparse_cache {
            sparse.forget_chapter(virtual_chapter);
        }
    }

    // ------------------------------------------------------------------
    // Search paths
    // ------------------------------------------------------------------

    // Probe one page through the cache. `request` is taken when the probe
    // parks it on a pending read; with no request to park (or a full read
    // queue) the probe degrades to a blocking read on this thread.
    fn probe_page<R>(
        &self,
        physical_page: u32,
        zone_number: usize,
        request: &mut Option<Box<Request>>,
        f: impl Fn(&[u8]) -> R,
    ) -> Result<Option<R>> {
        loop {
            if let Some(result) = self.page_cache.with_page(physical_page, zone_number, &f) {
                return Ok(Some(result));
            }
            let Some(owned) = request.take() else {
                let data = self.page_cache.read_page_blocking(physical_page, zone_number)?;
                return Ok(Some(f(&data)));
            };
            match self.page_cache.enqueue_read(physical_page, owned) {
                EnqueueOutcome::Queued => return Ok(None),
                EnqueueOutcome::AlreadyCached(back) => {
                    *request = Some(back);
                }
                EnqueueOutcome::Full(back) => {
                    *request = Some(back);
                    let data = self.page_cache.read_page_blocking(physical_page, zone_number)?;
                    return Ok(Some(f(&data)));
                }
            }
        }
    }

    /// Search a dense on-disk chapter: one index page probe, then one
    /// record page probe. Either probe may park the request.
    pub fn search_dense_chapter(
        &self,
        name: &RecordName,
        virtual_chapter: VirtualChapter,
        zone_number: usize,
        request: &mut Option<Box<Request>>,
    ) -> Result<VolumeSearch> {
        let physical = self.geometry.physical_chapter(virtual_chapter);
        let list = self.geometry.chapter_delta_list(name);
        let key = self.geometry.chapter_key(name);
        let coding = self.geometry.chapter_coding();
        let index_page = self.index_page_map.read().find_index_page(physical, list);
        let page_number = self.geometry.index_page_number(physical, index_page);

        let probe = self.probe_page(page_number, zone_number, request, |data| {
            match validate_page(data, self.nonce) {
                Err(_) => IndexPageProbe::Unreadable,
                Ok(header) if header.virtual_chapter != virtual_chapter => {
                    IndexPageProbe::WrongChapter
                }
                Ok(header) => match search_page(data, &header, &coding, list, key, name) {
                    Err(_) => IndexPageProbe::Unreadable,
                    Ok(None) => IndexPageProbe::Miss,
                    Ok(Some(value)) => IndexPageProbe::RecordPage(value as u32),
                },
            }
        })?;
        let record_page = match probe {
            None => return Ok(VolumeSearch::Parked),
            Some(IndexPageProbe::Unreadable) => {
                warn!(virtual_chapter, page_number, "chapter index page unreadable");
                return Ok(VolumeSearch::Unavailable);
            }
            Some(IndexPageProbe::WrongChapter) => return Ok(VolumeSearch::Unavailable),
            Some(IndexPageProbe::Miss) => return Ok(VolumeSearch::NotFound),
            Some(IndexPageProbe::RecordPage(page)) => page,
        };
        if record_page as usize >= self.geometry.record_pages_per_chapter {
            warn!(virtual_chapter, record_page, "chapter index names a bad record page");
            return Ok(VolumeSearch::Unavailable);
        }
        self.search_record_page(name, physical, record_page, zone_number, request)
    }

    /// Search a sparse chapter through the sparse cache, then its record
    /// page through the page cache.
    pub fn search_sparse_chapter(
        &self,
        name: &RecordName,
        virtual_chapter: VirtualChapter,
        zone_number: usize,
        request: &mut Option<Box<Request>>,
    ) -> Result<VolumeSearch> {
        let Some(sparse) = &self.sparse_cache else {
            return Ok(VolumeSearch::Unavailable);
        };
        let Some(record_page) = sparse.search(virtual_chapter, name)? else {
            if !sparse.contains(virtual_chapter) {
                return Ok(VolumeSearch::Unavailable);
            }
            return Ok(VolumeSearch::NotFound);
        };
        if record_page as usize >= self.geometry.record_pages_per_chapter {
            return Ok(VolumeSearch::Unavailable);
        }
        let physical = self.geometry.physical_chapter(virtual_chapter);
        self.search_record_page(name, physical, record_page, zone_number, request)
    }

    fn search_record_page(
        &self,
        name: &RecordName,
        physical_chapter: u32,
        record_page: u32,
        zone_number: usize,
        request: &mut Option<Box<Request>>,
    ) -> Result<VolumeSearch> {
        let page_number = self.geometry.record_page_number(physical_chapter, record_page);
        let records_per_page = self.geometry.records_per_page;
        let probe = self.probe_page(page_number, zone_number, request, |data| {
            search_record_page(data, records_per_page, name)
        })?;
        Ok(match probe {
            None => VolumeSearch::Parked,
            Some(Some(data)) => VolumeSearch::Found(data),
            Some(None) => VolumeSearch::NotFound,
        })
    }

    // ------------------------------------------------------------------
    // Sparse cache coordination
    // ------------------------------------------------------------------

    pub fn sparse_cache_contains(&self, virtual_chapter: VirtualChapter) -> bool {
        self.sparse_cache
            .as_ref()
            .is_some_and(|sparse| sparse.contains(virtual_chapter))
    }

    /// A zone's arrival at a sparse cache barrier.
    pub fn update_sparse_cache(
        &self,
        virtual_chapter: VirtualChapter,
        oldest: VirtualChapter,
    ) -> Result<()> {
        let Some(sparse) = &self.sparse_cache else {
            return Ok(());
        };
        sparse.update_at_barrier(virtual_chapter, oldest, self.nonce, || {
            self.read_chapter_index_pages(virtual_chapter)
        })
    }

    /// Raw index pages of a chapter, straight from storage.
    pub fn read_chapter_index_pages(
        &self,
        virtual_chapter: VirtualChapter,
    ) -> Result<Vec<Vec<u8>>> {
        let physical = self.geometry.physical_chapter(virtual_chapter);
        (0..self.geometry.index_pages_per_chapter as u32)
            .map(|page| self.storage.read_page(self.geometry.index_page_number(physical, page)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Rebuild support
    // ------------------------------------------------------------------

    /// The virtual chapter recorded in a chapter slot, if the slot holds
    /// a valid chapter.
    pub fn probe_chapter(&self, physical_chapter: u32) -> Result<Option<VirtualChapter>> {
        let page = self
            .storage
            .read_page(self.geometry.index_page_number(physical_chapter, 0))?;
        match validate_page(&page, self.nonce) {
            Ok(header) => Ok(Some(header.virtual_chapter)),
            Err(_) => Ok(None),
        }
    }

    /// Direct (uncached) page read for rebuild and for tests.
    pub fn read_page_direct(&self, physical_page: u32) -> Result<Vec<u8>> {
        self.storage.read_page(physical_page)
    }

    /// Rebuild the index page map entry for a chapter from its on-disk
    /// index pages.
    pub fn remap_chapter(&self, virtual_chapter: VirtualChapter) -> Result<()> {
        let physical = self.geometry.physical_chapter(virtual_chapter);
        let mut bounds = Vec::with_capacity(self.geometry.index_pages_per_chapter);
        let mut last = 0u32;
        for page_number in 0..self.geometry.index_pages_per_chapter as u32 {
            let page = self
                .storage
                .read_page(self.geometry.index_page_number(physical, page_number))?;
            let header = validate_page(&page, self.nonce)?;
            if header.list_count > 0 {
                last = header.first_list as u32 + header.list_count as u32 - 1;
            }
            bounds.push(last);
        }
        self.index_page_map.write().update(physical, &bounds)
    }

    // ------------------------------------------------------------------
    // Persistence plumbing
    // ------------------------------------------------------------------

    pub fn index_page_map_bytes(&self) -> Vec<u8> {
        self.index_page_map.read().to_bytes()
    }

    pub fn load_index_page_map(&self, bytes: &[u8]) -> Result<()> {
        self.index_page_map.write().load_bytes(bytes)
    }

    pub fn sync(&self) -> Result<()> {
        self.storage.sync()
    }

    pub fn replace_storage(&self, path: &Path) -> Result<()> {
        self.storage.replace_path(path)
    }

    pub fn shutdown(&self) {
        self.page_cache.shutdown();
    }
}

fn encode_volume_header(geometry: &Geometry, nonce: u64) -> Vec<u8> {
    let mut header = vec![0u8; geometry.bytes_per_page];
    header[0..8].copy_from_slice(VOLUME_MAGIC);
    header[8..12].copy_from_slice(&VOLUME_VERSION.to_le_bytes());
    header[12..20].copy_from_slice(&nonce.to_le_bytes());
    let fields: [u64; 6] = [
        geometry.bytes_per_page as u64,
        geometry.records_per_page as u64,
        geometry.record_pages_per_chapter as u64,
        geometry.chapters_per_volume,
        geometry.sparse_chapters_per_volume,
        geometry.sparse_sample_rate as u64,
    ];
    for (index, field) in fields.iter().enumerate() {
        header[20 + index * 8..28 + index * 8].copy_from_slice(&field.to_le_bytes());
    }
    let checksum = crc32fast::hash(&header[0..68]);
    header[68..72].copy_from_slice(&checksum.to_le_bytes());
    header
}

fn decode_volume_header(geometry: &Geometry, header: &[u8]) -> Result<u64> {
    if &header[0..8] != VOLUME_MAGIC {
        return Err(IndexError::CorruptData("bad volume magic".to_string()));
    }
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if version != VOLUME_VERSION {
        return Err(IndexError::UnsupportedVersion(format!(
            "volume version {}",
            version
        )));
    }
    let checksum = u32::from_le_bytes(header[68..72].try_into().unwrap());
    if checksum != crc32fast::hash(&header[0..68]) {
        return Err(IndexError::CorruptData("volume header checksum".to_string()));
    }
    let fields: Vec<u64> = (0..6)
        .map(|index| u64::from_le_bytes(header[20 + index * 8..28 + index * 8].try_into().unwrap()))
        .collect();
    let expected = [
        geometry.bytes_per_page as u64,
        geometry.records_per_page as u64,
        geometry.record_pages_per_chapter as u64,
        geometry.chapters_per_volume,
        geometry.sparse_chapters_per_volume,
        geometry.sparse_sample_rate as u64,
    ];
    if fields != expected {
        return Err(IndexError::InvalidArgument(
            "volume geometry does not match the configuration".to_string(),
        ));
    }
    Ok(u64::from_le_bytes(header[12..20].try_into().unwrap()))
}
