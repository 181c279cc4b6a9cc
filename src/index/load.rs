// Save, restore, and rebuild.
//
// A clean save leaves four things in the index directory: the volume
// itself, the volume index zone streams, the index state file (chapter
// horizon plus the index page map), and the open chapter save. The open
// chapter save doubles as the cleanliness marker: the chapter writer
// deletes it before its first commit after a load, so finding it missing
// on the next load means the index must be rebuilt from the volume.

use crate::common::{
    RecordData, RecordName, VirtualChapter, RECORD_DATA_BYTES, RECORD_NAME_BYTES,
    VOLUME_RECORD_BYTES,
};
use crate::error::{IndexError, Result};
use crate::volume::Volume;
use crate::volume_index::VolumeIndex;
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const STATE_MAGIC: &[u8; 8] = b"DEDUPIDX";
const OPEN_CHAPTER_MAGIC: &[u8; 8] = b"DEDUPOCH";
const SAVE_VERSION: u32 = 1;

pub(crate) fn volume_path(dir: &Path) -> PathBuf {
    dir.join("volume.dat")
}

pub(crate) fn state_path(dir: &Path) -> PathBuf {
    dir.join("index.state")
}

pub(crate) fn open_chapter_save_path(dir: &Path) -> PathBuf {
    dir.join("open_chapter.save")
}

fn volume_index_dir(dir: &Path) -> PathBuf {
    dir.join("volume_index")
}

fn sub_index_zone_path(dir: &Path, sub_index: &str, zone: usize) -> PathBuf {
    volume_index_dir(dir).join(format!("{}_zone{}.save", sub_index, zone))
}

// ----------------------------------------------------------------------
// Load context: the suspend/resume protocol for long rebuilds
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// The load or rebuild is running
    Opening,
    /// The caller asked the rebuild to yield
    Suspending,
    /// The rebuild has yielded and is waiting
    Suspended,
    /// The caller abandoned the load; the rebuild must abort
    Freeing,
}

pub struct LoadContext {
    state: Mutex<LoadState>,
    cond: Condvar,
}

impl LoadContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoadState::Opening),
            cond: Condvar::new(),
        }
    }

    pub fn suspend(&self) {
        *self.state.lock() = LoadState::Suspending;
        self.cond.notify_all();
    }

    pub fn resume(&self) {
        *self.state.lock() = LoadState::Opening;
        self.cond.notify_all();
    }

    pub fn abort(&self) {
        *self.state.lock() = LoadState::Freeing;
        self.cond.notify_all();
    }

    /// Block until the rebuild has acknowledged a suspend.
    pub fn wait_suspended(&self) {
        let mut state = self.state.lock();
        while *state == LoadState::Suspending {
            self.cond.wait(&mut state);
        }
    }

    // Polled by the rebuild between chapters.
    pub(crate) fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match *state {
                LoadState::Opening => return Ok(()),
                LoadState::Freeing => return Err(IndexError::Busy),
                LoadState::Suspending => {
                    *state = LoadState::Suspended;
                    self.cond.notify_all();
                }
                LoadState::Suspended => {
                    self.cond.wait(&mut state);
                }
            }
        }
    }
}

impl Default for LoadContext {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------
// Index state file
// ----------------------------------------------------------------------

pub(crate) struct SavedIndexState {
    pub nonce: u64,
    pub newest: VirtualChapter,
    pub oldest: VirtualChapter,
    pub map_bytes: Vec<u8>,
}

pub(crate) fn write_index_state(
    dir: &Path,
    nonce: u64,
    newest: VirtualChapter,
    oldest: VirtualChapter,
    map_bytes: &[u8],
) -> Result<()> {
    let mut body = Vec::with_capacity(44 + map_bytes.len());
    body.extend_from_slice(STATE_MAGIC);
    body.extend_from_slice(&SAVE_VERSION.to_le_bytes());
    body.extend_from_slice(&nonce.to_le_bytes());
    body.extend_from_slice(&newest.to_le_bytes());
    body.extend_from_slice(&oldest.to_le_bytes());
    body.extend_from_slice(&(map_bytes.len() as u32).to_le_bytes());
    body.extend_from_slice(map_bytes);
    let checksum = crc32fast::hash(&body);
    let mut writer = BufWriter::new(File::create(state_path(dir))?);
    writer.write_all(&body)?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_index_state(dir: &Path) -> Result<SavedIndexState> {
    let bytes = std::fs::read(state_path(dir))?;
    if bytes.len() < 44 {
        return Err(IndexError::CorruptData("index state truncated".to_string()));
    }
    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let checksum = u32::from_le_bytes(tail.try_into().unwrap());
    if checksum != crc32fast::hash(body) {
        return Err(IndexError::CorruptData("index state checksum".to_string()));
    }
    if &body[0..8] != STATE_MAGIC {
        return Err(IndexError::CorruptData("index state magic".to_string()));
    }
    let version = u32::from_le_bytes(body[8..12].try_into().unwrap());
    if version != SAVE_VERSION {
        return Err(IndexError::UnsupportedVersion(format!(
            "index state version {}",
            version
        )));
    }
    let map_len = u32::from_le_bytes(body[36..40].try_into().unwrap()) as usize;
    if body.len() != 40 + map_len {
        return Err(IndexError::CorruptData("index state length".to_string()));
    }
    Ok(SavedIndexState {
        nonce: u64::from_le_bytes(body[12..20].try_into().unwrap()),
        newest: u64::from_le_bytes(body[20..28].try_into().unwrap()),
        oldest: u64::from_le_bytes(body[28..36].try_into().unwrap()),
        map_bytes: body[40..].to_vec(),
    })
}

// ----------------------------------------------------------------------
// Open chapter save
// ----------------------------------------------------------------------

pub(crate) fn write_open_chapter_save(
    dir: &Path,
    newest: VirtualChapter,
    records: &[(RecordName, RecordData)],
) -> Result<()> {
    let mut body = Vec::with_capacity(24 + records.len() * VOLUME_RECORD_BYTES);
    body.extend_from_slice(OPEN_CHAPTER_MAGIC);
    body.extend_from_slice(&SAVE_VERSION.to_le_bytes());
    body.extend_from_slice(&newest.to_le_bytes());
    body.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for (name, data) in records {
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(data.as_bytes());
    }
    let checksum = crc32fast::hash(&body);
    let mut writer = BufWriter::new(File::create(open_chapter_save_path(dir))?);
    writer.write_all(&body)?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.flush()?;
    Ok(())
}

/// `None` means the save is absent: the previous run did not shut down
/// cleanly and the caller must rebuild.
pub(crate) fn read_open_chapter_save(
    dir: &Path,
) -> Result<Option<(VirtualChapter, Vec<(RecordName, RecordData)>)>> {
    let bytes = match std::fs::read(open_chapter_save_path(dir)) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    if bytes.len() < 28 {
        return Err(IndexError::CorruptData("open chapter save truncated".to_string()));
    }
    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let checksum = u32::from_le_bytes(tail.try_into().unwrap());
    if checksum != crc32fast::hash(body) {
        return Err(IndexError::CorruptData("open chapter save checksum".to_string()));
    }
    if &body[0..8] != OPEN_CHAPTER_MAGIC {
        return Err(IndexError::CorruptData("open chapter save magic".to_string()));
    }
    let newest = u64::from_le_bytes(body[12..20].try_into().unwrap());
    let count = u32::from_le_bytes(body[20..24].try_into().unwrap()) as usize;
    if body.len() != 24 + count * VOLUME_RECORD_BYTES {
        return Err(IndexError::CorruptData("open chapter save length".to_string()));
    }
    let mut records = Vec::with_capacity(count);
    for index in 0..count {
        let at = 24 + index * VOLUME_RECORD_BYTES;
        let mut name = [0u8; RECORD_NAME_BYTES];
        name.copy_from_slice(&body[at..at + RECORD_NAME_BYTES]);
        let mut data = [0u8; RECORD_DATA_BYTES];
        data.copy_from_slice(&body[at + RECORD_NAME_BYTES..at + VOLUME_RECORD_BYTES]);
        records.push((RecordName::from_bytes(name), RecordData::from_bytes(data)));
    }
    Ok(Some((newest, records)))
}

pub(crate) fn discard_open_chapter_save(dir: &Path) -> Result<()> {
    match std::fs::remove_file(open_chapter_save_path(dir)) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

// ----------------------------------------------------------------------
// Volume index save streams
// ----------------------------------------------------------------------

pub(crate) fn save_volume_index(dir: &Path, volume_index: &VolumeIndex) -> Result<()> {
    std::fs::create_dir_all(volume_index_dir(dir))?;
    let dense = volume_index.dense_index().delta_index();
    for zone in 0..dense.zone_count() {
        let mut writer =
            BufWriter::new(File::create(sub_index_zone_path(dir, "dense", zone))?);
        dense.save_zone(zone, &mut writer)?;
        writer.flush()?;
    }
    if let Some(hooks) = volume_index.hook_index() {
        let hooks = hooks.delta_index();
        for zone in 0..hooks.zone_count() {
            let mut writer =
                BufWriter::new(File::create(sub_index_zone_path(dir, "hooks", zone))?);
            hooks.save_zone(zone, &mut writer)?;
            writer.flush()?;
        }
    }
    Ok(())
}

fn open_sub_index_sources(dir: &Path, sub_index: &str) -> Result<Vec<BufReader<File>>> {
    let mut sources = Vec::new();
    loop {
        let path = sub_index_zone_path(dir, sub_index, sources.len());
        match File::open(&path) {
            Ok(file) => sources.push(BufReader::new(file)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => break,
            Err(error) => return Err(error.into()),
        }
    }
    if sources.is_empty() {
        return Err(IndexError::NotSavedCleanly);
    }
    Ok(sources)
}

pub(crate) fn restore_volume_index(dir: &Path, volume_index: &mut VolumeIndex) -> Result<()> {
    let mut dense = open_sub_index_sources(dir, "dense")?;
    if volume_index.hook_index().is_some() {
        let mut hooks = open_sub_index_sources(dir, "hooks")?;
        volume_index.restore_sub_indexes(&mut dense, Some(&mut hooks))
    } else {
        volume_index.restore_sub_indexes::<BufReader<File>>(&mut dense, None)
    }
}

// ----------------------------------------------------------------------
// Rebuild
// ----------------------------------------------------------------------

/// Walk the volume chapter by chapter, reconstructing the volume index
/// and the index page map. Best effort: unreadable chapters are skipped,
/// overflow and duplicate names are ignored. Returns the recovered
/// (newest, oldest) chapter horizon.
pub(crate) fn rebuild_from_volume(
    volume: &Volume,
    volume_index: &VolumeIndex,
    zone_count: usize,
    load_context: Option<&Arc<LoadContext>>,
    chapters_replayed: &AtomicU64,
) -> Result<(VirtualChapter, VirtualChapter)> {
    let geometry = *volume.geometry();
    let mut found = Vec::new();
    for physical in 0..geometry.chapters_per_volume as u32 {
        if let Some(chapter) = volume.probe_chapter(physical)? {
            if geometry.physical_chapter(chapter) == physical {
                found.push(chapter);
            } else {
                warn!(physical, chapter, "chapter slot names a foreign chapter");
            }
        }
    }
    if found.is_empty() {
        info!("empty volume, rebuilding to a fresh index");
        return Ok((0, 0));
    }
    found.sort_unstable();
    let newest = found[found.len() - 1] + 1;
    let oldest = geometry.oldest_for(newest);
    info!(newest, oldest, chapters = found.len(), "rebuilding volume index");

    for &chapter in &found {
        if chapter < oldest {
            continue;
        }
        if let Some(context) = load_context {
            context.checkpoint()?;
        }
        for zone in 0..zone_count {
            volume_index.set_zone_open_chapter(zone, chapter)?;
        }
        let sparse = geometry.is_chapter_sparse(oldest, newest, chapter);
        if let Err(error) = replay_chapter(volume, volume_index, chapter, sparse) {
            warn!(chapter, %error, "skipping unreadable chapter during rebuild");
            continue;
        }
        if let Err(error) = volume.remap_chapter(chapter) {
            warn!(chapter, %error, "chapter index pages unreadable during rebuild");
        }
        chapters_replayed.fetch_add(1, Ordering::Relaxed);
    }
    for zone in 0..zone_count {
        volume_index.set_zone_open_chapter(zone, newest)?;
    }
    Ok((newest, oldest))
}

fn replay_chapter(
    volume: &Volume,
    volume_index: &VolumeIndex,
    chapter: VirtualChapter,
    sparse: bool,
) -> Result<()> {
    let geometry = *volume.geometry();
    let physical = geometry.physical_chapter(chapter);
    for record_page in 0..geometry.record_pages_per_chapter as u32 {
        let page = volume.read_page_direct(geometry.record_page_number(physical, record_page))?;
        for slot in 0..geometry.records_per_page {
            let at = slot * VOLUME_RECORD_BYTES;
            let name_bytes: [u8; RECORD_NAME_BYTES] =
                page[at..at + RECORD_NAME_BYTES].try_into().unwrap();
            if name_bytes.iter().all(|&byte| byte == 0) {
                continue;
            }
            let name = RecordName::from_bytes(name_bytes);
            if sparse && !volume_index.is_sample(&name) {
                continue;
            }
            let record = volume_index.get_record(&name)?;
            let replayed = if record.found {
                volume_index.set_record_chapter(&record, chapter)
            } else {
                volume_index.put_record(&record, chapter)
            };
            match replayed {
                Ok(()) | Err(IndexError::DuplicateName) | Err(IndexError::Overflow) => {}
                Err(error) => return Err(error),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_state_round_trip() {
        let dir = tempdir().unwrap();
        let map = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        write_index_state(dir.path(), 0xfeed, 12, 3, &map).unwrap();
        let state = read_index_state(dir.path()).unwrap();
        assert_eq!(state.nonce, 0xfeed);
        assert_eq!(state.newest, 12);
        assert_eq!(state.oldest, 3);
        assert_eq!(state.map_bytes, map);
    }

    #[test]
    fn test_index_state_rejects_corruption() {
        let dir = tempdir().unwrap();
        write_index_state(dir.path(), 1, 2, 0, &[9u8; 4]).unwrap();
        let path = state_path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[15] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
        assert!(read_index_state(dir.path()).is_err());
    }

    #[test]
    fn test_open_chapter_save_round_trip() {
        let dir = tempdir().unwrap();
        let records = vec![
            (RecordName([1u8; 32]), RecordData([2u8; 16])),
            (RecordName([3u8; 32]), RecordData([4u8; 16])),
        ];
        write_open_chapter_save(dir.path(), 7, &records).unwrap();
        let (newest, loaded) = read_open_chapter_save(dir.path()).unwrap().unwrap();
        assert_eq!(newest, 7);
        assert_eq!(loaded, records);

        // Discarding the save is the recovery-required marker
        discard_open_chapter_save(dir.path()).unwrap();
        assert!(read_open_chapter_save(dir.path()).unwrap().is_none());
        // Discarding twice is fine
        discard_open_chapter_save(dir.path()).unwrap();
    }

    #[test]
    fn test_load_context_suspend_resume() {
        let context = Arc::new(LoadContext::new());
        let worker = Arc::clone(&context);
        let thread = std::thread::spawn(move || loop {
            if let Err(error) = worker.checkpoint() {
                return error;
            }
            std::thread::yield_now();
        });
        context.suspend();
        context.wait_suspended();
        context.resume();
        context.abort();
        assert_eq!(thread.join().unwrap(), IndexError::Busy);
    }
}
