// The index core: zones, the chapter writer, the request pipeline, and
// the save/load/rebuild lifecycle.
//
// Ownership is strictly one-way: `DedupIndex` owns the shared state,
// which owns the volume, the volume index, the writer state, and the
// per-zone state. Worker threads hold `Arc` clones of the shared state;
// nothing points back up.

pub mod load;
pub mod writer;
pub(crate) mod zone;

pub use crate::volume_index::VolumeIndexStats as IndexStats;
pub use load::{LoadContext, LoadState};

use crate::chapter::ChapterIndex;
use crate::common::{RecordData, RecordName, VirtualChapter};
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use crate::request::{EnqueueStage, Request, RequestCallback, ZoneMessage};
use crate::volume::Volume;
use crate::volume_index::VolumeIndex;
use crossbeam::channel::{unbounded, Receiver, Sender};
use load::{
    discard_open_chapter_save, read_index_state, read_open_chapter_save, rebuild_from_volume,
    restore_volume_index, save_volume_index, volume_path, write_index_state,
    write_open_chapter_save,
};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};
use writer::{commit_chapter, ChapterWriter, WriterWork};
use zone::{zone_loop, ZoneQueueItem, ZoneState};

/// How to bring up an index over a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenType {
    /// Initialize a fresh volume, discarding anything present
    Create,
    /// Load a saved index, rebuilding from the volume when the save is
    /// missing or unusable
    Load,
    /// Load a saved index, failing instead of rebuilding
    NoRebuild,
}

/// Counters that exist for observation, not behavior.
#[derive(Debug, Default)]
pub struct IndexObservability {
    pub chapters_written: AtomicU64,
    pub chapters_replayed: AtomicU64,
}

pub(crate) struct IdleTracker {
    active: Mutex<usize>,
    cond: Condvar,
}

impl IdleTracker {
    fn new() -> Self {
        Self {
            active: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn submit(&self) {
        *self.active.lock() += 1;
    }

    pub(crate) fn complete(&self) {
        let mut active = self.active.lock();
        *active -= 1;
        if *active == 0 {
            self.cond.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.cond.wait(&mut active);
        }
    }
}

pub(crate) struct IndexShared {
    pub(crate) geometry: Geometry,
    pub(crate) volume: Volume,
    pub(crate) volume_index: VolumeIndex,
    pub(crate) writer: ChapterWriter,
    pub(crate) zones: Vec<Mutex<ZoneState>>,
    pub(crate) zone_senders: Vec<Sender<ZoneQueueItem>>,
    pub(crate) triage_sender: Option<Sender<ZoneQueueItem>>,
    pub(crate) callback: RequestCallback,
    pub(crate) newest_chapter: AtomicU64,
    pub(crate) oldest_chapter: AtomicU64,
    pub(crate) idle: Arc<IdleTracker>,
    pub(crate) observability: IndexObservability,
    pub(crate) close_rounds: Mutex<HashMap<VirtualChapter, usize>>,
    pub(crate) stopped: AtomicBool,
    pub(crate) directory: PathBuf,
    pub(crate) save_discarded: AtomicBool,
}

impl IndexShared {
    pub(crate) fn complete_request(&self, request: Box<Request>) {
        (self.callback)(*request);
        self.idle.complete();
    }

    pub(crate) fn send_zone_message(&self, zone_number: usize, message: ZoneMessage) {
        self.idle.submit();
        let request = Box::new(Request::control(zone_number, message));
        if self.zone_senders[zone_number]
            .send(ZoneQueueItem::Request(request))
            .is_err()
        {
            self.idle.complete();
        }
    }
}

pub struct DedupIndex {
    shared: Arc<IndexShared>,
    zone_threads: Vec<JoinHandle<()>>,
    triage_thread: Option<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for DedupIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupIndex").field("closed", &self.closed).finish()
    }
}

impl DedupIndex {
    /// Bring up an index over `directory`, spawning its worker threads.
    /// Every request completes exactly once through `callback`.
    pub fn new(
        config: IndexConfig,
        directory: &Path,
        open_type: OpenType,
        load_context: Option<Arc<LoadContext>>,
        callback: RequestCallback,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(directory)?;
        let geometry = config.geometry;
        let observability = IndexObservability::default();

        let mut volume_index = VolumeIndex::new(&config)?;
        let (volume, newest, oldest, open_records) = match open_type {
            OpenType::Create => {
                let volume = Volume::create(&config, &volume_path(directory))?;
                (volume, 0, 0, Vec::new())
            }
            OpenType::Load | OpenType::NoRebuild => {
                let volume = Volume::open(&config, &volume_path(directory))?;
                match try_clean_load(directory, &volume, &mut volume_index) {
                    Ok((newest, oldest, records)) => (volume, newest, oldest, records),
                    Err(error) if open_type == OpenType::Load && rebuild_covers(&error) => {
                        info!(%error, "saved state unusable, rebuilding from the volume");
                        volume_index = VolumeIndex::new(&config)?;
                        let (newest, oldest) = rebuild_from_volume(
                            &volume,
                            &volume_index,
                            config.zone_count,
                            load_context.as_ref(),
                            &observability.chapters_replayed,
                        )?;
                        (volume, newest, oldest, Vec::new())
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        for zone_number in 0..config.zone_count {
            volume_index.set_zone_open_chapter(zone_number, newest)?;
        }

        let capacity = geometry.records_per_chapter / config.zone_count;
        let zones: Vec<Mutex<ZoneState>> = (0..config.zone_count)
            .map(|_| Mutex::new(ZoneState::new(capacity, newest, oldest)))
            .collect();
        for (name, data) in open_records {
            let zone_number = volume_index.zone_of(&name);
            if let Err(error) = zones[zone_number].lock().open_chapter.put(&name, &data) {
                warn!(%error, "dropping saved open chapter record");
            }
        }

        let mut zone_receivers = Vec::with_capacity(config.zone_count);
        let mut zone_senders = Vec::with_capacity(config.zone_count);
        for _ in 0..config.zone_count {
            let (sender, receiver) = unbounded::<ZoneQueueItem>();
            zone_senders.push(sender);
            zone_receivers.push(receiver);
        }
        let triage = (geometry.has_sparse_chapters() && config.zone_count > 1)
            .then(unbounded::<ZoneQueueItem>);
        let (triage_sender, triage_receiver) = match triage {
            Some((sender, receiver)) => (Some(sender), Some(receiver)),
            None => (None, None),
        };

        let shared = Arc::new(IndexShared {
            geometry,
            volume,
            volume_index,
            writer: ChapterWriter::new(config.zone_count, newest),
            zones,
            zone_senders,
            triage_sender,
            callback,
            newest_chapter: AtomicU64::new(newest),
            oldest_chapter: AtomicU64::new(oldest),
            idle: Arc::new(IdleTracker::new()),
            observability,
            close_rounds: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            directory: directory.to_path_buf(),
            save_discarded: AtomicBool::new(false),
        });

        // Restarted requests re-enter their zone's queue; if the pipeline
        // is already gone they complete with an error instead.
        {
            let senders = shared.zone_senders.clone();
            let idle = Arc::clone(&shared.idle);
            let callback = shared.callback.clone();
            shared
                .volume
                .page_cache()
                .set_restarter(Box::new(move |mut request| {
                    request.requeued = true;
                    let zone_number = request.zone_number;
                    if let Err(returned) =
                        senders[zone_number].send(ZoneQueueItem::Request(request))
                    {
                        if let ZoneQueueItem::Request(mut request) = returned.into_inner() {
                            request.status = Err(IndexError::BadState(
                                "index shut down with the request in flight".to_string(),
                            ));
                            callback(*request);
                            idle.complete();
                        }
                    }
                }));
        }

        let mut zone_threads = Vec::with_capacity(config.zone_count);
        for (zone_number, receiver) in zone_receivers.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            zone_threads.push(
                std::thread::Builder::new()
                    .name(format!("index-zone-{}", zone_number))
                    .spawn(move || zone_loop(&shared, zone_number, receiver))
                    .expect("spawn zone thread"),
            );
        }
        let triage_thread = triage_receiver.map(|receiver| {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("index-triage".to_string())
                .spawn(move || triage_loop(&shared, receiver))
                .expect("spawn triage thread")
        });
        let writer_thread = {
            let shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name("chapter-writer".to_string())
                    .spawn(move || writer_loop(&shared))
                    .expect("spawn chapter writer thread"),
            )
        };

        Ok(Self {
            shared,
            zone_threads,
            triage_thread,
            writer_thread,
            closed: false,
        })
    }

    /// Submit a request into the pipeline. The request completes exactly
    /// once through the index callback, possibly on another thread.
    pub fn enqueue_request(&self, mut request: Request, stage: EnqueueStage) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(IndexError::BadState("index is shut down".to_string()));
        }
        self.shared.idle.submit();
        let sent = match stage {
            EnqueueStage::Triage if self.shared.triage_sender.is_some() => self
                .shared
                .triage_sender
                .as_ref()
                .expect("triage queue present")
                .send(ZoneQueueItem::Request(Box::new(request))),
            EnqueueStage::Triage | EnqueueStage::Index => {
                request.zone_number = self.shared.volume_index.zone_of(&request.name);
                let zone_number = request.zone_number;
                self.shared.zone_senders[zone_number]
                    .send(ZoneQueueItem::Request(Box::new(request)))
            }
            EnqueueStage::Message => {
                let zone_number = request.zone_number;
                self.shared.zone_senders[zone_number]
                    .send(ZoneQueueItem::Request(Box::new(request)))
            }
        };
        if sent.is_err() {
            self.shared.idle.complete();
            return Err(IndexError::BadState("request queue is closed".to_string()));
        }
        Ok(())
    }

    /// Block until every submitted request has completed and the chapter
    /// writer is idle.
    pub fn wait_for_idle(&self) {
        self.shared.idle.wait_idle();
        self.shared.writer.wait_idle();
    }

    /// Persist the index so the next load resumes without a rebuild.
    pub fn save(&self) -> Result<()> {
        self.wait_for_idle();
        let mut records: Vec<(RecordName, RecordData)> = Vec::new();
        let mut newest = 0;
        let mut oldest = 0;
        for zone in &self.shared.zones {
            let zone = zone.lock();
            newest = newest.max(zone.newest);
            oldest = oldest.max(zone.oldest);
            records.extend(zone.open_chapter.records().map(|(name, data)| (*name, *data)));
        }
        save_volume_index(&self.shared.directory, &self.shared.volume_index)?;
        write_index_state(
            &self.shared.directory,
            self.shared.volume.nonce(),
            newest,
            oldest,
            &self.shared.volume.index_page_map_bytes(),
        )?;
        write_open_chapter_save(&self.shared.directory, newest, &records)?;
        self.shared.volume.sync()?;
        // The save is present again; the next chapter commit re-arms the
        // recovery marker by deleting it.
        self.shared.save_discarded.store(false, Ordering::Release);
        Ok(())
    }

    /// Thread-safe statistics snapshot.
    pub fn stats(&self) -> IndexStats {
        self.shared.volume_index.stats()
    }

    pub fn observability(&self) -> &IndexObservability {
        &self.shared.observability
    }

    pub fn newest_chapter(&self) -> VirtualChapter {
        self.shared.newest_chapter.load(Ordering::Acquire)
    }

    pub fn oldest_chapter(&self) -> VirtualChapter {
        self.shared.oldest_chapter.load(Ordering::Acquire)
    }

    /// Chapter horizon of one zone: (oldest, newest).
    pub fn zone_chapter_range(&self, zone_number: usize) -> (VirtualChapter, VirtualChapter) {
        let zone = self.shared.zones[zone_number].lock();
        (zone.oldest, zone.newest)
    }

    pub fn zone_count(&self) -> usize {
        self.shared.zones.len()
    }

    /// Point the volume at a relocated backing file.
    pub fn replace_storage(&self, path: &Path) -> Result<()> {
        self.shared.volume.replace_storage(path)
    }

    /// Shut the pipeline down: queues drain, the writer finishes, the
    /// readers exit. Consumes the index.
    pub fn close(mut self) -> Result<()> {
        self.close_internal();
        Ok(())
    }

    fn close_internal(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.writer.begin_drain();
        if let Some(sender) = &self.shared.triage_sender {
            let _ = sender.send(ZoneQueueItem::Stop);
        }
        if let Some(thread) = self.triage_thread.take() {
            let _ = thread.join();
        }
        // Drain the reader pool first so parked requests flow back into
        // the still-running zones.
        self.shared.volume.shutdown();
        for sender in &self.shared.zone_senders {
            let _ = sender.send(ZoneQueueItem::Stop);
        }
        for thread in self.zone_threads.drain(..) {
            let _ = thread.join();
        }
        self.shared.writer.stop();
        if let Some(thread) = self.writer_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DedupIndex {
    fn drop(&mut self) {
        self.close_internal();
    }
}

fn rebuild_covers(error: &IndexError) -> bool {
    matches!(
        error,
        IndexError::NotSavedCleanly | IndexError::CorruptData(_)
    )
}

fn try_clean_load(
    directory: &Path,
    volume: &Volume,
    volume_index: &mut VolumeIndex,
) -> Result<(VirtualChapter, VirtualChapter, Vec<(RecordName, RecordData)>)> {
    let state = match read_index_state(directory) {
        Ok(state) => state,
        Err(IndexError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(IndexError::NotSavedCleanly)
        }
        Err(error) => return Err(error),
    };
    if state.nonce != volume.nonce() {
        return Err(IndexError::CorruptData(
            "index state belongs to a different volume".to_string(),
        ));
    }
    // A missing open chapter save is the not-saved-cleanly marker
    let Some((saved_newest, records)) = read_open_chapter_save(directory)? else {
        return Err(IndexError::NotSavedCleanly);
    };
    if saved_newest != state.newest {
        return Err(IndexError::NotSavedCleanly);
    }
    restore_volume_index(directory, volume_index)?;
    volume.load_index_page_map(&state.map_bytes)?;
    Ok((state.newest, state.oldest, records))
}

fn writer_loop(shared: &IndexShared) {
    let mut builder = match ChapterIndex::new(shared.geometry) {
        Ok(builder) => builder,
        Err(error) => {
            shared.writer.finish_close(0, Err(error));
            return;
        }
    };
    loop {
        match shared.writer.next_work() {
            WriterWork::Exit => return,
            WriterWork::Close {
                virtual_chapter,
                chapters,
            } => {
                // The clean-shutdown save describes a state this commit
                // invalidates; removing it marks the index dirty until
                // the next save.
                if !shared.save_discarded.swap(true, Ordering::AcqRel) {
                    if let Err(error) = discard_open_chapter_save(&shared.directory) {
                        warn!(%error, "could not discard the open chapter save");
                    }
                }
                let result =
                    commit_chapter(&shared.volume, &mut builder, virtual_chapter, chapters);
                match &result {
                    Ok(()) => {
                        shared
                            .observability
                            .chapters_written
                            .fetch_add(1, Ordering::Relaxed);
                        shared
                            .newest_chapter
                            .store(virtual_chapter + 1, Ordering::Release);
                        shared.oldest_chapter.store(
                            shared.geometry.oldest_for(virtual_chapter + 1),
                            Ordering::Release,
                        );
                    }
                    Err(error) => {
                        warn!(virtual_chapter, %error, "chapter commit failed");
                    }
                }
                shared.writer.finish_close(virtual_chapter, result);
            }
        }
    }
}

fn triage_loop(shared: &IndexShared, receiver: Receiver<ZoneQueueItem>) {
    while let Ok(item) = receiver.recv() {
        let mut request = match item {
            ZoneQueueItem::Stop => break,
            ZoneQueueItem::Request(request) => request,
        };
        request.zone_number = shared.volume_index.zone_of(&request.name);
        emit_sparse_barriers(shared, &request);
        let zone_number = request.zone_number;
        if let Err(returned) =
            shared.zone_senders[zone_number].send(ZoneQueueItem::Request(request))
        {
            if let ZoneQueueItem::Request(mut request) = returned.into_inner() {
                request.status = Err(IndexError::BadState(
                    "zone queue closed during triage".to_string(),
                ));
                shared.complete_request(request);
            }
        }
    }
}

// A probe that will land in an uncached sparse chapter makes every zone
// pause at a barrier so one of them can admit the chapter first.
fn emit_sparse_barriers(shared: &IndexShared, request: &Request) {
    let Ok(Some(chapter)) = shared.volume_index.lookup(&request.name) else {
        return;
    };
    let oldest = shared.oldest_chapter.load(Ordering::Acquire);
    let newest = shared.newest_chapter.load(Ordering::Acquire);
    if shared.geometry.is_chapter_sparse(oldest, newest, chapter)
        && !shared.volume.sparse_cache_contains(chapter)
    {
        for zone_number in 0..shared.zones.len() {
            shared.send_zone_message(
                zone_number,
                ZoneMessage::SparseCacheBarrier {
                    virtual_chapter: chapter,
                },
            );
        }
    }
}
