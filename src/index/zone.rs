// Zone request processing.
//
// One thread per zone drains that zone's queue in order. A request for a
// given name always lands on the same zone, so the zone's open chapter,
// writing chapter, and volume-index lists are mutated by exactly one
// thread. The chapter-close protocol:
//
//   1. wait for the writer to finish every older chapter
//   2. swap the open and writing chapters
//   3. bump the zone's newest chapter and the volume-index anchor
//   4. hand the closed slice to the writer
//   5. first zone to close broadcasts close announcements
//   6. advance the zone's oldest chapter
//   7. last zone to close forgets the newly expired chapters
//
// The announcements force lagging zones to close their (possibly
// unfilled) open chapters, bounding inter-zone skew to one chapter.

use super::IndexShared;
use crate::chapter::OpenChapter;
use crate::common::{RecordData, VirtualChapter};
use crate::error::{IndexError, Result};
use crate::request::{IndexRegion, Request, RequestType, ZoneMessage};
use crate::volume::VolumeSearch;
use crate::volume_index::VolumeIndexRecord;
use crossbeam::channel::Receiver;
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct ZoneState {
    pub open_chapter: OpenChapter,
    pub writing_chapter: Arc<OpenChapter>,
    pub newest: VirtualChapter,
    pub oldest: VirtualChapter,
}

impl ZoneState {
    pub fn new(capacity: usize, newest: VirtualChapter, oldest: VirtualChapter) -> Self {
        Self {
            open_chapter: OpenChapter::new(capacity),
            writing_chapter: Arc::new(OpenChapter::new(capacity)),
            newest,
            oldest,
        }
    }
}

pub(crate) enum ZoneQueueItem {
    Request(Box<Request>),
    Stop,
}

pub(crate) fn zone_loop(
    shared: &IndexShared,
    zone_number: usize,
    receiver: Receiver<ZoneQueueItem>,
) {
    while let Ok(item) = receiver.recv() {
        match item {
            ZoneQueueItem::Request(request) => {
                execute_zone_request(shared, zone_number, request)
            }
            ZoneQueueItem::Stop => break,
        }
    }
}

fn execute_zone_request(shared: &IndexShared, zone_number: usize, mut request: Box<Request>) {
    // Control messages are consumed here and never see the callback
    if let Some(message) = request.zone_message.take() {
        handle_zone_message(shared, zone_number, message);
        shared.idle.complete();
        return;
    }
    // A failed page read completed this request with an error
    if request.status.is_err() {
        shared.complete_request(request);
        return;
    }
    if shared.geometry.has_sparse_chapters() && shared.zones.len() == 1 {
        simulate_triage_barrier(shared, zone_number, &request);
    }
    let outcome = match request.request_type {
        RequestType::Delete => delete_record(shared, zone_number, request),
        _ => search_and_update(shared, zone_number, request),
    };
    if let Some(request) = outcome {
        shared.complete_request(request);
    }
}

fn handle_zone_message(shared: &IndexShared, zone_number: usize, message: ZoneMessage) {
    match message {
        ZoneMessage::SparseCacheBarrier { virtual_chapter } => {
            let oldest = shared.oldest_chapter.load(Ordering::Acquire);
            if let Err(error) = shared.volume.update_sparse_cache(virtual_chapter, oldest) {
                warn!(zone_number, virtual_chapter, %error, "sparse cache update failed");
            }
        }
        ZoneMessage::AnnounceChapterClosed { virtual_chapter } => {
            let mut zone = shared.zones[zone_number].lock();
            if zone.newest == virtual_chapter {
                debug!(zone_number, virtual_chapter, "closing chapter on announcement");
                if let Err(error) = open_next_chapter(shared, zone_number, &mut zone) {
                    warn!(zone_number, virtual_chapter, %error, "announced close failed");
                }
            }
        }
    }
}

// The single-zone rendition of the triage stage: a sparse probe that
// needs an uncached chapter admits it inline, with no queue hop.
fn simulate_triage_barrier(shared: &IndexShared, zone_number: usize, request: &Request) {
    let Ok(Some(chapter)) = shared.volume_index.lookup(&request.name) else {
        return;
    };
    let (oldest, newest) = {
        let zone = shared.zones[zone_number].lock();
        (zone.oldest, zone.newest)
    };
    if shared.geometry.is_chapter_sparse(oldest, newest, chapter)
        && !shared.volume.sparse_cache_contains(chapter)
    {
        if let Err(error) = shared.volume.update_sparse_cache(chapter, oldest) {
            warn!(chapter, %error, "inline sparse cache update failed");
        }
    }
}

// What the in-memory chapters had to say about a found chapter number
enum MemorySearch {
    Found(RecordData, IndexRegion),
    NotFound,
    OnDisk { sparse: bool },
}

fn search_in_memory(
    zone: &ZoneState,
    shared: &IndexShared,
    request: &Request,
    chapter: VirtualChapter,
) -> MemorySearch {
    if chapter == zone.newest {
        return match zone.open_chapter.get(&request.name) {
            Some(data) => MemorySearch::Found(data, IndexRegion::OpenChapter),
            None => MemorySearch::NotFound,
        };
    }
    if chapter + 1 == zone.newest {
        // The previous chapter is usually still held in memory while (or
        // after) the writer commits it; after a restart it is only on
        // disk, so a miss here falls through to the volume search.
        if let Some(data) = zone.writing_chapter.get(&request.name) {
            return MemorySearch::Found(data, IndexRegion::Dense);
        }
    }
    if chapter < zone.oldest {
        return MemorySearch::NotFound;
    }
    MemorySearch::OnDisk {
        sparse: shared
            .geometry
            .is_chapter_sparse(zone.oldest, zone.newest, chapter),
    }
}

fn search_and_update(
    shared: &IndexShared,
    zone_number: usize,
    mut request: Box<Request>,
) -> Option<Box<Request>> {
    let record = match shared.volume_index.get_record(&request.name) {
        Ok(record) => record,
        Err(error) => {
            request.status = Err(error);
            return Some(request);
        }
    };
    request.found = false;
    request.location = IndexRegion::Unknown;

    if record.found {
        let chapter = record.virtual_chapter;
        request.virtual_chapter = chapter;
        let memory_search = {
            let zone = shared.zones[zone_number].lock();
            search_in_memory(&zone, shared, &request, chapter)
        };
        match memory_search {
            MemorySearch::Found(data, location) => {
                request.found = true;
                request.old_metadata = data;
                request.location = location;
            }
            MemorySearch::NotFound => {}
            MemorySearch::OnDisk { sparse } => {
                request.location = IndexRegion::RecordPageLookup;
                let mut parked = Some(request);
                let name = parked.as_ref().expect("request present").name;
                let searched = if sparse {
                    shared
                        .volume
                        .search_sparse_chapter(&name, chapter, zone_number, &mut parked)
                } else {
                    shared
                        .volume
                        .search_dense_chapter(&name, chapter, zone_number, &mut parked)
                };
                match searched {
                    Ok(VolumeSearch::Parked) => return None,
                    Ok(VolumeSearch::Found(data)) => {
                        let mut request = parked.expect("request returned");
                        request.found = true;
                        request.old_metadata = data;
                        request.location = if sparse {
                            IndexRegion::Sparse
                        } else {
                            IndexRegion::Dense
                        };
                        return finish_update(shared, zone_number, request, record);
                    }
                    Ok(VolumeSearch::NotFound) => {
                        let mut request = parked.expect("request returned");
                        request.location = IndexRegion::Unknown;
                        return finish_update(shared, zone_number, request, record);
                    }
                    Ok(VolumeSearch::Unavailable) => {
                        let mut request = parked.expect("request returned");
                        request.location = IndexRegion::Unavailable;
                        return finish_update(shared, zone_number, request, record);
                    }
                    Err(error) => {
                        let mut request = parked.expect("request returned");
                        request.status = Err(error);
                        return Some(request);
                    }
                }
            }
        }
    }
    finish_update(shared, zone_number, request, record)
}

// The modify half of the pipeline: route POST/UPDATE/QUERY results into
// the open chapter and the volume index.
fn finish_update(
    shared: &IndexShared,
    zone_number: usize,
    mut request: Box<Request>,
    record: VolumeIndexRecord,
) -> Option<Box<Request>> {
    if !request.updates_index() {
        return Some(request);
    }
    if request.request_type == RequestType::Query && !request.found {
        // A miss leaves a pure query with nothing to refresh
        return Some(request);
    }
    if request.found && request.location == IndexRegion::OpenChapter {
        // Already fresh; an update still replaces the payload in place
        if request.request_type == RequestType::Update {
            let mut zone = shared.zones[zone_number].lock();
            if let Err(error) = zone.open_chapter.put(&request.name, &request.new_metadata) {
                request.status = Err(error);
            }
        }
        return Some(request);
    }
    if let Err(error) = put_record_in_zone(shared, zone_number, &mut request, &record) {
        request.status = Err(error);
    }
    Some(request)
}

fn put_record_in_zone(
    shared: &IndexShared,
    zone_number: usize,
    request: &mut Request,
    record: &VolumeIndexRecord,
) -> Result<()> {
    // A found record keeps its stored payload when it moves; only an
    // update (or a fresh post) writes the caller's payload.
    let data = if request.found && request.request_type != RequestType::Update {
        request.old_metadata
    } else {
        request.new_metadata
    };
    let mut zone = shared.zones[zone_number].lock();
    let remaining = zone.open_chapter.put(&request.name, &data)?;
    if record.found && request.found {
        // Verified in its chapter: the same record moves to the open
        // chapter in place.
        shared.volume_index.set_record_chapter(record, zone.newest)?;
    } else {
        // Absent, or the index entry belongs to a different record with
        // the same key bits; insert (as a collision entry if the key is
        // taken).
        match shared.volume_index.put_record(record, zone.newest) {
            Ok(()) | Err(IndexError::DuplicateName) => {}
            Err(error) => return Err(error),
        }
    }
    request.virtual_chapter = zone.newest;
    if remaining == 0 {
        open_next_chapter(shared, zone_number, &mut zone)?;
    }
    Ok(())
}

fn delete_record(
    shared: &IndexShared,
    zone_number: usize,
    mut request: Box<Request>,
) -> Option<Box<Request>> {
    let record = match shared.volume_index.get_record(&request.name) {
        Ok(record) => record,
        Err(error) => {
            request.status = Err(error);
            return Some(request);
        }
    };
    if !record.found {
        return Some(request);
    }
    request.found = true;
    request.virtual_chapter = record.virtual_chapter;
    if let Err(error) = shared.volume_index.remove_record(&record) {
        request.status = Err(error);
        return Some(request);
    }
    let mut zone = shared.zones[zone_number].lock();
    if record.virtual_chapter == zone.newest {
        zone.open_chapter.remove(&request.name);
        request.location = IndexRegion::OpenChapter;
    }
    Some(request)
}

pub(crate) fn open_next_chapter(
    shared: &IndexShared,
    zone_number: usize,
    zone: &mut MutexGuard<'_, ZoneState>,
) -> Result<()> {
    let closing_chapter = zone.newest;

    // 1. Every chapter older than the closing one must be on disk before
    //    the writing-chapter slot can be reused.
    shared.writer.finish_previous_chapter(closing_chapter)?;

    // 2. Reclaim the committed writing chapter and swap it in as the new
    //    open chapter.
    let placeholder = Arc::new(OpenChapter::new(1));
    let retired = std::mem::replace(&mut zone.writing_chapter, placeholder);
    let mut reclaimed = Arc::try_unwrap(retired).map_err(|_| {
        IndexError::BadState(format!(
            "zone {} writing chapter still referenced after commit",
            zone_number
        ))
    })?;
    reclaimed.reset();
    let closed = Arc::new(std::mem::replace(&mut zone.open_chapter, reclaimed));
    zone.writing_chapter = Arc::clone(&closed);

    // 3. The zone now serves the next chapter.
    zone.newest = closing_chapter + 1;
    shared
        .volume_index
        .set_zone_open_chapter(zone_number, zone.newest)?;

    // 4. Hand the closed slice to the writer.
    let first = shared
        .writer
        .start_closing_chapter(zone_number, closing_chapter, closed)?;

    // 5. The first zone to close tells the others to close too.
    if first && shared.zones.len() > 1 {
        for other in 0..shared.zones.len() {
            if other != zone_number {
                shared.send_zone_message(
                    other,
                    ZoneMessage::AnnounceChapterClosed {
                        virtual_chapter: closing_chapter,
                    },
                );
            }
        }
    }

    // 6. Chapters expired by the new open chapter are gone for this zone.
    zone.oldest = shared.geometry.oldest_for(zone.newest);

    // 7. The last zone to close drops the expired chapters from the
    //    volume's caches.
    let finished = {
        let mut rounds = shared.close_rounds.lock();
        let counter = rounds.entry(closing_chapter).or_insert(0);
        *counter += 1;
        if *counter == shared.zones.len() {
            rounds.remove(&closing_chapter);
            true
        } else {
            false
        }
    };
    if finished {
        let previous_oldest = shared.geometry.oldest_for(closing_chapter);
        for expired in previous_oldest..zone.oldest {
            shared.volume.forget_chapter(expired);
        }
    }
    Ok(())
}
