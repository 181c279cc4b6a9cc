// Save/load equivalence and crash recovery.

use crossbeam::channel::{unbounded, Receiver};
use dedup_index::{
    DedupIndex, EnqueueStage, Geometry, IndexConfig, IndexError, LoadContext, OpenType,
    RecordData, RecordName, Request, RequestCallback, RequestType,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::tempdir;

fn config() -> IndexConfig {
    let geometry = Geometry::new(4096, 16, 8, 16, 0, 0).unwrap();
    let mut config = IndexConfig::with_geometry(geometry);
    config.zone_count = 1;
    config.read_threads = 2;
    config.cache_pages = geometry.pages_per_chapter * 2;
    config
}

fn collector() -> (RequestCallback, Receiver<Request>) {
    let (sender, receiver) = unbounded();
    let callback: RequestCallback = Arc::new(move |request| {
        let _ = sender.send(request);
    });
    (callback, receiver)
}

fn names(seed: u64, count: usize) -> Vec<RecordName> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            RecordName(bytes)
        })
        .collect()
}

fn data_for(name: &RecordName) -> RecordData {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&name.as_bytes()[16..32]);
    RecordData(bytes)
}

fn drain(receiver: &Receiver<Request>, expected: usize) -> Vec<Request> {
    let mut completed = Vec::with_capacity(expected);
    for _ in 0..expected {
        completed.push(
            receiver
                .recv_timeout(std::time::Duration::from_secs(60))
                .expect("request completed"),
        );
    }
    completed
}

fn post_all(index: &DedupIndex, receiver: &Receiver<Request>, names: &[RecordName]) {
    for name in names {
        let request = Request::with_data(RequestType::Post, *name, data_for(name));
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    for request in drain(receiver, names.len()) {
        assert!(request.status.is_ok());
    }
}

fn query_all_found(index: &DedupIndex, receiver: &Receiver<Request>, names: &[RecordName]) {
    for name in names {
        let request = Request::new(RequestType::QueryNoUpdate, *name);
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    for request in drain(receiver, names.len()) {
        assert!(request.status.is_ok());
        assert!(request.found, "record lost across restart");
        assert_eq!(request.old_metadata, data_for(&request.name));
    }
}

#[test]
fn test_save_then_load_answers_identically() {
    let dir = tempdir().unwrap();
    // 2 full chapters on disk plus 50 records in the open chapter
    let all_names = names(0x1009, 306);

    let saved_stats = {
        let (callback, receiver) = collector();
        let index =
            DedupIndex::new(config(), dir.path(), OpenType::Create, None, callback).unwrap();
        post_all(&index, &receiver, &all_names);
        assert_eq!(index.newest_chapter(), 2);
        index.save().unwrap();
        let stats = index.stats();
        index.close().unwrap();
        stats
    };

    let (callback, receiver) = collector();
    let index = DedupIndex::new(config(), dir.path(), OpenType::Load, None, callback).unwrap();
    // Loading a clean save performs no rebuild
    assert_eq!(
        index
            .observability()
            .chapters_replayed
            .load(Ordering::Relaxed),
        0
    );
    assert_eq!(index.stats().entries_indexed, saved_stats.entries_indexed);
    query_all_found(&index, &receiver, &all_names);
    index.close().unwrap();
}

#[test]
fn test_dirty_shutdown_triggers_rebuild() {
    let dir = tempdir().unwrap();
    // Exactly two full chapters, nothing in the open chapter
    let all_names = names(0x2009, 256);
    {
        let (callback, receiver) = collector();
        let index =
            DedupIndex::new(config(), dir.path(), OpenType::Create, None, callback).unwrap();
        post_all(&index, &receiver, &all_names);
        assert_eq!(index.newest_chapter(), 2);
        // Dropped without save: dirty shutdown
    }

    let (callback, receiver) = collector();
    let index = DedupIndex::new(config(), dir.path(), OpenType::Load, None, callback).unwrap();
    assert_eq!(
        index
            .observability()
            .chapters_replayed
            .load(Ordering::Relaxed),
        2
    );
    assert_eq!(index.newest_chapter(), 2);
    query_all_found(&index, &receiver, &all_names);
    index.close().unwrap();
}

#[test]
fn test_rebuild_suspends_and_resumes() {
    let dir = tempdir().unwrap();
    let all_names = names(0x6009, 256);
    {
        let (callback, receiver) = collector();
        let index =
            DedupIndex::new(config(), dir.path(), OpenType::Create, None, callback).unwrap();
        post_all(&index, &receiver, &all_names);
        // Dropped without save: the next load must rebuild
    }

    let context = Arc::new(LoadContext::new());
    // Ask for a suspend up front so the rebuild parks at its first
    // between-chapters checkpoint.
    context.suspend();

    let (callback, receiver) = collector();
    let path = dir.path().to_path_buf();
    let loader = {
        let context = Arc::clone(&context);
        std::thread::spawn(move || {
            DedupIndex::new(config(), &path, OpenType::Load, Some(context), callback)
        })
    };

    context.wait_suspended();
    // The rebuild acknowledged the suspend and is parked, not done
    assert!(!loader.is_finished());
    context.resume();

    let index = loader.join().unwrap().unwrap();
    assert_eq!(
        index
            .observability()
            .chapters_replayed
            .load(Ordering::Relaxed),
        2
    );
    query_all_found(&index, &receiver, &all_names);
    index.close().unwrap();
}

#[test]
fn test_rebuild_abort_reports_busy() {
    let dir = tempdir().unwrap();
    {
        let (callback, receiver) = collector();
        let index =
            DedupIndex::new(config(), dir.path(), OpenType::Create, None, callback).unwrap();
        post_all(&index, &receiver, &names(0x7009, 256));
    }

    let context = Arc::new(LoadContext::new());
    context.suspend();

    let (callback, _receiver) = collector();
    let path = dir.path().to_path_buf();
    let loader = {
        let context = Arc::clone(&context);
        std::thread::spawn(move || {
            DedupIndex::new(config(), &path, OpenType::Load, Some(context), callback)
        })
    };

    context.wait_suspended();
    context.abort();
    let error = match loader.join().unwrap() {
        Ok(_) => panic!("an aborted rebuild must not produce an index"),
        Err(error) => error,
    };
    assert_eq!(error, IndexError::Busy);
}

#[test]
fn test_no_rebuild_refuses_dirty_state() {
    let dir = tempdir().unwrap();
    {
        let (callback, receiver) = collector();
        let index =
            DedupIndex::new(config(), dir.path(), OpenType::Create, None, callback).unwrap();
        post_all(&index, &receiver, &names(0x3009, 128));
    }
    let (callback, _receiver) = collector();
    let error =
        DedupIndex::new(config(), dir.path(), OpenType::NoRebuild, None, callback).unwrap_err();
    assert_eq!(error, IndexError::NotSavedCleanly);
}

#[test]
fn test_save_after_more_writes_stays_clean() {
    let dir = tempdir().unwrap();
    let first = names(0x4009, 128);
    let second = names(0x5009, 128);
    {
        let (callback, receiver) = collector();
        let index =
            DedupIndex::new(config(), dir.path(), OpenType::Create, None, callback).unwrap();
        post_all(&index, &receiver, &first);
        index.save().unwrap();
        // New chapter commits after the save discard the save marker;
        // saving again restores it.
        post_all(&index, &receiver, &second);
        index.save().unwrap();
        index.close().unwrap();
    }
    let (callback, receiver) = collector();
    let index = DedupIndex::new(config(), dir.path(), OpenType::Load, None, callback).unwrap();
    assert_eq!(
        index
            .observability()
            .chapters_replayed
            .load(Ordering::Relaxed),
        0
    );
    query_all_found(&index, &receiver, &first);
    query_all_found(&index, &receiver, &second);
    index.close().unwrap();
}
