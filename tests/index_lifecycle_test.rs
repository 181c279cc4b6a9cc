// End-to-end lifecycle tests against the full request pipeline.

use crossbeam::channel::{unbounded, Receiver};
use dedup_index::{
    DedupIndex, EnqueueStage, Geometry, IndexConfig, IndexRegion, OpenType, RecordData,
    RecordName, Request, RequestCallback, RequestType,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Arc;
use tempfile::tempdir;

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
    bytes.copy_from_slice(&name.as_bytes()[0..16]);
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

fn dense_config() -> IndexConfig {
    // 128-record chapters, 16-chapter volume
    let geometry = Geometry::new(4096, 16, 8, 16, 0, 0).unwrap();
    let mut config = IndexConfig::with_geometry(geometry);
    config.zone_count = 1;
    config.read_threads = 2;
    config.cache_pages = geometry.pages_per_chapter * 2;
    config
}

#[test]
fn test_post_then_query_lifecycle() {
    let dir = tempdir().unwrap();
    let (callback, receiver) = collector();
    let config = dense_config();
    let index = DedupIndex::new(config, dir.path(), OpenType::Create, None, callback).unwrap();

    let all_names = names(0x5eed, 1280);

    // Records in a not-yet-closed chapter answer from the open chapter
    for name in &all_names[..100] {
        let request = Request::with_data(RequestType::Post, *name, data_for(name));
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    for request in drain(&receiver, 100) {
        assert!(request.status.is_ok());
        assert!(!request.found);
    }
    for name in &all_names[..100] {
        let request = Request::new(RequestType::QueryNoUpdate, *name);
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    for request in drain(&receiver, 100) {
        assert!(request.status.is_ok());
        assert!(request.found, "open chapter record found");
        assert_eq!(request.location, IndexRegion::OpenChapter);
        assert_eq!(request.old_metadata, data_for(&request.name));
    }

    // Fill ten full chapters
    for name in &all_names[100..] {
        let request = Request::with_data(RequestType::Post, *name, data_for(name));
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    drain(&receiver, 1180);

    let stats = index.stats();
    assert_eq!(stats.entries_indexed, 1280);
    assert!(stats.collisions <= 4, "collisions: {}", stats.collisions);
    assert_eq!(stats.entries_discarded, 0);
    assert_eq!(index.newest_chapter(), 10);
    assert_eq!(index.oldest_chapter(), 0);
    assert_eq!(
        index
            .observability()
            .chapters_written
            .load(std::sync::atomic::Ordering::Relaxed),
        10
    );

    // Every record is now on disk and answers as dense
    for name in &all_names {
        let request = Request::new(RequestType::QueryNoUpdate, *name);
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    let mut dense = 0;
    for request in drain(&receiver, 1280) {
        assert!(request.status.is_ok());
        assert!(request.found, "dense record found");
        assert_eq!(request.old_metadata, data_for(&request.name));
        if request.location == IndexRegion::Dense {
            dense += 1;
        }
    }
    assert_eq!(dense, 1280);

    index.close().unwrap();
}

#[test]
fn test_update_and_delete() {
    let dir = tempdir().unwrap();
    let (callback, receiver) = collector();
    let index =
        DedupIndex::new(dense_config(), dir.path(), OpenType::Create, None, callback).unwrap();
    let name = names(7, 1)[0];

    let request = Request::with_data(RequestType::Post, name, RecordData([1; 16]));
    index.enqueue_request(request, EnqueueStage::Index).unwrap();
    index.wait_for_idle();
    drain(&receiver, 1);

    // Update overwrites the payload
    let request = Request::with_data(RequestType::Update, name, RecordData([2; 16]));
    index.enqueue_request(request, EnqueueStage::Index).unwrap();
    index.wait_for_idle();
    let completed = drain(&receiver, 1);
    assert!(completed[0].found);
    assert_eq!(completed[0].old_metadata, RecordData([1; 16]));

    let request = Request::new(RequestType::QueryNoUpdate, name);
    index.enqueue_request(request, EnqueueStage::Index).unwrap();
    index.wait_for_idle();
    let completed = drain(&receiver, 1);
    assert_eq!(completed[0].old_metadata, RecordData([2; 16]));

    // Delete removes it
    let request = Request::new(RequestType::Delete, name);
    index.enqueue_request(request, EnqueueStage::Index).unwrap();
    index.wait_for_idle();
    let completed = drain(&receiver, 1);
    assert!(completed[0].found);

    let request = Request::new(RequestType::QueryNoUpdate, name);
    index.enqueue_request(request, EnqueueStage::Index).unwrap();
    index.wait_for_idle();
    let completed = drain(&receiver, 1);
    assert!(!completed[0].found);

    index.close().unwrap();
}

#[test]
fn test_query_refreshes_record_position() {
    let dir = tempdir().unwrap();
    let (callback, receiver) = collector();
    let index =
        DedupIndex::new(dense_config(), dir.path(), OpenType::Create, None, callback).unwrap();
    let all_names = names(0xabcd, 128);

    // One full chapter lands on disk
    for name in &all_names {
        let request = Request::with_data(RequestType::Post, *name, data_for(name));
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    drain(&receiver, 128);
    assert_eq!(index.newest_chapter(), 1);

    // A query pulls the record back into the open chapter
    let request = Request::new(RequestType::Query, all_names[0]);
    index.enqueue_request(request, EnqueueStage::Index).unwrap();
    index.wait_for_idle();
    let completed = drain(&receiver, 1);
    assert!(completed[0].found);

    let request = Request::new(RequestType::QueryNoUpdate, all_names[0]);
    index.enqueue_request(request, EnqueueStage::Index).unwrap();
    index.wait_for_idle();
    let completed = drain(&receiver, 1);
    assert!(completed[0].found);
    assert_eq!(completed[0].location, IndexRegion::OpenChapter);

    index.close().unwrap();
}

#[test]
fn test_multi_zone_close_coordination() {
    let dir = tempdir().unwrap();
    let (callback, receiver) = collector();
    // 32-chapter volume, 128-record chapters, 4 zones (32 records per
    // zone per chapter)
    let geometry = Geometry::new(4096, 16, 8, 32, 0, 0).unwrap();
    let mut config = IndexConfig::with_geometry(geometry);
    config.zone_count = 4;
    config.read_threads = 2;
    config.cache_pages = geometry.pages_per_chapter * 2;
    let index = DedupIndex::new(config, dir.path(), OpenType::Create, None, callback).unwrap();

    let all_names = names(0x2017, 512);
    for name in &all_names {
        let request = Request::with_data(RequestType::Post, *name, data_for(name));
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    for request in drain(&receiver, 512) {
        assert!(request.status.is_ok());
    }

    // Enough records for four full chapters were posted; announcements
    // bound the skew, and at idle every zone agrees on the horizon.
    let (oldest0, newest0) = index.zone_chapter_range(0);
    for zone in 1..index.zone_count() {
        assert_eq!(index.zone_chapter_range(zone), (oldest0, newest0));
    }
    assert!(newest0 >= 4, "at least four chapters closed: {}", newest0);
    assert!(newest0 <= 8, "no runaway chapter churn: {}", newest0);
    assert_eq!(oldest0, 0);
    assert_eq!(index.newest_chapter(), newest0);

    // Every posted record is still findable
    for name in &all_names {
        let request = Request::new(RequestType::QueryNoUpdate, *name);
        index.enqueue_request(request, EnqueueStage::Index).unwrap();
    }
    index.wait_for_idle();
    for request in drain(&receiver, 512) {
        assert!(request.status.is_ok());
        assert!(request.found, "record findable after multi-zone closes");
    }

    index.close().unwrap();
}
