// Request values flowing through the index pipeline.
//
// A request is a plain value: it moves from the submitting thread to the
// triage stage, to a zone queue, possibly onto a page read's waiter list,
// and finally back through the index callback. Whoever holds the value
// owns it; parking a request means moving it onto a waiter list, never
// blocking a thread.

use crate::common::{RecordData, RecordName, VirtualChapter, NO_CHAPTER};
use crate::error::Result;
use std::sync::Arc;

/// Pipeline entry stage for `enqueue_request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStage {
    /// Pre-zone stage; consults the volume index for sparse barriers
    Triage,
    /// Assign a zone and queue on it
    Index,
    /// Already-routed control message; queue directly on its zone
    Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Look up, and add the record if it is absent
    Post,
    /// Look up and refresh the record's place in the index
    Query,
    /// Look up without modifying the index
    QueryNoUpdate,
    /// Overwrite the record's payload, adding it if absent
    Update,
    /// Remove the record
    Delete,
}

/// Where the pipeline found (or gave up on) a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexRegion {
    #[default]
    Unknown,
    /// The chapter named by the volume index is no longer readable
    Unavailable,
    /// In the zone's in-memory open chapter
    OpenChapter,
    /// In a dense on-disk chapter
    Dense,
    /// In a sparse chapter, via the sparse cache
    Sparse,
    /// Index page matched; the record page probe is still in flight
    RecordPageLookup,
}

/// Zone control messages delivered through the request queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMessage {
    SparseCacheBarrier { virtual_chapter: VirtualChapter },
    AnnounceChapterClosed { virtual_chapter: VirtualChapter },
}

pub struct Request {
    pub name: RecordName,
    pub request_type: RequestType,
    pub new_metadata: RecordData,
    pub old_metadata: RecordData,
    pub found: bool,
    pub location: IndexRegion,
    pub status: Result<()>,

    pub(crate) zone_number: usize,
    pub(crate) virtual_chapter: VirtualChapter,
    pub(crate) requeued: bool,
    pub(crate) zone_message: Option<ZoneMessage>,
}

impl Request {
    pub fn new(request_type: RequestType, name: RecordName) -> Self {
        Self {
            name,
            request_type,
            new_metadata: RecordData::default(),
            old_metadata: RecordData::default(),
            found: false,
            location: IndexRegion::Unknown,
            status: Ok(()),
            zone_number: 0,
            virtual_chapter: NO_CHAPTER,
            requeued: false,
            zone_message: None,
        }
    }

    pub fn with_data(request_type: RequestType, name: RecordName, data: RecordData) -> Self {
        let mut request = Self::new(request_type, name);
        request.new_metadata = data;
        request
    }

    pub(crate) fn control(zone_number: usize, message: ZoneMessage) -> Self {
        let mut request = Self::new(RequestType::QueryNoUpdate, RecordName([0u8; 32]));
        request.zone_number = zone_number;
        request.zone_message = Some(message);
        request
    }

    /// True for types that may modify the index on this pass. A query
    /// still counts: a hit refreshes the record into the open chapter.
    #[inline]
    pub(crate) fn updates_index(&self) -> bool {
        matches!(
            self.request_type,
            RequestType::Post | RequestType::Update | RequestType::Query
        )
    }
}

/// The index-wide completion callback. Receives every request exactly
/// once, with `status` and `location` populated.
pub type RequestCallback = Arc<dyn Fn(Request) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_defaults() {
        let request = Request::new(RequestType::Post, RecordName([1u8; 32]));
        assert!(!request.found);
        assert_eq!(request.location, IndexRegion::Unknown);
        assert_eq!(request.virtual_chapter, NO_CHAPTER);
        assert!(request.status.is_ok());
        assert!(request.updates_index());
    }

    #[test]
    fn test_update_classification() {
        let name = RecordName([0u8; 32]);
        assert!(Request::new(RequestType::Query, name).updates_index());
        assert!(!Request::new(RequestType::QueryNoUpdate, name).updates_index());
        assert!(!Request::new(RequestType::Delete, name).updates_index());
    }
}
