// The chapter writer.
//
// One dedicated thread owns the transition of chapters from memory to
// disk. Zones hand over their slice of a filling chapter through
// `start_closing_chapter`; once every zone has handed over, the writer
// merges the slices, builds and writes the closed chapter, advances the
// index-wide chapter horizon, and broadcasts. All writer state lives
// under a single mutex + condvar.

use crate::chapter::{close_chapter, ChapterIndex, OpenChapter};
use crate::common::{RecordData, RecordName, VirtualChapter};
use crate::error::{IndexError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

pub struct WriterState {
    pub stop: bool,
    /// Set while the pipeline drains for shutdown: chapter closes that
    /// would have to wait for a lagging peer fail instead of blocking,
    /// since that peer may already have exited.
    pub draining: bool,
    /// Sticky result of the last commit; an error surfaces to the next
    /// zone that tries to close a chapter.
    pub result: Result<()>,
    pub zones_to_write: usize,
    pub chapters: Vec<Option<Arc<OpenChapter>>>,
    pub closing_chapter: VirtualChapter,
    /// Every chapter below this is committed
    pub newest_written: VirtualChapter,
    pub writing: bool,
}

pub struct ChapterWriter {
    state: Mutex<WriterState>,
    cond: Condvar,
    zone_count: usize,
}

/// What the writer thread pulled off the condvar.
pub(crate) enum WriterWork {
    Close {
        virtual_chapter: VirtualChapter,
        chapters: Vec<Arc<OpenChapter>>,
    },
    Exit,
}

impl ChapterWriter {
    pub fn new(zone_count: usize, newest_written: VirtualChapter) -> Self {
        Self {
            state: Mutex::new(WriterState {
                stop: false,
                draining: false,
                result: Ok(()),
                zones_to_write: 0,
                chapters: vec![None; zone_count],
                closing_chapter: 0,
                newest_written,
                writing: false,
            }),
            cond: Condvar::new(),
            zone_count,
        }
    }

    /// Install a zone's slice of the closing chapter. Returns whether
    /// this zone was the first to close it.
    pub fn start_closing_chapter(
        &self,
        zone_number: usize,
        virtual_chapter: VirtualChapter,
        chapter: Arc<OpenChapter>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if let Err(error) = &state.result {
            return Err(error.clone());
        }
        if state.chapters[zone_number].is_some() {
            return Err(IndexError::BadState(format!(
                "zone {} closed chapter {} twice",
                zone_number, virtual_chapter
            )));
        }
        state.chapters[zone_number] = Some(chapter);
        state.closing_chapter = virtual_chapter;
        state.zones_to_write += 1;
        let first = state.zones_to_write == 1;
        drop(state);
        self.cond.notify_all();
        Ok(first)
    }

    /// Wait until every chapter older than `virtual_chapter` has been
    /// committed (or a commit failed).
    pub fn finish_previous_chapter(&self, virtual_chapter: VirtualChapter) -> Result<()> {
        let mut state = self.state.lock();
        while state.result.is_ok() && state.newest_written < virtual_chapter && !state.draining {
            self.cond.wait(&mut state);
        }
        state.result.clone()?;
        if state.newest_written < virtual_chapter {
            return Err(IndexError::BadState(
                "chapter close abandoned during shutdown".to_string(),
            ));
        }
        Ok(())
    }

    /// Mark the pipeline as draining for shutdown.
    pub fn begin_drain(&self) {
        self.state.lock().draining = true;
        self.cond.notify_all();
    }

    /// Block until no close is pending or in progress.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.zones_to_write > 0 || state.writing {
            self.cond.wait(&mut state);
        }
    }

    pub fn stop(&self) {
        self.state.lock().stop = true;
        self.cond.notify_all();
    }

    pub fn newest_written(&self) -> VirtualChapter {
        self.state.lock().newest_written
    }

    // The writer thread's wait: returns work to do, or Exit once stopped
    // and idle.
    pub(crate) fn next_work(&self) -> WriterWork {
        let mut state = self.state.lock();
        loop {
            if state.zones_to_write == self.zone_count {
                let chapters = state
                    .chapters
                    .iter_mut()
                    .map(|slot| slot.take().expect("all zones handed over"))
                    .collect();
                state.writing = true;
                return WriterWork::Close {
                    virtual_chapter: state.closing_chapter,
                    chapters,
                };
            }
            if state.stop {
                // A partial handover can no longer complete once the
                // zones are gone; abandon it.
                return WriterWork::Exit;
            }
            self.cond.wait(&mut state);
        }
    }

    // Publish a finished (or failed) commit.
    pub(crate) fn finish_close(&self, virtual_chapter: VirtualChapter, result: Result<()>) {
        let mut state = self.state.lock();
        state.writing = false;
        state.zones_to_write = 0;
        match result {
            Ok(()) => state.newest_written = virtual_chapter + 1,
            Err(error) => state.result = Err(error),
        }
        drop(state);
        self.cond.notify_all();
    }
}

/// Merge every zone's slice of a chapter into one record list, in zone
/// order.
pub(crate) fn merge_chapter_records(
    chapters: &[Arc<OpenChapter>],
) -> Vec<(RecordName, RecordData)> {
    let mut records = Vec::new();
    for chapter in chapters {
        for (name, data) in chapter.records() {
            records.push((*name, *data));
        }
    }
    records
}

/// Build and write one closed chapter.
pub(crate) fn commit_chapter(
    volume: &crate::volume::Volume,
    builder: &mut ChapterIndex,
    virtual_chapter: VirtualChapter,
    chapters: Vec<Arc<OpenChapter>>,
) -> Result<()> {
    let records = merge_chapter_records(&chapters);
    drop(chapters);
    let closed = close_chapter(
        volume.geometry(),
        builder,
        volume.nonce(),
        virtual_chapter,
        records,
    )?;
    volume.write_chapter(&closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_zone_detection() {
        let writer = ChapterWriter::new(2, 0);
        let part = Arc::new(OpenChapter::new(4));
        assert!(writer.start_closing_chapter(0, 0, Arc::clone(&part)).unwrap());
        assert!(!writer.start_closing_chapter(1, 0, part).unwrap());
        match writer.next_work() {
            WriterWork::Close {
                virtual_chapter,
                chapters,
            } => {
                assert_eq!(virtual_chapter, 0);
                assert_eq!(chapters.len(), 2);
            }
            WriterWork::Exit => panic!("expected work"),
        }
        writer.finish_close(0, Ok(()));
        assert_eq!(writer.newest_written(), 1);
        writer.finish_previous_chapter(1).unwrap();
    }

    #[test]
    fn test_double_close_rejected() {
        let writer = ChapterWriter::new(2, 0);
        let part = Arc::new(OpenChapter::new(4));
        writer.start_closing_chapter(0, 0, Arc::clone(&part)).unwrap();
        assert!(writer.start_closing_chapter(0, 0, part).is_err());
    }

    #[test]
    fn test_commit_error_surfaces() {
        let writer = ChapterWriter::new(1, 0);
        let part = Arc::new(OpenChapter::new(4));
        writer.start_closing_chapter(0, 0, part).unwrap();
        match writer.next_work() {
            WriterWork::Close { .. } => {}
            WriterWork::Exit => panic!("expected work"),
        }
        writer.finish_close(0, Err(IndexError::Buffer("disk gone".to_string())));
        assert!(writer.finish_previous_chapter(1).is_err());
        let part = Arc::new(OpenChapter::new(4));
        assert!(writer.start_closing_chapter(0, 1, part).is_err());
    }

    #[test]
    fn test_stop_exits_when_idle() {
        let writer = ChapterWriter::new(1, 0);
        writer.stop();
        match writer.next_work() {
            WriterWork::Exit => {}
            WriterWork::Close { .. } => panic!("expected exit"),
        }
    }

    #[test]
    fn test_merge_preserves_zone_order() {
        let mut a = OpenChapter::new(4);
        let mut b = OpenChapter::new(4);
        a.put(&RecordName([1; 32]), &RecordData([1; 16])).unwrap();
        b.put(&RecordName([2; 32]), &RecordData([2; 16])).unwrap();
        let records = merge_chapter_records(&[Arc::new(a), Arc::new(b)]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, RecordName([1; 32]));
        assert_eq!(records[1].0, RecordName([2; 32]));
    }
}
