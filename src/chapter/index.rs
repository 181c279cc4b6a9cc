// Closed-chapter construction and record page access.
//
// Closing a chapter merges every zone's open-chapter records, collates
// them by chapter delta list so each index page's lists point at records
// on that page's record pages, builds the chapter index in a single-zone
// delta store, and packs it into immutable index pages.

use crate::common::{RecordData, RecordName, VirtualChapter, RECORD_NAME_BYTES, VOLUME_RECORD_BYTES};
use crate::delta::{pack_page, zone_memory_size, DeltaZone};
use crate::error::{IndexError, Result};
use crate::geometry::Geometry;

/// The reusable builder for chapter indexes. One lives in the chapter
/// writer for the life of the index.
pub struct ChapterIndex {
    zone: DeltaZone,
    geometry: Geometry,
    virtual_chapter: VirtualChapter,
}

impl ChapterIndex {
    pub fn new(geometry: Geometry) -> Result<Self> {
        let coding = geometry.chapter_coding();
        let memory = zone_memory_size(
            geometry.records_per_chapter as u64,
            &coding,
            geometry.delta_lists_per_chapter,
        )?;
        Ok(Self {
            zone: DeltaZone::new(
                0,
                geometry.delta_lists_per_chapter,
                geometry.chapter_mean_delta,
                geometry.chapter_payload_bits,
                memory,
            )?,
            geometry,
            virtual_chapter: 0,
        })
    }

    pub fn reset(&mut self, virtual_chapter: VirtualChapter) {
        self.zone.reset();
        self.virtual_chapter = virtual_chapter;
    }

    /// Index one record under its record page number.
    pub fn put(&mut self, name: &RecordName, record_page: u32) -> Result<()> {
        let list = self.geometry.chapter_delta_list(name) + 1;
        let key = self.geometry.chapter_key(name);
        let (entry, found) = self.zone.search_name(list, key, name)?;
        if found {
            if entry.is_collision {
                return Err(IndexError::DuplicateName);
            }
            return self
                .zone
                .put_entry(&entry, key, record_page as u64, Some(name));
        }
        self.zone.put_entry(&entry, key, record_page as u64, None)
    }

    /// Pack the index into `pages` (one buffer per geometry index page).
    /// Returns the highest delta list number on each page, the bounds
    /// recorded by the index page map.
    pub fn pack(&self, nonce: u64, pages: &mut [Vec<u8>]) -> Result<Vec<u32>> {
        debug_assert_eq!(pages.len(), self.geometry.index_pages_per_chapter);
        let total_lists = self.geometry.delta_lists_per_chapter;
        let mut bounds = Vec::with_capacity(pages.len());
        let mut next_list = 0u32;
        for page in pages.iter_mut() {
            let packed = pack_page(
                &self.zone,
                next_list,
                total_lists - next_list,
                nonce,
                self.virtual_chapter,
                page,
            )?;
            next_list += packed;
            // A trailing empty page inherits the previous bound so a page
            // lookup never selects it.
            bounds.push(next_list - 1);
        }
        if next_list < total_lists {
            return Err(IndexError::Overflow);
        }
        Ok(bounds)
    }

    pub fn record_count(&self) -> u64 {
        self.zone.record_count()
    }
}

/// Lay records into a record page image.
pub fn fill_record_page(records: &[(RecordName, RecordData)], page: &mut [u8]) {
    page.fill(0);
    for (index, (name, data)) in records.iter().enumerate() {
        let at = index * VOLUME_RECORD_BYTES;
        page[at..at + RECORD_NAME_BYTES].copy_from_slice(name.as_bytes());
        page[at + RECORD_NAME_BYTES..at + VOLUME_RECORD_BYTES].copy_from_slice(data.as_bytes());
    }
}

/// Scan a record page for a name.
pub fn search_record_page(
    page: &[u8],
    records_per_page: usize,
    name: &RecordName,
) -> Option<RecordData> {
    for index in 0..records_per_page {
        let at = index * VOLUME_RECORD_BYTES;
        if at + VOLUME_RECORD_BYTES > page.len() {
            break;
        }
        if &page[at..at + RECORD_NAME_BYTES] == name.as_bytes() {
            let mut data = [0u8; 16];
            data.copy_from_slice(&page[at + RECORD_NAME_BYTES..at + VOLUME_RECORD_BYTES]);
            return Some(RecordData(data));
        }
    }
    None
}

/// An immutable chapter ready to be written to the volume.
pub struct ClosedChapter {
    pub virtual_chapter: VirtualChapter,
    pub index_pages: Vec<Vec<u8>>,
    pub record_pages: Vec<Vec<u8>>,
    pub index_page_bounds: Vec<u32>,
    pub record_count: usize,
}

/// Build a closed chapter from the merged records of every zone.
pub fn close_chapter(
    geometry: &Geometry,
    chapter_index: &mut ChapterIndex,
    nonce: u64,
    virtual_chapter: VirtualChapter,
    mut records: Vec<(RecordName, RecordData)>,
) -> Result<ClosedChapter> {
    if records.len() > geometry.records_per_chapter {
        return Err(IndexError::InvalidArgument(format!(
            "{} records exceed the {}-record chapter",
            records.len(),
            geometry.records_per_chapter
        )));
    }
    // Collate: records sorted by delta list land on record pages in index
    // page order, so one index page probe pins down one record page.
    records.sort_by_key(|(name, _)| geometry.chapter_delta_list(name));

    chapter_index.reset(virtual_chapter);
    for (index, (name, _)) in records.iter().enumerate() {
        let record_page = (index / geometry.records_per_page) as u32;
        chapter_index.put(name, record_page)?;
    }

    let mut index_pages =
        vec![vec![0u8; geometry.bytes_per_page]; geometry.index_pages_per_chapter];
    let index_page_bounds = chapter_index.pack(nonce, &mut index_pages)?;

    let mut record_pages =
        vec![vec![0u8; geometry.bytes_per_page]; geometry.record_pages_per_chapter];
    for (page_number, chunk) in records.chunks(geometry.records_per_page).enumerate() {
        fill_record_page(chunk, &mut record_pages[page_number]);
    }

    Ok(ClosedChapter {
        virtual_chapter,
        index_pages,
        record_pages,
        index_page_bounds,
        record_count: records.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{search_page, validate_page};

    const NONCE: u64 = 0x51c5_8d1d_c2ab_7e00;

    fn geometry() -> Geometry {
        Geometry::new(4096, 16, 8, 16, 0, 0).unwrap()
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

    #[test]
    fn test_close_chapter_indexes_every_record() {
        let geometry = geometry();
        let mut builder = ChapterIndex::new(geometry).unwrap();
        let records: Vec<(RecordName, RecordData)> = (0..geometry.records_per_chapter as u32)
            .map(|i| (name(i), RecordData([(i % 251) as u8; 16])))
            .collect();
        let chapter =
            close_chapter(&geometry, &mut builder, NONCE, 5, records.clone()).unwrap();
        assert_eq!(chapter.record_count, records.len());
        assert_eq!(chapter.index_pages.len(), geometry.index_pages_per_chapter);
        assert_eq!(chapter.record_pages.len(), geometry.record_pages_per_chapter);

        // Every record is findable: index page -> record page -> record
        let coding = geometry.chapter_coding();
        for (record_name, data) in &records {
            let list = geometry.chapter_delta_list(record_name);
            let page_number = chapter
                .index_page_bounds
                .iter()
                .position(|&bound| bound >= list)
                .unwrap();
            let page = &chapter.index_pages[page_number];
            let header = validate_page(page, NONCE).unwrap();
            let record_page = search_page(page, &header, &coding, list,
                geometry.chapter_key(record_name), record_name)
                .unwrap()
                .expect("record is indexed");
            let found = search_record_page(
                &chapter.record_pages[record_page as usize],
                geometry.records_per_page,
                record_name,
            );
            assert_eq!(found, Some(*data));
        }
    }

    #[test]
    fn test_partial_chapter_closes() {
        let geometry = geometry();
        let mut builder = ChapterIndex::new(geometry).unwrap();
        let records: Vec<(RecordName, RecordData)> =
            (0..7).map(|i| (name(i), RecordData([i as u8; 16]))).collect();
        let chapter = close_chapter(&geometry, &mut builder, NONCE, 0, records).unwrap();
        assert_eq!(chapter.record_count, 7);
        // All page images exist even when mostly empty
        assert_eq!(chapter.record_pages.len(), geometry.record_pages_per_chapter);
        for page in &chapter.index_pages {
            validate_page(page, NONCE).unwrap();
        }
    }

    #[test]
    fn test_record_page_round_trip() {
        let records: Vec<(RecordName, RecordData)> =
            (0..5).map(|i| (name(i), RecordData([i as u8; 16]))).collect();
        let mut page = vec![0u8; 4096];
        fill_record_page(&records, &mut page);
        for (n, d) in &records {
            assert_eq!(search_record_page(&page, 16, n), Some(*d));
        }
        assert_eq!(search_record_page(&page, 16, &name(99)), None);
    }
}
