// One sub-index of the volume index.
//
// A sub-index is a partitioned delta index mapping name bits to chapter
// payloads, plus a per-zone rolling chapter window. Payloads store only
// the low bits of the virtual chapter; the zone's open-chapter anchor
// reconstructs the full 64-bit value, and entries that decode below the
// window floor are stale. When a zone's anchor advances, that zone's
// lists are swept so stale entries cannot accumulate in delta memory.

use crate::common::{bits_to_represent, RecordName, VirtualChapter};
use crate::delta::zone::DeltaEntry;
use crate::delta::{DeltaIndex, DeltaIndexStats};
use crate::error::{IndexError, Result};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

// Target mean entries per volume index delta list
const RECORDS_PER_LIST: u64 = 256;

/// A volume index record: the result of a lookup, positioned for an
/// in-place update, insert, or removal on the same zone thread.
#[derive(Debug, Clone, Copy)]
pub struct VolumeIndexRecord {
    pub found: bool,
    pub virtual_chapter: VirtualChapter,
    pub is_collision: bool,
    pub(crate) zone_number: usize,
    pub(crate) key: u32,
    pub(crate) entry: DeltaEntry,
    pub(crate) name: RecordName,
}

pub struct VolumeSubIndex {
    delta_index: DeltaIndex,
    list_count: u32,
    key_bits: u32,
    chapter_mask: u64,
    window: u64,
    capacity: u64,
    // Per-zone open chapter anchors, read locklessly by decode paths
    open_chapters: Vec<CachePadded<AtomicU64>>,
}

impl VolumeSubIndex {
    /// `capacity` is the number of live records the sub-index must hold;
    /// `window` is how many chapters (including the open one) its payloads
    /// must distinguish.
    pub fn new(
        zone_count: usize,
        capacity: u64,
        window: u64,
        mean_delta: u32,
    ) -> Result<Self> {
        if window == 0 {
            return Err(IndexError::InvalidArgument(
                "volume sub-index window must cover the open chapter".to_string(),
            ));
        }
        let list_count = (capacity / RECORDS_PER_LIST).max(zone_count as u64).max(1) as u32;
        let key_bits = bits_to_represent(mean_delta as u64 * RECORDS_PER_LIST - 1);
        if key_bits > 48 {
            return Err(IndexError::InvalidArgument(format!(
                "volume index key width {} leaves no list-selection bits",
                key_bits
            )));
        }
        let chapter_bits = bits_to_represent(window);
        let delta_index =
            DeltaIndex::new(zone_count, list_count, mean_delta, chapter_bits, capacity)?;
        Ok(Self {
            delta_index,
            list_count,
            key_bits,
            chapter_mask: (1u64 << chapter_bits) - 1,
            window,
            capacity,
            open_chapters: (0..zone_count)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        })
    }

    /// Replace this sub-index's lists with saved zone streams. The saved
    /// zone count may differ from the running one; lists are re-zoned.
    pub fn restore<R: std::io::Read>(&mut self, sources: &mut [R]) -> Result<()> {
        let restored = DeltaIndex::restore(
            sources,
            self.delta_index.zone_count(),
            self.delta_index.mean_delta(),
            self.delta_index.value_bits(),
            self.capacity,
        )?;
        if restored.list_count() != self.list_count {
            return Err(IndexError::CorruptData(format!(
                "saved volume index has {} lists, this geometry needs {}",
                restored.list_count(),
                self.list_count
            )));
        }
        self.delta_index = restored;
        Ok(())
    }

    #[inline]
    fn list_of(&self, name: &RecordName) -> u32 {
        ((name.volume_index_bits() >> self.key_bits) % self.list_count as u64) as u32
    }

    #[inline]
    fn key_of(&self, name: &RecordName) -> u32 {
        (name.volume_index_bits() & ((1u64 << self.key_bits) - 1)) as u32
    }

    #[inline]
    pub fn zone_of(&self, name: &RecordName) -> usize {
        self.delta_index.zone_for_list(self.list_of(name)).0
    }

    #[inline]
    fn window_floor(&self, open_chapter: VirtualChapter) -> VirtualChapter {
        (open_chapter + 1).saturating_sub(self.window)
    }

    #[inline]
    fn encode_chapter(&self, chapter: VirtualChapter) -> u64 {
        chapter & self.chapter_mask
    }

    fn decode_chapter(
        &self,
        stored: u64,
        open_chapter: VirtualChapter,
    ) -> Option<VirtualChapter> {
        let chapter = open_chapter.wrapping_sub(open_chapter.wrapping_sub(stored) & self.chapter_mask);
        (chapter <= open_chapter && chapter >= self.window_floor(open_chapter)).then_some(chapter)
    }

    /// Read-only probe, usable from any thread.
    pub fn lookup(&self, name: &RecordName) -> Result<Option<VirtualChapter>> {
        let list = self.list_of(name);
        let key = self.key_of(name);
        let (zone_number, local) = self.delta_index.zone_for_list(list);
        let zone = self.delta_index.zone(zone_number).read();
        let (entry, found) = zone.search_name_readonly(local, key, name)?;
        if !found {
            return Ok(None);
        }
        let open = self.open_chapters[zone_number].load(Ordering::Acquire);
        Ok(self.decode_chapter(zone.entry_value(&entry), open))
    }

    /// Locate a record for a subsequent in-place operation. Must be used
    /// from the zone thread that owns the name's zone; the returned
    /// cursor is valid until the next mutation of that zone.
    pub fn get_record(&self, name: &RecordName) -> Result<VolumeIndexRecord> {
        let list = self.list_of(name);
        let key = self.key_of(name);
        let (zone_number, local) = self.delta_index.zone_for_list(list);
        let mut zone = self.delta_index.zone(zone_number).write();
        let (entry, key_found) = zone.search_name(local, key, name)?;
        let mut record = VolumeIndexRecord {
            found: false,
            virtual_chapter: 0,
            is_collision: false,
            zone_number,
            key,
            entry,
            name: *name,
        };
        if key_found {
            let open = self.open_chapters[zone_number].load(Ordering::Acquire);
            if let Some(chapter) = self.decode_chapter(zone.entry_value(&entry), open) {
                record.found = true;
                record.virtual_chapter = chapter;
                record.is_collision = entry.is_collision;
            }
            // A stale entry stays addressable through the cursor so a put
            // can reuse it in place instead of inserting a collision.
        }
        Ok(record)
    }

    /// Create an entry for the record's name, or overwrite the reusable
    /// entry its lookup landed on.
    pub fn put_record(&self, record: &VolumeIndexRecord, chapter: VirtualChapter) -> Result<()> {
        let mut zone = self.delta_index.zone(record.zone_number).write();
        let payload = self.encode_chapter(chapter);
        if record.found {
            if record.is_collision {
                return Err(IndexError::DuplicateName);
            }
            // The key is taken by a live entry for some other name; the
            // new record becomes a collision entry carrying the name.
            zone.put_entry(&record.entry, record.key, payload, Some(&record.name))?;
            return Ok(());
        }
        if !record.entry.at_end && record.entry.key == record.key {
            // Stale entry with the same key: reuse it in place
            zone.set_entry_value(&record.entry, payload);
            return Ok(());
        }
        zone.put_entry(&record.entry, record.key, payload, None)
    }

    /// Replace the chapter of an existing entry.
    pub fn set_record_chapter(
        &self,
        record: &VolumeIndexRecord,
        chapter: VirtualChapter,
    ) -> Result<()> {
        if !record.found {
            return Err(IndexError::BadState(
                "set_record_chapter requires a found record".to_string(),
            ));
        }
        let mut zone = self.delta_index.zone(record.zone_number).write();
        zone.set_entry_value(&record.entry, self.encode_chapter(chapter));
        Ok(())
    }

    /// Delete an existing entry.
    pub fn remove_record(&self, record: &VolumeIndexRecord) -> Result<()> {
        if !record.found {
            return Err(IndexError::BadState(
                "remove_record requires a found record".to_string(),
            ));
        }
        let mut zone = self.delta_index.zone(record.zone_number).write();
        zone.remove_entry(&record.entry)
    }

    /// Advance a zone's open-chapter anchor. Entries now below the window
    /// floor become unreadable immediately and are swept out of the
    /// zone's delta memory.
    pub fn set_zone_open_chapter(&self, zone_number: usize, chapter: VirtualChapter) -> Result<()> {
        let previous = self.open_chapters[zone_number].swap(chapter, Ordering::AcqRel);
        if self.window_floor(chapter) > self.window_floor(previous) {
            self.sweep_zone(zone_number, chapter)?;
        }
        Ok(())
    }

    // Rebuild each list of the zone without its stale entries. Surviving
    // collisions whose address entry was swept are promoted, dropping
    // their name extension, exactly as removal would.
    fn sweep_zone(&self, zone_number: usize, open_chapter: VirtualChapter) -> Result<()> {
        let mut zone = self.delta_index.zone(zone_number).write();
        let coding = *zone.coding();
        for local in 1..=zone.list_count() {
            let mut survivors: Vec<(u32, u64, Option<RecordName>)> = Vec::new();
            let mut records = 0u64;
            let mut collisions = 0u64;
            let mut stale = 0u64;
            let list_start = zone.list_start(local);
            let mut entry = DeltaEntry::before(local, zone.list_bits(local), 0, 0);
            loop {
                entry.next(zone.memory(), &coding, list_start)?;
                if entry.at_end {
                    break;
                }
                records += 1;
                if entry.is_collision {
                    collisions += 1;
                }
                let payload = entry.value(zone.memory(), &coding, list_start);
                if self.decode_chapter(payload, open_chapter).is_none() {
                    stale += 1;
                    continue;
                }
                let name = entry
                    .is_collision
                    .then(|| zone.entry_name(&entry));
                survivors.push((entry.key, payload, name));
            }
            if stale == 0 {
                continue;
            }
            zone.clear_list(local, records, collisions)?;
            let mut previous_key = None;
            for (key, payload, name) in survivors {
                let (entry, found) = match name.as_ref() {
                    Some(name) => zone.search_name(local, key, name)?,
                    None => (zone.start_search(local, key)?, false),
                };
                if found && previous_key == Some(key) {
                    let name = name.unwrap_or(RecordName([0u8; 32]));
                    zone.put_entry(&entry, key, payload, Some(&name))?;
                } else {
                    zone.put_entry(&entry, key, payload, None)?;
                }
                previous_key = Some(key);
            }
        }
        Ok(())
    }

    #[inline]
    pub fn zone_open_chapter(&self, zone_number: usize) -> VirtualChapter {
        self.open_chapters[zone_number].load(Ordering::Acquire)
    }

    #[inline]
    pub fn delta_index(&self) -> &DeltaIndex {
        &self.delta_index
    }

    pub fn stats(&self) -> DeltaIndexStats {
        self.delta_index.stats()
    }
}
