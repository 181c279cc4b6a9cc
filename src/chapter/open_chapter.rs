// The in-memory open chapter of one zone.
//
// Records append to a 1-based array; a power-of-two open-addressing hash
// table maps name slots to record numbers. Deletion leaves a tombstone in
// the record (the hash slot is kept), so re-posting a deleted name reuses
// its record number and the chapter's size does not change.

use crate::common::{RecordData, RecordName};
use crate::error::{IndexError, Result};

// Hash table load factor bound (slots >= capacity * 10/7)
const SLOT_NUMERATOR: usize = 10;
const SLOT_DENOMINATOR: usize = 7;

#[derive(Clone)]
struct OpenChapterRecord {
    name: RecordName,
    data: RecordData,
    deleted: bool,
}

pub struct OpenChapter {
    capacity: usize,
    slot_mask: usize,
    slots: Vec<u32>,
    records: Vec<OpenChapterRecord>,
    size: usize,
    deletions: usize,
}

#[inline]
fn slot_hash(name: &RecordName) -> usize {
    let bytes = name.as_bytes();
    let mut hash = 0u64;
    for chunk in bytes.chunks(8) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        hash = hash.rotate_left(23) ^ u64::from_le_bytes(word);
    }
    hash as usize
}

impl OpenChapter {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        let slot_count = (capacity * SLOT_NUMERATOR / SLOT_DENOMINATOR + 1).next_power_of_two();
        Self {
            capacity,
            slot_mask: slot_count - 1,
            slots: vec![0u32; slot_count],
            records: Vec::with_capacity(capacity + 1),
            size: 0,
            deletions: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record slots in use, tombstones included
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Live records
    #[inline]
    pub fn record_count(&self) -> usize {
        self.size - self.deletions
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    // Find the hash slot holding `name`, or the empty slot where it would
    // be inserted.
    fn probe(&self, name: &RecordName) -> usize {
        let mut slot = slot_hash(name) & self.slot_mask;
        loop {
            let record_number = self.slots[slot];
            if record_number == 0 {
                return slot;
            }
            if self.records[record_number as usize - 1].name == *name {
                return slot;
            }
            slot = (slot + 1) & self.slot_mask;
        }
    }

    /// Add or refresh a record, returning the remaining capacity. Zero
    /// means the caller must close the chapter.
    pub fn put(&mut self, name: &RecordName, data: &RecordData) -> Result<usize> {
        let slot = self.probe(name);
        let record_number = self.slots[slot];
        if record_number != 0 {
            let record = &mut self.records[record_number as usize - 1];
            if record.deleted {
                record.deleted = false;
                self.deletions -= 1;
            }
            record.data = *data;
            return Ok(self.capacity - self.size);
        }
        if self.is_full() {
            return Err(IndexError::BadState(
                "open chapter is full".to_string(),
            ));
        }
        self.records.push(OpenChapterRecord {
            name: *name,
            data: *data,
            deleted: false,
        });
        self.size += 1;
        self.slots[slot] = self.size as u32;
        Ok(self.capacity - self.size)
    }

    pub fn get(&self, name: &RecordName) -> Option<RecordData> {
        let slot = self.probe(name);
        let record_number = self.slots[slot];
        if record_number == 0 {
            return None;
        }
        let record = &self.records[record_number as usize - 1];
        (!record.deleted).then_some(record.data)
    }

    /// Tombstone a record. The hash slot and record number stay claimed
    /// so a later put of the same name reuses them.
    pub fn remove(&mut self, name: &RecordName) -> bool {
        let slot = self.probe(name);
        let record_number = self.slots[slot];
        if record_number == 0 {
            return false;
        }
        let record = &mut self.records[record_number as usize - 1];
        if record.deleted {
            return false;
        }
        record.deleted = true;
        self.deletions += 1;
        true
    }

    /// Live records in append order.
    pub fn records(&self) -> impl Iterator<Item = (&RecordName, &RecordData)> {
        self.records
            .iter()
            .filter(|record| !record.deleted)
            .map(|record| (&record.name, &record.data))
    }

    pub fn reset(&mut self) {
        self.slots.fill(0);
        self.records.clear();
        self.size = 0;
        self.deletions = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(seed: u8) -> RecordName {
        let mut bytes = [seed; 32];
        bytes[0] = seed.wrapping_mul(37);
        RecordName(bytes)
    }

    #[test]
    fn test_put_get_counts_down() {
        let mut chapter = OpenChapter::new(4);
        assert_eq!(chapter.put(&name(1), &RecordData([1; 16])).unwrap(), 3);
        assert_eq!(chapter.put(&name(2), &RecordData([2; 16])).unwrap(), 2);
        assert_eq!(chapter.get(&name(1)), Some(RecordData([1; 16])));
        assert_eq!(chapter.get(&name(3)), None);
    }

    #[test]
    fn test_duplicate_put_updates_in_place() {
        let mut chapter = OpenChapter::new(4);
        chapter.put(&name(1), &RecordData([1; 16])).unwrap();
        let remaining = chapter.put(&name(1), &RecordData([9; 16])).unwrap();
        assert_eq!(remaining, 3);
        assert_eq!(chapter.size(), 1);
        assert_eq!(chapter.get(&name(1)), Some(RecordData([9; 16])));
    }

    #[test]
    fn test_tombstone_reuse() {
        let mut chapter = OpenChapter::new(4);
        chapter.put(&name(1), &RecordData([1; 16])).unwrap();
        chapter.put(&name(2), &RecordData([2; 16])).unwrap();
        assert!(chapter.remove(&name(1)));
        assert_eq!(chapter.get(&name(1)), None);
        assert_eq!(chapter.size(), 2);
        assert_eq!(chapter.record_count(), 1);

        // Re-posting the deleted name reuses the tombstoned record; size
        // is unchanged.
        let remaining = chapter.put(&name(1), &RecordData([7; 16])).unwrap();
        assert_eq!(remaining, 2);
        assert_eq!(chapter.size(), 2);
        assert_eq!(chapter.record_count(), 2);
        assert_eq!(chapter.get(&name(1)), Some(RecordData([7; 16])));
    }

    #[test]
    fn test_fills_to_capacity() {
        let mut chapter = OpenChapter::new(8);
        for i in 0..8u8 {
            let remaining = chapter.put(&name(i), &RecordData([i; 16])).unwrap();
            assert_eq!(remaining, 7 - i as usize);
        }
        assert!(chapter.is_full());
        assert!(chapter.put(&name(100), &RecordData([0; 16])).is_err());
        // A name already present still updates when full
        chapter.put(&name(3), &RecordData([0xee; 16])).unwrap();
    }

    #[test]
    fn test_reset() {
        let mut chapter = OpenChapter::new(4);
        chapter.put(&name(1), &RecordData([1; 16])).unwrap();
        chapter.remove(&name(1));
        chapter.reset();
        assert_eq!(chapter.size(), 0);
        assert_eq!(chapter.record_count(), 0);
        assert_eq!(chapter.get(&name(1)), None);
        assert_eq!(chapter.records().count(), 0);
    }
}
