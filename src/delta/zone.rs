// Mutable delta zone.
//
// A zone is one contiguous byte buffer holding a contiguous range of
// delta lists, framed by two sentinel lists: a zero-length head guard and
// a tail guard of all-ones bits that terminates any decoder that scans
// past the last real list. Lists are indexed 1..=list_count within the
// zone. List starts are absolute bit offsets; they move when lists grow,
// shrink, or the zone rebalances, so a `DeltaEntry` cursor stores only
// offsets relative to its list and is valid only until the next mutation
// of the zone.

use super::bits::{
    clear_bits, copy_bits, get_bits, move_bits, set_bits, set_ones, GUARD_BITS, MAX_LIST_BITS,
};
use super::codec::{DeltaCoding, COLLISION_BITS};
use crate::common::{RecordName, RECORD_NAME_BYTES};
use crate::error::{IndexError, Result};

// Headroom applied when sizing zone memory from an expected record count
const MEMORY_SLACK_NUMERATOR: u64 = 6;
const MEMORY_SLACK_DENOMINATOR: u64 = 5;

// Refuse absurd allocations instead of letting Vec abort
const MAX_ZONE_MEMORY_BYTES: u64 = 1 << 40;

/// Per-list bookkeeping. `save_offset`/`save_key` remember where the last
/// search ended so a later search for a larger key can resume mid-list.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaList {
    pub(crate) start: u64,
    pub(crate) size: u32,
    save_offset: u32,
    save_key: u32,
}

/// Cursor over the entries of one delta list.
///
/// `offset` is the bit offset of the current entry relative to the list
/// start; `key` is the cumulative key including the current entry's
/// delta. A freshly started cursor has no current entry until the first
/// `next` call.
#[derive(Debug, Clone, Copy)]
pub struct DeltaEntry {
    pub list_index: u32,
    pub offset: u32,
    pub entry_bits: u32,
    pub key: u32,
    pub delta: u32,
    pub is_collision: bool,
    pub at_end: bool,
    list_size: u32,
}

impl DeltaEntry {
    pub(crate) fn before(list_index: u32, list_size: u32, offset: u32, base_key: u32) -> Self {
        Self {
            list_index,
            offset,
            entry_bits: 0,
            key: base_key,
            delta: 0,
            is_collision: false,
            at_end: offset >= list_size,
            list_size,
        }
    }

    /// Advance to and decode the next entry.
    pub(crate) fn next(
        &mut self,
        memory: &[u8],
        coding: &DeltaCoding,
        list_start: u64,
    ) -> Result<()> {
        if self.at_end {
            return Ok(());
        }
        let offset = self.offset + self.entry_bits;
        if offset == self.list_size {
            self.offset = offset;
            self.entry_bits = 0;
            self.at_end = true;
            return Ok(());
        }
        if offset > self.list_size {
            return Err(IndexError::CorruptData(format!(
                "delta entry at bit {} runs past list size {}",
                self.offset, self.list_size
            )));
        }
        let (delta, delta_width) =
            coding.decode_delta(memory, list_start + offset as u64 + coding.value_bits as u64);
        self.is_collision = delta == 0 && offset != 0;
        let extension = if self.is_collision { COLLISION_BITS } else { 0 };
        self.offset = offset;
        self.entry_bits = coding.value_bits + delta_width + extension;
        self.delta = delta;
        self.key += delta;
        if self.offset + self.entry_bits > self.list_size {
            return Err(IndexError::CorruptData(format!(
                "delta entry at bit {} runs past list size {}",
                self.offset, self.list_size
            )));
        }
        Ok(())
    }

    pub(crate) fn value(&self, memory: &[u8], coding: &DeltaCoding, list_start: u64) -> u64 {
        get_bits(memory, list_start + self.offset as u64, coding.value_bits)
    }

    fn extension_offset(&self, coding: &DeltaCoding, list_start: u64) -> u64 {
        debug_assert!(self.is_collision);
        let _ = coding;
        list_start + (self.offset + self.entry_bits - COLLISION_BITS) as u64
    }

    pub(crate) fn name_matches(
        &self,
        memory: &[u8],
        coding: &DeltaCoding,
        list_start: u64,
        name: &RecordName,
    ) -> bool {
        let at = self.extension_offset(coding, list_start);
        for (index, chunk) in name.as_bytes().chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word.copy_from_slice(chunk);
            let expected = u32::from_le_bytes(word) as u64;
            if get_bits(memory, at + (index as u64) * 32, 32) != expected {
                return false;
            }
        }
        true
    }
}

fn write_name(memory: &mut [u8], at: u64, name: &RecordName) {
    for (index, chunk) in name.as_bytes().chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        set_bits(memory, at + (index as u64) * 32, 32, u32::from_le_bytes(word) as u64);
    }
}

fn read_name(memory: &[u8], at: u64) -> RecordName {
    let mut bytes = [0u8; RECORD_NAME_BYTES];
    for index in 0..RECORD_NAME_BYTES / 4 {
        let word = get_bits(memory, at + (index as u64) * 32, 32) as u32;
        bytes[index * 4..index * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    RecordName::from_bytes(bytes)
}

/// Walk a list image, positioning at the first entry with key >= `key`
/// and resolving collision entries against `name`. Shared by the mutable
/// zone and the immutable page reader.
pub(crate) fn search_list(
    memory: &[u8],
    coding: &DeltaCoding,
    list_index: u32,
    list_start: u64,
    list_size: u32,
    key: u32,
    name: &RecordName,
) -> Result<(DeltaEntry, bool)> {
    search_list_from(memory, coding, list_index, list_start, list_size, 0, 0, key, name)
}

#[allow(clippy::too_many_arguments)]
fn search_list_from(
    memory: &[u8],
    coding: &DeltaCoding,
    list_index: u32,
    list_start: u64,
    list_size: u32,
    start_offset: u32,
    base_key: u32,
    key: u32,
    name: &RecordName,
) -> Result<(DeltaEntry, bool)> {
    let mut entry = DeltaEntry::before(list_index, list_size, start_offset, base_key);
    loop {
        entry.next(memory, coding, list_start)?;
        if entry.at_end || entry.key >= key {
            break;
        }
    }
    if entry.at_end || entry.key != key {
        // Not present; the cursor is the insertion position for `key`.
        return Ok((entry, false));
    }
    let address_entry = entry;
    let mut walker = entry;
    loop {
        let mut next = walker;
        next.next(memory, coding, list_start)?;
        if next.at_end || next.key != key {
            break;
        }
        if next.is_collision && next.name_matches(memory, coding, list_start, name) {
            return Ok((next, true));
        }
        walker = next;
    }
    Ok((address_entry, true))
}

/// Compute the zone memory size for an expected record load.
pub fn zone_memory_size(records: u64, coding: &DeltaCoding, list_count: u32) -> Result<usize> {
    let entry_bits = records * coding.mean_entry_bits() as u64;
    let per_list_slack = (list_count as u64 + 2) * 64;
    let bits =
        entry_bits * MEMORY_SLACK_NUMERATOR / MEMORY_SLACK_DENOMINATOR + per_list_slack + GUARD_BITS;
    let bytes = bits / 8 + 8;
    if bytes > MAX_ZONE_MEMORY_BYTES {
        return Err(IndexError::OutOfMemory(format!(
            "delta zone of {} bytes exceeds the addressable limit",
            bytes
        )));
    }
    Ok(bytes as usize)
}

#[derive(Debug)]
pub struct DeltaZone {
    memory: Vec<u8>,
    lists: Vec<DeltaList>,
    first_list: u32,
    list_count: u32,
    coding: DeltaCoding,
    record_count: u64,
    collision_count: u64,
    overflow_count: u64,
    rebalance_count: u64,
    new_offsets: Vec<u64>,
}

impl DeltaZone {
    pub fn new(
        first_list: u32,
        list_count: u32,
        mean_delta: u32,
        value_bits: u32,
        memory_bytes: usize,
    ) -> Result<Self> {
        let coding = DeltaCoding::new(mean_delta, value_bits);
        let minimum = (GUARD_BITS / 8) as usize + (list_count as usize + 2) * 8;
        if list_count == 0 || memory_bytes < minimum {
            return Err(IndexError::InvalidArgument(format!(
                "delta zone needs at least {} bytes for {} lists",
                minimum, list_count
            )));
        }
        let mut zone = Self {
            memory: vec![0u8; memory_bytes],
            lists: vec![DeltaList::default(); list_count as usize + 2],
            first_list,
            list_count,
            coding,
            record_count: 0,
            collision_count: 0,
            overflow_count: 0,
            rebalance_count: 0,
            new_offsets: vec![0u64; list_count as usize + 2],
        };
        zone.initialize_layout();
        Ok(zone)
    }

    fn initialize_layout(&mut self) {
        let memory_bits = (self.memory.len() as u64) * 8;
        let tail = self.lists.len() - 1;
        self.lists[0] = DeltaList::default();
        self.lists[tail] = DeltaList {
            start: memory_bits - GUARD_BITS,
            size: GUARD_BITS as u32,
            save_offset: 0,
            save_key: 0,
        };
        set_ones(&mut self.memory, memory_bits - GUARD_BITS, GUARD_BITS);
        let spacing = (memory_bits - GUARD_BITS) / (self.list_count as u64 + 1);
        let mut offset = 0;
        for index in 1..=self.list_count as usize {
            offset += spacing;
            self.lists[index] = DeltaList {
                start: offset,
                size: 0,
                save_offset: 0,
                save_key: 0,
            };
        }
    }

    /// Drop every entry, keeping the zone's memory and list framing.
    pub fn reset(&mut self) {
        self.memory.fill(0);
        self.record_count = 0;
        self.collision_count = 0;
        self.overflow_count = 0;
        self.rebalance_count = 0;
        self.initialize_layout();
    }

    #[inline]
    pub fn coding(&self) -> &DeltaCoding {
        &self.coding
    }

    #[inline]
    pub fn first_list(&self) -> u32 {
        self.first_list
    }

    #[inline]
    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    #[inline]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    #[inline]
    pub fn collision_count(&self) -> u64 {
        self.collision_count
    }

    #[inline]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    #[inline]
    pub fn rebalance_count(&self) -> u64 {
        self.rebalance_count
    }

    #[inline]
    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub(crate) fn memory(&self) -> &[u8] {
        &self.memory
    }

    #[inline]
    pub fn list_bits(&self, list_index: u32) -> u32 {
        self.lists[list_index as usize].size
    }

    #[inline]
    pub(crate) fn list_start(&self, list_index: u32) -> u64 {
        self.lists[list_index as usize].start
    }

    fn check_list_index(&self, list_index: u32) -> Result<()> {
        if list_index == 0 || list_index > self.list_count {
            return Err(IndexError::InvalidArgument(format!(
                "delta list {} out of range 1..={}",
                list_index, self.list_count
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Position a cursor at the first entry whose key is >= `key`, or at
    /// the end of the list. The list's saved search position is used when
    /// it cannot skip a matching entry, and updated for the next search.
    pub fn start_search(&mut self, list_index: u32, key: u32) -> Result<DeltaEntry> {
        self.check_list_index(list_index)?;
        let list = self.lists[list_index as usize];
        let (offset, base_key) = self.resume_point(&list, key);
        let mut entry = DeltaEntry::before(list_index, list.size, offset, base_key);
        loop {
            entry.next(&self.memory, &self.coding, list.start)?;
            if entry.at_end || entry.key >= key {
                break;
            }
        }
        self.update_save_position(list_index, &entry);
        Ok(entry)
    }

    /// Search for `key`, resolving collision entries against `name`.
    ///
    /// Returns the cursor and whether a matching entry was found. When
    /// found, the cursor sits on the exact collision entry if one matched
    /// by name, otherwise on the key's address entry. When not found, the
    /// cursor is the insertion position for `key`.
    pub fn search_name(
        &mut self,
        list_index: u32,
        key: u32,
        name: &RecordName,
    ) -> Result<(DeltaEntry, bool)> {
        self.check_list_index(list_index)?;
        let list = self.lists[list_index as usize];
        let (offset, base_key) = self.resume_point(&list, key);
        let (entry, found) = search_list_from(
            &self.memory,
            &self.coding,
            list_index,
            list.start,
            list.size,
            offset,
            base_key,
            key,
            name,
        )?;
        self.update_save_position(list_index, &entry);
        Ok((entry, found))
    }

    /// Search without touching the saved search position, so concurrent
    /// readers holding only a shared reference can probe the zone.
    pub fn search_name_readonly(
        &self,
        list_index: u32,
        key: u32,
        name: &RecordName,
    ) -> Result<(DeltaEntry, bool)> {
        self.check_list_index(list_index)?;
        let list = self.lists[list_index as usize];
        search_list(&self.memory, &self.coding, list_index, list.start, list.size, key, name)
    }

    fn resume_point(&self, list: &DeltaList, key: u32) -> (u32, u32) {
        if list.save_key < key && list.save_offset <= list.size {
            (list.save_offset, list.save_key)
        } else {
            (0, 0)
        }
    }

    fn update_save_position(&mut self, list_index: u32, entry: &DeltaEntry) {
        let stored = &mut self.lists[list_index as usize];
        stored.save_offset = entry.offset;
        stored.save_key = if entry.at_end {
            entry.key
        } else {
            entry.key - entry.delta
        };
    }

    /// Read the payload of the entry under the cursor.
    pub fn entry_value(&self, entry: &DeltaEntry) -> u64 {
        entry.value(&self.memory, &self.coding, self.lists[entry.list_index as usize].start)
    }

    /// Overwrite the payload of the entry under the cursor in place.
    pub fn set_entry_value(&mut self, entry: &DeltaEntry, value: u64) {
        let start = self.lists[entry.list_index as usize].start;
        set_bits(
            &mut self.memory,
            start + entry.offset as u64,
            self.coding.value_bits,
            value,
        );
    }

    /// Read the full name carried by a collision entry.
    pub fn entry_name(&self, entry: &DeltaEntry) -> RecordName {
        let start = self.lists[entry.list_index as usize].start;
        read_name(&self.memory, entry.extension_offset(&self.coding, start))
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Insert a new entry at the position the cursor came to rest.
    ///
    /// With `collision_name` set, the cursor must sit on an entry with the
    /// same key and the new entry is written as a collision carrying the
    /// full name. Otherwise the cursor must be an insertion position (at
    /// end, or on the first entry with a larger key).
    pub fn put_entry(
        &mut self,
        entry: &DeltaEntry,
        key: u32,
        value: u64,
        collision_name: Option<&RecordName>,
    ) -> Result<()> {
        self.check_list_index(entry.list_index)?;
        if let Some(name) = collision_name {
            if entry.at_end || entry.key != key {
                return Err(IndexError::BadState(
                    "collision insert requires an entry with the same key".to_string(),
                ));
            }
            self.put_collision(entry, value, name)
        } else {
            if !entry.at_end && entry.key < key {
                return Err(IndexError::BadState(
                    "insert position cursor is before the target key".to_string(),
                ));
            }
            self.put_plain(entry, key, value)
        }
    }

    fn put_plain(&mut self, entry: &DeltaEntry, key: u32, value: u64) -> Result<()> {
        let list_index = entry.list_index;
        let base_key = if entry.at_end {
            entry.key
        } else {
            entry.key - entry.delta
        };
        let new_delta = key - base_key;
        let new_bits = self.coding.entry_bits(new_delta, false);

        // The entry after the insertion point keeps its key, so its delta
        // shrinks by the new entry's delta and may change width. Capture
        // its payload (and name, if it is a collision) before resizing.
        let (old_region, new_region, successor) = if entry.at_end {
            (0u32, new_bits, None)
        } else {
            let list_start = self.lists[list_index as usize].start;
            let succ_value = entry.value(&self.memory, &self.coding, list_start);
            let succ_name = if entry.is_collision {
                Some(read_name(
                    &self.memory,
                    entry.extension_offset(&self.coding, list_start),
                ))
            } else {
                None
            };
            let succ_delta = entry.key - key;
            let succ_bits = self.coding.entry_bits(succ_delta, entry.is_collision);
            (
                entry.entry_bits,
                new_bits + succ_bits,
                Some((succ_value, succ_delta, succ_name)),
            )
        };
        self.resize_list(list_index, entry.offset, old_region, new_region)?;

        let list_start = self.lists[list_index as usize].start;
        let mut at = list_start + entry.offset as u64;
        at += self.write_entry(at, value, new_delta, None);
        if let Some((succ_value, succ_delta, succ_name)) = successor {
            self.write_entry(at, succ_value, succ_delta, succ_name.as_ref());
        }
        self.record_count += 1;
        Ok(())
    }

    fn put_collision(&mut self, entry: &DeltaEntry, value: u64, name: &RecordName) -> Result<()> {
        let list_index = entry.list_index;
        let offset = entry.offset + entry.entry_bits;
        let bits = self.coding.entry_bits(0, true);
        self.resize_list(list_index, offset, 0, bits)?;
        let list_start = self.lists[list_index as usize].start;
        self.write_entry(list_start + offset as u64, value, 0, Some(name));
        self.record_count += 1;
        self.collision_count += 1;
        Ok(())
    }

    fn write_entry(&mut self, at: u64, value: u64, delta: u32, name: Option<&RecordName>) -> u64 {
        set_bits(&mut self.memory, at, self.coding.value_bits, value);
        let delta_width = self
            .coding
            .encode_delta(&mut self.memory, at + self.coding.value_bits as u64, delta);
        let mut written = (self.coding.value_bits + delta_width) as u64;
        if let Some(name) = name {
            write_name(&mut self.memory, at + written, name);
            written += COLLISION_BITS as u64;
        }
        written
    }

    /// Remove the entry under the cursor.
    pub fn remove_entry(&mut self, entry: &DeltaEntry) -> Result<()> {
        self.check_list_index(entry.list_index)?;
        if entry.at_end || entry.entry_bits == 0 {
            return Err(IndexError::BadState(
                "remove requires a cursor on a decoded entry".to_string(),
            ));
        }
        let list_index = entry.list_index;
        let list = self.lists[list_index as usize];

        if entry.is_collision {
            self.resize_list(list_index, entry.offset, entry.entry_bits, 0)?;
            self.record_count -= 1;
            self.collision_count -= 1;
            return Ok(());
        }

        let next_offset = entry.offset + entry.entry_bits;
        if next_offset >= list.size {
            // Last entry of the list
            self.resize_list(list_index, entry.offset, entry.entry_bits, 0)?;
            self.record_count -= 1;
            return Ok(());
        }

        let mut successor = *entry;
        successor.next(&self.memory, &self.coding, list.start)?;
        let succ_value = successor.value(&self.memory, &self.coding, list.start);
        if successor.is_collision {
            // The first collision of the removed key is promoted to the
            // key's address entry; it keeps the key via the removed delta
            // and sheds its name extension.
            let promoted_bits = self.coding.entry_bits(entry.delta, false);
            let old_region = entry.entry_bits + successor.entry_bits;
            self.resize_list(list_index, entry.offset, old_region, promoted_bits)?;
            let list_start = self.lists[list_index as usize].start;
            self.write_entry(list_start + entry.offset as u64, succ_value, entry.delta, None);
            self.record_count -= 1;
            self.collision_count -= 1;
            return Ok(());
        }

        // Merge the removed delta into the successor
        let merged_delta = successor.delta + entry.delta;
        let merged_bits = self.coding.entry_bits(merged_delta, false);
        let old_region = entry.entry_bits + successor.entry_bits;
        self.resize_list(list_index, entry.offset, old_region, merged_bits)?;
        let list_start = self.lists[list_index as usize].start;
        self.write_entry(list_start + entry.offset as u64, succ_value, merged_delta, None);
        self.record_count -= 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Space management
    // ------------------------------------------------------------------

    /// Replace `old_bits` at `offset` within the list with room for
    /// `new_bits`, growing or shrinking as needed.
    fn resize_list(
        &mut self,
        list_index: u32,
        offset: u32,
        old_bits: u32,
        new_bits: u32,
    ) -> Result<()> {
        if new_bits > old_bits {
            self.open_gap(list_index, offset + old_bits, new_bits - old_bits)
        } else if old_bits > new_bits {
            self.close_gap(list_index, offset + new_bits, old_bits - new_bits);
            Ok(())
        } else {
            Ok(())
        }
    }

    fn open_gap(&mut self, list_index: u32, offset: u32, count: u32) -> Result<()> {
        let index = list_index as usize;
        let size = self.lists[index].size;
        if size as u64 + count as u64 > MAX_LIST_BITS {
            self.overflow_count += 1;
            return Err(IndexError::Overflow);
        }

        if !self.try_shift(index, offset, count) {
            self.rebalance(list_index, count as u64)?;
            if !self.try_shift(index, offset, count) {
                self.overflow_count += 1;
                return Err(IndexError::Overflow);
            }
        }
        let list = &mut self.lists[index];
        list.size += count;
        list.save_offset = 0;
        list.save_key = 0;
        Ok(())
    }

    // Grow by shifting the smaller side of the insertion point into an
    // adjacent gap; false if neither gap can absorb the growth.
    fn try_shift(&mut self, index: usize, offset: u32, count: u32) -> bool {
        let prev = self.lists[index - 1];
        let list = self.lists[index];
        let next = self.lists[index + 1];
        let before_gap = list.start - (prev.start + prev.size as u64);
        let after_gap = next.start - (list.start + list.size as u64);
        let before_move = offset as u64;
        let after_move = (list.size - offset) as u64;

        let use_before = before_gap >= count as u64
            && (after_gap < count as u64 || before_move <= after_move);
        if use_before {
            move_bits(&mut self.memory, list.start, list.start - count as u64, before_move);
            self.lists[index].start -= count as u64;
            // The gap's bits are stale; the caller overwrites them, but the
            // unary decoder must never see leftover ones before that.
            let gap_at = self.lists[index].start + offset as u64;
            clear_bits(&mut self.memory, gap_at, count as u64);
            true
        } else if after_gap >= count as u64 {
            move_bits(
                &mut self.memory,
                list.start + offset as u64,
                list.start + (offset + count) as u64,
                after_move,
            );
            clear_bits(&mut self.memory, list.start + offset as u64, count as u64);
            true
        } else {
            false
        }
    }

    fn close_gap(&mut self, list_index: u32, offset: u32, count: u32) {
        let index = list_index as usize;
        let list = self.lists[index];
        let before_move = offset as u64;
        let after_move = (list.size - offset - count) as u64;
        if before_move <= after_move {
            move_bits(&mut self.memory, list.start, list.start + count as u64, before_move);
            self.lists[index].start += count as u64;
        } else {
            move_bits(
                &mut self.memory,
                list.start + (offset + count) as u64,
                list.start + offset as u64,
                after_move,
            );
        }
        let list = &mut self.lists[index];
        list.size -= count;
        list.save_offset = 0;
        list.save_key = 0;
    }

    /// Recompute list starts so residual free space is evenly spaced, with
    /// `reserve` extra bits kept after `reserve_list`, then relocate lists
    /// in dependency order: for each half, the half moving toward its new
    /// position is moved first.
    fn rebalance(&mut self, reserve_list: u32, reserve: u64) -> Result<()> {
        let usable = self.lists[self.lists.len() - 1].start;
        let used: u64 = (1..=self.list_count as usize)
            .map(|i| self.lists[i].size as u64)
            .sum();
        if usable < used + reserve {
            return Err(IndexError::Overflow);
        }
        let spacing = (usable - used - reserve) / (self.list_count as u64 + 1);
        let mut offset = 0u64;
        for index in 1..=self.list_count as usize {
            offset += spacing;
            self.new_offsets[index] = offset;
            offset += self.lists[index].size as u64;
            if index == reserve_list as usize {
                offset += reserve;
            }
        }
        self.relocate(1, self.list_count as usize);
        for index in 1..=self.list_count as usize {
            self.lists[index].save_offset = 0;
            self.lists[index].save_key = 0;
        }
        self.rebalance_count += 1;
        Ok(())
    }

    fn relocate(&mut self, first: usize, last: usize) {
        if first > last {
            return;
        }
        if first == last {
            let list = self.lists[first];
            let target = self.new_offsets[first];
            if target != list.start {
                move_bits(&mut self.memory, list.start, target, list.size as u64);
                self.lists[first].start = target;
            }
            return;
        }
        let middle = (first + last) / 2;
        if self.new_offsets[middle] < self.lists[middle].start {
            self.relocate(first, middle);
            self.relocate(middle + 1, last);
        } else {
            self.relocate(middle + 1, last);
            self.relocate(first, middle);
        }
    }

    /// Drop a list's entire contents. The caller supplies the entry and
    /// collision counts it walked, so the zone counters stay exact.
    pub(crate) fn clear_list(
        &mut self,
        list_index: u32,
        records: u64,
        collisions: u64,
    ) -> Result<()> {
        self.check_list_index(list_index)?;
        let size = self.lists[list_index as usize].size;
        if size > 0 {
            self.close_gap(list_index, 0, size);
        }
        self.record_count -= records;
        self.collision_count -= collisions;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence support
    // ------------------------------------------------------------------

    /// Byte image of one list for saving: (bit offset within the first
    /// byte, the raw bytes covering the list).
    pub(crate) fn extract_list(&self, list_index: u32) -> (u8, Vec<u8>) {
        let list = self.lists[list_index as usize];
        let first_byte = (list.start / 8) as usize;
        let bit_offset = (list.start % 8) as u8;
        let last_byte = ((list.start + list.size as u64).div_ceil(8)) as usize;
        (bit_offset, self.memory[first_byte..last_byte].to_vec())
    }

    /// Set the size of a list during restore. Only valid before
    /// `layout_restored_lists`.
    pub(crate) fn set_restored_size(&mut self, list_index: u32, bits: u32) -> Result<()> {
        self.check_list_index(list_index)?;
        if bits as u64 > MAX_LIST_BITS {
            return Err(IndexError::CorruptData(format!(
                "restored list size {} exceeds the 16-bit bound",
                bits
            )));
        }
        self.lists[list_index as usize].size = bits;
        Ok(())
    }

    /// Assign starts for the restored sizes (no data moves; the memory is
    /// still empty).
    pub(crate) fn layout_restored_lists(&mut self) -> Result<()> {
        let usable = self.lists[self.lists.len() - 1].start;
        let used: u64 = (1..=self.list_count as usize)
            .map(|i| self.lists[i].size as u64)
            .sum();
        if usable < used {
            return Err(IndexError::CorruptData(
                "restored lists do not fit in the delta zone".to_string(),
            ));
        }
        let spacing = (usable - used) / (self.list_count as u64 + 1);
        let mut offset = 0u64;
        for index in 1..=self.list_count as usize {
            offset += spacing;
            self.lists[index].start = offset;
            offset += self.lists[index].size as u64;
        }
        Ok(())
    }

    /// Copy a saved list image into place.
    pub(crate) fn restore_list_data(
        &mut self,
        list_index: u32,
        bit_offset: u8,
        bytes: &[u8],
    ) -> Result<()> {
        self.check_list_index(list_index)?;
        let list = self.lists[list_index as usize];
        let needed = ((bit_offset as u64 + list.size as u64).div_ceil(8)) as usize;
        if bytes.len() < needed {
            return Err(IndexError::CorruptData(format!(
                "saved list {} has {} bytes, needs {}",
                list_index,
                bytes.len(),
                needed
            )));
        }
        copy_bits(bytes, bit_offset as u64, &mut self.memory, list.start, list.size as u64);
        Ok(())
    }

    /// Walk one list counting (records, collisions); used to rebuild
    /// counters after a restore that may have rezoned lists.
    pub(crate) fn count_list_entries(&self, list_index: u32) -> Result<(u64, u64)> {
        let list = self.lists[list_index as usize];
        let mut entry = DeltaEntry::before(list_index, list.size, 0, 0);
        let mut records = 0u64;
        let mut collisions = 0u64;
        loop {
            entry.next(&self.memory, &self.coding, list.start)?;
            if entry.at_end {
                break;
            }
            records += 1;
            if entry.is_collision {
                collisions += 1;
            }
        }
        Ok((records, collisions))
    }

    pub(crate) fn add_restored_counts(&mut self, records: u64, collisions: u64) {
        self.record_count += records;
        self.collision_count += collisions;
    }
}
