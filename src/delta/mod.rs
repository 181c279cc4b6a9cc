// Delta store: bit-packed (payload, delta-key) containers.
//
// The mutable form is a set of per-zone byte regions holding delta lists
// that grow, shrink, and rebalance in place; the immutable form is a
// densely packed page image written once when a chapter closes. Both share
// one codec and one entry iterator.

pub mod bits;
pub mod codec;
pub mod page;
pub mod zone;

pub use codec::DeltaCoding;
pub use page::{pack_page, search_page, validate_page, DeltaPageHeader};
pub use zone::{zone_memory_size, DeltaEntry, DeltaZone};

use crate::error::{IndexError, Result};
use parking_lot::RwLock;
use std::io::{Read, Write};

/// Magic prefix of a saved delta index zone stream
pub const DELTA_INDEX_MAGIC: &[u8; 8] = b"DI-00002";

const SAVE_TAG_DATA: u8 = b'd';
const SAVE_TAG_END: u8 = b'z';

/// Aggregate counters across all zones of a delta index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub overflow_count: u64,
    pub memory_bytes: u64,
}

/// A mutable delta index partitioned into zones.
///
/// Lists are numbered 0..list_count globally; each zone owns a contiguous
/// range and is individually lockable so zone worker threads never contend
/// on each other's memory.
#[derive(Debug)]
pub struct DeltaIndex {
    zones: Vec<RwLock<DeltaZone>>,
    list_count: u32,
    // Balanced partition: the first `extra_lists` zones own one list
    // more than `base_lists`.
    base_lists: u32,
    extra_lists: u32,
    mean_delta: u32,
    value_bits: u32,
}

impl DeltaIndex {
    pub fn new(
        zone_count: usize,
        list_count: u32,
        mean_delta: u32,
        value_bits: u32,
        expected_records: u64,
    ) -> Result<Self> {
        if zone_count == 0 || list_count == 0 {
            return Err(IndexError::InvalidArgument(
                "delta index needs at least one zone and one list".to_string(),
            ));
        }
        if zone_count as u32 > list_count {
            return Err(IndexError::InvalidArgument(format!(
                "{} zones cannot partition {} delta lists",
                zone_count, list_count
            )));
        }
        let base_lists = list_count / zone_count as u32;
        let extra_lists = list_count % zone_count as u32;
        let coding = DeltaCoding::new(mean_delta, value_bits);
        let records_per_zone = expected_records.div_ceil(zone_count as u64);
        let mut zones = Vec::with_capacity(zone_count);
        let mut first_list = 0u32;
        for zone_number in 0..zone_count as u32 {
            let count = base_lists + u32::from(zone_number < extra_lists);
            let memory = zone_memory_size(records_per_zone, &coding, count)?;
            zones.push(RwLock::new(DeltaZone::new(
                first_list, count, mean_delta, value_bits, memory,
            )?));
            first_list += count;
        }
        Ok(Self {
            zones,
            list_count,
            base_lists,
            extra_lists,
            mean_delta,
            value_bits,
        })
    }

    #[inline]
    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    #[inline]
    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    #[inline]
    pub fn coding(&self) -> DeltaCoding {
        DeltaCoding::new(self.mean_delta, self.value_bits)
    }

    #[inline]
    pub fn mean_delta(&self) -> u32 {
        self.mean_delta
    }

    #[inline]
    pub fn value_bits(&self) -> u32 {
        self.value_bits
    }

    /// Map a global list number to (zone number, local 1-based list index).
    #[inline]
    pub fn zone_for_list(&self, list_number: u32) -> (usize, u32) {
        debug_assert!(list_number < self.list_count);
        let boundary = (self.base_lists + 1) * self.extra_lists;
        if list_number < boundary {
            let width = self.base_lists + 1;
            ((list_number / width) as usize, list_number % width + 1)
        } else {
            let past = list_number - boundary;
            (
                (self.extra_lists + past / self.base_lists) as usize,
                past % self.base_lists + 1,
            )
        }
    }

    #[inline]
    pub fn zone(&self, zone_number: usize) -> &RwLock<DeltaZone> {
        &self.zones[zone_number]
    }

    pub fn stats(&self) -> DeltaIndexStats {
        let mut stats = DeltaIndexStats::default();
        for zone in &self.zones {
            let zone = zone.read();
            stats.record_count += zone.record_count();
            stats.collision_count += zone.collision_count();
            stats.overflow_count += zone.overflow_count();
            stats.memory_bytes += zone.memory_size() as u64;
        }
        stats
    }

    pub fn reset(&self) {
        for zone in &self.zones {
            zone.write().reset();
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write one zone as a self-delimiting save stream.
    pub fn save_zone<W: Write>(&self, zone_number: usize, writer: &mut W) -> Result<()> {
        let zone = self.zones[zone_number].read();
        writer.write_all(DELTA_INDEX_MAGIC)?;
        writer.write_all(&(zone_number as u32).to_le_bytes())?;
        writer.write_all(&(self.zones.len() as u32).to_le_bytes())?;
        writer.write_all(&zone.first_list().to_le_bytes())?;
        writer.write_all(&zone.list_count().to_le_bytes())?;
        writer.write_all(&zone.record_count().to_le_bytes())?;
        writer.write_all(&zone.collision_count().to_le_bytes())?;
        for local in 1..=zone.list_count() {
            let size = zone.list_bits(local) as u16;
            writer.write_all(&size.to_le_bytes())?;
        }
        for local in 1..=zone.list_count() {
            if zone.list_bits(local) == 0 {
                continue;
            }
            let (bit_offset, bytes) = zone.extract_list(local);
            if bytes.len() > u16::MAX as usize {
                return Err(IndexError::Buffer(format!(
                    "list {} image of {} bytes exceeds a save record",
                    local,
                    bytes.len()
                )));
            }
            let global = zone.first_list() + local - 1;
            writer.write_all(&[SAVE_TAG_DATA, bit_offset])?;
            writer.write_all(&(bytes.len() as u16).to_le_bytes())?;
            writer.write_all(&global.to_le_bytes())?;
            writer.write_all(&bytes)?;
        }
        writer.write_all(&[SAVE_TAG_END, 0])?;
        writer.write_all(&0u16.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        Ok(())
    }

    /// Rebuild an index from saved zone streams.
    ///
    /// The new zone count is independent of the saved one: the headers are
    /// validated as a contiguous cover of the list space, the lists are
    /// re-partitioned across the new zones, and every saved list is
    /// scattered into the zone that now owns it.
    pub fn restore<R: Read>(
        sources: &mut [R],
        zone_count: usize,
        mean_delta: u32,
        value_bits: u32,
        expected_records: u64,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(IndexError::InvalidArgument(
                "restore requires at least one saved zone".to_string(),
            ));
        }
        let source_count = sources.len();
        let mut headers = Vec::with_capacity(source_count);
        let mut sizes: Vec<u16> = Vec::new();
        for (index, source) in sources.iter_mut().enumerate() {
            let header = read_zone_header(source)?;
            if header.zone_number != index as u32 || header.zone_count != source_count as u32 {
                return Err(IndexError::CorruptData(format!(
                    "saved zone {} claims to be zone {} of {}",
                    index, header.zone_number, header.zone_count
                )));
            }
            if header.first_list != sizes.len() as u32 {
                return Err(IndexError::CorruptData(format!(
                    "saved zone {} starts at list {}, expected {}",
                    index,
                    header.first_list,
                    sizes.len()
                )));
            }
            for _ in 0..header.list_count {
                sizes.push(read_u16(source)?);
            }
            headers.push(header);
        }
        let list_count = sizes.len() as u32;

        let index = Self::new(zone_count, list_count, mean_delta, value_bits, expected_records)?;
        for (list_number, &bits) in sizes.iter().enumerate() {
            let (zone_number, local) = index.zone_for_list(list_number as u32);
            index.zones[zone_number]
                .write()
                .set_restored_size(local, bits as u32)?;
        }
        for zone in &index.zones {
            zone.write().layout_restored_lists()?;
        }

        for source in sources.iter_mut() {
            loop {
                let mut record = [0u8; 8];
                source.read_exact(&mut record)?;
                let tag = record[0];
                if tag == SAVE_TAG_END {
                    break;
                }
                if tag != SAVE_TAG_DATA {
                    return Err(IndexError::CorruptData(format!(
                        "unknown delta save record tag {:#x}",
                        tag
                    )));
                }
                let bit_offset = record[1];
                let byte_count = u16::from_le_bytes([record[2], record[3]]) as usize;
                let list_number = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
                if list_number >= list_count {
                    return Err(IndexError::CorruptData(format!(
                        "saved list {} is outside the index",
                        list_number
                    )));
                }
                let mut bytes = vec![0u8; byte_count];
                source.read_exact(&mut bytes)?;
                let (zone_number, local) = index.zone_for_list(list_number);
                index.zones[zone_number]
                    .write()
                    .restore_list_data(local, bit_offset, &bytes)?;
            }
        }

        // List ownership may have moved between zones, so the per-zone
        // counters are recounted from the restored lists rather than
        // trusting the saved per-zone totals.
        let mut restored_records = 0u64;
        for zone in &index.zones {
            let mut zone = zone.write();
            let mut records = 0u64;
            let mut collisions = 0u64;
            for local in 1..=zone.list_count() {
                let (r, c) = zone.count_list_entries(local)?;
                records += r;
                collisions += c;
            }
            zone.add_restored_counts(records, collisions);
            restored_records += records;
        }
        let saved_records: u64 = headers.iter().map(|h| h.record_count).sum();
        if restored_records != saved_records {
            return Err(IndexError::CorruptData(format!(
                "restored {} records, saved streams claim {}",
                restored_records, saved_records
            )));
        }
        Ok(index)
    }
}

struct SavedZoneHeader {
    zone_number: u32,
    zone_count: u32,
    first_list: u32,
    list_count: u32,
    record_count: u64,
    #[allow(dead_code)]
    collision_count: u64,
}

fn read_zone_header<R: Read>(source: &mut R) -> Result<SavedZoneHeader> {
    let mut magic = [0u8; 8];
    source.read_exact(&mut magic)?;
    if &magic != DELTA_INDEX_MAGIC {
        return Err(IndexError::UnsupportedVersion(format!(
            "bad delta index magic {:?}",
            magic
        )));
    }
    Ok(SavedZoneHeader {
        zone_number: read_u32(source)?,
        zone_count: read_u32(source)?,
        first_list: read_u32(source)?,
        list_count: read_u32(source)?,
        record_count: read_u64(source)?,
        collision_count: read_u64(source)?,
    })
}

fn read_u16<R: Read>(source: &mut R) -> Result<u16> {
    let mut bytes = [0u8; 2];
    source.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32<R: Read>(source: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    source.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(source: &mut R) -> Result<u64> {
    let mut bytes = [0u8; 8];
    source.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}
