// Immutable chapter index pages.
//
// A page is a self-describing, densely packed snapshot of consecutive
// delta lists: a fixed header, a table of (list_count + 1) 19-bit bit
// offsets, the packed list streams, and a trailing guard region of 0xFF
// bytes. Pages are written little-endian; the header fields of pages
// written by older big-endian builds are still accepted on read.

use super::bits::{copy_bits, get_bits, set_bits, GUARD_BYTES};
use super::codec::DeltaCoding;
use super::zone::{search_list, DeltaEntry, DeltaZone};
use crate::common::{RecordName, VirtualChapter};
use crate::error::{IndexError, Result};

/// Width of one offset-table entry
pub const PAGE_OFFSET_BITS: u32 = 19;

/// Bit offset where the offset table begins (after the 20-byte header)
pub const PAGE_HEADER_BITS: u64 = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaPageHeader {
    pub nonce: u64,
    pub virtual_chapter: VirtualChapter,
    pub first_list: u16,
    pub list_count: u16,
}

fn read_header_le(page: &[u8]) -> DeltaPageHeader {
    DeltaPageHeader {
        nonce: u64::from_le_bytes(page[0..8].try_into().unwrap()),
        virtual_chapter: u64::from_le_bytes(page[8..16].try_into().unwrap()),
        first_list: u16::from_le_bytes(page[16..18].try_into().unwrap()),
        list_count: u16::from_le_bytes(page[18..20].try_into().unwrap()),
    }
}

fn read_header_be(page: &[u8]) -> DeltaPageHeader {
    DeltaPageHeader {
        nonce: u64::from_be_bytes(page[0..8].try_into().unwrap()),
        virtual_chapter: u64::from_be_bytes(page[8..16].try_into().unwrap()),
        first_list: u16::from_be_bytes(page[16..18].try_into().unwrap()),
        list_count: u16::from_be_bytes(page[18..20].try_into().unwrap()),
    }
}

#[inline]
fn list_offset(page: &[u8], table_index: u32) -> u64 {
    get_bits(
        page,
        PAGE_HEADER_BITS + (table_index as u64) * PAGE_OFFSET_BITS as u64,
        PAGE_OFFSET_BITS,
    )
}

/// Validate a page image and return its header.
///
/// Corruption is an expected condition while rebuilding from a partially
/// written volume, so validation reports `CorruptData` without logging.
pub fn validate_page(page: &[u8], expected_nonce: u64) -> Result<DeltaPageHeader> {
    if page.len() < (PAGE_HEADER_BITS / 8) as usize + GUARD_BYTES {
        return Err(IndexError::CorruptData("chapter page is too small".to_string()));
    }
    let header = {
        let le = read_header_le(page);
        if le.nonce == expected_nonce {
            le
        } else {
            let be = read_header_be(page);
            if be.nonce != expected_nonce {
                return Err(IndexError::CorruptData(
                    "chapter page nonce mismatch".to_string(),
                ));
            }
            be
        }
    };

    let usable_bits = ((page.len() - GUARD_BYTES) * 8) as u64;
    let table_entries = header.list_count as u64 + 1;
    let lists_base = PAGE_HEADER_BITS + table_entries * PAGE_OFFSET_BITS as u64;
    if lists_base > usable_bits {
        return Err(IndexError::CorruptData(
            "chapter page list count exceeds the page".to_string(),
        ));
    }
    let mut previous = lists_base;
    for index in 0..table_entries {
        let offset = list_offset(page, index as u32);
        if offset < previous || offset > usable_bits {
            return Err(IndexError::CorruptData(
                "chapter page offsets are not monotonic".to_string(),
            ));
        }
        previous = offset;
    }
    if page[page.len() - GUARD_BYTES..].iter().any(|&b| b != 0xff) {
        return Err(IndexError::CorruptData(
            "chapter page guard bytes are not set".to_string(),
        ));
    }
    Ok(header)
}

/// Search one list of a validated page for `key`, resolving collisions
/// against `name`. Returns the payload of the matching entry.
pub fn search_page(
    page: &[u8],
    header: &DeltaPageHeader,
    coding: &DeltaCoding,
    list_number: u32,
    key: u32,
    name: &RecordName,
) -> Result<Option<u64>> {
    if list_number < header.first_list as u32
        || list_number >= header.first_list as u32 + header.list_count as u32
    {
        return Err(IndexError::InvalidArgument(format!(
            "list {} is not on page [{}, {})",
            list_number,
            header.first_list,
            header.first_list as u32 + header.list_count as u32
        )));
    }
    let local = list_number - header.first_list as u32;
    let start = list_offset(page, local);
    let end = list_offset(page, local + 1);
    let size = (end - start) as u32;
    let (entry, found) = search_list(page, coding, list_number, start, size, key, name)?;
    if !found {
        return Ok(None);
    }
    Ok(Some(entry.value(page, coding, start)))
}

/// Iterate every entry of a validated page, in list order.
pub fn for_each_entry<F>(
    page: &[u8],
    header: &DeltaPageHeader,
    coding: &DeltaCoding,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(u32, &DeltaEntry, u64) -> Result<()>,
{
    for local in 0..header.list_count as u32 {
        let start = list_offset(page, local);
        let end = list_offset(page, local + 1);
        let size = (end - start) as u32;
        let mut entry = DeltaEntry::before(header.first_list as u32 + local, size, 0, 0);
        loop {
            entry.next(page, coding, start)?;
            if entry.at_end {
                break;
            }
            let value = entry.value(page, coding, start);
            visit(header.first_list as u32 + local, &entry, value)?;
        }
    }
    Ok(())
}

/// Pack as many consecutive lists as fit from a mutable zone into a page
/// image. `first_list` names the first packed list both locally in the
/// zone (1-based) and in the page header (0-based chapter list number).
/// Returns the number of lists packed.
pub fn pack_page(
    zone: &DeltaZone,
    first_list: u32,
    lists_remaining: u32,
    nonce: u64,
    virtual_chapter: VirtualChapter,
    page: &mut [u8],
) -> Result<u32> {
    let usable_bits = ((page.len() - GUARD_BYTES) * 8) as u64;

    let mut count = 0u32;
    let mut data_bits = 0u64;
    while count < lists_remaining {
        let size = zone.list_bits(first_list + 1 + count) as u64;
        let table_bits = (count as u64 + 2) * PAGE_OFFSET_BITS as u64;
        if PAGE_HEADER_BITS + table_bits + data_bits + size > usable_bits {
            break;
        }
        data_bits += size;
        count += 1;
    }
    if count == 0 && lists_remaining > 0 {
        return Err(IndexError::Overflow);
    }

    page.fill(0);
    page[0..8].copy_from_slice(&nonce.to_le_bytes());
    page[8..16].copy_from_slice(&virtual_chapter.to_le_bytes());
    page[16..18].copy_from_slice(&(first_list as u16).to_le_bytes());
    page[18..20].copy_from_slice(&(count as u16).to_le_bytes());

    let lists_base = PAGE_HEADER_BITS + (count as u64 + 1) * PAGE_OFFSET_BITS as u64;
    let mut at = lists_base;
    for index in 0..count {
        set_bits(
            page,
            PAGE_HEADER_BITS + (index as u64) * PAGE_OFFSET_BITS as u64,
            PAGE_OFFSET_BITS,
            at,
        );
        let local = first_list + 1 + index;
        let size = zone.list_bits(local) as u64;
        copy_bits(zone.memory(), zone.list_start(local), page, at, size);
        at += size;
    }
    set_bits(
        page,
        PAGE_HEADER_BITS + (count as u64) * PAGE_OFFSET_BITS as u64,
        PAGE_OFFSET_BITS,
        at,
    );
    let guard_base = page.len() - GUARD_BYTES;
    page[guard_base..].fill(0xff);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE: u64 = 0x1db7_94c0_22ee_91a7;

    fn build_zone() -> DeltaZone {
        let mut zone = DeltaZone::new(0, 8, 256, 6, 1 << 14).unwrap();
        for list in 1..=8u32 {
            for k in 0..20u32 {
                let key = k * 53 + list;
                let (entry, found) = zone.search_name(list, key, &RecordName([0u8; 32])).unwrap();
                assert!(!found);
                zone.put_entry(&entry, key, (k % 60) as u64, None).unwrap();
            }
        }
        zone
    }

    #[test]
    fn test_pack_validate_search() {
        let zone = build_zone();
        let mut page = vec![0u8; 4096];
        let packed = pack_page(&zone, 0, 8, NONCE, 42, &mut page).unwrap();
        assert_eq!(packed, 8);

        let header = validate_page(&page, NONCE).unwrap();
        assert_eq!(header.virtual_chapter, 42);
        assert_eq!(header.first_list, 0);
        assert_eq!(header.list_count, 8);

        for list in 0..8u32 {
            for k in 0..20u32 {
                let key = k * 53 + (list + 1);
                let value =
                    search_page(&page, &header, zone.coding(), list, key, &RecordName([0u8; 32]))
                        .unwrap();
                assert_eq!(value, Some((k % 60) as u64));
            }
            let miss =
                search_page(&page, &header, zone.coding(), list, 9999, &RecordName([0u8; 32]))
                    .unwrap();
            assert_eq!(miss, None);
        }
    }

    #[test]
    fn test_pack_splits_across_pages() {
        let zone = build_zone();
        // A page too small for all eight lists forces a split
        let mut page = vec![0u8; 256];
        let packed = pack_page(&zone, 0, 8, NONCE, 7, &mut page).unwrap();
        assert!(packed >= 1 && packed < 8);
        let header = validate_page(&page, NONCE).unwrap();
        assert_eq!(header.list_count as u32, packed);
    }

    #[test]
    fn test_validate_rejects_bad_nonce() {
        let zone = build_zone();
        let mut page = vec![0u8; 4096];
        pack_page(&zone, 0, 8, NONCE, 42, &mut page).unwrap();
        let err = validate_page(&page, NONCE + 1).unwrap_err();
        assert_eq!(err, IndexError::CorruptData(String::new()));
    }

    #[test]
    fn test_validate_rejects_cleared_guard() {
        let zone = build_zone();
        let mut page = vec![0u8; 4096];
        pack_page(&zone, 0, 8, NONCE, 42, &mut page).unwrap();
        let last = page.len() - 1;
        page[last] = 0;
        assert!(validate_page(&page, NONCE).is_err());
    }

    #[test]
    fn test_big_endian_header_accepted() {
        let zone = build_zone();
        let mut page = vec![0u8; 4096];
        pack_page(&zone, 0, 8, NONCE, 42, &mut page).unwrap();
        // Rewrite the header fields big-endian, as a legacy build would
        // have laid them down.
        page[0..8].copy_from_slice(&NONCE.to_be_bytes());
        page[8..16].copy_from_slice(&42u64.to_be_bytes());
        page[16..18].copy_from_slice(&0u16.to_be_bytes());
        page[18..20].copy_from_slice(&8u16.to_be_bytes());
        let header = validate_page(&page, NONCE).unwrap();
        assert_eq!(header.virtual_chapter, 42);
        assert_eq!(header.list_count, 8);
    }

    #[test]
    fn test_for_each_entry_visits_all() {
        let zone = build_zone();
        let mut page = vec![0u8; 4096];
        pack_page(&zone, 0, 8, NONCE, 42, &mut page).unwrap();
        let header = validate_page(&page, NONCE).unwrap();
        let mut seen = 0u32;
        for_each_entry(&page, &header, zone.coding(), |_, _, _| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 8 * 20);
    }
}
