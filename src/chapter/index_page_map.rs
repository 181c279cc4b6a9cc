// Index page map: (physical chapter, index page) -> highest delta list.
//
// One probe of the map names the single index page that can hold a
// record's list, so a chapter lookup loads exactly one index page.

use crate::error::{IndexError, Result};
use crate::geometry::Geometry;

pub struct IndexPageMap {
    index_pages_per_chapter: usize,
    bounds: Vec<u32>,
}

impl IndexPageMap {
    pub fn new(geometry: &Geometry) -> Self {
        let entries = geometry.chapters_per_volume as usize * geometry.index_pages_per_chapter;
        let last_list = geometry.delta_lists_per_chapter - 1;
        Self {
            index_pages_per_chapter: geometry.index_pages_per_chapter,
            bounds: vec![last_list; entries],
        }
    }

    #[inline]
    fn base(&self, physical_chapter: u32) -> usize {
        physical_chapter as usize * self.index_pages_per_chapter
    }

    /// Record a committed chapter's per-page list bounds.
    pub fn update(&mut self, physical_chapter: u32, bounds: &[u32]) -> Result<()> {
        if bounds.len() != self.index_pages_per_chapter {
            return Err(IndexError::InvalidArgument(format!(
                "chapter has {} index pages, map expects {}",
                bounds.len(),
                self.index_pages_per_chapter
            )));
        }
        let base = self.base(physical_chapter);
        self.bounds[base..base + bounds.len()].copy_from_slice(bounds);
        Ok(())
    }

    /// The index page within the chapter that covers `delta_list`.
    pub fn find_index_page(&self, physical_chapter: u32, delta_list: u32) -> u32 {
        let base = self.base(physical_chapter);
        let pages = &self.bounds[base..base + self.index_pages_per_chapter];
        for (page_number, &bound) in pages.iter().enumerate() {
            if bound >= delta_list {
                return page_number as u32;
            }
        }
        self.index_pages_per_chapter as u32 - 1
    }

    // ------------------------------------------------------------------
    // Persistence (part of the index state file)
    // ------------------------------------------------------------------

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.bounds.len() * 4);
        for &bound in &self.bounds {
            bytes.extend_from_slice(&bound.to_le_bytes());
        }
        bytes
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.bounds.len() * 4 {
            return Err(IndexError::CorruptData(format!(
                "index page map of {} bytes, expected {}",
                bytes.len(),
                self.bounds.len() * 4
            )));
        }
        for (index, chunk) in bytes.chunks_exact(4).enumerate() {
            self.bounds[index] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> IndexPageMap {
        let geometry = Geometry::new(4096, 16, 8, 4, 0, 0).unwrap();
        IndexPageMap::new(&geometry)
    }

    #[test]
    fn test_update_and_find() {
        let mut map = map();
        let pages = map.index_pages_per_chapter;
        // First page covers lists 0..=2, the rest go to the second page
        let mut bounds = vec![7u32; pages];
        bounds[0] = 2;
        map.update(1, &bounds).unwrap();
        assert_eq!(map.find_index_page(1, 0), 0);
        assert_eq!(map.find_index_page(1, 2), 0);
        if pages > 1 {
            assert_eq!(map.find_index_page(1, 3), 1);
        }
    }

    #[test]
    fn test_byte_round_trip() {
        let mut map = map();
        let pages = map.index_pages_per_chapter;
        map.update(0, &vec![3u32; pages]).unwrap();
        let bytes = map.to_bytes();
        let mut restored = self::map();
        restored.load_bytes(&bytes).unwrap();
        assert_eq!(restored.find_index_page(0, 3), 0);
    }

    #[test]
    fn test_rejects_wrong_width() {
        let mut map = map();
        assert!(map.update(0, &[1u32]).is_err() || map.index_pages_per_chapter == 1);
        assert!(map.load_bytes(&[0u8; 3]).is_err());
    }
}
