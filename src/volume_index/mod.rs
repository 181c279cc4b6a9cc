// Volume index: sampled record name -> newest chapter.
//
// Dense geometries use a single sub-index covering every chapter in the
// volume. Sparse geometries split duty: sample names ("hooks") go to a
// hook sub-index whose window spans the whole volume, everything else
// goes to the dense sub-index whose window spans only the dense chapters,
// so non-sample entries quietly expire when their chapter goes sparse.

pub mod sub_index;

pub use sub_index::{VolumeIndexRecord, VolumeSubIndex};

use crate::common::{RecordName, VirtualChapter};
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeIndexStats {
    pub entries_indexed: u64,
    pub collisions: u64,
    pub entries_discarded: u64,
    pub memory_used: u64,
}

pub struct VolumeIndex {
    geometry: crate::geometry::Geometry,
    dense: VolumeSubIndex,
    hooks: Option<VolumeSubIndex>,
}

impl VolumeIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let geometry = config.geometry;
        let dense_capacity =
            geometry.records_per_chapter as u64 * geometry.dense_chapters();
        let dense = VolumeSubIndex::new(
            config.zone_count,
            dense_capacity,
            geometry.dense_chapters(),
            config.volume_index_mean_delta,
        )?;
        let hooks = if geometry.has_sparse_chapters() {
            let hook_capacity = (geometry.records_per_chapter as u64
                * geometry.chapters_per_volume
                / geometry.sparse_sample_rate as u64)
                .max(1);
            Some(VolumeSubIndex::new(
                config.zone_count,
                hook_capacity,
                geometry.chapters_per_volume,
                config.volume_index_mean_delta,
            )?)
        } else {
            None
        };
        Ok(Self {
            geometry,
            dense,
            hooks,
        })
    }

    #[inline]
    fn sub_index_for(&self, name: &RecordName) -> &VolumeSubIndex {
        match &self.hooks {
            Some(hooks) if self.geometry.is_sample(name) => hooks,
            _ => &self.dense,
        }
    }

    #[inline]
    pub fn is_sample(&self, name: &RecordName) -> bool {
        self.geometry.is_sample(name)
    }

    /// The zone that must process every request for this name.
    #[inline]
    pub fn zone_of(&self, name: &RecordName) -> usize {
        self.sub_index_for(name).zone_of(name)
    }

    /// Read-only probe, safe from any thread.
    pub fn lookup(&self, name: &RecordName) -> Result<Option<VirtualChapter>> {
        self.sub_index_for(name).lookup(name)
    }

    /// Position a record for subsequent in-place operations; zone-thread
    /// only.
    pub fn get_record(&self, name: &RecordName) -> Result<VolumeIndexRecord> {
        self.sub_index_for(name).get_record(name)
    }

    /// Create or overwrite the record's entry. Running out of delta
    /// memory drops the entry (the record is simply not indexed); the
    /// duplicate-name condition is left to the caller, which treats it as
    /// success during rebuild replay.
    pub fn put_record(&self, record: &VolumeIndexRecord, chapter: VirtualChapter) -> Result<()> {
        match self.sub_index_for(&record.name).put_record(record, chapter) {
            Err(IndexError::Overflow) => {
                warn!(
                    chapter,
                    "volume index delta list overflow, record not indexed"
                );
                Ok(())
            }
            other => other,
        }
    }

    pub fn set_record_chapter(
        &self,
        record: &VolumeIndexRecord,
        chapter: VirtualChapter,
    ) -> Result<()> {
        self.sub_index_for(&record.name).set_record_chapter(record, chapter)
    }

    pub fn remove_record(&self, record: &VolumeIndexRecord) -> Result<()> {
        self.sub_index_for(&record.name).remove_record(record)
    }

    /// Advance a zone's open chapter across every sub-index.
    pub fn set_zone_open_chapter(
        &self,
        zone_number: usize,
        chapter: VirtualChapter,
    ) -> Result<()> {
        self.dense.set_zone_open_chapter(zone_number, chapter)?;
        if let Some(hooks) = &self.hooks {
            hooks.set_zone_open_chapter(zone_number, chapter)?;
        }
        Ok(())
    }

    #[inline]
    pub fn dense_index(&self) -> &VolumeSubIndex {
        &self.dense
    }

    #[inline]
    pub fn hook_index(&self) -> Option<&VolumeSubIndex> {
        self.hooks.as_ref()
    }

    /// Restore both sub-indexes from saved zone streams. Must run before
    /// the index is shared with its worker threads.
    pub fn restore_sub_indexes<R: std::io::Read>(
        &mut self,
        dense_sources: &mut [R],
        hook_sources: Option<&mut [R]>,
    ) -> Result<()> {
        self.dense.restore(dense_sources)?;
        match (&mut self.hooks, hook_sources) {
            (Some(hooks), Some(sources)) => hooks.restore(sources)?,
            (None, None) => {}
            _ => {
                return Err(IndexError::CorruptData(
                    "saved volume index does not match the sparse configuration".to_string(),
                ))
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> VolumeIndexStats {
        let mut delta = self.dense.stats();
        if let Some(hooks) = &self.hooks {
            let hook_stats = hooks.stats();
            delta.record_count += hook_stats.record_count;
            delta.collision_count += hook_stats.collision_count;
            delta.overflow_count += hook_stats.overflow_count;
            delta.memory_bytes += hook_stats.memory_bytes;
        }
        VolumeIndexStats {
            entries_indexed: delta.record_count,
            collisions: delta.collision_count,
            entries_discarded: delta.overflow_count,
            memory_used: delta.memory_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    fn sparse_config() -> IndexConfig {
        let geometry = Geometry::new(4096, 16, 8, 64, 56, 32).unwrap();
        let mut config = IndexConfig::with_geometry(geometry);
        config.zone_count = 1;
        config.cache_pages = geometry.pages_per_chapter;
        config
    }

    fn name_with_sample(seed: u64, sample: u16) -> RecordName {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&seed.wrapping_mul(0x2545_f491_4f6c_dd1d).to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.to_le_bytes());
        bytes[14..16].copy_from_slice(&sample.to_le_bytes());
        RecordName(bytes)
    }

    #[test]
    fn test_sparse_routing() {
        let index = VolumeIndex::new(&sparse_config()).unwrap();
        let hook = name_with_sample(1, 0);
        let plain = name_with_sample(2, 3);
        assert!(index.is_sample(&hook));
        assert!(!index.is_sample(&plain));

        let record = index.get_record(&hook).unwrap();
        index.put_record(&record, 0).unwrap();
        let record = index.get_record(&plain).unwrap();
        index.put_record(&record, 0).unwrap();

        assert_eq!(index.dense_index().stats().record_count, 1);
        assert_eq!(index.hook_index().unwrap().stats().record_count, 1);
    }

    #[test]
    fn test_hooks_outlive_dense_window() {
        let config = sparse_config();
        let index = VolumeIndex::new(&config).unwrap();
        let hook = name_with_sample(3, 0);
        let plain = name_with_sample(4, 5);
        for name in [&hook, &plain] {
            let record = index.get_record(name).unwrap();
            index.put_record(&record, 0).unwrap();
        }
        // Dense window is 8 chapters; advance past it
        for chapter in 1..=9u64 {
            index.set_zone_open_chapter(0, chapter).unwrap();
        }
        assert_eq!(index.lookup(&hook).unwrap(), Some(0));
        assert_eq!(index.lookup(&plain).unwrap(), None);
    }

    #[test]
    fn test_dense_geometry_has_no_hooks() {
        let mut config = IndexConfig::default();
        config.zone_count = 2;
        let index = VolumeIndex::new(&config).unwrap();
        assert!(index.hook_index().is_none());
        let name = name_with_sample(9, 17);
        assert!(index.is_sample(&name));
        assert!(index.zone_of(&name) < 2);
    }
}
