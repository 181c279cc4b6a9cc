use crate::error::{IndexError, Result};
use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};

/// Upper bound on zone worker threads
pub const MAX_ZONES: usize = 16;

/// Upper bound on page cache reader threads
pub const MAX_READER_THREADS: usize = 16;

/// Index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub geometry: Geometry,

    /// Parallelism of the request pipeline
    pub zone_count: usize,

    /// Reader threads draining the page cache's pending reads
    pub read_threads: usize,

    /// Page cache capacity in pages
    pub cache_pages: usize,

    /// Sparse cache capacity in chapter indexes
    pub sparse_cache_chapters: usize,

    /// Mean delta of the volume index codec
    pub volume_index_mean_delta: u32,
}

impl IndexConfig {
    pub fn with_geometry(geometry: Geometry) -> Self {
        Self {
            geometry,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.zone_count == 0 || self.zone_count > MAX_ZONES {
            return Err(IndexError::InvalidArgument(format!(
                "zone count {} outside 1..={}",
                self.zone_count, MAX_ZONES
            )));
        }
        if self.geometry.records_per_chapter / self.zone_count == 0 {
            return Err(IndexError::InvalidArgument(format!(
                "{} zones cannot share a {}-record chapter",
                self.zone_count, self.geometry.records_per_chapter
            )));
        }
        if self.read_threads == 0 || self.read_threads > MAX_READER_THREADS {
            return Err(IndexError::InvalidArgument(format!(
                "read thread count {} outside 1..={}",
                self.read_threads, MAX_READER_THREADS
            )));
        }
        if self.cache_pages < self.geometry.pages_per_chapter {
            return Err(IndexError::InvalidArgument(format!(
                "page cache of {} pages cannot hold one {}-page chapter",
                self.cache_pages, self.geometry.pages_per_chapter
            )));
        }
        if self.geometry.has_sparse_chapters() && self.sparse_cache_chapters == 0 {
            return Err(IndexError::InvalidArgument(
                "sparse geometry requires a sparse cache".to_string(),
            ));
        }
        if self.volume_index_mean_delta < 2 {
            return Err(IndexError::InvalidArgument(
                "volume index mean delta must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        let geometry = Geometry::default();
        Self {
            geometry,
            zone_count: num_cpus::get().min(MAX_ZONES),
            read_threads: 2,
            cache_pages: geometry.pages_per_chapter * 4,
            sparse_cache_chapters: 2,
            volume_index_mean_delta: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        IndexConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_zones() {
        let mut config = IndexConfig::default();
        config.zone_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_undersized_cache() {
        let mut config = IndexConfig::default();
        config.cache_pages = 1;
        assert!(config.validate().is_err());
    }
}
