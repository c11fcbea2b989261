//! Entry point for reading a remote dataset: one cache shared by per-setup image loaders.

use crate::bootstrap::{Bootstrap, HttpBootstrap, MetadataLoader};
use crate::cache::CellCache;
use crate::config::SessionConfig;
use crate::error::{CacheError, Result};
use crate::metadata::{DatasetMetadata, DimsAndExistence, MipmapInfo};
use crate::model::{LoadingStrategy, ViewLevelId};
use crate::source::{CellSource, HttpCellSource};
use crate::transform::AffineTransform;
use crate::volume::{missing_image, CachedCellVolume, Volume};
use log::{info, warn};
use std::sync::Arc;

pub struct RemoteSession {
    metadata: Arc<DatasetMetadata>,
    cache: Arc<CellCache>,
    missing_value: u16,
}
impl RemoteSession {
    /// Loads the dataset description and starts the cell cache.
    pub fn open(bootstrap: Box<dyn Bootstrap>, source: Arc<dyn CellSource>, config: &SessionConfig) -> Result<Self> {
        let metadata = MetadataLoader::new(bootstrap).load()?;
        let cache = Arc::new(CellCache::new(metadata.clone(), source, &config.cache));
        Ok(RemoteSession {
            metadata,
            cache,
            missing_value: config.missing_value,
        })
    }

    /// Opens the dataset served at `config.base_url`.
    pub fn connect(config: &SessionConfig) -> Result<Self> {
        info!("Connecting to {}", config.base_url);
        let bootstrap = HttpBootstrap::new(&config.base_url, config.authorization.clone());
        let source = HttpCellSource::new(&config.base_url, config.authorization.clone());
        Self::open(Box::new(bootstrap), Arc::new(source), config)
    }

    pub fn metadata(&self) -> &Arc<DatasetMetadata> { &self.metadata }
    pub fn cache(&self) -> &Arc<CellCache> { &self.cache }

    pub fn exists_image_data(&self, id: ViewLevelId) -> Result<bool> { self.metadata.exists(id) }
    pub fn dims_and_existence(&self, id: ViewLevelId) -> Result<DimsAndExistence> {
        self.metadata.dims_and_existence(id).copied()
    }
    pub fn cell_index(&self, timepoint: u32, setup: u32, level: u32, global_pos: [u64; 3]) -> Result<u64> {
        self.metadata
            .cell_index(ViewLevelId::new(timepoint, setup, level), global_pos)
    }

    pub fn setup_loader(&self, setup: u32) -> Result<SetupImgLoader> {
        let info = self
            .metadata
            .mipmap_info(setup)
            .cloned()
            .ok_or(CacheError::UnknownKey(ViewLevelId::new(0, setup, 0)))?;
        Ok(SetupImgLoader {
            setup,
            info,
            cache: self.cache.clone(),
            missing_value: self.missing_value,
        })
    }
}

/// Images of one setup at all timepoints and levels.
pub struct SetupImgLoader {
    setup: u32,
    info: MipmapInfo,
    cache: Arc<CellCache>,
    missing_value: u16,
}
impl SetupImgLoader {
    pub fn setup(&self) -> u32 { self.setup }

    /// Image that loads missing cells on access.
    pub fn image(&self, timepoint: u32, level: u32) -> Result<Volume> {
        self.volume(timepoint, level, LoadingStrategy::Blocking)
    }

    /// Image that never waits for cells. Samples of cells not loaded yet are flagged invalid.
    pub fn volatile_image(&self, timepoint: u32, level: u32) -> Result<Volume> {
        self.volume(timepoint, level, LoadingStrategy::Budgeted)
    }

    fn volume(&self, timepoint: u32, level: u32, strategy: LoadingStrategy) -> Result<Volume> {
        let id = ViewLevelId::new(timepoint, self.setup, level);
        let dims_and_existence = *self.cache.metadata().dims_and_existence(id)?;
        if dims_and_existence.exists {
            Ok(Box::new(CachedCellVolume::new(self.cache.clone(), id, strategy)?))
        } else {
            warn!("Image {} does not exist, using constant {}", id, self.missing_value);
            Ok(Box::new(missing_image(dims_and_existence.dimensions, self.missing_value)))
        }
    }

    pub fn mipmap_resolutions(&self) -> &[[f64; 3]] { &self.info.resolutions }
    pub fn mipmap_transforms(&self) -> &[AffineTransform] { &self.info.transforms }
    pub fn num_mipmap_levels(&self) -> usize { self.info.num_levels() }
}
