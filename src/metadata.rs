//! Static description of a remote dataset, fetched once per session.

use crate::error::{CacheError, Result};
use crate::indexer;
use crate::model::{CellKey, ViewLevelId};
use crate::source::CellRequest;
use crate::transform::AffineTransform;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resolution pyramid of one setup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MipmapInfo {
    /// Downsampling factors per level relative to level 0.
    pub resolutions: Vec<[f64; 3]>,
    /// Transform of each level into full resolution coordinates. Derived from the resolutions if omitted.
    #[serde(default)]
    pub transforms: Vec<AffineTransform>,
    /// Cell size per level.
    pub subdivisions: Vec<[u32; 3]>,
}
impl MipmapInfo {
    pub fn num_levels(&self) -> usize { self.resolutions.len() }
    pub fn max_level(&self) -> u32 { self.num_levels().saturating_sub(1) as u32 }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimsAndExistence {
    /// Image size in voxels, if known. Always present for existing images.
    #[serde(default)]
    pub dimensions: Option<[u64; 3]>,
    pub exists: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct DimsAndExistenceEntry {
    id: ViewLevelId,
    #[serde(flatten)]
    value: DimsAndExistence,
}

/// Bootstrap document as served by the remote end.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct MetadataDocument {
    max_num_timepoints: u32,
    max_num_setups: u32,
    max_num_levels: u32,
    per_setup_mipmap_info: BTreeMap<u32, MipmapInfo>,
    dims_and_existence: Vec<DimsAndExistenceEntry>,
}

#[derive(Debug, Clone)]
pub struct DatasetMetadata {
    pub max_timepoints: u32,
    pub max_setups: u32,
    pub max_levels: u32,
    per_setup_mipmap_info: BTreeMap<u32, MipmapInfo>,
    dims_and_existence: FxHashMap<ViewLevelId, DimsAndExistence>,
    /// Cell grid size of every existing image, derived once at load.
    cells_dimensions: FxHashMap<ViewLevelId, [u64; 3]>,
}
impl DatasetMetadata {
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let doc: MetadataDocument = serde_json::from_slice(json)
            .map_err(|e| CacheError::MetadataUnavailable(format!("unparsable bootstrap document: {e}")))?;
        Self::from_document(doc)
    }

    pub fn to_json(&self) -> String {
        let mut dims_and_existence: Vec<DimsAndExistenceEntry> = self
            .dims_and_existence
            .iter()
            .map(|(id, value)| DimsAndExistenceEntry { id: *id, value: *value })
            .collect();
        dims_and_existence.sort_by_key(|e| e.id);

        let doc = MetadataDocument {
            max_num_timepoints: self.max_timepoints,
            max_num_setups: self.max_setups,
            max_num_levels: self.max_levels,
            per_setup_mipmap_info: self.per_setup_mipmap_info.clone(),
            dims_and_existence,
        };
        // only plain data types, serializing cannot fail
        serde_json::to_string(&doc).unwrap_or_default()
    }

    fn from_document(doc: MetadataDocument) -> Result<Self> {
        let invalid = |msg: String| CacheError::MetadataUnavailable(msg);

        let mut per_setup_mipmap_info = doc.per_setup_mipmap_info;
        for (setup, info) in per_setup_mipmap_info.iter_mut() {
            if info.resolutions.is_empty() || info.subdivisions.len() != info.resolutions.len() {
                return Err(invalid(format!(
                    "setup {setup} has {} resolutions but {} subdivisions",
                    info.resolutions.len(),
                    info.subdivisions.len()
                )));
            }
            if info.subdivisions.iter().any(|s| s.contains(&0)) {
                return Err(invalid(format!("setup {setup} has an empty cell size")));
            }
            if info.num_levels() > doc.max_num_levels as usize {
                return Err(invalid(format!("setup {setup} exceeds {} levels", doc.max_num_levels)));
            }
            if info.transforms.is_empty() {
                info.transforms = info.resolutions.iter().map(|r| AffineTransform::for_resolution(*r)).collect();
            } else if info.transforms.len() != info.resolutions.len() {
                return Err(invalid(format!("setup {setup} has a transform count mismatch")));
            }
        }

        let mut dims_and_existence = FxHashMap::default();
        let mut cells_dimensions = FxHashMap::default();
        for DimsAndExistenceEntry { id, value } in doc.dims_and_existence {
            let Some(info) = per_setup_mipmap_info.get(&id.setup) else {
                return Err(invalid(format!("image {id} refers to an undescribed setup")));
            };
            if id.level as usize >= info.num_levels() || id.timepoint >= doc.max_num_timepoints {
                return Err(invalid(format!("image {id} is out of the declared bounds")));
            }
            if value.exists {
                let Some(dims) = value.dimensions else {
                    return Err(invalid(format!("existing image {id} has no dimensions")));
                };
                let grid = indexer::grid_dimensions(dims, info.subdivisions[id.level as usize]);
                cells_dimensions.insert(id, grid);
            }
            dims_and_existence.insert(id, value);
        }

        Ok(DatasetMetadata {
            max_timepoints: doc.max_num_timepoints,
            max_setups: doc.max_num_setups,
            max_levels: doc.max_num_levels,
            per_setup_mipmap_info,
            dims_and_existence,
            cells_dimensions,
        })
    }

    pub fn setups(&self) -> impl Iterator<Item = u32> + '_ { self.per_setup_mipmap_info.keys().copied() }
    pub fn mipmap_info(&self, setup: u32) -> Option<&MipmapInfo> { self.per_setup_mipmap_info.get(&setup) }

    pub fn dims_and_existence(&self, id: ViewLevelId) -> Result<&DimsAndExistence> {
        self.dims_and_existence.get(&id).ok_or(CacheError::UnknownKey(id))
    }
    pub fn exists(&self, id: ViewLevelId) -> Result<bool> { Ok(self.dims_and_existence(id)?.exists) }

    /// Dimensions of an existing image.
    pub fn dimensions(&self, id: ViewLevelId) -> Result<[u64; 3]> {
        self.dims_and_existence(id)?.dimensions.ok_or(CacheError::UnknownKey(id))
    }
    pub fn cell_size(&self, id: ViewLevelId) -> Result<[u32; 3]> {
        self.mipmap_info(id.setup)
            .and_then(|info| info.subdivisions.get(id.level as usize))
            .copied()
            .ok_or(CacheError::UnknownKey(id))
    }
    pub fn grid(&self, id: ViewLevelId) -> Result<[u64; 3]> {
        self.cells_dimensions.get(&id).copied().ok_or(CacheError::UnknownKey(id))
    }

    /// Fetch priority of a level's cells. Finer levels get higher priority.
    pub fn priority(&self, id: ViewLevelId) -> Result<u32> {
        let info = self.mipmap_info(id.setup).ok_or(CacheError::UnknownKey(id))?;
        Ok(info.max_level().saturating_sub(id.level))
    }

    pub fn cell_index(&self, id: ViewLevelId, global_pos: [u64; 3]) -> Result<u64> {
        let cell_pos = indexer::cell_position(global_pos, self.cell_size(id)?);
        Ok(indexer::cell_index(cell_pos, self.grid(id)?))
    }

    /// Voxel interval covered by a cell.
    pub fn cell_request(&self, key: CellKey) -> Result<CellRequest> {
        let grid = self.grid(key.id)?;
        if key.cell_index >= indexer::num_cells(grid) {
            return Err(CacheError::UnknownKey(key.id));
        }
        let cell_size = self.cell_size(key.id)?;
        let pos = indexer::index_to_position(key.cell_index, grid);
        Ok(CellRequest {
            key,
            min: indexer::cell_min(pos, cell_size),
            dims: indexer::cell_dimensions(pos, self.dimensions(key.id)?, cell_size),
        })
    }
}
