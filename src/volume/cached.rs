use super::{check_bounds, Volatile, VoxelVolume};
use crate::cache::{CellCache, CellSnapshot};
use crate::error::Result;
use crate::indexer;
use crate::model::{LoadingStrategy, ViewLevelId};
use derive_more::Debug;
use std::sync::Arc;

/// Voxel view of one image that reads through the cell cache.
///
/// The last valid cell is kept, so consecutive accesses within a cell don't touch the cache.
/// Invalidations therefore show up once the view moves on to another cell or is refreshed.
#[derive(Debug)]
pub struct CachedCellVolume {
    #[debug(skip)]
    cache: Arc<CellCache>,
    id: ViewLevelId,
    dims: [u64; 3],
    cell_size: [u32; 3],
    grid: [u64; 3],
    strategy: LoadingStrategy,
    #[debug(skip)]
    last: Option<CellSnapshot>,
}
impl CachedCellVolume {
    pub fn new(cache: Arc<CellCache>, id: ViewLevelId, strategy: LoadingStrategy) -> Result<Self> {
        let metadata = cache.metadata();
        let dims = metadata.dimensions(id)?;
        let cell_size = metadata.cell_size(id)?;
        let grid = metadata.grid(id)?;
        Ok(CachedCellVolume {
            cache,
            id,
            dims,
            cell_size,
            grid,
            strategy,
            last: None,
        })
    }

    pub fn id(&self) -> ViewLevelId { self.id }
    pub fn strategy(&self) -> LoadingStrategy { self.strategy }

    /// Forgets the last cell so that the next access asks the cache again.
    pub fn refresh(&mut self) { self.last = None; }

    fn sample(snapshot: &CellSnapshot, xyz: [u64; 3], cell_pos: [u64; 3], cell_size: [u32; 3]) -> Volatile<u16> {
        let offset = indexer::offset_in_cell(xyz, cell_pos, cell_size, snapshot.dims);
        Volatile::new(snapshot.get(offset), snapshot.valid)
    }
}
impl VoxelVolume for CachedCellVolume {
    fn dimensions(&self) -> [u64; 3] { self.dims }

    fn get(&mut self, xyz: [u64; 3]) -> Result<Volatile<u16>> {
        check_bounds(xyz, self.dims)?;
        let cell_pos = indexer::cell_position(xyz, self.cell_size);
        let index = indexer::cell_index(cell_pos, self.grid);

        if let Some(last) = self.last.as_ref().filter(|s| s.key.cell_index == index) {
            return Ok(Self::sample(last, xyz, cell_pos, self.cell_size));
        }

        let snapshot = self.cache.get(self.id.cell(index), self.strategy)?;
        let value = Self::sample(&snapshot, xyz, cell_pos, self.cell_size);
        self.last = snapshot.valid.then_some(snapshot);
        Ok(value)
    }
}
