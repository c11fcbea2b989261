use super::{check_bounds, Volatile, VoxelVolume};
use crate::error::Result;

/// Image with the same value everywhere. Stands in for images the dataset declares missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantVolume {
    dims: [u64; 3],
    value: u16,
}
impl ConstantVolume {
    pub fn new(dims: [u64; 3], value: u16) -> Self { Self { dims, value } }
}
impl VoxelVolume for ConstantVolume {
    fn dimensions(&self) -> [u64; 3] { self.dims }
    fn get(&mut self, xyz: [u64; 3]) -> Result<Volatile<u16>> {
        check_bounds(xyz, self.dims)?;
        Ok(Volatile::new(self.value, true))
    }
}

/// Image for a missing timepoint/setup/level, clipped to its size if the dataset knows it.
pub fn missing_image(dims: Option<[u64; 3]>, value: u16) -> ConstantVolume {
    ConstantVolume::new(dims.unwrap_or([1, 1, 1]), value)
}
