mod cached;
mod constant;

use crate::error::{CacheError, Result};
use itertools::iproduct;

pub use cached::CachedCellVolume;
pub use constant::{missing_image, ConstantVolume};

/// A sample together with whether it comes from fully loaded data.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Volatile<T> {
    pub value: T,
    pub valid: bool,
}
impl<T> Volatile<T> {
    pub fn new(value: T, valid: bool) -> Self { Self { value, valid } }
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Volatile<U> {
        Volatile {
            value: f(self.value),
            valid: self.valid,
        }
    }
}
impl Volatile<u16> {
    pub fn convert<S: SampleType>(self) -> Volatile<S> { self.map(S::from_raw) }
}

/// Interpretation of the raw 16 bit samples served by the cache.
pub trait SampleType: Copy {
    fn from_raw(raw: u16) -> Self;
}
impl SampleType for u16 {
    fn from_raw(raw: u16) -> Self { raw }
}
impl SampleType for u8 {
    fn from_raw(raw: u16) -> Self { (raw >> 8) as u8 }
}
impl SampleType for f32 {
    fn from_raw(raw: u16) -> Self { raw as f32 }
}

pub trait VoxelVolume {
    fn dimensions(&self) -> [u64; 3];
    fn get(&mut self, xyz: [u64; 3]) -> Result<Volatile<u16>>;

    /// Samples of the box starting at `min` with x varying fastest. Values of a budgeted view
    /// that are not loaded yet are placeholders.
    fn copy_region(&mut self, min: [u64; 3], dims: [u64; 3]) -> Result<Vec<u16>> {
        let size = self.dimensions();
        let out_of_bounds = CacheError::OutOfBounds { pos: min, dims: size };
        for i in 0..3 {
            match min[i].checked_add(dims[i]) {
                Some(end) if end <= size[i] => {}
                _ => return Err(out_of_bounds.clone()),
            }
        }
        let len = dims[0]
            .checked_mul(dims[1])
            .and_then(|n| n.checked_mul(dims[2]))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(out_of_bounds)?;
        let mut out = Vec::with_capacity(len);
        for (z, y, x) in iproduct!(0..dims[2], 0..dims[1], 0..dims[0]) {
            out.push(self.get([min[0] + x, min[1] + y, min[2] + z])?.value);
        }
        Ok(out)
    }
}

pub type Volume = Box<dyn VoxelVolume + Send>;

pub(crate) fn check_bounds(xyz: [u64; 3], dims: [u64; 3]) -> Result<()> {
    if xyz.iter().zip(dims.iter()).any(|(p, d)| p >= d) {
        Err(CacheError::OutOfBounds { pos: xyz, dims })
    } else {
        Ok(())
    }
}
