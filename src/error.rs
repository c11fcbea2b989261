use crate::model::{CellKey, ViewLevelId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// The dataset description could not be fetched or parsed. Nothing can be served without it.
    #[error("dataset metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("failed to fetch cell {key}: {reason}")]
    FetchFailed { key: CellKey, reason: String },

    /// Lookup of an image that the dataset metadata does not describe.
    #[error("unknown image {0}")]
    UnknownKey(ViewLevelId),

    #[error("voxel {pos:?} outside of image with dimensions {dims:?}")]
    OutOfBounds { pos: [u64; 3], dims: [u64; 3] },

    #[error("timed out waiting for cell {0}")]
    Timeout(CellKey),
}

pub type Result<T> = std::result::Result<T, CacheError>;
