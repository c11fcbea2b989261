#![warn(clippy::all, rust_2018_idioms)]

pub mod bootstrap;
pub mod cache;
pub mod config;
mod downloader;
pub mod error;
pub mod indexer;
pub mod metadata;
pub mod model;
pub mod session;
pub mod source;
pub mod transform;
pub mod volume;

pub use cache::{CacheStats, CellCache, CellSnapshot, CellState};
pub use config::{CacheConfig, SessionConfig};
pub use error::{CacheError, Result};
pub use model::{CellKey, LoadingStrategy, ViewLevelId};
pub use session::{RemoteSession, SetupImgLoader};
