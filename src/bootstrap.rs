use crate::error::{CacheError, Result};
use crate::metadata::DatasetMetadata;
use crate::source::basic_authorization;
use log::{debug, info};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// Provides the JSON dataset description.
pub trait Bootstrap: Send + Sync {
    fn fetch(&self) -> std::result::Result<Vec<u8>, String>;
}

impl<F> Bootstrap for F
where
    F: Fn() -> std::result::Result<Vec<u8>, String> + Send + Sync,
{
    fn fetch(&self) -> std::result::Result<Vec<u8>, String> { self() }
}

#[derive(Debug, Clone)]
pub struct HttpBootstrap {
    base_url: String,
    authorization: Option<String>,
}
impl HttpBootstrap {
    pub fn new(base_url: &str, authorization: Option<String>) -> Self {
        Self {
            base_url: base_url.to_string(),
            authorization,
        }
    }
    pub fn init_url(&self) -> String { format!("{}?p=init", self.base_url) }
}
impl Bootstrap for HttpBootstrap {
    fn fetch(&self) -> std::result::Result<Vec<u8>, String> {
        let url = self.init_url();
        info!("Fetching dataset description from {}", url);

        let mut request = ehttp::Request::get(url);
        if let Some(authorization) = &self.authorization {
            request
                .headers
                .insert("Authorization", basic_authorization(authorization));
        }
        let res = ehttp::fetch_blocking(&request)?;
        if res.status != 200 {
            return Err(format!("server responded with {} {}", res.status, res.status_text));
        }
        Ok(res.bytes)
    }
}

/// Dataset description stored next to a local cell mirror.
#[derive(Debug, Clone)]
pub struct FileBootstrap {
    path: PathBuf,
}
impl FileBootstrap {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}
impl Bootstrap for FileBootstrap {
    fn fetch(&self) -> std::result::Result<Vec<u8>, String> {
        std::fs::read(&self.path).map_err(|e| format!("cannot read {}: {}", self.path.display(), e))
    }
}

/// Loads the dataset description at most once.
///
/// Concurrent callers wait for the load in progress. A failed load is not remembered, the next
/// call tries again.
pub struct MetadataLoader {
    bootstrap: Box<dyn Bootstrap>,
    loaded: Mutex<Option<Arc<DatasetMetadata>>>,
}
impl MetadataLoader {
    pub fn new(bootstrap: Box<dyn Bootstrap>) -> Self {
        Self {
            bootstrap,
            loaded: Mutex::new(None),
        }
    }

    pub fn load(&self) -> Result<Arc<DatasetMetadata>> {
        let mut loaded = self.loaded.lock();
        if let Some(metadata) = loaded.as_ref() {
            return Ok(metadata.clone());
        }

        let bytes = self.bootstrap.fetch().map_err(CacheError::MetadataUnavailable)?;
        let metadata = Arc::new(DatasetMetadata::from_json(&bytes)?);
        debug!(
            "Loaded metadata of {} timepoints and {} setups",
            metadata.max_timepoints, metadata.max_setups
        );
        *loaded = Some(metadata.clone());
        Ok(metadata)
    }
}
