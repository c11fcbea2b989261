use crate::model::CellKey;
use base64::Engine;
use log::debug;
use std::path::PathBuf;

/// A cell together with the voxel interval it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellRequest {
    pub key: CellKey,
    pub min: [u64; 3],
    pub dims: [u32; 3],
}
impl CellRequest {
    pub fn num_samples(&self) -> usize { self.dims.iter().map(|d| *d as usize).product() }
}

/// Where cell contents come from. Called concurrently from the fetch workers.
///
/// Errors are plain descriptions; the cache turns them into `FetchFailed`.
pub trait CellSource: Send + Sync {
    fn fetch(&self, request: &CellRequest) -> Result<Vec<u16>, String>;
}

impl<F> CellSource for F
where
    F: Fn(&CellRequest) -> Result<Vec<u16>, String> + Send + Sync,
{
    fn fetch(&self, request: &CellRequest) -> Result<Vec<u16>, String> { self(request) }
}

/// Samples are transferred as big endian 16 bit values.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<u16>, String> {
    if bytes.len() % 2 != 0 {
        return Err(format!("odd payload length {}", bytes.len()));
    }
    Ok(bytes.chunks_exact(2).map(|b| u16::from_be_bytes([b[0], b[1]])).collect())
}
pub fn encode_samples(samples: &[u16]) -> Vec<u8> { samples.iter().flat_map(|s| s.to_be_bytes()).collect() }

pub(crate) fn basic_authorization(authorization: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(authorization)
    )
}

/// Fetches cells from an image server over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCellSource {
    base_url: String,
    authorization: Option<String>,
}
impl HttpCellSource {
    pub fn new(base_url: &str, authorization: Option<String>) -> Self {
        Self {
            base_url: base_url.to_string(),
            authorization,
        }
    }

    pub fn cell_url(&self, request: &CellRequest) -> String {
        let CellRequest { key, min, dims } = request;
        format!(
            "{}?p=cell/{}/{}/{}/{}/{}/{}/{}/{}/{}/{}",
            self.base_url,
            key.cell_index,
            key.id.timepoint,
            key.id.setup,
            key.id.level,
            dims[0],
            dims[1],
            dims[2],
            min[0],
            min[1],
            min[2]
        )
    }
}
impl CellSource for HttpCellSource {
    fn fetch(&self, request: &CellRequest) -> Result<Vec<u16>, String> {
        let url = self.cell_url(request);
        debug!("Downloading cell {} from {}", request.key, url);

        let mut http_request = ehttp::Request::get(url);
        if let Some(authorization) = &self.authorization {
            http_request
                .headers
                .insert("Authorization", basic_authorization(authorization));
        }
        let res = ehttp::fetch_blocking(&http_request)?;
        if res.status != 200 {
            return Err(format!("server responded with {} {}", res.status, res.status_text));
        }
        decode_samples(&res.bytes)
    }
}

/// Reads cells from a local mirror of the remote dataset, one file per cell.
#[derive(Debug, Clone)]
pub struct DirCellSource {
    data_dir: PathBuf,
}
impl DirCellSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn cell_path(&self, key: &CellKey) -> PathBuf {
        self.data_dir
            .join(format!("t{:05}", key.id.timepoint))
            .join(format!("s{:02}", key.id.setup))
            .join(format!("l{:02}", key.id.level))
            .join(format!("{}.bin", key.cell_index))
    }

    /// Stores a cell in the mirror layout.
    pub fn store(&self, key: &CellKey, samples: &[u16]) -> std::io::Result<()> {
        let path = self.cell_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, encode_samples(samples))
    }
}
impl CellSource for DirCellSource {
    fn fetch(&self, request: &CellRequest) -> Result<Vec<u16>, String> {
        let path = self.cell_path(&request.key);
        let bytes = std::fs::read(&path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        decode_samples(&bytes)
    }
}
