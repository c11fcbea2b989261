use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of background fetch threads.
    pub num_fetcher_threads: usize,
    /// Upper bound of cells kept in memory. The least recently used cells are evicted beyond that.
    pub max_resident_cells: usize,
    /// How long a blocking request waits for a fetch in flight. `None` waits indefinitely.
    pub blocking_timeout_ms: Option<u64>,
}
impl CacheConfig {
    pub fn blocking_timeout(&self) -> Option<Duration> { self.blocking_timeout_ms.map(Duration::from_millis) }
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_fetcher_threads: 10.max(num_cpus::get()),
            max_resident_cells: 16 * 1024,
            blocking_timeout_ms: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Dataset URL on the image server, e.g. `http://localhost:8080/dataset/`.
    pub base_url: String,
    /// `user:password` for HTTP basic authorization.
    pub authorization: Option<String>,
    pub cache: CacheConfig,
    /// Value used for images that the dataset declares missing.
    pub missing_value: u16,
}
impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> { serde_json::from_str(json) }
}
impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/".to_string(),
            authorization: None,
            cache: CacheConfig::default(),
            missing_value: 0,
        }
    }
}
