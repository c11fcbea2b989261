use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one resolution level of one setup at one timepoint.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewLevelId {
    pub timepoint: u32,
    pub setup: u32,
    pub level: u32,
}
impl ViewLevelId {
    pub fn new(timepoint: u32, setup: u32, level: u32) -> Self {
        Self {
            timepoint,
            setup,
            level,
        }
    }
    pub fn cell(&self, cell_index: u64) -> CellKey { CellKey::new(*self, cell_index) }
}
impl fmt::Display for ViewLevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}/s{}/l{}", self.timepoint, self.setup, self.level)
    }
}

/// Identity of a cached cell. The cell index is always derived through the indexer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub id: ViewLevelId,
    pub cell_index: u64,
}
impl CellKey {
    pub fn new(id: ViewLevelId, cell_index: u64) -> Self { Self { id, cell_index } }
}
impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/c{}", self.id, self.cell_index) }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadingStrategy {
    /// Wait until the cell holds authoritative data.
    Blocking,
    /// Never wait. Return what is resident and load the rest in the background.
    Budgeted,
}
