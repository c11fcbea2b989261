//! Mapping between voxel positions, cell grid positions and linear cell indices.
//!
//! Cells are numbered with x varying fastest, then y, then z. The remote server uses the same
//! numbering to serve individual cells, so this ordering must not change.

/// Grid position of the cell containing `global_pos`.
pub fn cell_position(global_pos: [u64; 3], cell_size: [u32; 3]) -> [u64; 3] {
    [
        global_pos[0] / cell_size[0] as u64,
        global_pos[1] / cell_size[1] as u64,
        global_pos[2] / cell_size[2] as u64,
    ]
}

pub fn cell_index(cell_pos: [u64; 3], grid: [u64; 3]) -> u64 {
    cell_pos[0] + grid[0] * (cell_pos[1] + grid[1] * cell_pos[2])
}

pub fn index_to_position(index: u64, grid: [u64; 3]) -> [u64; 3] {
    let x = index % grid[0];
    let rest = index / grid[0];
    [x, rest % grid[1], rest / grid[1]]
}

/// Number of cells per axis needed to cover `dims`.
pub fn grid_dimensions(dims: [u64; 3], cell_size: [u32; 3]) -> [u64; 3] {
    [0usize, 1, 2].map(|d| dims[d].div_ceil(cell_size[d] as u64))
}

pub fn num_cells(grid: [u64; 3]) -> u64 { grid[0] * grid[1] * grid[2] }

/// Voxel position of the first voxel of the cell at `cell_pos`.
pub fn cell_min(cell_pos: [u64; 3], cell_size: [u32; 3]) -> [u64; 3] {
    [0usize, 1, 2].map(|d| cell_pos[d] * cell_size[d] as u64)
}

/// Extent of the cell at `cell_pos`. Cells at the upper border are clipped to the image.
pub fn cell_dimensions(cell_pos: [u64; 3], dims: [u64; 3], cell_size: [u32; 3]) -> [u32; 3] {
    let min = cell_min(cell_pos, cell_size);
    [0usize, 1, 2].map(|d| (dims[d].saturating_sub(min[d])).min(cell_size[d] as u64) as u32)
}

/// Offset of `global_pos` inside its cell's sample buffer.
pub fn offset_in_cell(global_pos: [u64; 3], cell_pos: [u64; 3], cell_size: [u32; 3], cell_dims: [u32; 3]) -> usize {
    let min = cell_min(cell_pos, cell_size);
    let x = (global_pos[0] - min[0]) as usize;
    let y = (global_pos[1] - min[1]) as usize;
    let z = (global_pos[2] - min[2]) as usize;
    x + cell_dims[0] as usize * (y + cell_dims[1] as usize * z)
}
