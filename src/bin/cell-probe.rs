use anyhow::{Context, Result};
use clap::Parser;
use remote_cell_cache::bootstrap::FileBootstrap;
use remote_cell_cache::indexer;
use remote_cell_cache::source::DirCellSource;
use remote_cell_cache::volume::VoxelVolume;
use remote_cell_cache::{LoadingStrategy, RemoteSession, SessionConfig, ViewLevelId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Inspect a remote cell dataset: print its layout, sample voxels or mirror an image locally.
#[derive(Parser, Debug)]
#[command(name = "cell-probe")]
#[command(version)]
struct Args {
    /// Dataset URL, e.g. http://localhost:8080/dataset/
    url: Option<String>,

    /// Session configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read from a local mirror instead of the server
    #[arg(long, conflicts_with = "url")]
    mirror: Option<PathBuf>,

    /// user:password for basic authorization
    #[arg(long)]
    auth: Option<String>,

    #[arg(short, long, default_value_t = 0)]
    timepoint: u32,

    #[arg(short, long, default_value_t = 0)]
    setup: u32,

    #[arg(short, long, default_value_t = 0)]
    level: u32,

    /// Voxel to sample as x,y,z (repeatable)
    #[arg(long = "voxel", value_parser = parse_voxel)]
    voxels: Vec<[u64; 3]>,

    /// Sample without waiting, polling until the data arrived
    #[arg(long)]
    budgeted: bool,

    /// Download all cells of the selected image into this directory
    #[arg(long)]
    save_mirror: Option<PathBuf>,
}

fn parse_voxel(s: &str) -> Result<[u64; 3], String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<u64>().map_err(|e| format!("{}: {}", p, e)))
        .collect::<Result<Vec<_>, _>>()?;
    <[u64; 3]>::try_from(parts).map_err(|_| format!("expected x,y,z but got '{}'", s))
}

fn main() -> Result<()> {
    env_logger::init(); // Log to stderr (if you run with `RUST_LOG=debug`).
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            SessionConfig::from_json(&json).context("Invalid session configuration")?
        }
        None => SessionConfig::default(),
    };
    if let Some(url) = &args.url {
        config.base_url = url.clone();
    }
    if args.auth.is_some() {
        config.authorization = args.auth.clone();
    }

    let session = match &args.mirror {
        Some(dir) => RemoteSession::open(
            Box::new(FileBootstrap::new(dir.join("init.json"))),
            Arc::new(DirCellSource::new(dir)),
            &config,
        )?,
        None => RemoteSession::connect(&config).with_context(|| format!("Cannot open {}", config.base_url))?,
    };
    print_summary(&session);

    let id = ViewLevelId::new(args.timepoint, args.setup, args.level);
    let loader = session.setup_loader(args.setup)?;
    let mut image = if args.budgeted {
        loader.volatile_image(args.timepoint, args.level)?
    } else {
        loader.image(args.timepoint, args.level)?
    };
    for voxel in &args.voxels {
        let deadline = Instant::now() + Duration::from_secs(30);
        let sample = loop {
            let sample = image.get(*voxel)?;
            if sample.valid || Instant::now() > deadline {
                break sample;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        println!(
            "{} {:?} = {}{}",
            id,
            voxel,
            sample.value,
            if sample.valid { "" } else { " (not loaded)" }
        );
    }

    if let Some(dir) = &args.save_mirror {
        save_mirror(&session, id, dir)?;
    }

    println!("{:?}", session.cache().stats());
    Ok(())
}

fn print_summary(session: &RemoteSession) {
    let metadata = session.metadata();
    println!(
        "{} timepoints, {} setups, up to {} levels",
        metadata.max_timepoints, metadata.max_setups, metadata.max_levels
    );
    for setup in metadata.setups() {
        let Some(info) = metadata.mipmap_info(setup) else {
            continue;
        };
        for (level, (resolution, cell_size)) in info.resolutions.iter().zip(info.subdivisions.iter()).enumerate() {
            let id = ViewLevelId::new(0, setup, level as u32);
            let dims = metadata
                .dims_and_existence(id)
                .ok()
                .and_then(|d| d.dimensions)
                .map(|d| format!("{:?}", d))
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "  setup {} level {}: resolution {:?}, cells {:?}, size at t0 {}",
                setup, level, resolution, cell_size, dims
            );
        }
    }
}

fn save_mirror(session: &RemoteSession, id: ViewLevelId, dir: &Path) -> Result<()> {
    let mirror = DirCellSource::new(dir);
    let num_cells = indexer::num_cells(session.metadata().grid(id)?);
    println!("Saving {} cells of {} to {}", num_cells, id, dir.display());

    for index in 0..num_cells {
        let cell = session.cache().get(id.cell(index), LoadingStrategy::Blocking)?;
        mirror
            .store(&cell.key, cell.data())
            .with_context(|| format!("Failed to store cell {}", cell.key))?;
    }
    std::fs::write(dir.join("init.json"), session.metadata().to_json()).context("Failed to write init.json")?;
    Ok(())
}
