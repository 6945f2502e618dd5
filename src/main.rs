use std::path::{Path, PathBuf};

use atrain_matchup::{
    accumulate::MatchupIndex,
    config::{CloudSatSource, RunAirsCloudSatArgs, RunCloudSatCalipsoArgs, RunGridArgs, RunMultiArgs, RunMultiConfig, RunOneConfig},
    error::MatchupError,
    granule::{Granule, GranuleCatalog},
    grid::NodeTypeLookup,
    matchup::{self, InstrumentPair, OneToOneOptions},
    output::{self, ProductDirGuard},
    reader::{self, Instrument, NcGranule, PrimaryRows},
    utils::ShowProgress,
};
use clap::{Parser, Subcommand};
use log::{error, info};
use rayon::prelude::*;

fn main() -> Result<(), MatchupError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = MainArgs::parse();

    match args.command {
        Commands::AirsCloudsat(run_args) => { run_airs_cloudsat(&run_args)?; },
        Commands::CloudsatCalipso(run_args) => { run_cloudsat_calipso(&run_args, ShowProgress::Yes)?; },
        Commands::AmsrGrid(run_args) => { run_grid(&run_args)?; },
        Commands::Multi(multi_args) => driver_multi(&multi_args)?,
    }
    Ok(())
}

fn run_one(cfg: &RunOneConfig, show_progress: ShowProgress) -> Result<PathBuf, MatchupError> {
    match cfg {
        RunOneConfig::AirsCloudsat(a) => run_airs_cloudsat(a),
        RunOneConfig::CloudsatCalipso(a) => run_cloudsat_calipso(a, show_progress),
        RunOneConfig::AmsrGrid(a) => run_grid(a),
    }
}

fn driver_multi(args: &RunMultiArgs) -> Result<(), MatchupError> {
    let cfg_str = std::fs::read_to_string(&args.config_file)?;
    let cfg = RunMultiConfig::from_toml_str(&cfg_str)?;
    info!("Running {} matchups from {}", cfg.matchups.len(), args.config_file.display());

    let mut pool = rayon::ThreadPoolBuilder::new();
    if let Some(n) = args.num_threads {
        pool = pool.num_threads(n);
    }
    let pool = pool.build()
        .map_err(|e| MatchupError::InternalError(format!("could not start thread pool: {e}")))?;

    let mbar = indicatif::MultiProgress::new();
    let results = pool.install(|| {
        cfg.matchups.par_iter()
            .map(|m| (m.product_dir(), run_one(m, ShowProgress::Multi(mbar.clone()))))
            .collect::<Vec<_>>()
    });

    let mut n_failed = 0;
    for (dir, res) in results {
        match res {
            Ok(nc_file) => info!("Wrote {}", nc_file.display()),
            Err(e) => {
                error!("Matchup for {} failed: {e}", dir.display());
                n_failed += 1;
            }
        }
    }

    if n_failed > 0 {
        Err(MatchupError::InternalError(format!("{n_failed} of {} matchups failed", cfg.matchups.len())))
    } else {
        Ok(())
    }
}

fn run_airs_cloudsat(args: &RunAirsCloudSatArgs) -> Result<PathBuf, MatchupError> {
    let tolerances = args.tolerances.tolerances()?;
    let mut guard = ProductDirGuard::create(&args.product_dir)?;

    let airs = NcGranule::new(args.airs_file.clone(), Instrument::Airs);
    let (interval, bbox) = airs.extent()?;
    let catalog = reader::local_catalog(&args.cloudsat_files, Instrument::CloudSat)?;
    let candidates = catalog.find_candidates(interval, bbox.as_ref())?;

    let names = InstrumentPair::new(Instrument::Airs.name(), Instrument::CloudSat.name());
    let mut index = matchup::match_many_to_one(&airs, candidates, &tolerances, &names)?;
    record_inputs(&mut index, &args.airs_file, &args.cloudsat_files)?;

    let nc_file = output::save_product(&index, &mut guard, &product_stem(&args.airs_file, Instrument::CloudSat.name()))?;
    guard.commit();
    Ok(nc_file)
}

fn run_cloudsat_calipso(args: &RunCloudSatCalipsoArgs, show_progress: ShowProgress) -> Result<PathBuf, MatchupError> {
    let tolerances = args.tolerances.tolerances()?;
    let mut guard = ProductDirGuard::create(&args.product_dir)?;

    let (primary_id, pixels, upstream) = match args.cloudsat_source {
        CloudSatSource::MatchupFile => {
            let rows = PrimaryRows::from_netcdf(&args.cloudsat_file, args.one_based)?;
            (rows.id(), rows.pixels, Some(rows.upstream))
        },
        CloudSatSource::Granule => {
            let granule = NcGranule::new(args.cloudsat_file.clone(), Instrument::CloudSat);
            (granule.id().to_owned(), matchup::primary_pixels(&granule.geolocation()?), None)
        },
    };

    let catalog = reader::local_catalog(&args.calipso_files, Instrument::Calipso)?;
    let window = matchup::pixels_time_interval(&pixels)
        .ok_or_else(|| MatchupError::malformed(&primary_id, "no valid CloudSat pixel times"))?;
    let candidates = catalog.find_candidates(window, None)?;

    let names = InstrumentPair::new(Instrument::CloudSat.name(), Instrument::Calipso.name());
    let options = OneToOneOptions { rule: args.selection, tolerate_empty: args.tolerate_empty };
    let mut index = matchup::match_one_to_one(
        &primary_id, &pixels, candidates, &tolerances, options, &names, &show_progress
    )?;
    if let Some(upstream) = upstream {
        index = index.with_upstream(upstream)?;
    }
    record_inputs(&mut index, &args.cloudsat_file, &args.calipso_files)?;

    let nc_file = output::save_product(&index, &mut guard, &product_stem(&args.cloudsat_file, Instrument::Calipso.name()))?;
    guard.commit();
    Ok(nc_file)
}

fn run_grid(args: &RunGridArgs) -> Result<PathBuf, MatchupError> {
    let mut guard = ProductDirGuard::create(&args.product_dir)?;

    let nodes = match &args.node_types {
        Some(codes) => NodeTypeLookup::from_str_codes(codes, args.rows_per_scan),
        None if !args.node_type_files.is_empty() => reader::load_node_types(&args.node_type_files, args.rows_per_scan)?,
        None => return Err(MatchupError::InvalidConfig(
            "gridded matchups need either --node-types or --node-type-files".to_owned()
        )),
    };

    let primary = NcGranule::new(args.primary_file.clone(), args.primary_instrument);
    let (grid, grid_lat, grid_lon) = reader::load_grid(&args.grid_file)?;
    let grid_id = file_name(&args.grid_file);

    let names = InstrumentPair::new(args.primary_instrument.name(), "AMSR");
    let mut index = matchup::match_to_grid(&primary, &grid, &grid_lat, &grid_lon, &nodes, &grid_id, &names)?;

    let mut inputs = vec![args.primary_file.clone(), args.grid_file.clone()];
    inputs.extend(args.node_type_files.iter().cloned());
    index.header.input_files = output::checksum_inputs(&inputs)?;

    let nc_file = output::save_product(&index, &mut guard, &product_stem(&args.primary_file, "AMSR"))?;
    guard.commit();
    Ok(nc_file)
}

/// Checksum the primary file and whichever secondary files contributed rows
fn record_inputs(index: &mut MatchupIndex, primary_file: &Path, secondary_files: &[PathBuf]) -> Result<(), MatchupError> {
    let mut inputs = vec![primary_file.to_owned()];
    inputs.extend(
        secondary_files.iter()
            .filter(|f| index.sources.contains(&file_name(f)))
            .cloned()
    );
    index.header.input_files = output::checksum_inputs(&inputs)?;
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn product_stem(primary_file: &Path, secondary: &str) -> String {
    let stem = primary_file.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "matchup".to_owned());
    format!("{stem}_{}_matchup", secondary.to_lowercase())
}

/// Collocate pixels between A-Train instruments
#[derive(Debug, Parser)]
struct MainArgs {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match every CloudSat profile near an AIRS granule to its nearest AIRS footprint
    AirsCloudsat(RunAirsCloudSatArgs),
    /// Match each CloudSat pixel to at most one CALIPSO pixel
    CloudsatCalipso(RunCloudSatCalipsoArgs),
    /// Snap each pixel of a primary granule to the nearest cell of a gridded AMSR product
    AmsrGrid(RunGridArgs),
    /// Run several matchups listed in a TOML file, in parallel
    Multi(RunMultiArgs),
}
