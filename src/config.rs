use std::path::PathBuf;

use clap::Args;
use serde::{Serialize, Deserialize};

use crate::error::MatchupError;
use crate::grid::NodeTypeLookup;
use crate::reader::Instrument;
use crate::select::{SelectionRule, Tolerances};

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct ToleranceArgs {
    /// Maximum distance in kilometers between matched pixels
    #[clap(short = 'd', long, default_value_t = Tolerances::default_distance_km())]
    #[serde(default = "Tolerances::default_distance_km")]
    pub distance_tolerance_km: f64,

    /// Maximum time difference in seconds between matched pixels. Also limits how
    /// far the closest secondary granule may be from the primary granule when none
    /// overlaps it.
    #[clap(short = 't', long, default_value_t = Tolerances::default_time_s())]
    #[serde(default = "Tolerances::default_time_s")]
    pub time_tolerance_s: f64,
}

impl Default for ToleranceArgs {
    fn default() -> Self {
        Self { distance_tolerance_km: Tolerances::default_distance_km(), time_tolerance_s: Tolerances::default_time_s() }
    }
}

impl ToleranceArgs {
    pub fn tolerances(&self) -> Result<Tolerances, MatchupError> {
        Tolerances::new(self.distance_tolerance_km, self.time_tolerance_s)
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct RunAirsCloudSatArgs {
    /// Directory to write the matchup product into. It is removed again if the matchup fails.
    pub product_dir: PathBuf,

    /// Path to the AIRS level 2 granule (netCDF) to find CloudSat matches for
    pub airs_file: PathBuf,

    /// Paths to the CloudSat granules (netCDF) to search. Only those near the AIRS
    /// granule in time and space are used. You must specify at least one.
    #[clap(required = true)]
    pub cloudsat_files: Vec<PathBuf>,

    #[clap(flatten)]
    #[serde(default)]
    pub tolerances: ToleranceArgs,
}

/// Where the CloudSat pixels of a CloudSat-CALIPSO matchup come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CloudSatSource {
    /// The CloudSat rows of an AIRS-CloudSat matchup product; output rows align with its rows
    #[default]
    MatchupFile,
    /// Every profile of a CloudSat granule
    Granule,
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct RunCloudSatCalipsoArgs {
    /// Directory to write the matchup product into. It is removed again if the matchup fails.
    pub product_dir: PathBuf,

    /// Path to the file providing the CloudSat pixels, see --cloudsat-source
    pub cloudsat_file: PathBuf,

    /// Paths to the CALIPSO granules (netCDF) to search. You must specify at least one.
    #[clap(required = true)]
    pub calipso_files: Vec<PathBuf>,

    /// What kind of file CLOUDSAT_FILE is
    #[clap(long, value_enum, default_value_t = CloudSatSource::default())]
    #[serde(default)]
    pub cloudsat_source: CloudSatSource,

    /// Set this flag if the indices in an input matchup file count from 1 rather than 0
    #[clap(long)]
    #[serde(default)]
    pub one_based: bool,

    /// Which tolerance-passing CALIPSO pixel to keep for each CloudSat pixel
    #[clap(long, value_enum, default_value_t = SelectionRule::default())]
    #[serde(default)]
    pub selection: SelectionRule,

    /// If no CALIPSO granule is found near the CloudSat pixels, write a product
    /// with every row unmatched instead of failing
    #[clap(long)]
    #[serde(default)]
    pub tolerate_empty: bool,

    #[clap(flatten)]
    #[serde(default)]
    pub tolerances: ToleranceArgs,
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct RunGridArgs {
    /// Directory to write the matchup product into. It is removed again if the matchup fails.
    pub product_dir: PathBuf,

    /// Path to the primary granule whose pixels are snapped to the grid
    pub primary_file: PathBuf,

    /// Path to the gridded product, which must have 1-D "latitude" and "longitude" variables
    pub grid_file: PathBuf,

    /// Instrument of the primary granule
    #[clap(long, value_enum, default_value_t = Instrument::AirsModis)]
    #[serde(default = "RunGridArgs::default_instrument")]
    pub primary_instrument: Instrument,

    /// Scan node types of the primary granule, one 'A' (ascending) or 'D' (descending)
    /// per scan. Either this or --node-type-files is required.
    #[clap(long)]
    #[serde(default)]
    pub node_types: Option<String>,

    /// Files whose global "scan_node_type" attributes give the scan node types, in scan order
    #[clap(long, num_args = 1..)]
    #[serde(default)]
    pub node_type_files: Vec<PathBuf>,

    /// Number of primary along-track rows per scan
    #[clap(long, default_value_t = NodeTypeLookup::DEFAULT_ROWS_PER_SCAN)]
    #[serde(default = "RunGridArgs::default_rows_per_scan")]
    pub rows_per_scan: usize,
}

impl RunGridArgs {
    fn default_instrument() -> Instrument {
        Instrument::AirsModis
    }

    fn default_rows_per_scan() -> usize {
        NodeTypeLookup::DEFAULT_ROWS_PER_SCAN
    }
}

/// One entry of a multi-matchup configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOneConfig {
    AirsCloudsat(RunAirsCloudSatArgs),
    CloudsatCalipso(RunCloudSatCalipsoArgs),
    AmsrGrid(RunGridArgs),
}

impl RunOneConfig {
    pub fn product_dir(&self) -> &PathBuf {
        match self {
            RunOneConfig::AirsCloudsat(a) => &a.product_dir,
            RunOneConfig::CloudsatCalipso(a) => &a.product_dir,
            RunOneConfig::AmsrGrid(a) => &a.product_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMultiConfig {
    pub matchups: Vec<RunOneConfig>
}

impl RunMultiConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, MatchupError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), MatchupError> {
        for m in self.matchups.iter() {
            match m {
                RunOneConfig::AirsCloudsat(a) => { a.tolerances.tolerances()?; },
                RunOneConfig::CloudsatCalipso(a) => { a.tolerances.tolerances()?; },
                RunOneConfig::AmsrGrid(a) => {
                    if a.node_types.is_none() && a.node_type_files.is_empty() {
                        return Err(MatchupError::InvalidConfig(format!(
                            "gridded matchup for {} needs node_types or node_type_files", a.primary_file.display()
                        )));
                    }
                },
            }
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct RunMultiArgs {
    /// Path to the TOML configuration file that specifies how to run multiple matchups
    pub config_file: PathBuf,

    /// Maximum number of matchups to run at once. Default is one per CPU.
    #[clap(short = 'n', long)]
    pub num_threads: Option<usize>,
}
