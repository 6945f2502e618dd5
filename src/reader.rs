//! netCDF-backed granules.
//!
//! Each supported instrument has its own variable names and time convention;
//! [`Instrument`] holds these so that [`NcGranule`] can hand the matchup core
//! geolocation with times already in seconds since the Unix epoch.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use itertools::Itertools;
use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use serde::{Serialize, Deserialize};

use crate::accumulate::UpstreamColumns;
use crate::error::MatchupError;
use crate::granule::{from_one_based, BoundingBox, Geolocation, Granule, LocalCatalog, PixelIndex, TimeInterval};
use crate::grid::{GridNearestNeighbor, NodeTypeLookup};
use crate::matchup::PrimaryPixel;
use crate::output::varnames;
use crate::utils::{self, TAI93_UNIX_OFFSET};

/// Value used by several products to mark missing geolocation or time
pub const INPUT_FILL_VALUE: f64 = -9999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Instrument {
    /// AIRS level 2 retrievals, positions per AIRS sub-footprint and time per AMSU footprint
    Airs,
    /// CloudSat profiles, time composed from TAI_start, UTC_start and Profile_time
    #[value(name = "cloudsat")]
    #[serde(rename = "cloudsat")]
    CloudSat,
    /// CALIPSO profiles
    Calipso,
    /// Collocated AIRS-MODIS product
    AirsModis,
}

impl Instrument {
    pub fn name(&self) -> &'static str {
        match self {
            Instrument::Airs => "AIRS",
            Instrument::CloudSat => "CloudSat",
            Instrument::Calipso => "CALIPSO",
            Instrument::AirsModis => "AIRS-MODIS",
        }
    }

    /// Alternative latitude variable names, in order of preference
    fn lat_vars(&self) -> &'static [&'static str] {
        match self {
            Instrument::Airs => &["L2_Standard_atmospheric_surface_product_Data_Fields_latAIRS", "latAIRS"],
            Instrument::CloudSat | Instrument::Calipso => &["Latitude"],
            Instrument::AirsModis => &["Latitude_Point"],
        }
    }

    fn lon_vars(&self) -> &'static [&'static str] {
        match self {
            Instrument::Airs => &["L2_Standard_atmospheric_surface_product_Data_Fields_lonAIRS", "lonAIRS"],
            Instrument::CloudSat | Instrument::Calipso => &["Longitude"],
            Instrument::AirsModis => &["Longitude_Point"],
        }
    }

    fn time_vars(&self) -> &'static [&'static str] {
        match self {
            Instrument::Airs => &["L2_Standard_atmospheric_surface_product_Geolocation_Fields_Time", "Time"],
            Instrument::CloudSat => &["Profile_time"],
            Instrument::Calipso => &["Profile_Time"],
            Instrument::AirsModis => &["Time_Point_EV_start_time_"],
        }
    }

    /// Latitude and longitude variables of the coarser footprints, for instruments that have them
    fn footprint_vars(&self) -> Option<(&'static [&'static str], &'static [&'static str])> {
        match self {
            Instrument::Airs => Some((
                &["L2_Standard_atmospheric_surface_product_Geolocation_Fields_Latitude", "Latitude"],
                &["L2_Standard_atmospheric_surface_product_Geolocation_Fields_Longitude", "Longitude"],
            )),
            _ => None,
        }
    }

    /// Seconds added to the last pixel time to get the granule end time
    pub fn end_padding(&self) -> f64 {
        match self {
            // AIRS time stamps mark the start of each scan
            Instrument::Airs => 6.9999,
            _ => 0.0,
        }
    }

    /// Profile instruments store their 1-D arrays with a trailing length-1 dimension
    fn is_profile(&self) -> bool {
        matches!(self, Instrument::CloudSat | Instrument::Calipso)
    }

    fn has_fill_values(&self) -> bool {
        matches!(self, Instrument::AirsModis)
    }
}

/// Day start (Unix seconds) plus the UTC offset of the first profile, the
/// reference CloudSat profile times are relative to.
pub fn cloudsat_reference_time(tai_start: f64, utc_start: f64) -> f64 {
    ((tai_start + TAI93_UNIX_OFFSET) / 86400.0).floor() * 86400.0 + utc_start
}

/// A granule stored in a local netCDF file. Data are read on demand, except
/// the time interval and bounding box, which are kept after the first read.
#[derive(Debug, Clone)]
pub struct NcGranule {
    path: PathBuf,
    id: String,
    instrument: Instrument,
    extent: OnceLock<(TimeInterval, Option<BoundingBox>)>,
}

impl NcGranule {
    pub fn new(path: PathBuf, instrument: Instrument) -> Self {
        let id = path.file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, id, instrument, extent: OnceLock::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn instrument(&self) -> Instrument {
        self.instrument
    }

    fn open(&self) -> Result<netcdf::File, MatchupError> {
        netcdf::open(&self.path)
            .map_err(|e| MatchupError::from_nc_error(e, self.path.clone()))
    }

    fn read_times(&self, ds: &netcdf::File) -> Result<ArrayD<f64>, MatchupError> {
        let raw = utils::load_first_nc_var::<f64>(ds, self.instrument.time_vars())?;
        let times = match self.instrument {
            Instrument::CloudSat => {
                let tai_start = first_value(ds, "TAI_start")?;
                let utc_start = first_value(ds, "UTC_start")?;
                let reference = cloudsat_reference_time(tai_start, utc_start);
                debug!("{}: CloudSat profile reference time {reference}", self.id);
                raw.mapv(|t| t + reference)
            },
            _ if self.instrument.has_fill_values() => {
                // fill values must be masked before the epoch offset is added
                raw.mapv(|t| if t == INPUT_FILL_VALUE { f64::NAN } else { t + TAI93_UNIX_OFFSET })
            },
            _ => raw.mapv(|t| t + TAI93_UNIX_OFFSET),
        };
        Ok(times)
    }

    fn prepare(&self, arr: ArrayD<f64>, varname: &str) -> Result<ArrayD<f64>, MatchupError> {
        let arr = if self.instrument.is_profile() {
            flatten_profiles(arr).map_err(|e| MatchupError::from_shape_error(e, self.path.clone(), varname.to_owned()))?
        } else {
            arr
        };
        Ok(arr)
    }
}

impl Granule for NcGranule {
    fn id(&self) -> &str {
        &self.id
    }

    fn geolocation(&self) -> Result<Geolocation, MatchupError> {
        let ds = self.open()?;
        let lat = self.prepare(utils::load_first_nc_var::<f64>(&ds, self.instrument.lat_vars())?, "latitude")?;
        let lon = self.prepare(utils::load_first_nc_var::<f64>(&ds, self.instrument.lon_vars())?, "longitude")?;
        let time = self.prepare(self.read_times(&ds)?, "time")?;

        let (lat, lon) = if self.instrument.has_fill_values() {
            (mask_fill(lat), mask_fill(lon))
        } else {
            (lat, lon)
        };

        Geolocation::new(&self.id, lat, lon, time)
    }

    fn variable(&self, name: &str) -> Result<ArrayD<f64>, MatchupError> {
        let ds = self.open()?;
        utils::load_nc_var::<f64>(&ds, name)
    }

    fn time_interval(&self) -> Result<TimeInterval, MatchupError> {
        Ok(self.extent()?.0)
    }

    fn extent(&self) -> Result<(TimeInterval, Option<BoundingBox>), MatchupError> {
        if let Some(extent) = self.extent.get() {
            return Ok(*extent);
        }

        let geo = self.geolocation()?;
        let interval = geo.time_interval(self.instrument.end_padding())
            .ok_or_else(|| MatchupError::malformed(&self.id, "no valid pixel times"))?;
        let extent = (interval, geo.bounding_box());
        debug!("{}: spans {} to {}", self.id, interval.start, interval.end);
        Ok(*self.extent.get_or_init(|| extent))
    }

    fn footprint_geolocation(&self) -> Result<Option<Geolocation>, MatchupError> {
        let Some((lat_vars, lon_vars)) = self.instrument.footprint_vars() else {
            return Ok(None);
        };
        let ds = self.open()?;
        let lat = utils::load_first_nc_var::<f64>(&ds, lat_vars)?;
        let lon = utils::load_first_nc_var::<f64>(&ds, lon_vars)?;
        let time = self.read_times(&ds)?;
        Geolocation::new(&self.id, lat, lon, time).map(Some)
    }
}

fn first_value(ds: &netcdf::File, varname: &str) -> Result<f64, MatchupError> {
    let arr = utils::load_nc_var::<f64>(ds, varname)?;
    arr.iter()
        .next()
        .copied()
        .ok_or_else(|| MatchupError::malformed(utils::nc_file(ds).display(), format!("variable {varname} is empty")))
}

fn mask_fill(arr: ArrayD<f64>) -> ArrayD<f64> {
    arr.mapv(|v| if v == INPUT_FILL_VALUE { f64::NAN } else { v })
}

/// Collapse an (n, 1) profile array to (n,)
fn flatten_profiles(arr: ArrayD<f64>) -> Result<ArrayD<f64>, ndarray::ShapeError> {
    if arr.ndim() == 2 && arr.shape()[1] == 1 {
        let n = arr.shape()[0];
        arr.into_shape(IxDyn(&[n]))
    } else {
        Ok(arr)
    }
}

/// Granules for a list of local files, all of one instrument
pub fn granules_from_files(files: &[PathBuf], instrument: Instrument) -> Vec<NcGranule> {
    files.iter()
        .map(|f| NcGranule::new(f.clone(), instrument))
        .collect_vec()
}

/// A catalog over local files, for discovering candidates by time and bounds
pub fn local_catalog(files: &[PathBuf], instrument: Instrument) -> Result<LocalCatalog<NcGranule>, MatchupError> {
    info!("Indexing {} {} files", files.len(), instrument.name());
    LocalCatalog::new(granules_from_files(files, instrument))
}

/// Read the latitude and longitude axes of a regular grid and build the nearest
/// cell index over it. Returns the axes too, so cell centers can be looked up.
pub fn load_grid(path: &Path) -> Result<(GridNearestNeighbor, Vec<f64>, Vec<f64>), MatchupError> {
    let ds = netcdf::open(path)
        .map_err(|e| MatchupError::from_nc_error(e, path.to_owned()))?;
    let lat = utils::load_nc_var_1d::<f64>(&ds, "latitude")?.to_vec();
    let lon = utils::load_nc_var_1d::<f64>(&ds, "longitude")?.to_vec();
    let grid = GridNearestNeighbor::new(&lat, &lon)?;
    Ok((grid, lat, lon))
}

/// Scan node types ('A' or 'D' per scan) stored as the global `scan_node_type`
/// attribute of a file, concatenated over `files` in order.
pub fn load_node_types(files: &[PathBuf], rows_per_scan: usize) -> Result<NodeTypeLookup, MatchupError> {
    let mut lookup = NodeTypeLookup::from_str_codes("", rows_per_scan);
    for f in files {
        let ds = netcdf::open(f)
            .map_err(|e| MatchupError::from_nc_error(e, f.clone()))?;
        let codes = utils::get_str_attr_with_default(&ds, "scan_node_type", String::new())?;
        if codes.is_empty() {
            return Err(MatchupError::NetcdfMissingAttr { file: Some(f.clone()), attname: "scan_node_type".to_owned() });
        }
        lookup.extend(&NodeTypeLookup::from_str_codes(codes.trim(), rows_per_scan));
    }
    Ok(lookup)
}

/// Rows of an existing matchup product, read back to serve as the primary
/// pixels of a follow-on matchup (e.g. the CloudSat rows of an AIRS-CloudSat
/// product matched against CALIPSO). Each pixel's index is its row number, so
/// the follow-on product stays row-aligned with the input.
#[derive(Debug, Clone)]
pub struct PrimaryRows {
    pub file: PathBuf,
    pub pixels: Vec<PrimaryPixel>,
    /// The input product's 0-based primary and secondary indices and secondary
    /// source file of each row
    pub upstream: UpstreamColumns,
}

impl PrimaryRows {
    /// Read the secondary columns of a matchup product. Set `one_based` for
    /// products whose indices count from 1 (those written by MATLAB tools).
    pub fn from_netcdf(path: &Path, one_based: bool) -> Result<Self, MatchupError> {
        let ds = netcdf::open(path)
            .map_err(|e| MatchupError::from_nc_error(e, path.to_owned()))?;

        let lat = utils::load_nc_var_1d::<f64>(&ds, varnames::SECONDARY_LAT)?;
        let lon = utils::load_nc_var_1d::<f64>(&ds, varnames::SECONDARY_LON)?;
        let time = utils::load_nc_var_1d::<f64>(&ds, varnames::SECONDARY_TIME)?;
        let primary_index = load_index_var(&ds, path, varnames::PRIMARY_INDEX)?;
        let secondary_index = load_index_var(&ds, path, varnames::SECONDARY_INDEX)?;
        let source_pos = utils::load_nc_var_1d::<i64>(&ds, varnames::SOURCE_INDEX)?;
        let sources = utils::load_string_var(&ds, varnames::SOURCE_FILE)?;

        let n = lat.len();
        if lon.len() != n || time.len() != n || primary_index.nrows() != n || secondary_index.nrows() != n || source_pos.len() != n {
            return Err(MatchupError::InternalError(format!(
                "matchup file {} has columns of different lengths", path.display()
            )));
        }

        let unfill = |v: f64| if v == varnames::FLOAT_FILL { f64::NAN } else { v };
        let mut pixels = Vec::with_capacity(n);
        let mut upstream = UpstreamColumns::default();
        for row in 0..n {
            pixels.push(PrimaryPixel { index: vec![row], lat: unfill(lat[row]), lon: unfill(lon[row]), time: unfill(time[row]) });

            let prim = convert_index_row(primary_index.row(row), one_based)?
                .ok_or_else(|| MatchupError::malformed(path.display(), format!("row {row} has no primary index")))?;
            upstream.primary_index.push(prim);
            upstream.secondary_index.push(convert_index_row(secondary_index.row(row), one_based)?);

            let src = usize::try_from(source_pos[row]).ok()
                .and_then(|i| sources.get(i).cloned())
                .unwrap_or_default();
            upstream.source_file.push(src);
        }

        info!("Read {n} rows from {}", path.display());
        Ok(Self { file: path.to_owned(), pixels, upstream })
    }

    pub fn id(&self) -> String {
        self.file.file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| self.file.display().to_string())
    }
}

fn load_index_var(ds: &netcdf::File, path: &Path, varname: &str) -> Result<ndarray::Array2<i64>, MatchupError> {
    utils::load_nc_var::<i64>(ds, varname)?
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| MatchupError::from_shape_error(e, path.to_owned(), varname.to_owned()))
}

/// Drop fill values from one row of an index variable and make it 0-based.
/// An all-fill row is `None`.
fn convert_index_row(row: ndarray::ArrayView1<i64>, one_based: bool) -> Result<Option<PixelIndex>, MatchupError> {
    let fill = varnames::INDEX_FILL as i64;
    let raw = row.iter().copied().filter(|&v| v != fill).collect_vec();
    if raw.is_empty() {
        Ok(None)
    } else if one_based {
        Ok(Some(raw.into_iter().map(from_one_based).collect::<Result<Vec<_>, _>>()?))
    } else {
        Ok(Some(raw.into_iter().map(|v| v as usize).collect_vec()))
    }
}
