//! Serializing a finished matchup: the netCDF product, a plain text summary, and
//! the product directory that is removed again if a run fails.
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{info, warn};
use ndarray::{Array1, Array2};

use crate::accumulate::MatchupIndex;
use crate::error::MatchupError;
use crate::granule::PixelIndex;
use crate::utils::{self, date_and_time_strings};

/// Names and fill values of the matchup product's dimensions and variables
pub mod varnames {
    pub const MATCHUP_DIM: &str = "matchup";
    pub const PRIMARY_NDIM: &str = "primary_ndim";
    pub const SECONDARY_NDIM: &str = "secondary_ndim";
    pub const SOURCE_DIM: &str = "source";
    pub const INPUT_DIM: &str = "input";
    pub const UPSTREAM_PRIMARY_NDIM: &str = "input_primary_ndim";
    pub const UPSTREAM_SECONDARY_NDIM: &str = "input_secondary_ndim";

    pub const PRIMARY_INDEX: &str = "primary_index";
    pub const PRIMARY_LAT: &str = "primary_lat";
    pub const PRIMARY_LON: &str = "primary_lon";
    pub const PRIMARY_TIME: &str = "primary_time";
    pub const SECONDARY_INDEX: &str = "secondary_index";
    pub const SECONDARY_LAT: &str = "secondary_lat";
    pub const SECONDARY_LON: &str = "secondary_lon";
    pub const SECONDARY_TIME: &str = "secondary_time";
    pub const SOURCE_INDEX: &str = "source_index";
    pub const SOURCE_FILE: &str = "source_file";
    pub const DISTANCE: &str = "distance";
    pub const TIME_DIFF: &str = "time_diff";
    pub const INPUT_FILE: &str = "input_file";
    pub const INPUT_SHA256: &str = "input_file_sha256";
    pub const FOOTPRINT_LAT: &str = "primary_footprint_lat";
    pub const FOOTPRINT_LON: &str = "primary_footprint_lon";
    pub const FOOTPRINT_TIME: &str = "primary_footprint_time";
    pub const UPSTREAM_PRIMARY_INDEX: &str = "input_primary_index";
    pub const UPSTREAM_SECONDARY_INDEX: &str = "input_secondary_index";
    pub const UPSTREAM_SOURCE_FILE: &str = "input_source_file";

    pub const INDEX_FILL: i32 = -9999;
    pub const FLOAT_FILL: f64 = -9999.0;
}

const TIME_UNITS: &str = "seconds since 1970-01-01T00:00:00Z";

/// Value of one header attribute
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Float(f64),
    Int(i64),
}

impl Display for HeaderValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderValue::Str(s) => write!(f, "{s}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
            HeaderValue::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<HeaderValue> for netcdf::AttrValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::Str(s) => netcdf::AttrValue::Str(s),
            HeaderValue::Float(v) => netcdf::AttrValue::Double(v),
            HeaderValue::Int(v) => netcdf::AttrValue::Longlong(v),
        }
    }
}

/// Global attributes describing a matchup, in the order they are written
pub fn header_attributes(index: &MatchupIndex) -> Vec<(&'static str, HeaderValue)> {
    let h = &index.header;
    let mut attrs = vec![
        ("VERSION", HeaderValue::Str(h.version.clone())),
        ("PRODUCTIONDATE", HeaderValue::Str(h.production_date.clone())),
        ("PRIMARY_INSTRUMENT", HeaderValue::Str(h.primary_instrument.clone())),
        ("SECONDARY_INSTRUMENT", HeaderValue::Str(h.secondary_instrument.clone())),
        ("PRIMARY_GRANULE", HeaderValue::Str(h.primary_granule.clone())),
        ("MATCHUP_MODE", HeaderValue::Str(h.mode.description().to_owned())),
    ];

    if let Some(tr) = &h.time_range {
        let (begin_date, begin_time) = date_and_time_strings(tr.start);
        let (end_date, end_time) = date_and_time_strings(tr.end);
        attrs.push(("RANGEBEGINNINGDATE", HeaderValue::Str(begin_date)));
        attrs.push(("RANGEBEGINNINGTIME", HeaderValue::Str(begin_time)));
        attrs.push(("RANGEENDINGDATE", HeaderValue::Str(end_date)));
        attrs.push(("RANGEENDINGTIME", HeaderValue::Str(end_time)));
    }

    if let Some(bb) = &h.bounding_box {
        attrs.push(("NORTHBOUNDINGCOORDINATE", HeaderValue::Float(bb.north)));
        attrs.push(("SOUTHBOUNDINGCOORDINATE", HeaderValue::Float(bb.south)));
        attrs.push(("EASTBOUNDINGCOORDINATE", HeaderValue::Float(bb.east)));
        attrs.push(("WESTBOUNDINGCOORDINATE", HeaderValue::Float(bb.west)));
    }

    if let Some(tol) = &h.tolerances {
        attrs.push(("DISTANCE_TOLERANCE", HeaderValue::Float(tol.distance_km)));
        attrs.push(("TIME_TOLERANCE", HeaderValue::Float(tol.time_s)));
    }

    attrs.push(("MATCHUP_ROWS", HeaderValue::Int(index.len() as i64)));
    attrs.push(("MATCHED_ROWS", HeaderValue::Int(index.num_matched() as i64)));
    if let Some(d) = index.mean_distance_km() {
        attrs.push(("MEAN_DISTANCE", HeaderValue::Float(d)));
    }
    if let Some(dt) = index.mean_time_diff_s() {
        attrs.push(("MEAN_TIME_DIFF", HeaderValue::Float(dt)));
    }
    attrs
}

/// Checksum each local input file for the product header
pub fn checksum_inputs(files: &[PathBuf]) -> Result<Vec<(PathBuf, String)>, MatchupError> {
    files.iter()
        .map(|f| Ok((f.clone(), utils::file_sha256(f)?)))
        .collect()
}

fn index_array(rows: &[Option<&PixelIndex>]) -> Array2<i32> {
    let width = rows.iter().flatten().map(|r| r.len()).max().unwrap_or(1).max(1);
    let mut arr = Array2::from_elem((rows.len(), width), varnames::INDEX_FILL);
    for (i, row) in rows.iter().enumerate() {
        if let Some(idx) = row {
            for (j, &v) in idx.iter().enumerate() {
                arr[[i, j]] = v as i32;
            }
        }
    }
    arr
}

/// Missing and non-finite values become the fill value
fn float_column(values: &[Option<f64>]) -> Array1<f64> {
    values.iter()
        .map(|v| v.filter(|x| x.is_finite()).unwrap_or(varnames::FLOAT_FILL))
        .collect()
}

/// Write a matchup to a new netCDF file. Unmatched rows are written with fill
/// values in every secondary column, as are the time columns of gridded rows.
/// Footprint and upstream columns are written only when the matchup has them.
pub fn write_netcdf(index: &MatchupIndex, path: &Path) -> Result<(), MatchupError> {
    use varnames::*;

    info!("Writing matchup file {}", path.display());
    let mut ds = netcdf::create(path)
        .map_err(|e| MatchupError::from_nc_error(e, path.to_owned()))?;

    for (name, value) in header_attributes(index) {
        ds.add_attribute(name, netcdf::AttrValue::from(value))
            .map_err(|e| MatchupError::from_nc_error(e, path.to_owned()))?;
    }

    let cols = &index.columns;
    let primary_index = index_array(&cols.primary_index.iter().map(Some).collect_vec());
    let secondary_index = index_array(&cols.secondary_index.iter().map(|s| s.as_ref()).collect_vec());
    let source_index: Array1<i32> = cols.source.iter()
        .map(|s| s.map(|i| i as i32).unwrap_or(INDEX_FILL))
        .collect();

    let dims = [
        (MATCHUP_DIM, index.len()),
        (PRIMARY_NDIM, primary_index.ncols()),
        (SECONDARY_NDIM, secondary_index.ncols()),
        (SOURCE_DIM, index.sources.len()),
        (INPUT_DIM, index.header.input_files.len()),
    ];
    for (name, len) in dims {
        ds.add_dimension(name, len)
            .map_err(|e| MatchupError::from_nc_error(e, path.to_owned()))?;
    }

    let upstream_arrays = index.upstream.as_ref().map(|up| (
        index_array(&up.primary_index.iter().map(Some).collect_vec()),
        index_array(&up.secondary_index.iter().map(|s| s.as_ref()).collect_vec()),
    ));
    if let Some((up_primary, up_secondary)) = &upstream_arrays {
        for (name, len) in [(UPSTREAM_PRIMARY_NDIM, up_primary.ncols()), (UPSTREAM_SECONDARY_NDIM, up_secondary.ncols())] {
            ds.add_dimension(name, len)
                .map_err(|e| MatchupError::from_nc_error(e, path.to_owned()))?;
        }
    }

    let prim = &index.header.primary_instrument;
    let sec = &index.header.secondary_instrument;

    utils::write_nc_var(&mut ds, primary_index.view().into_dyn(), PRIMARY_INDEX, &[MATCHUP_DIM, PRIMARY_NDIM], Some(INDEX_FILL), None,
        Some(&format!("0-based {prim} pixel index of each matchup")))?;
    utils::write_nc_var(&mut ds, Array1::from_vec(cols.primary_lat.clone()).view().into_dyn(), PRIMARY_LAT, &[MATCHUP_DIM], None, Some("degrees_north"), Some(&format!("{prim} pixel latitude")))?;
    utils::write_nc_var(&mut ds, Array1::from_vec(cols.primary_lon.clone()).view().into_dyn(), PRIMARY_LON, &[MATCHUP_DIM], None, Some("degrees_east"), Some(&format!("{prim} pixel longitude")))?;
    utils::write_nc_var(&mut ds, Array1::from_vec(cols.primary_time.clone()).view().into_dyn(), PRIMARY_TIME, &[MATCHUP_DIM], None, Some(TIME_UNITS), Some(&format!("{prim} pixel time")))?;

    utils::write_nc_var(&mut ds, secondary_index.view().into_dyn(), SECONDARY_INDEX, &[MATCHUP_DIM, SECONDARY_NDIM], Some(INDEX_FILL), None,
        Some(&format!("0-based {sec} pixel index of each matchup")))?;
    utils::write_nc_var(&mut ds, float_column(&cols.secondary_lat).view().into_dyn(), SECONDARY_LAT, &[MATCHUP_DIM], Some(FLOAT_FILL), Some("degrees_north"), Some(&format!("{sec} pixel latitude")))?;
    utils::write_nc_var(&mut ds, float_column(&cols.secondary_lon).view().into_dyn(), SECONDARY_LON, &[MATCHUP_DIM], Some(FLOAT_FILL), Some("degrees_east"), Some(&format!("{sec} pixel longitude")))?;
    utils::write_nc_var(&mut ds, float_column(&cols.secondary_time).view().into_dyn(), SECONDARY_TIME, &[MATCHUP_DIM], Some(FLOAT_FILL), Some(TIME_UNITS), Some(&format!("{sec} pixel time")))?;

    utils::write_nc_var(&mut ds, source_index.view().into_dyn(), SOURCE_INDEX, &[MATCHUP_DIM], Some(INDEX_FILL), None,
        Some("0-based index into source_file of the granule each matched secondary pixel came from"))?;
    utils::write_string_nc_var(&mut ds, &index.sources, SOURCE_FILE, SOURCE_DIM, Some("Secondary granules referenced by the matchups"))?;

    utils::write_nc_var(&mut ds, float_column(&cols.distance_km).view().into_dyn(), DISTANCE, &[MATCHUP_DIM], Some(FLOAT_FILL), Some("km"),
        Some("Great circle distance between the matched pixels"))?;
    utils::write_nc_var(&mut ds, float_column(&cols.time_diff_s).view().into_dyn(), TIME_DIFF, &[MATCHUP_DIM], Some(FLOAT_FILL), Some("s"),
        Some("Absolute time difference between the matched pixels"))?;

    if let Some(fp) = &index.footprints {
        utils::write_nc_var(&mut ds, Array1::from_vec(fp.lat.clone()).view().into_dyn(), FOOTPRINT_LAT, &[MATCHUP_DIM], None, Some("degrees_north"),
            Some(&format!("Latitude of the {prim} footprint containing the primary pixel")))?;
        utils::write_nc_var(&mut ds, Array1::from_vec(fp.lon.clone()).view().into_dyn(), FOOTPRINT_LON, &[MATCHUP_DIM], None, Some("degrees_east"),
            Some(&format!("Longitude of the {prim} footprint containing the primary pixel")))?;
        utils::write_nc_var(&mut ds, Array1::from_vec(fp.time.clone()).view().into_dyn(), FOOTPRINT_TIME, &[MATCHUP_DIM], None, Some(TIME_UNITS),
            Some(&format!("Time of the {prim} footprint containing the primary pixel")))?;
    }

    if let (Some(up), Some((up_primary, up_secondary))) = (&index.upstream, &upstream_arrays) {
        utils::write_nc_var(&mut ds, up_primary.view().into_dyn(), UPSTREAM_PRIMARY_INDEX, &[MATCHUP_DIM, UPSTREAM_PRIMARY_NDIM], Some(INDEX_FILL), None,
            Some("0-based primary pixel index recorded in the input matchup row"))?;
        utils::write_nc_var(&mut ds, up_secondary.view().into_dyn(), UPSTREAM_SECONDARY_INDEX, &[MATCHUP_DIM, UPSTREAM_SECONDARY_NDIM], Some(INDEX_FILL), None,
            Some(&format!("0-based {prim} pixel index recorded in the input matchup row")))?;
        utils::write_string_nc_var(&mut ds, &up.source_file, UPSTREAM_SOURCE_FILE, MATCHUP_DIM,
            Some(&format!("{prim} granule of the input matchup row, empty if it was unmatched")))?;
    }

    let (input_files, input_sha256): (Vec<String>, Vec<String>) = index.header.input_files.iter()
        .map(|(p, sha)| (p.display().to_string(), sha.clone()))
        .unzip();
    utils::write_string_nc_var(&mut ds, &input_files, INPUT_FILE, INPUT_DIM, Some("Paths to the local input files"))?;
    utils::write_string_nc_var(&mut ds, &input_sha256, INPUT_SHA256, INPUT_DIM, Some("SHA-256 checksums of the local input files"))?;

    Ok(())
}

/// Write a text summary: header attributes as `#NAME=value` lines, then for each
/// matched primary pixel the secondary indices grouped by source granule. When
/// primary indices have more than two dimensions, each group of pixels sharing
/// the first two (e.g. the AMSU footprint of AIRS sub-footprints) is listed
/// before its first member.
pub fn write_summary_txt(index: &MatchupIndex, path: &Path) -> Result<(), MatchupError> {
    let mut groups: BTreeMap<PixelIndex, BTreeMap<String, Vec<PixelIndex>>> = BTreeMap::new();
    for row in 0..index.len() {
        let (Some(Some(sec)), Some(src)) = (index.columns.secondary_index.get(row), index.source_of_row(row)) else {
            continue;
        };
        let prim = &index.columns.primary_index[row];
        groups.entry(prim.clone()).or_default()
            .entry(src.to_owned()).or_default()
            .push(sec.clone());
        if prim.len() > 2 {
            groups.entry(prim[..2].to_vec()).or_default()
                .entry(src.to_owned()).or_default()
                .push(sec.clone());
        }
    }

    let mut f = std::fs::File::create(path)?;
    for (name, value) in header_attributes(index) {
        writeln!(f, "#{name}={value}")?;
    }

    let write_group = |f: &mut std::fs::File, key: &PixelIndex| -> Result<(), std::io::Error> {
        writeln!(f, "{}", format_index(key))?;
        if let Some(by_source) = groups.get(key) {
            for (src, secs) in by_source {
                writeln!(f, "{} -- {src} [{}]", secs.len(), secs.iter().map(|s| format_index(s)).join(", "))?;
            }
        }
        Ok(())
    };

    // with N-D primary indices the 2-D prefix groups are written as headings, not on their own
    let has_prefixes = groups.keys().any(|k| k.len() > 2);
    let mut prefix_done: Option<PixelIndex> = None;
    for key in groups.keys().filter(|k| !has_prefixes || k.len() > 2) {
        let prefix = key[..2.min(key.len())].to_vec();
        if key.len() > 2 && prefix_done.as_ref() != Some(&prefix) {
            write_group(&mut f, &prefix)?;
            prefix_done = Some(prefix);
        }
        write_group(&mut f, key)?;
    }
    Ok(())
}

fn format_index(idx: &[usize]) -> String {
    if idx.len() == 1 {
        idx[0].to_string()
    } else {
        format!("({})", idx.iter().join(", "))
    }
}

/// Directory holding the output of one run. Unless [`ProductDirGuard::commit`]
/// is called, dropping the guard deletes every file registered with it and, if
/// the guard created the directory, the directory itself.
#[derive(Debug)]
pub struct ProductDirGuard {
    dir: PathBuf,
    created: bool,
    files: Vec<PathBuf>,
    committed: bool,
}

impl ProductDirGuard {
    pub fn create(dir: &Path) -> Result<Self, MatchupError> {
        let created = !dir.exists();
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_owned(), created, files: Vec::new(), committed: false })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a file inside the directory, registered for removal on failure
    pub fn file(&mut self, name: &str) -> PathBuf {
        let p = self.dir.join(name);
        self.files.push(p.clone());
        p
    }

    /// Keep the directory and its files
    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.dir.clone()
    }
}

impl Drop for ProductDirGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        if self.created {
            warn!("Removing incomplete product directory {}", self.dir.display());
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                warn!("Could not remove {}: {e}", self.dir.display());
            }
        } else {
            for f in self.files.iter().filter(|f| f.exists()) {
                warn!("Removing incomplete output file {}", f.display());
                if let Err(e) = std::fs::remove_file(f) {
                    warn!("Could not remove {}: {e}", f.display());
                }
            }
        }
    }
}

/// Write the netCDF product and its text summary into `guard`'s directory,
/// returning the path of the netCDF file.
pub fn save_product(index: &MatchupIndex, guard: &mut ProductDirGuard, stem: &str) -> Result<PathBuf, MatchupError> {
    let nc_file = guard.file(&format!("{stem}.nc4"));
    let txt_file = guard.file(&format!("{stem}.txt"));
    write_netcdf(index, &nc_file)?;
    write_summary_txt(index, &txt_file)?;
    Ok(nc_file)
}
