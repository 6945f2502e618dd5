use std::io::Read;
use std::ops::AddAssign;
use std::path::{PathBuf, Path};

use chrono::{DateTime, Utc};
use ndarray::{ArrayD, ArrayViewD, Dimension, Ix1, Zip};
use num_traits::Float;
use sha2::{Sha256, Digest};

use crate::error::MatchupError;

/// Mean Earth radius used by the spherical (haversine) distance
pub const EARTH_RADIUS_MEAN: f64 = 6371.0;
pub const DEG2RAD: f64 = std::f64::consts::PI / 180.0;

/// Seconds between the Unix epoch and the TAI93 epoch (1993-01-01T00:00:00Z)
pub const TAI93_UNIX_OFFSET: f64 = 725846400.0;

pub(crate) fn nc_file(ds: &netcdf::File) -> PathBuf {
    ds.path()
      .unwrap_or_else(|_| PathBuf::from("?"))
}

/// Haversine distance in kilometers between two points given in degrees.
///
/// NaN in any coordinate gives a NaN distance.
pub fn great_circle_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = ((lat2 - lat1) * DEG2RAD).abs();
    let dlon = ((lon2 - lon1) * DEG2RAD).abs();

    let inner = (dlat / 2.0).sin().powi(2)
        + (lat1 * DEG2RAD).cos() * (lat2 * DEG2RAD).cos() * (dlon / 2.0).sin().powi(2);
    // rounding can push antipodal points just past 1; NaN must pass through untouched
    let inner = if inner > 1.0 { 1.0 } else { inner };
    2.0 * EARTH_RADIUS_MEAN * inner.sqrt().asin()
}

/// Distance from one point to every point of a (lat, lon) field. The two field
/// arrays must share a shape; the output has that same shape.
pub fn great_circle_distance_field(lat: f64, lon: f64, lats: ArrayViewD<f64>, lons: ArrayViewD<f64>) -> Result<ArrayD<f64>, MatchupError> {
    if lats.shape() != lons.shape() {
        return Err(MatchupError::InternalError(format!(
            "latitude and longitude fields have different shapes ({:?} vs {:?})", lats.shape(), lons.shape()
        )));
    }

    let dists = Zip::from(&lats)
        .and(&lons)
        .par_map_collect(|&la, &lo| great_circle_distance(lat, lon, la, lo));
    Ok(dists)
}

/// Location and value of the smallest non-NaN element, in row-major order. The
/// first of several equal minima wins. Returns `None` if every element is NaN
/// or the array is empty.
pub fn nan_argmin(arr: ArrayViewD<f64>) -> Option<(Vec<usize>, f64)> {
    let mut best: Option<(Vec<usize>, f64)> = None;
    for (idx, &v) in arr.indexed_iter() {
        if v.is_nan() {
            continue;
        }
        let is_better = match &best {
            Some((_, b)) => v < *b,
            None => true,
        };
        if is_better {
            best = Some((idx.slice().to_vec(), v));
        }
    }
    best
}

pub fn load_nc_var<T: netcdf::NcPutGet>(ds: &netcdf::File, varname: &str) -> Result<ArrayD<T>, MatchupError> {
    let file = nc_file(ds);
    let var = ds.variable(varname)
        .ok_or_else(|| MatchupError::NetcdfMissingVar { file: Some(file.clone()), varname: varname.to_owned() })?;
    let data = var.values_arr::<T, _>(netcdf::extent::Extents::All)
        .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
    Ok(data)
}

pub fn load_nc_var_1d<T: netcdf::NcPutGet>(ds: &netcdf::File, varname: &str) -> Result<ndarray::Array1<T>, MatchupError> {
    let file = nc_file(ds);
    load_nc_var(ds, varname)?
        .into_dimensionality::<Ix1>()
        .map_err(|e| MatchupError::from_shape_error(e, file, varname.to_owned()))
}

/// Load the first of several alternative variable names present in the file;
/// different data servers expose the same field under different names.
pub fn load_first_nc_var<T: netcdf::NcPutGet>(ds: &netcdf::File, varnames: &[&str]) -> Result<ArrayD<T>, MatchupError> {
    for name in varnames {
        if ds.variable(name).is_some() {
            return load_nc_var(ds, name);
        }
    }
    Err(MatchupError::NetcdfMissingVar { file: Some(nc_file(ds)), varname: varnames.join(" or ") })
}

pub fn load_string_var(ds: &netcdf::File, varname: &str) -> Result<Vec<String>, MatchupError> {
    let file = nc_file(ds);
    let var = ds.variable(varname)
        .ok_or_else(|| MatchupError::NetcdfMissingVar { file: Some(file.clone()), varname: varname.to_owned() })?;

    let n = if let [dim] = var.dimensions() {
        dim.len()
    } else {
        return Err(MatchupError::InternalError(format!("Expected string variable {varname} to have exactly 1 dimension")));
    };

    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        let s = var.string_value(i)
            .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
        values.push(s);
    }
    Ok(values)
}

pub fn get_str_attr_with_default(ds: &netcdf::File, attr_name: &str, default: String) -> Result<String, MatchupError> {
    let nc_attr = if let Some(a) = ds.attribute(attr_name) {
        a
    }else{
        return Ok(default)
    };

    let value = if let Ok(v) = nc_attr.value() {
        v
    }else{
        return Ok(default)
    };

    match value {
        netcdf::AttrValue::Str(v) => Ok(v),
        netcdf::AttrValue::Strs(v) => {
            let s = v.join("\n");
            Ok(s)
        },
        _ => Err(MatchupError::NetcdfWrongAttrType { file: Some(nc_file(ds)), varname: "(global)".to_owned(), attname: attr_name.to_owned(), expected: "String" })
    }
}

pub fn write_nc_var<T: netcdf::NcPutGet + Copy>(
    ds: &mut netcdf::MutableFile,
    data: ArrayViewD<T>,
    name: &str,
    dims: &[&str],
    fill_value: Option<T>,
    units: Option<&str>,
    description: Option<&str>
) -> Result<(), MatchupError> {
    let file = PathBuf::from("output");

    let mut var = ds.add_variable::<T>(name, dims)
        .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
    if let Some(fill) = fill_value {
        var.set_fill_value(fill)
            .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
    }
    var.compression(9, true)
        .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;

    let data = data.as_standard_layout();
    let values = data.as_slice()
        .ok_or_else(|| MatchupError::InternalError(format!("data for {name} is not contiguous")))?;
    var.put_values(values, netcdf::extent::Extents::All)
        .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;

    if let Some(units) = units {
        var.add_attribute("units", units)
            .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
    }

    if let Some(description) = description {
        var.add_attribute("description", description)
            .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
    }

    Ok(())
}

pub fn write_string_nc_var(
    ds: &mut netcdf::MutableFile,
    data: &[String],
    name: &str,
    dim: &str,
    description: Option<&str>
) -> Result<(), MatchupError> {
    let file = PathBuf::from("output");

    let mut var = ds.add_string_variable(name, &[dim])
        .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
    for (i, s) in data.iter().enumerate() {
        let ex: netcdf::extent::Extents = i.into();
        var.put_string(s, ex)
            .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
    }

    if let Some(description) = description {
        var.add_attribute("description", description)
            .map_err(|e| MatchupError::from_nc_error(e, file.clone()))?;
    }

    Ok(())
}

pub fn file_sha256(file: &Path) -> Result<String, MatchupError> {
    let mut f = std::fs::File::open(file)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Convert seconds since the Unix epoch into a UTC datetime, truncating to whole seconds
pub fn unix_to_datetime(utc: f64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(utc.floor() as i64, 0)
}

/// Split a Unix time into ("YYYY-MM-DD", "HH:MM:SS") strings
pub fn date_and_time_strings(utc: f64) -> (String, String) {
    match unix_to_datetime(utc) {
        Some(dt) => (dt.format("%Y-%m-%d").to_string(), dt.format("%H:%M:%S").to_string()),
        None => ("?".to_owned(), "?".to_owned()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunningMean<T: Float> {
    sum: T,
    count: u64,
}

impl<T: Float> RunningMean<T> {
    pub fn new() -> Self {
        Self { sum: T::zero(), count: 0 }
    }

    pub fn from_slice(values: &[T]) -> Self {
        let mut m = Self::new();
        for &v in values {
            m += v;
        }
        m
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<T> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / T::from(self.count)?)
        }
    }
}

impl<T: Float> Default for RunningMean<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Float> AddAssign<T> for RunningMean<T> {
    fn add_assign(&mut self, rhs: T) {
        self.sum = self.sum + rhs;
        self.count += 1;
    }
}

/// How to report progress through long per-pixel loops
#[derive(Debug, Clone)]
pub enum ShowProgress {
    Yes,
    No,
    Multi(indicatif::MultiProgress),
}

impl ShowProgress {
    pub(crate) fn bar(&self, len: u64, msg: String) -> indicatif::ProgressBar {
        let pb = match self {
            ShowProgress::Yes => indicatif::ProgressBar::new(len),
            ShowProgress::No => return indicatif::ProgressBar::hidden(),
            ShowProgress::Multi(mbar) => mbar.add(indicatif::ProgressBar::new(len)),
        };

        if let Ok(style) = indicatif::ProgressStyle::with_template("{msg} {bar} {human_pos}/{human_len}") {
            pb.set_style(style);
        }
        pb.set_message(msg);
        pb
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};

    use super::*;

    #[test]
    fn test_distance_zero_and_symmetric() {
        let pts = [(10.0, 20.0), (-45.5, 170.0), (89.9, -179.9), (0.0, 0.0), (-10.0, -20.0)];
        for &(la1, lo1) in &pts {
            assert_eq!(great_circle_distance(la1, lo1, la1, lo1), 0.0);
            for &(la2, lo2) in &pts {
                assert_eq!(great_circle_distance(la1, lo1, la2, lo2), great_circle_distance(la2, lo2, la1, lo1));
            }
        }
    }

    #[test]
    fn test_distance_known_values() {
        // one degree of latitude on the mean sphere
        let d = great_circle_distance(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111.195).abs() < 1e-3, "d = {d}");

        // quarter circumference along the equator
        let d = great_circle_distance(0.0, 0.0, 0.0, 90.0);
        assert!((d - EARTH_RADIUS_MEAN * std::f64::consts::FRAC_PI_2).abs() < 1e-6);

        // antipodes should not produce NaN from rounding
        let d = great_circle_distance(0.0, 0.0, 0.0, 180.0);
        assert!((d - EARTH_RADIUS_MEAN * std::f64::consts::PI).abs() < 1e-6);

        let d = great_circle_distance(10.0, 20.0, 10.001, 20.001);
        assert!(d > 0.1 && d < 0.2, "d = {d}");
    }

    #[test]
    fn test_distance_nan_propagates() {
        assert!(great_circle_distance(f64::NAN, 0.0, 1.0, 1.0).is_nan());
        assert!(great_circle_distance(0.0, 0.0, 1.0, f64::NAN).is_nan());
    }

    #[test]
    fn test_distance_field_matches_scalar() {
        let lats: Array2<f64> = array![[0.0, 1.0], [2.0, 3.0]];
        let lons: Array2<f64> = array![[0.0, 0.5], [1.0, 1.5]];
        let field = great_circle_distance_field(0.5, 0.5, lats.view().into_dyn(), lons.view().into_dyn()).unwrap();
        assert_eq!(field.shape(), &[2, 2]);
        for ((i, j), &d) in field.view().into_dimensionality::<ndarray::Ix2>().unwrap().indexed_iter() {
            assert_eq!(d, great_circle_distance(0.5, 0.5, lats[[i, j]], lons[[i, j]]));
        }
    }

    #[test]
    fn test_distance_field_shape_mismatch() {
        let lats = ndarray::Array1::<f64>::zeros(3).into_dyn();
        let lons = ndarray::Array1::<f64>::zeros(4).into_dyn();
        assert!(great_circle_distance_field(0.0, 0.0, lats.view(), lons.view()).is_err());
    }

    #[test]
    fn test_nan_argmin() {
        let arr = array![[f64::NAN, 3.0], [1.0, 1.0]].into_dyn();
        let (idx, v) = nan_argmin(arr.view()).unwrap();
        assert_eq!(idx, vec![1, 0]);
        assert_eq!(v, 1.0);

        let all_nan = array![f64::NAN, f64::NAN].into_dyn();
        assert!(nan_argmin(all_nan.view()).is_none());
    }

    #[test]
    fn test_running_mean() {
        let mut m = RunningMean::<f64>::new();
        assert!(m.mean().is_none());
        m += 1.0;
        m += 3.0;
        assert_eq!(m.mean(), Some(2.0));
        assert_eq!(RunningMean::from_slice(&[2.0f32, 4.0, 6.0]).mean(), Some(4.0));
    }

    #[test]
    fn test_date_and_time_strings() {
        let (d, t) = date_and_time_strings(TAI93_UNIX_OFFSET + 3661.5);
        assert_eq!(d, "1993-01-01");
        assert_eq!(t, "01:01:01");
    }
}
