//! Granules and the capability interfaces the matchup core reads them through.
//!
//! A granule is a time-bounded block of pixels from one instrument. The core never
//! depends on how a granule is stored; it only asks for geolocation (latitude,
//! longitude and time arrays) and, when writing derived variables, for named
//! variables. [`crate::reader::NcGranule`] implements this over netCDF files and
//! [`MemoryGranule`] over arrays already in memory.
use std::collections::HashMap;

use itertools::Itertools;
use log::debug;
use ndarray::{ArrayD, IxDyn};
use serde::{Serialize, Deserialize};

use crate::error::MatchupError;

/// Multi-dimensional index of a pixel within its granule, e.g. (along-track,
/// cross-track, sub-track, sub-cross-track) for AIRS or a single profile index
/// for CloudSat.
pub type PixelIndex = Vec<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: f64,
    pub end: f64,
}

impl TimeInterval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Inclusive on both ends
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }

    /// Absolute difference between `t` and whichever boundary of this interval is nearer
    pub fn boundary_distance(&self, t: f64) -> f64 {
        (t - self.start).abs().min((t - self.end).abs())
    }

    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn widened(&self, by: f64) -> Self {
        Self { start: self.start - by, end: self.end + by }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    /// Longitudes are compared modulo 360, so a box given in [0, 360) can meet
    /// one given in [-180, 180). A swath that crosses the antimeridian has a
    /// box spanning nearly every longitude and so intersects anything in its
    /// latitude band.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.south <= other.north && other.south <= self.north && self.lon_overlaps(other)
    }

    fn lon_overlaps(&self, other: &BoundingBox) -> bool {
        if self.east - self.west >= 360.0 || other.east - other.west >= 360.0 {
            return true;
        }
        [-360.0, 0.0, 360.0].iter()
            .any(|shift| self.west <= other.east + shift && other.west + shift <= self.east)
    }
}

/// Latitude, longitude and time of every pixel in a granule.
///
/// `lat` and `lon` share one shape. `time` may be recorded at a coarser
/// resolution than the geolocation, in which case its shape must equal the
/// leading dimensions of the geolocation shape (AIRS reports one time per
/// (along-track, cross-track) footprint but positions per sub-footprint).
#[derive(Debug, Clone)]
pub struct Geolocation {
    pub lat: ArrayD<f64>,
    pub lon: ArrayD<f64>,
    pub time: ArrayD<f64>,
}

impl Geolocation {
    pub fn new(granule_id: &str, lat: ArrayD<f64>, lon: ArrayD<f64>, time: ArrayD<f64>) -> Result<Self, MatchupError> {
        if lat.shape() != lon.shape() {
            return Err(MatchupError::malformed(granule_id, format!(
                "latitude shape {:?} differs from longitude shape {:?}", lat.shape(), lon.shape()
            )));
        }
        if lat.is_empty() {
            return Err(MatchupError::malformed(granule_id, "geolocation arrays are empty"));
        }
        if time.is_empty() {
            return Err(MatchupError::malformed(granule_id, "time array is empty"));
        }
        if time.ndim() > lat.ndim() || time.shape() != &lat.shape()[..time.ndim()] {
            return Err(MatchupError::malformed(granule_id, format!(
                "time shape {:?} is not a leading part of geolocation shape {:?}", time.shape(), lat.shape()
            )));
        }

        Ok(Self { lat, lon, time })
    }

    pub fn shape(&self) -> &[usize] {
        self.lat.shape()
    }

    pub fn num_pixels(&self) -> usize {
        self.lat.len()
    }

    /// Latitude, longitude and time of one pixel. The time is looked up with the
    /// leading dimensions of the index only.
    pub fn pixel(&self, index: &[usize]) -> Option<(f64, f64, f64)> {
        let lat = *self.lat.get(IxDyn(index))?;
        let lon = *self.lon.get(IxDyn(index))?;
        let time = self.time_at(index)?;
        Some((lat, lon, time))
    }

    pub fn time_at(&self, index: &[usize]) -> Option<f64> {
        let n = self.time.ndim();
        if index.len() < n {
            return None;
        }
        self.time.get(IxDyn(&index[..n])).copied()
    }

    /// Interval spanned by the non-NaN pixel times, with `end_padding` seconds added
    /// to the end (for instruments whose time stamps mark the start of a scan).
    pub fn time_interval(&self, end_padding: f64) -> Option<TimeInterval> {
        let (start, end) = self.time.iter()
            .filter(|t| !t.is_nan())
            .fold(None, |acc: Option<(f64, f64)>, &t| match acc {
                None => Some((t, t)),
                Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
            })?;
        Some(TimeInterval::new(start, end + end_padding))
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        fn min_max<'a>(it: impl Iterator<Item = &'a f64>) -> Option<(f64, f64)> {
            it.filter(|v| !v.is_nan())
                .fold(None, |acc: Option<(f64, f64)>, &v| match acc {
                    None => Some((v, v)),
                    Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
                })
        }

        let (south, north) = min_max(self.lat.iter())?;
        let (west, east) = min_max(self.lon.iter())?;
        Some(BoundingBox { north, south, east, west })
    }
}

/// Minimal read access the matchup core needs from a granule.
pub trait Granule {
    fn id(&self) -> &str;

    fn geolocation(&self) -> Result<Geolocation, MatchupError>;

    fn variable(&self, name: &str) -> Result<ArrayD<f64>, MatchupError>;

    /// Start and end UTC of the granule in seconds since the Unix epoch
    fn time_interval(&self) -> Result<TimeInterval, MatchupError> {
        self.geolocation()?
            .time_interval(0.0)
            .ok_or_else(|| MatchupError::malformed(self.id(), "no valid pixel times"))
    }

    /// Time interval and bounding box together, for catalogs
    fn extent(&self) -> Result<(TimeInterval, Option<BoundingBox>), MatchupError> {
        Ok((self.time_interval()?, self.geolocation()?.bounding_box()))
    }

    /// Geolocation of the coarser footprints the pixels are grouped into, for
    /// instruments that have them (AMSU footprints for AIRS). Its arrays index
    /// the leading dimensions of the pixel index.
    fn footprint_geolocation(&self) -> Result<Option<Geolocation>, MatchupError> {
        Ok(None)
    }
}

impl<G: Granule + ?Sized> Granule for &G {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn geolocation(&self) -> Result<Geolocation, MatchupError> {
        (**self).geolocation()
    }

    fn variable(&self, name: &str) -> Result<ArrayD<f64>, MatchupError> {
        (**self).variable(name)
    }

    fn time_interval(&self) -> Result<TimeInterval, MatchupError> {
        (**self).time_interval()
    }

    fn extent(&self) -> Result<(TimeInterval, Option<BoundingBox>), MatchupError> {
        (**self).extent()
    }

    fn footprint_geolocation(&self) -> Result<Option<Geolocation>, MatchupError> {
        (**self).footprint_geolocation()
    }
}

/// A granule whose arrays are already loaded.
#[derive(Debug, Clone)]
pub struct MemoryGranule {
    id: String,
    geolocation: Geolocation,
    footprints: Option<Geolocation>,
    variables: HashMap<String, ArrayD<f64>>,
    end_padding: f64,
}

impl MemoryGranule {
    pub fn new(id: &str, lat: ArrayD<f64>, lon: ArrayD<f64>, time: ArrayD<f64>) -> Result<Self, MatchupError> {
        let geolocation = Geolocation::new(id, lat, lon, time)?;
        Ok(Self { id: id.to_owned(), geolocation, footprints: None, variables: HashMap::new(), end_padding: 0.0 })
    }

    /// Convenience constructor for one-dimensional (profile) granules
    pub fn from_profiles(id: &str, lat: &[f64], lon: &[f64], time: &[f64]) -> Result<Self, MatchupError> {
        let to_dyn = |v: &[f64]| ndarray::Array1::from_vec(v.to_vec()).into_dyn();
        Self::new(id, to_dyn(lat), to_dyn(lon), to_dyn(time))
    }

    pub fn with_variable(mut self, name: &str, data: ArrayD<f64>) -> Self {
        self.variables.insert(name.to_owned(), data);
        self
    }

    pub fn with_end_padding(mut self, end_padding: f64) -> Self {
        self.end_padding = end_padding;
        self
    }

    /// Add footprint positions; they take their times from the granule's time array
    pub fn with_footprints(mut self, lat: ArrayD<f64>, lon: ArrayD<f64>) -> Result<Self, MatchupError> {
        let footprints = Geolocation::new(&self.id, lat, lon, self.geolocation.time.clone())?;
        self.footprints = Some(footprints);
        Ok(self)
    }
}

impl Granule for MemoryGranule {
    fn id(&self) -> &str {
        &self.id
    }

    fn geolocation(&self) -> Result<Geolocation, MatchupError> {
        Ok(self.geolocation.clone())
    }

    fn variable(&self, name: &str) -> Result<ArrayD<f64>, MatchupError> {
        self.variables.get(name)
            .cloned()
            .ok_or_else(|| MatchupError::NetcdfMissingVar { file: None, varname: name.to_owned() })
    }

    fn time_interval(&self) -> Result<TimeInterval, MatchupError> {
        self.geolocation
            .time_interval(self.end_padding)
            .ok_or_else(|| MatchupError::malformed(&self.id, "no valid pixel times"))
    }

    fn footprint_geolocation(&self) -> Result<Option<Geolocation>, MatchupError> {
        Ok(self.footprints.clone())
    }
}

/// Start/end times of a set of granules of one instrument, ordered by start time.
/// Row `i` of the intervals belongs to identifier `i`.
#[derive(Debug, Clone, Default)]
pub struct GranuleTimeIndex {
    ids: Vec<String>,
    intervals: Vec<TimeInterval>,
}

impl GranuleTimeIndex {
    /// Build from parallel lists of identifiers and intervals; the pairs are
    /// reordered by start time (then identifier) so the index is in ascending time order.
    pub fn new(ids: Vec<String>, intervals: Vec<TimeInterval>) -> Result<Self, MatchupError> {
        if ids.len() != intervals.len() {
            return Err(MatchupError::InternalError(format!(
                "{} granule identifiers but {} time intervals", ids.len(), intervals.len()
            )));
        }

        let (ids, intervals): (Vec<String>, Vec<TimeInterval>) = ids.into_iter()
            .zip(intervals)
            .sorted_by(|(ida, a), (idb, b)| a.start.total_cmp(&b.start).then_with(|| ida.cmp(idb)))
            .unzip();
        Ok(Self { ids, intervals })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn intervals(&self) -> &[TimeInterval] {
        &self.intervals
    }
}

/// Source of candidate granules for a time window and optional spatial bounds
pub trait GranuleCatalog {
    type Granule: Granule;

    fn find_candidates(&self, time_range: TimeInterval, geo_bounds: Option<&BoundingBox>) -> Result<Vec<Self::Granule>, MatchupError>;
}

/// Catalog over a fixed list of granules. A granule is a candidate if its time
/// interval overlaps the requested range widened by `time_slop` seconds and, when
/// bounds are given, its bounding box intersects them.
pub struct LocalCatalog<G: Granule + Clone> {
    entries: Vec<(G, TimeInterval, Option<BoundingBox>)>,
    time_slop: f64,
}

impl<G: Granule + Clone> LocalCatalog<G> {
    /// One day on either side, as the archive search does
    pub const DEFAULT_TIME_SLOP: f64 = 86400.0;

    pub fn new(granules: Vec<G>) -> Result<Self, MatchupError> {
        let mut entries = Vec::with_capacity(granules.len());
        for g in granules {
            let (interval, bbox) = g.extent()?;
            entries.push((g, interval, bbox));
        }
        Ok(Self { entries, time_slop: Self::DEFAULT_TIME_SLOP })
    }

    pub fn with_time_slop(mut self, time_slop: f64) -> Self {
        self.time_slop = time_slop;
        self
    }
}

impl<G: Granule + Clone> GranuleCatalog for LocalCatalog<G> {
    type Granule = G;

    fn find_candidates(&self, time_range: TimeInterval, geo_bounds: Option<&BoundingBox>) -> Result<Vec<G>, MatchupError> {
        let window = time_range.widened(self.time_slop);
        let found = self.entries.iter()
            .filter(|(_, interval, _)| interval.overlaps(&window))
            .filter(|(_, _, bbox)| match (geo_bounds, bbox) {
                (Some(bounds), Some(bbox)) => bounds.intersects(bbox),
                _ => true,
            })
            .map(|(g, _, _)| g.clone())
            .collect_vec();
        debug!("catalog returned {} of {} granules", found.len(), self.entries.len());
        Ok(found)
    }
}

/// Convert an index from a 1-based (MATLAB-produced) matchup file to the 0-based
/// convention used everywhere in this crate.
pub fn from_one_based(index: i64) -> Result<usize, MatchupError> {
    if index < 1 {
        return Err(MatchupError::InternalError(format!("1-based index {index} is less than 1")));
    }
    Ok((index - 1) as usize)
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array4};

    use super::*;

    #[test]
    fn test_coarse_time_lookup() {
        let lat = Array4::<f64>::zeros((2, 3, 3, 3)).into_dyn();
        let lon = Array4::<f64>::zeros((2, 3, 3, 3)).into_dyn();
        let time = Array2::from_shape_fn((2, 3), |(i, j)| (10 * i + j) as f64).into_dyn();
        let geo = Geolocation::new("airs", lat, lon, time).unwrap();
        assert_eq!(geo.time_at(&[1, 2, 0, 1]), Some(12.0));
        assert_eq!(geo.pixel(&[0, 1, 2, 2]), Some((0.0, 0.0, 1.0)));
        assert_eq!(geo.pixel(&[2, 0, 0, 0]), None);
    }

    #[test]
    fn test_malformed_geolocation() {
        let lat = Array2::<f64>::zeros((2, 3)).into_dyn();
        let lon = Array2::<f64>::zeros((2, 3)).into_dyn();
        let empty = ndarray::Array1::<f64>::zeros(0).into_dyn();
        let res = Geolocation::new("g", lat.clone(), lon.clone(), empty);
        assert!(matches!(res, Err(MatchupError::MalformedSecondaryGrid { .. })));

        let bad_time = ndarray::Array1::<f64>::zeros(3).into_dyn();
        let res = Geolocation::new("g", lat.clone(), lon, bad_time);
        assert!(matches!(res, Err(MatchupError::MalformedSecondaryGrid { .. })));

        let bad_lon = Array2::<f64>::zeros((3, 2)).into_dyn();
        let time = ndarray::Array1::<f64>::zeros(2).into_dyn();
        let res = Geolocation::new("g", lat, bad_lon, time);
        assert!(matches!(res, Err(MatchupError::MalformedSecondaryGrid { .. })));
    }

    #[test]
    fn test_time_interval_and_padding() {
        let g = MemoryGranule::from_profiles("g", &[0.0, 1.0, 2.0], &[0.0; 3], &[30.0, f64::NAN, 10.0])
            .unwrap()
            .with_end_padding(6.9999);
        let ti = g.time_interval().unwrap();
        assert_eq!(ti.start, 10.0);
        assert!((ti.end - 36.9999).abs() < 1e-9);
    }

    #[test]
    fn test_time_index_sorted() {
        let idx = GranuleTimeIndex::new(
            vec!["b".to_owned(), "a".to_owned(), "c".to_owned()],
            vec![TimeInterval::new(100.0, 200.0), TimeInterval::new(0.0, 99.0), TimeInterval::new(201.0, 300.0)]
        ).unwrap();
        assert_eq!(idx.ids(), &["a", "b", "c"]);
        assert_eq!(idx.intervals()[0], TimeInterval::new(0.0, 99.0));

        let bad = GranuleTimeIndex::new(vec!["a".to_owned()], vec![]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_local_catalog() {
        let day = 86400.0;
        let near = MemoryGranule::from_profiles("near", &[0.0, 1.0], &[0.0, 1.0], &[10.0 * day, 10.0 * day + 60.0]).unwrap();
        let far = MemoryGranule::from_profiles("far", &[0.0, 1.0], &[0.0, 1.0], &[20.0 * day, 20.0 * day + 60.0]).unwrap();
        let elsewhere = MemoryGranule::from_profiles("elsewhere", &[60.0, 61.0], &[100.0, 101.0], &[10.0 * day, 10.0 * day + 60.0]).unwrap();
        let catalog = LocalCatalog::new(vec![near, far, elsewhere]).unwrap();

        let range = TimeInterval::new(10.5 * day, 10.6 * day);
        let found = catalog.find_candidates(range, None).unwrap();
        assert_eq!(found.iter().map(|g| g.id()).collect_vec(), vec!["near", "elsewhere"]);

        let bounds = BoundingBox { north: 5.0, south: -5.0, east: 5.0, west: -5.0 };
        let found = catalog.find_candidates(range, Some(&bounds)).unwrap();
        assert_eq!(found.iter().map(|g| g.id()).collect_vec(), vec!["near"]);
    }

    #[test]
    fn test_bounding_box_across_longitude_conventions() {
        let pacific_360 = BoundingBox { north: 10.0, south: 0.0, east: 190.0, west: 170.0 };
        let pacific_180 = BoundingBox { north: 10.0, south: 0.0, east: -170.0, west: -180.0 };
        assert!(pacific_360.intersects(&pacific_180));
        assert!(pacific_180.intersects(&pacific_360));

        let atlantic = BoundingBox { north: 10.0, south: 0.0, east: -20.0, west: -40.0 };
        assert!(!pacific_360.intersects(&atlantic));

        // a swath crossing the antimeridian in [-180, 180) spans every longitude
        let crossing = BoundingBox { north: 60.0, south: 50.0, east: 179.9, west: -179.9 };
        let east_of_seam = BoundingBox { north: 55.0, south: 54.0, east: -178.0, west: -179.5 };
        assert!(crossing.intersects(&east_of_seam));
        let south = BoundingBox { north: 40.0, south: 30.0, east: -178.0, west: -179.5 };
        assert!(!crossing.intersects(&south));
    }

    #[test]
    fn test_memory_granule_footprints() {
        let lat = Array2::from_shape_fn((2, 3), |(i, _)| i as f64).into_dyn();
        let lon = Array2::from_shape_fn((2, 3), |(_, j)| j as f64).into_dyn();
        let time = ndarray::Array1::from_vec(vec![5.0, 6.0]).into_dyn();
        let g = MemoryGranule::new("g", lat, lon, time).unwrap();
        assert!(g.footprint_geolocation().unwrap().is_none());

        let fp_lat = ndarray::Array1::from_vec(vec![0.5, 1.5]).into_dyn();
        let fp_lon = ndarray::Array1::from_vec(vec![1.0, 1.0]).into_dyn();
        let g = g.with_footprints(fp_lat, fp_lon).unwrap();
        let fp = g.footprint_geolocation().unwrap().unwrap();
        assert_eq!(fp.pixel(&[1]), Some((1.5, 1.0, 6.0)));

        let bad = ndarray::Array1::from_vec(vec![0.5, 1.5, 2.5]).into_dyn();
        assert!(g.with_footprints(bad.clone(), bad).is_err());
    }

    #[test]
    fn test_from_one_based() {
        assert_eq!(from_one_based(1).unwrap(), 0);
        assert_eq!(from_one_based(45).unwrap(), 44);
        assert!(from_one_based(0).is_err());
    }
}
