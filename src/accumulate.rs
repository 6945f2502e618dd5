//! Append-only accumulation of matchup rows and the finished matchup aggregate.
use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, info};
use serde::Serialize;

use crate::error::MatchupError;
use crate::granule::{BoundingBox, Geolocation, PixelIndex, TimeInterval};
use crate::select::{MatchCandidate, MatchOutcome, SelectionRule, Tolerances};
use crate::utils::RunningMean;

/// Version written to the header of every matchup product
pub const MATCHUP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One primary pixel and what (if anything) it was matched to
#[derive(Debug, Clone, PartialEq)]
pub struct MatchupRecord {
    pub primary_index: PixelIndex,
    pub primary_lat: f64,
    pub primary_lon: f64,
    pub primary_time: f64,
    pub outcome: MatchOutcome,
}

impl MatchupRecord {
    pub fn matched(primary_index: PixelIndex, primary: (f64, f64, f64), candidate: MatchCandidate) -> Self {
        let (primary_lat, primary_lon, primary_time) = primary;
        Self { primary_index, primary_lat, primary_lon, primary_time, outcome: MatchOutcome::Matched(candidate) }
    }

    pub fn unmatched(primary_index: PixelIndex, primary: (f64, f64, f64)) -> Self {
        let (primary_lat, primary_lon, primary_time) = primary;
        Self { primary_index, primary_lat, primary_lon, primary_time, outcome: MatchOutcome::Unmatched }
    }
}

/// How rows relate to primary pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchupMode {
    /// Every tolerance-passing candidate is its own row; several secondary
    /// pixels may share one primary pixel. An empty result is an error.
    ManyToOne,
    /// Exactly one row per primary pixel, unmatched pixels included
    OneToOne(SelectionRule),
    /// Exactly one row per primary pixel, snapped to a grid cell without tolerances
    Gridded,
}

impl MatchupMode {
    pub fn description(&self) -> &'static str {
        match self {
            MatchupMode::ManyToOne => "many-to-one",
            MatchupMode::OneToOne(SelectionRule::NearestInTime) => "one-to-one, nearest in time",
            MatchupMode::OneToOne(SelectionRule::NearestInDistance) => "one-to-one, nearest in distance",
            MatchupMode::Gridded => "gridded nearest neighbor",
        }
    }
}

/// Metadata describing one matchup product
#[derive(Debug, Clone, Serialize)]
pub struct MatchupHeader {
    pub version: String,
    pub primary_instrument: String,
    pub secondary_instrument: String,
    pub primary_granule: String,
    pub mode: MatchupMode,
    /// `None` for gridded matchups, which do not apply tolerances
    pub tolerances: Option<Tolerances>,
    pub time_range: Option<TimeInterval>,
    pub bounding_box: Option<BoundingBox>,
    pub production_date: String,
    /// Local input files with their SHA-256 checksums
    pub input_files: Vec<(PathBuf, String)>,
}

impl MatchupHeader {
    pub fn new(primary_instrument: &str, secondary_instrument: &str, primary_granule: &str, mode: MatchupMode) -> Self {
        Self {
            version: MATCHUP_VERSION.to_owned(),
            primary_instrument: primary_instrument.to_owned(),
            secondary_instrument: secondary_instrument.to_owned(),
            primary_granule: primary_granule.to_owned(),
            mode,
            tolerances: None,
            time_range: None,
            bounding_box: None,
            production_date: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            input_files: Vec::new(),
        }
    }

    pub fn with_tolerances(mut self, tolerances: Tolerances) -> Self {
        self.tolerances = Some(tolerances);
        self
    }

    pub fn with_extent(mut self, time_range: Option<TimeInterval>, bounding_box: Option<BoundingBox>) -> Self {
        self.time_range = time_range;
        self.bounding_box = bounding_box;
        self
    }
}

/// Row-aligned output columns. Entries for unmatched rows are `None`; the
/// serializer decides how to encode them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchupColumns {
    pub primary_index: Vec<PixelIndex>,
    pub primary_lat: Vec<f64>,
    pub primary_lon: Vec<f64>,
    pub primary_time: Vec<f64>,
    pub secondary_index: Vec<Option<PixelIndex>>,
    /// Position in the accumulator's list of secondary sources
    pub source: Vec<Option<usize>>,
    pub secondary_lat: Vec<Option<f64>>,
    pub secondary_lon: Vec<Option<f64>>,
    pub secondary_time: Vec<Option<f64>>,
    pub distance_km: Vec<Option<f64>>,
    pub time_diff_s: Vec<Option<f64>>,
}

impl MatchupColumns {
    pub fn len(&self) -> usize {
        self.primary_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary_index.is_empty()
    }

    pub fn num_matched(&self) -> usize {
        self.secondary_index.iter().filter(|s| s.is_some()).count()
    }
}

/// Provenance carried over from the matchup product a chained matchup read
/// its primary pixels from, one entry per output row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamColumns {
    pub primary_index: Vec<PixelIndex>,
    pub secondary_index: Vec<Option<PixelIndex>>,
    pub source_file: Vec<String>,
}

impl UpstreamColumns {
    pub fn len(&self) -> usize {
        self.primary_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary_index.is_empty()
    }
}

/// Position of the coarser primary footprint (e.g. the AMSU footprint holding
/// an AIRS pixel) for each row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FootprintColumns {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub time: Vec<f64>,
}

impl FootprintColumns {
    /// Look up the footprint of each primary index. Footprint arrays index the
    /// leading dimensions of the primary pixel index; a row whose footprint is
    /// outside `footprints` is an error.
    pub fn for_rows(footprints: &Geolocation, primary_index: &[PixelIndex]) -> Result<Self, MatchupError> {
        let ndim = footprints.lat.ndim();
        let mut cols = Self::default();
        for idx in primary_index {
            let lead = idx.get(..ndim).ok_or_else(|| MatchupError::InternalError(format!(
                "primary index {idx:?} has fewer than the {ndim} footprint dimensions"
            )))?;
            let (lat, lon, time) = footprints.pixel(lead).ok_or_else(|| MatchupError::InternalError(format!(
                "primary index {idx:?} is outside the footprint arrays"
            )))?;
            cols.lat.push(lat);
            cols.lon.push(lon);
            cols.time.push(time);
        }
        Ok(cols)
    }

    pub fn len(&self) -> usize {
        self.lat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lat.is_empty()
    }
}

/// Append-only builder for matchup columns. Rows are never overwritten; the
/// write cursor only moves forward.
#[derive(Debug, Default)]
pub struct MatchupAccumulator {
    columns: MatchupColumns,
    cursor: usize,
    sources: Vec<String>,
    source_lookup: HashMap<String, usize>,
}

impl MatchupAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `records` to every column and return the new write cursor
    pub fn append(&mut self, records: &[MatchupRecord]) -> usize {
        for rec in records {
            let src = rec.outcome.candidate().map(|c| self.source_position(&c.source_granule));

            let cols = &mut self.columns;
            cols.primary_index.push(rec.primary_index.clone());
            cols.primary_lat.push(rec.primary_lat);
            cols.primary_lon.push(rec.primary_lon);
            cols.primary_time.push(rec.primary_time);
            cols.source.push(src);

            match &rec.outcome {
                MatchOutcome::Matched(c) => {
                    cols.secondary_index.push(Some(c.secondary_index.clone()));
                    cols.secondary_lat.push(Some(c.lat));
                    cols.secondary_lon.push(Some(c.lon));
                    // gridded products have no pixel times
                    cols.secondary_time.push(Some(c.time).filter(|t| t.is_finite()));
                    cols.distance_km.push(Some(c.distance_km));
                    cols.time_diff_s.push(Some(c.time_diff_s).filter(|t| t.is_finite()));
                },
                MatchOutcome::Unmatched => {
                    cols.secondary_index.push(None);
                    cols.secondary_lat.push(None);
                    cols.secondary_lon.push(None);
                    cols.secondary_time.push(None);
                    cols.distance_km.push(None);
                    cols.time_diff_s.push(None);
                }
            }
        }

        self.cursor += records.len();
        debug!("appended {} matchup rows, write cursor now {}", records.len(), self.cursor);
        self.cursor
    }

    fn source_position(&mut self, source: &str) -> usize {
        if let Some(&i) = self.source_lookup.get(source) {
            return i;
        }
        let i = self.sources.len();
        self.sources.push(source.to_owned());
        self.source_lookup.insert(source.to_owned(), i);
        i
    }

    pub fn total_written(&self) -> usize {
        self.cursor
    }

    pub fn num_matched(&self) -> usize {
        self.columns.num_matched()
    }

    /// Secondary granules referenced by at least one row, in order of first use
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Close the accumulator. A many-to-one matchup with no matched rows is
    /// rejected as a whole.
    pub fn finalize(self, header: MatchupHeader) -> Result<MatchupIndex, MatchupError> {
        let n_matched = self.num_matched();
        if header.mode == MatchupMode::ManyToOne && n_matched == 0 {
            return Err(MatchupError::ZeroAcceptedMatches { primary: header.primary_granule.clone() });
        }
        info!("{} matchup rows written for {}, {n_matched} matched", self.cursor, header.primary_granule);

        Ok(MatchupIndex { header, columns: self.columns, sources: self.sources, upstream: None, footprints: None })
    }
}

/// A finished matchup: header metadata plus row-aligned columns
#[derive(Debug, Clone)]
pub struct MatchupIndex {
    pub header: MatchupHeader,
    pub columns: MatchupColumns,
    /// Secondary granule identifiers, indexed by `columns.source`
    pub sources: Vec<String>,
    pub upstream: Option<UpstreamColumns>,
    pub footprints: Option<FootprintColumns>,
}

impl MatchupIndex {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn num_matched(&self) -> usize {
        self.columns.num_matched()
    }

    /// Attach the provenance of the product the primary pixels were read from.
    /// It must have one entry per row.
    pub fn with_upstream(mut self, upstream: UpstreamColumns) -> Result<Self, MatchupError> {
        if upstream.len() != self.len() || upstream.secondary_index.len() != self.len() || upstream.source_file.len() != self.len() {
            return Err(MatchupError::InternalError(format!(
                "upstream columns have {} rows but the matchup has {}", upstream.len(), self.len()
            )));
        }
        self.upstream = Some(upstream);
        Ok(self)
    }

    pub fn with_footprints(mut self, footprints: FootprintColumns) -> Result<Self, MatchupError> {
        if footprints.len() != self.len() {
            return Err(MatchupError::InternalError(format!(
                "footprint columns have {} rows but the matchup has {}", footprints.len(), self.len()
            )));
        }
        self.footprints = Some(footprints);
        Ok(self)
    }

    pub fn mean_distance_km(&self) -> Option<f64> {
        mean_of_some(&self.columns.distance_km)
    }

    pub fn mean_time_diff_s(&self) -> Option<f64> {
        mean_of_some(&self.columns.time_diff_s)
    }

    pub fn source_of_row(&self, row: usize) -> Option<&str> {
        let i = (*self.columns.source.get(row)?)?;
        self.sources.get(i).map(|s| s.as_str())
    }

    /// Rebuild the record for one row
    pub fn record(&self, row: usize) -> Option<MatchupRecord> {
        let cols = &self.columns;
        let primary = (*cols.primary_lat.get(row)?, *cols.primary_lon.get(row)?, *cols.primary_time.get(row)?);
        let primary_index = cols.primary_index.get(row)?.clone();
        let rec = match cols.secondary_index.get(row)? {
            Some(sec) => MatchupRecord::matched(primary_index, primary, MatchCandidate {
                secondary_index: sec.clone(),
                distance_km: (*cols.distance_km.get(row)?)?,
                time_diff_s: cols.time_diff_s.get(row)?.unwrap_or(f64::NAN),
                source_granule: self.source_of_row(row)?.to_owned(),
                lat: (*cols.secondary_lat.get(row)?)?,
                lon: (*cols.secondary_lon.get(row)?)?,
                time: cols.secondary_time.get(row)?.unwrap_or(f64::NAN),
            }),
            None => MatchupRecord::unmatched(primary_index, primary),
        };
        Some(rec)
    }
}

fn mean_of_some(values: &[Option<f64>]) -> Option<f64> {
    let mut m = RunningMean::new();
    for v in values.iter().flatten() {
        if !v.is_nan() {
            m += *v;
        }
    }
    m.mean()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(i: usize, src: &str, dist: f64, dt: f64) -> MatchCandidate {
        MatchCandidate { secondary_index: vec![i], distance_km: dist, time_diff_s: dt, source_granule: src.to_owned(), lat: 1.0, lon: 2.0, time: 3.0 }
    }

    #[test]
    fn test_append_advances_cursor() {
        let mut acc = MatchupAccumulator::new();
        assert_eq!(acc.total_written(), 0);
        let recs = vec![
            MatchupRecord::matched(vec![0, 1], (0.0, 0.0, 0.0), cand(5, "a.nc", 1.0, 10.0)),
            MatchupRecord::unmatched(vec![0, 2], (0.0, 0.1, 0.0)),
        ];
        assert_eq!(acc.append(&recs), 2);
        assert_eq!(acc.append(&[]), 2);
        assert_eq!(acc.append(&recs[..1]), 3);
        assert_eq!(acc.total_written(), 3);
        assert_eq!(acc.num_matched(), 2);
    }

    #[test]
    fn test_sources_deduplicated_in_first_use_order() {
        let mut acc = MatchupAccumulator::new();
        acc.append(&[
            MatchupRecord::matched(vec![0], (0.0, 0.0, 0.0), cand(0, "b.nc", 1.0, 1.0)),
            MatchupRecord::matched(vec![1], (0.0, 0.0, 0.0), cand(1, "a.nc", 1.0, 1.0)),
            MatchupRecord::matched(vec![2], (0.0, 0.0, 0.0), cand(2, "b.nc", 1.0, 1.0)),
        ]);
        assert_eq!(acc.sources(), &["b.nc", "a.nc"]);

        let idx = acc.finalize(MatchupHeader::new("AIRS", "CloudSat", "airs.nc", MatchupMode::ManyToOne)).unwrap();
        assert_eq!(idx.columns.source, vec![Some(0), Some(1), Some(0)]);
        assert_eq!(idx.source_of_row(1), Some("a.nc"));
    }

    #[test]
    fn test_finalize_many_to_one_requires_match() {
        let mut acc = MatchupAccumulator::new();
        acc.append(&[MatchupRecord::unmatched(vec![0], (0.0, 0.0, 0.0))]);
        let res = acc.finalize(MatchupHeader::new("AIRS", "CloudSat", "airs.nc", MatchupMode::ManyToOne));
        assert!(matches!(res, Err(MatchupError::ZeroAcceptedMatches { .. })));

        let mut acc = MatchupAccumulator::new();
        acc.append(&[MatchupRecord::unmatched(vec![0], (0.0, 0.0, 0.0))]);
        let idx = acc.finalize(MatchupHeader::new("CloudSat", "CALIPSO", "cs.nc", MatchupMode::OneToOne(SelectionRule::NearestInTime))).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.num_matched(), 0);
        assert!(idx.mean_distance_km().is_none());
    }

    #[test]
    fn test_record_reconstruction_and_means() {
        let mut acc = MatchupAccumulator::new();
        let recs = vec![
            MatchupRecord::matched(vec![0], (1.0, 2.0, 3.0), cand(7, "a.nc", 2.0, 10.0)),
            MatchupRecord::unmatched(vec![1], (4.0, 5.0, 6.0)),
            MatchupRecord::matched(vec![2], (1.0, 2.0, 3.0), cand(8, "a.nc", 4.0, 30.0)),
        ];
        acc.append(&recs);
        let idx = acc.finalize(MatchupHeader::new("CloudSat", "CALIPSO", "cs.nc", MatchupMode::OneToOne(SelectionRule::NearestInTime))).unwrap();
        for (i, r) in recs.iter().enumerate() {
            assert_eq!(idx.record(i).as_ref(), Some(r));
        }
        assert!(idx.record(3).is_none());
        assert_eq!(idx.mean_distance_km(), Some(3.0));
        assert_eq!(idx.mean_time_diff_s(), Some(20.0));
    }

    #[test]
    fn test_footprint_lookup() {
        let lat = ndarray::Array2::from_shape_fn((2, 2), |(i, _)| i as f64).into_dyn();
        let lon = ndarray::Array2::from_shape_fn((2, 2), |(_, j)| 10.0 * j as f64).into_dyn();
        let time = ndarray::Array2::from_elem((2, 2), 5.0).into_dyn();
        let fp = Geolocation::new("airs", lat, lon, time).unwrap();

        let cols = FootprintColumns::for_rows(&fp, &[vec![1, 1, 0, 2], vec![0, 1, 2, 2]]).unwrap();
        assert_eq!(cols.lat, vec![1.0, 0.0]);
        assert_eq!(cols.lon, vec![10.0, 10.0]);
        assert_eq!(cols.time, vec![5.0, 5.0]);
        assert!(FootprintColumns::for_rows(&fp, &[vec![2, 0, 0, 0]]).is_err());
        assert!(FootprintColumns::for_rows(&fp, &[vec![0]]).is_err());

        let mut acc = MatchupAccumulator::new();
        acc.append(&[MatchupRecord::matched(vec![1, 1, 0, 2], (0.0, 0.0, 0.0), cand(0, "cs", 1.0, 1.0))]);
        let idx = acc.finalize(MatchupHeader::new("AIRS", "CloudSat", "airs.nc", MatchupMode::ManyToOne)).unwrap();
        assert!(idx.clone().with_footprints(cols).is_err());
        let one = FootprintColumns::for_rows(&fp, &idx.columns.primary_index).unwrap();
        assert_eq!(idx.with_footprints(one).unwrap().footprints.unwrap().lat, vec![1.0]);
    }

    #[test]
    fn test_non_finite_times_stored_as_missing() {
        let mut acc = MatchupAccumulator::new();
        let mut c = cand(0, "grid", 3.0, f64::NAN);
        c.time = f64::NAN;
        acc.append(&[MatchupRecord::matched(vec![0], (0.0, 0.0, 0.0), c.clone())]);
        let idx = acc.finalize(MatchupHeader::new("AIRS", "AMSR", "airs.nc", MatchupMode::Gridded)).unwrap();
        assert_eq!(idx.columns.time_diff_s, vec![None]);
        assert_eq!(idx.columns.secondary_time, vec![None]);
        assert_eq!(idx.num_matched(), 1);
        assert!(idx.mean_time_diff_s().is_none());

        let rebuilt = idx.record(0).unwrap();
        let rc = rebuilt.outcome.candidate().unwrap();
        assert!(rc.time.is_nan() && rc.time_diff_s.is_nan());
        assert_eq!(rc.distance_km, 3.0);
    }
}
