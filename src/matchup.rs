//! Scenario drivers tying the coarse, fine and selection steps together.
//!
//! * [`match_many_to_one`]: every secondary pixel (e.g. CloudSat profile) is
//!   assigned to its nearest primary footprint (e.g. AIRS) and kept if it passes
//!   both tolerances; several secondary pixels may share one footprint.
//! * [`match_one_to_one`]: every primary pixel (e.g. a CloudSat profile) gets
//!   exactly one row, holding the best secondary pixel (e.g. CALIPSO) or a
//!   no-match marker.
//! * [`match_to_grid`]: every primary pixel is snapped to a cell of a gridded
//!   secondary product.
use indicatif::ParallelProgressIterator;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::accumulate::{FootprintColumns, MatchupAccumulator, MatchupHeader, MatchupIndex, MatchupMode, MatchupRecord};
use crate::coarse::select_granules;
use crate::error::MatchupError;
use crate::fine::{batch_nearest, nearest_pixel};
use crate::granule::{BoundingBox, Geolocation, Granule, PixelIndex, TimeInterval};
use crate::grid::{grid_index, GridNearestNeighbor, NodeTypeLookup};
use crate::select::{evaluate, select_one, BestTracker, MatchCandidate, SelectionRule, Tolerances};
use crate::utils::{great_circle_distance, ShowProgress};

/// One pixel of a primary dataset to be matched
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryPixel {
    pub index: PixelIndex,
    pub lat: f64,
    pub lon: f64,
    pub time: f64,
}

impl PrimaryPixel {
    fn coords(&self) -> (f64, f64, f64) {
        (self.lat, self.lon, self.time)
    }
}

/// Every pixel of a geolocation, in row-major order
pub fn primary_pixels(geo: &Geolocation) -> Vec<PrimaryPixel> {
    geo.lat.indexed_iter()
        .filter_map(|(idx, _)| {
            let index = ndarray::Dimension::slice(&idx).to_vec();
            let (lat, lon, time) = geo.pixel(&index)?;
            Some(PrimaryPixel { index, lat, lon, time })
        })
        .collect()
}

/// Time window spanned by a set of primary pixels, ignoring NaN times
pub fn pixels_time_interval(pixels: &[PrimaryPixel]) -> Option<TimeInterval> {
    let (start, end) = pixels.iter()
        .map(|p| p.time)
        .filter(|t| !t.is_nan())
        .fold(None, |acc: Option<(f64, f64)>, t| match acc {
            None => Some((t, t)),
            Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
        })?;
    Some(TimeInterval::new(start, end))
}

fn pixels_bounding_box(pixels: &[PrimaryPixel]) -> Option<BoundingBox> {
    pixels.iter()
        .filter(|p| !p.lat.is_nan() && !p.lon.is_nan())
        .fold(None, |acc: Option<BoundingBox>, p| match acc {
            None => Some(BoundingBox { north: p.lat, south: p.lat, east: p.lon, west: p.lon }),
            Some(b) => Some(BoundingBox {
                north: b.north.max(p.lat),
                south: b.south.min(p.lat),
                east: b.east.max(p.lon),
                west: b.west.min(p.lon),
            }),
        })
}

/// Names used in logs and product headers
#[derive(Debug, Clone)]
pub struct InstrumentPair {
    pub primary: String,
    pub secondary: String,
}

impl InstrumentPair {
    pub fn new(primary: &str, secondary: &str) -> Self {
        Self { primary: primary.to_owned(), secondary: secondary.to_owned() }
    }
}

/// How [`match_one_to_one`] picks and reports matches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OneToOneOptions {
    pub rule: SelectionRule,
    /// With no candidate granules at all, write every primary pixel as
    /// unmatched instead of failing with `EmptyCandidateSet`
    pub tolerate_empty: bool,
}

impl From<SelectionRule> for OneToOneOptions {
    fn from(rule: SelectionRule) -> Self {
        Self { rule, tolerate_empty: false }
    }
}

fn log_best(label: &str, best: &BestTracker) {
    if let Some(b) = &best.by_distance {
        info!("{label} best by distance: {} km, {} s, index {:?} in {}", b.distance_km, b.time_diff_s, b.secondary_index, b.source_granule);
    }
    if let Some(b) = &best.by_time {
        info!("{label} best by time: {} km, {} s, index {:?} in {}", b.distance_km, b.time_diff_s, b.secondary_index, b.source_granule);
    }
}

/// Match a primary footprint granule against candidate secondary granules,
/// keeping every secondary pixel whose nearest primary footprint passes both
/// tolerances. Each row's primary index is that footprint.
///
/// Fails with `ZeroAcceptedMatches` if no secondary pixel passes.
pub fn match_many_to_one<P: Granule, S: Granule>(
    primary: &P,
    candidates: Vec<S>,
    tolerances: &Tolerances,
    names: &InstrumentPair,
) -> Result<MatchupIndex, MatchupError> {
    let primary_geo = primary.geolocation()?;
    let target = primary.time_interval()?;
    info!("Matching {} granule {} ({} to {})", names.primary, primary.id(), target.start, target.end);

    let selected = select_granules(target, candidates, tolerances.time_s, &names.secondary)?;

    let mut acc = MatchupAccumulator::new();
    let mut overall_best = BestTracker::new();
    for granule in selected.iter() {
        let secondary_geo = granule.geolocation()?;
        let pixel_matches = batch_nearest(&secondary_geo, &primary_geo)?;

        let mut with_primary = Vec::with_capacity(pixel_matches.len());
        for pm in pixel_matches {
            if let Some(nearest) = pm.nearest {
                let cand = MatchCandidate {
                    secondary_index: pm.query_index,
                    distance_km: nearest.distance_km,
                    time_diff_s: nearest.time_diff_s,
                    source_granule: granule.id().to_owned(),
                    lat: pm.query_lat,
                    lon: pm.query_lon,
                    time: pm.query_time,
                };
                with_primary.push((nearest.index, (nearest.lat, nearest.lon, nearest.time), cand));
            }
        }

        let eval = evaluate(with_primary.iter().map(|(_, _, c)| c.clone()), tolerances);
        log_best(granule.id(), &eval.overall_best);
        overall_best.merge(&eval.overall_best);

        if eval.accepted.is_empty() {
            debug!("No {} pixels in {} passed the distance and time tolerances", names.secondary, granule.id());
            continue;
        }

        let records = with_primary.into_iter()
            .filter(|(_, _, c)| tolerances.admits(c))
            .map(|(primary_index, coords, c)| MatchupRecord::matched(primary_index, coords, c))
            .collect::<Vec<_>>();
        let cursor = acc.append(&records);
        info!("{} rows accepted from {} (total {cursor})", records.len(), granule.id());
    }

    log_best("overall", &overall_best);

    let header = MatchupHeader::new(&names.primary, &names.secondary, primary.id(), MatchupMode::ManyToOne)
        .with_tolerances(*tolerances)
        .with_extent(Some(target), primary_geo.bounding_box());
    let index = acc.finalize(header)?;

    match primary.footprint_geolocation()? {
        Some(footprints) => {
            let cols = FootprintColumns::for_rows(&footprints, &index.columns.primary_index)?;
            index.with_footprints(cols)
        },
        None => Ok(index),
    }
}

/// Match each primary pixel to at most one secondary pixel. Every primary pixel
/// yields exactly one row, in input order; pixels with no candidate inside the
/// tolerances get an unmatched row. `options` accepts a bare [`SelectionRule`].
pub fn match_one_to_one<S: Granule>(
    primary_id: &str,
    primary: &[PrimaryPixel],
    candidates: Vec<S>,
    tolerances: &Tolerances,
    options: impl Into<OneToOneOptions>,
    names: &InstrumentPair,
    show_progress: &ShowProgress,
) -> Result<MatchupIndex, MatchupError> {
    let OneToOneOptions { rule, tolerate_empty } = options.into();
    let target = pixels_time_interval(primary)
        .ok_or_else(|| MatchupError::malformed(primary_id, "no valid primary pixel times"))?;
    info!("Matching {} {} pixels from {primary_id} ({} to {})", primary.len(), names.primary, target.start, target.end);

    let selected = if candidates.is_empty() && tolerate_empty {
        warn!("No {} granules found for {primary_id}, every row will be unmatched", names.secondary);
        Vec::new()
    } else {
        select_granules(target, candidates, tolerances.time_s, &names.secondary)?
    };
    let secondary = selected.iter()
        .map(|g| Ok((g.id().to_owned(), g.geolocation()?)))
        .collect::<Result<Vec<_>, MatchupError>>()?;

    let pb = show_progress.bar(primary.len() as u64, format!("Matching {primary_id}"));
    let results = primary.par_iter()
        .progress_with(pb)
        .map(|px| match_one_pixel(px, &secondary, tolerances, rule))
        .collect::<Result<Vec<_>, MatchupError>>()?;

    let mut acc = MatchupAccumulator::new();
    let mut overall_best = BestTracker::new();
    let mut records = Vec::with_capacity(results.len());
    for (record, best) in results {
        overall_best.merge(&best);
        records.push(record);
    }
    acc.append(&records);
    log_best("overall", &overall_best);

    let n_unmatched = records.iter().filter(|r| !r.outcome.is_matched()).count();
    if n_unmatched > 0 {
        warn!("{n_unmatched} of {} {} pixels had no {} match within tolerance", records.len(), names.primary, names.secondary);
    }

    let header = MatchupHeader::new(&names.primary, &names.secondary, primary_id, MatchupMode::OneToOne(rule))
        .with_tolerances(*tolerances)
        .with_extent(Some(target), pixels_bounding_box(primary));
    acc.finalize(header)
}

fn match_one_pixel(
    px: &PrimaryPixel,
    secondary: &[(String, Geolocation)],
    tolerances: &Tolerances,
    rule: SelectionRule,
) -> Result<(MatchupRecord, BestTracker), MatchupError> {
    let mut candidates = Vec::with_capacity(secondary.len());
    for (id, geo) in secondary {
        if let Some(nearest) = nearest_pixel(px.lat, px.lon, px.time, geo)? {
            candidates.push(MatchCandidate {
                secondary_index: nearest.index,
                distance_km: nearest.distance_km,
                time_diff_s: nearest.time_diff_s,
                source_granule: id.clone(),
                lat: nearest.lat,
                lon: nearest.lon,
                time: nearest.time,
            });
        }
    }

    let eval = evaluate(candidates, tolerances);
    let record = match select_one(&eval, rule).candidate() {
        Some(c) => MatchupRecord::matched(px.index.clone(), px.coords(), c.clone()),
        None => {
            debug!("No match for primary pixel {:?}", px.index);
            MatchupRecord::unmatched(px.index.clone(), px.coords())
        }
    };
    Ok((record, eval.overall_best))
}

/// Snap every pixel of a primary granule to the nearest cell of a gridded
/// product. No tolerances apply; pixels with NaN positions get unmatched rows.
/// The secondary index of each row is (orbit, latitude index, longitude index)
/// and its distance is to the cell center. Gridded products carry no per-pixel
/// time, so the time columns are empty.
pub fn match_to_grid<P: Granule>(
    primary: &P,
    grid: &GridNearestNeighbor,
    grid_lat: &[f64],
    grid_lon: &[f64],
    nodes: &NodeTypeLookup,
    grid_id: &str,
    names: &InstrumentPair,
) -> Result<MatchupIndex, MatchupError> {
    let geo = primary.geolocation()?;
    let pixels = primary_pixels(&geo);
    info!("Snapping {} {} pixels from {} to the {} grid", pixels.len(), names.primary, primary.id(), names.secondary);

    let mut records = Vec::with_capacity(pixels.len());
    for px in pixels.iter() {
        let rec = match grid_index(grid, nodes, &px.index, px.lat, px.lon)? {
            Some(cell) => {
                let (cell_lat, cell_lon) = (grid_lat.get(cell[1]).copied(), grid_lon.get(cell[2]).copied());
                let (cell_lat, cell_lon) = match (cell_lat, cell_lon) {
                    (Some(la), Some(lo)) => (la, lo),
                    _ => return Err(MatchupError::InternalError(format!("grid cell {cell:?} is outside the grid axes"))),
                };
                let cand = MatchCandidate {
                    distance_km: great_circle_distance(px.lat, px.lon, cell_lat, cell_lon),
                    time_diff_s: f64::NAN,
                    secondary_index: cell,
                    source_granule: grid_id.to_owned(),
                    lat: cell_lat,
                    lon: cell_lon,
                    time: f64::NAN,
                };
                MatchupRecord::matched(px.index.clone(), px.coords(), cand)
            },
            None => MatchupRecord::unmatched(px.index.clone(), px.coords()),
        };
        records.push(rec);
    }

    let mut acc = MatchupAccumulator::new();
    acc.append(&records);
    let header = MatchupHeader::new(&names.primary, &names.secondary, primary.id(), MatchupMode::Gridded)
        .with_extent(primary.time_interval().ok(), geo.bounding_box());
    acc.finalize(header)
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array4};

    use super::*;
    use crate::granule::MemoryGranule;
    use crate::select::MatchOutcome;

    fn airs_granule() -> MemoryGranule {
        // one footprint row of 2 footprints, each with 3 x 3 sub-footprints about 0.1 degree apart
        let lat = Array4::from_shape_fn((1, 2, 3, 3), |(_, _, k, _)| 10.0 + 0.1 * k as f64).into_dyn();
        let lon = Array4::from_shape_fn((1, 2, 3, 3), |(_, j, _, l)| 20.0 + 0.3 * j as f64 + 0.1 * l as f64).into_dyn();
        let time = Array2::from_shape_fn((1, 2), |(_, j)| 1000.0 + 2.0 * j as f64).into_dyn();
        MemoryGranule::new("airs", lat, lon, time).unwrap().with_end_padding(6.9999)
    }

    #[test]
    fn test_many_to_one_keeps_all_passing_rows() {
        let airs = airs_granule();
        let cs = MemoryGranule::from_profiles(
            "cs1",
            &[10.0, 10.1, 10.2, 40.0],
            &[20.0, 20.4, 20.5, 20.0],
            &[1000.0, 1001.0, 1002.0, 1003.0],
        ).unwrap();
        let far_in_time = MemoryGranule::from_profiles("cs0", &[10.0], &[20.0], &[-50000.0]).unwrap();

        let idx = match_many_to_one(&airs, vec![cs, far_in_time], &Tolerances::default(), &InstrumentPair::new("AIRS", "CloudSat")).unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.columns.primary_index, vec![vec![0, 0, 0, 0], vec![0, 1, 1, 1], vec![0, 1, 2, 2]]);
        assert_eq!(idx.columns.secondary_index, vec![Some(vec![0]), Some(vec![1]), Some(vec![2])]);
        assert_eq!(idx.columns.time_diff_s[1], Some(1.0));
        assert!(idx.sources.contains(&"cs1".to_owned()));
        assert!(idx.footprints.is_none());
    }

    #[test]
    fn test_many_to_one_footprint_columns() {
        // AMSU footprints sit at the center of each 3 x 3 block of AIRS pixels
        let fp_lat = Array2::from_elem((1, 2), 10.1).into_dyn();
        let fp_lon = Array2::from_shape_fn((1, 2), |(_, j)| 20.1 + 0.3 * j as f64).into_dyn();
        let airs = airs_granule().with_footprints(fp_lat, fp_lon).unwrap();
        let cs = MemoryGranule::from_profiles("cs1", &[10.0, 10.1], &[20.0, 20.4], &[1000.0, 1001.0]).unwrap();

        let idx = match_many_to_one(&airs, vec![cs], &Tolerances::default(), &InstrumentPair::new("AIRS", "CloudSat")).unwrap();
        assert_eq!(idx.columns.primary_index, vec![vec![0, 0, 0, 0], vec![0, 1, 1, 1]]);
        let fp = idx.footprints.as_ref().unwrap();
        assert_eq!(fp.lat, vec![10.1, 10.1]);
        assert!((fp.lon[0] - 20.1).abs() < 1e-9 && (fp.lon[1] - 20.4).abs() < 1e-9);
        assert_eq!(fp.time, vec![1000.0, 1002.0]);
    }

    #[test]
    fn test_many_to_one_no_rows_is_error() {
        let airs = airs_granule();
        let cs = MemoryGranule::from_profiles("cs", &[-40.0, -41.0], &[100.0, 100.0], &[1000.0, 1001.0]).unwrap();
        let res = match_many_to_one(&airs, vec![cs], &Tolerances::default(), &InstrumentPair::new("AIRS", "CloudSat"));
        assert!(matches!(res, Err(MatchupError::ZeroAcceptedMatches { .. })));
    }

    #[test]
    fn test_one_to_one_row_per_primary_pixel() {
        let primary = vec![
            PrimaryPixel { index: vec![10], lat: 0.0, lon: 0.0, time: 100.0 },
            PrimaryPixel { index: vec![11], lat: 0.0, lon: 0.01, time: 110.0 },
            PrimaryPixel { index: vec![12], lat: 5.0, lon: 5.0, time: 120.0 },
        ];
        // two granules each offering a candidate for the first pixels; the second is closer in time
        let g1 = MemoryGranule::from_profiles("cal1", &[0.0, 0.0], &[0.0, 0.01], &[0.0, 50.0]).unwrap();
        let g2 = MemoryGranule::from_profiles("cal2", &[0.01, 0.01], &[0.0, 0.01], &[101.0, 105.0]).unwrap();

        let idx = match_one_to_one("cs", &primary, vec![g1.clone(), g2.clone()], &Tolerances::default(),
                                   SelectionRule::NearestInTime, &InstrumentPair::new("CloudSat", "CALIPSO"), &ShowProgress::No).unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.columns.primary_index, vec![vec![10], vec![11], vec![12]]);
        assert_eq!(idx.source_of_row(0), Some("cal2"));
        assert_eq!(idx.columns.secondary_index[0], Some(vec![0]));
        assert_eq!(idx.record(2).unwrap().outcome, MatchOutcome::Unmatched);

        // nearest in distance picks the exact-position pixel in the first granule
        let idx = match_one_to_one("cs", &primary, vec![g1, g2], &Tolerances::default(),
                                   SelectionRule::NearestInDistance, &InstrumentPair::new("CloudSat", "CALIPSO"), &ShowProgress::No).unwrap();
        assert_eq!(idx.source_of_row(0), Some("cal1"));
        assert_eq!(idx.columns.distance_km[0], Some(0.0));
    }

    #[test]
    fn test_one_to_one_without_candidates() {
        let primary = vec![
            PrimaryPixel { index: vec![0], lat: 0.0, lon: 0.0, time: 100.0 },
            PrimaryPixel { index: vec![1], lat: 0.0, lon: 0.01, time: 110.0 },
        ];
        let names = InstrumentPair::new("CloudSat", "CALIPSO");

        let res = match_one_to_one("cs", &primary, Vec::<MemoryGranule>::new(), &Tolerances::default(),
                                   SelectionRule::NearestInTime, &names, &ShowProgress::No);
        assert!(matches!(res, Err(MatchupError::EmptyCandidateSet { .. })));

        let options = OneToOneOptions { rule: SelectionRule::NearestInTime, tolerate_empty: true };
        let idx = match_one_to_one("cs", &primary, Vec::<MemoryGranule>::new(), &Tolerances::default(),
                                   options, &names, &ShowProgress::No).unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.num_matched(), 0);
        assert_eq!(idx.columns.primary_index, vec![vec![0], vec![1]]);
        assert!(idx.sources.is_empty());
    }

    #[test]
    fn test_match_to_grid() {
        let airs = MemoryGranule::new(
            "airs",
            Array2::from_shape_vec((4, 1), vec![0.1, 0.9, f64::NAN, 0.2]).unwrap().into_dyn(),
            Array2::from_shape_vec((4, 1), vec![0.1, 358.9, 0.0, 1.1]).unwrap().into_dyn(),
            ndarray::Array1::from_vec(vec![0.0, 1.0, 2.0, 3.0]).into_dyn(),
        ).unwrap();
        let lat = [0.0, 1.0];
        let lon = [0.0, 1.0, 359.0];
        let grid = GridNearestNeighbor::new(&lat, &lon).unwrap();
        let nodes = NodeTypeLookup::from_str_codes("AD", 3);

        let idx = match_to_grid(&airs, &grid, &lat, &lon, &nodes, "amsr", &InstrumentPair::new("AIRS", "AMSR2")).unwrap();
        assert_eq!(idx.columns.secondary_index, vec![Some(vec![0, 0, 0]), Some(vec![0, 1, 2]), None, Some(vec![1, 0, 1])]);
        assert_eq!(idx.columns.time_diff_s, vec![None; 4]);
        assert_eq!(idx.columns.secondary_time, vec![None; 4]);
        assert!(idx.columns.distance_km[0].is_some());
        assert!(idx.mean_time_diff_s().is_none());

        // gridded rows still rebuild as matched records
        let rec = idx.record(0).unwrap();
        assert!(rec.outcome.is_matched());
        assert!(rec.outcome.candidate().unwrap().time_diff_s.is_nan());
    }
}
