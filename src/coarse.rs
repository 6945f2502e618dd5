//! Coarse, granule-level matchup: choose which secondary granules can contain
//! pixels close in time to a primary granule.
use std::ops::RangeInclusive;

use itertools::Itertools;
use log::{debug, info};

use crate::error::MatchupError;
use crate::granule::{Granule, GranuleTimeIndex, TimeInterval};

/// How the start and end brackets of a coarse match were resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketSource {
    /// Candidates contained both the target start and end times
    Direct,
    /// Nothing contained the target start, so the end bracket was used for both
    StartFromEnd,
    /// Nothing contained the target end, so the start bracket was used for both
    EndFromStart,
    /// Nothing contained either time; the closest candidate boundaries were used
    Closest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoarseMatch {
    pub start_bracket: Vec<usize>,
    pub end_bracket: Vec<usize>,
    pub source: BracketSource,
    /// Candidate positions covered, including one slop granule on either side
    /// where available, in ascending time order
    pub matched: Vec<usize>,
}

impl CoarseMatch {
    pub fn ids<'a>(&self, index: &'a GranuleTimeIndex) -> Vec<&'a str> {
        self.matched.iter()
            .map(|&i| index.ids()[i].as_str())
            .collect_vec()
    }
}

/// Find the candidate granules whose time intervals bracket the target window.
///
/// Candidates containing the target start and end are preferred. If only one end
/// is bracketed, its candidates stand in for the other. If neither is, each end
/// falls back to the candidate with the nearest boundary, provided that is within
/// `time_tol` seconds; the run fails if even the closer of the two is not.
/// The resulting index range is widened by one granule on each side.
pub fn bracket(target: TimeInterval, index: &GranuleTimeIndex, time_tol: f64) -> Result<CoarseMatch, MatchupError> {
    if index.is_empty() {
        return Err(MatchupError::EmptyCandidateSet { instrument: "secondary".to_owned() });
    }

    let intervals = index.intervals();
    let containing = |t: f64| intervals.iter()
        .positions(|iv| iv.contains(t))
        .collect_vec();

    let mut start_bracket = containing(target.start);
    let mut end_bracket = containing(target.end);
    let mut source = BracketSource::Direct;

    if start_bracket.is_empty() && !end_bracket.is_empty() {
        debug!("No candidate granule brackets target start time {}. Using match from target end time.", target.start);
        start_bracket = end_bracket.clone();
        source = BracketSource::StartFromEnd;
    } else if !start_bracket.is_empty() && end_bracket.is_empty() {
        debug!("No candidate granule brackets target end time {}. Using match from target start time.", target.end);
        end_bracket = start_bracket.clone();
        source = BracketSource::EndFromStart;
    } else if start_bracket.is_empty() && end_bracket.is_empty() {
        let (closest_to_start, start_diff) = closest_boundary(intervals, target.start);
        let (closest_to_end, end_diff) = closest_boundary(intervals, target.end);
        debug!("closest to target start: {closest_to_start} ({start_diff} s); closest to target end: {closest_to_end} ({end_diff} s)");

        let min_diff = start_diff.min(end_diff);
        if !(min_diff <= time_tol) {
            info!("min time diff exceeded time tolerance ({time_tol} seconds): {min_diff}");
            return Err(MatchupError::CoarseMatchupNotFound {
                target_start: target.start, target_end: target.end, min_diff_s: min_diff, time_tol_s: time_tol
            });
        }

        let start_idx = if start_diff <= time_tol { closest_to_start } else { closest_to_end };
        let end_idx = if end_diff <= time_tol { closest_to_end } else { closest_to_start };
        start_bracket = vec![start_idx];
        end_bracket = vec![end_idx];
        source = BracketSource::Closest;
    }

    debug!("start bracket: {start_bracket:?}, end bracket: {end_bracket:?}");
    let range = matched_range(&start_bracket, &end_bracket, index.len());
    let matched = range.collect_vec();
    debug!("matched candidate positions: {matched:?}");

    Ok(CoarseMatch { start_bracket, end_bracket, source, matched })
}

/// Candidate whose nearer boundary is closest to `t`; the first wins ties.
/// NaN differences are never selected, so an all-NaN input yields a NaN difference.
fn closest_boundary(intervals: &[TimeInterval], t: f64) -> (usize, f64) {
    let mut best = (0, f64::NAN);
    for (i, iv) in intervals.iter().enumerate() {
        let d = iv.boundary_distance(t);
        if !d.is_nan() && (best.1.is_nan() || d < best.1) {
            best = (i, d);
        }
    }
    best
}

fn matched_range(start_bracket: &[usize], end_bracket: &[usize], n: usize) -> RangeInclusive<usize> {
    let lo = start_bracket.iter().chain(end_bracket).copied().min().unwrap_or(0);
    let hi = start_bracket.iter().chain(end_bracket).copied().max().unwrap_or(0);

    let lo = lo.saturating_sub(1);
    let hi = if hi + 1 < n { hi + 1 } else { hi };
    lo..=hi
}

/// Order `candidates` by time, bracket `target` against them and return the
/// selected granules in ascending time order.
pub fn select_granules<G: Granule>(target: TimeInterval, candidates: Vec<G>, time_tol: f64, instrument: &str) -> Result<Vec<G>, MatchupError> {
    if candidates.is_empty() {
        return Err(MatchupError::EmptyCandidateSet { instrument: instrument.to_owned() });
    }

    let mut with_times = Vec::with_capacity(candidates.len());
    for g in candidates {
        let interval = g.time_interval()?;
        with_times.push((g, interval));
    }
    with_times.sort_by(|(ga, a), (gb, b)| a.start.total_cmp(&b.start).then_with(|| ga.id().cmp(gb.id())));

    let index = GranuleTimeIndex::new(
        with_times.iter().map(|(g, _)| g.id().to_owned()).collect(),
        with_times.iter().map(|(_, iv)| *iv).collect(),
    )?;
    let coarse = bracket(target, &index, time_tol)?;
    info!("Coarse matchup selected {} {instrument} granule(s): {:?}", coarse.matched.len(), coarse.ids(&index));

    let keep = coarse.matched;
    let selected = with_times.into_iter()
        .enumerate()
        .filter_map(|(i, (g, _))| if keep.contains(&i) { Some(g) } else { None })
        .collect_vec();
    Ok(selected)
}
