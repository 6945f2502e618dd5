//! Tolerance filtering and best-match selection.
use log::debug;
use serde::{Serialize, Deserialize};

use crate::error::MatchupError;
use crate::granule::PixelIndex;

/// Maximum separation for two pixels to count as a matchup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    /// Maximum great-circle distance in kilometers
    #[serde(default = "Tolerances::default_distance_km")]
    pub distance_km: f64,
    /// Maximum absolute time difference in seconds
    #[serde(default = "Tolerances::default_time_s")]
    pub time_s: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self { distance_km: Self::default_distance_km(), time_s: Self::default_time_s() }
    }
}

impl Tolerances {
    pub fn new(distance_km: f64, time_s: f64) -> Result<Self, MatchupError> {
        let tol = Self { distance_km, time_s };
        tol.validate()?;
        Ok(tol)
    }

    pub fn default_distance_km() -> f64 {
        12.0
    }

    pub fn default_time_s() -> f64 {
        300.0
    }

    pub fn validate(&self) -> Result<(), MatchupError> {
        if !(self.distance_km.is_finite() && self.distance_km > 0.0) {
            return Err(MatchupError::InvalidConfig(format!("distance tolerance must be a positive number of km, got {}", self.distance_km)));
        }
        if !(self.time_s.is_finite() && self.time_s > 0.0) {
            return Err(MatchupError::InvalidConfig(format!("time tolerance must be a positive number of seconds, got {}", self.time_s)));
        }
        Ok(())
    }

    /// Both limits are inclusive. NaN distances or times never pass.
    pub fn admits(&self, candidate: &MatchCandidate) -> bool {
        candidate.distance_km <= self.distance_km && candidate.time_diff_s <= self.time_s
    }
}

/// One secondary pixel considered as a match for a primary pixel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub secondary_index: PixelIndex,
    pub distance_km: f64,
    pub time_diff_s: f64,
    pub source_granule: String,
    pub lat: f64,
    pub lon: f64,
    pub time: f64,
}

/// Which of the two running bests is written out in one-to-one matchups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    #[default]
    NearestInTime,
    NearestInDistance,
}

/// Running best candidates by distance and by time difference. The first
/// candidate seen wins a tie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestTracker {
    pub by_distance: Option<MatchCandidate>,
    pub by_time: Option<MatchCandidate>,
}

impl BestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, candidate: &MatchCandidate) {
        if is_better(self.by_distance.as_ref().map(|c| c.distance_km), candidate.distance_km) {
            self.by_distance = Some(candidate.clone());
        }
        if is_better(self.by_time.as_ref().map(|c| c.time_diff_s), candidate.time_diff_s) {
            self.by_time = Some(candidate.clone());
        }
    }

    pub fn best(&self, rule: SelectionRule) -> Option<&MatchCandidate> {
        match rule {
            SelectionRule::NearestInTime => self.by_time.as_ref(),
            SelectionRule::NearestInDistance => self.by_distance.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_distance.is_none() && self.by_time.is_none()
    }

    /// Fold another tracker into this one as if its candidates had been seen after ours
    pub fn merge(&mut self, other: &BestTracker) {
        if let Some(c) = &other.by_distance {
            if is_better(self.by_distance.as_ref().map(|b| b.distance_km), c.distance_km) {
                self.by_distance = Some(c.clone());
            }
        }
        if let Some(c) = &other.by_time {
            if is_better(self.by_time.as_ref().map(|b| b.time_diff_s), c.time_diff_s) {
                self.by_time = Some(c.clone());
            }
        }
    }
}

fn is_better(current: Option<f64>, value: f64) -> bool {
    if value.is_nan() {
        return false;
    }
    match current {
        Some(cur) => value < cur,
        None => true,
    }
}

/// Outcome of evaluating a set of candidates against the tolerances
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Candidates passing both tolerances, in the order they were given
    pub accepted: Vec<MatchCandidate>,
    /// Best candidates among the accepted ones
    pub accepted_best: BestTracker,
    /// Best candidates among all of them, regardless of tolerance. Diagnostic only.
    pub overall_best: BestTracker,
}

pub fn evaluate<I: IntoIterator<Item = MatchCandidate>>(candidates: I, tolerances: &Tolerances) -> Evaluation {
    let mut eval = Evaluation::default();
    for c in candidates {
        eval.overall_best.update(&c);
        if tolerances.admits(&c) {
            eval.accepted_best.update(&c);
            eval.accepted.push(c);
        } else {
            debug!("candidate {:?} from {} outside tolerance (distance {} km, time diff {} s)",
                   c.secondary_index, c.source_granule, c.distance_km, c.time_diff_s);
        }
    }
    eval
}

/// Result for one primary pixel in a one-to-one matchup
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(MatchCandidate),
    Unmatched,
}

impl MatchOutcome {
    pub fn candidate(&self) -> Option<&MatchCandidate> {
        match self {
            MatchOutcome::Matched(c) => Some(c),
            MatchOutcome::Unmatched => None,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched(_))
    }
}

/// Pick the single candidate to keep for one primary pixel: the best accepted
/// candidate under `rule`, or `Unmatched` if none passed the tolerances.
pub fn select_one(eval: &Evaluation, rule: SelectionRule) -> MatchOutcome {
    match eval.accepted_best.best(rule) {
        Some(c) => MatchOutcome::Matched(c.clone()),
        None => MatchOutcome::Unmatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(i: usize, dist: f64, dt: f64) -> MatchCandidate {
        MatchCandidate {
            secondary_index: vec![i],
            distance_km: dist,
            time_diff_s: dt,
            source_granule: format!("g{i}"),
            lat: 0.0,
            lon: 0.0,
            time: 0.0,
        }
    }

    #[test]
    fn test_tolerance_validation() {
        assert!(Tolerances::new(12.0, 300.0).is_ok());
        assert!(Tolerances::new(0.0, 300.0).is_err());
        assert!(Tolerances::new(12.0, -1.0).is_err());
        assert!(Tolerances::new(f64::NAN, 300.0).is_err());
        assert_eq!(Tolerances::default(), Tolerances { distance_km: 12.0, time_s: 300.0 });
    }

    #[test]
    fn test_tolerance_from_toml_defaults() {
        let tol: Tolerances = toml::from_str("distance_km = 5.0").expect("deserialization should work");
        assert_eq!(tol, Tolerances { distance_km: 5.0, time_s: 300.0 });
    }

    #[test]
    fn test_admits_inclusive() {
        let tol = Tolerances::default();
        assert!(tol.admits(&cand(0, 12.0, 300.0)));
        assert!(!tol.admits(&cand(0, 12.0001, 10.0)));
        assert!(!tol.admits(&cand(0, 1.0, 300.1)));
        assert!(!tol.admits(&cand(0, f64::NAN, 1.0)));
    }

    #[test]
    fn test_best_tracker_first_wins() {
        let mut t = BestTracker::new();
        t.update(&cand(0, 5.0, 10.0));
        t.update(&cand(1, 5.0, 10.0));
        t.update(&cand(2, 3.0, 20.0));
        t.update(&cand(3, 8.0, 1.0));
        assert_eq!(t.by_distance.as_ref().unwrap().secondary_index, vec![2]);
        assert_eq!(t.by_time.as_ref().unwrap().secondary_index, vec![3]);
    }

    #[test]
    fn test_evaluate_separates_accepted_and_diagnostic() {
        let tol = Tolerances::new(10.0, 100.0).unwrap();
        let eval = evaluate(vec![cand(0, 50.0, 1.0), cand(1, 5.0, 90.0), cand(2, 9.0, 20.0), cand(3, 1.0, 500.0)], &tol);
        assert_eq!(eval.accepted.iter().map(|c| c.secondary_index[0]).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(eval.overall_best.by_distance.as_ref().unwrap().secondary_index, vec![3]);
        assert_eq!(eval.overall_best.by_time.as_ref().unwrap().secondary_index, vec![0]);
        assert_eq!(select_one(&eval, SelectionRule::NearestInTime).candidate().unwrap().secondary_index, vec![2]);
        assert_eq!(select_one(&eval, SelectionRule::NearestInDistance).candidate().unwrap().secondary_index, vec![1]);
    }

    #[test]
    fn test_select_one_unmatched() {
        let tol = Tolerances::default();
        let eval = evaluate(vec![cand(0, 500.0, 1.0)], &tol);
        assert_eq!(select_one(&eval, SelectionRule::NearestInTime), MatchOutcome::Unmatched);
        assert!(eval.overall_best.by_distance.is_some());
    }

    #[test]
    fn test_accepted_count_monotonic_in_tolerance() {
        let cands = (0..20).map(|i| cand(i, i as f64 * 1.5, (20 - i) as f64 * 30.0)).collect::<Vec<_>>();
        let mut last = 0;
        for d in [1.0, 3.0, 6.0, 12.0, 24.0, 48.0] {
            let n = evaluate(cands.clone(), &Tolerances::new(d, 300.0).unwrap()).accepted.len();
            assert!(n >= last);
            last = n;
        }
        let mut last = 0;
        for t in [10.0, 60.0, 300.0, 600.0, 1200.0] {
            let n = evaluate(cands.clone(), &Tolerances::new(12.0, t).unwrap()).accepted.len();
            assert!(n >= last);
            last = n;
        }
    }

    #[test]
    fn test_merge_trackers() {
        let mut a = BestTracker::new();
        a.update(&cand(0, 5.0, 10.0));
        let mut b = BestTracker::new();
        b.update(&cand(1, 5.0, 2.0));
        a.merge(&b);
        assert_eq!(a.by_distance.as_ref().unwrap().secondary_index, vec![0]);
        assert_eq!(a.by_time.as_ref().unwrap().secondary_index, vec![1]);
    }
}
