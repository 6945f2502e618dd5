//! Pixel-level nearest neighbour search between two granules.
//!
//! Both searches are exhaustive: every query point is compared against every
//! pixel of the searched granule. Matchups run one granule at a time, so this is
//! thousands of queries against grids of a few thousand to a few tens of
//! thousands of pixels. No tolerance filtering happens here; see [`crate::select`].
use ndarray::Dimension;

use crate::error::MatchupError;
use crate::granule::{Geolocation, PixelIndex};
use crate::utils::{great_circle_distance_field, nan_argmin};

#[derive(Debug, Clone, PartialEq)]
pub struct NearestPixel {
    /// Index of the closest pixel in the searched granule
    pub index: PixelIndex,
    pub distance_km: f64,
    /// Absolute difference between the query time and the closest pixel's time
    pub time_diff_s: f64,
    pub lat: f64,
    pub lon: f64,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelMatch {
    pub query_index: PixelIndex,
    pub query_lat: f64,
    pub query_lon: f64,
    pub query_time: f64,
    /// `None` if the query location is NaN or every searched pixel is NaN
    pub nearest: Option<NearestPixel>,
}

/// Find the pixel of `searched` closest in distance to one point. The time
/// difference is taken at that same pixel, using the leading dimensions of its
/// index when `searched` records time more coarsely than position.
pub fn nearest_pixel(lat: f64, lon: f64, utc: f64, searched: &Geolocation) -> Result<Option<NearestPixel>, MatchupError> {
    if lat.is_nan() || lon.is_nan() {
        return Ok(None);
    }

    let dists = great_circle_distance_field(lat, lon, searched.lat.view(), searched.lon.view())?;
    let (index, distance_km) = match nan_argmin(dists.view()) {
        Some(v) => v,
        None => return Ok(None),
    };

    let (p_lat, p_lon, p_time) = searched.pixel(&index)
        .ok_or_else(|| MatchupError::InternalError(format!("nearest pixel index {index:?} is out of bounds")))?;

    Ok(Some(NearestPixel {
        index,
        distance_km,
        time_diff_s: (p_time - utc).abs(),
        lat: p_lat,
        lon: p_lon,
        time: p_time,
    }))
}

/// For every pixel of `queries` (in row-major order), find the closest pixel in
/// `searched`. The returned list is parallel to the query pixels.
pub fn batch_nearest(queries: &Geolocation, searched: &Geolocation) -> Result<Vec<PixelMatch>, MatchupError> {
    let mut matches = Vec::with_capacity(queries.num_pixels());
    for (idx, _) in queries.lat.indexed_iter() {
        let query_index = idx.slice().to_vec();
        let (query_lat, query_lon, query_time) = queries.pixel(&query_index)
            .ok_or_else(|| MatchupError::InternalError(format!("query pixel {query_index:?} is out of bounds")))?;
        let nearest = nearest_pixel(query_lat, query_lon, query_time, searched)?;
        matches.push(PixelMatch { query_index, query_lat, query_lon, query_time, nearest });
    }
    Ok(matches)
}
