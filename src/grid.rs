//! Nearest grid cell lookup for secondary products on a regular lat/lon grid
//! (AMSR-E/AMSR2 daily maps with one layer per orbit direction).
use itertools::Itertools;
use log::debug;
use ordered_float::OrderedFloat;

use crate::error::MatchupError;
use crate::granule::PixelIndex;

/// Longitudes above this are shifted down by 360 degrees before indexing
const LON_WRAP: f64 = 180.0;

/// Cells this close to the antimeridian are also indexed on its far side
const SEAM_MARGIN: f64 = 10.0;

fn wrap_lon(lon: f64) -> f64 {
    if lon > LON_WRAP { lon - 360.0 } else { lon }
}

/// Copy of a cell shifted across the antimeridian, if it lies near it
fn seam_copy(flat: usize, lat: f64, lon: f64) -> Option<(usize, [f64; 2])> {
    if lon > LON_WRAP - SEAM_MARGIN {
        Some((flat, [lat, lon - 360.0]))
    } else if lon < SEAM_MARGIN - LON_WRAP {
        Some((flat, [lat, lon + 360.0]))
    } else {
        None
    }
}

/// A KD-tree over every (lat, lon) cell center of a regular grid.
///
/// Distances are planar in degrees, which is adequate for snapping a pixel to a
/// quarter-degree cell. Cells near the antimeridian are indexed twice, once on
/// each side, so points on either side of it find their nearest cell. Planar
/// distances still stretch toward the poles.
pub struct GridNearestNeighbor {
    tree: kd_tree::KdTree2<(usize, [f64; 2])>,
    n_lat: usize,
    n_lon: usize,
}

impl GridNearestNeighbor {
    /// Build the index from the grid's latitude and longitude axes. Cells with a
    /// NaN coordinate are left out.
    pub fn new(lat_axis: &[f64], lon_axis: &[f64]) -> Result<Self, MatchupError> {
        if lat_axis.is_empty() || lon_axis.is_empty() {
            return Err(MatchupError::malformed("grid", format!(
                "grid axes must be non-empty (got {} latitudes and {} longitudes)", lat_axis.len(), lon_axis.len()
            )));
        }

        let n_lat = lat_axis.len();
        let n_lon = lon_axis.len();
        let mut cells = lat_axis.iter()
            .cartesian_product(lon_axis.iter())
            .map(|(&lat, &lon)| [lat, wrap_lon(lon)])
            .enumerate()
            .filter(|(_, [lat, lon])| !lat.is_nan() && !lon.is_nan())
            .collect_vec();

        if cells.is_empty() {
            return Err(MatchupError::malformed("grid", "every grid cell has a NaN coordinate"));
        }
        let n_cells = cells.len();
        let copies = cells.iter()
            .filter_map(|&(flat, [lat, lon])| seam_copy(flat, lat, lon))
            .collect_vec();
        cells.extend(copies);
        debug!("building KD-tree over {n_cells} of {} grid cells plus {} antimeridian copies", n_lat * n_lon, cells.len() - n_cells);

        let tree = kd_tree::KdTree2::build_by_key(cells, |item, k| OrderedFloat(item.1[k]));
        Ok(Self { tree, n_lat, n_lon })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_lat, self.n_lon)
    }

    /// (latitude index, longitude index) of the cell nearest to a point, or `None`
    /// if the point has a NaN coordinate.
    pub fn nearest_cell(&self, lat: f64, lon: f64) -> Option<(usize, usize)> {
        if lat.is_nan() || lon.is_nan() {
            return None;
        }
        let found = self.tree.nearest_by(&[lat, wrap_lon(lon)], |item, k| item.1[k])?;
        let flat = found.item.0;
        Some((flat / self.n_lon, flat % self.n_lon))
    }

    /// Nearest cell for each of a batch of points
    pub fn query(&self, lats: &[f64], lons: &[f64]) -> Result<Vec<Option<(usize, usize)>>, MatchupError> {
        if lats.len() != lons.len() {
            return Err(MatchupError::InternalError(format!(
                "{} query latitudes but {} query longitudes", lats.len(), lons.len()
            )));
        }
        Ok(lats.iter().zip(lons).map(|(&lat, &lon)| self.nearest_cell(lat, lon)).collect())
    }
}

/// Orbit direction of a scan, which selects the layer of a twice-daily grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Ascending,
    Descending,
}

impl NodeType {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' | 'a' => Some(Self::Ascending),
            'D' | 'd' => Some(Self::Descending),
            _ => None,
        }
    }

    /// Index of the orbit layer in the gridded product
    pub fn orbit_index(&self) -> usize {
        match self {
            NodeType::Ascending => 0,
            NodeType::Descending => 1,
        }
    }
}

/// Per-scan node types of the primary granule(s), with the number of primary
/// along-track rows per scan.
#[derive(Debug, Clone)]
pub struct NodeTypeLookup {
    node_types: Vec<Option<NodeType>>,
    rows_per_scan: usize,
}

impl NodeTypeLookup {
    pub const DEFAULT_ROWS_PER_SCAN: usize = 3;

    /// Parse a string with one 'A' or 'D' character per scan. Any other character
    /// marks a scan with unknown direction.
    pub fn from_str_codes(codes: &str, rows_per_scan: usize) -> Self {
        let node_types = codes.chars().map(NodeType::from_char).collect();
        Self { node_types, rows_per_scan: rows_per_scan.max(1) }
    }

    pub fn from_node_types(node_types: Vec<NodeType>, rows_per_scan: usize) -> Self {
        Self { node_types: node_types.into_iter().map(Some).collect(), rows_per_scan: rows_per_scan.max(1) }
    }

    /// Concatenate the node types of consecutive granules
    pub fn extend(&mut self, other: &NodeTypeLookup) {
        self.node_types.extend_from_slice(&other.node_types);
    }

    pub fn n_scans(&self) -> usize {
        self.node_types.len()
    }

    pub fn orbit_for_row(&self, row: usize) -> Result<usize, MatchupError> {
        let scan = row / self.rows_per_scan;
        self.node_types.get(scan)
            .copied()
            .flatten()
            .map(|nt| nt.orbit_index())
            .ok_or(MatchupError::MissingNodeType { row, n_scans: self.n_scans() })
    }
}

/// Snap one primary pixel to the gridded product, giving the (orbit, lat, lon)
/// index of its cell. The orbit comes from the pixel's along-track row, the
/// first element of its index.
pub fn grid_index(grid: &GridNearestNeighbor, nodes: &NodeTypeLookup, primary_index: &[usize], lat: f64, lon: f64) -> Result<Option<PixelIndex>, MatchupError> {
    let (i_lat, i_lon) = match grid.nearest_cell(lat, lon) {
        Some(cell) => cell,
        None => return Ok(None),
    };
    let row = primary_index.first().copied().unwrap_or(0);
    let orbit = nodes.orbit_for_row(row)?;
    Ok(Some(vec![orbit, i_lat, i_lon]))
}
