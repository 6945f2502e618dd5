use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum MatchupError {
    #[error("Error reading netCDF file {}: {nc_error}", display_file(.file))]
    NetcdfError{nc_error: netcdf::error::Error, file: Option<PathBuf>},
    #[error("No variable named '{varname}' in {}", display_file(.file))]
    NetcdfMissingVar{file: Option<PathBuf>, varname: String},
    #[error("No attribute named '{attname}' in {}", display_file(.file))]
    NetcdfMissingAttr{file: Option<PathBuf>, attname: String},
    #[error("Wrong type for attribute {attname} on variable {varname} in file {}: expected a {expected}", display_file(.file))]
    NetcdfWrongAttrType{file: Option<PathBuf>, varname: String, attname: String, expected: &'static str},
    #[error("Error in shape of variable '{varname}' in {}: {nd_error}", display_file(.file))]
    NetcdfShapeError{file: Option<PathBuf>, varname: String, nd_error: ndarray::ShapeError},
    #[error("Failed to find coarse matchup: closest candidate granule is {min_diff_s} s from the target window [{target_start}, {target_end}], tolerance is {time_tol_s} s")]
    CoarseMatchupNotFound{target_start: f64, target_end: f64, min_diff_s: f64, time_tol_s: f64},
    #[error("No {instrument} granules found for the requested time range")]
    EmptyCandidateSet{instrument: String},
    #[error("Failed to write matchup indices for {primary} that passed time and distance tolerances")]
    ZeroAcceptedMatches{primary: String},
    #[error("Granule {granule} has a malformed geolocation grid: {reason}")]
    MalformedSecondaryGrid{granule: String, reason: String},
    #[error("No scan node type available for along-track row {row} (lookup has {n_scans} scans)")]
    MissingNodeType{row: usize, n_scans: usize},
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Error reading/writing file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error writing TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),
    #[error("Error reading TOML: {0}")]
    TomlDeError(#[from] toml::de::Error),
    #[error("Internal error in matchup code, cause: {0}")]
    InternalError(String),
}

fn display_file(file: &Option<PathBuf>) -> String {
    file.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "?".to_owned())
}

impl From<netcdf::error::Error> for MatchupError {
    fn from(value: netcdf::error::Error) -> Self {
        Self::NetcdfError { nc_error: value, file: None }
    }
}

impl MatchupError {
    pub fn from_nc_error(nc_error: netcdf::error::Error, file: PathBuf) -> Self {
        Self::NetcdfError { nc_error, file: Some(file) }
    }

    pub fn from_shape_error(nd_error: ndarray::ShapeError, file: PathBuf, varname: String) -> Self {
        Self::NetcdfShapeError { file: Some(file), varname, nd_error }
    }

    pub fn malformed<G: ToString, R: ToString>(granule: G, reason: R) -> Self {
        Self::MalformedSecondaryGrid { granule: granule.to_string(), reason: reason.to_string() }
    }
}
