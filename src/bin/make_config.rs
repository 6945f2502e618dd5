use std::{path::{PathBuf, Path}, io::Write, str::FromStr, convert::Infallible, ffi::OsString};

use atrain_matchup::{config::{RunAirsCloudSatArgs, RunMultiConfig, RunOneConfig, ToleranceArgs}, error::MatchupError};
use chrono::{NaiveDate, Duration};
use clap::Parser;
use itertools::Itertools;
use log::{info, warn};

fn main() -> Result<(), MatchupError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = MainArgs::parse();
    let tolerances = ToleranceArgs { distance_tolerance_km: args.distance_tolerance_km, time_tolerance_s: args.time_tolerance_s };
    tolerances.tolerances()?;

    let mut matchups = Vec::new();
    for (airs_date, cloudsat_dates) in DateWindows::new(args.start_date, args.end_date, args.ndays_buffer) {
        let airs_dir = args.airs_dir_structure.dir_for_date(airs_date);
        let airs_files = find_files(&airs_dir, &args.extension)?;
        if airs_files.is_empty() {
            warn!("Skipping {airs_date}: no AIRS files in {}", airs_dir.display());
            continue;
        }

        let cloudsat_files = cloudsat_dates.iter()
            .map(|&d| args.cloudsat_dir_structure.files_for_date(d, &args.extension))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect_vec();
        if cloudsat_files.is_empty() {
            warn!("Skipping {airs_date}: no CloudSat files within {} day(s)", args.ndays_buffer);
            continue;
        }

        let out_root = PathBuf::from(airs_date.format(&args.product_dir_format).to_string());
        for airs_file in airs_files {
            let stem = airs_file.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "airs".to_owned());
            matchups.push(RunOneConfig::AirsCloudsat(RunAirsCloudSatArgs {
                product_dir: out_root.join(stem),
                airs_file,
                cloudsat_files: cloudsat_files.clone(),
                tolerances: tolerances.clone(),
            }));
        }
    }

    info!("Writing {} matchups to {}", matchups.len(), args.config_file.display());
    let toml_str = toml::to_string_pretty(&RunMultiConfig { matchups })?;
    std::fs::File::create(&args.config_file)?
        .write_all(toml_str.as_bytes())?;
    Ok(())
}


/// Each primary date from `first` through `last`, with the secondary dates
/// `buffer` days either side of it
struct DateWindows {
    next: NaiveDate,
    last: NaiveDate,
    buffer: i64,
}

impl DateWindows {
    fn new(first: NaiveDate, last: NaiveDate, buffer: u32) -> Self {
        Self { next: first, last, buffer: buffer as i64 }
    }
}

impl Iterator for DateWindows {
    type Item = (NaiveDate, Vec<NaiveDate>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.last {
            return None
        }

        let day = self.next;
        let window = (-self.buffer..=self.buffer)
            .map(|offset| day + Duration::days(offset))
            .collect_vec();
        self.next = day + Duration::days(1);
        Some((day, window))
    }
}

/// Create a TOML file of AIRS-CloudSat matchups to pass to the `multi` subcommand of atrain-matchup
#[derive(Debug, Parser)]
struct MainArgs {
    /// A string that gives the directory structure that AIRS granules are found in. This can
    /// include format substrings recognized by chrono for date formatting; the most common
    /// are %Y for four-digit year, %m for two-digit month, %j for day of year and %d for
    /// two-digit day. For example, "/data/airs/%Y/%j" indicates year/day-of-year directories
    /// under "/data/airs". Every granule in a day's directory gets its own matchup. See
    /// https://docs.rs/chrono/latest/chrono/format/strftime/index.html for the full list of
    /// chrono format specifiers.
    #[arg(value_parser = DirStructure::from_str)]
    airs_dir_structure: DirStructure,

    /// Same as airs_dir_structure, but for CloudSat granules.
    #[arg(value_parser = DirStructure::from_str)]
    cloudsat_dir_structure: DirStructure,

    /// First AIRS date to search for matchups, in YYYY-MM-DD format.
    start_date: NaiveDate,

    /// Last AIRS date to search for matchups, in YYYY-MM-DD format.
    end_date: NaiveDate,

    /// Number of days on either side of each AIRS date to take CloudSat granules from.
    /// 0 only uses the same day; 1 uses the day before, same day, and day after, which
    /// covers AIRS granules near midnight.
    ndays_buffer: u32,

    /// Path to write the configuration file as.
    config_file: PathBuf,

    /// Pattern for the directory each day's product directories go under. Date formatting
    /// patterns (e.g. %Y, %m, %d) recognized by chrono can be used to insert the AIRS date.
    /// Each AIRS granule gets a subdirectory named for its file stem.
    #[arg(default_value = "airs_cloudsat/%Y/%m/%d")]
    product_dir_format: String,

    /// Extension of the granule files to look for
    #[clap(short = 'e', long, default_value = "nc")]
    extension: String,

    /// Distance tolerance in kilometers to write for every matchup
    #[clap(short = 'd', long, default_value_t = 12.0)]
    distance_tolerance_km: f64,

    /// Time tolerance in seconds to write for every matchup
    #[clap(short = 't', long, default_value_t = 300.0)]
    time_tolerance_s: f64,
}

/// A strftime pattern that turns a date into the directory holding that day's granules
#[derive(Debug, Clone)]
struct DirStructure(String);

impl FromStr for DirStructure {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl DirStructure {
    fn dir_for_date(&self, date: NaiveDate) -> PathBuf {
        date.format(&self.0).to_string().into()
    }

    /// Granule files for `date`, see [`find_files`]
    fn files_for_date(&self, date: NaiveDate, extension: &str) -> Result<Vec<PathBuf>, MatchupError> {
        find_files(&self.dir_for_date(date), extension)
    }
}

/// All files with the given extension in `dir`, sorted by name. A missing
/// directory gives an empty list.
fn find_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, MatchupError> {
    if !dir.exists() {
        warn!("Directory {} does not exist", dir.display());
        return Ok(Vec::new())
    }

    let ext = OsString::from(extension.trim_start_matches('.'));
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let p = entry?.path();
        if p.extension() == Some(&ext) {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_windows() {
        let start = NaiveDate::from_ymd_opt(2010, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2010, 1, 2).unwrap();
        let days = DateWindows::new(start, end, 1).collect_vec();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].1, vec![
            NaiveDate::from_ymd_opt(2009, 12, 31).unwrap(), start, end
        ]);
    }

    #[test]
    fn test_dir_structure() {
        let d = DirStructure::from_str("/data/%Y/%j").unwrap();
        assert_eq!(d.dir_for_date(NaiveDate::from_ymd_opt(2010, 2, 1).unwrap()), PathBuf::from("/data/2010/032"));
    }

    #[test]
    fn test_find_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.nc", "a.nc", "c.hdf"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = find_files(dir.path(), ".nc").unwrap();
        assert_eq!(found, vec![dir.path().join("a.nc"), dir.path().join("b.nc")]);
        assert!(find_files(&dir.path().join("missing"), "nc").unwrap().is_empty());
    }
}
