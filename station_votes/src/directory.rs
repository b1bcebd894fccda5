use std::collections::BTreeSet;

use log::{debug, info, warn};

use crate::address::full_address;
use crate::*;

/// Counters for one station directory.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct DirectoryStats {
    pub rows_in: usize,
    pub malformed: usize,
    /// Rows with a zero locality or station code (blank lines in the source).
    pub zero_codes: usize,
    pub duplicates: usize,
    pub stations: usize,
}

/// Builds the station directory of an epoch out of the rows of its directory table.
///
/// Codes are read like the results table, with the scale factors of the directory.
/// Rows with unreadable or zero codes are dropped. If a (locality, station) key
/// appears several times, the first row wins.
pub fn build_directory(
    epoch: Epoch,
    layout: &DirectoryLayout,
    rows: &[RawRow],
) -> (Vec<StationRecord>, DirectoryStats) {
    let mut stats = DirectoryStats {
        rows_in: rows.len(),
        ..DirectoryStats::default()
    };
    let mut seen: BTreeSet<(i64, i64)> = BTreeSet::new();
    let mut res: Vec<StationRecord> = Vec::new();

    for row in rows.iter() {
        let codes = row
            .cell(ColumnRole::LocalityCode)
            .and_then(parse_code)
            .zip(row.cell(ColumnRole::StationCode).and_then(parse_code));
        let (raw_locality, raw_station) = match codes {
            Some(x) => x,
            None => {
                debug!(
                    "build_directory: epoch {} line {}: unreadable codes, dropping row",
                    epoch, row.lineno
                );
                stats.malformed += 1;
                continue;
            }
        };
        if raw_locality == 0 || raw_station == 0 {
            stats.zero_codes += 1;
            continue;
        }
        let locality_code = layout.scale.locality.apply(raw_locality);
        let station_code = layout.scale.station.apply(raw_station);
        if !seen.insert((locality_code, station_code)) {
            debug!(
                "build_directory: epoch {} line {}: duplicate station {}/{}",
                epoch, row.lineno, locality_code, station_code
            );
            stats.duplicates += 1;
            continue;
        }

        let locality_name = row
            .cell(ColumnRole::LocalityName)
            .map(|c| c.as_text())
            .unwrap_or_default();
        let address_name = row
            .cell(ColumnRole::AddressName)
            .map(|c| c.as_text())
            .unwrap_or_default();
        res.push(StationRecord {
            epoch,
            locality_code,
            station_code,
            full_address: full_address(&address_name, &locality_name),
            locality_name,
            address_name,
        });
    }

    stats.stations = res.len();
    if stats.duplicates > 0 {
        warn!(
            "Epoch {}: {} duplicate stations in the directory, kept the first occurrence",
            epoch, stats.duplicates
        );
    }
    info!(
        "Epoch {}: directory with {} stations out of {} rows ({} malformed, {} blank codes)",
        epoch, stats.stations, stats.rows_in, stats.malformed, stats.zero_codes
    );
    (res, stats)
}
