mod config;
pub mod address;
pub mod directory;
pub mod geocache;
pub mod manual;
pub mod reconcile;
pub mod registry;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use std::collections::BTreeMap;

pub use crate::config::*;

// A number at the start of a text cell. Anything after it is a formatting artifact.
static LEADING_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?[0-9]+(\.[0-9]*)?").unwrap());

/// Reads a locality or station code out of a cell.
///
/// Numeric cells are used as they are. Text cells contribute their leading number,
/// so that `"12ש"` reads as 12. The value is truncated with floor-after-abs.
/// Returns `None` for empty cells and text that does not start with a number.
pub fn parse_code(cell: &Cell) -> Option<i64> {
    let raw: f64 = match cell {
        Cell::Number(f) if f.is_finite() => *f,
        Cell::Number(_) => return None,
        Cell::Text(s) => {
            let m = LEADING_NUMBER.find(s.trim())?;
            m.as_str().parse::<f64>().ok()?
        }
        Cell::Empty => return None,
    };
    Some(raw.abs().floor() as i64)
}

// No polling station comes close: larger cells are formatting accidents.
const MAX_STATION_VOTES: f64 = 4_294_967_295.0;

/// Reads a vote count. Sparse columns are common in wide tables: anything that
/// is not a non-negative number counts as zero votes. So do absurdly large cells.
pub fn parse_votes(cell: Option<&Cell>) -> VoteCount {
    let value = match cell {
        Some(Cell::Number(f)) => Some(*f),
        Some(Cell::Text(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match value {
        Some(f) if f.is_finite() && f >= 0.0 && f <= MAX_STATION_VOTES => {
            VoteCount(f.trunc() as u64)
        }
        Some(f) if f > MAX_STATION_VOTES => {
            debug!("parse_votes: out of range vote cell {}, counted as zero", f);
            VoteCount::EMPTY
        }
        _ => VoteCount::EMPTY,
    }
}

// Why a row did not make it through the normalizer.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
enum Rejection {
    Malformed(ColumnRole),
    Sentinel(i64),
}

// Returns the canonical (locality, station) codes of a row.
fn read_codes(
    row: &RawRow,
    scale: &ScaleFactors,
    sentinel: Option<i64>,
) -> Result<(i64, i64), Rejection> {
    let raw_locality = row
        .cell(ColumnRole::LocalityCode)
        .and_then(parse_code)
        .ok_or(Rejection::Malformed(ColumnRole::LocalityCode))?;
    let locality = scale.locality.apply(raw_locality);
    // The sentinel is written in source units; also guard the canonical unit so that
    // no record ever carries it. Sentinel rows often leave the station blank.
    if let Some(s) = sentinel {
        if raw_locality == s || locality == s {
            return Err(Rejection::Sentinel(s));
        }
    }
    let raw_station = row
        .cell(ColumnRole::StationCode)
        .and_then(parse_code)
        .ok_or(Rejection::Malformed(ColumnRole::StationCode))?;
    let station = scale.station.apply(raw_station);
    Ok((locality, station))
}

fn normalize_checked(
    config: &EpochConfig,
    row: &RawRow,
) -> Result<Vec<NormalizedVoteRecord>, Rejection> {
    let (locality_code, station_code) =
        read_codes(row, &config.results.scale, config.sentinel)?;
    Ok(config
        .results
        .vote_columns
        .iter()
        .enumerate()
        .map(|(idx, vc)| NormalizedVoteRecord {
            epoch: config.epoch,
            locality_code,
            station_code,
            bloc: vc.bloc.clone(),
            party: vc.party.clone(),
            votes: parse_votes(row.cell(ColumnRole::Votes(idx))),
        })
        .collect())
}

/// Converts a row of the results table into canonical records, one per vote column.
///
/// Returns `None` if the locality or station cell is not numeric (footer rows,
/// notes, ...) or if the locality is the sentinel of the epoch.
pub fn normalize(config: &EpochConfig, row: &RawRow) -> Option<Vec<NormalizedVoteRecord>> {
    normalize_checked(config, row).ok()
}

/// Counters for one pass of the normalizer.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct NormalizeStats {
    pub rows_in: usize,
    pub malformed: usize,
    pub sentinel: usize,
    pub records_out: usize,
    pub votes_out: VoteCount,
}

/// Normalizes all the rows of a results table.
///
/// Per-row problems never abort: the offending rows are counted and dropped.
pub fn normalize_rows(
    config: &EpochConfig,
    rows: &[RawRow],
) -> (Vec<NormalizedVoteRecord>, NormalizeStats) {
    let mut stats = NormalizeStats {
        rows_in: rows.len(),
        ..NormalizeStats::default()
    };
    let mut res: Vec<NormalizedVoteRecord> = Vec::new();
    for row in rows.iter() {
        match normalize_checked(config, row) {
            Ok(mut records) => {
                stats.votes_out += records.iter().map(|r| r.votes).sum();
                stats.records_out += records.len();
                res.append(&mut records);
            }
            Err(Rejection::Malformed(role)) => {
                debug!(
                    "normalize_rows: epoch {} line {}: dropping row, unreadable {}: {:?}",
                    config.epoch,
                    row.lineno,
                    role,
                    row.cell(role)
                );
                stats.malformed += 1;
            }
            Err(Rejection::Sentinel(s)) => {
                debug!(
                    "normalize_rows: epoch {} line {}: dropping sentinel station (locality {})",
                    config.epoch, row.lineno, s
                );
                stats.sentinel += 1;
            }
        }
    }
    info!(
        "Epoch {}: normalized {} rows into {} records ({} malformed, {} sentinel)",
        config.epoch, stats.rows_in, stats.records_out, stats.malformed, stats.sentinel
    );
    (res, stats)
}

#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd)]
struct AggregateKey {
    epoch: Epoch,
    locality_code: i64,
    station_code: i64,
    bloc: String,
    party: Option<String>,
}

/// Sums the votes of all the records sharing the same
/// (epoch, locality, station, bloc, party) key.
///
/// Keys are compared exactly: distinct labels are never merged. The output is
/// sorted by key, so it does not depend on the order of the input.
pub fn aggregate(records: &[NormalizedVoteRecord]) -> Vec<AggregatedVoteRecord> {
    let mut groups: BTreeMap<AggregateKey, VoteCount> = BTreeMap::new();
    for r in records.iter() {
        let key = AggregateKey {
            epoch: r.epoch,
            locality_code: r.locality_code,
            station_code: r.station_code,
            bloc: r.bloc.clone(),
            party: r.party.clone(),
        };
        *groups.entry(key).or_insert(VoteCount::EMPTY) += r.votes;
    }
    debug!(
        "aggregate: {} records into {} keys",
        records.len(),
        groups.len()
    );
    groups
        .into_iter()
        .map(|(key, votes)| AggregatedVoteRecord {
            epoch: key.epoch,
            locality_code: key.locality_code,
            station_code: key.station_code,
            bloc: key.bloc,
            party: key.party,
            votes,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn epoch_config(scale: ScaleFactors, sentinel: Option<i64>) -> EpochConfig {
        EpochConfig {
            epoch: Epoch(21),
            results: ResultsLayout {
                source: TableSource {
                    path: PathBuf::from("21.xlsx"),
                    sheet: None,
                    header_row: Some(0),
                    skip_rows: 0,
                },
                locality: ColumnRef::Index(0),
                station: ColumnRef::Index(1),
                vote_columns: vec![
                    VoteColumn {
                        column: ColumnRef::Index(2),
                        bloc: "Left".to_string(),
                        party: Some("A".to_string()),
                    },
                    VoteColumn {
                        column: ColumnRef::Index(3),
                        bloc: "Right".to_string(),
                        party: Some("B".to_string()),
                    },
                ],
                scale,
            },
            sentinel,
            directory: DirectorySource::Missing,
        }
    }

    fn row(locality: Cell, station: Cell, a: Cell, b: Cell) -> RawRow {
        RawRow {
            lineno: 2,
            cells: vec![
                (ColumnRole::LocalityCode, locality),
                (ColumnRole::StationCode, station),
                (ColumnRole::Votes(0), a),
                (ColumnRole::Votes(1), b),
            ],
        }
    }

    fn record(locality: i64, station: i64, bloc: &str, votes: u64) -> NormalizedVoteRecord {
        NormalizedVoteRecord {
            epoch: Epoch(21),
            locality_code: locality,
            station_code: station,
            bloc: bloc.to_string(),
            party: None,
            votes: VoteCount(votes),
        }
    }

    #[test]
    fn scale_factors_applied() {
        init();
        let scale = ScaleFactors {
            locality: ScaleFactor::Times(10),
            station: ScaleFactor::Times(10),
        };
        let config = epoch_config(scale, None);
        let r = row(
            Cell::Number(55.0),
            Cell::Number(3.0),
            Cell::Number(7.0),
            Cell::Number(1.0),
        );
        let res = normalize(&config, &r).unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].locality_code, 550);
        assert_eq!(res[0].station_code, 30);
        assert_eq!(res[0].votes, VoteCount(7));
        assert_eq!(res[1].bloc, "Right");
        assert_eq!(res[1].votes, VoteCount(1));
    }

    #[test]
    fn divided_station_codes_truncate() {
        let scale = ScaleFactors {
            locality: ScaleFactor::IDENTITY,
            station: ScaleFactor::DividedBy(10),
        };
        let config = epoch_config(scale, None);
        let r = row(
            Cell::Number(70.0),
            Cell::Number(123.0),
            Cell::Empty,
            Cell::Empty,
        );
        let res = normalize(&config, &r).unwrap();
        assert_eq!(res[0].station_code, 12);
    }

    #[test]
    fn sentinel_dropped() {
        let config = epoch_config(ScaleFactors::IDENTITY, Some(9999));
        let r = row(
            Cell::Number(9999.0),
            Cell::Number(1.0),
            Cell::Number(5.0),
            Cell::Number(5.0),
        );
        assert_eq!(normalize(&config, &r), None);
        let r = row(
            Cell::Text("9999".to_string()),
            Cell::Text("not a number".to_string()),
            Cell::Empty,
            Cell::Empty,
        );
        assert_eq!(normalize(&config, &r), None);
    }

    #[test]
    fn malformed_rows_dropped() {
        let config = epoch_config(ScaleFactors::IDENTITY, None);
        let footer = row(
            Cell::Text("Total".to_string()),
            Cell::Empty,
            Cell::Number(100.0),
            Cell::Number(100.0),
        );
        assert_eq!(normalize(&config, &footer), None);
        let no_station = row(
            Cell::Number(70.0),
            Cell::Empty,
            Cell::Number(1.0),
            Cell::Number(1.0),
        );
        assert_eq!(normalize(&config, &no_station), None);
    }

    #[test]
    fn trailing_text_in_codes() {
        assert_eq!(parse_code(&Cell::Text("1.0ש".to_string())), Some(1));
        assert_eq!(parse_code(&Cell::Text(" 12.7 ".to_string())), Some(12));
        assert_eq!(parse_code(&Cell::Text("-3".to_string())), Some(3));
        assert_eq!(parse_code(&Cell::Number(-3.9)), Some(3));
        assert_eq!(parse_code(&Cell::Text("ש1".to_string())), None);
        assert_eq!(parse_code(&Cell::Number(f64::NAN)), None);
    }

    #[test]
    fn sparse_vote_cells_are_zero() {
        assert_eq!(parse_votes(None), VoteCount(0));
        assert_eq!(parse_votes(Some(&Cell::Empty)), VoteCount(0));
        assert_eq!(parse_votes(Some(&Cell::Text("n/a".to_string()))), VoteCount(0));
        assert_eq!(parse_votes(Some(&Cell::Number(-4.0))), VoteCount(0));
        assert_eq!(parse_votes(Some(&Cell::Text(" 42 ".to_string()))), VoteCount(42));
        assert_eq!(parse_votes(Some(&Cell::Number(17.0))), VoteCount(17));
    }

    #[test]
    fn huge_vote_cells_do_not_corrupt_totals() {
        assert_eq!(parse_votes(Some(&Cell::Number(1e20))), VoteCount(0));
        assert_eq!(parse_votes(Some(&Cell::Text("1e20".to_string()))), VoteCount(0));
        assert_eq!(
            parse_votes(Some(&Cell::Number(1e20))) + parse_votes(Some(&Cell::Number(5.0))),
            VoteCount(5)
        );
        assert_eq!(VoteCount(u64::MAX) + VoteCount(5), VoteCount(u64::MAX));
        let total: VoteCount = vec![VoteCount(u64::MAX), VoteCount(1)].into_iter().sum();
        assert_eq!(total, VoteCount(u64::MAX));
    }

    #[test]
    fn sentinel_rows_without_station() {
        let config = epoch_config(ScaleFactors::IDENTITY, Some(875));
        let rows = vec![row(
            Cell::Number(875.0),
            Cell::Empty,
            Cell::Number(3.0),
            Cell::Number(4.0),
        )];
        let (records, stats) = normalize_rows(&config, &rows);
        assert!(records.is_empty());
        assert_eq!(stats.sentinel, 1);
        assert_eq!(stats.malformed, 0);
    }

    #[test]
    fn normalize_rows_counts() {
        let config = epoch_config(ScaleFactors::IDENTITY, Some(875));
        let rows = vec![
            row(
                Cell::Number(70.0),
                Cell::Number(1.0),
                Cell::Number(3.0),
                Cell::Number(4.0),
            ),
            row(
                Cell::Number(875.0),
                Cell::Number(1.0),
                Cell::Number(3.0),
                Cell::Number(4.0),
            ),
            row(
                Cell::Text("סה\"כ".to_string()),
                Cell::Empty,
                Cell::Number(6.0),
                Cell::Number(8.0),
            ),
        ];
        let (records, stats) = normalize_rows(&config, &rows);
        assert_eq!(records.len(), 2);
        assert_eq!(stats.rows_in, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.sentinel, 1);
        assert_eq!(stats.records_out, 2);
        assert_eq!(stats.votes_out, VoteCount(7));
    }

    #[test]
    fn aggregation_sums_duplicates() {
        let records = vec![
            record(70, 1, "Left", 3),
            record(70, 1, "Right", 2),
            record(70, 1, "Left", 4),
            record(70, 2, "Left", 1),
        ];
        let aggs = aggregate(&records);
        assert_eq!(aggs.len(), 3);
        assert_eq!(aggs[0].bloc, "Left");
        assert_eq!(aggs[0].station_code, 1);
        assert_eq!(aggs[0].votes, VoteCount(7));
        assert_eq!(aggs[1].bloc, "Right");
        assert_eq!(aggs[2].station_code, 2);
    }

    #[test]
    fn aggregation_keeps_parties_apart() {
        let mut a = record(70, 1, "Left", 3);
        a.party = Some("A".to_string());
        let mut b = record(70, 1, "Left", 3);
        b.party = Some("a".to_string());
        let c = record(70, 1, "Left", 3);
        let aggs = aggregate(&[a, b, c]);
        assert_eq!(aggs.len(), 3);
    }

    fn arb_record() -> impl Strategy<Value = NormalizedVoteRecord> {
        (0i64..4, 0i64..4, prop::sample::select(vec!["Left", "Right"]), 0u64..1000).prop_map(
            |(locality, station, bloc, votes)| record(locality, station, bloc, votes),
        )
    }

    fn arb_scale() -> impl Strategy<Value = ScaleFactor> {
        prop_oneof![
            (1u32..4).prop_map(ScaleFactor::Times),
            (1u32..4).prop_map(ScaleFactor::DividedBy),
        ]
    }

    fn arb_cell() -> impl Strategy<Value = Cell> {
        prop_oneof![
            Just(Cell::Empty),
            (-5.0f64..30.0).prop_map(Cell::Number),
            "[0-9]{0,3}[a-z ]{0,2}".prop_map(Cell::Text),
        ]
    }

    proptest! {
        #[test]
        fn aggregation_is_order_independent(
            (records, shuffled) in prop::collection::vec(arb_record(), 0..40)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            prop_assert_eq!(aggregate(&records), aggregate(&shuffled));
        }

        #[test]
        fn aggregation_conserves_votes(records in prop::collection::vec(arb_record(), 0..40)) {
            let before: VoteCount = records.iter().map(|r| r.votes).sum();
            let after: VoteCount = aggregate(&records).iter().map(|r| r.votes).sum();
            prop_assert_eq!(before, after);
        }

        #[test]
        fn normalized_records_never_carry_the_sentinel(
            locality in arb_cell(),
            station in arb_cell(),
            votes in arb_cell(),
            sentinel in 0i64..30,
            locality_scale in arb_scale(),
            station_scale in arb_scale(),
        ) {
            let scale = ScaleFactors { locality: locality_scale, station: station_scale };
            let config = epoch_config(scale, Some(sentinel));
            let r = row(locality, station, votes.clone(), votes);
            if let Some(records) = normalize(&config, &r) {
                for rec in records.iter() {
                    prop_assert_ne!(rec.locality_code, sentinel);
                    prop_assert!(rec.locality_code >= 0);
                    prop_assert!(rec.station_code >= 0);
                }
            }
        }
    }
}
