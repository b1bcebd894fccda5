use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::address::canonicalize;
use crate::geocache::CoordinateLookup;
use crate::*;

/// How bad an unmatched rate is.
///
/// Codes are in the same unit on both sides by construction, so a high rate of
/// station misses points at a wrong scale factor in the registry.
#[derive(Eq, PartialEq, Debug, Clone, Copy, PartialOrd, Ord)]
pub enum Severity {
    Normal,
    Elevated,
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct MatchThresholds {
    /// Unmatched rate (0..1) above which a join stage is flagged.
    pub elevated_unmatched_rate: f64,
}

impl MatchThresholds {
    pub const DEFAULT: MatchThresholds = MatchThresholds {
        elevated_unmatched_rate: 0.05,
    };
}

impl Default for MatchThresholds {
    fn default() -> Self {
        MatchThresholds::DEFAULT
    }
}

/// Counters for the two joins of one epoch.
#[derive(PartialEq, Debug, Clone)]
pub struct ReconcileReport {
    pub epoch: Epoch,
    pub aggregated: usize,
    pub station_matched: usize,
    pub station_unmatched: usize,
    pub geocoded: usize,
    pub geocode_unmatched: usize,
    pub votes_in: VoteCount,
    pub votes_combined: VoteCount,
    pub votes_station_unmatched: VoteCount,
    pub votes_geocode_unmatched: VoteCount,
    pub station_severity: Severity,
    pub geocode_severity: Severity,
}

impl ReconcileReport {
    pub fn station_unmatched_rate(&self) -> f64 {
        rate(self.station_unmatched, self.aggregated)
    }

    /// Rate of geocode misses among the rows that found a station.
    pub fn geocode_unmatched_rate(&self) -> f64 {
        rate(self.geocode_unmatched, self.station_matched)
    }
}

fn rate(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

fn severity(r: f64, thresholds: &MatchThresholds) -> Severity {
    if r > thresholds.elevated_unmatched_rate {
        Severity::Elevated
    } else {
        Severity::Normal
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct Reconciliation {
    pub combined: Vec<CombinedRecord>,
    pub unmatched: Vec<UnmatchedRecord>,
    pub report: ReconcileReport,
}

// Number of unmatched keys shown in the logs when a stage is flagged.
const NUM_SAMPLES: usize = 5;

/// Joins the aggregated votes of an epoch to its stations, then to coordinates.
///
/// Arguments:
/// * `aggregated` the output of [`aggregate`] for this epoch
/// * `directory` the station directory used by this epoch (possibly borrowed)
/// * `coordinates` the geocode cache, keyed by canonical address
///
/// Both joins are left-outer: every aggregated row ends up either combined or
/// unmatched, exactly once.
pub fn reconcile(
    epoch: Epoch,
    aggregated: &[AggregatedVoteRecord],
    directory: &[StationRecord],
    coordinates: &dyn CoordinateLookup,
    thresholds: &MatchThresholds,
) -> Reconciliation {
    let mut stations: BTreeMap<(i64, i64), &StationRecord> = BTreeMap::new();
    for s in directory.iter() {
        stations.entry((s.locality_code, s.station_code)).or_insert(s);
    }
    // Canonicalized once per station.
    let mut canonical_by_station: BTreeMap<(i64, i64), String> = BTreeMap::new();

    let mut combined: Vec<CombinedRecord> = Vec::new();
    let mut unmatched: Vec<UnmatchedRecord> = Vec::new();
    let mut station_matched: usize = 0;
    let mut votes = (VoteCount::EMPTY, VoteCount::EMPTY, VoteCount::EMPTY);

    for rec in aggregated.iter() {
        let key = (rec.locality_code, rec.station_code);
        let station = match stations.get(&key) {
            Some(s) => *s,
            None => {
                votes.1 += rec.votes;
                unmatched.push(UnmatchedRecord {
                    stage: JoinStage::Station,
                    record: rec.clone(),
                    address: None,
                });
                continue;
            }
        };
        station_matched += 1;
        let canonical = canonical_by_station
            .entry(key)
            .or_insert_with(|| canonicalize(&station.full_address));
        match coordinates.coordinate(canonical.as_str()) {
            Some(c) => {
                votes.0 += rec.votes;
                combined.push(CombinedRecord {
                    epoch: rec.epoch,
                    locality_code: rec.locality_code,
                    station_code: rec.station_code,
                    latitude: c.latitude,
                    longitude: c.longitude,
                    bloc: rec.bloc.clone(),
                    party: rec.party.clone(),
                    votes: rec.votes,
                });
            }
            None => {
                votes.2 += rec.votes;
                unmatched.push(UnmatchedRecord {
                    stage: JoinStage::Geocode,
                    record: rec.clone(),
                    address: Some(station.full_address.clone()),
                });
            }
        }
    }

    let station_unmatched = aggregated.len() - station_matched;
    let geocode_unmatched = station_matched - combined.len();
    let mut report = ReconcileReport {
        epoch,
        aggregated: aggregated.len(),
        station_matched,
        station_unmatched,
        geocoded: combined.len(),
        geocode_unmatched,
        votes_in: aggregated.iter().map(|r| r.votes).sum(),
        votes_combined: votes.0,
        votes_station_unmatched: votes.1,
        votes_geocode_unmatched: votes.2,
        station_severity: Severity::Normal,
        geocode_severity: Severity::Normal,
    };
    report.station_severity = severity(report.station_unmatched_rate(), thresholds);
    report.geocode_severity = severity(report.geocode_unmatched_rate(), thresholds);

    log_report(&report, &unmatched);
    Reconciliation {
        combined,
        unmatched,
        report,
    }
}

fn log_report(report: &ReconcileReport, unmatched: &[UnmatchedRecord]) {
    info!(
        "Epoch {}: {} aggregated rows, {} matched to stations, {} matched to coordinates",
        report.epoch, report.aggregated, report.station_matched, report.geocoded
    );
    for (stage, sev, num, r) in [
        (
            JoinStage::Station,
            report.station_severity,
            report.station_unmatched,
            report.station_unmatched_rate(),
        ),
        (
            JoinStage::Geocode,
            report.geocode_severity,
            report.geocode_unmatched,
            report.geocode_unmatched_rate(),
        ),
    ] {
        if num == 0 {
            continue;
        }
        let samples: Vec<String> = unmatched
            .iter()
            .filter(|u| u.stage == stage)
            .take(NUM_SAMPLES)
            .map(|u| match &u.address {
                Some(a) => format!("{}/{} {:?}", u.record.locality_code, u.record.station_code, a),
                None => format!("{}/{}", u.record.locality_code, u.record.station_code),
            })
            .collect();
        if sev == Severity::Elevated {
            warn!(
                "Epoch {}: {} rows ({:.1}%) unmatched at the {} join, check the registry. Samples: {:?}",
                report.epoch,
                num,
                100.0 * r,
                stage,
                samples
            );
        } else {
            debug!(
                "Epoch {}: {} rows unmatched at the {} join. Samples: {:?}",
                report.epoch, num, stage, samples
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn agg(locality: i64, station: i64, bloc: &str, votes: u64) -> AggregatedVoteRecord {
        AggregatedVoteRecord {
            epoch: Epoch(22),
            locality_code: locality,
            station_code: station,
            bloc: bloc.to_string(),
            party: None,
            votes: VoteCount(votes),
        }
    }

    fn station(locality: i64, station: i64, address: &str, locality_name: &str) -> StationRecord {
        StationRecord {
            epoch: Epoch(22),
            locality_code: locality,
            station_code: station,
            locality_name: locality_name.to_string(),
            address_name: address.to_string(),
            full_address: crate::address::full_address(address, locality_name),
        }
    }

    fn coords(addresses: &[(&str, f64, f64)]) -> BTreeMap<String, Coordinate> {
        addresses
            .iter()
            .map(|(a, lat, lng)| {
                (
                    canonicalize(a),
                    Coordinate {
                        latitude: *lat,
                        longitude: *lng,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn two_stage_join() {
        let aggregated = vec![
            agg(70, 1, "Left", 10),
            agg(70, 1, "Right", 5),
            agg(70, 2, "Left", 3),
            agg(71, 1, "Left", 7),
        ];
        let directory = vec![
            station(70, 1, "Herzl12", "Ashdod"),
            station(70, 2, "Unknown 3", "Ashdod"),
        ];
        let lookup = coords(&[("Herzl 12, Ashdod", 31.8, 34.6)]);
        let res = reconcile(
            Epoch(22),
            &aggregated,
            &directory,
            &lookup,
            &MatchThresholds::DEFAULT,
        );
        assert_eq!(res.combined.len(), 2);
        assert_eq!(res.combined[0].latitude, 31.8);
        assert_eq!(res.combined[1].bloc, "Right");
        assert_eq!(res.unmatched.len(), 2);
        assert_eq!(res.unmatched[0].stage, JoinStage::Geocode);
        assert_eq!(res.unmatched[0].address.as_deref(), Some("Unknown 3, Ashdod"));
        assert_eq!(res.unmatched[1].stage, JoinStage::Station);

        let report = res.report;
        assert_eq!(report.aggregated, 4);
        assert_eq!(report.station_matched, 3);
        assert_eq!(report.station_unmatched, 1);
        assert_eq!(report.geocoded, 2);
        assert_eq!(report.geocode_unmatched, 1);
        assert_eq!(report.votes_in, VoteCount(25));
        assert_eq!(report.votes_combined, VoteCount(15));
        assert_eq!(report.votes_station_unmatched, VoteCount(7));
        assert_eq!(report.votes_geocode_unmatched, VoteCount(3));
        assert_eq!(report.station_severity, Severity::Elevated);
    }

    #[test]
    fn empty_directory_reports_everything() {
        let aggregated = vec![agg(70, 1, "Left", 10)];
        let res = reconcile(
            Epoch(13),
            &aggregated,
            &[],
            &BTreeMap::new(),
            &MatchThresholds::DEFAULT,
        );
        assert!(res.combined.is_empty());
        assert_eq!(res.report.station_unmatched, 1);
        assert_eq!(res.report.geocode_severity, Severity::Normal);
    }

    #[test]
    fn low_miss_rate_is_normal() {
        let mut aggregated: Vec<AggregatedVoteRecord> =
            (1..=40).map(|s| agg(70, s, "Left", 1)).collect();
        aggregated.push(agg(99, 1, "Left", 1));
        let directory: Vec<StationRecord> =
            (1..=40).map(|s| station(70, s, "Herzl 1", "Ashdod")).collect();
        let lookup = coords(&[("Herzl 1, Ashdod", 1.0, 2.0)]);
        let res = reconcile(
            Epoch(22),
            &aggregated,
            &directory,
            &lookup,
            &MatchThresholds::DEFAULT,
        );
        assert_eq!(res.report.station_unmatched, 1);
        assert_eq!(res.report.station_severity, Severity::Normal);
        assert_eq!(res.combined.len(), 40);
    }

    proptest! {
        #[test]
        fn every_row_is_accounted_for_once(
            keys in prop::collection::btree_set((0i64..6, 0i64..6), 0..15),
            known_stations in prop::collection::btree_set((0i64..6, 0i64..6), 0..15),
            geocoded_localities in prop::collection::btree_set(0i64..6, 0..4),
        ) {
            let aggregated: Vec<AggregatedVoteRecord> =
                keys.iter().map(|(l, s)| agg(*l, *s, "Left", 1)).collect();
            let directory: Vec<StationRecord> = known_stations
                .iter()
                .map(|(l, s)| station(*l, *s, &format!("Street {}", s), &format!("Town{}", l)))
                .collect();
            let mut lookup: BTreeMap<String, Coordinate> = BTreeMap::new();
            for s in directory.iter().filter(|s| geocoded_localities.contains(&s.locality_code)) {
                lookup.insert(
                    canonicalize(&s.full_address),
                    Coordinate { latitude: 0.0, longitude: 0.0 },
                );
            }
            let res = reconcile(Epoch(22), &aggregated, &directory, &lookup, &MatchThresholds::DEFAULT);
            let r = &res.report;
            prop_assert_eq!(res.combined.len() + res.unmatched.len(), aggregated.len());
            prop_assert_eq!(r.geocoded + r.station_unmatched + r.geocode_unmatched, r.aggregated);
            prop_assert_eq!(r.votes_combined + r.votes_station_unmatched + r.votes_geocode_unmatched, r.votes_in);
        }
    }
}
