use log::{debug, info, warn};

use snafu::{prelude::*, Snafu};
use station_votes::directory::*;
use station_votes::geocache::*;
use station_votes::reconcile::*;
use station_votes::registry::{resolve_columns, EpochRegistry};
use station_votes::*;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_json::Value as JSValue;
use text_diff::print_diff;

pub mod config_reader;
pub mod io_common;
mod io_csv;
mod io_excel;
pub mod io_geocode;
pub mod io_output;

use crate::pipeline::config_reader::*;
use crate::pipeline::io_common::*;
use crate::pipeline::io_geocode::TsvGeocodeStore;
use crate::pipeline::io_output::*;

#[derive(Debug, Snafu)]
pub enum PipelineError {
    #[snafu(display("Error opening workbook {path}"))]
    OpeningWorkbook {
        source: calamine::Error,
        path: String,
    },
    #[snafu(display("Worksheet {sheet:?} not found in {path}"))]
    MissingSheet { path: String, sheet: String },
    #[snafu(display("Workbook {path} has no worksheet"))]
    EmptyWorkbook { path: String },
    #[snafu(display("Error opening delimited file {path}"))]
    OpeningCsv { source: csv::Error, path: String },
    #[snafu(display("Error reading line {lineno} of {path}"))]
    CsvLineParse {
        source: csv::Error,
        path: String,
        lineno: usize,
    },
    #[snafu(display("Unsupported table format: {path}"))]
    UnsupportedFormat { path: String },
    #[snafu(display("Error opening registry {path}"))]
    OpeningRegistry {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing registry {path}"))]
    ParsingRegistry {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Error parsing summary {path}"))]
    ParsingSummary {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Error reading bloc file {path}"))]
    ReadingBlocs { source: csv::Error, path: String },
    #[snafu(display("{source}"))]
    Configuration { source: ConfigurationError },
    #[snafu(display("Geocoding error: {source}"))]
    Geocoding { source: GeocodeError },
    #[snafu(display("Error writing {path}"))]
    WritingTable { source: csv::Error, path: String },
    #[snafu(display("I/O error on {path}"))]
    Io {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error serializing the summary"))]
    WritingJson { source: serde_json::Error },
    #[snafu(display("Error building the HTTP client"))]
    HttpClient { source: reqwest::Error },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Everything a run needs besides the registry content.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub registry_path: PathBuf,
    pub out_dir: PathBuf,
    /// Restrict the run to these epochs. All the registered epochs otherwise.
    pub epochs: Option<Vec<Epoch>>,
    pub jobs: usize,
    pub geocode_store: PathBuf,
    pub resolve: ResolveOptions,
    pub thresholds: MatchThresholds,
    pub reference: Option<PathBuf>,
}

// ******** Summary ***********

#[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochSummary {
    pub epoch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rows_read: usize,
    pub malformed_rows: usize,
    pub sentinel_rows: usize,
    pub normalized_records: usize,
    pub aggregated_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_from: Option<u32>,
    pub stations: usize,
    pub station_matched: usize,
    pub station_unmatched: usize,
    pub geocoded: usize,
    pub geocode_unmatched: usize,
    pub votes_in: u64,
    pub votes_combined: u64,
    pub votes_station_unmatched: u64,
    pub votes_geocode_unmatched: u64,
    pub station_unmatched_rate: f64,
    pub geocode_unmatched_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geocode_severity: Option<String>,
}

impl EpochSummary {
    fn failed(epoch: Epoch, error: String) -> EpochSummary {
        EpochSummary {
            epoch: epoch.0,
            error: Some(error),
            ..EpochSummary::default()
        }
    }
}

#[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeSummary {
    pub offline: bool,
    pub store_entries: usize,
    pub requested: usize,
    pub cached: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub epochs: Vec<EpochSummary>,
    pub failed_epochs: Vec<u32>,
    pub geocoding: GeocodeSummary,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed_epochs.is_empty()
    }
}

// ******** Per-epoch work ***********

// The votes of one epoch, read and aggregated.
struct EpochVotes {
    aggregated: Vec<AggregatedVoteRecord>,
    stats: NormalizeStats,
}

fn process_votes(config: &EpochConfig) -> PipelineResult<EpochVotes> {
    info!(
        "Epoch {}: reading results from {:?}",
        config.epoch, config.results.source.path
    );
    let rows = read_raw_rows(config.epoch, &config.results.source, &config.results.roles())?;
    let (records, stats) = normalize_rows(config, &rows);
    let aggregated = aggregate(&records);
    debug!(
        "process_votes: epoch {}: {} records into {} aggregated rows",
        config.epoch,
        records.len(),
        aggregated.len()
    );
    Ok(EpochVotes { aggregated, stats })
}

fn process_directory(
    epoch: Epoch,
    layout: &DirectoryLayout,
) -> PipelineResult<(Vec<StationRecord>, DirectoryStats)> {
    info!(
        "Epoch {}: reading station directory from {:?}",
        epoch, layout.source.path
    );
    let rows = read_raw_rows(epoch, &layout.source, &layout.roles())?;
    Ok(build_directory(epoch, layout, &rows))
}

/// The epochs of the run, in order, with the reason why the invalid ones cannot run.
fn select_epochs(
    loaded: &LoadedRegistry,
    requested: &Option<Vec<Epoch>>,
) -> (Vec<Epoch>, BTreeMap<Epoch, String>) {
    let rejected: BTreeMap<Epoch, String> = loaded
        .rejected
        .iter()
        .map(|(e, err)| (*e, err.to_string()))
        .collect();
    let candidates: BTreeSet<Epoch> = match requested {
        Some(es) => es.iter().cloned().collect(),
        None => loaded
            .registry
            .epochs()
            .into_iter()
            .chain(rejected.keys().cloned())
            .collect(),
    };
    let mut valid: Vec<Epoch> = Vec::new();
    let mut failures: BTreeMap<Epoch, String> = BTreeMap::new();
    for e in candidates {
        if let Some(msg) = rejected.get(&e) {
            failures.insert(e, msg.clone());
        } else if let Err(err) = loaded.registry.get_config(e) {
            failures.insert(e, err.to_string());
        } else {
            valid.push(e);
        }
    }
    (valid, failures)
}

/// The addresses to geocode: the stations that hold votes in at least one epoch.
fn needed_addresses(
    votes: &BTreeMap<Epoch, EpochVotes>,
    station_sets: &BTreeMap<Epoch, &Vec<StationRecord>>,
) -> BTreeSet<String> {
    let mut res: BTreeSet<String> = BTreeSet::new();
    for (epoch, ev) in votes.iter() {
        if let Some(stations) = station_sets.get(epoch) {
            let keys: BTreeSet<(i64, i64)> = ev
                .aggregated
                .iter()
                .map(|r| (r.locality_code, r.station_code))
                .collect();
            for s in stations.iter() {
                if keys.contains(&(s.locality_code, s.station_code)) {
                    res.insert(s.full_address.clone());
                }
            }
        }
    }
    res
}

/// Runs the whole pipeline described by the registry.
///
/// Arguments:
/// * `geocoder` the provider for the addresses missing from the store. When absent,
/// only the stored coordinates are used.
///
/// Failures of one epoch are recorded in the summary and do not stop the others. The
/// returned error is reserved for problems that affect the whole run: unreadable
/// registry, broken geocode store, output that cannot be written, or a mismatch with
/// the reference summary.
pub fn run_pipeline(
    opts: &RunOptions,
    geocoder: Option<&mut dyn Geocoder>,
) -> PipelineResult<RunSummary> {
    let loaded = read_registry(&opts.registry_path)?;
    let registry: &EpochRegistry = &loaded.registry;
    let (epochs, mut failures) = select_epochs(&loaded, &opts.epochs);
    for (e, msg) in failures.iter() {
        warn!("Epoch {}: skipped: {}", e, msg);
    }
    info!("Processing epochs {:?} with {} jobs", epochs, opts.jobs);

    // Votes, one task per epoch.
    let configs: Vec<&EpochConfig> = epochs
        .iter()
        .filter_map(|e| registry.get_config(*e).ok())
        .collect();
    let vote_results = run_bounded(&configs, opts.jobs, |c| process_votes(c));
    let mut votes: BTreeMap<Epoch, EpochVotes> = BTreeMap::new();
    for (c, res) in configs.iter().zip(vote_results) {
        match res {
            Ok(ev) => {
                votes.insert(c.epoch, ev);
            }
            Err(e) => {
                warn!("Epoch {}: failed to read the results: {}", c.epoch, e);
                failures.insert(c.epoch, e.to_string());
            }
        }
    }

    // Directories, once per publishing epoch.
    let mut directory_owner: BTreeMap<Epoch, Epoch> = BTreeMap::new();
    let mut layouts: BTreeMap<Epoch, &DirectoryLayout> = BTreeMap::new();
    for e in votes.keys() {
        match registry.directory_for(*e) {
            Ok(Some((owner, layout))) => {
                directory_owner.insert(*e, owner);
                layouts.insert(owner, layout);
            }
            Ok(None) => {
                warn!("Epoch {}: no station directory, all the votes will be unmatched", e);
            }
            Err(err) => {
                failures.insert(*e, err.to_string());
            }
        }
    }
    for e in failures.keys() {
        votes.remove(e);
    }
    let layout_list: Vec<(Epoch, &DirectoryLayout)> =
        layouts.iter().map(|(e, l)| (*e, *l)).collect();
    let directory_results = run_bounded(&layout_list, opts.jobs, |(e, l)| process_directory(*e, l));
    let mut directories: BTreeMap<Epoch, Result<Vec<StationRecord>, String>> = BTreeMap::new();
    for ((owner, _), res) in layout_list.iter().zip(directory_results) {
        let entry = match res {
            Ok((stations, stats)) => {
                debug!("run_pipeline: directory {}: {:?}", owner, stats);
                Ok(stations)
            }
            Err(e) => {
                warn!("Epoch {}: failed to read the station directory: {}", owner, e);
                Err(e.to_string())
            }
        };
        directories.insert(*owner, entry);
    }
    let empty_directory: Vec<StationRecord> = Vec::new();
    let mut station_sets: BTreeMap<Epoch, &Vec<StationRecord>> = BTreeMap::new();
    for e in votes.keys() {
        match directory_owner.get(e).map(|owner| (owner, directories.get(owner))) {
            Some((_, Some(Ok(stations)))) => {
                station_sets.insert(*e, stations);
            }
            Some((owner, Some(Err(msg)))) => {
                failures.insert(*e, format!("station directory of epoch {}: {}", owner, msg));
            }
            Some((owner, None)) => {
                failures.insert(*e, format!("station directory of epoch {} was not read", owner));
            }
            None => {
                station_sets.insert(*e, &empty_directory);
            }
        }
    }
    for e in failures.keys() {
        votes.remove(e);
    }

    // Intermediate outputs.
    for (e, ev) in votes.iter() {
        write_elections(&opts.out_dir, *e, &ev.aggregated)?;
        if let Some(stations) = station_sets.get(e) {
            write_stations(&opts.out_dir, *e, stations)?;
        }
    }

    // Geocoding, from the orchestrator thread only.
    let store = TsvGeocodeStore::new(&opts.geocode_store);
    let mut cache = GeocodeCache::open(store).context(GeocodingSnafu {})?;
    let addresses = needed_addresses(&votes, &station_sets);
    let geocoding = match geocoder {
        Some(g) => {
            let stop = AtomicBool::new(false);
            let report = cache
                .resolve(&addresses, g, &opts.resolve, &stop)
                .context(GeocodingSnafu {})?;
            for a in report.unresolved.iter() {
                debug!("run_pipeline: no candidate for {:?}", a);
            }
            GeocodeSummary {
                offline: false,
                store_entries: cache.len(),
                requested: report.requested,
                cached: report.cached,
                resolved: report.resolved,
                unresolved: report.unresolved.len(),
                failed: report.failed.len(),
                skipped: report.skipped.len(),
            }
        }
        None => {
            let cached = addresses
                .iter()
                .filter(|a| cache.lookup(a).is_some())
                .count();
            info!(
                "Geocoding offline: {} of {} addresses in the store",
                cached,
                addresses.len()
            );
            GeocodeSummary {
                offline: true,
                store_entries: cache.len(),
                requested: addresses.len(),
                cached,
                skipped: addresses.len() - cached,
                ..GeocodeSummary::default()
            }
        }
    };

    // Joins.
    let mut summaries: BTreeMap<Epoch, EpochSummary> = BTreeMap::new();
    for (e, ev) in votes.iter() {
        let stations: &[StationRecord] = match station_sets.get(e) {
            Some(s) => s.as_slice(),
            None => &[],
        };
        let rec = reconcile(*e, &ev.aggregated, stations, &cache, &opts.thresholds);
        write_combined(&opts.out_dir, *e, &rec.combined)?;
        write_unmatched(&opts.out_dir, *e, &rec.unmatched)?;
        let r = &rec.report;
        summaries.insert(
            *e,
            EpochSummary {
                epoch: e.0,
                error: None,
                rows_read: ev.stats.rows_in,
                malformed_rows: ev.stats.malformed,
                sentinel_rows: ev.stats.sentinel,
                normalized_records: ev.stats.records_out,
                aggregated_records: ev.aggregated.len(),
                directory_from: directory_owner.get(e).filter(|o| *o != e).map(|o| o.0),
                stations: stations.len(),
                station_matched: r.station_matched,
                station_unmatched: r.station_unmatched,
                geocoded: r.geocoded,
                geocode_unmatched: r.geocode_unmatched,
                votes_in: r.votes_in.0,
                votes_combined: r.votes_combined.0,
                votes_station_unmatched: r.votes_station_unmatched.0,
                votes_geocode_unmatched: r.votes_geocode_unmatched.0,
                station_unmatched_rate: r.station_unmatched_rate(),
                geocode_unmatched_rate: r.geocode_unmatched_rate(),
                station_severity: Some(format!("{:?}", r.station_severity)),
                geocode_severity: Some(format!("{:?}", r.geocode_severity)),
            },
        );
    }
    for (e, msg) in failures.iter() {
        summaries.insert(*e, EpochSummary::failed(*e, msg.clone()));
    }

    let summary = RunSummary {
        epochs: summaries.into_values().collect(),
        failed_epochs: failures.keys().map(|e| e.0).collect(),
        geocoding,
    };
    write_summary(&opts.out_dir, &summary)?;

    if let Some(reference) = &opts.reference {
        check_reference(&summary, reference)?;
    }
    Ok(summary)
}

// ******** Reference check ***********

fn epochs_js(js: &JSValue) -> JSValue {
    json!({ "epochs": js["epochs"] })
}

pub fn read_summary(path: &Path) -> PipelineResult<JSValue> {
    let p = path.display().to_string();
    let contents = fs::read_to_string(path).context(IoSnafu { path: p.clone() })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingSummarySnafu { path: p })?;
    Ok(js)
}

/// Compares the per-epoch part of the summary with a saved one.
///
/// The geocoding counters are left out: they depend on the state of the store.
fn check_reference(summary: &RunSummary, reference: &Path) -> PipelineResult<()> {
    let summary_ref = read_summary(reference)?;
    let pretty_js_summary_ref =
        serde_json::to_string_pretty(&epochs_js(&summary_ref)).context(WritingJsonSnafu {})?;
    let js = serde_json::to_value(summary).context(WritingJsonSnafu {})?;
    let pretty_js_stats = serde_json::to_string_pretty(&epochs_js(&js)).context(WritingJsonSnafu {})?;
    if pretty_js_summary_ref != pretty_js_stats {
        warn!("Found differences with the reference summary");
        print_diff(
            pretty_js_summary_ref.as_str(),
            pretty_js_stats.as_ref(),
            "\n",
        );
        whatever!("Difference detected between calculated summary and reference summary")
    }
    info!("Summary matches the reference {:?}", reference);
    Ok(())
}
