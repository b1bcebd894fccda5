mod args;
mod pipeline;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use snafu::ErrorCompat;

use station_votes::geocache::{Geocoder, ResolveOptions};
use station_votes::reconcile::MatchThresholds;
use station_votes::Epoch;

use crate::args::Args;
use crate::pipeline::io_geocode::GoogleGeocoder;
use crate::pipeline::{run_pipeline, PipelineResult, RunOptions, RunSummary};

fn run_options(args: &Args) -> RunOptions {
    let out_dir = PathBuf::from(&args.out);
    RunOptions {
        registry_path: PathBuf::from(&args.registry),
        geocode_store: args
            .geocode_store
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| out_dir.join("locations.tsv")),
        out_dir,
        epochs: args
            .epochs
            .as_ref()
            .map(|es| es.iter().map(|e| Epoch(*e)).collect()),
        jobs: args.jobs,
        resolve: ResolveOptions {
            region: args.region.clone(),
            pacing: Duration::from_millis(args.pacing_ms),
            max_requests: args.geocode_limit,
        },
        thresholds: MatchThresholds {
            elevated_unmatched_rate: args.elevated_rate,
        },
        reference: args.reference.as_ref().map(PathBuf::from),
    }
}

fn run(args: &Args) -> PipelineResult<RunSummary> {
    let opts = run_options(args);
    let mut google: Option<GoogleGeocoder> = match (&args.google_api_key, args.offline) {
        (_, true) => None,
        (Some(key), false) if !key.trim().is_empty() => Some(GoogleGeocoder::new(key.trim())?),
        _ => {
            warn!("No geocoding API key: only the coordinates of the store are used");
            None
        }
    };
    let geocoder: Option<&mut dyn Geocoder> = google.as_mut().map(|g| g as &mut dyn Geocoder);
    run_pipeline(&opts, geocoder)
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    info!("Reading registry {}", args.registry);

    match run(&args) {
        Ok(summary) => {
            match serde_json::to_string_pretty(&summary) {
                Ok(js) => println!("{}", js),
                Err(e) => warn!("Could not print the summary: {}", e),
            }
            if summary.has_failures() {
                eprintln!("Failed epochs: {:?}", summary.failed_epochs);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("An error occured {}", e);
            if let Some(bt) = ErrorCompat::backtrace(&e) {
                eprintln!("trace: {}", bt);
            }
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn options_from_args() {
        let args = Args::parse_from([
            "stvotes",
            "--registry",
            "registry/knesset.json",
            "--epochs",
            "24,25",
            "--offline",
            "--pacing-ms",
            "0",
        ]);
        let opts = run_options(&args);
        assert_eq!(opts.epochs, Some(vec![Epoch(24), Epoch(25)]));
        assert_eq!(opts.geocode_store, PathBuf::from("output").join("locations.tsv"));
        assert_eq!(opts.jobs, 4);
        assert_eq!(opts.resolve.region, "il");
        assert!(opts.resolve.pacing.is_zero());
        assert_eq!(opts.thresholds, MatchThresholds::DEFAULT);
        assert!(args.offline);
    }
}
