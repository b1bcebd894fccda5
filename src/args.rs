use clap::Parser;

/// This program joins polling-station election results with the address and the coordinates
/// of every station.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path) The registry describing the sources of every epoch, in JSON format.
    /// For more information about the file format, read the manual of the station_votes crate.
    #[clap(short, long, value_parser)]
    pub registry: String,

    /// (directory, default 'output') Where the combined, unmatched and intermediate tables are
    /// written, along with summary.json.
    #[clap(short, long, value_parser, default_value = "output")]
    pub out: String,

    /// (list of comma-separated values or not specified) If specified, only these epochs are
    /// processed. All the epochs of the registry otherwise.
    #[clap(short, long, value_parser, value_delimiter = ',')]
    pub epochs: Option<Vec<u32>>,

    /// (default 4) The number of epochs read in parallel.
    #[clap(short, long, value_parser, default_value_t = 4)]
    pub jobs: usize,

    /// (file path, default <out>/locations.tsv) The geocode store. Resolved addresses are appended
    /// to it, so that they are never requested twice.
    #[clap(long, value_parser)]
    pub geocode_store: Option<String>,

    /// If passed as an argument, the geocoding provider is never called: only the coordinates
    /// already in the store are used.
    #[clap(long, takes_value = false)]
    pub offline: bool,

    /// (default il) The region hint sent to the geocoding provider.
    #[clap(long, value_parser, default_value = "il")]
    pub region: String,

    /// (milliseconds, default 50) The pause between two calls to the geocoding provider.
    #[clap(long, value_parser, default_value_t = 50)]
    pub pacing_ms: u64,

    /// (number or not specified) The maximum number of calls to the geocoding provider for
    /// this run.
    #[clap(long, value_parser)]
    pub geocode_limit: Option<usize>,

    /// The key of the Google geocoding API. Without it, the run is offline.
    #[clap(long, value_parser, env = "GOOGLE_MAPS_API_KEY", hide_env_values = true)]
    pub google_api_key: Option<String>,

    /// (between 0 and 1, default 0.05) The unmatched rate above which a join is reported as
    /// elevated.
    #[clap(long, value_parser, default_value_t = 0.05)]
    pub elevated_rate: f64,

    /// (file path) A summary.json of a previous run. If provided, stvotes checks that the
    /// per-epoch counts match it.
    #[clap(long, value_parser)]
    pub reference: Option<String>,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
