// The geocode store on disk and the Google geocoding adapter.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Duration;

use crate::pipeline::*;

const STORE_HEADER: [&str; 3] = ["Address", "Latitude", "Longitude"];

/// A tab-separated file with one resolved address per line.
///
/// The file is only ever appended to. Each line is flushed to disk before
/// [`GeocodeStore::append`] returns.
pub struct TsvGeocodeStore {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl TsvGeocodeStore {
    pub fn new(path: &Path) -> TsvGeocodeStore {
        TsvGeocodeStore {
            path: path.to_path_buf(),
            writer: None,
        }
    }

    fn store_error(&self, e: impl std::fmt::Display) -> GeocodeError {
        GeocodeError::Store(format!("{}: {}", self.path.display(), e))
    }

    fn open_writer(&mut self) -> Result<&mut csv::Writer<File>, GeocodeError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(|e| self.store_error(e))?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| self.store_error(e))?;
            let len = file.metadata().map_err(|e| self.store_error(e))?.len();
            let is_new = len == 0;
            // An interrupted write leaves a partial last line: terminate it so that
            // the next entry starts on its own line.
            if !is_new && !ends_with_newline(&mut file, len).map_err(|e| self.store_error(e))? {
                warn!("Geocode store {:?}: terminating a partial last line", self.path);
                file.write_all(b"\n").map_err(|e| self.store_error(e))?;
            }
            let mut writer = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .from_writer(file);
            if is_new {
                writer
                    .write_record(STORE_HEADER)
                    .map_err(|e| self.store_error(e))?;
            }
            self.writer = Some(writer);
        }
        match self.writer.as_mut() {
            Some(w) => Ok(w),
            None => Err(GeocodeError::Store("writer not available".to_string())),
        }
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

impl GeocodeStore for TsvGeocodeStore {
    fn load(&mut self) -> Result<Vec<GeocodeEntry>, GeocodeError> {
        if !self.path.exists() {
            info!("Geocode store {:?} does not exist yet", self.path);
            return Ok(Vec::new());
        }
        // Stores written by older tools have no header line.
        let rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| self.store_error(e))?;
        let mut res: Vec<GeocodeEntry> = Vec::new();
        for (idx, line_r) in rdr.into_records().enumerate() {
            if idx == 0 {
                if let Ok(line) = &line_r {
                    if line.iter().eq(STORE_HEADER.iter().copied()) {
                        continue;
                    }
                }
            }
            let entry = line_r.ok().and_then(|line| {
                let address = line.get(0)?.to_string();
                let latitude = line.get(1)?.trim().parse::<f64>().ok()?;
                let longitude = line.get(2)?.trim().parse::<f64>().ok()?;
                Some(GeocodeEntry {
                    address,
                    latitude,
                    longitude,
                })
            });
            match entry {
                Some(e) => res.push(e),
                // An interrupted write leaves a partial last line.
                None => warn!(
                    "Geocode store {:?}: skipping unreadable line {}",
                    self.path,
                    idx + 1
                ),
            }
        }
        Ok(res)
    }

    fn append(&mut self, entry: &GeocodeEntry) -> Result<(), GeocodeError> {
        let writer = self.open_writer()?;
        let res = writer
            .write_record([
                entry.address.clone(),
                entry.latitude.to_string(),
                entry.longitude.to_string(),
            ])
            .and_then(|_| writer.flush().map_err(csv::Error::from))
            .and_then(|_| writer.get_ref().sync_all().map_err(csv::Error::from));
        res.map_err(|e| self.store_error(e))
    }
}

// ******** Google geocoding API ***********

const GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const USER_AGENT: &str = concat!("stvotes/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT_SECS: u64 = 30;
// After that many transport failures in a row, the provider is considered down.
const MAX_CONSECUTIVE_FAILURES: usize = 5;

#[derive(Debug, Deserialize)]
struct Location {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: Location,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    error_message: Option<String>,
}

fn interpret(response: &GeocodeResponse) -> Result<Option<Coordinate>, GeocodeError> {
    let message = || match &response.error_message {
        Some(m) => format!("{}: {}", response.status, m),
        None => response.status.clone(),
    };
    match response.status.as_str() {
        // The provider ranks its candidates: take the best one.
        "OK" => Ok(response.results.first().map(|r| Coordinate {
            latitude: r.geometry.location.lat,
            longitude: r.geometry.location.lng,
        })),
        "ZERO_RESULTS" => Ok(None),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" | "REQUEST_DENIED" => {
            Err(GeocodeError::QuotaExceeded(message()))
        }
        _ => Err(GeocodeError::Provider(message())),
    }
}

pub struct GoogleGeocoder {
    http: reqwest::blocking::Client,
    api_key: String,
    consecutive_failures: usize,
}

impl GoogleGeocoder {
    pub fn new(api_key: &str) -> PipelineResult<GoogleGeocoder> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .context(HttpClientSnafu {})?;
        Ok(GoogleGeocoder {
            http,
            api_key: api_key.to_string(),
            consecutive_failures: 0,
        })
    }

    fn request(&self, address: &str, region: &str) -> Result<Option<Coordinate>, GeocodeError> {
        // The URL carries the key: keep it out of the error messages.
        let resp = self
            .http
            .get(GEOCODE_ENDPOINT)
            .query(&[
                ("address", address),
                ("region", region),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .map_err(|e| GeocodeError::Provider(e.without_url().to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GeocodeError::QuotaExceeded(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(GeocodeError::Provider(format!("HTTP {}", status)));
        }
        let body: GeocodeResponse = resp
            .json()
            .map_err(|e| GeocodeError::Provider(e.without_url().to_string()))?;
        interpret(&body)
    }
}

impl Geocoder for GoogleGeocoder {
    fn geocode(&mut self, address: &str, region: &str) -> Result<Option<Coordinate>, GeocodeError> {
        let res = self.request(address, region);
        match &res {
            Err(GeocodeError::Provider(msg)) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(GeocodeError::QuotaExceeded(format!(
                        "{} failures in a row, last one: {}",
                        self.consecutive_failures, msg
                    )));
                }
            }
            _ => {
                self.consecutive_failures = 0;
            }
        }
        res
    }
}
