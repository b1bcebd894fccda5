//! The geocode cache: a durable, append-only mapping from canonical address to coordinate.
//!
//! Geocoding calls are paid for, so the store is consulted before every call and each
//! successful resolution is persisted before the next request goes out. Addresses the
//! provider cannot resolve are left out of the store and retried on the next run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use crate::address::canonicalize;
use crate::*;

/// Turns a free-text address into a coordinate.
pub trait Geocoder {
    /// Returns the best candidate for the address, or `None` if the provider has none.
    fn geocode(&mut self, address: &str, region: &str) -> Result<Option<Coordinate>, GeocodeError>;
}

/// The durable side of the cache.
pub trait GeocodeStore {
    fn load(&mut self) -> Result<Vec<GeocodeEntry>, GeocodeError>;
    /// Appends an entry. It must be durable when this returns.
    fn append(&mut self, entry: &GeocodeEntry) -> Result<(), GeocodeError>;
}

/// Looks up coordinates by canonical address.
pub trait CoordinateLookup {
    fn coordinate(&self, canonical_address: &str) -> Option<Coordinate>;
}

impl CoordinateLookup for BTreeMap<String, Coordinate> {
    fn coordinate(&self, canonical_address: &str) -> Option<Coordinate> {
        self.get(canonical_address).copied()
    }
}

/// A store that only lives in memory.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct MemoryStore {
    pub entries: Vec<GeocodeEntry>,
}

impl GeocodeStore for MemoryStore {
    fn load(&mut self) -> Result<Vec<GeocodeEntry>, GeocodeError> {
        Ok(self.entries.clone())
    }

    fn append(&mut self, entry: &GeocodeEntry) -> Result<(), GeocodeError> {
        self.entries.push(entry.clone());
        Ok(())
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct ResolveOptions {
    /// Region hint passed to the provider.
    pub region: String,
    /// Pause between two provider calls.
    pub pacing: Duration,
    /// Maximum number of provider calls for this run.
    pub max_requests: Option<usize>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            region: "il".to_string(),
            pacing: Duration::from_millis(50),
            max_requests: None,
        }
    }
}

/// The outcome of a call to [`GeocodeCache::resolve`].
#[derive(PartialEq, Debug, Clone, Default)]
pub struct ResolveReport {
    pub requested: usize,
    /// Already present in the store.
    pub cached: usize,
    /// Resolved by the provider during this run.
    pub resolved: usize,
    /// The provider returned no candidate.
    pub unresolved: Vec<String>,
    /// The provider failed. Retried on the next run.
    pub failed: Vec<String>,
    /// Not attempted: request budget exhausted, quota exceeded or stop requested.
    pub skipped: Vec<String>,
    /// Coordinates of all the requested addresses that are now known.
    pub coordinates: BTreeMap<String, Coordinate>,
}

/// The cache, owned by a single writer.
pub struct GeocodeCache<S: GeocodeStore> {
    store: S,
    entries: BTreeMap<String, GeocodeEntry>,
}

impl<S: GeocodeStore> GeocodeCache<S> {
    /// Loads the persisted entries. The first entry for a canonical address wins.
    pub fn open(mut store: S) -> Result<GeocodeCache<S>, GeocodeError> {
        let mut entries: BTreeMap<String, GeocodeEntry> = BTreeMap::new();
        let loaded = store.load()?;
        let num_loaded = loaded.len();
        for e in loaded {
            entries.entry(canonicalize(&e.address)).or_insert(e);
        }
        info!(
            "Geocode cache: {} entries loaded, {} distinct addresses",
            num_loaded,
            entries.len()
        );
        Ok(GeocodeCache { store, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a free-text address.
    pub fn lookup(&self, address: &str) -> Option<Coordinate> {
        self.entries
            .get(&canonicalize(address))
            .map(|e| e.coordinate())
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Makes sure that all the addresses are in the cache, calling the geocoder for the
    /// missing ones.
    ///
    /// Arguments:
    /// * `addresses` the addresses to resolve, as they should be sent to the provider
    /// * `geocoder` the external provider. Calls are sequential and paced.
    /// * `options` region hint, pacing and request budget
    /// * `stop` when set, no further provider call is made
    ///
    /// Only store failures are returned as errors: everything that was persisted before
    /// them stays valid for the next run.
    pub fn resolve(
        &mut self,
        addresses: &BTreeSet<String>,
        geocoder: &mut dyn Geocoder,
        options: &ResolveOptions,
        stop: &AtomicBool,
    ) -> Result<ResolveReport, GeocodeError> {
        let mut report = ResolveReport {
            requested: addresses.len(),
            ..ResolveReport::default()
        };
        let mut num_calls: usize = 0;
        let mut halted = false;
        // Canonical keys the provider had no candidate for during this run.
        let mut no_candidate: BTreeSet<String> = BTreeSet::new();

        for address in addresses.iter() {
            let key = canonicalize(address);
            if let Some(e) = self.entries.get(&key) {
                report.cached += 1;
                report.coordinates.insert(address.clone(), e.coordinate());
                continue;
            }
            if no_candidate.contains(&key) {
                report.unresolved.push(address.clone());
                continue;
            }
            let over_budget = options.max_requests.map_or(false, |m| num_calls >= m);
            if halted || over_budget || stop.load(Ordering::SeqCst) {
                report.skipped.push(address.clone());
                continue;
            }
            if num_calls > 0 && !options.pacing.is_zero() {
                std::thread::sleep(options.pacing);
            }
            num_calls += 1;
            match geocoder.geocode(address, &options.region) {
                Ok(Some(c)) => {
                    let entry = GeocodeEntry {
                        address: address.clone(),
                        latitude: c.latitude,
                        longitude: c.longitude,
                    };
                    self.store.append(&entry)?;
                    debug!("resolve: {:?} -> {:?}", address, c);
                    self.entries.insert(key, entry);
                    report.resolved += 1;
                    report.coordinates.insert(address.clone(), c);
                }
                Ok(None) => {
                    debug!("resolve: no candidate for {:?}", address);
                    no_candidate.insert(key);
                    report.unresolved.push(address.clone());
                }
                Err(GeocodeError::QuotaExceeded(msg)) => {
                    warn!("Geocoding stopped, quota exceeded: {}", msg);
                    halted = true;
                    report.skipped.push(address.clone());
                }
                Err(GeocodeError::Provider(msg)) => {
                    warn!("Geocoding failed for {:?}: {}", address, msg);
                    report.failed.push(address.clone());
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Geocoding: {} requested, {} cached, {} resolved, {} without candidate, {} failed, {} skipped",
            report.requested,
            report.cached,
            report.resolved,
            report.unresolved.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

impl<S: GeocodeStore> CoordinateLookup for GeocodeCache<S> {
    fn coordinate(&self, canonical_address: &str) -> Option<Coordinate> {
        self.entries.get(canonical_address).map(|e| e.coordinate())
    }
}
