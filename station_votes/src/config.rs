// ********* Input data structures ***********

use std::error::Error;
use std::fmt::Display;
use std::ops::{Add, AddAssign};
use std::path::PathBuf;

/// An electoral cycle. Each epoch ships its own source layout.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct Epoch(pub u32);

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed cell, as produced by the table readers.
#[derive(PartialEq, Debug, Clone)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

impl Cell {
    /// The textual content of the cell, with integral numbers written without a fractional part.
    pub fn as_text(&self) -> String {
        match self {
            Cell::Empty => "".to_string(),
            Cell::Number(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{}", *f as i64)
            }
            Cell::Number(f) => f.to_string(),
            Cell::Text(s) => s.clone(),
        }
    }
}

/// The role a physical column plays in a source table.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum ColumnRole {
    LocalityCode,
    StationCode,
    LocalityName,
    AddressName,
    /// Index into the vote columns of the epoch.
    Votes(usize),
}

impl Display for ColumnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnRole::LocalityCode => write!(f, "locality code"),
            ColumnRole::StationCode => write!(f, "station code"),
            ColumnRole::LocalityName => write!(f, "locality name"),
            ColumnRole::AddressName => write!(f, "address name"),
            ColumnRole::Votes(idx) => write!(f, "vote column #{}", idx),
        }
    }
}

/// A single row of a source table, with its cells keyed by role.
#[derive(PartialEq, Debug, Clone)]
pub struct RawRow {
    /// 1-based line number in the source table, for diagnostics.
    pub lineno: usize,
    pub cells: Vec<(ColumnRole, Cell)>,
}

impl RawRow {
    /// Builds a row out of the physical cells, using resolved column positions.
    /// Cells past the end of the physical row are treated as empty.
    pub fn from_cells(lineno: usize, columns: &[(ColumnRole, usize)], cells: &[Cell]) -> RawRow {
        RawRow {
            lineno,
            cells: columns
                .iter()
                .map(|(role, idx)| (*role, cells.get(*idx).cloned().unwrap_or(Cell::Empty)))
                .collect(),
        }
    }

    pub fn cell(&self, role: ColumnRole) -> Option<&Cell> {
        self.cells.iter().find(|(r, _)| *r == role).map(|(_, c)| c)
    }
}

/// Points at a physical column, either by position or by header label.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum ColumnRef {
    /// 0-based position.
    Index(usize),
    /// Header text. Compared after trimming both sides.
    Label(String),
}

impl Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnRef::Index(idx) => write!(f, "#{}", idx),
            ColumnRef::Label(label) => write!(f, "{:?}", label),
        }
    }
}

/// Where a table lives and how many leading rows to discard.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct TableSource {
    pub path: PathBuf,
    /// The worksheet. The first sheet is used if not provided. Ignored for delimited text.
    pub sheet: Option<String>,
    /// 0-based row holding the header labels. Data starts on the following row.
    pub header_row: Option<usize>,
    /// Number of data rows to skip (after the header row, if any).
    pub skip_rows: usize,
}

/// A unit correction applied to a code.
///
/// Different epochs encode the same station at different granularities.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum ScaleFactor {
    Times(u32),
    /// Truncating division.
    DividedBy(u32),
}

impl ScaleFactor {
    pub const IDENTITY: ScaleFactor = ScaleFactor::Times(1);

    /// Converts a factor as written by humans (10, 1, 0.1) into an exact scale.
    pub fn from_factor(factor: f64) -> Option<ScaleFactor> {
        if !factor.is_finite() || factor <= 0.0 {
            return None;
        }
        if factor >= 1.0 {
            if factor.fract() == 0.0 && factor <= u32::MAX as f64 {
                return Some(ScaleFactor::Times(factor as u32));
            }
            return None;
        }
        let inverse = 1.0 / factor;
        let rounded = inverse.round();
        if (inverse - rounded).abs() < 1e-9 && rounded <= u32::MAX as f64 {
            Some(ScaleFactor::DividedBy(rounded as u32))
        } else {
            None
        }
    }

    pub fn apply(&self, code: i64) -> i64 {
        match self {
            ScaleFactor::Times(n) => code.saturating_mul(*n as i64),
            ScaleFactor::DividedBy(n) => code / (*n as i64),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct ScaleFactors {
    pub locality: ScaleFactor,
    pub station: ScaleFactor,
}

impl ScaleFactors {
    pub const IDENTITY: ScaleFactors = ScaleFactors {
        locality: ScaleFactor::IDENTITY,
        station: ScaleFactor::IDENTITY,
    };
}

/// A column of the results table holding the votes of one party.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct VoteColumn {
    pub column: ColumnRef,
    pub bloc: String,
    pub party: Option<String>,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ResultsLayout {
    pub source: TableSource,
    pub locality: ColumnRef,
    pub station: ColumnRef,
    pub vote_columns: Vec<VoteColumn>,
    pub scale: ScaleFactors,
}

impl ResultsLayout {
    pub fn roles(&self) -> Vec<(ColumnRole, &ColumnRef)> {
        let mut roles = vec![
            (ColumnRole::LocalityCode, &self.locality),
            (ColumnRole::StationCode, &self.station),
        ];
        for (idx, vc) in self.vote_columns.iter().enumerate() {
            roles.push((ColumnRole::Votes(idx), &vc.column));
        }
        roles
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DirectoryLayout {
    pub source: TableSource,
    pub locality: ColumnRef,
    pub station: ColumnRef,
    pub locality_name: ColumnRef,
    pub address_name: ColumnRef,
    pub scale: ScaleFactors,
}

impl DirectoryLayout {
    pub fn roles(&self) -> Vec<(ColumnRole, &ColumnRef)> {
        vec![
            (ColumnRole::LocalityCode, &self.locality),
            (ColumnRole::StationCode, &self.station),
            (ColumnRole::LocalityName, &self.locality_name),
            (ColumnRole::AddressName, &self.address_name),
        ]
    }
}

/// Where the station directory of an epoch comes from.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum DirectorySource {
    Table(DirectoryLayout),
    /// Reuse the directory published with another epoch.
    Borrowed(Epoch),
    /// No directory: every vote row ends up station-unmatched.
    Missing,
}

/// The extraction configuration of one epoch. Immutable once validated.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct EpochConfig {
    pub epoch: Epoch,
    pub results: ResultsLayout,
    /// Locality code of military / non-geographic stations, if any.
    pub sentinel: Option<i64>,
    pub directory: DirectorySource,
}

// ********* Pipeline records ***********

/// A number of votes. Never negative; sums saturate.
#[derive(Eq, PartialEq, Debug, Clone, Copy, PartialOrd, Ord, Hash, Default)]
pub struct VoteCount(pub u64);

impl VoteCount {
    pub const EMPTY: VoteCount = VoteCount(0);
}

impl std::iter::Sum for VoteCount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        VoteCount(iter.fold(0u64, |acc, vc| acc.saturating_add(vc.0)))
    }
}

impl AddAssign for VoteCount {
    fn add_assign(&mut self, rhs: VoteCount) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Add for VoteCount {
    type Output = VoteCount;
    fn add(self: VoteCount, rhs: VoteCount) -> VoteCount {
        VoteCount(self.0.saturating_add(rhs.0))
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct NormalizedVoteRecord {
    pub epoch: Epoch,
    pub locality_code: i64,
    pub station_code: i64,
    pub bloc: String,
    pub party: Option<String>,
    pub votes: VoteCount,
}

/// One row per (epoch, locality, station, bloc, party).
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct AggregatedVoteRecord {
    pub epoch: Epoch,
    pub locality_code: i64,
    pub station_code: i64,
    pub bloc: String,
    pub party: Option<String>,
    pub votes: VoteCount,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct StationRecord {
    pub epoch: Epoch,
    pub locality_code: i64,
    pub station_code: i64,
    pub locality_name: String,
    pub address_name: String,
    pub full_address: String,
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// A resolved address, as persisted in the geocode store.
#[derive(PartialEq, Debug, Clone)]
pub struct GeocodeEntry {
    /// The address as it was sent to the provider. Keyed by its canonical form.
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeocodeEntry {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

// ******** Output data structures *********

#[derive(PartialEq, Debug, Clone)]
pub struct CombinedRecord {
    pub epoch: Epoch,
    pub locality_code: i64,
    pub station_code: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub bloc: String,
    pub party: Option<String>,
    pub votes: VoteCount,
}

/// The join that failed for an unmatched record.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum JoinStage {
    Station,
    Geocode,
}

impl Display for JoinStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinStage::Station => write!(f, "station"),
            JoinStage::Geocode => write!(f, "geocode"),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct UnmatchedRecord {
    pub stage: JoinStage,
    pub record: AggregatedVoteRecord,
    /// The station address, for records that failed the geocode join.
    pub address: Option<String>,
}

// ********* Errors **********

/// Errors in the description of an epoch. They abort the affected epoch only.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ConfigurationError {
    UnknownEpoch(Epoch),
    DuplicateEpoch(Epoch),
    NoVoteColumns(Epoch),
    MissingColumnRole { epoch: Epoch, role: String },
    /// A header label was used on a table that has no header row.
    LabelWithoutHeader { epoch: Epoch, label: String },
    UnknownHeader { epoch: Epoch, label: String },
    InvalidScale { epoch: Epoch, role: String, factor: String },
    /// A borrowed directory points at an epoch that does not own one.
    BorrowedDirectory { epoch: Epoch, from: Epoch },
    /// Both an own directory and a borrowed one.
    ConflictingDirectory(Epoch),
}

impl Error for ConfigurationError {}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationError::UnknownEpoch(e) => write!(f, "unknown epoch {}", e),
            ConfigurationError::DuplicateEpoch(e) => {
                write!(f, "epoch {} is defined more than once", e)
            }
            ConfigurationError::NoVoteColumns(e) => {
                write!(f, "epoch {}: no vote columns configured", e)
            }
            ConfigurationError::MissingColumnRole { epoch, role } => {
                write!(f, "epoch {}: missing column for role {}", epoch, role)
            }
            ConfigurationError::LabelWithoutHeader { epoch, label } => write!(
                f,
                "epoch {}: column {:?} is referenced by label but the table has no header row",
                epoch, label
            ),
            ConfigurationError::UnknownHeader { epoch, label } => {
                write!(f, "epoch {}: no header matches {:?}", epoch, label)
            }
            ConfigurationError::InvalidScale {
                epoch,
                role,
                factor,
            } => write!(
                f,
                "epoch {}: scale factor {} for {} is neither a whole multiplier nor a whole divisor",
                epoch, factor, role
            ),
            ConfigurationError::BorrowedDirectory { epoch, from } => write!(
                f,
                "epoch {}: borrows the station directory of epoch {}, which does not define one",
                epoch, from
            ),
            ConfigurationError::ConflictingDirectory(e) => write!(
                f,
                "epoch {}: defines its own station directory and borrows another one",
                e
            ),
        }
    }
}

/// Errors raised while resolving addresses.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum GeocodeError {
    /// The provider failed for this address. It will be retried on the next run.
    Provider(String),
    /// The provider refuses further requests for now.
    QuotaExceeded(String),
    /// The durable store could not be read or written.
    Store(String),
}

impl Error for GeocodeError {}

impl Display for GeocodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeocodeError::Provider(msg) => write!(f, "geocoding provider error: {}", msg),
            GeocodeError::QuotaExceeded(msg) => write!(f, "geocoding quota exceeded: {}", msg),
            GeocodeError::Store(msg) => write!(f, "geocode store error: {}", msg),
        }
    }
}
