// Reading the registry of epochs.

use crate::pipeline::*;

/// A column, by 0-based position or by header label.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    Index(usize),
    Label(String),
}

impl ColumnSpec {
    fn to_ref(&self) -> ColumnRef {
        match self {
            ColumnSpec::Index(idx) => ColumnRef::Index(*idx),
            ColumnSpec::Label(label) => ColumnRef::Label(label.clone()),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct VoteColumnSpec {
    pub column: ColumnSpec,
    pub bloc: String,
    pub party: Option<String>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSpec {
    pub path: String,
    pub sheet: Option<String>,
    #[serde(rename = "headerRow")]
    pub header_row: Option<usize>,
    #[serde(rename = "skipRows")]
    pub skip_rows: Option<usize>,
    pub locality: Option<ColumnSpec>,
    pub station: Option<ColumnSpec>,
    #[serde(rename = "localityScale")]
    pub locality_scale: Option<f64>,
    #[serde(rename = "stationScale")]
    pub station_scale: Option<f64>,
    #[serde(rename = "voteColumns")]
    pub vote_columns: Option<Vec<VoteColumnSpec>>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySpec {
    pub path: String,
    pub sheet: Option<String>,
    #[serde(rename = "headerRow")]
    pub header_row: Option<usize>,
    #[serde(rename = "skipRows")]
    pub skip_rows: Option<usize>,
    pub locality: Option<ColumnSpec>,
    pub station: Option<ColumnSpec>,
    #[serde(rename = "localityName")]
    pub locality_name: Option<ColumnSpec>,
    #[serde(rename = "addressName")]
    pub address_name: Option<ColumnSpec>,
    #[serde(rename = "localityScale")]
    pub locality_scale: Option<f64>,
    #[serde(rename = "stationScale")]
    pub station_scale: Option<f64>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct EpochSpec {
    pub epoch: u32,
    pub results: ResultsSpec,
    pub sentinel: Option<i64>,
    pub directory: Option<DirectorySpec>,
    #[serde(rename = "directoryFrom")]
    pub directory_from: Option<u32>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySpec {
    #[serde(rename = "blocsFile")]
    pub blocs_file: Option<String>,
    pub epochs: Vec<EpochSpec>,
}

/// A line of the bloc file: which column of which epoch holds the votes of a party.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct BlocLine {
    #[serde(rename = "Epoch", alias = "Knesset #")]
    pub epoch: u32,
    #[serde(rename = "Bloc")]
    pub bloc: String,
    #[serde(rename = "Column", alias = "Excel Name")]
    pub column: String,
    #[serde(rename = "Party", default)]
    pub party: Option<String>,
}

impl BlocLine {
    fn to_vote_column(&self) -> VoteColumnSpec {
        VoteColumnSpec {
            column: ColumnSpec::Label(self.column.clone()),
            bloc: self.bloc.clone(),
            party: match &self.party {
                Some(p) if !p.trim().is_empty() => Some(p.clone()),
                // The ballot letters of the column name the party.
                _ => Some(self.column.trim().to_string()),
            },
        }
    }
}

/// The validated registry, along with the entries that could not be validated.
#[derive(Debug, Clone)]
pub struct LoadedRegistry {
    pub registry: EpochRegistry,
    pub rejected: Vec<(Epoch, ConfigurationError)>,
}

pub fn read_registry(path: &Path) -> PipelineResult<LoadedRegistry> {
    let p = path.display().to_string();
    let contents = fs::read_to_string(path).context(OpeningRegistrySnafu { path: p.clone() })?;
    let spec: RegistrySpec =
        serde_json::from_str(&contents).context(ParsingRegistrySnafu { path: p })?;
    let root = path.parent().unwrap_or_else(|| Path::new("."));
    let blocs = match &spec.blocs_file {
        Some(f) => read_blocs(&root.join(f))?,
        None => Vec::new(),
    };
    info!(
        "Registry {:?}: {} epochs, {} bloc lines",
        path,
        spec.epochs.len(),
        blocs.len()
    );
    Ok(validate_registry(root, &spec, &blocs))
}

pub fn read_blocs(path: &Path) -> PipelineResult<Vec<BlocLine>> {
    let p = path.display().to_string();
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .context(ReadingBlocsSnafu { path: p.clone() })?;
    let mut res: Vec<BlocLine> = Vec::new();
    for line_r in rdr.deserialize::<BlocLine>() {
        let line = line_r.context(ReadingBlocsSnafu { path: p.clone() })?;
        res.push(line);
    }
    Ok(res)
}

pub fn validate_registry(root: &Path, spec: &RegistrySpec, blocs: &[BlocLine]) -> LoadedRegistry {
    let mut configs: Vec<EpochConfig> = Vec::new();
    let mut rejected: Vec<(Epoch, ConfigurationError)> = Vec::new();
    for es in spec.epochs.iter() {
        let extra: Vec<VoteColumnSpec> = blocs
            .iter()
            .filter(|b| b.epoch == es.epoch)
            .map(|b| b.to_vote_column())
            .collect();
        match validate_epoch(root, es, &extra) {
            Ok(c) => configs.push(c),
            Err(e) => {
                warn!("Registry: rejecting epoch {}: {}", es.epoch, e);
                rejected.push((Epoch(es.epoch), e));
            }
        }
    }
    let (registry, mut more) = EpochRegistry::partition(configs);
    for (e, err) in more.iter() {
        warn!("Registry: rejecting epoch {}: {}", e, err);
    }
    rejected.append(&mut more);
    LoadedRegistry { registry, rejected }
}

fn required(
    epoch: Epoch,
    role: ColumnRole,
    column: &Option<ColumnSpec>,
) -> Result<ColumnRef, ConfigurationError> {
    column
        .as_ref()
        .map(|c| c.to_ref())
        .ok_or_else(|| ConfigurationError::MissingColumnRole {
            epoch,
            role: role.to_string(),
        })
}

fn scale(
    epoch: Epoch,
    role: &str,
    factor: Option<f64>,
) -> Result<ScaleFactor, ConfigurationError> {
    match factor {
        None => Ok(ScaleFactor::IDENTITY),
        Some(f) => ScaleFactor::from_factor(f).ok_or_else(|| ConfigurationError::InvalidScale {
            epoch,
            role: role.to_string(),
            factor: f.to_string(),
        }),
    }
}

fn table_source(
    root: &Path,
    path: &str,
    sheet: &Option<String>,
    header_row: Option<usize>,
    skip_rows: Option<usize>,
) -> TableSource {
    TableSource {
        path: root.join(path),
        sheet: sheet.clone(),
        header_row,
        skip_rows: skip_rows.unwrap_or(0),
    }
}

fn validate_epoch(
    root: &Path,
    es: &EpochSpec,
    extra_columns: &[VoteColumnSpec],
) -> Result<EpochConfig, ConfigurationError> {
    let epoch = Epoch(es.epoch);
    let r = &es.results;
    let locality = required(epoch, ColumnRole::LocalityCode, &r.locality)?;
    let station = required(epoch, ColumnRole::StationCode, &r.station)?;
    let vote_columns: Vec<VoteColumn> = r
        .vote_columns
        .iter()
        .flatten()
        .chain(extra_columns.iter())
        .map(|vc| VoteColumn {
            column: vc.column.to_ref(),
            bloc: vc.bloc.clone(),
            party: vc.party.clone(),
        })
        .collect();
    let results = ResultsLayout {
        source: table_source(root, &r.path, &r.sheet, r.header_row, r.skip_rows),
        locality,
        station,
        vote_columns,
        scale: ScaleFactors {
            locality: scale(epoch, "locality", r.locality_scale)?,
            station: scale(epoch, "station", r.station_scale)?,
        },
    };

    let directory = match (&es.directory, es.directory_from) {
        (Some(_), Some(_)) => return Err(ConfigurationError::ConflictingDirectory(epoch)),
        (Some(d), None) => DirectorySource::Table(DirectoryLayout {
            source: table_source(root, &d.path, &d.sheet, d.header_row, d.skip_rows),
            locality: required(epoch, ColumnRole::LocalityCode, &d.locality)?,
            station: required(epoch, ColumnRole::StationCode, &d.station)?,
            locality_name: required(epoch, ColumnRole::LocalityName, &d.locality_name)?,
            address_name: required(epoch, ColumnRole::AddressName, &d.address_name)?,
            scale: ScaleFactors {
                locality: scale(epoch, "locality", d.locality_scale)?,
                station: scale(epoch, "station", d.station_scale)?,
            },
        }),
        (None, Some(from)) => DirectorySource::Borrowed(Epoch(from)),
        (None, None) => DirectorySource::Missing,
    };

    debug!(
        "validate_epoch: epoch {}: {} vote columns, directory {:?}",
        epoch,
        results.vote_columns.len(),
        directory
    );
    Ok(EpochConfig {
        epoch,
        results,
        sentinel: es.sentinel,
        directory,
    })
}
