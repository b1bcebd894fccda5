// Writing the tables and the run summary.

use crate::pipeline::*;

fn epoch_file(out_dir: &Path, kind: &str, epoch: Epoch) -> PipelineResult<PathBuf> {
    let dir = out_dir.join(kind);
    fs::create_dir_all(&dir).context(IoSnafu {
        path: dir.display().to_string(),
    })?;
    Ok(dir.join(format!("{}.tsv", epoch)))
}

fn write_tsv(path: &Path, header: &[&str], rows: Vec<Vec<String>>) -> PipelineResult<()> {
    let p = path.display().to_string();
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .context(WritingTableSnafu { path: p.clone() })?;
    writer
        .write_record(header)
        .context(WritingTableSnafu { path: p.clone() })?;
    let num_rows = rows.len();
    for row in rows {
        writer
            .write_record(&row)
            .context(WritingTableSnafu { path: p.clone() })?;
    }
    writer.flush().context(IoSnafu { path: p.clone() })?;
    debug!("write_tsv: {} rows to {}", num_rows, p);
    Ok(())
}

fn party_text(party: &Option<String>) -> String {
    party.clone().unwrap_or_default()
}

pub fn write_combined(out_dir: &Path, epoch: Epoch, records: &[CombinedRecord]) -> PipelineResult<()> {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.epoch.to_string(),
                r.locality_code.to_string(),
                r.station_code.to_string(),
                r.latitude.to_string(),
                r.longitude.to_string(),
                r.bloc.clone(),
                party_text(&r.party),
                r.votes.0.to_string(),
            ]
        })
        .collect();
    write_tsv(
        &epoch_file(out_dir, "combined", epoch)?,
        &[
            "epoch",
            "locality_code",
            "station_code",
            "latitude",
            "longitude",
            "bloc",
            "party",
            "votes",
        ],
        rows,
    )
}

pub fn write_unmatched(
    out_dir: &Path,
    epoch: Epoch,
    records: &[UnmatchedRecord],
) -> PipelineResult<()> {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|u| {
            vec![
                u.stage.to_string(),
                u.record.epoch.to_string(),
                u.record.locality_code.to_string(),
                u.record.station_code.to_string(),
                u.record.bloc.clone(),
                party_text(&u.record.party),
                u.record.votes.0.to_string(),
                u.address.clone().unwrap_or_default(),
            ]
        })
        .collect();
    write_tsv(
        &epoch_file(out_dir, "unmatched", epoch)?,
        &[
            "stage",
            "epoch",
            "locality_code",
            "station_code",
            "bloc",
            "party",
            "votes",
            "address",
        ],
        rows,
    )
}

pub fn write_elections(
    out_dir: &Path,
    epoch: Epoch,
    records: &[AggregatedVoteRecord],
) -> PipelineResult<()> {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                r.epoch.to_string(),
                r.locality_code.to_string(),
                r.station_code.to_string(),
                r.bloc.clone(),
                party_text(&r.party),
                r.votes.0.to_string(),
            ]
        })
        .collect();
    write_tsv(
        &epoch_file(out_dir, "elections", epoch)?,
        &["epoch", "locality_code", "station_code", "bloc", "party", "votes"],
        rows,
    )
}

/// Writes the directory used by an epoch. Borrowed directories keep the epoch of
/// their publisher in the first column.
pub fn write_stations(out_dir: &Path, epoch: Epoch, stations: &[StationRecord]) -> PipelineResult<()> {
    let rows: Vec<Vec<String>> = stations
        .iter()
        .map(|s| {
            vec![
                s.epoch.to_string(),
                s.locality_code.to_string(),
                s.station_code.to_string(),
                s.locality_name.clone(),
                s.address_name.clone(),
                s.full_address.clone(),
            ]
        })
        .collect();
    write_tsv(
        &epoch_file(out_dir, "stations", epoch)?,
        &[
            "epoch",
            "locality_code",
            "station_code",
            "locality_name",
            "address_name",
            "full_address",
        ],
        rows,
    )
}

pub fn write_summary(out_dir: &Path, summary: &RunSummary) -> PipelineResult<()> {
    fs::create_dir_all(out_dir).context(IoSnafu {
        path: out_dir.display().to_string(),
    })?;
    let path = out_dir.join("summary.json");
    let pretty = serde_json::to_string_pretty(summary).context(WritingJsonSnafu {})?;
    fs::write(&path, pretty).context(IoSnafu {
        path: path.display().to_string(),
    })?;
    info!("Summary written to {:?}", path);
    Ok(())
}
