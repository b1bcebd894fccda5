// Primitives for reading delimited text files.

use crate::pipeline::io_common::Table;
use crate::pipeline::*;

/// Reads all the lines of a delimited file as text cells.
///
/// Lines may have different lengths. Tab-separated files are read without quoting:
/// Hebrew abbreviations carry a double quote in the middle of words.
pub fn read_delimited(path: &Path, delimiter: u8) -> PipelineResult<Table> {
    let p = path.display().to_string();
    let rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .quoting(delimiter != b'\t')
        .from_path(path)
        .context(OpeningCsvSnafu { path: p.clone() })?;
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    for (idx, line_r) in rdr.into_records().enumerate() {
        let line = line_r.context(CsvLineParseSnafu {
            path: p.clone(),
            lineno: idx + 1,
        })?;
        rows.push(line.iter().map(read_field).collect());
    }
    debug!("read_delimited: {} lines in {}", rows.len(), p);
    Ok(Table { rows })
}

fn read_field(field: &str) -> Cell {
    if field.trim().is_empty() {
        Cell::Empty
    } else {
        Cell::Text(field.to_string())
    }
}
