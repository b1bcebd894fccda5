// Primitives for reading spreadsheet files.

use calamine::{open_workbook_auto, DataType, Reader};

use crate::pipeline::io_common::Table;
use crate::pipeline::*;

/// Reads a worksheet, with row and column positions as they appear in the spreadsheet
/// application.
pub fn read_workbook(path: &Path, sheet: &Option<String>) -> PipelineResult<Table> {
    let p = path.display().to_string();
    let mut workbook = open_workbook_auto(path).context(OpeningWorkbookSnafu { path: p.clone() })?;
    let names: Vec<String> = workbook.sheet_names().to_vec();
    debug!("read_workbook: {}: sheets {:?}", p, names);
    if names.is_empty() {
        return EmptyWorkbookSnafu { path: p }.fail();
    }
    let name = find_sheet(&names, sheet).context(MissingSheetSnafu {
        path: p.clone(),
        sheet: sheet.clone().unwrap_or_default(),
    })?;
    let wrange = workbook
        .worksheet_range(&name)
        .context(EmptyWorkbookSnafu { path: p.clone() })?
        .context(OpeningWorkbookSnafu { path: p.clone() })?;

    // The range starts at the first non-empty cell.
    let (row0, col0) = wrange
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));
    let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); row0];
    for row in wrange.rows() {
        let mut cells: Vec<Cell> = vec![Cell::Empty; col0];
        cells.extend(row.iter().map(read_cell));
        rows.push(cells);
    }
    debug!(
        "read_workbook: {}: sheet {:?}: {} rows from ({}, {})",
        p,
        name,
        rows.len(),
        row0,
        col0
    );
    Ok(Table { rows })
}

// Sheet names in historical files carry stray spaces.
fn find_sheet(names: &[String], sheet: &Option<String>) -> Option<String> {
    match sheet {
        None => names.first().cloned(),
        Some(s) => names
            .iter()
            .find(|n| *n == s)
            .or_else(|| names.iter().find(|n| n.trim() == s.trim()))
            .cloned(),
    }
}

fn read_cell(cell: &DataType) -> Cell {
    match cell {
        DataType::Int(i) => Cell::Number(*i as f64),
        DataType::Float(f) => Cell::Number(*f),
        DataType::DateTime(f) => Cell::Number(*f),
        DataType::String(s) if s.trim().is_empty() => Cell::Empty,
        DataType::String(s) => Cell::Text(s.clone()),
        DataType::Bool(b) => Cell::Text(b.to_string()),
        DataType::Error(_) | DataType::Empty => Cell::Empty,
    }
}
