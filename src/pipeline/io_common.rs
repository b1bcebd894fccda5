// Primitives shared by the table readers.

use crate::pipeline::*;

use crate::pipeline::io_csv::read_delimited;
use crate::pipeline::io_excel::read_workbook;

/// The physical content of a table, before any column is interpreted.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct Table {
    pub rows: Vec<Vec<Cell>>,
}

/// The data rows of a table, with their 1-based line numbers.
#[derive(PartialEq, Debug, Clone)]
pub struct DataRows {
    pub headers: Option<Vec<String>>,
    pub rows: Vec<(usize, Vec<Cell>)>,
}

/// Separates the header row and the skipped rows from the data.
pub fn split_rows(table: Table, source: &TableSource) -> DataRows {
    let (headers, start) = match source.header_row {
        Some(h) => {
            let hs: Vec<String> = table
                .rows
                .get(h)
                .map(|r| r.iter().map(|c| c.as_text()).collect())
                .unwrap_or_default();
            (Some(hs), h + 1 + source.skip_rows)
        }
        None => (None, source.skip_rows),
    };
    let rows: Vec<(usize, Vec<Cell>)> = table
        .rows
        .into_iter()
        .enumerate()
        .skip(start)
        .map(|(idx, r)| (idx + 1, r))
        .collect();
    DataRows { headers, rows }
}

pub fn read_table(source: &TableSource) -> PipelineResult<Table> {
    let path = source.path.display().to_string();
    let ext = source
        .path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "xls" | "xlsx" | "xlsm" | "xlsb" | "ods" => read_workbook(&source.path, &source.sheet),
        "csv" => read_delimited(&source.path, b','),
        "tsv" | "tab" => read_delimited(&source.path, b'\t'),
        _ => UnsupportedFormatSnafu { path }.fail(),
    }
}

/// Reads a table and keeps the cells of the given roles only.
pub fn read_raw_rows(
    epoch: Epoch,
    source: &TableSource,
    roles: &[(ColumnRole, &ColumnRef)],
) -> PipelineResult<Vec<RawRow>> {
    let table = read_table(source)?;
    let data = split_rows(table, source);
    debug!(
        "read_raw_rows: epoch {}: headers: {:?}",
        epoch, data.headers
    );
    let columns = resolve_columns(epoch, roles, data.headers.as_deref()).context(ConfigurationSnafu {})?;
    let res: Vec<RawRow> = data
        .rows
        .iter()
        // Fully blank lines are layout, not data.
        .filter(|(_, cells)| cells.iter().any(|c| *c != Cell::Empty))
        .map(|(lineno, cells)| RawRow::from_cells(*lineno, &columns, cells))
        .collect();
    debug!(
        "read_raw_rows: epoch {}: {} data rows in {:?}",
        epoch,
        res.len(),
        source.path
    );
    Ok(res)
}

/// Runs `f` on every item, with at most `jobs` items in flight.
///
/// Results are returned in the order of the items.
pub fn run_bounded<T, R, F>(items: &[T], jobs: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let f = &f;
    let mut res: Vec<R> = Vec::with_capacity(items.len());
    for chunk in items.chunks(jobs.max(1)) {
        let mut chunk_res: Vec<R> = std::thread::scope(|s| {
            let handles: Vec<_> = chunk.iter().map(|item| s.spawn(move || f(item))).collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(e) => std::panic::resume_unwind(e),
                })
                .collect()
        });
        res.append(&mut chunk_res);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    fn source(path: &Path, header_row: Option<usize>, skip_rows: usize) -> TableSource {
        TableSource {
            path: path.to_path_buf(),
            sheet: None,
            header_row,
            skip_rows,
        }
    }

    #[test]
    fn header_and_skipped_rows() {
        let table = Table {
            rows: vec![
                vec![text("title")],
                vec![text("a"), text("b")],
                vec![text("note")],
                vec![Cell::Number(1.0), Cell::Number(2.0)],
            ],
        };
        let data = split_rows(table.clone(), &source(Path::new("x.csv"), Some(1), 1));
        assert_eq!(data.headers, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(data.rows, vec![(4, vec![Cell::Number(1.0), Cell::Number(2.0)])]);

        let data = split_rows(table, &source(Path::new("x.csv"), None, 3));
        assert_eq!(data.headers, None);
        assert_eq!(data.rows.len(), 1);
        assert_eq!(data.rows[0].0, 4);
    }

    #[test]
    fn raw_rows_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("results.csv");
        fs::write(&p, "station, locality ,votes\n3,55,10\n\n,,\n4,55\n").unwrap();
        let loc = ColumnRef::Label("locality".to_string());
        let st = ColumnRef::Index(0);
        let votes = ColumnRef::Label("votes".to_string());
        let roles = vec![
            (ColumnRole::LocalityCode, &loc),
            (ColumnRole::StationCode, &st),
            (ColumnRole::Votes(0), &votes),
        ];
        let rows = read_raw_rows(Epoch(1), &source(&p, Some(0), 0), &roles).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].lineno, 2);
        assert_eq!(rows[0].cell(ColumnRole::LocalityCode), Some(&text("55")));
        // Short rows are padded with empty cells.
        assert_eq!(rows[1].cell(ColumnRole::Votes(0)), Some(&Cell::Empty));

        let unknown = ColumnRef::Label("district".to_string());
        let res = read_raw_rows(
            Epoch(1),
            &source(&p, Some(0), 0),
            &[(ColumnRole::LocalityCode, &unknown)],
        );
        assert!(matches!(res, Err(PipelineError::Configuration { .. })));
    }

    #[test]
    fn unsupported_format() {
        let res = read_table(&source(Path::new("results.pdf"), None, 0));
        assert!(matches!(res, Err(PipelineError::UnsupportedFormat { .. })));
    }

    #[test]
    fn bounded_pool_keeps_order() {
        let items: Vec<u64> = (0..10).collect();
        let calls = AtomicUsize::new(0);
        let res = run_bounded(&items, 3, |x| {
            calls.fetch_add(1, Ordering::SeqCst);
            x * x
        });
        assert_eq!(res, items.iter().map(|x| x * x).collect::<Vec<u64>>());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert!(run_bounded(&Vec::<u64>::new(), 0, |x| *x).is_empty());
    }
}
