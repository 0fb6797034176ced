use anyhow::{anyhow, Context, Result};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name the pivot export is saved under
pub const PIVOT_CSV_FILENAME: &str = "pivot.csv";

/// A table as displayed: every row in order, header rows first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedTable {
    pub rows: Vec<Vec<String>>,
}

impl RenderedTable {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }

    pub fn from_header_and_rows(header: Vec<String>, body: Vec<Vec<String>>) -> Self {
        let mut rows = Vec::with_capacity(body.len() + 1);
        rows.push(header);
        rows.extend(body);
        Self { rows }
    }

    /// Parses CSV as the server's download endpoint produces it. Ragged rows
    /// are kept as they are.
    pub fn from_csv(text: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("Malformed CSV in query results")?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self { rows })
    }

    pub fn header(&self) -> &[String] {
        self.rows.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn body(&self) -> &[Vec<String>] {
        self.rows.get(1..).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reorders the body rows by one column, keeping the header first. Ties
    /// keep their current order.
    pub fn sort_by(&mut self, column: usize, order: SortOrder) {
        if let Some(body) = self.rows.get_mut(1..) {
            body.sort_by(|a, b| {
                let ordering = compare_cells(
                    a.get(column).map(String::as_str),
                    b.get(column).map(String::as_str),
                );
                match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }
    }

    /// Like `sort_by`, naming the column by its header (case-insensitive).
    pub fn sort_by_name(&mut self, name: &str, order: SortOrder) -> Result<()> {
        let column = self
            .header()
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("No column named '{}'", name))?;
        self.sort_by(column, order);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl std::str::FromStr for SortOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Ascending),
            "desc" | "descending" => Ok(SortOrder::Descending),
            _ => Err(anyhow!("Sort order must be asc or desc, got '{}'", s)),
        }
    }
}

/// Empty and missing cells sort first, then numbers by value, then text.
fn compare_cells(a: Option<&str>, b: Option<&str>) -> Ordering {
    fn rank(cell: Option<&str>) -> (u8, Option<f64>) {
        match cell.map(str::trim) {
            None | Some("") => (0, None),
            Some(text) => match text.parse::<f64>() {
                Ok(n) if !n.is_nan() => (1, Some(n)),
                _ => (2, None),
            },
        }
    }

    let (rank_a, num_a) = rank(a);
    let (rank_b, num_b) = rank(b);
    match (rank_a.cmp(&rank_b), num_a, num_b) {
        (Ordering::Equal, Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Ordering::Equal, _, _) => a.unwrap_or_default().cmp(b.unwrap_or_default()),
        (other, _, _) => other,
    }
}

/// One line per row, cells comma-separated, no trailing newline. Cells
/// containing a comma, quote or newline are quoted.
pub fn table_to_csv(table: &RenderedTable) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    for row in &table.rows {
        writer.write_record(row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to finish CSV: {}", e))?;
    let mut text = String::from_utf8(bytes).context("CSV output was not UTF-8")?;
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}

/// Saves the table as `pivot.csv` in `dir` and returns the path.
pub fn download_csv(table: &RenderedTable, dir: &Path) -> Result<PathBuf> {
    let csv_data = table_to_csv(table)?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create download directory {}", dir.display()))?;
    let path = dir.join(PIVOT_CSV_FILENAME);
    fs::write(&path, csv_data).with_context(|| format!("Cannot write {}", path.display()))?;
    info!(target: "export", "Exported {} rows to {}", table.rows.len(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_simple_table() {
        let table = RenderedTable::new(vec![row(&["A", "B"]), row(&["1", "2"])]);
        assert_eq!(table_to_csv(&table).unwrap(), "A,B\n1,2");
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(table_to_csv(&RenderedTable::default()).unwrap(), "");
    }

    #[test]
    fn test_special_characters_are_quoted() {
        let table = RenderedTable::new(vec![row(&["name", "note"]), row(&["x", "a, \"b\""])]);
        assert_eq!(
            table_to_csv(&table).unwrap(),
            "name,note\nx,\"a, \"\"b\"\"\""
        );
    }

    #[test]
    fn test_from_csv_roundtrip_shape() {
        let table = RenderedTable::from_csv("id,name\n1,alice\n2,bob\n").unwrap();
        assert_eq!(table.header(), &["id".to_string(), "name".to_string()]);
        assert_eq!(table.body().len(), 2);
    }

    #[test]
    fn test_sort_is_numeric_aware() {
        let mut table =
            RenderedTable::from_csv("name,count\nb,10\na,9\nc,\nd,100\ne,n/a\n").unwrap();
        table.sort_by(1, SortOrder::Ascending);
        let names: Vec<&str> = table.body().iter().map(|r| r[0].as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b", "d", "e"]);
        assert_eq!(table.header(), &["name".to_string(), "count".to_string()]);

        table.sort_by_name("COUNT", SortOrder::Descending).unwrap();
        let names: Vec<&str> = table.body().iter().map(|r| r[0].as_str()).collect();
        assert_eq!(names, vec!["e", "d", "b", "a", "c"]);
    }

    #[test]
    fn test_sort_keeps_ties_in_order() {
        let mut table = RenderedTable::new(vec![
            row(&["k", "v"]),
            row(&["x", "2"]),
            row(&["y", "1"]),
            row(&["z", "2.0"]),
        ]);
        table.sort_by(1, SortOrder::Ascending);
        assert_eq!(table.body()[1][0], "x");
        assert_eq!(table.body()[2][0], "z");
    }

    #[test]
    fn test_sort_by_unknown_column() {
        let mut table = RenderedTable::new(vec![row(&["a"]), row(&["1"])]);
        assert!(table.sort_by_name("b", SortOrder::Ascending).is_err());
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Descending);
        assert!("up".parse::<SortOrder>().is_err());
    }

    #[test]
    fn test_download_writes_pivot_csv() {
        let dir = tempfile::tempdir().unwrap();
        let table = RenderedTable::new(vec![row(&["A"]), row(&["1"])]);
        let path = download_csv(&table, dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "pivot.csv");
        assert_eq!(fs::read_to_string(path).unwrap(), "A\n1");
    }
}
