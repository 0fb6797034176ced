//! Pivot view over a query's results, with bookmarkable state.
//!
//! Only five fields of the pivot configuration survive a bookmark:
//! aggregator, rows, cols, renderer and vals. They travel as base64 JSON in
//! the URL fragment.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::data_exporter::RenderedTable;

pub const DEFAULT_AGGREGATOR: &str = "Count";
pub const DEFAULT_RENDERER: &str = "Table";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PivotState {
    pub aggregator_name: String,
    pub rows: Vec<String>,
    pub cols: Vec<String>,
    pub renderer_name: String,
    pub vals: Vec<String>,
}

impl Default for PivotState {
    fn default() -> Self {
        Self {
            aggregator_name: DEFAULT_AGGREGATOR.to_string(),
            rows: Vec::new(),
            cols: Vec::new(),
            renderer_name: DEFAULT_RENDERER.to_string(),
            vals: Vec::new(),
        }
    }
}

impl PivotState {
    pub fn encode(&self) -> String {
        // Serializing plain strings and vectors cannot fail
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        BASE64.encode(json)
    }

    /// Decodes a fragment (with or without the leading `#`). Anything that
    /// is not base64 JSON of the right shape yields `None`.
    pub fn try_decode(fragment: &str) -> Option<Self> {
        let encoded = fragment.trim().trim_start_matches('#');
        if encoded.is_empty() {
            return None;
        }
        let bytes = BASE64.decode(encoded).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn decode(fragment: &str) -> Self {
        Self::try_decode(fragment).unwrap_or_default()
    }
}

/// `base_url#<encoded state>`, the href of the bookmark link.
pub fn bookmark_url(base_url: &str, state: &PivotState) -> String {
    let base = base_url.split('#').next().unwrap_or(base_url);
    format!("{}#{}", base, state.encode())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Count,
    CountUnique,
    Sum,
    Average,
    Minimum,
    Maximum,
}

impl Aggregator {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Count" => Some(Aggregator::Count),
            "Count Unique Values" => Some(Aggregator::CountUnique),
            "Sum" => Some(Aggregator::Sum),
            "Average" => Some(Aggregator::Average),
            "Minimum" => Some(Aggregator::Minimum),
            "Maximum" => Some(Aggregator::Maximum),
            _ => None,
        }
    }

    pub fn names() -> &'static [&'static str] {
        &[
            "Count",
            "Count Unique Values",
            "Sum",
            "Average",
            "Minimum",
            "Maximum",
        ]
    }

    fn needs_value(self) -> bool {
        !matches!(self, Aggregator::Count)
    }
}

#[derive(Debug, Default, Clone)]
struct Accumulator {
    count: usize,
    sum: f64,
    numeric: usize,
    min: Option<f64>,
    max: Option<f64>,
    unique: BTreeSet<String>,
}

impl Accumulator {
    fn push(&mut self, value: Option<&str>) {
        self.count += 1;
        let Some(value) = value else { return };
        self.unique.insert(value.to_string());
        if let Ok(n) = value.trim().parse::<f64>() {
            self.numeric += 1;
            self.sum += n;
            self.min = Some(self.min.map_or(n, |m| m.min(n)));
            self.max = Some(self.max.map_or(n, |m| m.max(n)));
        }
    }

    fn merge(&mut self, other: &Accumulator) {
        self.count += other.count;
        self.sum += other.sum;
        self.numeric += other.numeric;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.unique.extend(other.unique.iter().cloned());
    }

    fn format(&self, aggregator: Aggregator) -> String {
        let fmt = |n: f64| format!("{:.2}", n);
        match aggregator {
            Aggregator::Count => self.count.to_string(),
            Aggregator::CountUnique => self.unique.len().to_string(),
            Aggregator::Sum => fmt(self.sum),
            Aggregator::Average if self.numeric > 0 => fmt(self.sum / self.numeric as f64),
            Aggregator::Minimum => self.min.map(fmt).unwrap_or_default(),
            Aggregator::Maximum => self.max.map(fmt).unwrap_or_default(),
            Aggregator::Average => String::new(),
        }
    }
}

/// Aggregates `source` (header row first) according to `state`.
///
/// Output layout: the header row holds the row fields followed by one
/// column per distinct column key and a `Totals` column; a final `Totals`
/// row closes the table. Multi-field keys are joined with `-`. Unknown
/// aggregators fall back to Count.
pub fn pivot_table(source: &RenderedTable, state: &PivotState) -> RenderedTable {
    let header = source.header();
    let index_of = |field: &String| header.iter().position(|h| h == field);

    let row_idx: Vec<usize> = state.rows.iter().filter_map(index_of).collect();
    let col_idx: Vec<usize> = state.cols.iter().filter_map(index_of).collect();

    let aggregator = Aggregator::from_name(&state.aggregator_name).unwrap_or_else(|| {
        warn!(target: "pivot", "Unknown aggregator '{}', using Count", state.aggregator_name);
        Aggregator::Count
    });
    let val_idx = state.vals.first().and_then(index_of);
    let aggregator = if aggregator.needs_value() && val_idx.is_none() {
        Aggregator::Count
    } else {
        aggregator
    };

    let key_of = |record: &Vec<String>, idx: &[usize]| -> Vec<String> {
        idx.iter()
            .map(|&i| record.get(i).cloned().unwrap_or_default())
            .collect()
    };

    let mut cells: BTreeMap<(Vec<String>, Vec<String>), Accumulator> = BTreeMap::new();
    let mut row_keys: BTreeSet<Vec<String>> = BTreeSet::new();
    let mut col_keys: BTreeSet<Vec<String>> = BTreeSet::new();

    for record in source.body() {
        let rk = key_of(record, row_idx.as_slice());
        let ck = key_of(record, col_idx.as_slice());
        let value = val_idx.and_then(|i| record.get(i)).map(String::as_str);
        cells
            .entry((rk.clone(), ck.clone()))
            .or_default()
            .push(value);
        row_keys.insert(rk);
        col_keys.insert(ck);
    }

    let label = |key: &Vec<String>| key.join("-");
    let has_cols = !col_idx.is_empty();

    let mut out_header: Vec<String> = row_idx.iter().map(|&i| header[i].clone()).collect();
    if out_header.is_empty() {
        out_header.push(String::new());
    }
    if has_cols {
        out_header.extend(col_keys.iter().map(|k| label(k)));
    }
    out_header.push("Totals".to_string());

    let mut out_rows = Vec::with_capacity(row_keys.len() + 1);
    let mut col_totals: BTreeMap<&Vec<String>, Accumulator> = BTreeMap::new();
    let mut grand = Accumulator::default();

    for rk in &row_keys {
        let mut line: Vec<String> = if rk.is_empty() {
            vec![String::new()]
        } else {
            rk.clone()
        };
        let mut row_total = Accumulator::default();
        for ck in &col_keys {
            let cell = cells.get(&(rk.clone(), ck.clone()));
            if let Some(acc) = cell {
                row_total.merge(acc);
                col_totals.entry(ck).or_default().merge(acc);
            }
            if has_cols {
                line.push(cell.map(|a| a.format(aggregator)).unwrap_or_default());
            }
        }
        grand.merge(&row_total);
        line.push(row_total.format(aggregator));
        out_rows.push(line);
    }

    let lead = row_idx.len().max(1);
    let mut totals = vec![String::new(); lead];
    totals[0] = "Totals".to_string();
    if has_cols {
        for ck in &col_keys {
            totals.push(
                col_totals
                    .get(ck)
                    .map(|a| a.format(aggregator))
                    .unwrap_or_default(),
            );
        }
    }
    totals.push(grand.format(aggregator));
    out_rows.push(totals);

    debug!(
        target: "pivot",
        "Pivoted {} records into {} rows",
        source.body().len(),
        out_rows.len()
    );
    RenderedTable::from_header_and_rows(out_header, out_rows)
}

/// The pivot tab of a query page. Nothing happens until the tab is first
/// activated; from then on the view works on a snapshot of the results.
#[derive(Debug, Clone)]
pub struct PivotView {
    bookmark_base_url: String,
    bookmark_href: Option<String>,
    state: PivotState,
    snapshot: Option<RenderedTable>,
    restored: bool,
}

impl PivotView {
    pub fn new(bookmark_base_url: &str) -> Self {
        Self {
            bookmark_base_url: bookmark_base_url.to_string(),
            bookmark_href: None,
            state: PivotState::default(),
            snapshot: None,
            restored: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Initializes on first call only. Returns true when this call did the
    /// initialization.
    pub fn activate(&mut self, results: &RenderedTable, fragment: Option<&str>) -> bool {
        if self.is_initialized() {
            return false;
        }
        let restored = fragment.and_then(PivotState::try_decode);
        if fragment.is_some_and(|f| !f.trim_start_matches('#').is_empty()) && restored.is_none()
        {
            debug!(target: "pivot", "Bookmark fragment did not decode, using defaults");
        }
        self.restored = restored.is_some();
        self.state = restored.unwrap_or_default();
        self.snapshot = Some(results.clone());
        true
    }

    /// Whether the page should open on the pivot tab: a bookmark decoded.
    pub fn restored_from_bookmark(&self) -> bool {
        self.restored
    }

    pub fn state(&self) -> &PivotState {
        &self.state
    }

    /// Applies a changed configuration and rewrites the bookmark link.
    pub fn refresh(&mut self, state: PivotState) -> &str {
        let href = bookmark_url(&self.bookmark_base_url, &state);
        self.state = state;
        self.bookmark_href.insert(href)
    }

    pub fn bookmark_href(&self) -> Option<&str> {
        self.bookmark_href.as_deref()
    }

    /// The rendered pivot output, if the view has been activated.
    pub fn output(&self) -> Option<RenderedTable> {
        self.snapshot
            .as_ref()
            .map(|table| pivot_table(table, &self.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> RenderedTable {
        RenderedTable::new(
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    fn sample() -> RenderedTable {
        table(&[
            &["region", "product", "amount"],
            &["east", "apple", "10"],
            &["east", "pear", "5"],
            &["west", "apple", "7"],
            &["east", "apple", "3"],
        ])
    }

    #[test]
    fn test_state_round_trip() {
        let state = PivotState {
            aggregator_name: "Sum".into(),
            rows: vec!["region".into()],
            cols: vec!["product".into()],
            renderer_name: "Heatmap".into(),
            vals: vec!["amount".into()],
        };
        assert_eq!(PivotState::decode(&format!("#{}", state.encode())), state);
    }

    #[test]
    fn test_encoding_uses_widget_field_names() {
        let json = String::from_utf8(BASE64.decode(PivotState::default().encode()).unwrap())
            .unwrap();
        assert!(json.contains("\"aggregatorName\""));
        assert!(json.contains("\"rendererName\""));
    }

    #[test]
    fn test_garbage_decodes_to_default() {
        assert_eq!(PivotState::decode("#!!not base64!!"), PivotState::default());
        assert_eq!(PivotState::decode(&BASE64.encode("not json")), PivotState::default());
        assert_eq!(PivotState::decode(&BASE64.encode("[1,2]")), PivotState::default());
        assert_eq!(PivotState::decode(""), PivotState::default());
    }

    #[test]
    fn test_extra_fields_are_dropped() {
        let json = r#"{"aggregatorName":"Sum","rows":["a"],"cols":[],"rendererName":"Table","vals":["b"],"exclusions":{"a":["x"]}}"#;
        let state = PivotState::decode(&BASE64.encode(json));
        assert_eq!(state.aggregator_name, "Sum");
        assert!(!state.encode().contains("exclusions"));
    }

    #[test]
    fn test_count_by_row_and_col() {
        let state = PivotState {
            rows: vec!["region".into()],
            cols: vec!["product".into()],
            ..PivotState::default()
        };
        let out = pivot_table(&sample(), &state);
        assert_eq!(out.header(), &["region", "apple", "pear", "Totals"]);
        assert_eq!(out.body()[0], vec!["east", "2", "1", "3"]);
        assert_eq!(out.body()[1], vec!["west", "1", "", "1"]);
        assert_eq!(out.body()[2], vec!["Totals", "3", "1", "4"]);
    }

    #[test]
    fn test_sum_without_cols() {
        let state = PivotState {
            aggregator_name: "Sum".into(),
            rows: vec!["region".into()],
            vals: vec!["amount".into()],
            ..PivotState::default()
        };
        let out = pivot_table(&sample(), &state);
        assert_eq!(out.header(), &["region", "Totals"]);
        assert_eq!(out.body()[0], vec!["east", "18.00"]);
        assert_eq!(out.body()[2], vec!["Totals", "25.00"]);
    }

    #[test]
    fn test_view_is_lazy_and_bookmarks() {
        let mut view = PivotView::new("http://host/explorer/3/?rows=10");
        assert!(view.output().is_none());

        let state = PivotState {
            rows: vec!["region".into()],
            ..PivotState::default()
        };
        let fragment = format!("#{}", state.encode());
        assert!(view.activate(&sample(), Some(&fragment)));
        assert!(view.restored_from_bookmark());
        assert!(!view.activate(&sample(), None));
        assert_eq!(view.state(), &state);

        let href = view.refresh(PivotState::default()).to_string();
        assert!(href.starts_with("http://host/explorer/3/?rows=10#"));
        let encoded = href.split('#').nth(1).unwrap();
        assert_eq!(PivotState::decode(encoded), PivotState::default());
    }

    #[test]
    fn test_bad_fragment_falls_back() {
        let mut view = PivotView::new("/explorer/1/");
        view.activate(&sample(), Some("#%%%"));
        assert!(!view.restored_from_bookmark());
        assert_eq!(view.state(), &PivotState::default());
    }
}
