//! Table pickers over a connection's schema: the multi-select passed to
//! the assistant as context, and the single choice of a table description.

use anyhow::{anyhow, Result};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use std::collections::HashSet;
use std::time::Instant;
use tracing::debug;

use crate::debouncer::Debouncer;
use crate::schema_cache::Schema;

/// Tables from `keys` that appear as whole whitespace-separated words in
/// `text`, compared case-insensitively. Result keeps the order of `keys`.
pub fn relevant_tables(text: &str, keys: &[String]) -> Vec<String> {
    let lowered = text.to_lowercase();
    let words: HashSet<&str> = lowered.split_whitespace().collect();
    keys.iter()
        .filter(|key| words.contains(key.to_lowercase().as_str()))
        .cloned()
        .collect()
}

fn table_list(schema: &Schema, sorted: bool) -> Vec<String> {
    let mut tables = schema.table_names();
    if sorted {
        tables.sort();
    }
    tables
}

pub struct TableSelector {
    tables: Vec<String>,
    selected: Vec<String>,
    doc_debounce: Debouncer,
    request_debounce: Debouncer,
}

impl TableSelector {
    pub fn new(doc_debounce_ms: u64, request_debounce_ms: u64) -> Self {
        Self {
            tables: Vec::new(),
            selected: Vec::new(),
            doc_debounce: Debouncer::new(doc_debounce_ms),
            request_debounce: Debouncer::new(request_debounce_ms),
        }
    }

    /// Drops the current list and selection and lists the tables of `schema`.
    /// Used on first load and whenever the connection changes.
    pub fn rebuild(&mut self, schema: &Schema) {
        self.tables = table_list(schema, false);
        self.selected.clear();
        self.doc_debounce.reset();
        self.request_debounce.reset();
        debug!(target: "tables", "Table list rebuilt with {} tables", self.tables.len());
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Selection in table-list order
    pub fn selected(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| self.selected.contains(t))
            .cloned()
            .collect()
    }

    /// Selection restricted to tables the current schema knows about.
    pub fn selected_for_request(&self) -> Vec<String> {
        self.selected()
    }

    pub fn is_selected(&self, table: &str) -> bool {
        self.selected.iter().any(|t| t == table)
    }

    /// Adds `names` to the selection; unknown names are ignored.
    pub fn select<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            let name = name.as_ref();
            if self.tables.iter().any(|t| t == name) && !self.is_selected(name) {
                self.selected.push(name.to_string());
            }
        }
    }

    pub fn deselect<S: AsRef<str>>(&mut self, names: &[S]) {
        self.selected
            .retain(|t| !names.iter().any(|n| n.as_ref() == t.as_str()));
    }

    pub fn select_all(&mut self) {
        self.selected = self.tables.clone();
    }

    pub fn deselect_all(&mut self) {
        self.selected.clear();
    }

    /// Adds every table mentioned in `text`; existing picks stay.
    pub fn auto_select(&mut self, text: &str) -> Vec<String> {
        let matches = relevant_tables(text, &self.tables);
        self.select(&matches);
        matches
    }

    /// Clears the selection and re-derives it from both texts.
    pub fn refresh(&mut self, sql: &str, request: &str) {
        self.deselect_all();
        self.auto_select(sql);
        self.auto_select(request);
    }

    pub fn on_doc_changed(&mut self) {
        self.doc_debounce.trigger();
    }

    pub fn on_request_input(&mut self) {
        self.request_debounce.trigger();
    }

    pub fn on_doc_changed_at(&mut self, now: Instant) {
        self.doc_debounce.trigger_at(now);
    }

    pub fn on_request_input_at(&mut self, now: Instant) {
        self.request_debounce.trigger_at(now);
    }

    /// Runs whichever debounced matches are due. Returns true when the
    /// selection was re-evaluated.
    pub fn poll(&mut self, sql: &str, request: &str) -> bool {
        self.poll_at(Instant::now(), sql, request)
    }

    pub fn poll_at(&mut self, now: Instant, sql: &str, request: &str) -> bool {
        let mut ran = false;
        if self.doc_debounce.should_execute_at(now) {
            self.auto_select(sql);
            ran = true;
        }
        if self.request_debounce.should_execute_at(now) {
            self.auto_select(request);
            ran = true;
        }
        ran
    }

    pub fn has_pending(&self) -> bool {
        self.doc_debounce.is_pending() || self.request_debounce.is_pending()
    }
}

/// Prompt shown while no table is chosen
pub const TABLE_PLACEHOLDER: &str = "Select table";

/// Sorted, searchable single choice of one table.
#[derive(Debug, Default)]
pub struct TablePicker {
    tables: Vec<String>,
    chosen: Option<String>,
}

impl TablePicker {
    /// A picker pre-set to the table an existing description is about.
    pub fn new(initial: Option<&str>) -> Self {
        Self {
            tables: Vec::new(),
            chosen: initial.filter(|t| !t.is_empty()).map(str::to_string),
        }
    }

    /// Lists the tables of `schema` in name order. The choice survives only
    /// if the new list still has it.
    pub fn rebuild(&mut self, schema: &Schema) {
        self.tables = table_list(schema, true);
        if let Some(chosen) = &self.chosen {
            if !self.tables.contains(chosen) {
                debug!(target: "tables", "Dropping table choice '{}'", chosen);
                self.chosen = None;
            }
        }
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn chosen(&self) -> Option<&str> {
        self.chosen.as_deref()
    }

    /// The chosen table, or the placeholder
    pub fn label(&self) -> &str {
        self.chosen().unwrap_or(TABLE_PLACEHOLDER)
    }

    pub fn choose(&mut self, table: &str) -> Result<()> {
        if !self.tables.iter().any(|t| t == table) {
            return Err(anyhow!("Table '{}' is not in this connection", table));
        }
        self.chosen = Some(table.to_string());
        Ok(())
    }

    pub fn clear(&mut self) {
        self.chosen = None;
    }

    /// Tables fuzzily matching `term`, best first; an empty term lists all.
    pub fn search(&self, term: &str) -> Vec<&str> {
        if term.is_empty() {
            return self.tables.iter().map(String::as_str).collect();
        }
        let matcher = SkimMatcherV2::default().ignore_case();
        let mut scored: Vec<(i64, &str)> = self
            .tables
            .iter()
            .filter_map(|t| matcher.fuzzy_match(t, term).map(|score| (score, t.as_str())))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, t)| t).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_cache::ColumnDescriptor;
    use std::time::Duration;

    fn schema(names: &[&str]) -> Schema {
        let mut schema = Schema::new();
        for name in names {
            schema.insert(name, vec![ColumnDescriptor::Name("id".into())]);
        }
        schema
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_whole_word_match_only() {
        let tables = keys(&["orders", "order", "Customers"]);
        let found = relevant_tables("SELECT * FROM Orders JOIN customers_archive", &tables);
        assert_eq!(found, vec!["orders"]);

        let found = relevant_tables("select\n*\tfrom   CUSTOMERS", &tables);
        assert_eq!(found, vec!["Customers"]);
    }

    #[test]
    fn test_punctuation_is_part_of_the_token() {
        let tables = keys(&["orders"]);
        assert!(relevant_tables("select * from orders;", &tables).is_empty());
    }

    #[test]
    fn test_select_all_then_deselect_all() {
        let mut selector = TableSelector::new(500, 300);
        selector.rebuild(&schema(&["a", "b", "c"]));
        selector.select_all();
        assert_eq!(selector.selected().len(), 3);
        selector.deselect_all();
        assert!(selector.selected().is_empty());
    }

    #[test]
    fn test_auto_select_is_additive() {
        let mut selector = TableSelector::new(500, 300);
        selector.rebuild(&schema(&["users", "orders", "items"]));
        selector.select(&["items"]);
        selector.auto_select("select * from users");
        assert_eq!(selector.selected(), vec!["users", "items"]);
    }

    #[test]
    fn test_refresh_replaces_selection() {
        let mut selector = TableSelector::new(500, 300);
        selector.rebuild(&schema(&["users", "orders", "items"]));
        selector.select(&["items"]);
        selector.refresh("select * from users", "join with orders please");
        assert_eq!(selector.selected(), vec!["users", "orders"]);
    }

    #[test]
    fn test_rebuild_discards_unknown_selection() {
        let mut selector = TableSelector::new(500, 300);
        selector.rebuild(&schema(&["users"]));
        selector.select(&["users", "ghost"]);
        assert_eq!(selector.selected_for_request(), vec!["users"]);

        selector.rebuild(&schema(&["accounts"]));
        assert!(selector.selected_for_request().is_empty());
    }

    #[test]
    fn test_debounced_matching() {
        let start = Instant::now();
        let mut selector = TableSelector::new(500, 300);
        selector.rebuild(&schema(&["users", "orders"]));

        selector.on_doc_changed_at(start);
        selector.on_request_input_at(start);
        assert!(!selector.poll_at(start + Duration::from_millis(100), "from users", "orders"));
        assert!(selector.selected().is_empty());

        assert!(selector.poll_at(start + Duration::from_millis(300), "from users", "orders"));
        assert_eq!(selector.selected(), vec!["orders"]);

        assert!(selector.poll_at(start + Duration::from_millis(500), "from users", "orders"));
        assert_eq!(selector.selected(), vec!["users", "orders"]);
        assert!(!selector.has_pending());
    }

    #[test]
    fn test_picker_lists_sorted_and_keeps_known_choice() {
        let mut picker = TablePicker::new(Some("users"));
        assert_eq!(picker.label(), "users");

        picker.rebuild(&schema(&["users", "accounts", "orders"]));
        assert_eq!(picker.tables(), &keys(&["accounts", "orders", "users"]));
        assert_eq!(picker.chosen(), Some("users"));

        picker.rebuild(&schema(&["events"]));
        assert_eq!(picker.chosen(), None);
        assert_eq!(picker.label(), TABLE_PLACEHOLDER);
    }

    #[test]
    fn test_picker_choose_and_search() {
        let mut picker = TablePicker::new(None);
        picker.rebuild(&schema(&["order_items", "orders", "users"]));
        assert!(picker.choose("ghost").is_err());
        picker.choose("orders").unwrap();
        assert_eq!(picker.chosen(), Some("orders"));

        let found = picker.search("ORD");
        assert!(found.contains(&"orders"));
        assert!(found.contains(&"order_items"));
        assert!(!found.contains(&"users"));
        assert_eq!(picker.search("").len(), 3);
    }
}
