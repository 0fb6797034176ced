//! Schema side panel: open/closed state, column tooltip and the table
//! browser with filtering and expand/collapse.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::schema_cache::Schema;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PanelState {
    #[serde(default)]
    schema_sidebar_open: bool,
}

/// Column names for a table, or a one-line message when it is unknown.
pub fn tooltip(schema: &Schema, word: &str) -> Vec<String> {
    match schema.columns(word) {
        Some(columns) => columns.iter().map(|c| c.label()).collect(),
        None => vec![format!(
            "Table '{}' not found in schema for connection",
            word
        )],
    }
}

#[derive(Debug)]
pub struct SchemaPanel {
    state_file: Option<PathBuf>,
    open: bool,
    expanded: BTreeSet<String>,
}

impl SchemaPanel {
    /// A panel whose open flag is kept in `state_file`. A missing or
    /// unreadable file means closed.
    pub fn load(state_file: PathBuf) -> Self {
        let open = match fs::read_to_string(&state_file) {
            Ok(content) => serde_json::from_str::<PanelState>(&content)
                .map(|s| s.schema_sidebar_open)
                .unwrap_or_else(|e| {
                    warn!(target: "schema_panel", "Ignoring bad panel state: {}", e);
                    false
                }),
            Err(_) => false,
        };
        Self {
            state_file: Some(state_file),
            open,
            expanded: BTreeSet::new(),
        }
    }

    /// A panel that does not remember anything.
    pub fn in_memory() -> Self {
        Self {
            state_file: None,
            open: false,
            expanded: BTreeSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&PanelState {
            schema_sidebar_open: self.open,
        })?;
        fs::write(path, content)
            .with_context(|| format!("Cannot save panel state to {}", path.display()))?;
        debug!(target: "schema_panel", "Panel open = {}", self.open);
        Ok(())
    }

    /// Opens the panel and returns the page to show for `connection`.
    pub fn show<F>(&mut self, connection: &str, page_url: F) -> Result<String>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        let url = page_url(connection)?;
        self.open = true;
        self.persist()?;
        Ok(url)
    }

    pub fn hide(&mut self) -> Result<()> {
        self.open = false;
        self.persist()
    }

    /// Table names containing `term`, ignoring case, in schema order.
    pub fn filter<'a>(&self, schema: &'a Schema, term: &str) -> Vec<&'a str> {
        let term = term.trim().to_lowercase();
        schema
            .tables()
            .iter()
            .map(|t| t.name.as_str())
            .filter(|name| term.is_empty() || name.to_lowercase().contains(&term))
            .collect()
    }

    pub fn is_expanded(&self, table: &str) -> bool {
        self.expanded.contains(table)
    }

    pub fn toggle(&mut self, table: &str) {
        if !self.expanded.remove(table) {
            self.expanded.insert(table.to_string());
        }
    }

    pub fn expand_all(&mut self, schema: &Schema) {
        self.expanded = schema.table_names().into_iter().collect();
    }

    pub fn collapse_all(&mut self) {
        self.expanded.clear();
    }

    /// The browser view: each table followed by its columns when expanded.
    pub fn render(&self, schema: &Schema, term: &str) -> Vec<(String, Vec<String>)> {
        self.filter(schema, term)
            .into_iter()
            .map(|name| {
                let columns = if self.is_expanded(name) {
                    tooltip(schema, name)
                } else {
                    Vec::new()
                };
                (name.to_string(), columns)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::from_json(
            r#"{"auth_user": ["id", "username"], "orders": ["id", "user_id"], "AuthGroup": ["id"]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_tooltip_known_and_unknown() {
        let schema = schema();
        assert_eq!(tooltip(&schema, "orders"), vec!["id", "user_id"]);
        assert_eq!(
            tooltip(&schema, "nope"),
            vec!["Table 'nope' not found in schema for connection"]
        );
    }

    #[test]
    fn test_open_flag_persists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("panel_state.json");

        let mut panel = SchemaPanel::load(file.clone());
        assert!(!panel.is_open());
        let url = panel
            .show("main", |conn| Ok(format!("http://x/explorer/schema/{}", conn)))
            .unwrap();
        assert_eq!(url, "http://x/explorer/schema/main");

        let reloaded = SchemaPanel::load(file.clone());
        assert!(reloaded.is_open());

        panel.hide().unwrap();
        assert!(!SchemaPanel::load(file).is_open());
    }

    #[test]
    fn test_corrupt_state_means_closed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("panel_state.json");
        fs::write(&file, "not json").unwrap();
        assert!(!SchemaPanel::load(file).is_open());
    }

    #[test]
    fn test_filter_and_expand() {
        let schema = schema();
        let mut panel = SchemaPanel::in_memory();
        assert_eq!(panel.filter(&schema, "auth"), vec!["auth_user", "AuthGroup"]);

        panel.expand_all(&schema);
        assert!(panel.is_expanded("orders"));
        panel.toggle("orders");
        assert!(!panel.is_expanded("orders"));

        let view = panel.render(&schema, "user");
        assert_eq!(view, vec![("auth_user".to_string(), vec!["id".to_string(), "username".to_string()])]);

        panel.collapse_all();
        assert!(panel.render(&schema, "").iter().all(|(_, cols)| cols.is_empty()));
    }
}
