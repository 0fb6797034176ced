//! Per-connection schema memoization.
//!
//! The server answers `schema.json/<connection>` with a JSON object mapping
//! table names to column descriptors. A fetched schema is kept for the life
//! of the session; switching connections fetches again rather than evicting.

use anyhow::{Context, Result};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// One column as the server describes it: either a bare name or an object
/// with at least a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnDescriptor {
    Name(String),
    Detailed(Value),
}

impl ColumnDescriptor {
    pub fn name(&self) -> String {
        match self {
            ColumnDescriptor::Name(name) => name.clone(),
            ColumnDescriptor::Detailed(value) => value
                .get("name")
                .or_else(|| value.get("column"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        }
    }

    /// Short label for tooltips, e.g. `id (integer)`
    pub fn label(&self) -> String {
        match self {
            ColumnDescriptor::Name(name) => name.clone(),
            ColumnDescriptor::Detailed(value) => {
                let kind = value
                    .get("type")
                    .or_else(|| value.get("data_type"))
                    .and_then(Value::as_str);
                match kind {
                    Some(kind) => format!("{} ({})", self.name(), kind),
                    None => self.name(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

/// Table name to columns, in the order the server listed them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    tables: Vec<TableSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table, replacing an existing entry of the same name in place.
    pub fn insert(&mut self, name: &str, columns: Vec<ColumnDescriptor>) {
        match self.tables.iter_mut().find(|t| t.name == name) {
            Some(table) => table.columns = columns,
            None => self.tables.push(TableSchema {
                name: name.to_string(),
                columns,
            }),
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    /// Exact-name lookup; table names keep their case.
    pub fn columns(&self, table: &str) -> Option<&[ColumnDescriptor]> {
        self.tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.columns.as_slice())
    }

    pub fn contains(&self, table: &str) -> bool {
        self.columns(table).is_some()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body).context("Schema response was not a JSON object")
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SchemaVisitor;

        impl<'de> Visitor<'de> for SchemaVisitor {
            type Value = Schema;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of table name to columns")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Schema, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut schema = Schema::new();
                while let Some((name, columns)) =
                    map.next_entry::<String, Vec<ColumnDescriptor>>()?
                {
                    schema.insert(&name, columns);
                }
                Ok(schema)
            }
        }

        deserializer.deserialize_map(SchemaVisitor)
    }
}

/// Anything that can produce the schema of a connection.
pub trait SchemaSource {
    fn fetch_schema(&self, connection: &str) -> Result<Schema>;
}

impl<S: SchemaSource + ?Sized> SchemaSource for Arc<S> {
    fn fetch_schema(&self, connection: &str) -> Result<Schema> {
        (**self).fetch_schema(connection)
    }
}

/// Handle for one outstanding fetch. Only the ticket of the most recent
/// request may change which schema is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTicket {
    pub connection: String,
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Arc<Schema>>,
    latest_generation: u64,
    active: Option<(String, Arc<Schema>)>,
}

/// Shared, per-connection schema memo.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    state: Arc<Mutex<CacheState>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, connection: &str) -> Option<Arc<Schema>> {
        let state = self.state.lock().ok()?;
        state.entries.get(connection).cloned()
    }

    /// Registers a new request; earlier tickets lose the right to set the
    /// active schema.
    pub fn begin(&self, connection: &str) -> SchemaTicket {
        let generation = match self.state.lock() {
            Ok(mut state) => {
                state.latest_generation += 1;
                state.latest_generation
            }
            Err(_) => 0,
        };
        SchemaTicket {
            connection: connection.to_string(),
            generation,
        }
    }

    /// Stores a fetched schema. The per-connection entry is always written;
    /// the return value says whether it also became the active schema.
    pub fn complete(&self, ticket: &SchemaTicket, schema: Schema) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let schema = Arc::new(schema);
        state
            .entries
            .insert(ticket.connection.clone(), Arc::clone(&schema));

        if ticket.generation == state.latest_generation {
            state.active = Some((ticket.connection.clone(), schema));
            true
        } else {
            debug!(
                target: "schema",
                "Stale schema for '{}' cached but not activated",
                ticket.connection
            );
            false
        }
    }

    /// Marks an already cached connection as active under a fresh generation.
    pub fn activate_cached(&self, connection: &str) -> Option<Arc<Schema>> {
        let mut state = self.state.lock().ok()?;
        let schema = state.entries.get(connection).cloned()?;
        state.latest_generation += 1;
        state.active = Some((connection.to_string(), Arc::clone(&schema)));
        Some(schema)
    }

    pub fn active(&self) -> Option<(String, Arc<Schema>)> {
        self.state.lock().ok()?.active.clone()
    }
}

/// Memoizing front for a [`SchemaSource`].
pub struct SchemaService<S> {
    source: S,
    cache: SchemaCache,
}

impl<S: SchemaSource> SchemaService<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: SchemaCache::new(),
        }
    }

    pub fn with_cache(source: S, cache: SchemaCache) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Cached schema for `connection`, fetching it on first use. A failed
    /// fetch leaves the cache untouched so the next call tries again.
    pub fn get(&self, connection: &str) -> Result<Arc<Schema>> {
        if let Some(schema) = self.cache.activate_cached(connection) {
            debug!(target: "schema", "Schema cache hit for '{}'", connection);
            return Ok(schema);
        }

        let ticket = self.cache.begin(connection);
        let schema = match self.source.fetch_schema(connection) {
            Ok(schema) => schema,
            Err(e) => {
                warn!(target: "schema", "Error fetching table schema for '{}': {}", connection, e);
                return Err(e);
            }
        };
        info!(
            target: "schema",
            "Fetched schema for '{}' ({} tables)",
            connection,
            schema.len()
        );
        self.cache.complete(&ticket, schema);
        self.cache
            .cached(connection)
            .with_context(|| format!("Schema for '{}' missing after fetch", connection))
    }
}
