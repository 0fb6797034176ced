use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use reedline::{Completer, Span, Suggestion};
use std::sync::{Arc, Mutex};

use explorer_cli::schema_cache::Schema;

pub const COMMANDS: &[&str] = &[
    "\\help", "\\clear", "\\connect", "\\schema", "\\tables", "\\select", "\\deselect",
    "\\refresh", "\\tip", "\\panel", "\\ask", "\\history", "\\copy", "\\format", "\\show",
    "\\run", "\\new", "\\load", "\\save", "\\results", "\\rows", "\\pivot", "\\export",
    "\\queries", "\\fav", "\\email", "\\upload", "\\validate", "\\log", "\\quit", "\\title",
    "\\create", "\\sort", "\\describe",
];

/// Names the completer offers, refreshed whenever the connection changes.
#[derive(Default)]
pub struct CompletionWords {
    tables: Vec<String>,
    columns: Vec<String>,
}

impl CompletionWords {
    pub fn update(&mut self, schema: &Schema) {
        self.tables = schema.table_names();
        let mut columns: Vec<String> = schema
            .tables()
            .iter()
            .flat_map(|t| t.columns.iter().map(|c| c.name()))
            .collect();
        columns.sort();
        columns.dedup();
        self.columns = columns;
    }
}

pub struct SchemaCompleter {
    words: Arc<Mutex<CompletionWords>>,
    matcher: SkimMatcherV2,
}

impl SchemaCompleter {
    pub fn new(words: Arc<Mutex<CompletionWords>>) -> Self {
        Self {
            words,
            matcher: SkimMatcherV2::default(),
        }
    }

    fn ranked<'a>(
        &self,
        partial: &str,
        candidates: impl Iterator<Item = (&'a str, &'static str)>,
    ) -> Vec<(i64, String, &'static str)> {
        let mut scored: Vec<(i64, String, &'static str)> = candidates
            .filter_map(|(value, kind)| {
                if partial.is_empty() {
                    return Some((0, value.to_string(), kind));
                }
                self.matcher
                    .fuzzy_match(value, partial)
                    .map(|score| (score, value.to_string(), kind))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored
    }
}

impl Completer for SchemaCompleter {
    fn complete(&mut self, line: &str, pos: usize) -> Vec<Suggestion> {
        let input = &line[..pos.min(line.len())];
        let start = input
            .rfind(|c: char| c.is_whitespace() || c == ',' || c == '(')
            .map(|i| i + 1)
            .unwrap_or(0);
        let partial = &input[start..];

        let scored = if start == 0 && partial.starts_with('\\') {
            self.ranked(partial, COMMANDS.iter().map(|c| (*c, "command")))
        } else {
            let Ok(words) = self.words.lock() else {
                return Vec::new();
            };
            let tables = words.tables.iter().map(|t| (t.as_str(), "table"));
            let columns = words.columns.iter().map(|c| (c.as_str(), "column"));
            self.ranked(partial, tables.chain(columns))
        };

        scored
            .into_iter()
            .map(|(_, value, kind)| Suggestion {
                value,
                description: Some(kind.to_string()),
                extra: None,
                span: Span { start, end: pos },
                style: None,
                append_whitespace: kind != "column",
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completer() -> SchemaCompleter {
        let schema =
            Schema::from_json(r#"{"auth_user": ["id", "username"], "orders": ["id", "total"]}"#)
                .unwrap();
        let mut words = CompletionWords::default();
        words.update(&schema);
        SchemaCompleter::new(Arc::new(Mutex::new(words)))
    }

    #[test]
    fn test_completes_commands() {
        let mut c = completer();
        let values: Vec<String> = c.complete("\\exp", 4).into_iter().map(|s| s.value).collect();
        assert_eq!(values.first().map(String::as_str), Some("\\export"));
    }

    #[test]
    fn test_completes_tables_fuzzily() {
        let mut c = completer();
        let line = "select * from ausr";
        let suggestions = c.complete(line, line.len());
        assert_eq!(suggestions[0].value, "auth_user");
        assert_eq!(suggestions[0].span.start, 14);
    }

    #[test]
    fn test_columns_are_deduplicated() {
        let mut c = completer();
        let line = "select i";
        let ids = c
            .complete(line, line.len())
            .into_iter()
            .filter(|s| s.value == "id")
            .count();
        assert_eq!(ids, 1);
    }
}
