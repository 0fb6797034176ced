//! Saved-query list: scraping, search, favorites and emailing results.

use anyhow::{bail, Result};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::utils::patterns::{attribute, cached, has_class};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEntry {
    pub id: String,
    pub name: String,
    pub favorite_url: String,
    pub is_favorite: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FavoriteResponse {
    #[serde(default)]
    pub query_id: Option<serde_json::Value>,
    pub is_favorite: bool,
}

fn row_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<tr\b[^>]*>(.*?)</tr>")
}

fn open_tag_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<[a-z]+\b[^>]*>")
}

fn cell_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<td\b([^>]*)>(.*?)</td>")
}

fn strip_tags(html: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let text = match cached(&RE, r"(?s)<[^>]+>") {
        Some(re) => re.replace_all(html, "").into_owned(),
        None => html.to_string(),
    };
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads the query rows out of the list page. Rows without a favorite
/// toggle are skipped.
pub fn parse_query_list(page_html: &str) -> Vec<QueryEntry> {
    let mut entries = Vec::new();
    let (Some(row_re), Some(open_tag_re)) = (row_re(), open_tag_re()) else {
        return entries;
    };
    for row in row_re.captures_iter(page_html) {
        let row = &row[1];
        let Some(tag) = open_tag_re
            .find_iter(row)
            .map(|m| m.as_str())
            .find(|tag| has_class(tag, "query_favorite_toggle"))
        else {
            continue;
        };
        let (Some(id), Some(url)) = (attribute(tag, "data-id"), attribute(tag, "data-url")) else {
            warn!(target: "query_list", "Favorite toggle without data-id/data-url");
            continue;
        };
        let is_favorite = has_class(tag, "bi-heart-fill");
        let name = cell_re()
            .and_then(|re| re.captures_iter(row).find(|c| has_class(&c[1], "name")))
            .map(|c| strip_tags(&c[2]))
            .unwrap_or_default();

        entries.push(QueryEntry {
            id,
            name,
            favorite_url: url,
            is_favorite,
        });
    }
    debug!(target: "query_list", "Parsed {} queries", entries.len());
    entries
}

#[derive(Debug, Default)]
pub struct QueryList {
    entries: Vec<QueryEntry>,
}

impl QueryList {
    pub fn new(entries: Vec<QueryEntry>) -> Self {
        Self { entries }
    }

    pub fn from_page(page_html: &str) -> Self {
        Self::new(parse_query_list(page_html))
    }

    pub fn entries(&self) -> &[QueryEntry] {
        &self.entries
    }

    /// Entries whose name contains `term`, ignoring case. An empty term
    /// matches everything.
    pub fn search(&self, term: &str) -> Vec<&QueryEntry> {
        let term = term.trim().to_lowercase();
        self.entries
            .iter()
            .filter(|e| term.is_empty() || e.name.to_lowercase().contains(&term))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&QueryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Posts the toggle through `send` and records the state the server
    /// reports. Returns the new favorite flag.
    pub fn toggle_favorite<F>(&mut self, id: &str, send: F) -> Result<bool>
    where
        F: FnOnce(&str) -> Result<FavoriteResponse>,
    {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            bail!("No query with id {}", id);
        };
        let response = send(&entry.favorite_url)?;
        entry.is_favorite = response.is_favorite;
        Ok(entry.is_favorite)
    }
}

fn email_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(
        &RE,
        r#"(?i)^(([^<>()\[\]\.,;:\s@"]+(\.[^<>()\[\]\.,;:\s@"]+)*)|(".+"))@(([^<>()\[\]\.,;:\s@"]+\.)+[^<>()\[\]\.,;:\s@"]{2,})$"#,
    )
}

pub fn is_valid_email(email: &str) -> bool {
    email_re().is_some_and(|re| re.is_match(email))
}

/// Checks the address, then hands off to `send`. Invalid addresses never
/// reach the server.
pub fn email_csv<F, T>(query_id: &str, email: &str, send: F) -> Result<T>
where
    F: FnOnce(&str, &str) -> Result<T>,
{
    if !is_valid_email(email) {
        bail!("Email is invalid");
    }
    send(query_id, email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const PAGE: &str = r#"
        <table id="queries"><tbody>
        <tr>
          <td class="name"><a href="/explorer/3/">Monthly <b>signups</b></a></td>
          <td><i class="bi-heart-fill query_favorite_toggle" data-id="3" data-url="/explorer/favorite/3"></i></td>
        </tr>
        <tr>
          <td class="name">Active users</td>
          <td><i class="bi-heart query_favorite_toggle" data-id="7" data-url="/explorer/favorite/7"></i></td>
        </tr>
        <tr><td>header-ish row</td></tr>
        </tbody></table>"#;

    #[test]
    fn test_parse_rows() {
        let entries = parse_query_list(PAGE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Monthly signups");
        assert!(entries[0].is_favorite);
        assert_eq!(entries[1].id, "7");
        assert_eq!(entries[1].favorite_url, "/explorer/favorite/7");
        assert!(!entries[1].is_favorite);
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let list = QueryList::from_page(PAGE);
        let found = list.search("SIGNUP");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "3");
        assert_eq!(list.search("").len(), 2);
    }

    #[test]
    fn test_toggle_uses_server_state() {
        let mut list = QueryList::from_page(PAGE);
        let now = list
            .toggle_favorite("7", |url| {
                assert_eq!(url, "/explorer/favorite/7");
                Ok(FavoriteResponse {
                    query_id: None,
                    is_favorite: true,
                })
            })
            .unwrap();
        assert!(now);
        assert!(list.get("7").unwrap().is_favorite);
        assert!(list
            .toggle_favorite("99", |_| unreachable!("unknown id must not post"))
            .is_err());
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("someone@example.com"));
        assert!(is_valid_email("first.last@sub.example.org"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("a@b.c"));
        assert!(!is_valid_email("a b@example.com"));
    }

    #[test]
    fn test_invalid_email_is_not_sent() {
        let called = Cell::new(false);
        let result = email_csv("3", "bad", |_, _| {
            called.set(true);
            Ok(())
        });
        assert_eq!(result.unwrap_err().to_string(), "Email is invalid");
        assert!(!called.get());
    }
}
