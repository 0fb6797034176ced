//! Compiled-once patterns for scraping rendered pages.

use regex::Regex;
use std::sync::OnceLock;

/// Compiles `pattern` on first use. A pattern that fails to compile yields
/// `None` every time instead of panicking.
pub fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn attribute_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(
        &RE,
        r#"(?i)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#,
    )
}

/// Quoted attributes of a tag (or of the text between `<tag` and `>`), names
/// lowercased, in document order.
pub fn attributes(tag: &str) -> Vec<(String, String)> {
    let Some(re) = attribute_re() else {
        return Vec::new();
    };
    re.captures_iter(tag)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_lowercase(), value.to_string())
        })
        .collect()
}

/// Value of the attribute called `name`, matched exactly and ignoring case.
pub fn attribute(tag: &str, name: &str) -> Option<String> {
    attributes(tag)
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// Whether the `class` attribute lists `class`.
pub fn has_class(tag: &str, class: &str) -> bool {
    attribute(tag, "class").is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
}
