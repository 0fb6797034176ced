//! CSRF token lookup for mutating requests.
//!
//! The server either exposes the token through a readable cookie or, when
//! that cookie is HttpOnly, renders it into a hidden `csrfmiddlewaretoken`
//! form field. Which source applies is itself advertised by the page through
//! two hidden inputs, `csrfCookieName` and `csrfCookieHttpOnly`.

use regex::Regex;
use std::sync::OnceLock;

use crate::utils::patterns::{attribute, cached};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfSettings {
    pub cookie_name: String,
    pub cookie_httponly: bool,
}

impl CsrfSettings {
    pub fn new(cookie_name: &str, cookie_httponly: bool) -> Self {
        Self {
            cookie_name: cookie_name.to_string(),
            cookie_httponly,
        }
    }

    /// Settings advertised by a rendered page, with `fallback` filling
    /// whatever the page leaves out.
    pub fn from_page(html: &str, fallback: &CsrfSettings) -> Self {
        let cookie_name = input_value_by_id(html, "csrfCookieName")
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| fallback.cookie_name.clone());
        let cookie_httponly = input_value_by_id(html, "csrfCookieHttpOnly")
            .map(|v| v == "True")
            .unwrap_or(fallback.cookie_httponly);
        Self {
            cookie_name,
            cookie_httponly,
        }
    }
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self::new("csrftoken", false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CsrfAccessor {
    settings: CsrfSettings,
}

impl CsrfAccessor {
    pub fn new(settings: CsrfSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CsrfSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: CsrfSettings) {
        self.settings = settings;
    }

    /// The token for the next mutating request, or `None` when the
    /// configured source does not carry one.
    pub fn token(&self, cookie_header: Option<&str>, page_html: Option<&str>) -> Option<String> {
        if self.settings.cookie_httponly {
            return page_html.and_then(|html| input_value_by_name(html, "csrfmiddlewaretoken"));
        }
        cookie_header.and_then(|header| cookie_value(header, &self.settings.cookie_name))
    }
}

/// Value of `name` in a `Cookie:` style header (`a=1; b=2`).
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().to_string())
    })
}

fn input_value_by_name(html: &str, name: &str) -> Option<String> {
    input_attribute_lookup(html, "name", name)
}

fn input_value_by_id(html: &str, id: &str) -> Option<String> {
    input_attribute_lookup(html, "id", id)
}

fn input_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<input\b[^>]*>")
}

/// Finds the first `<input>` whose `attr` equals `wanted` and returns its
/// `value`. Attribute order inside the tag does not matter.
fn input_attribute_lookup(html: &str, attr: &str, wanted: &str) -> Option<String> {
    input_re()?.find_iter(html).find_map(|tag| {
        let tag = tag.as_str();
        if attribute(tag, attr).as_deref() != Some(wanted) {
            return None;
        }
        attribute(tag, "value")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <form method="post">
          <input type="hidden" id="csrfCookieName" value="explorer_csrf">
          <input type="hidden" id="csrfCookieHttpOnly" value="True">
          <input type="hidden" name="csrfmiddlewaretoken" value="form-token-123">
        </form>"#;

    #[test]
    fn test_cookie_source() {
        let accessor = CsrfAccessor::new(CsrfSettings::new("csrftoken", false));
        let token = accessor.token(Some("sessionid=abc; csrftoken=cookie-token"), Some(PAGE));
        assert_eq!(token.as_deref(), Some("cookie-token"));
    }

    #[test]
    fn test_httponly_reads_hidden_field() {
        let accessor = CsrfAccessor::new(CsrfSettings::new("csrftoken", true));
        let token = accessor.token(Some("csrftoken=cookie-token"), Some(PAGE));
        assert_eq!(token.as_deref(), Some("form-token-123"));
    }

    #[test]
    fn test_missing_sources_yield_none() {
        let cookie = CsrfAccessor::new(CsrfSettings::new("csrftoken", false));
        assert_eq!(cookie.token(Some("sessionid=abc"), None), None);
        assert_eq!(cookie.token(None, None), None);

        let field = CsrfAccessor::new(CsrfSettings::new("csrftoken", true));
        assert_eq!(field.token(None, Some("<p>no form</p>")), None);
    }

    #[test]
    fn test_settings_from_page() {
        let settings = CsrfSettings::from_page(PAGE, &CsrfSettings::default());
        assert_eq!(settings.cookie_name, "explorer_csrf");
        assert!(settings.cookie_httponly);

        let settings = CsrfSettings::from_page("<html></html>", &CsrfSettings::new("x", false));
        assert_eq!(settings, CsrfSettings::new("x", false));
    }

    #[test]
    fn test_data_attributes_do_not_shadow_id() {
        let html = r#"<input data-id="csrfCookieName" value="wrong"><input id="csrfCookieName" value="right">"#;
        assert_eq!(
            input_value_by_id(html, "csrfCookieName").as_deref(),
            Some("right")
        );
    }

    #[test]
    fn test_attribute_order_is_irrelevant() {
        let html = r#"<input value="tok" type="hidden" name="csrfmiddlewaretoken" />"#;
        assert_eq!(
            input_value_by_name(html, "csrfmiddlewaretoken").as_deref(),
            Some("tok")
        );
    }
}
