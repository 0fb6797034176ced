//! Natural-language-to-SQL assistant panel.
//!
//! Packages the editor text, the picked tables and any visible database
//! error into a request, renders the markdown reply as sanitized HTML, and
//! applies the two convenience side effects: an empty editor receives the
//! reply's only code block, and an empty description receives the prompt.

use anyhow::{Context, Result};
use pulldown_cmark::{html, Event, Parser, Tag, TagEnd};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{error, info};

use crate::editor::{EditorHost, FormField};
use crate::table_selector::TableSelector;
use crate::utils::patterns::{cached, has_class};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantRequest {
    pub sql: Option<String>,
    pub connection_id: Option<String>,
    pub assistant_request: Option<String>,
    pub selected_tables: Vec<String>,
    pub db_error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryLog {
    #[serde(default)]
    pub user_request: String,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub logs: Vec<HistoryLog>,
}

/// The server side of the assistant.
pub trait AssistantBackend {
    fn ask(&self, request: &AssistantRequest) -> Result<AssistantResponse>;
    fn history(&self, connection_id: Option<&str>) -> Result<Vec<HistoryLog>>;
}

/// A markdown reply after rendering and sanitizing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedResponse {
    pub markdown: String,
    pub html: String,
    /// Text of each code block, in order (one per `<pre>` in `html`)
    pub code_blocks: Vec<String>,
}

/// Renders markdown to HTML and strips anything executable. Script and
/// style elements are dropped along with their contents; event-handler
/// attributes and `javascript:` links do not survive.
pub fn render_markdown(markdown: &str) -> RenderedResponse {
    let mut code_blocks = Vec::new();
    let mut current: Option<String> = None;

    let events: Vec<Event> = Parser::new(markdown).collect();
    for event in &events {
        match event {
            Event::Start(Tag::CodeBlock(_)) => current = Some(String::new()),
            Event::End(TagEnd::CodeBlock) => {
                if let Some(block) = current.take() {
                    code_blocks.push(block);
                }
            }
            Event::Text(text) => {
                if let Some(block) = current.as_mut() {
                    block.push_str(text);
                }
            }
            _ => {}
        }
    }

    let mut raw_html = String::new();
    html::push_html(&mut raw_html, events.into_iter());

    RenderedResponse {
        markdown: markdown.to_string(),
        html: ammonia::clean(&raw_html),
        code_blocks,
    }
}

fn div_open_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<div\b[^>]*>")
}

fn tag_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?s)<[^>]+>")
}

/// Text of the inline database error the query page shows, if any.
pub fn scrape_db_error(page_html: &str) -> Option<String> {
    let tag_re = tag_re()?;
    div_open_re()?.find_iter(page_html).find_map(|open| {
        let tag = open.as_str();
        if !(has_class(tag, "alert-danger") && has_class(tag, "db-error")) {
            return None;
        }
        let rest = &page_html[open.end()..];
        let body = rest.find("</div>").map_or(rest, |end| &rest[..end]);
        let text = tag_re.replace_all(body, "");
        let text = decode_basic_entities(text.trim());
        (!text.is_empty()).then_some(text)
    })
}

pub(crate) fn decode_basic_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// One row of the history view, safe to place into markup.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub user_request: String,
    pub response_html: String,
    pub response_markdown: String,
}

/// Things outside the panel that a submission reads or updates.
pub struct AssistantContext<'a> {
    pub editor: &'a mut EditorHost,
    pub selector: &'a TableSelector,
    pub connection_id: Option<&'a str>,
    pub db_error: Option<&'a str>,
    pub description: Option<&'a mut FormField>,
}

/// Whether the panel starts open: on request, or when there is an error to
/// explain.
pub fn should_expand(expand: bool, db_error: Option<&str>) -> bool {
    expand || db_error.is_some()
}

#[derive(Debug, Default)]
pub struct AssistantPanel {
    pub input: String,
    pub expanded: bool,
    pub loading: bool,
    pub response_visible: bool,
    pub error_help_visible: bool,
    response: Option<RenderedResponse>,
}

impl AssistantPanel {
    /// Panel state on page load: open when asked to or when the page shows
    /// a database error, in which case the error hint is shown too.
    pub fn new(expand: bool, db_error: Option<&str>) -> Self {
        Self {
            expanded: should_expand(expand, db_error),
            error_help_visible: db_error.is_some(),
            ..Self::default()
        }
    }

    pub fn response(&self) -> Option<&RenderedResponse> {
        self.response.as_ref()
    }

    pub fn build_request(&self, ctx: &AssistantContext<'_>) -> AssistantRequest {
        AssistantRequest {
            sql: Some(ctx.editor.text().to_string()),
            connection_id: ctx.connection_id.map(str::to_string),
            assistant_request: Some(self.input.clone()),
            selected_tables: ctx.selector.selected_for_request(),
            db_error: ctx.db_error.map(str::to_string),
        }
    }

    /// Sends the request and renders the reply.
    ///
    /// On failure the error is logged and returned; the loading flag is
    /// left set, matching the behavior users currently see.
    pub fn submit<B: AssistantBackend + ?Sized>(
        &mut self,
        backend: &B,
        ctx: AssistantContext<'_>,
    ) -> Result<&RenderedResponse> {
        let request = self.build_request(&ctx);

        self.response = None;
        self.response_visible = true;
        self.loading = true;

        info!(
            target: "assistant",
            "Asking assistant with {} selected tables",
            request.selected_tables.len()
        );
        let reply = match backend.ask(&request) {
            Ok(reply) => reply,
            Err(e) => {
                error!(target: "assistant", "Assistant request failed: {}", e);
                return Err(e);
            }
        };

        let rendered = render_markdown(reply.message.as_deref().unwrap_or_default());
        self.loading = false;

        if rendered.code_blocks.len() == 1 && ctx.editor.is_empty() {
            ctx.editor.insert(0, &rendered.code_blocks[0]);
        }

        if let Some(description) = ctx.description {
            if description.value.is_empty() {
                description.value = self.input.clone();
            }
        }

        Ok(self.response.insert(rendered))
    }

    /// Past prompts and replies for a connection, newest as the server
    /// orders them.
    pub fn history<B: AssistantBackend + ?Sized>(
        &self,
        backend: &B,
        connection_id: Option<&str>,
    ) -> Result<Vec<HistoryEntry>> {
        let logs = backend.history(connection_id).map_err(|e| {
            error!(target: "assistant", "Assistant history request failed: {}", e);
            e
        })?;

        Ok(logs
            .into_iter()
            .map(|log| {
                let markdown = log.response.unwrap_or_default();
                HistoryEntry {
                    user_request: ammonia::clean_text(&log.user_request),
                    response_html: render_markdown(&markdown).html,
                    response_markdown: markdown,
                }
            })
            .collect())
    }

    /// Code block `index` of the current reply.
    pub fn code_block(&self, index: usize) -> Option<&str> {
        self.response
            .as_ref()
            .and_then(|r| r.code_blocks.get(index))
            .map(String::as_str)
    }
}

pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new().context("Clipboard is not available")?;
    clipboard
        .set_text(text.to_string())
        .context("Error in copying text")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_never_survives() {
        let rendered = render_markdown(
            "Try this:\n\n<script>alert('x')</script>\n\n<img src=x onerror=\"alert(1)\">",
        );
        assert!(!rendered.html.contains("<script"));
        assert!(!rendered.html.contains("alert('x')"));
        assert!(!rendered.html.contains("onerror"));
    }

    #[test]
    fn test_code_blocks_collected() {
        let rendered = render_markdown(
            "Here you go:\n\n```sql\nSELECT *\nFROM users;\n```\n\nand inline `code` too",
        );
        assert_eq!(rendered.code_blocks, vec!["SELECT *\nFROM users;\n"]);
        assert!(rendered.html.contains("<pre>"));
    }

    #[test]
    fn test_script_inside_code_block_is_escaped() {
        let rendered = render_markdown("```\n<script>bad()</script>\n```");
        assert!(!rendered.html.contains("<script>"));
        assert!(rendered.html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_scrape_db_error() {
        let page = r#"<div class="row"><div class="alert alert-danger db-error">
            relation &quot;userz&quot; does not exist</div></div>"#;
        assert_eq!(
            scrape_db_error(page).as_deref(),
            Some("relation \"userz\" does not exist")
        );
        assert_eq!(
            scrape_db_error(r#"<div class="alert alert-danger">other</div>"#),
            None
        );
    }

    #[test]
    fn test_panel_expands_on_error() {
        let panel = AssistantPanel::new(false, Some("boom"));
        assert!(panel.expanded);
        assert!(panel.error_help_visible);

        let panel = AssistantPanel::new(false, None);
        assert!(!panel.expanded);
        assert!(!panel.error_help_visible);
    }
}
