//! The query editor page: one owner for the editor, the table picker, the
//! assistant panel, the pivot view and the schema lookup of the connection
//! the page is bound to.

use anyhow::{anyhow, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::assistant::{
    decode_basic_entities, scrape_db_error, AssistantBackend, AssistantContext, AssistantPanel,
    RenderedResponse,
};
use crate::config::config::Config;
use crate::data_exporter::{download_csv, RenderedTable};
use crate::editor::{EditorEvent, EditorHost, FormField};
use crate::pivot::PivotView;
use crate::routes::{query_id_from_page, ClientRoute};
use crate::schema_cache::{Schema, SchemaService, SchemaSource};
use crate::schema_panel::tooltip;
use crate::table_selector::TableSelector;
use crate::utils::patterns::{attribute, cached, has_class};

/// Characters `encodeURIComponent` leaves alone
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Per-session knobs for editor pages.
#[derive(Debug, Clone)]
pub struct PageSettings {
    pub connection: String,
    pub doc_debounce_ms: u64,
    pub request_debounce_ms: u64,
    pub expand_assistant: bool,
    pub bookmark_base_url: String,
}

impl PageSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection: config.server.default_connection.clone(),
            doc_debounce_ms: config.editor.doc_changed_debounce_ms,
            request_debounce_ms: config.editor.request_input_debounce_ms,
            expand_assistant: config.behavior.expand_assistant,
            bookmark_base_url: config.server.base_url.clone(),
        }
    }
}

/// What an editor page was rendered with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageContent {
    pub sql: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub connection: Option<String>,
    pub db_error: Option<String>,
    pub params: Vec<(String, String)>,
}

impl PageContent {
    pub fn from_html(page_html: &str) -> Self {
        Self {
            sql: textarea(page_html, "id_sql").unwrap_or_default(),
            description: textarea(page_html, "id_description"),
            connection: selected_option(page_html, "id_connection"),
            title: input_value(page_html, "id_title"),
            db_error: scrape_db_error(page_html),
            params: param_fields(page_html),
        }
    }
}

fn textarea_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<textarea\b([^>]*)>(.*?)</textarea>")
}

fn select_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<select\b([^>]*)>(.*?)</select>")
}

fn option_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<option\b([^>]*)>")
}

fn selected_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r#"(?i)(^|\s)selected(\s|=|$)"#)
}

fn input_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?is)<input\b([^>]*)>")
}

pub(crate) fn textarea(page_html: &str, id: &str) -> Option<String> {
    let caps = textarea_re()?
        .captures_iter(page_html)
        .find(|c| attribute(&c[1], "id").as_deref() == Some(id))?;
    let raw = caps.get(2)?.as_str();
    // A newline right after the opening tag is not part of the value
    let raw = raw.strip_prefix("\r\n").or_else(|| raw.strip_prefix('\n')).unwrap_or(raw);
    Some(decode_basic_entities(raw))
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    attribute(attrs, name).map(|v| decode_basic_entities(&v))
}

/// Value of the chosen option of `<select id=...>`, falling back to the
/// first option as a browser would.
pub(crate) fn selected_option(page_html: &str, id: &str) -> Option<String> {
    let caps = select_re()?
        .captures_iter(page_html)
        .find(|c| attribute(&c[1], "id").as_deref() == Some(id))?;
    let options = caps.get(2)?.as_str();
    let all: Vec<String> = option_re()?
        .captures_iter(options)
        .map(|c| c[1].to_string())
        .collect();
    let selected_re = selected_re()?;
    let chosen = all
        .iter()
        .find(|attrs| selected_re.is_match(attrs))
        .or_else(|| all.first())?;
    attr_value(chosen, "value")
}

/// `value` of the `<input>` with the given id.
fn input_value(page_html: &str, id: &str) -> Option<String> {
    input_re()?
        .captures_iter(page_html)
        .find(|c| attribute(&c[1], "id").as_deref() == Some(id))
        .and_then(|c| attr_value(&c[1], "value"))
}

fn param_fields(page_html: &str) -> Vec<(String, String)> {
    let Some(input_re) = input_re() else {
        return Vec::new();
    };
    input_re
        .captures_iter(page_html)
        .filter_map(|c| {
            let attrs = &c[1];
            if !has_class(attrs, "param") {
                return None;
            }
            let key = attr_value(attrs, "data-param")?;
            Some((key, attr_value(attrs, "value").unwrap_or_default()))
        })
        .collect()
}

/// `key:value|key:value`, percent-encoded as one URI component.
pub fn serialize_params(params: &[(String, String)]) -> String {
    let joined = params
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("|");
    utf8_percent_encode(&joined, URI_COMPONENT).to_string()
}

/// Sets, replaces or (with `None`) removes `key` in the query string of
/// `url`, keeping any fragment.
pub fn update_query_string(key: &str, value: Option<&str>, url: &str) -> String {
    let Ok(re) = Regex::new(&format!(r"(?i)([?&]){}=.*?(&|#|$)(.*)", regex::escape(key))) else {
        return url.to_string();
    };
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };

    if re.is_match(url) {
        match value {
            Some(value) => re
                .replace(url, |c: &regex::Captures| {
                    format!("{}{}={}{}{}", &c[1], key, value, &c[2], &c[3])
                })
                .into_owned(),
            None => {
                let mut out = re
                    .replace(base, |c: &regex::Captures| format!("{}{}", &c[1], &c[3]))
                    .into_owned();
                if out.ends_with('&') || out.ends_with('?') {
                    out.pop();
                }
                if let Some(fragment) = fragment {
                    out.push('#');
                    out.push_str(fragment);
                }
                out
            }
        }
    } else {
        match value {
            Some(value) => {
                let separator = if url.contains('?') { '&' } else { '?' };
                let mut out = format!("{}{}{}={}", base, separator, key, value);
                if let Some(fragment) = fragment {
                    out.push('#');
                    out.push_str(fragment);
                }
                out
            }
            None => url.to_string(),
        }
    }
}

/// Sends an editor form to the server and returns the page it answers
/// with, after redirects.
pub trait FormSubmitter {
    fn submit_form(&self, path: &str, fields: &[(String, String)]) -> Result<String>;
}

/// What the submit buttons ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAction {
    /// Save and show the results
    Run,
    /// Save without running
    Save,
}

pub struct EditorPage<S> {
    route: ClientRoute,
    query_id: String,
    connection: String,
    sql_field: FormField,
    title: Option<String>,
    description: Option<FormField>,
    params: Vec<(String, String)>,
    db_error: Option<String>,
    editor: EditorHost,
    events: Receiver<EditorEvent>,
    selector: TableSelector,
    assistant: AssistantPanel,
    pivot: PivotView,
    schema: SchemaService<S>,
}

impl<S: SchemaSource> EditorPage<S> {
    pub fn new(
        route: ClientRoute,
        query_id: &str,
        content: PageContent,
        source: S,
        settings: &PageSettings,
    ) -> Self {
        let mut sql_field = FormField::new(&content.sql);
        let mut editor = EditorHost::attach(&mut sql_field);
        let events = editor.subscribe();

        let assistant = AssistantPanel::new(settings.expand_assistant, content.db_error.as_deref());
        let connection = content
            .connection
            .unwrap_or_else(|| settings.connection.clone());

        Self {
            route,
            query_id: query_id.to_string(),
            connection,
            sql_field,
            title: content.title,
            description: content.description.map(|d| FormField::new(&d)),
            params: content.params,
            db_error: content.db_error,
            editor,
            events,
            selector: TableSelector::new(settings.doc_debounce_ms, settings.request_debounce_ms),
            assistant,
            pivot: PivotView::new(&settings.bookmark_base_url),
            schema: SchemaService::new(source),
        }
    }

    pub fn from_html(
        route: ClientRoute,
        query_id: &str,
        page_html: &str,
        source: S,
        settings: &PageSettings,
    ) -> Result<Self> {
        if !route.has_editor() {
            return Err(anyhow!("Route {} has no editor", route));
        }
        Ok(Self::new(
            route,
            query_id,
            PageContent::from_html(page_html),
            source,
            settings,
        ))
    }

    pub fn route(&self) -> ClientRoute {
        self.route
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn editor(&self) -> &EditorHost {
        &self.editor
    }

    pub fn editor_mut(&mut self) -> &mut EditorHost {
        &mut self.editor
    }

    pub fn selector(&self) -> &TableSelector {
        &self.selector
    }

    pub fn selector_mut(&mut self) -> &mut TableSelector {
        &mut self.selector
    }

    pub fn assistant(&self) -> &AssistantPanel {
        &self.assistant
    }

    pub fn assistant_mut(&mut self) -> &mut AssistantPanel {
        &mut self.assistant
    }

    pub fn pivot(&self) -> &PivotView {
        &self.pivot
    }

    pub fn pivot_mut(&mut self) -> &mut PivotView {
        &mut self.pivot
    }

    pub fn schema_service(&self) -> &SchemaService<S> {
        &self.schema
    }

    pub fn description(&self) -> Option<&FormField> {
        self.description.as_ref()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn set_title(&mut self, title: &str) {
        self.title = Some(title.to_string());
    }

    pub fn set_description(&mut self, description: &str) {
        match self.description.as_mut() {
            Some(field) => field.value = description.to_string(),
            None => self.description = Some(FormField::new(description)),
        }
    }

    pub fn db_error(&self) -> Option<&str> {
        self.db_error.as_deref()
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn set_param(&mut self, key: &str, value: &str) {
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(param) => param.1 = value.to_string(),
            None => self.params.push((key.to_string(), value.to_string())),
        }
    }

    /// Schema of the page's connection.
    pub fn schema(&self) -> Result<Arc<Schema>> {
        self.schema.get(&self.connection)
    }

    /// Binds the page to `connection`: loads its schema, rebuilds the table
    /// picker and pre-selects tables the current SQL mentions. If the schema
    /// cannot be loaded the page stays on its previous connection.
    pub fn connect(&mut self, connection: &str) -> Result<Arc<Schema>> {
        info!(target: "page", "Switching to connection '{}'", connection);
        let schema = self.schema.get(connection)?;
        self.connection = connection.to_string();
        self.selector.rebuild(&schema);
        self.selector.auto_select(self.editor.text());
        Ok(schema)
    }

    pub fn set_sql(&mut self, sql: &str) {
        self.editor.replace_all(sql);
    }

    pub fn set_request(&mut self, request: &str) {
        self.set_request_at(request, Instant::now());
    }

    pub fn set_request_at(&mut self, request: &str, now: Instant) {
        self.assistant.input = request.to_string();
        self.selector.on_request_input_at(now);
    }

    /// Drains editor events, arming the table-match debounce on edits.
    /// Submit and format requests are handed back to the caller.
    pub fn process_events_at(&mut self, now: Instant) -> Vec<EditorEvent> {
        let mut passed = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                EditorEvent::DocChanged => self.selector.on_doc_changed_at(now),
                other => passed.push(other),
            }
        }
        passed
    }

    /// Runs due debounced table matching. Returns true if the selection was
    /// re-evaluated.
    pub fn poll_at(&mut self, now: Instant) -> bool {
        self.process_events_at(now);
        let sql = self.editor.text().to_string();
        let request = self.assistant.input.clone();
        self.selector.poll_at(now, &sql, &request)
    }

    pub fn poll(&mut self) -> bool {
        self.poll_at(Instant::now())
    }

    /// The "refresh tables" button: start over from the SQL and the request.
    pub fn refresh_tables(&mut self) {
        let request = self.assistant.input.clone();
        self.selector.refresh(self.editor.text(), &request);
    }

    pub fn format<F>(&mut self, formatter: F) -> Result<()>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        let formatted = formatter(self.editor.text())?;
        self.editor.replace_all(&formatted);
        Ok(())
    }

    pub fn ask<B: AssistantBackend + ?Sized>(&mut self, backend: &B) -> Result<&RenderedResponse> {
        let ctx = AssistantContext {
            editor: &mut self.editor,
            selector: &self.selector,
            connection_id: Some(self.connection.as_str()),
            db_error: self.db_error.as_deref(),
            description: self.description.as_mut(),
        };
        self.assistant.submit(backend, ctx)
    }

    /// Columns of the table named under `offset`, or the not-found message.
    pub fn tooltip_at(&self, offset: usize) -> Result<Vec<String>> {
        let Some(word) = self.editor.word_at(offset) else {
            return Ok(Vec::new());
        };
        let schema = self.schema()?;
        Ok(tooltip(&schema, &word))
    }

    /// Server path the form posts to for `action`.
    pub fn submit_path(&self, action: SubmitAction) -> String {
        match (self.route, action) {
            (ClientRoute::Playground, action) => self.playground_url(action == SubmitAction::Run),
            (ClientRoute::QueryCreate, _) => ClientRoute::QueryCreate.path(None),
            (_, SubmitAction::Run) => self.save_url(),
            (_, SubmitAction::Save) => self.save_only_url(),
        }
    }

    /// Copies the editor into the form and returns the fields to post. The
    /// playground form only carries the SQL and the connection.
    pub fn form_fields(&mut self) -> Vec<(String, String)> {
        self.editor.sync_to_form(&mut self.sql_field);
        let mut fields = vec![
            ("sql".to_string(), self.sql_field.value.clone()),
            ("connection".to_string(), self.connection.clone()),
        ];
        if self.route != ClientRoute::Playground {
            fields.push(("title".to_string(), self.title.clone().unwrap_or_default()));
            let description = self
                .description
                .as_ref()
                .map(|d| d.value.clone())
                .unwrap_or_default();
            fields.push(("description".to_string(), description));
        }
        fields
    }

    /// Posts the form. Only an accepted submission clears the
    /// unsaved-changes guard; the answer's database error replaces the
    /// page's. A created query takes over the id the server assigned.
    pub fn submit<F: FormSubmitter + ?Sized>(
        &mut self,
        submitter: &F,
        action: SubmitAction,
    ) -> Result<String> {
        let path = self.submit_path(action);
        let fields = self.form_fields();
        info!(target: "page", "Submitting {} form to '{}'", self.route, path);

        let page_html = submitter.submit_form(&path, &fields).map_err(|e| {
            error!(target: "page", "Form submission failed: {}", e);
            e
        })?;

        self.editor.mark_saved();
        self.db_error = scrape_db_error(&page_html);
        if self.route == ClientRoute::QueryCreate {
            if let Some(id) = query_id_from_page(&page_html) {
                debug!(target: "page", "Created query {}", id);
                self.route = ClientRoute::QueryDetail;
                self.query_id = id;
            }
        }
        Ok(page_html)
    }

    pub fn unsaved_changes_warning(&self) -> Option<&'static str> {
        self.editor.unsaved_changes_warning(self.route)
    }

    fn params_query(&self) -> Option<String> {
        (!self.params.is_empty()).then(|| format!("params={}", serialize_params(&self.params)))
    }

    /// Save (and show) or refresh target for the current query.
    pub fn save_url(&self) -> String {
        let mut url = format!("{}/", self.query_id);
        if let Some(params) = self.params_query() {
            url.push('?');
            url.push_str(&params);
        }
        url
    }

    pub fn save_only_url(&self) -> String {
        let mut url = format!("{}/?show=0", self.query_id);
        if let Some(params) = self.params_query() {
            url.push('&');
            url.push_str(&params);
        }
        url
    }

    pub fn playground_url(&self, show: bool) -> String {
        if show {
            "play/".to_string()
        } else {
            "play/?show=0".to_string()
        }
    }

    pub fn download_url(&self, format: &str) -> String {
        let mut url = format!("{}/download?format={}", self.query_id, format);
        if let Some(params) = self.params_query() {
            url.push('&');
            url.push_str(&params);
        }
        url
    }

    /// `url` with its row limit set to `rows`.
    pub fn show_rows(&self, rows: usize, url: &str) -> String {
        update_query_string("rows", Some(&rows.to_string()), url)
    }

    /// Opens the pivot tab over `results`. Returns true when the page should
    /// switch to the pivot tab because a bookmark was restored.
    pub fn activate_pivot(&mut self, results: &RenderedTable, fragment: Option<&str>) -> bool {
        if self.pivot.activate(results, fragment) {
            debug!(target: "page", "Pivot initialized from {} rows", results.rows.len());
        }
        self.pivot.restored_from_bookmark()
    }

    pub fn export_pivot(&self, dir: &Path) -> Result<PathBuf> {
        let table = self
            .pivot
            .output()
            .ok_or_else(|| anyhow!("Open the pivot view before exporting"))?;
        download_csv(&table, dir)
    }
}
