use anyhow::{anyhow, bail, Result};
use crossterm::style::Stylize;
use reedline::{
    default_emacs_keybindings, ColumnarMenu, Emacs, FileBackedHistory, KeyCode, KeyModifiers,
    MenuBuilder, Prompt, PromptEditMode, PromptHistorySearch, PromptHistorySearchStatus, Reedline,
    ReedlineEvent, ReedlineMenu, Signal, ValidationResult, Validator,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{borrow::Cow, io};

use explorer_cli::api_client::ExplorerClient;
use explorer_cli::assistant::copy_to_clipboard;
use explorer_cli::config::config::Config;
use explorer_cli::csrf::CsrfSettings;
use explorer_cli::data_exporter::{RenderedTable, SortOrder};
use explorer_cli::page::{EditorPage, PageContent, PageSettings, SubmitAction};
use explorer_cli::pivot::{Aggregator, PivotState};
use explorer_cli::query_list::{self, QueryList};
use explorer_cli::routes::{dispatch, ClientRoute, Page};
use explorer_cli::schema_panel::{tooltip, SchemaPanel};
use explorer_cli::table_description::TableDescriptionPage;
use explorer_cli::uploads::{parse_form_fields, percent};
use explorer_cli::utils::app_paths::AppPaths;
use explorer_cli::utils::sql_highlighter::SqlHighlighter;

mod completer;
mod table_display;

use completer::{CompletionWords, SchemaCompleter};
use table_display::{display_queries, display_selection, display_table};

/// Commands are one line; SQL continues while quotes or parentheses are open.
struct SqlValidator;

impl Validator for SqlValidator {
    fn validate(&self, line: &str) -> ValidationResult {
        if line.trim_start().starts_with('\\') {
            return ValidationResult::Complete;
        }

        let mut depth = 0i32;
        let mut quote: Option<char> = None;
        for c in line.chars() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(c),
                (None, '(') => depth += 1,
                (None, ')') => depth -= 1,
                _ => {}
            }
        }
        if quote.is_some() || depth > 0 {
            ValidationResult::Incomplete
        } else {
            ValidationResult::Complete
        }
    }
}

struct ExplorerPrompt {
    connection: String,
    dirty: bool,
}

impl Prompt for ExplorerPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        let marker = if self.dirty { "*" } else { "" };
        Cow::Owned(format!("{}{} ", self.connection, marker))
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, edit_mode: PromptEditMode) -> Cow<'_, str> {
        match edit_mode {
            PromptEditMode::Default | PromptEditMode::Emacs => "> ".into(),
            PromptEditMode::Vi(vi_mode) => match vi_mode {
                reedline::PromptViMode::Normal => "N> ".into(),
                reedline::PromptViMode::Insert => "I> ".into(),
            },
            PromptEditMode::Custom(str) => format!("{str}> ").into(),
        }
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "failing ",
        };
        Cow::Owned(format!(
            "({}reverse search: {})",
            prefix, history_search.term
        ))
    }
}

fn print_help() {
    println!("{}", "Explorer CLI - terminal client for SQL Explorer".blue().bold());
    println!();
    println!("{}", "Usage:".yellow());
    println!("  explorer-cli [OPTIONS]");
    println!();
    println!("{}", "Options:".yellow());
    println!(
        "  {} - Generate config file with defaults",
        "--generate-config".green()
    );
    println!();
    println!("{}", "Editor:".yellow());
    println!("  Lines that are not commands are appended to the SQL buffer.");
    println!("  {}            - Show the buffer", "\\show".green());
    println!("  {}             - Save and run the buffer", "\\run".green());
    println!("  {}            - Save without running", "\\save".green());
    println!("  {}    - Set the query title", "\\title <text>".green());
    println!("  {}          - Start a new saved query from the buffer", "\\create".green());
    println!("  {}             - Empty the buffer", "\\new".green());
    println!("  {}          - Format the buffer on the server", "\\format".green());
    println!("  {}       - Columns of a table", "\\tip [table]".green());
    println!("  {}        - Load a saved query", "\\load <id>".green());
    println!("  {}     - Fetch a saved query's results", "\\results <id>".green());
    println!("  {}        - Show URLs with a row limit", "\\rows <n>".green());
    println!("  {} - Sort the results", "\\sort <col> [asc|desc]".green());
    println!();
    println!("{}", "Schema:".yellow());
    println!("  {}  - Switch connection", "\\connect <alias>".green());
    println!(
        "  {} - Schema panel",
        "\\panel [open|close|filter <t>|expand|collapse|toggle <t>]".green()
    );
    println!();
    println!("{}", "Assistant:".yellow());
    println!("  {}          - Tables sent as context", "\\tables".green());
    println!("  {} - Pick tables (* for all)", "\\select <t>...".green());
    println!("  {} - Unpick tables (* for all)", "\\deselect <t>...".green());
    println!("  {}         - Re-pick from SQL and request", "\\refresh".green());
    println!("  {}  - Ask for SQL", "\\ask <request>".green());
    println!("  {}         - Previous requests", "\\history".green());
    println!("  {}        - Copy a code block", "\\copy [n]".green());
    println!();
    println!("{}", "Pivot:".yellow());
    println!(
        "  {} - Pivot the last results",
        "\\pivot [#bookmark] [agg=<name>] [rows=a,b] [cols=c] [vals=v]".green()
    );
    println!("  {}    - Save pivot.csv", "\\export [dir]".green());
    println!();
    println!("{}", "Queries and connections:".yellow());
    println!("  {}  - List saved queries", "\\queries [term]".green());
    println!("  {}        - Toggle a favorite", "\\fav <id>".green());
    println!("  {} - Email results as CSV", "\\email <id> <addr>".green());
    println!("  {}  - Upload a csv/json/sqlite file", "\\upload <path>".green());
    println!("  {} - Test connection details", "\\validate k=v...".green());
    println!();
    println!("{}", "Table descriptions:".yellow());
    println!("  {} - Open a new or existing description", "\\describe new|edit <id>".green());
    println!(
        "  {}",
        "\\describe [find <t>|pick <table>|text <note>|connect <c>|save]".green()
    );
    println!();
    println!("  {}  {}  {}  {}", "\\log".green(), "\\help".green(), "\\clear".green(), "\\quit".green());
    println!();
}

/// Parses `\pivot` arguments on top of `current`.
fn parse_pivot_args(current: &PivotState, args: &[&str]) -> Result<PivotState> {
    let mut state = current.clone();
    let split = |v: &str| -> Vec<String> {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected key=value, got '{}'", arg))?;
        match key {
            "agg" => {
                let name = value.replace('_', " ");
                if Aggregator::from_name(&name).is_none() {
                    bail!(
                        "Unknown aggregator '{}'. Choose from: {}",
                        name,
                        Aggregator::names().join(", ")
                    );
                }
                state.aggregator_name = name;
            }
            "rows" => state.rows = split(value),
            "cols" => state.cols = split(value),
            "vals" => state.vals = split(value),
            _ => bail!("Unknown pivot setting '{}'", key),
        }
    }
    Ok(state)
}

struct Session {
    config: Config,
    client: Arc<ExplorerClient>,
    page: EditorPage<Arc<ExplorerClient>>,
    description: Option<TableDescriptionPage<Arc<ExplorerClient>>>,
    panel: SchemaPanel,
    panel_filter: String,
    queries: Option<QueryList>,
    last_results: Option<RenderedTable>,
    highlighter: SqlHighlighter,
    words: Arc<Mutex<CompletionWords>>,
    quit_warned: bool,
}

impl Session {
    fn settings(&self, bookmark_base_url: String) -> PageSettings {
        PageSettings {
            connection: self.page.connection().to_string(),
            bookmark_base_url,
            ..PageSettings::from_config(&self.config)
        }
    }

    fn highlight(&self, sql: &str) -> String {
        if self.config.editor.syntax_highlighting {
            self.highlighter.highlight(sql)
        } else {
            sql.to_string()
        }
    }

    /// Waits out pending table matching so commands see a settled selection.
    fn settle(&mut self) {
        self.page.poll();
        while self.page.selector().has_pending() {
            std::thread::sleep(Duration::from_millis(25));
            self.page.poll();
        }
    }

    fn connect(&mut self, connection: &str) -> Result<()> {
        let schema = self.page.connect(connection)?;
        if let Ok(mut words) = self.words.lock() {
            words.update(&schema);
        }
        println!(
            "{}",
            format!("Connected to '{}' ({} tables)", connection, schema.len()).cyan()
        );
        Ok(())
    }

    fn load_query(&mut self, id: &str) -> Result<()> {
        self.open_editor(ClientRoute::QueryDetail, Some(id))?;
        println!("{}", self.highlight(self.page.editor().text()));
        Ok(())
    }

    /// Switches to the create form, carrying the current buffer over.
    fn create_query(&mut self) -> Result<()> {
        let sql = self.page.editor().text().to_string();
        self.open_editor(ClientRoute::QueryCreate, None)?;
        if !sql.is_empty() {
            self.page.set_sql(&sql);
        }
        println!("{}", "New query: set a \\title, then \\save.".cyan());
        Ok(())
    }

    fn open_editor(&mut self, route: ClientRoute, id: Option<&str>) -> Result<()> {
        let path = route.path(id);
        let html = self.client.get_page(&path)?;
        let route = ClientRoute::from_page(&html).unwrap_or(route);
        let settings = self.settings(self.client.url(&path)?.to_string());
        match dispatch(route, id, &html, Arc::clone(&self.client), &settings)? {
            Page::Editor(page) => {
                self.page = *page;
                let connection = self.page.connection().to_string();
                if let Err(e) = self.connect(&connection) {
                    eprintln!("{}", format!("Schema unavailable: {}", e).red());
                }
                if let Some(err) = self.page.db_error() {
                    println!("{}", format!("Database error: {}", err).red());
                }
                Ok(())
            }
            _ => bail!("{} is not an editor page", path),
        }
    }

    fn submit(&mut self, action: SubmitAction) -> Result<()> {
        let client = Arc::clone(&self.client);
        let target = client.url(&self.page.submit_path(action))?;
        self.page.submit(client.as_ref(), action)?;
        println!("{}", format!("Submitted to {}", target).green());

        if let Some(err) = self.page.db_error() {
            println!("{}", format!("Database error: {}", err).red());
        } else if action == SubmitAction::Run && self.page.route() == ClientRoute::QueryDetail {
            let id = self.page.query_id().to_string();
            self.results(&id)?;
        }
        Ok(())
    }

    fn sort(&mut self, args: &[&str]) -> Result<()> {
        let (column, order) = match args {
            [column] => (*column, SortOrder::Ascending),
            [column, order] => (*column, order.parse()?),
            _ => bail!("Usage: \\sort <column> [asc|desc]"),
        };
        let results = self
            .last_results
            .as_mut()
            .ok_or_else(|| anyhow!("No results to sort. Use \\results <id> first."))?;
        results.sort_by_name(column, order)?;
        display_table(results);
        Ok(())
    }

    fn open_description(&mut self, id: Option<&str>) -> Result<()> {
        let route = match id {
            Some(_) => ClientRoute::TableDescriptionUpdate,
            None => ClientRoute::TableDescriptionCreate,
        };
        let path = route.path(id);
        let html = self.client.get_page(&path)?;
        let settings = self.settings(self.client.url(&path)?.to_string());
        match dispatch(route, id, &html, Arc::clone(&self.client), &settings)? {
            Page::TableDescription(mut page) => {
                let connection = page.connection().to_string();
                page.connect(&connection)?;
                self.description = Some(*page);
                Ok(())
            }
            _ => bail!("{} is not a table description page", path),
        }
    }

    fn describe(&mut self, args: &[&str]) -> Result<()> {
        match args {
            ["new"] => self.open_description(None)?,
            ["edit", id] => self.open_description(Some(*id))?,
            _ => {
                let client = Arc::clone(&self.client);
                let page = self
                    .description
                    .as_mut()
                    .ok_or_else(|| anyhow!("Open a description first: \\describe new"))?;
                match args {
                    [] => {}
                    ["find", terms @ ..] => {
                        println!("{}", page.picker().search(&terms.join(" ")).join("  "));
                        return Ok(());
                    }
                    ["pick", table] => page.picker_mut().choose(table)?,
                    ["text", words @ ..] => page.set_description(&words.join(" ")),
                    ["connect", connection] => {
                        page.connect(connection)?;
                    }
                    ["save"] => {
                        page.submit(client.as_ref())?;
                        println!("{}", "Table description saved.".green());
                        return Ok(());
                    }
                    _ => bail!("Unknown \\describe action. Try \\help"),
                }
            }
        }

        if let Some(page) = &self.description {
            println!("{} {}", "Connection:".dark_grey(), page.connection());
            println!("{} {}", "Table:".dark_grey(), page.picker().label());
            println!("{} {}", "Description:".dark_grey(), page.description());
            println!("{} {}", "Tables:".dark_grey(), page.picker().tables().join("  "));
        }
        Ok(())
    }

    fn show_tables(&mut self) {
        self.settle();
        display_selection(self.page.selector().tables(), &self.page.selector().selected());
    }

    fn tip(&self, word: Option<&str>) -> Result<()> {
        let word = match word {
            Some(word) => word.to_string(),
            None => {
                let end = self.page.editor().len();
                self.page
                    .editor()
                    .word_at(end)
                    .ok_or_else(|| anyhow!("No table name under the cursor"))?
            }
        };
        let schema = self.page.schema()?;
        println!("{}", tooltip(&schema, &word).join("  "));
        Ok(())
    }

    fn panel(&mut self, args: &[&str]) -> Result<()> {
        match args.first().copied() {
            None | Some("open") => {
                let client = Arc::clone(&self.client);
                let connection = self.page.connection().to_string();
                let url = self
                    .panel
                    .show(&connection, |c| Ok(client.schema_page_url(c)?.to_string()))?;
                println!("{}", url.as_str().cyan());
            }
            Some("close") => {
                self.panel.hide()?;
                println!("Schema panel closed");
                return Ok(());
            }
            Some("filter") => self.panel_filter = args[1..].join(" "),
            Some("expand") => {
                let schema = self.page.schema()?;
                self.panel.expand_all(&schema);
            }
            Some("collapse") => self.panel.collapse_all(),
            Some("toggle") => {
                for table in &args[1..] {
                    self.panel.toggle(table);
                }
            }
            Some(other) => bail!("Unknown panel action '{}'", other),
        }

        let schema = self.page.schema()?;
        for (table, columns) in self.panel.render(&schema, &self.panel_filter) {
            let marker = if columns.is_empty() { "+" } else { "-" };
            println!("{} {}", marker, table.as_str().bold());
            for column in columns {
                println!("    {}", column);
            }
        }
        Ok(())
    }

    fn ask(&mut self, request: &str) -> Result<()> {
        self.page.set_request(request);
        self.settle();
        let was_empty = self.page.editor().is_empty();

        let client = Arc::clone(&self.client);
        print!("{}", "Thinking...".dark_grey());
        io::stdout().flush().ok();
        let response = self.page.ask(client.as_ref())?.clone();
        println!("\r{}", " ".repeat(11));

        println!("{}", response.markdown);
        for (i, block) in response.code_blocks.iter().enumerate() {
            println!("{}", format!("[{}]", i).dark_grey());
            println!("{}", self.highlight(block));
        }
        if was_empty && !self.page.editor().is_empty() {
            println!("{}", "Code block copied into the editor.".green());
        }
        Ok(())
    }

    fn history(&self) -> Result<()> {
        let entries = self
            .page
            .assistant()
            .history(self.client.as_ref(), Some(self.page.connection()))?;
        if entries.is_empty() {
            println!("{}", "No assistant history for this connection.".yellow());
        }
        for entry in entries {
            println!("{} {}", ">".cyan(), entry.user_request);
            println!("{}", entry.response_markdown);
            println!();
        }
        Ok(())
    }

    fn pivot(&mut self, args: &[&str]) -> Result<()> {
        let results = self
            .last_results
            .as_ref()
            .ok_or_else(|| anyhow!("No results to pivot. Use \\results <id> first."))?;

        let (fragment, settings): (Option<&str>, Vec<&str>) = match args.first() {
            Some(first) if first.starts_with('#') => (Some(*first), args[1..].to_vec()),
            _ => (None, args.to_vec()),
        };
        if self.page.activate_pivot(results, fragment) {
            println!("{}", "Restored pivot from bookmark.".green());
        }
        if !settings.is_empty() {
            let state = parse_pivot_args(self.page.pivot().state(), &settings)?;
            self.page.pivot_mut().refresh(state);
        }

        if let Some(output) = self.page.pivot().output() {
            display_table(&output);
        }
        if let Some(href) = self.page.pivot().bookmark_href() {
            println!("{} {}", "Bookmark:".dark_grey(), href);
        }
        Ok(())
    }

    fn export(&self, dir: Option<&str>) -> Result<()> {
        let dir: PathBuf = match dir {
            Some(dir) => PathBuf::from(dir),
            None => match &self.config.behavior.download_dir {
                Some(dir) => dir.clone(),
                None => AppPaths::download_dir()?,
            },
        };
        let path = self.page.export_pivot(&dir)?;
        println!("{}", format!("Pivot exported to {}", path.display()).green());
        Ok(())
    }

    fn queries(&mut self, term: &str) -> Result<()> {
        if self.queries.is_none() {
            let html = self.client.query_list_page()?;
            let settings = self.settings(self.client.base_url().to_string());
            if let Page::QueryList(list) = dispatch(
                ClientRoute::ExplorerIndex,
                None,
                &html,
                Arc::clone(&self.client),
                &settings,
            )? {
                self.queries = Some(list);
            }
        }
        let list = self
            .queries
            .as_ref()
            .ok_or_else(|| anyhow!("Query list unavailable"))?;
        display_queries(&list.search(term));
        Ok(())
    }

    fn favorite(&mut self, id: &str) -> Result<()> {
        if self.queries.is_none() {
            self.queries("")?;
        }
        let client = Arc::clone(&self.client);
        let list = self
            .queries
            .as_mut()
            .ok_or_else(|| anyhow!("Query list unavailable"))?;
        let now = list.toggle_favorite(id, |url| client.toggle_favorite(url))?;
        println!("Query {} is {}a favorite", id, if now { "now " } else { "no longer " });
        Ok(())
    }

    fn email(&self, id: &str, address: &str) -> Result<()> {
        let response =
            query_list::email_csv(id, address, |id, email| self.client.email_csv(id, email))?;
        let message = response
            .message
            .unwrap_or_else(|| "Email will be sent when query completes.".to_string());
        println!("{}", message.green());
        Ok(())
    }

    fn upload(&self, path: &str) -> Result<()> {
        let response = self.client.upload_file(Path::new(path), |sent, total| {
            print!("\rUploading: {}%", percent(sent, total));
            io::stdout().flush().ok();
        })?;
        println!();
        match response.error {
            Some(error) if !response.success => bail!("Upload failed: {}", error),
            _ => println!("{}", "Upload successful.".green()),
        }
        Ok(())
    }

    fn validate(&self, args: &[&str]) -> Result<()> {
        let fields = parse_form_fields(args)?;
        let result = self.client.validate_connection(&fields)?;
        if result.success {
            println!("{}", result.message().green());
        } else {
            println!("{}", result.message().red());
        }
        Ok(())
    }

    fn results(&mut self, id: &str) -> Result<()> {
        let table = self.client.query_results(id)?;
        display_table(&table);
        self.last_results = Some(table);
        Ok(())
    }

    fn rows(&self, rows: &str) -> Result<()> {
        let rows: usize = rows.parse().map_err(|_| anyhow!("Row count must be a number"))?;
        let page_url = self.client.url(&self.page.save_url())?.to_string();
        println!("{}", self.page.show_rows(rows, &page_url));
        let download = self.client.url(&self.page.download_url("csv"))?.to_string();
        println!("{}", self.page.show_rows(rows, &download));
        Ok(())
    }

    fn format(&mut self) -> Result<()> {
        let client = Arc::clone(&self.client);
        self.page.format(|sql| client.format_sql(sql))?;
        println!("{}", self.highlight(self.page.editor().text()));
        Ok(())
    }

    fn show_log(&self) {
        match explorer_cli::utils::logging::get_log_buffer() {
            Some(buffer) => {
                for entry in buffer.get_recent(30) {
                    println!("{}", entry.format_for_display());
                }
            }
            None => println!("{}", "Logging is not initialized.".yellow()),
        }
    }

    /// Runs one command line. Returns false when the session should end.
    fn handle_command(&mut self, line: &str) -> Result<bool> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = parts.first().copied().unwrap_or_default();
        let args = &parts[1..];
        let rest = line[command.len()..].trim();

        if command != "\\quit" {
            self.quit_warned = false;
        }

        match command {
            "\\help" => print_help(),
            "\\clear" => print!("{esc}[2J{esc}[1;1H", esc = 27 as char),
            "\\quit" => {
                if let Some(warning) = self.page.unsaved_changes_warning() {
                    if !self.quit_warned {
                        println!("{}", format!("{} \\quit again to leave.", warning).yellow());
                        self.quit_warned = true;
                        return Ok(true);
                    }
                }
                return Ok(false);
            }
            "\\connect" => {
                let connection = args.first().ok_or_else(|| anyhow!("Usage: \\connect <alias>"))?;
                self.connect(connection)?;
            }
            "\\schema" | "\\panel" => self.panel(args)?,
            "\\tables" => self.show_tables(),
            "\\select" => {
                if args == ["*"] {
                    self.page.selector_mut().select_all();
                } else {
                    self.page.selector_mut().select(args);
                }
                self.show_tables();
            }
            "\\deselect" => {
                if args == ["*"] {
                    self.page.selector_mut().deselect_all();
                } else {
                    self.page.selector_mut().deselect(args);
                }
                self.show_tables();
            }
            "\\refresh" => {
                self.settle();
                self.page.refresh_tables();
                self.show_tables();
            }
            "\\tip" => self.tip(args.first().copied())?,
            "\\ask" => {
                if rest.is_empty() {
                    bail!("Usage: \\ask <request>");
                }
                self.ask(rest)?;
            }
            "\\history" => self.history()?,
            "\\copy" => {
                let index = match args.first() {
                    Some(n) => n.parse().map_err(|_| anyhow!("Usage: \\copy [n]"))?,
                    None => 0,
                };
                let block = self
                    .page
                    .assistant()
                    .code_block(index)
                    .ok_or_else(|| anyhow!("No code block {}", index))?;
                copy_to_clipboard(block)?;
                println!("{}", "Copied!".green());
            }
            "\\format" => self.format()?,
            "\\show" => println!("{}", self.highlight(self.page.editor().text())),
            "\\run" => self.submit(SubmitAction::Run)?,
            "\\new" => self.page.editor_mut().clear(),
            "\\load" => {
                let id = args.first().ok_or_else(|| anyhow!("Usage: \\load <id>"))?;
                self.load_query(id)?;
            }
            "\\save" => self.submit(SubmitAction::Save)?,
            "\\title" => {
                if rest.is_empty() {
                    bail!("Usage: \\title <text>");
                }
                self.page.set_title(rest);
            }
            "\\create" => self.create_query()?,
            "\\sort" => self.sort(args)?,
            "\\describe" => self.describe(args)?,
            "\\results" => {
                let id = args.first().ok_or_else(|| anyhow!("Usage: \\results <id>"))?;
                self.results(id)?;
            }
            "\\rows" => {
                let rows = args.first().ok_or_else(|| anyhow!("Usage: \\rows <n>"))?;
                self.rows(rows)?;
            }
            "\\pivot" => self.pivot(args)?,
            "\\export" => self.export(args.first().copied())?,
            "\\queries" => self.queries(rest)?,
            "\\fav" => {
                let id = args.first().ok_or_else(|| anyhow!("Usage: \\fav <id>"))?;
                self.favorite(id)?;
            }
            "\\email" => match args {
                [id, address] => self.email(id, address)?,
                _ => bail!("Usage: \\email <id> <address>"),
            },
            "\\upload" => {
                if rest.is_empty() {
                    bail!("Usage: \\upload <path>");
                }
                self.upload(rest)?;
            }
            "\\validate" => self.validate(args)?,
            "\\log" => self.show_log(),
            other => bail!("Unknown command '{}'. Try \\help", other),
        }
        Ok(true)
    }
}

fn generate_config() -> Result<()> {
    let path = Config::get_config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, Config::create_default_with_comments())?;
    println!("Configuration file created at: {:?}", path);
    println!("Edit this file to point the CLI at your explorer instance.");
    Ok(())
}

fn main() -> io::Result<()> {
    explorer_cli::utils::logging::init_tracing_with_dual_logging();

    if let Some(dual_logger) = explorer_cli::utils::dual_logging::get_dual_logger() {
        eprintln!("Debug logs will be written to:");
        eprintln!("   {}", dual_logger.log_path().display());
        eprintln!();
    }

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--generate-config") {
        if let Err(e) = generate_config() {
            eprintln!("Error writing config file: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("{}", format!("Ignoring unreadable config: {}", e).yellow());
        Config::default()
    });

    let client = match ExplorerClient::new(
        &config.server.base_url,
        CsrfSettings::new(
            &config.server.csrf_cookie_name,
            config.server.csrf_cookie_httponly,
        ),
        Duration::from_secs(config.server.timeout_secs),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("{}", format!("Error: {}", e).red());
            std::process::exit(1);
        }
    };

    // The playground page seeds the CSRF cookie and the connection list
    let playground_path = ClientRoute::Playground.path(None);
    let content = match client.get_page(&playground_path) {
        Ok(html) => PageContent::from_html(&html),
        Err(e) => {
            eprintln!("{}", format!("Could not load the playground page: {}", e).yellow());
            PageContent::default()
        }
    };
    let mut settings = PageSettings::from_config(&config);
    if let Ok(url) = client.url(&playground_path) {
        settings.bookmark_base_url = url.to_string();
    }
    let page = EditorPage::new(
        ClientRoute::Playground,
        "new",
        content,
        Arc::clone(&client),
        &settings,
    );

    let panel = match AppPaths::panel_state_file() {
        Ok(path) => SchemaPanel::load(path),
        Err(_) => SchemaPanel::in_memory(),
    };

    let words = Arc::new(Mutex::new(CompletionWords::default()));
    let mut session = Session {
        config,
        client,
        page,
        description: None,
        panel,
        panel_filter: String::new(),
        queries: None,
        last_results: None,
        highlighter: SqlHighlighter::new(),
        words: Arc::clone(&words),
        quit_warned: false,
    };

    print_help();
    println!(
        "{}",
        format!("Explorer at {}", session.client.base_url()).cyan()
    );
    let connection = session.page.connection().to_string();
    if let Err(e) = session.connect(&connection) {
        eprintln!("{}", format!("Schema unavailable: {}", e).red());
    }
    if session.panel.is_open() {
        if let Err(e) = session.panel(&[]) {
            eprintln!("{}", format!("Error: {}", e).red());
        }
    }
    if session.page.assistant().expanded {
        println!("{}", "Assistant ready: \\ask <request>".dark_grey());
    }

    let completion_menu = Box::new(
        ColumnarMenu::default()
            .with_name("explorer_completion")
            .with_columns(1)
            .with_column_width(None)
            .with_column_padding(2),
    );

    let mut keybindings = default_emacs_keybindings();
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Tab,
        ReedlineEvent::Menu("explorer_completion".to_string()),
    );
    keybindings.add_binding(
        KeyModifiers::CONTROL,
        KeyCode::Char('f'),
        ReedlineEvent::ExecuteHostCommand("\\format".to_string()),
    );
    keybindings.add_binding(
        KeyModifiers::CONTROL,
        KeyCode::Char('s'),
        ReedlineEvent::ExecuteHostCommand("\\tip".to_string()),
    );

    let mut line_editor = Reedline::create()
        .with_completer(Box::new(SchemaCompleter::new(words)))
        .with_menu(ReedlineMenu::EngineCompleter(completion_menu))
        .with_validator(Box::new(SqlValidator))
        .with_edit_mode(Box::new(Emacs::new(keybindings)));

    if session.config.behavior.enable_history {
        let history = AppPaths::history_file().and_then(|path| {
            FileBackedHistory::with_file(session.config.behavior.max_history_entries, path)
                .map_err(|e| anyhow!("{}", e))
        });
        match history {
            Ok(history) => line_editor = line_editor.with_history(Box::new(history)),
            Err(e) => eprintln!("{}", format!("History disabled: {}", e).yellow()),
        }
    }

    loop {
        let prompt = ExplorerPrompt {
            connection: session.page.connection().to_string(),
            dirty: session.page.editor().is_changed(),
        };
        match line_editor.read_line(&prompt)? {
            Signal::Success(buffer) => {
                let trimmed = buffer.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.starts_with('\\') {
                    match session.handle_command(trimmed) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => eprintln!("{}", format!("Error: {}", e).red()),
                    }
                } else {
                    session.page.editor_mut().append_line(trimmed);
                    session.page.poll();
                }
            }
            Signal::CtrlD | Signal::CtrlC => {
                if let Some(warning) = session.page.unsaved_changes_warning() {
                    println!("{}", warning.yellow());
                }
                break;
            }
        }
    }

    println!("\nGoodbye!");
    if let Some(dual_logger) = explorer_cli::utils::dual_logging::get_dual_logger() {
        dual_logger.flush();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validator_waits_for_closing_quote() {
        let v = SqlValidator;
        assert!(matches!(v.validate("select 'abc"), ValidationResult::Incomplete));
        assert!(matches!(v.validate("select (1"), ValidationResult::Incomplete));
        assert!(matches!(v.validate("select ')'"), ValidationResult::Complete));
        assert!(matches!(v.validate("\\ask what's up"), ValidationResult::Complete));
    }

    #[test]
    fn test_parse_pivot_args() {
        let state = parse_pivot_args(
            &PivotState::default(),
            &["agg=Count_Unique_Values", "rows=region,kind", "vals=amount"],
        )
        .unwrap();
        assert_eq!(state.aggregator_name, "Count Unique Values");
        assert_eq!(state.rows, vec!["region", "kind"]);
        assert_eq!(state.vals, vec!["amount"]);
        assert!(state.cols.is_empty());

        assert!(parse_pivot_args(&PivotState::default(), &["agg=Median"]).is_err());
        assert!(parse_pivot_args(&PivotState::default(), &["rows"]).is_err());
    }
}
