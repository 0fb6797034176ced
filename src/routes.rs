use anyhow::{anyhow, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::page::{EditorPage, PageSettings};
use crate::query_list::QueryList;
use crate::schema_cache::SchemaSource;
use crate::table_description::TableDescriptionPage;
use crate::utils::patterns::cached;

/// Which page of the explorer is being driven, named after the server's
/// URL patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRoute {
    ExplorerIndex,
    QueryDetail,
    QueryCreate,
    Playground,
    Schema,
    TableDescriptionCreate,
    TableDescriptionUpdate,
}

impl ClientRoute {
    pub const ALL: [ClientRoute; 7] = [
        ClientRoute::ExplorerIndex,
        ClientRoute::QueryDetail,
        ClientRoute::QueryCreate,
        ClientRoute::Playground,
        ClientRoute::Schema,
        ClientRoute::TableDescriptionCreate,
        ClientRoute::TableDescriptionUpdate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ClientRoute::ExplorerIndex => "explorer_index",
            ClientRoute::QueryDetail => "query_detail",
            ClientRoute::QueryCreate => "query_create",
            ClientRoute::Playground => "explorer_playground",
            ClientRoute::Schema => "explorer_schema",
            ClientRoute::TableDescriptionCreate => "table_description_create",
            ClientRoute::TableDescriptionUpdate => "table_description_update",
        }
    }

    /// Path of the page relative to the explorer root.
    pub fn path(&self, target: Option<&str>) -> String {
        match self {
            ClientRoute::ExplorerIndex => String::new(),
            ClientRoute::QueryDetail => format!("{}/", target.unwrap_or("new")),
            ClientRoute::QueryCreate => "new/".to_string(),
            ClientRoute::Playground => "play/".to_string(),
            ClientRoute::Schema => format!("schema/{}", target.unwrap_or_default()),
            ClientRoute::TableDescriptionCreate => "table-descriptions/new/".to_string(),
            ClientRoute::TableDescriptionUpdate => match target {
                Some(id) => format!("table-descriptions/{}/update/", id),
                None => "table-descriptions/new/".to_string(),
            },
        }
    }

    /// Whether the page hosts the SQL editor
    pub fn has_editor(&self) -> bool {
        matches!(
            self,
            ClientRoute::QueryDetail | ClientRoute::QueryCreate | ClientRoute::Playground
        )
    }

    /// The route a rendered page declares for its client code.
    pub fn from_page(page_html: &str) -> Option<Self> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = cached(&RE, r#"clientRoute\s*=\s*['"]([a-z_]+)['"]"#)?;
        re.captures(page_html)?.get(1)?.as_str().parse().ok()
    }
}

impl FromStr for ClientRoute {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ClientRoute::ALL
            .into_iter()
            .find(|route| route.name() == s)
            .ok_or_else(|| anyhow!("Unknown route '{}'", s))
    }
}

impl fmt::Display for ClientRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The query id a rendered page declares, if any.
pub fn query_id_from_page(page_html: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = cached(&RE, r#"queryId\s*=\s*['"]?([A-Za-z0-9_-]+)['"]?"#)?;
    let id = re.captures(page_html)?.get(1)?.as_str();
    (id != "null" && id != "undefined").then(|| id.to_string())
}

/// The controller set up for a page.
pub enum Page<S> {
    QueryList(QueryList),
    Editor(Box<EditorPage<S>>),
    Schema { connection: String },
    TableDescription(Box<TableDescriptionPage<S>>),
}

/// Sets up the controller for `route` from the page the server rendered.
/// Saved-query pages and table description updates use `query_id` as the
/// record id; create and playground pages start from `new`.
pub fn dispatch<S: SchemaSource>(
    route: ClientRoute,
    query_id: Option<&str>,
    page_html: &str,
    source: S,
    settings: &PageSettings,
) -> Result<Page<S>> {
    tracing::debug!(target: "routes", "Dispatching {}", route);
    let page = match route {
        ClientRoute::ExplorerIndex => Page::QueryList(QueryList::from_page(page_html)),
        ClientRoute::QueryDetail => {
            let id = query_id.ok_or_else(|| anyhow!("A saved query page needs a query id"))?;
            Page::Editor(Box::new(EditorPage::from_html(
                route, id, page_html, source, settings,
            )?))
        }
        ClientRoute::QueryCreate | ClientRoute::Playground => Page::Editor(Box::new(
            EditorPage::from_html(route, "new", page_html, source, settings)?,
        )),
        ClientRoute::Schema => Page::Schema {
            connection: settings.connection.clone(),
        },
        ClientRoute::TableDescriptionCreate => Page::TableDescription(Box::new(
            TableDescriptionPage::from_html(None, page_html, source, settings),
        )),
        ClientRoute::TableDescriptionUpdate => {
            let id = query_id.ok_or_else(|| anyhow!("A table description update needs an id"))?;
            Page::TableDescription(Box::new(TableDescriptionPage::from_html(
                Some(id),
                page_html,
                source,
                settings,
            )))
        }
    };
    Ok(page)
}
