//! The table description form: a connection, one of its tables and a note
//! the assistant sends along whenever that table is in context.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{error, info};

use crate::editor::FormField;
use crate::page::{selected_option, textarea, FormSubmitter, PageSettings};
use crate::routes::ClientRoute;
use crate::schema_cache::{Schema, SchemaService, SchemaSource};
use crate::table_selector::{TablePicker, TABLE_PLACEHOLDER};

pub struct TableDescriptionPage<S> {
    route: ClientRoute,
    description_id: Option<String>,
    connection: String,
    picker: TablePicker,
    description: FormField,
    schema: SchemaService<S>,
}

impl<S: SchemaSource> TableDescriptionPage<S> {
    pub fn new(
        description_id: Option<&str>,
        connection: &str,
        table: Option<&str>,
        description: &str,
        source: S,
    ) -> Self {
        let route = match description_id {
            Some(_) => ClientRoute::TableDescriptionUpdate,
            None => ClientRoute::TableDescriptionCreate,
        };
        Self {
            route,
            description_id: description_id.map(str::to_string),
            connection: connection.to_string(),
            picker: TablePicker::new(table),
            description: FormField::new(description),
            schema: SchemaService::new(source),
        }
    }

    /// Reads the form the server rendered. Older pages name the connection
    /// select `id_connection`.
    pub fn from_html(
        description_id: Option<&str>,
        page_html: &str,
        source: S,
        settings: &PageSettings,
    ) -> Self {
        let connection = selected_option(page_html, "id_database_connection")
            .or_else(|| selected_option(page_html, "id_connection"))
            .unwrap_or_else(|| settings.connection.clone());
        let table = selected_option(page_html, "id_table_name");
        let description = textarea(page_html, "id_description").unwrap_or_default();
        Self::new(
            description_id,
            &connection,
            table.as_deref(),
            &description,
            source,
        )
    }

    pub fn route(&self) -> ClientRoute {
        self.route
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn picker(&self) -> &TablePicker {
        &self.picker
    }

    pub fn picker_mut(&mut self) -> &mut TablePicker {
        &mut self.picker
    }

    pub fn description(&self) -> &str {
        &self.description.value
    }

    pub fn set_description(&mut self, text: &str) {
        self.description.value = text.to_string();
    }

    /// Loads the tables of `connection` into the picker. On failure the
    /// page keeps its previous connection and list.
    pub fn connect(&mut self, connection: &str) -> Result<Arc<Schema>> {
        let schema = self.schema.get(connection)?;
        info!(
            target: "table_description",
            "Listing {} tables of '{}'",
            schema.len(),
            connection
        );
        self.connection = connection.to_string();
        self.picker.rebuild(&schema);
        Ok(schema)
    }

    pub fn submit_path(&self) -> String {
        self.route.path(self.description_id.as_deref())
    }

    pub fn form_fields(&self) -> Result<Vec<(String, String)>> {
        let table = self
            .picker
            .chosen()
            .ok_or_else(|| anyhow!("{} before saving", TABLE_PLACEHOLDER))?;
        Ok(vec![
            ("database_connection".to_string(), self.connection.clone()),
            ("table_name".to_string(), table.to_string()),
            ("description".to_string(), self.description.value.clone()),
        ])
    }

    pub fn submit<F: FormSubmitter + ?Sized>(&self, submitter: &F) -> Result<String> {
        let fields = self.form_fields()?;
        let path = self.submit_path();
        info!(target: "table_description", "Saving table description to '{}'", path);
        submitter.submit_form(&path, &fields).map_err(|e| {
            error!(target: "table_description", "Saving table description failed: {}", e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FixedSchema;

    impl SchemaSource for FixedSchema {
        fn fetch_schema(&self, connection: &str) -> Result<Schema> {
            match connection {
                "1" => Schema::from_json(r#"{"users": ["id"], "accounts": ["id"]}"#),
                "2" => Schema::from_json(r#"{"events": ["id"]}"#),
                _ => Err(anyhow!("unknown connection")),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        posts: RefCell<Vec<(String, Vec<(String, String)>)>>,
    }

    impl FormSubmitter for Recorder {
        fn submit_form(&self, path: &str, fields: &[(String, String)]) -> Result<String> {
            self.posts.borrow_mut().push((path.to_string(), fields.to_vec()));
            Ok(String::new())
        }
    }

    fn settings() -> PageSettings {
        PageSettings {
            connection: "1".to_string(),
            doc_debounce_ms: 500,
            request_debounce_ms: 300,
            expand_assistant: false,
            bookmark_base_url: String::new(),
        }
    }

    const UPDATE_PAGE: &str = r#"
        <select name="database_connection" id="id_database_connection">
          <option value="1" selected>main</option>
          <option value="2">events</option>
        </select>
        <select name="table_name" class="form-select" data-placeholder="Select table" id="id_table_name">
          <option value="users" selected>users</option>
        </select>
        <textarea name="description" id="id_description">
Signed-up people</textarea>"#;

    #[test]
    fn test_update_form_from_html() {
        let mut page =
            TableDescriptionPage::from_html(Some("4"), UPDATE_PAGE, FixedSchema, &settings());
        assert_eq!(page.route(), ClientRoute::TableDescriptionUpdate);
        assert_eq!(page.connection(), "1");
        assert_eq!(page.description(), "Signed-up people");

        page.connect("1").unwrap();
        assert_eq!(
            page.picker().tables(),
            &["accounts".to_string(), "users".to_string()]
        );
        assert_eq!(page.picker().chosen(), Some("users"));
        assert_eq!(page.submit_path(), "table-descriptions/4/update/");
    }

    #[test]
    fn test_connection_change_rebuilds_list() {
        let mut page = TableDescriptionPage::new(None, "1", None, "", FixedSchema);
        page.connect("1").unwrap();
        page.picker_mut().choose("users").unwrap();

        page.connect("2").unwrap();
        assert_eq!(page.picker().tables(), &["events".to_string()]);
        assert_eq!(page.picker().label(), TABLE_PLACEHOLDER);

        assert!(page.connect("9").is_err());
        assert_eq!(page.connection(), "2");
        assert_eq!(page.picker().tables(), &["events".to_string()]);
    }

    #[test]
    fn test_submit_needs_a_table() {
        let recorder = Recorder::default();
        let mut page = TableDescriptionPage::new(None, "1", None, "", FixedSchema);
        page.connect("1").unwrap();
        assert!(page.submit(&recorder).is_err());
        assert!(recorder.posts.borrow().is_empty());

        page.picker_mut().choose("accounts").unwrap();
        page.set_description("Billing accounts");
        page.submit(&recorder).unwrap();

        let posts = recorder.posts.borrow();
        assert_eq!(posts[0].0, "table-descriptions/new/");
        assert_eq!(
            posts[0].1,
            vec![
                ("database_connection".to_string(), "1".to_string()),
                ("table_name".to_string(), "accounts".to_string()),
                ("description".to_string(), "Billing accounts".to_string()),
            ]
        );
    }
}
