pub mod api_client;
pub mod assistant;
pub mod config;
pub mod csrf;
pub mod data_exporter;
pub mod debouncer;
pub mod editor;
pub mod page;
pub mod pivot;
pub mod query_list;
pub mod routes;
pub mod schema_cache;
pub mod schema_panel;
pub mod table_description;
pub mod table_selector;
pub mod uploads;
pub mod utils;
