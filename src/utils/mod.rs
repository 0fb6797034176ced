//! Utility functions and helpers
//!
//! Paths, logging setup, page-scraping patterns and the SQL highlighter used by the REPL.

pub mod app_paths;
pub mod dual_logging;
pub mod logging;
pub mod patterns;
pub mod sql_highlighter;
