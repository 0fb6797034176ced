use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use crossterm::style::Stylize;

use explorer_cli::data_exporter::RenderedTable;
use explorer_cli::query_list::QueryEntry;

pub fn display_table(results: &RenderedTable) {
    if results.body().is_empty() {
        println!("{}", "No results found.".yellow());
        return;
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        results
            .header()
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold)),
    );
    for row in results.body() {
        table.add_row(row);
    }

    println!("{table}");
    println!(
        "\n{}",
        format!("{} rows returned", results.body().len()).green()
    );
}

pub fn display_queries(entries: &[&QueryEntry]) {
    if entries.is_empty() {
        println!("{}", "No queries match.".yellow());
        return;
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("id").add_attribute(Attribute::Bold),
        Cell::new("name").add_attribute(Attribute::Bold),
        Cell::new("fav").add_attribute(Attribute::Bold),
    ]);
    for entry in entries {
        table.add_row(vec![
            entry.id.clone(),
            entry.name.clone(),
            if entry.is_favorite { "♥" } else { "♡" }.to_string(),
        ]);
    }
    println!("{table}");
}

/// Tables with a check mark against the ones currently picked.
pub fn display_selection(tables: &[String], selected: &[String]) {
    if tables.is_empty() {
        println!("{}", "No tables loaded. Use \\connect first.".yellow());
        return;
    }
    for table in tables {
        if selected.contains(table) {
            println!("  {} {}", "[x]".green(), table);
        } else {
            println!("  [ ] {}", table);
        }
    }
}
