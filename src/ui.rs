// Presentation layer: tables, error lines, the in-flight spinner and CSV
// export. Everything here takes structured results; nothing in this module
// talks to the network.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::dispatch::{Outcome, COMMANDS};
use crate::error::CatalogError;
use crate::query::{CatalogResult, EntityType};

pub fn banner() {
    println!("{}", "cratedig — music catalog search".bold().green());
    println!("{}", "Type `help` for commands, `quit` to leave.".dark_grey());
}

/// Spinner shown while a request is in flight. Hidden automatically when
/// stderr is not a terminal.
pub fn spinner(msg: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(msg.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

pub fn render_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Results(results) => render_results(results),
        Outcome::Message(msg) => println!("{}", msg.clone().green()),
        Outcome::Help => render_help(),
        Outcome::Quit => {}
    }
}

pub fn render_error(err: &CatalogError) {
    eprintln!("{} {}", "error:".red().bold(), err);
}

fn render_help() {
    println!("{}", "Commands".bold());
    for command in COMMANDS {
        println!("  {}", command.usage);
    }
    println!("  Filters are passed as key=value, e.g. `search-release kind of blue year=1959`.");
}

fn detail_heading(entity: EntityType) -> &'static str {
    match entity {
        EntityType::Artist => "URI",
        EntityType::Release => "Year",
        EntityType::Label => "Cat#",
        EntityType::Marketplace => "Price",
    }
}

pub fn render_results(results: &CatalogResult) {
    if results.items.is_empty() {
        println!("No results.");
        return;
    }

    let detail = detail_heading(results.entity);
    let title_width = results
        .items
        .iter()
        .map(|s| s.title.chars().count())
        .chain(["Title".len()])
        .max()
        .unwrap_or(5);
    let id_width = results
        .items
        .iter()
        .map(|s| s.id.to_string().len())
        .chain(["ID".len()])
        .max()
        .unwrap_or(2);

    let header = format!("{:<title_width$}  {:<id_width$}  {}", "Title", "ID", detail);
    println!("{}", header.cyan().bold());
    for item in &results.items {
        println!(
            "{:<title_width$}  {:<id_width$}  {}",
            item.title,
            item.id,
            item.detail.as_deref().unwrap_or("-")
        );
    }

    let mut footer = format!("{} of {} results", results.items.len(), results.total);
    if results.next_cursor.is_some() {
        footer.push_str(" — `next` for more");
    }
    println!("{}", footer.dark_grey());
}

/// Write the result page to a CSV file, returning the number of data rows.
pub fn write_csv(path: &Path, results: &CatalogResult) -> Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(
        out,
        "entity,id,title,{}",
        detail_heading(results.entity).to_ascii_lowercase()
    )?;
    write_csv_rows(&mut out, results)?;
    out.flush()?;
    Ok(results.items.len())
}

/// Write every collected page to one CSV file. The detail column is mixed
/// across entity types, so the header stays generic.
pub fn write_csv_all(path: &Path, pages: &[CatalogResult]) -> Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "entity,id,title,detail")?;
    let mut rows = 0;
    for page in pages {
        write_csv_rows(&mut out, page)?;
        rows += page.items.len();
    }
    out.flush()?;
    Ok(rows)
}

fn write_csv_rows(out: &mut impl Write, results: &CatalogResult) -> Result<()> {
    for item in &results.items {
        writeln!(
            out,
            "{},{},{},{}",
            results.entity.name(),
            item.id,
            csv_field(&item.title),
            csv_field(item.detail.as_deref().unwrap_or(""))
        )?;
    }
    Ok(())
}

// Minimal CSV quoting: wrap when the field carries a delimiter, quote or
// newline; embedded quotes double.
fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
