//! Table observer for pretty-printing counters.
//!
//! This module provides [`TableObserver`], which renders a collection of
//! [`Observable`] counters as a four column table using the `tabled` crate.
//!
//! # Feature Flag
//!
//! This module requires the `table` feature:
//!
//! ```toml
//! [dependencies]
//! egg-counters = { version = "0.1", features = ["table"] }
//! ```
//!
//! # Examples
//!
//! ```rust,ignore
//! use egg_counters::{Arena, Observable};
//! use egg_counters::observers::table::{TableObserver, TableStyle};
//!
//! let arena = Arena::attach(pid)?;
//! let counters = arena.counters();
//!
//! let observer = TableObserver::new().with_style(TableStyle::Rounded);
//! println!("{}", observer.render(counters.iter().map(|c| c as &dyn Observable)));
//! // ╭──────────┬────────┬───────┬──────────────────────╮
//! // │ Category │ Name   │ Value │ Description          │
//! // ├──────────┼────────┼───────┼──────────────────────┤
//! // │ Cache    │ Hits   │ 1000  │ Number of cache hits │
//! // │ Cache    │ Misses │ 5     │ Number of misses     │
//! // ╰──────────┴────────┴───────┴──────────────────────╯
//! ```

use crate::counter::Observable;
use tabled::{settings::Style, Table, Tabled};

/// Available table styles for rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TableStyle {
    /// ASCII table with simple characters: +, -, |
    Ascii,
    /// Modern rounded corners (default)
    #[default]
    Rounded,
    /// Sharp corners with box-drawing characters
    Sharp,
    /// Modern style with clean lines
    Modern,
    /// GitHub-flavored Markdown table
    Markdown,
    /// Dots for borders
    Dots,
    /// No borders, just spacing
    Blank,
}

/// Configuration for the table observer.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// The style to use for rendering.
    pub style: TableStyle,
    /// Whether to show the header row.
    pub show_header: bool,
    /// Custom title printed above the table (optional).
    pub title: Option<String>,
    /// Whether to include the description column.
    pub show_description: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            style: TableStyle::default(),
            show_header: true,
            title: None,
            show_description: true,
        }
    }
}

#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Description")]
    description: String,
}

#[derive(Tabled)]
struct CompactRow {
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// An observer that renders counters as a formatted table.
#[derive(Debug, Clone, Default)]
pub struct TableObserver {
    config: TableConfig,
}

impl TableObserver {
    /// Creates a new table observer with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new table observer with the specified configuration.
    pub fn with_config(config: TableConfig) -> Self {
        Self { config }
    }

    /// Sets the table style.
    pub fn with_style(mut self, style: TableStyle) -> Self {
        self.config.style = style;
        self
    }

    /// Sets whether to show the header row.
    pub fn with_header(mut self, show: bool) -> Self {
        self.config.show_header = show;
        self
    }

    /// Sets an optional title for the table.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.config.title = Some(title.into());
        self
    }

    /// Sets whether to render the description column.
    pub fn with_description(mut self, show: bool) -> Self {
        self.config.show_description = show;
        self
    }

    fn apply_style(&self, table: &mut Table) {
        match self.config.style {
            TableStyle::Ascii => {
                table.with(Style::ascii());
            }
            TableStyle::Rounded => {
                table.with(Style::rounded());
            }
            TableStyle::Sharp => {
                table.with(Style::sharp());
            }
            TableStyle::Modern => {
                table.with(Style::modern());
            }
            TableStyle::Markdown => {
                table.with(Style::markdown());
            }
            TableStyle::Dots => {
                table.with(Style::dots());
            }
            TableStyle::Blank => {
                table.with(Style::blank());
            }
        }
    }

    /// Renders the counters as a table string, one row per counter in
    /// iteration order.
    pub fn render<'a>(&self, counters: impl Iterator<Item = &'a dyn Observable>) -> String {
        let mut table = if self.config.show_description {
            let rows: Vec<CounterRow> = counters
                .map(|c| CounterRow {
                    category: c.category().to_string(),
                    name: c.name().to_string(),
                    value: c.value().to_string(),
                    description: c.description().to_string(),
                })
                .collect();
            Table::new(&rows)
        } else {
            let rows: Vec<CompactRow> = counters
                .map(|c| CompactRow {
                    category: c.category().to_string(),
                    name: c.name().to_string(),
                    value: c.value().to_string(),
                })
                .collect();
            Table::new(&rows)
        };
        self.apply_style(&mut table);

        if !self.config.show_header {
            table.with(tabled::settings::Remove::row(
                tabled::settings::object::Rows::first(),
            ));
        }

        if let Some(ref title) = self.config.title {
            format!("{}\n{}", title, table)
        } else {
            table.to_string()
        }
    }
}
