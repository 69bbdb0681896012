//! Prints the counters published by another process.
//!
//! Run with:
//! ```bash
//! cargo run --features cli --bin egg-counters -- <PID|PATH>
//! ```

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use egg_counters::config::parse_target;
use egg_counters::observers::json::JsonObserver;
use egg_counters::observers::table::{TableObserver, TableStyle};
use egg_counters::{Arena, Observable};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Table with category, name, value and description
    Table,
    /// JSON object
    Json,
}

/// Table style selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum StyleChoice {
    Ascii,
    #[default]
    Rounded,
    Sharp,
    Modern,
    Markdown,
    Dots,
    Blank,
}

impl From<StyleChoice> for TableStyle {
    fn from(choice: StyleChoice) -> Self {
        match choice {
            StyleChoice::Ascii => TableStyle::Ascii,
            StyleChoice::Rounded => TableStyle::Rounded,
            StyleChoice::Sharp => TableStyle::Sharp,
            StyleChoice::Modern => TableStyle::Modern,
            StyleChoice::Markdown => TableStyle::Markdown,
            StyleChoice::Dots => TableStyle::Dots,
            StyleChoice::Blank => TableStyle::Blank,
        }
    }
}

/// Show the performance counters of a running process.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process id, or the shared memory path of its counters
    /// (e.g. /dev/shm/EggCounters-1234)
    #[arg(value_parser = parse_pid)]
    target: u32,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Table style
    #[arg(short, long, value_enum, default_value = "rounded")]
    style: StyleChoice,

    /// Omit the table header
    #[arg(long)]
    no_header: bool,

    /// Omit the description column
    #[arg(long)]
    no_description: bool,

    /// Pretty print JSON output
    #[arg(long)]
    pretty: bool,

    /// Include a timestamp in JSON output
    #[arg(long)]
    timestamp: bool,
}

fn parse_pid(target: &str) -> Result<u32, String> {
    parse_target(target).ok_or_else(|| format!("`{target}` is neither a pid nor a counter path"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let pid = args.target;

    let arena = match Arena::attach(pid) {
        Ok(arena) => arena,
        Err(err) => {
            error!(pid, "{err}");
            return ExitCode::FAILURE;
        }
    };

    let counters = arena.counters();
    let observables = counters.iter().map(|c| c as &dyn Observable);

    match args.format {
        OutputFormat::Table => {
            let output = TableObserver::new()
                .with_style(args.style.into())
                .with_header(!args.no_header)
                .with_description(!args.no_description)
                .render(observables);
            println!("{output}");
        }
        OutputFormat::Json => {
            let json = JsonObserver::new()
                .pretty(args.pretty)
                .include_timestamp(args.timestamp)
                .with_pid(pid)
                .to_json(observables);
            match json {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    error!(pid, %err, "failed to serialize counters");
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}
