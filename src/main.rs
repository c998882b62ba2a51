//! atomic-pg - Main entry point.
//!
//! Runs statements and filtered reads from the command line and prints rows
//! as JSON lines on stdout. Logs go to stderr.

use atomic_pg::config::{Cli, Command};
use atomic_pg::db::{DbAdapter, Row};
use atomic_pg::models::{FilterSpec, FilterValue, SearchSpec};
use futures_util::StreamExt;
use std::io::Write;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_row(out: &mut impl Write, row: &Row) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, row)?;
    writeln!(out)
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = cli.settings()?;
    let adapter = DbAdapter::new(settings);
    adapter.connect().await?;

    let mut out = std::io::stdout();

    match cli.command {
        Command::Execute { sql } => {
            let affected = adapter.execute(None, &sql).await?;
            info!(rows_affected = affected, "Statement executed");
            writeln!(out, "{}", serde_json::json!({ "rows_affected": affected }))?;
        }
        Command::Iterate { sql, batch_size } => {
            let mut rows = adapter.iterate_with(&sql, batch_size);
            let mut count = 0u64;
            while let Some(row) = rows.next().await {
                print_row(&mut out, &row?)?;
                count += 1;
            }
            info!(rows = count, "Iteration finished");
        }
        Command::Select { table, read } => {
            let rows = adapter.select(None, &table, &read.to_options()?).await?;
            for row in &rows {
                print_row(&mut out, row)?;
            }
        }
        Command::Where {
            table,
            filters,
            search_term,
            search_columns,
            read,
        } => {
            let filters: FilterSpec = filters
                .into_iter()
                .map(|(key, value)| (key, FilterValue::from_json(value)))
                .collect();
            let search = search_term.map(|term| SearchSpec::new(search_columns, term));
            let rows = adapter
                .where_(None, &table, &filters, search.as_ref(), &read.to_options()?)
                .await?;
            for row in &rows {
                print_row(&mut out, row)?;
            }
        }
    }

    out.flush()?;
    adapter.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let cli = Cli::parse_args();

    // Initialize logging
    init_tracing(&cli);

    info!("Starting atomic-pg v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(cli).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
