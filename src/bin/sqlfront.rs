//! sqlfront - interactive shell over the query front end
//!
//! Reads one statement per line from stdin and runs it in a single session
//! against the in-process engine.
//!
//! Usage:
//!   sqlfront [--config front.json] [--timeout 5] [--interrupt-on-cancel]
//!            [--transport rpc|driver] [--user alice] [--metrics]
//!
//! Statements:
//!   SET [key [= value]]
//!   CACHE [GLOBAL] TABLE name AS query
//!   UNCACHE [GLOBAL] TABLE [IF EXISTS] name
//!   SELECT * FROM [global_temp.]name
//!   SELECT expr [AS alias], ...       (sleep(ms), date_add(date, days), raise_error(msg))

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sqlfront::config::{INTERRUPT_ON_CANCEL_KEY, STATEMENT_TIMEOUT_KEY};
use sqlfront::{FrontendConfig, LocalEngine, ResultSet, SqlFrontend, Transport};

#[derive(Parser)]
#[command(name = "sqlfront")]
#[command(about = "Session-scoped SQL front end shell")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for per-session scratch space
    #[arg(long)]
    scratch_root: Option<PathBuf>,

    /// Statement timeout for the shell session, in seconds (0 = unbounded)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Forcefully interrupt jobs when a statement is cancelled
    #[arg(long)]
    interrupt_on_cancel: bool,

    /// Error rendering: "rpc" (sanitized) or "driver" (full cause chain)
    #[arg(long, default_value = "driver")]
    transport: String,

    /// User name recorded on the session
    #[arg(short, long, default_value = "sqlfront")]
    user: String,

    /// Print a metrics snapshot on exit
    #[arg(long)]
    metrics: bool,
}

fn print_rows(out: &mut impl Write, rows: &ResultSet) -> io::Result<()> {
    if rows.columns.is_empty() {
        return writeln!(out, "OK");
    }
    writeln!(out, "{}", rows.columns.join("\t"))?;
    for row in &rows.rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}", cells.join("\t"))?;
    }
    writeln!(out, "({} row{})", rows.row_count(), if rows.row_count() == 1 { "" } else { "s" })
}

fn print_metrics(frontend: &SqlFrontend) {
    if let Some(metrics) = frontend.metrics() {
        match serde_json::to_string_pretty(&metrics.snapshot()) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => warn!(error = %e, "failed to serialize metrics"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FrontendConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FrontendConfig::default(),
    };
    if let Some(root) = cli.scratch_root {
        config.scratch_root = root;
    }
    config.metrics |= cli.metrics;

    let mut initial = BTreeMap::new();
    if let Some(secs) = cli.timeout {
        initial.insert(STATEMENT_TIMEOUT_KEY.to_string(), secs.to_string());
    }
    if cli.interrupt_on_cancel {
        initial.insert(INTERRUPT_ON_CANCEL_KEY.to_string(), "true".to_string());
    }
    let transport: Transport = cli.transport.parse().unwrap_or_else(|never| match never {});

    let frontend = Arc::new(SqlFrontend::new(config, Arc::new(LocalEngine::new())));
    let session = frontend.open_session(&cli.user, &initial)?;
    info!(session, transport = transport.as_str(), "shell ready");

    // Set up signal handler for graceful shutdown
    let frontend_for_signal = Arc::clone(&frontend);
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "shutting down");
            frontend_for_signal.shutdown();
            print_metrics(&frontend_for_signal);
            std::process::exit(0);
        }
    });

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        let sql = line.trim();
        if sql.is_empty() {
            continue;
        }
        if sql == "\\q" || sql.eq_ignore_ascii_case("exit") {
            break;
        }

        match frontend.execute(session, sql, None, transport) {
            Ok(result) => print_rows(&mut stdout, &result.rows)?,
            Err(err) => match transport {
                Transport::StructuredRpc => writeln!(stdout, "{}", err.to_json())?,
                Transport::SqlDriver => writeln!(stdout, "{}", err)?,
            },
        }
        stdout.flush()?;
    }

    frontend.shutdown();
    print_metrics(&frontend);
    Ok(())
}
