//! flightlog: nearest-aircraft poller, flight event log, and JSON API.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flightlog_core::config::{self, Config};
use flightlog_core::event::{Coalescer, StoredEvent};
use flightlog_core::types::{format_timestamp, is_empty, now_local, Sighting};

mod db;
mod db_pg;
mod poller;
mod web;

use db::{FlightStore, SqliteDb};
use poller::{http_client, Poller};

#[derive(Parser)]
#[command(name = "flightlog", version, about = "Log the nearest aircraft as coalesced flight events")]
struct Cli {
    /// Config file (defaults to ~/.flightlog/config.yaml)
    #[arg(long, global = true, env = "FLIGHTLOG_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, env = "FLIGHTLOG_DB_PATH")]
    db_path: Option<String>,

    /// PostgreSQL URL (requires the `postgres` feature)
    #[arg(long, global = true, env = "FLIGHTLOG_DATABASE_URL")]
    database_url: Option<String>,

    /// Coalescing window in minutes
    #[arg(long, global = true, env = "FLIGHTLOG_WINDOW_MINUTES")]
    window_minutes: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the nearest aircraft and log sightings until Ctrl-C
    Watch,

    /// Serve the JSON API
    Serve {
        #[arg(long, env = "FLIGHTLOG_HOST")]
        host: Option<String>,

        #[arg(long, env = "FLIGHTLOG_PORT")]
        port: Option<u16>,

        /// Also run the poller in-process
        #[arg(long)]
        poll: bool,
    },

    /// Ingest JSON-lines sightings from a file (or - for stdin)
    Log {
        file: PathBuf,
    },

    /// Show the most recent flight events
    Recent {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show aggregate statistics
    Stats,

    /// Show one aircraft's latest event and lifetime totals
    Detail {
        #[arg(long, default_value = "")]
        reg: String,

        #[arg(long, default_value = "")]
        hex: String,
    },

    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    if let Some(path) = &cli.db_path {
        config.database.path = path.clone();
    }
    if let Some(minutes) = cli.window_minutes {
        config.events.window_minutes = minutes;
    }

    match cli.command {
        Commands::InitConfig { force } => cmd_init_config(cli.config, force),
        Commands::Watch => {
            let store = open_store(&config, cli.database_url.as_deref()).await?;
            cmd_watch(&config, store).await
        }
        Commands::Serve { host, port, poll } => {
            let store = open_store(&config, cli.database_url.as_deref()).await?;
            let host = host.unwrap_or_else(|| config.dashboard.host.clone());
            let port = port.unwrap_or(config.dashboard.port);
            cmd_serve(&config, store, &host, port, poll).await
        }
        Commands::Log { file } => {
            let store = open_store(&config, cli.database_url.as_deref()).await?;
            cmd_log(store, file).await
        }
        Commands::Recent { limit } => {
            let store = open_store(&config, cli.database_url.as_deref()).await?;
            cmd_recent(store, limit).await
        }
        Commands::Stats => {
            let store = open_store(&config, cli.database_url.as_deref()).await?;
            cmd_stats(store).await
        }
        Commands::Detail { reg, hex } => {
            let store = open_store(&config, cli.database_url.as_deref()).await?;
            cmd_detail(store, &reg, &hex).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn open_store(config: &Config, database_url: Option<&str>) -> anyhow::Result<Arc<dyn FlightStore>> {
    let coalescer = Coalescer::new(config.events.window_minutes);

    if let Some(url) = database_url {
        #[cfg(feature = "postgres")]
        {
            let store = db_pg::PgFlightStore::connect(url, coalescer)
                .await
                .context("connecting to PostgreSQL")?;
            info!(window_minutes = config.events.window_minutes, "using PostgreSQL store");
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "postgres"))]
        bail!("--database-url {url} needs a build with the `postgres` feature");
    }

    let path = &config.database.path;
    let store = SqliteDb::new(path.clone(), coalescer)
        .with_context(|| format!("opening database {path}"))?;
    info!(path = %path, window_minutes = config.events.window_minutes, "using SQLite store");
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(config::config_file);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let written = config::save_config_to(&Config::default(), &path)?;
    println!("Wrote {}", written.display());
    Ok(())
}

async fn cmd_watch(config: &Config, store: Arc<dyn FlightStore>) -> anyhow::Result<()> {
    let client = http_client(config.poll.timeout_secs)?;
    Poller::new(config, client, store)
        .run_until(shutdown_signal())
        .await;
    Ok(())
}

async fn cmd_serve(
    config: &Config,
    store: Arc<dyn FlightStore>,
    host: &str,
    port: u16,
    poll: bool,
) -> anyhow::Result<()> {
    let client = http_client(config.poll.timeout_secs)?;
    let state = Arc::new(web::AppState::new(store.clone(), config, client.clone()));

    let poller = poll.then(|| {
        let poller = Poller::new(config, client, store);
        tokio::spawn(poller.run_until(std::future::pending::<()>()))
    });

    let served = web::serve(state, host, port, shutdown_signal())
        .await
        .with_context(|| format!("serving on {host}:{port}"));

    if let Some(task) = poller {
        task.abort();
    }
    served
}

async fn cmd_log(store: Arc<dyn FlightStore>, file: PathBuf) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(&file)
            .with_context(|| format!("opening {}", file.display()))?;
        Box::new(io::BufReader::new(f))
    };

    let mut ingested = 0u64;
    let mut skipped = 0u64;
    let mut failed = 0u64;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", file.display()))?;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let sighting: Sighting = match serde_json::from_str(text) {
            Ok(s) => s,
            Err(e) => {
                warn!(line = lineno + 1, "skipping malformed sighting: {e}");
                skipped += 1;
                continue;
            }
        };

        match store.ingest(sighting).await {
            Ok(_) => ingested += 1,
            Err(e) => {
                warn!(line = lineno + 1, "failed to log sighting: {e}");
                failed += 1;
            }
        }
    }

    println!("Sightings: {ingested} logged, {skipped} malformed, {failed} failed");
    Ok(())
}

async fn cmd_recent(store: Arc<dyn FlightStore>, limit: i64) -> anyhow::Result<()> {
    let rows = store.recent(limit.clamp(1, 1000)).await?;
    if rows.is_empty() {
        println!("No flights logged yet.");
        return Ok(());
    }
    print_events(&rows);
    Ok(())
}

async fn cmd_stats(store: Arc<dyn FlightStore>) -> anyhow::Result<()> {
    let stats = store.stats(now_local().date()).await?;

    println!();
    println!("  Events:        {}", stats.total_events);
    println!("  Sightings:     {}", stats.total_sightings);
    println!("  Events today:  {}", stats.events_today);
    println!("  Unique today:  {}", stats.unique_today);
    if let Some(airline) = &stats.top_airline_today {
        println!("  Top today:     {airline} ({})", stats.top_airline_today_count);
    }
    println!();

    for (title, rows) in [("Airline", &stats.top_airlines), ("Type", &stats.top_types)] {
        if rows.is_empty() {
            continue;
        }
        let mut table = Table::new();
        table.set_header(vec![title, "Events"]);
        for row in rows {
            table.add_row(vec![Cell::new(&row.name), Cell::new(row.count)]);
        }
        println!("{table}");
    }

    if !stats.top_countries.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Country", "ISO", "Events"]);
        for row in &stats.top_countries {
            table.add_row(vec![
                Cell::new(&row.country),
                Cell::new(row.country_iso.as_deref().unwrap_or("-")),
                Cell::new(row.count),
            ]);
        }
        println!("{table}");
    }

    if !stats.top_aircraft.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Aircraft", "Airline", "Events", "Seen", "First", "Last"]);
        for row in &stats.top_aircraft {
            table.add_row(vec![
                Cell::new(&row.key_id),
                Cell::new(row.airline_name.as_deref().unwrap_or("-")),
                Cell::new(row.events),
                Cell::new(row.total_seen),
                Cell::new(format_timestamp(&row.first_seen)),
                Cell::new(format_timestamp(&row.last_seen)),
            ]);
        }
        println!("{table}");
    }

    if !stats.by_day.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Day", "Events", "Sightings"]);
        for row in &stats.by_day {
            table.add_row(vec![Cell::new(&row.day), Cell::new(row.events), Cell::new(row.sightings)]);
        }
        println!("{table}");
    }

    Ok(())
}

async fn cmd_detail(store: Arc<dyn FlightStore>, reg: &str, hex: &str) -> anyhow::Result<()> {
    if reg.trim().is_empty() && hex.trim().is_empty() {
        bail!("pass --reg and/or --hex");
    }

    let detail = match store.detail(reg, hex).await? {
        Some(d) => d,
        None => {
            println!("No flights found.");
            return Ok(());
        }
    };

    println!();
    println!("  Events:      {}", detail.event_count);
    println!("  Times seen:  {}", detail.total_seen);
    println!("  First seen:  {}", format_timestamp(&detail.first_seen));
    println!("  Last seen:   {}", format_timestamp(&detail.last_seen));
    println!();
    print_events(std::slice::from_ref(&detail.latest));
    Ok(())
}

fn print_events(rows: &[StoredEvent]) {
    fn text(v: &Option<String>) -> &str {
        v.as_deref().filter(|s| !s.is_empty()).unwrap_or("-")
    }
    fn num(v: Option<f64>, precision: usize) -> String {
        v.map(|n| format!("{n:.precision$}")).unwrap_or("-".into())
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Last seen", "Hex", "Reg", "Callsign", "Type", "Airline", "Route", "Alt (ft)",
        "Dist (nm)", "Seen",
    ]);

    for ev in rows {
        let r = &ev.record;
        let d = &r.descriptive;
        let route = match (&d.origin_iata, &d.dest_iata) {
            (None, None) => "-".to_string(),
            (o, t) => format!("{}→{}", text(o), text(t)),
        };
        let aircraft_type = if is_empty(&d.model) { &d.type_code } else { &d.model };
        table.add_row(vec![
            Cell::new(ev.id),
            Cell::new(format_timestamp(&r.last_seen)),
            Cell::new(text(&r.hex)),
            Cell::new(text(&r.reg)),
            Cell::new(text(&r.callsign)),
            Cell::new(text(aircraft_type)),
            Cell::new(text(&d.airline_name)),
            Cell::new(route),
            Cell::new(num(r.telemetry.altitude_ft, 0)),
            Cell::new(num(r.telemetry.distance_nm, 1)),
            Cell::new(r.times_seen),
        ]);
    }

    println!("{table}");
}
