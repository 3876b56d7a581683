//! Configuration file management for flightlog.
//!
//! Reads/writes `~/.flightlog/config.yaml` with the watched location, poll
//! cadence, coalescing window, database path, dashboard address, upstream
//! API bases, and the optional ingest token.

use std::path::{Path, PathBuf};

use crate::event::DEFAULT_WINDOW_MINUTES;
use crate::types::Result;

/// Full configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub station: StationConfig,
    pub poll: PollConfig,
    pub events: EventsConfig,
    pub database: DatabaseConfig,
    pub dashboard: DashboardConfig,
    pub sources: SourcesConfig,
    pub ingest_token: Option<String>,
}

/// Point the nearest-aircraft query is centred on.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub lat: f64,
    pub lon: f64,
    pub radius_nm: f64,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
    pub window_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SourcesConfig {
    pub adsb_lol: String,
    pub adsbdb: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            station: StationConfig {
                lat: 42.7077,
                lon: -83.0315,
                radius_nm: 50.0,
            },
            poll: PollConfig {
                interval_secs: 12,
                timeout_secs: 10,
            },
            events: EventsConfig {
                window_minutes: DEFAULT_WINDOW_MINUTES,
            },
            database: DatabaseConfig {
                path: "data/flight_log.db".into(),
            },
            dashboard: DashboardConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            sources: SourcesConfig {
                adsb_lol: "https://api.adsb.lol".into(),
                adsbdb: "https://api.adsbdb.com".into(),
            },
            ingest_token: None,
        }
    }
}

/// Get the config directory path (`~/.flightlog/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".flightlog")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.flightlog/config.yaml`.
///
/// Returns default config if file doesn't exist.
pub fn load_config() -> Config {
    load_config_from(&config_file())
}

/// Load config from an explicit path, falling back to defaults.
pub fn load_config_from(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }

    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return Config::default(),
    };

    parse_config(&text).unwrap_or_default()
}

/// Write config to `path`, creating its directory.
pub fn save_config_to(config: &Config, path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let text = serialize_config(config);
    std::fs::write(path, text)?;

    Ok(path.to_path_buf())
}

/// Parse simple YAML-like config text.
fn parse_config(text: &str) -> Option<Config> {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        if let Some((key, val)) = stripped.split_once(':') {
            let key = key.trim();
            let val = val.trim();

            if !is_indented {
                if val.is_empty() {
                    current_section = Some(key.to_string());
                } else {
                    current_section = None;
                    if key == "ingest_token" {
                        config.ingest_token = parse_string_value(val);
                    }
                }
            } else if let Some(ref section) = current_section {
                match section.as_str() {
                    "station" => match key {
                        "lat" => set(&mut config.station.lat, parse_float_value(val)),
                        "lon" => set(&mut config.station.lon, parse_float_value(val)),
                        "radius_nm" => set(&mut config.station.radius_nm, parse_float_value(val)),
                        _ => {}
                    },
                    "poll" => match key {
                        "interval_secs" => set(&mut config.poll.interval_secs, val.parse().ok()),
                        "timeout_secs" => set(&mut config.poll.timeout_secs, val.parse().ok()),
                        _ => {}
                    },
                    "events" => {
                        if key == "window_minutes" {
                            set(&mut config.events.window_minutes, val.parse().ok());
                        }
                    }
                    "database" => {
                        if key == "path" {
                            set(&mut config.database.path, parse_string_value(val));
                        }
                    }
                    "dashboard" => match key {
                        "host" => set(&mut config.dashboard.host, parse_string_value(val)),
                        "port" => set(&mut config.dashboard.port, val.parse().ok()),
                        _ => {}
                    },
                    "sources" => match key {
                        "adsb_lol" => set(&mut config.sources.adsb_lol, parse_string_value(val)),
                        "adsbdb" => set(&mut config.sources.adsbdb, parse_string_value(val)),
                        _ => {}
                    },
                    _ => {}
                }
            }
        }
    }

    Some(config)
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_float_value(val: &str) -> Option<f64> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    val.parse().ok()
}

/// Serialize config to YAML-like text.
fn serialize_config(config: &Config) -> String {
    let mut lines = vec!["# flightlog configuration".to_string(), String::new()];

    lines.push("station:".into());
    lines.push(format!("  lat: {}", config.station.lat));
    lines.push(format!("  lon: {}", config.station.lon));
    lines.push(format!("  radius_nm: {}", config.station.radius_nm));
    lines.push(String::new());

    lines.push("poll:".into());
    lines.push(format!("  interval_secs: {}", config.poll.interval_secs));
    lines.push(format!("  timeout_secs: {}", config.poll.timeout_secs));
    lines.push(String::new());

    lines.push("events:".into());
    lines.push(format!("  window_minutes: {}", config.events.window_minutes));
    lines.push(String::new());

    lines.push("database:".into());
    lines.push(format!("  path: \"{}\"", config.database.path));
    lines.push(String::new());

    lines.push("dashboard:".into());
    lines.push(format!("  host: \"{}\"", config.dashboard.host));
    lines.push(format!("  port: {}", config.dashboard.port));
    lines.push(String::new());

    lines.push("sources:".into());
    lines.push(format!("  adsb_lol: \"{}\"", config.sources.adsb_lol));
    lines.push(format!("  adsbdb: \"{}\"", config.sources.adsbdb));
    lines.push(String::new());

    match &config.ingest_token {
        Some(token) => lines.push(format!("ingest_token: \"{token}\"")),
        None => lines.push("ingest_token: null".into()),
    }

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
