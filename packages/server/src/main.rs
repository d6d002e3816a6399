#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Crime watch server binary.
//!
//! Flags take precedence over the `CRIME_WATCH_CONFIG`, `DATABASE_PATH`,
//! `BIND_ADDR`, and `PORT` environment variables.

use std::path::PathBuf;

use clap::Parser;
use crime_watch_server::{ServerOptions, run_server};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;

#[derive(Parser)]
#[command(
    name = "crime_watch_server",
    about = "Serve the crime watch hotspot API"
)]
struct Cli {
    /// Address to bind
    #[arg(long)]
    bind_addr: Option<String>,

    /// Port to bind
    #[arg(long)]
    port: Option<u16>,

    /// Hotspot configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// `SQLite` database path
    #[arg(long)]
    database: Option<PathBuf>,

    /// Keep all data in memory
    #[arg(long)]
    in_memory: bool,

    /// Seconds between background reconciliation passes (0 disables)
    #[arg(long, default_value = "300")]
    reconcile_interval_secs: u64,
}

impl Cli {
    /// Resolves each setting from its flag, then the environment, then the
    /// built-in default.
    fn into_options(self, env: impl Fn(&str) -> Option<String>) -> ServerOptions {
        ServerOptions {
            bind_addr: self
                .bind_addr
                .or_else(|| env("BIND_ADDR"))
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            port: self.port.unwrap_or_else(|| {
                env("PORT").map_or(DEFAULT_PORT, |p| {
                    p.parse().unwrap_or_else(|_| {
                        log::warn!("Ignoring invalid PORT {p:?}, using {DEFAULT_PORT}");
                        DEFAULT_PORT
                    })
                })
            }),
            config_path: self
                .config
                .or_else(|| env("CRIME_WATCH_CONFIG").map(PathBuf::from)),
            database_path: self
                .database
                .or_else(|| env("DATABASE_PATH").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(crime_watch_database::DEFAULT_DB_PATH)),
            in_memory: self.in_memory,
            reconcile_interval_secs: self.reconcile_interval_secs,
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let options = Cli::parse().into_options(|key| std::env::var(key).ok());

    run_server(options).await.map_err(|e| {
        log::error!("Server failed: {e}");
        std::io::Error::other(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn flags_override_environment() {
        let cli = Cli::parse_from([
            "crime_watch_server",
            "--bind-addr",
            "0.0.0.0",
            "--port",
            "9000",
            "--database",
            "flag.db",
        ]);
        let options = cli.into_options(env(&[
            ("BIND_ADDR", "10.0.0.1"),
            ("PORT", "7000"),
            ("DATABASE_PATH", "env.db"),
        ]));

        assert_eq!(options.bind_addr, "0.0.0.0");
        assert_eq!(options.port, 9000);
        assert_eq!(options.database_path, PathBuf::from("flag.db"));
    }

    #[test]
    fn environment_fills_missing_flags() {
        let options = Cli::parse_from(["crime_watch_server"]).into_options(env(&[
            ("BIND_ADDR", "10.0.0.1"),
            ("PORT", "7000"),
            ("CRIME_WATCH_CONFIG", "hotspots.toml"),
        ]));

        assert_eq!(options.bind_addr, "10.0.0.1");
        assert_eq!(options.port, 7000);
        assert_eq!(options.config_path, Some(PathBuf::from("hotspots.toml")));
        assert_eq!(options.reconcile_interval_secs, 300);
    }

    #[test]
    fn defaults_apply_without_flags_or_environment() {
        let options = Cli::parse_from(["crime_watch_server"]).into_options(env(&[("PORT", "not-a-port")]));

        assert_eq!(options.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(options.port, DEFAULT_PORT);
        assert_eq!(
            options.database_path,
            PathBuf::from(crime_watch_database::DEFAULT_DB_PATH)
        );
        assert!(options.config_path.is_none());
    }
}
