//! Host configuration: the three stage commands, the authentication marker,
//! and the surrounding knobs. Populated from `FORAGER_`-prefixed environment
//! variables with working defaults; the binary loads `.env` before calling
//! [`ForagerConfig::from_env`].

use std::env;

use crate::process::CommandSpec;

/// Marker substring the scraper emits when it needs interactive login.
pub const DEFAULT_AUTH_MARKER: &str = "AUTHENTICATION REQUIRED";

/// The three external stage commands, in pipeline order.
#[derive(Clone, Debug)]
pub struct StageCommands {
    pub scrape: CommandSpec,
    pub enrich: CommandSpec,
    pub sync: CommandSpec,
}

#[derive(Clone, Debug)]
pub struct ForagerConfig {
    pub stages: StageCommands,
    pub auth_marker: String,
    pub broadcast_capacity: usize,
    pub database_url: Option<String>,
    pub run_on_start: bool,
}

impl ForagerConfig {
    pub fn from_env() -> Self {
        let workdir = env::var("FORAGER_WORKDIR").unwrap_or_else(|_| ".".to_string());
        Self {
            stages: StageCommands {
                scrape: command_from_env("FORAGER_SCRAPE_CMD", "node scraper.js", &workdir),
                enrich: command_from_env("FORAGER_ENRICH_CMD", "node enrich.js", &workdir),
                sync: command_from_env("FORAGER_SYNC_CMD", "node sync-db.js", &workdir),
            },
            auth_marker: env::var("FORAGER_AUTH_MARKER")
                .ok()
                .filter(|marker| !marker.is_empty())
                .unwrap_or_else(|| DEFAULT_AUTH_MARKER.to_string()),
            broadcast_capacity: env::var("FORAGER_BROADCAST_CAPACITY")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(256),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            run_on_start: env::var("FORAGER_RUN_ON_START")
                .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

fn command_from_env(key: &str, default: &str, workdir: &str) -> CommandSpec {
    let line = env::var(key).ok().filter(|line| !line.trim().is_empty());
    let line = line.as_deref().unwrap_or(default);
    // The defaults are known-good command lines, so the parse cannot miss
    // unless the env var was all whitespace, which the filter above rejects.
    CommandSpec::parse_line(line, workdir)
        .unwrap_or_else(|| CommandSpec::new(default, Vec::<String>::new(), workdir))
}
