//! Command-line flags.

use std::path::PathBuf;

use coderoom_collab::ServerConfig;

/// Parsed command-line arguments.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub bind_addr: Option<String>,
    pub sessions_dir: Option<PathBuf>,
    pub help: bool,
}

impl CliArgs {
    /// Parses CLI arguments from `std::env::args`.
    pub fn parse_from_env() -> Result<Self, String> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parses arguments, excluding the program name.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut cli = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    cli.config_path = Some(PathBuf::from(value_for(&arg, args.next())?));
                }
                "--bind" => {
                    cli.bind_addr = Some(value_for(&arg, args.next())?);
                }
                "--sessions-dir" => {
                    cli.sessions_dir = Some(PathBuf::from(value_for(&arg, args.next())?));
                }
                "--help" | "-h" => {
                    cli.help = true;
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(cli)
    }

    /// Apply the flags on top of an already layered config.
    pub fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = &self.bind_addr {
            config.bind_addr = bind.clone();
        }
        if let Some(dir) = &self.sessions_dir {
            config.sessions_root = dir.clone();
        }
        config
    }
}

fn value_for(flag: &str, value: Option<String>) -> Result<String, String> {
    value.ok_or_else(|| format!("missing value for {flag}"))
}

pub fn print_help() {
    println!(
        "coderoom-server: collaborative editing room server

USAGE:
    coderoom-server [OPTIONS]

OPTIONS:
    --config <PATH>        JSON config file
    --bind <ADDR>          Listen address (default 127.0.0.1:8080)
    --sessions-dir <DIR>   Directory for room snapshots (default ./sessions)
    -h, --help             Print this help

ENVIRONMENT:
    CODEROOM_BIND, CODEROOM_SESSIONS_DIR, CODEROOM_GITHUB_TOKEN,
    CODEROOM_COMMIT_TIMEOUT_SECS, CODEROOM_ROOM_TTL_SECS, RUST_LOG"
    );
}
