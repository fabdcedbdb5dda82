//! `coderoom-server`: runs the collaborative editing room server.

mod cli;

use coderoom_collab::{CollabServer, ServerConfig};

use cli::CliArgs;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match CliArgs::parse_from_env() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("use --help for usage information");
            std::process::exit(1);
        }
    };
    if args.help {
        cli::print_help();
        return;
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    log::info!("Starting coderoom-server on {}", config.bind_addr);
    log::info!("Room snapshots in {}", config.sessions_root.display());
    if let Some(ttl) = config.room_ttl() {
        log::info!("Idle rooms evicted after {}s", ttl.as_secs());
    }

    let server = CollabServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }
}

fn load_config(args: &CliArgs) -> Result<ServerConfig, coderoom_collab::ConfigError> {
    let config = match &args.config_path {
        Some(path) => ServerConfig::load_file(path)?,
        None => ServerConfig::default(),
    };
    Ok(args.apply(config.apply_env()?))
}
