//! persona-relay - WebSocket session relay between users and LLM personas
//!
//! Entry point for the relay binary. `serve` runs the WebSocket server; the
//! other commands manage configuration, users, tokens and stored history.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use persona_relay::cli::{
    Cli, Commands, ConfigSubcommand, PersonaSubcommand, TokenSubcommand, UserSubcommand,
};
use persona_relay::config::{self, RelayConfig};
use persona_relay::error::{Error, Result};
use persona_relay::identity::TokenIssuer;
use persona_relay::logging;
use persona_relay::persona::PersonaDirectory;
use persona_relay::server::RelayServer;
use persona_relay::store::{MessageLog, PersonaStore, SqliteStore, UserStore};
use persona_relay::version;

fn main() {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            // Config commands use minimal logging
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Serve { config, bind } => {
            let mut config = RelayConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
                config.validate()?;
            }

            // The guards must be kept alive for the lifetime of the program
            let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

            let build = version::build_info();
            info!(
                version = %build.full_version(),
                target = %build.target,
                profile = %build.profile,
                "Starting persona-relay"
            );

            run_server(config)
        }
        Commands::User { subcommand } => {
            logging::init_simple(simple_level(cli.verbose))?;
            match subcommand {
                UserSubcommand::Add { handle, config } => {
                    let store = open_store(config.as_deref())?;
                    let user = block_on(async move { store.ensure_user(&handle).await })?;
                    println!("{}", user.id);
                    Ok(())
                }
            }
        }
        Commands::Token { subcommand } => {
            logging::init_simple(simple_level(cli.verbose))?;
            match subcommand {
                TokenSubcommand::Issue { handle, ttl, config } => {
                    let config = RelayConfig::load(config.as_deref())?;
                    issue_token(&config, &handle, ttl)
                }
            }
        }
        Commands::Persona { subcommand } => {
            logging::init_simple(simple_level(cli.verbose))?;
            match subcommand {
                PersonaSubcommand::List { handle, config } => list_personas(config.as_deref(), &handle),
            }
        }
        Commands::History {
            handle,
            persona,
            limit,
            config,
        } => {
            logging::init_simple(simple_level(cli.verbose))?;
            show_history(config.as_deref(), &handle, &persona, limit)
        }
    }
}

fn simple_level(verbose: u8) -> tracing::Level {
    if verbose > 0 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    }
}

/// Run the server on a multi-threaded runtime until Ctrl+C
fn run_server(config: RelayConfig) -> Result<()> {
    info!(
        bind_addr = %config.server.bind_addr,
        completion_url = %config.completion.base_url,
        database = %config.storage.database,
        strategy = %config.session.strategy,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(if config.server.worker_threads > 0 {
            config.server.worker_threads
        } else {
            num_cpus::get().min(8)
        })
        .thread_name("persona-relay")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async move {
        let server = RelayServer::from_config(&config).await?;
        server
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            })
            .await
    })?;

    info!("persona-relay stopped");
    Ok(())
}

/// Run a one-shot command on a single-threaded runtime
fn block_on<T, F>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create runtime: {}", e)))?;
    runtime.block_on(future)
}

fn open_store(config_path: Option<&str>) -> Result<Arc<SqliteStore>> {
    let config = RelayConfig::load(config_path)?;
    Ok(Arc::new(SqliteStore::open(&config.database_path())?))
}

fn issue_token(config: &RelayConfig, handle: &str, ttl: Option<u64>) -> Result<()> {
    let secret = config.require_jwt_secret()?;
    let ttl = Duration::from_secs(ttl.unwrap_or(config.auth.token_ttl_secs));
    let store = SqliteStore::open(&config.database_path())?;

    let user = block_on(async { store.find_user_by_handle(handle).await })?.ok_or_else(|| {
        Error::UserNotFound {
            handle: handle.to_string(),
        }
    })?;

    println!("{}", TokenIssuer::new(secret, ttl).issue(&user)?);
    Ok(())
}

fn list_personas(config_path: Option<&str>, handle: &str) -> Result<()> {
    let store = open_store(config_path)?;
    let directory = PersonaDirectory::new(store.clone());

    let personas = block_on(async {
        let user = store
            .find_user_by_handle(handle)
            .await?
            .ok_or_else(|| Error::UserNotFound {
                handle: handle.to_string(),
            })?;
        directory.list_for(&user).await
    })?;

    if personas.is_empty() {
        println!("No personas for {}", handle);
        return Ok(());
    }

    for persona in personas {
        println!(
            "{:<32} {}",
            persona.name,
            persona.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn show_history(config_path: Option<&str>, handle: &str, persona_name: &str, limit: usize) -> Result<()> {
    let store = open_store(config_path)?;

    let rows = block_on(async {
        let user = store
            .find_user_by_handle(handle)
            .await?
            .ok_or_else(|| Error::UserNotFound {
                handle: handle.to_string(),
            })?;
        match store.find_persona(user.id, persona_name).await? {
            Some(persona) => Ok(Some(store.history(persona.id, limit).await?)),
            None => Ok(None),
        }
    })?;

    let Some(rows) = rows else {
        println!("{} has no persona named {}", handle, persona_name);
        return Ok(());
    };

    for row in rows {
        let who = if row.is_from_user {
            handle
        } else {
            row.speaker.as_deref().unwrap_or(persona_name)
        };
        println!(
            "{}  {}: {}",
            row.created_at.format("%Y-%m-%d %H:%M:%S"),
            who,
            row.content
        );
    }
    Ok(())
}

/// Handle config subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let mut cfg = RelayConfig::load(config.as_deref())?;
            if !cfg.auth.jwt_secret.is_empty() {
                cfg.auth.jwt_secret = "<redacted>".to_string();
            }
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let path = config::init_config(path.as_deref(), force)?;
            println!("Created configuration file at {}", path.display());
        }
        ConfigSubcommand::Validate { config } => {
            RelayConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
