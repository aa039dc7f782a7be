//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the relay.

use clap::{Parser, Subcommand};

/// persona-relay - WebSocket session relay between users and LLM personas
///
/// Authenticates WebSocket clients, binds each connection to a persona,
/// forwards messages to the completion service and records the
/// conversation.
#[derive(Parser, Debug)]
#[command(name = "persona-relay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the WebSocket server until Ctrl+C
    Serve {
        /// Path to configuration file
        #[arg(short, long, env = "PERSONA_RELAY_CONFIG")]
        config: Option<String>,

        /// Override the listen address (e.g. 0.0.0.0:8001)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// User provisioning
    User {
        #[command(subcommand)]
        subcommand: UserSubcommand,
    },

    /// Access tokens for development clients
    Token {
        #[command(subcommand)]
        subcommand: TokenSubcommand,
    },

    /// Persona inspection
    Persona {
        #[command(subcommand)]
        subcommand: PersonaSubcommand,
    },

    /// Print recent messages exchanged with a persona
    History {
        /// Handle of the persona's owner
        handle: String,

        /// Persona name
        persona: String,

        /// Number of messages to show (newest first)
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Path to configuration file
        #[arg(short, long, env = "PERSONA_RELAY_CONFIG")]
        config: Option<String>,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration (secrets redacted)
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// User subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum UserSubcommand {
    /// Create a user (no-op if the handle exists) and print its id
    Add {
        handle: String,

        /// Path to configuration file
        #[arg(short, long, env = "PERSONA_RELAY_CONFIG")]
        config: Option<String>,
    },
}

/// Token subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum TokenSubcommand {
    /// Mint an access token for an existing user
    Issue {
        handle: String,

        /// Lifetime in seconds (defaults to auth.token_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,

        /// Path to configuration file
        #[arg(short, long, env = "PERSONA_RELAY_CONFIG")]
        config: Option<String>,
    },
}

/// Persona subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum PersonaSubcommand {
    /// List the personas a user owns
    List {
        handle: String,

        /// Path to configuration file
        #[arg(short, long, env = "PERSONA_RELAY_CONFIG")]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        // Verifies that the CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::parse_from(["persona-relay", "serve"]);
        match cli.command {
            Commands::Serve { bind, .. } => {
                assert!(bind.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_options() {
        let cli = Cli::parse_from([
            "persona-relay",
            "serve",
            "--config",
            "/etc/relay.toml",
            "--bind",
            "0.0.0.0:9000",
        ]);
        match cli.command {
            Commands::Serve { config, bind } => {
                assert_eq!(config, Some("/etc/relay.toml".to_string()));
                assert_eq!(bind, Some("0.0.0.0:9000".to_string()));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_token_issue() {
        let cli = Cli::parse_from(["persona-relay", "token", "issue", "alice", "--ttl", "60"]);
        match cli.command {
            Commands::Token {
                subcommand: TokenSubcommand::Issue { handle, ttl, .. },
            } => {
                assert_eq!(handle, "alice");
                assert_eq!(ttl, Some(60));
            }
            _ => panic!("Expected Token Issue command"),
        }
    }

    #[test]
    fn test_history_defaults() {
        let cli = Cli::parse_from(["persona-relay", "history", "alice", "Muse"]);
        match cli.command {
            Commands::History {
                handle,
                persona,
                limit,
                ..
            } => {
                assert_eq!(handle, "alice");
                assert_eq!(persona, "Muse");
                assert_eq!(limit, 20);
            }
            _ => panic!("Expected History command"),
        }
    }

    #[test]
    fn test_user_add() {
        let cli = Cli::parse_from(["persona-relay", "user", "add", "bob"]);
        match cli.command {
            Commands::User {
                subcommand: UserSubcommand::Add { handle, .. },
            } => assert_eq!(handle, "bob"),
            _ => panic!("Expected User Add command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["persona-relay", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::parse_from(["persona-relay", "--quiet", "version"]);
        assert!(cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["persona-relay", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
