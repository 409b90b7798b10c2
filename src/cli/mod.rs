// FieldVault — CLI Module
//
// Command-line interface using clap derive macros.
// Subcommands: init, put, get, list, remove, metrics, cleanup, clear,
// classifications.

mod commands;

use std::fmt;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::classify::DataKind;

pub use commands::execute;

/// FieldVault — encrypted offline storage for field data.
#[derive(Parser, Debug)]
#[command(name = "fieldvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Clone)]
pub struct GlobalArgs {
    /// Path to the record database (defaults to the platform data directory).
    #[arg(long, global = true, env = "FIELDVAULT_DB")]
    pub db: Option<PathBuf>,

    /// Path to a JSON configuration file.
    #[arg(long, global = true, env = "FIELDVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// User whose records are accessed.
    #[arg(long, global = true, env = "FIELDVAULT_USER")]
    pub user: Option<String>,

    /// Session token issued by the authentication system.
    /// Prefer the environment variable to keep it out of shell history.
    #[arg(long, global = true, env = "FIELDVAULT_SESSION_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl fmt::Debug for GlobalArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalArgs")
            .field("db", &self.db)
            .field("config", &self.config)
            .field("user", &self.user)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database, validate configuration and run the crypto self-test.
    Init,

    /// Store a JSON payload as a classified record.
    Put {
        /// Data kind (assessment, incident, response, user_profile, commitment, auth_token).
        kind: DataKind,

        /// Record id, unique per kind and user.
        id: String,

        /// Inline JSON payload.
        #[arg(long, conflicts_with = "file")]
        data: Option<String>,

        /// Read the JSON payload from a file.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Decrypt and print a record.
    Get {
        kind: DataKind,
        id: String,
    },

    /// List record ids of one kind.
    List {
        kind: DataKind,
    },

    /// Delete a record.
    Remove {
        kind: DataKind,
        id: String,
    },

    /// Show storage metrics for the user.
    Metrics,

    /// Run a retention cleanup pass now.
    Cleanup,

    /// Delete every record of the user.
    Clear {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Print the classification table in effect.
    Classifications,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_put_with_globals() {
        let cli = Cli::try_parse_from([
            "fieldvault",
            "put",
            "user-profile",
            "me",
            "--data",
            r#"{"name":"Ana"}"#,
            "--user",
            "u1",
            "--token",
            "secret-token",
        ])
        .unwrap();

        assert_eq!(cli.global.user.as_deref(), Some("u1"));
        match cli.command {
            Commands::Put { kind, id, data, file } => {
                assert_eq!(kind, DataKind::UserProfile);
                assert_eq!(id, "me");
                assert!(data.is_some());
                assert!(file.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(Cli::try_parse_from(["fieldvault", "list", "weather"]).is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let cli = Cli::try_parse_from(["fieldvault", "metrics", "--token", "secret-token"])
            .unwrap();
        assert!(!format!("{:?}", cli).contains("secret-token"));
    }
}
