//! `hidesync-db` - operator tooling for the encrypted HideSync database
//!
//! Configuration comes from the same files and environment variables the
//! services read (a `.env` file in the working directory is loaded first).
//! The `aws`, `azure` and `gcp` key methods need the matching cargo feature.
//!
//! This is an operator tool, so `println!` is used for its output rather
//! than structured logging.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hidesync_common::security::SecureString;
use hidesync_domain::Config;
use hidesync_infra::database::{check_database, EncryptionManager, SessionFactory};
use hidesync_infra::errors::conversions::to_domain;
use hidesync_infra::observability::{init_logging, LogFormat};
use hidesync_infra::security::cloud;
use hidesync_infra::{config, KeyManager};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "hidesync-db", version, about = "Manage the encrypted HideSync database")]
struct Cli {
    /// Config file (overrides HIDESYNC_CONFIG and the standard locations)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a new key file with owner-only permissions
    CreateKey {
        /// Key to store instead of a generated one (visible in shell history)
        #[arg(long, value_parser = parse_key)]
        key: Option<String>,
        /// Destination (defaults to the configured key file path)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Create a fresh encrypted database at the configured path
    InitDb {
        /// Replace an existing database
        #[arg(long)]
        force: bool,
    },
    /// Check that the database opens under the configured key
    CheckDb {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the session mode and pool health
    Status,
}

fn main() -> ExitCode {
    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "Loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => eprintln!("Ignoring unreadable .env file: {e}"),
    }
    init_logging(LogFormat::from_env());

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::CreateKey { key, path, force } => {
            create_key(&config, key.map(SecureString::from), path, force)
        }
        Commands::InitDb { force } => init_db(&config, force),
        Commands::CheckDb { json } => check_db(&config, json),
        Commands::Status => status(&config),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let mut config = config::load_from_file(Some(path))?;
            config::apply_env_overrides(&mut config)?;
            config.validate()?;
            config
        }
        None => config::load()?,
    };
    Ok(config)
}

fn parse_key(raw: &str) -> std::result::Result<String, String> {
    let key = raw.trim();
    if key.is_empty() {
        return Err("key must not be empty".into());
    }
    Ok(key.to_string())
}

fn create_key(
    config: &Config,
    key: Option<SecureString>,
    path: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    let path = path.unwrap_or_else(|| KeyManager::from_config(config).key_file_path());
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }

    let provided = key.is_some();
    KeyManager::create_key_file_at(&path, key)
        .with_context(|| format!("Failed to create key file at {}", path.display()))?;
    if provided {
        println!("Provided key written to {}", path.display());
    } else {
        println!("Generated key written to {}", path.display());
    }
    println!("Back it up now: the database cannot be opened without it.");
    Ok(())
}

fn encryption_manager(config: &Config) -> Result<EncryptionManager> {
    let manager = EncryptionManager::new(config, KeyManager::from_config(config));
    manager.initialize().map_err(to_domain)?;
    if !manager.is_encryption_enabled() {
        bail!("no database key found for key method '{}'", config.key_management.method);
    }
    Ok(manager)
}

fn init_db(config: &Config, force: bool) -> Result<()> {
    let path = Path::new(&config.database.path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }

    let manager = encryption_manager(config)?;
    manager.create_new_encrypted_database(path).map_err(to_domain)?;
    info!(path = %path.display(), "Encrypted database initialized");
    println!("Created encrypted database at {}", path.display());
    Ok(())
}

fn check_db(config: &Config, json: bool) -> Result<()> {
    let path = Path::new(&config.database.path);
    let manager = encryption_manager(config)?;
    let report = check_database(&manager, path).map_err(to_domain)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Database:    {}", report.path.display());
        println!("Exists:      {}", report.exists);
        println!("Size:        {} bytes", report.size_bytes);
        println!("Encrypted:   {}", report.encrypted);
        println!("Integrity:   {}", report.integrity.as_deref().unwrap_or("-"));
        println!("SQLCipher:   {}", report.sqlcipher_version.as_deref().unwrap_or("unavailable"));
        println!("Tables:      {}", report.tables.join(", "));
        if let Some(error) = &report.error {
            println!("Error:       {error}");
        }
    }

    if !report.is_healthy() {
        bail!("database check failed");
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let factory = SessionFactory::from_config(config).map_err(to_domain)?;
    let health = factory.health();
    let status = serde_json::json!({
        "environment": config.environment.to_string(),
        "database": config.database.path,
        "mode": factory.mode(),
        "key_method": config.key_management.method.to_string(),
        "cloud_key_methods": cloud::available_providers()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        "sqlcipher_version": factory.encryption().and_then(EncryptionManager::sqlcipher_version),
        "health": health,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    factory.dispose();
    Ok(())
}

#[cfg(test)]
mod tests {
    //! Unit tests for the hidesync-db argument parser.
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_db_json() {
        let cli = Cli::parse_from(["hidesync-db", "check-db", "--json"]);
        assert!(matches!(cli.command, Commands::CheckDb { json: true }));
    }

    #[test]
    fn test_parse_create_key_with_key() {
        let cli = Cli::parse_from(["hidesync-db", "create-key", "--key", " s3cret ", "--path", "k.key"]);
        match cli.command {
            Commands::CreateKey { key, path, force } => {
                assert_eq!(key.as_deref(), Some("s3cret"));
                assert_eq!(path, Some(PathBuf::from("k.key")));
                assert!(!force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["hidesync-db", "create-key", "--key", "  "]).is_err());
    }

    #[test]
    fn test_create_key_writes_provided_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("provided.key");

        create_key(&Config::default(), Some(SecureString::from("s3cret")), Some(path.clone()), false)
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "s3cret");
        assert!(create_key(&Config::default(), None, Some(path), false).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["hidesync-db", "init-db", "--config", "/tmp/hidesync.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/hidesync.toml")));
        assert!(matches!(cli.command, Commands::InitDb { force: false }));
    }
}
