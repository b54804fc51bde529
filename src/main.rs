use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use loginguard::auth::{
    build_guard, CredentialVerifier, InMemoryIdentityDirectory, JwtTokenIssuer, LoginOrchestrator,
};
use loginguard::config::LoginGuardConfig;
use loginguard::ratelimit::GuardKey;
use loginguard::store;

#[derive(Debug, Parser)]
#[command(name = "loginguard", version, about = "Brute-force protection for credential logins")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the configuration and exit
    Validate,
    /// Print an Argon2id hash for a secret
    HashPassword { secret: String },
    /// Run one login attempt against the configured counter store
    Attempt {
        #[arg(long)]
        login_key: String,
        #[arg(long)]
        secret: String,
        #[arg(long)]
        address: String,
        /// YAML file with an `identities` list
        #[arg(long)]
        identities: String,
    },
    /// Show the counters for a login key and address
    Status {
        #[arg(long)]
        login_key: String,
        #[arg(long)]
        address: String,
    },
    /// Clear the consecutive-failure counter for a login key and address
    Unblock {
        #[arg(long)]
        login_key: String,
        #[arg(long)]
        address: String,
        /// Also clear the address counter
        #[arg(long)]
        include_address: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = LoginGuardConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Validate => {
            config.validate()?;
            println!("{}", serde_yaml::to_string(&redacted(&config))?);
        }
        Command::HashPassword { secret } => {
            let verifier = CredentialVerifier::new(&config.hashing)?;
            println!("{}", verifier.hash(secret).await?);
        }
        Command::Attempt {
            login_key,
            secret,
            address,
            identities,
        } => {
            config.validate()?;
            let directory = InMemoryIdentityDirectory::from_file(&identities)
                .with_context(|| format!("loading identities from {identities}"))?;
            let tokens = JwtTokenIssuer::new(&config.tokens)?;
            let store = store::connect(&config.store).await?;
            let orchestrator =
                LoginOrchestrator::from_config(&config, store, Arc::new(directory), Arc::new(tokens))?;

            let decision = orchestrator.attempt_login(&login_key, &secret, &address).await?;
            info!(status = decision.status_code(), "Login attempt finished");
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Command::Status { login_key, address } => {
            config.validate()?;
            let guard = build_guard(&config, store::connect(&config.store).await?)?;
            let status = guard.status(&GuardKey::new(&login_key, &address)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Unblock {
            login_key,
            address,
            include_address,
        } => {
            config.validate()?;
            let guard = build_guard(&config, store::connect(&config.store).await?)?;
            guard
                .unblock(&GuardKey::new(&login_key, &address), include_address)
                .await?;
            println!("unblocked");
        }
    }

    Ok(())
}

/// Initialize tracing, honouring `RUST_LOG`.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn redacted(config: &LoginGuardConfig) -> LoginGuardConfig {
    let mut config = config.clone();
    if !config.tokens.secret.is_empty() {
        config.tokens.secret = "<redacted>".to_string();
    }
    config
}
