//! Dockwatch Console - terminal client for a remote Docker backend
//!
//! This client talks to the Dockwatch backend over HTTP + WebSocket:
//! - Authentication and secure token storage (OS keyring)
//! - Container and image listings, image pull/remove
//! - Live container monitoring (stats polling, log stream, actions)

mod api;
mod auth;
mod config;
mod models;
mod session;
mod state;
mod watch;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::api::ApiClient;
use crate::auth::{KeyringTokenStore, StaticToken, TokenSource};
use crate::config::ConsoleConfig;
use crate::session::SessionContext;

#[derive(Parser)]
#[command(
    name = "dockwatch",
    version,
    about = "Operator console for a remote Docker backend"
)]
struct Cli {
    /// Target node (overrides the configured default)
    #[arg(long)]
    node: Option<String>,

    /// Bearer token to use instead of the one stored in the keyring
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate and store the bearer token in the OS keyring
    Login {
        username: Option<String>,
    },
    /// Create the first admin user on the backend
    Register {
        username: Option<String>,
    },
    /// Drop the stored bearer token
    Logout,
    /// List the Docker nodes known to the backend
    Nodes,
    /// List containers on the node
    Containers,
    /// List images on the node
    Images,
    /// Pull an image onto the node
    Pull {
        image: String,
    },
    /// Remove an image from the node
    Rmi {
        image_id: String,
    },
    /// Watch one container: live stats, log stream and lifecycle actions
    Watch {
        container_id: String,
    },
    /// Write a default configuration file if none exists yet
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dockwatch_console=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ConsoleConfig::load()
        .await
        .context("Failed to load configuration")?;
    if let Some(node) = cli.node {
        config.server.node = node;
    }

    let store = KeyringTokenStore::new();
    let tokens: Arc<dyn TokenSource> = match cli.token {
        Some(token) => Arc::new(StaticToken(token)),
        None => Arc::new(store.clone()),
    };
    let api = ApiClient::new(config.server.base_url.clone(), tokens);

    match cli.command {
        Command::Login { username } => login(&api, &store, username).await?,
        Command::Register { username } => register(&api, username).await?,
        Command::Logout => {
            store.clear().context("Failed to clear stored token")?;
            println!("Token removed.");
        }
        Command::Nodes => {
            for node in api.nodes().await? {
                println!("{node}");
            }
        }
        Command::Containers => list_containers(&api, &config).await?,
        Command::Images => list_images(&api, &config).await?,
        Command::Pull { image } => {
            api.pull_image(&config.server.node, &image).await?;
            println!("Pulled {image}.");
        }
        Command::Rmi { image_id } => {
            api.remove_image(&config.server.node, &image_id).await?;
            println!("Removed {image_id}.");
        }
        Command::Watch { container_id } => {
            let ctx = SessionContext::from_config(api, &config);
            watch::run(ctx, container_id).await?;
        }
        Command::InitConfig => {
            let path = ConsoleConfig::config_file_path()?;
            if path.exists() {
                println!("Config already exists at {}", path.display());
            } else {
                ConsoleConfig::default().save_to(&path).await?;
                println!("Wrote default config to {}", path.display());
            }
        }
    }

    Ok(())
}

async fn login(
    api: &ApiClient,
    store: &KeyringTokenStore,
    username: Option<String>,
) -> Result<()> {
    let username = match username {
        Some(u) => u,
        None => prompt("Username: ")?,
    };
    let password = prompt("Password: ")?;

    let resp = api
        .login(&username, &password)
        .await
        .context("Login failed")?;
    if resp.token_type != "bearer" {
        anyhow::bail!("unexpected token type: {}", resp.token_type);
    }
    store
        .store(&resp.access_token)
        .context("Failed to store token in keyring")?;

    info!("logged in as {}", username);
    println!("Login successful, token stored.");
    Ok(())
}

async fn register(api: &ApiClient, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(u) => u,
        None => prompt("Username: ")?,
    };
    let password = prompt("Password: ")?;

    api.register(&username, &password)
        .await
        .context("Registration failed (the backend only allows the first admin user)")?;
    println!("Admin user created. Run `dockwatch login` to authenticate.");
    Ok(())
}

async fn list_containers(api: &ApiClient, config: &ConsoleConfig) -> Result<()> {
    let containers = api.containers(&config.server.node).await?;
    if containers.is_empty() {
        println!("No containers.");
        return Ok(());
    }
    for c in containers {
        let short_id: String = c.id.chars().take(12).collect();
        let image = c
            .image
            .as_ref()
            .and_then(|tags| tags.first())
            .map(String::as_str)
            .unwrap_or("unknown");
        println!("{:<14} {:<24} {:<28} {}", short_id, c.name, image, c.status);
    }
    Ok(())
}

async fn list_images(api: &ApiClient, config: &ConsoleConfig) -> Result<()> {
    let images = api.images(&config.server.node).await?;
    if images.is_empty() {
        println!("No images.");
        return Ok(());
    }
    for img in images {
        let tag = img
            .repo_tags
            .as_ref()
            .and_then(|tags| tags.first())
            .map(String::as_str)
            .unwrap_or("(none)");
        let size_mb = img.size as f64 / 1024.0 / 1024.0;
        println!("{:<40} {:>10.2} MB  {}", tag, size_mb, img.id);
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut value = String::new();
    std::io::stdin().read_line(&mut value)?;
    Ok(value.trim().to_string())
}
