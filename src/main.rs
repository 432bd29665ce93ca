#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # revdial
//!
//! Reverse-dial tunnels: reach agents behind NAT from a control plane over
//! the agent's own outbound WebSocket.
//!
//! ## Subcommands
//!
//! - `revdial serve`: run the server (registry, control and pickup endpoints)
//! - `revdial agent`: run an agent that exposes one local target under a key
//!
//! ## API surface
//!
//! | Method | Path                     | Auth | Description                    |
//! |--------|--------------------------|------|--------------------------------|
//! | GET    | `/api/health`            | No   | Liveness probe                 |
//! | GET    | `/api/revdial?key=K`     | Yes  | Agent control WebSocket        |
//! | GET    | `/api/revdial/pickup`    | Yes  | Agent data WebSocket (`key`, `id`) |
//! | GET    | `/api/revdial/stats`     | Yes  | Registry snapshot              |
//!
//! Auth is `Authorization: Bearer <token>` or a `?token=<token>` query param.

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use revdial::config::{Config, DEFAULT_TOKEN};
use revdial::{forward, router, AgentListener, ConnectionManager, ServerState};

/// Reverse-dial tunnels over WebSocket.
#[derive(Parser)]
#[command(name = "revdial", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run an agent that serves one local target.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Key to register under (overrides `[agent] key`).
        #[arg(long)]
        key: Option<String>,
        /// Server base URL (overrides `[agent] server_url`).
        #[arg(long)]
        server_url: Option<String>,
        /// Local target, `host:port` or `unix:/path` (overrides `[agent] target`).
        #[arg(long)]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = load_config(config.as_deref());
            run_server(config).await;
        }
        Commands::Agent {
            config,
            key,
            server_url,
            target,
        } => {
            let mut config = load_config(config.as_deref());
            if key.is_some() {
                config.agent.key = key;
            }
            if let Some(url) = server_url {
                config.agent.server_url = url;
            }
            if target.is_some() {
                config.agent.target = target;
            }
            run_agent(config).await;
        }
    }
}

fn load_config(path: Option<&str>) -> Config {
    let config = Config::load(path).unwrap_or_else(|e| {
        eprintln!("revdial: {e}");
        std::process::exit(2);
    });

    // RUST_LOG wins over the configured level
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    config
}

async fn run_server(config: Config) {
    info!("revdial v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.token == DEFAULT_TOKEN {
        warn!("Using default token, set REVDIAL_TOKEN or update config");
    }

    let (manager_config, dialer_config) = config
        .manager_config()
        .and_then(|m| config.dialer_config().map(|d| (m, d)))
        .unwrap_or_else(|e| {
            error!(error = %e, "Invalid server configuration");
            std::process::exit(2);
        });
    let manager = ConnectionManager::start(manager_config, dialer_config);
    let background = CancellationToken::new();

    let mut forward_tasks = Vec::with_capacity(config.forward.len());
    for fwd in &config.forward {
        match forward::bind(manager.clone(), fwd.clone(), background.clone()).await {
            Ok(task) => forward_tasks.push(task),
            Err(e) => {
                error!(listen = %fwd.listen, error = %e, "Failed to bind forward");
                std::process::exit(1);
            }
        }
    }

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");
    let app = router(ServerState::new(manager.clone()), config.auth.token.clone());

    info!("Server ready");

    let drain = manager.clone();
    let shutdown = async move {
        shutdown_signal().await;
        // Agents get a normal close so they don't count it as a lost link
        drain.shutdown();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    background.cancel();
    for task in forward_tasks {
        let _ = task.await;
    }
    manager.shutdown();
    info!("Goodbye");
}

async fn run_agent(config: Config) {
    let agent_config = config.agent_config().unwrap_or_else(|e| {
        error!(error = %e, "Invalid agent configuration");
        std::process::exit(2);
    });

    info!("revdial agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        key = %agent_config.key,
        target = %agent_config.target,
        "Serving local target"
    );
    if agent_config.token == DEFAULT_TOKEN {
        warn!("Using default token, set REVDIAL_TOKEN or update config");
    }

    let listener = AgentListener::new(agent_config);
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    listener.run(shutdown).await;
    let stats = listener.stats().snapshot();
    info!(
        reconnects = stats.reconnects,
        pickups_served = stats.pickups_served,
        pickups_failed = stats.pickups_failed,
        "Goodbye"
    );
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
