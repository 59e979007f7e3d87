//! FNE Node -- DMR/P25 traffic switching between repeater peers.
//!
//! Usage:
//!   fne-node                          # Run with default config
//!   fne-node --config path.toml       # Run with custom config
//!   fne-node check-rules rules.toml   # Validate a rules file

use fne_node::config::FneConfig;
use fne_node::{expand_tilde, load_or_create_token, load_rules, node};

use clap::{Parser, Subcommand};
use fne_routing::RuleSet;

#[derive(Parser)]
#[command(name = "fne-node", about = "DMR/P25 fixed network equipment node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.fne/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show node status (queries local API)
    Status,
    /// List calls in progress
    Calls,
    /// List peers heard on the transport
    Peers,
    /// Show the active rule snapshot
    Rules,
    /// Show traffic counters and parrot state
    Diagnostics,
    /// Parse and validate a rules file without starting the node
    CheckRules {
        /// Rules file (defaults to [rules].path from the config)
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fne_node=info,fne_calltrack=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = FneConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
        Some(Commands::Status) => {
            cli_api_call(&cfg, "/api/v1/status").await?;
        }
        Some(Commands::Calls) => {
            cli_api_call(&cfg, "/api/v1/calls").await?;
        }
        Some(Commands::Peers) => {
            cli_api_call(&cfg, "/api/v1/peers").await?;
        }
        Some(Commands::Rules) => {
            cli_api_call(&cfg, "/api/v1/rules").await?;
        }
        Some(Commands::Diagnostics) => {
            cli_api_call(&cfg, "/api/v1/diagnostics").await?;
        }
        Some(Commands::CheckRules { path }) => {
            let Some(path) = path.or_else(|| cfg.rules.path.clone()) else {
                anyhow::bail!("no rules file given and none configured");
            };
            let path = expand_tilde(&path);
            match RuleSet::load(&path) {
                Ok(rules) => {
                    println!(
                        "{}: {} peers, {} talkgroups",
                        path.display(),
                        rules.peers.len(),
                        rules.talkgroups.len()
                    );
                }
                Err(e) => {
                    eprintln!("{}: {e}", path.display());
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Make a POST request to the local node API and print the JSON response.
async fn cli_api_call(cfg: &FneConfig, path: &str) -> anyhow::Result<()> {
    let url = format!("http://{}{}", cfg.node.api_addr, path);

    let token_path = expand_tilde(&cfg.node.token_path);
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", token))
        .body("{}")
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_node(cfg: FneConfig) -> anyhow::Result<()> {
    tracing::info!(
        peer_id = cfg.node.peer_id,
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.network.listen_addr,
        "starting fne-node"
    );

    let bearer_token = load_or_create_token(&expand_tilde(&cfg.node.token_path))?;
    let rules = load_rules(&cfg)?;
    let mut running = node::start(&cfg, rules, bearer_token).await?;

    tracing::info!("all tasks spawned, press Ctrl-C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutting down...");
        }
        _ = running.wait_any() => {
            tracing::warn!("a node task exited, shutting down");
        }
    }
    running.shutdown().await;

    tracing::info!("shutdown complete");
    Ok(())
}
