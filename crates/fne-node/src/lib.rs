//! FNE Node -- library crate for the DMR/P25 fixed network equipment binary.
//!
//! Exposes config, transport, background tasks and node assembly so the
//! integration tests can run a node in-process.

pub mod config;
pub mod node;
pub mod parrot_task;
pub mod peer_directory;
pub mod rules_task;
pub mod sweep_task;
pub mod transport_task;

use std::path::{Path, PathBuf};

use anyhow::Context;
use fne_routing::{RuleSet, SharedRules};

use crate::config::FneConfig;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn load_or_create_token(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated bearer token");
    Ok(token)
}

/// Initial rule snapshot from the [rules] section. Without a rules file
/// every peer is unknown and all traffic is refused.
pub fn load_rules(cfg: &FneConfig) -> anyhow::Result<SharedRules> {
    let rules = match cfg.rules.path.as_deref() {
        Some(path) => {
            let path = expand_tilde(path);
            let rules = RuleSet::load(&path)
                .with_context(|| format!("loading rules from {}", path.display()))?;
            tracing::info!(
                path = %path.display(),
                peers = rules.peers.len(),
                talkgroups = rules.talkgroups.len(),
                "rules loaded"
            );
            rules
        }
        None => {
            tracing::warn!("no rules file configured, all traffic will be refused");
            RuleSet::default()
        }
    };
    Ok(SharedRules::new(rules))
}
