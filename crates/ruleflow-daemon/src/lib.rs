//! ruleflow daemon
//!
//! Glue between the command line and the engine: configuration overlay,
//! logging, rule files and the per-credential instance fan-out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use ruleflow_core::{EngineConfig, Rule, RuleId};
use ruleflow_engine::{CompiledRule, Instance, JsonSchemaCompiler, StrictTemplates};
use ruleflow_store::{HttpStore, MemoryStore, PollingFeed, ResourceStore};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Install the global subscriber; `RUST_LOG` overrides the `info` default
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    // Ignored when a subscriber is already installed
    let _ = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
    };
}

/// Values given on the command line or through the environment
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    /// Replaces `api_url`
    pub api_url: Option<String>,
    /// Replaces `tokens` when non-empty
    pub tokens: Vec<String>,
    /// Replaces `poll_interval_ms`
    pub poll_interval_ms: Option<u64>,
}

/// Load the config file (defaults when absent) and apply `overrides`
///
/// # Errors
/// Returns error if the file cannot be loaded or the result is invalid
pub fn load_config(file: Option<&Path>, overrides: Overrides) -> Result<EngineConfig> {
    let mut config = match file {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(api_url) = overrides.api_url {
        config.api_url = api_url;
    }
    let tokens: Vec<String> = overrides
        .tokens
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if !tokens.is_empty() {
        config.tokens = tokens;
    }
    if let Some(interval) = overrides.poll_interval_ms {
        config.poll_interval_ms = interval;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Read a rule document from a JSON or YAML file
///
/// # Errors
/// Returns error if the file cannot be read or parsed
pub fn read_rule_file(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading rule {}", path.display()))?;
    let document = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing YAML rule {}", path.display()))?,
        Some("json") => serde_json::from_str(&raw)
            .with_context(|| format!("parsing JSON rule {}", path.display()))?,
        _ => bail!("unsupported rule file {}", path.display()),
    };
    Ok(document)
}

/// Rule files of `dir`, keyed by file stem, in name order
///
/// # Errors
/// Returns error if the directory or one of its rule files cannot be read
pub fn read_rule_dir(dir: &Path) -> Result<Vec<(RuleId, Value)>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("listing rules in {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("json" | "yaml" | "yml")
            )
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .with_context(|| format!("rule file name {} is not UTF-8", path.display()))?
                .to_string();
            Ok((RuleId::new(stem), read_rule_file(&path)?))
        })
        .collect()
}

/// Decode and compile a rule document without running it
///
/// # Errors
/// Returns the decoding or compilation failure
pub fn check_rule(id: RuleId, document: &Value) -> Result<CompiledRule> {
    let rule = Rule::from_document(document).context("decoding rule")?;
    let compiled = CompiledRule::compile(id, rule, &JsonSchemaCompiler, &StrictTemplates::new())
        .context("compiling rule")?;
    Ok(compiled)
}

/// Write rule documents into the rules collection of `store`
///
/// # Errors
/// Returns error if a document cannot be stored
pub async fn publish_rules(
    store: &dyn ResourceStore,
    config: &EngineConfig,
    rules: Vec<(RuleId, Value)>,
) -> Result<()> {
    for (id, document) in rules {
        let path = config.rules_path.child(id.as_str());
        store
            .put(&path, document, Some(&config.rules_tree))
            .await
            .with_context(|| format!("publishing rule {id}"))?;
    }
    Ok(())
}

/// Cooperative stop signal shared by every instance
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// Create the signal with its trigger
    #[must_use]
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(rx))
    }

    /// Resolve once the trigger fires or is dropped
    pub async fn wait(mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Run one instance per configured token against the HTTP store
///
/// Instances are isolated: one failing to start or stopping with an error
/// does not stop the others.
///
/// # Errors
/// Returns error naming how many instances failed
pub async fn run_http(config: &EngineConfig, shutdown: Shutdown) -> Result<()> {
    let interval = Duration::from_millis(config.poll_interval_ms);
    let runs = config.tokens.iter().enumerate().map(|(n, token)| {
        let shutdown = shutdown.clone();
        async move {
            let store: Arc<dyn ResourceStore> =
                Arc::new(HttpStore::new(config.api_url.clone(), token.clone())?);
            let feed = Arc::new(PollingFeed::new(Arc::clone(&store), interval));
            let instance = Instance::new(config.clone(), store, feed);
            info!(instance = n, api = %config.api_url, "Starting instance");
            instance.run(shutdown.wait()).await?;
            anyhow::Ok(())
        }
    });
    summarize(join_all(runs).await)
}

/// Run a single instance against an in-memory store seeded with `rules`
///
/// # Errors
/// Returns error if seeding fails or the instance stops with an error
pub async fn run_memory(
    config: &EngineConfig,
    rules: Vec<(RuleId, Value)>,
    shutdown: Shutdown,
) -> Result<()> {
    let store = MemoryStore::new();
    publish_rules(&store, config, rules).await?;
    let instance = Instance::new(config.clone(), Arc::new(store.clone()), Arc::new(store));
    info!("Starting in-memory instance");
    instance.run(shutdown.wait()).await?;
    Ok(())
}

fn summarize(results: Vec<Result<()>>) -> Result<()> {
    let total = results.len();
    let mut failed = 0;
    for (n, result) in results.into_iter().enumerate() {
        if let Err(err) = result {
            failed += 1;
            error!(instance = n, error = ?err, "Instance failed");
        }
    }
    if failed > 0 {
        bail!("{failed} of {total} instances failed");
    }
    Ok(())
}
