use anyhow::{Context, Result};
use clap::ValueEnum;
use query_core::LayerConfig;
use std::path::Path;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "qil.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Load and validate the layer configuration
pub fn load_layer_config(path: Option<&Path>) -> Result<LayerConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let config = LayerConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    tracing::debug!(
        cluster = %config.cluster.cluster_name,
        nodes = config.nodes.len(),
        entities = config.sort_options.len(),
        "configuration loaded"
    );
    Ok(config)
}
