//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest accepted read buffer. A frame unit must fit in one read, so anything close to a
/// single segment is rejected.
pub const MIN_READ_BUFFER_SIZE: usize = 2048;

/// Switchboard configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MuxConfig {
    /// Size of the buffer each demultiplexer loop reads into
    pub read_buffer_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl MuxConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Ok(size) = std::env::var("TUNNEL_MUX_READ_BUFFER_SIZE") {
            config.read_buffer_size = size
                .parse()
                .context("Invalid TUNNEL_MUX_READ_BUFFER_SIZE value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size < MIN_READ_BUFFER_SIZE {
            anyhow::bail!(
                "read_buffer_size must be >= {} (got {})",
                MIN_READ_BUFFER_SIZE,
                self.read_buffer_size
            );
        }
        Ok(())
    }
}

fn default_read_buffer_size() -> usize {
    20 * 1024
}
