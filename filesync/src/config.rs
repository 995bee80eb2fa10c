//! Engine-wide tuning knobs

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tuning shared by the diff engine, the remote protocol and copies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the walk and metadata channels
    pub walk_channel_capacity: usize,
    /// Size of the pooled buffers used for byte copies
    pub copy_buffer_size: usize,
    /// Largest DATA payload a sender emits per packet
    pub data_chunk_size: usize,
    /// Largest frame the packet codec accepts
    pub max_frame_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            walk_channel_capacity: 128,
            copy_buffer_size: 32 * 1024,
            data_chunk_size: 32 * 1024,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document, filling missing fields with defaults
    pub fn from_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a JSON config file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_str(&contents)
    }
}
