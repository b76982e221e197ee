use std::path::PathBuf;

use crate::common::constants::WorldConstants;

/// Settings for one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// Edge length of newly generated worlds.
    pub world_size: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("world size must be between 1 and {max}, got {got}")]
    WorldSize { got: u32, max: u32 },
    #[error("bind address must not be empty")]
    EmptyBind,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::EmptyBind);
        }
        if self.world_size == 0 || self.world_size > WorldConstants::MAX_WORLD_SIZE {
            return Err(ConfigError::WorldSize {
                got: self.world_size,
                max: WorldConstants::MAX_WORLD_SIZE,
            });
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: WorldConstants::DEFAULT_SERVER_ADDRESS.to_string(),
            data_dir: PathBuf::from(WorldConstants::DEFAULT_DATA_DIR),
            world_size: WorldConstants::DEFAULT_WORLD_SIZE,
        }
    }
}
