//! Command line configuration for the server binary

use crate::error::ServerError;
use clap::Parser;
use shared::{VoxelDefinition, VoxelRegistry};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Maximum number of simultaneously connected players
    #[arg(short, long, default_value = "16", value_parser = clap::value_parser!(u8).range(1..))]
    pub max_connections: u8,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "30")]
    pub tick_rate: u32,

    /// Ticks between entity snapshots
    #[arg(long, default_value = "2")]
    pub snapshot_interval: u32,

    /// World generation seed
    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// JSON file with voxel definitions, air first
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Inbound datagrams handled per tick before the rest wait for the next one
    #[arg(long, default_value = "512")]
    pub max_packets_per_tick: usize,

    /// Seconds of silence before a client is timed out
    #[arg(long, default_value = "5")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["server"])
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Config("max connections must be at least 1".into()));
        }
        if self.tick_rate == 0 {
            return Err(ServerError::Config("tick rate must be positive".into()));
        }
        if self.snapshot_interval == 0 {
            return Err(ServerError::Config("snapshot interval must be positive".into()));
        }
        if self.max_packets_per_tick == 0 {
            return Err(ServerError::Config("packet budget must be positive".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ServerError::Config("timeout must be at least 1 second".into()));
        }
        Ok(())
    }

    /// The voxel registry named on the command line, or the built-in one.
    pub fn load_registry(&self) -> Result<VoxelRegistry, ServerError> {
        match &self.registry {
            Some(path) => load_registry_file(path),
            None => Ok(VoxelRegistry::with_default_voxels()),
        }
    }
}

pub fn load_registry_file(path: &Path) -> Result<VoxelRegistry, ServerError> {
    let text = std::fs::read_to_string(path).map_err(|source| ServerError::RegistryIo {
        path: path.to_path_buf(),
        source,
    })?;
    let definitions: Vec<VoxelDefinition> = serde_json::from_str(&text)?;
    Ok(VoxelRegistry::from_definitions(definitions)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "127.0.0.1:8080");
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
        assert!(config.load_registry().unwrap().len() > 1);
    }

    #[test]
    fn test_zero_connections_rejected_by_parser() {
        assert!(ServerConfig::try_parse_from(["server", "--max-connections", "0"]).is_err());
        let config = ServerConfig::try_parse_from(["server", "-m", "2", "-t", "60"]).unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.tick_rate, 60);
    }

    #[test]
    fn test_invalid_snapshot_interval() {
        let config = ServerConfig {
            snapshot_interval: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ServerConfig::try_parse_from(["server", "--timeout-secs", "0"]).unwrap();
        assert_eq!(config.timeout(), Duration::ZERO);
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));

        let config = ServerConfig {
            timeout_secs: 1,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"name": "air", "solid": false, "texture": ""}},
                {{"name": "basalt", "solid": true, "texture": "basalt"}}
            ]"#
        )
        .unwrap();

        let config = ServerConfig {
            registry: Some(file.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let registry = config.load_registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_of("basalt"), Some(1));
    }

    #[test]
    fn test_registry_file_errors() {
        let missing = load_registry_file(Path::new("/nonexistent/registry.json"));
        assert!(matches!(missing, Err(ServerError::RegistryIo { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            load_registry_file(file.path()),
            Err(ServerError::RegistryFormat(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "stone", "solid": true, "texture": "stone"}}]"#).unwrap();
        assert!(matches!(
            load_registry_file(file.path()),
            Err(ServerError::Registry(_))
        ));
    }
}
