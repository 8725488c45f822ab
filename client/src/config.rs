use crate::error::ClientError;
use clap::Parser;
use shared::protocol::MAX_SKIN_BYTES;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    pub server: String,

    /// Seconds to stay connected; 0 runs until Ctrl+C
    #[arg(short = 'd', long, default_value = "0")]
    pub duration: u64,

    /// Raw RGBA skin file uploaded after connecting
    #[arg(long)]
    pub skin: Option<PathBuf>,

    /// Radius in chunks streamed around the player
    #[arg(short = 'r', long, default_value = "2")]
    pub render_distance: i32,

    /// Client updates per second
    #[arg(short, long, default_value = "30")]
    pub tick_rate: u32,

    /// Degrees of rotation per unit of mouse movement
    #[arg(long, default_value = "0.1")]
    pub mouse_sensitivity: f32,

    /// Seconds to wait for the server to accept the connection
    #[arg(long, default_value = "5")]
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::parse_from(["client"])
    }
}

impl ClientConfig {
    pub fn server_addr(&self) -> Result<SocketAddr, ClientError> {
        self.server
            .parse()
            .map_err(|_| ClientError::InvalidAddress(self.server.clone()))
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn run_duration(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Reads the skin file, if one was given.
    pub fn load_skin(&self) -> Result<Option<Vec<u8>>, ClientError> {
        let Some(path) = &self.skin else {
            return Ok(None);
        };
        let skin = std::fs::read(path).map_err(|source| ClientError::Skin {
            path: path.clone(),
            source,
        })?;
        if skin.len() > MAX_SKIN_BYTES {
            return Err(ClientError::SkinTooLarge(skin.len()));
        }
        Ok(Some(skin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_addr().unwrap().port(), 8080);
        assert_eq!(config.run_duration(), None);
        assert!(config.load_skin().unwrap().is_none());
    }

    #[test]
    fn test_invalid_address() {
        let config = ClientConfig::try_parse_from(["client", "-s", "not-an-address"]).unwrap();
        assert!(matches!(
            config.server_addr(),
            Err(ClientError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_duration() {
        let config = ClientConfig::try_parse_from(["client", "-d", "3"]).unwrap();
        assert_eq!(config.run_duration(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_missing_skin_file() {
        let config = ClientConfig {
            skin: Some(PathBuf::from("/nonexistent/skin.rgba")),
            ..ClientConfig::default()
        };
        assert!(matches!(config.load_skin(), Err(ClientError::Skin { .. })));
    }
}
