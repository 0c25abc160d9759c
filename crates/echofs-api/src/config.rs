//! Server configuration loading.

use std::path::Path;

use serde::{Deserialize, Serialize};

use echofs_cluster::EchoConfig;

/// Full server configuration: HTTP listener plus the core settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the admin server binds to
    pub listen: ListenConfig,
    /// Core replication and controller settings
    pub echo: EchoConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7400,
        }
    }
}

impl ListenConfig {
    /// "host:port" form for the HTTP server.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ApiConfig {
    /// Load configuration from an optional TOML file, with
    /// `ECHOFS_`-prefixed environment variables overriding file values.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is unreadable or a value does not
    /// deserialize.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("ECHOFS").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = ApiConfig::load(None).unwrap();
        assert_eq!(config.listen.port, 7400);
        assert_eq!(config.echo.replication.quorum_size, 2);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echofs.toml");
        std::fs::write(
            &path,
            r#"
[listen]
port = 9000

[[echo.pool.workers]]
id = "n1"
address = "http://n1:7400"
"#,
        )
        .unwrap();

        let config = ApiConfig::load(Some(&path)).unwrap();
        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.echo.pool.workers.len(), 1);
        // Untouched sections keep their defaults.
        assert_eq!(config.echo.replication.replication_factor, 3);
    }
}
