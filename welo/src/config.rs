//! Node configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::replicator::{live::LiveConfig, zzzync::ZzzyncConfig};

/// Configuration of the replicators of a node.
///
/// Usually loaded from a TOML file with [`Config::load`]; missing sections and fields take
/// their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The DHT and naming replicator.
    pub zzzync: ZzzyncConfig,
    /// The gossip replicator.
    pub live: LiveConfig,
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: Config = toml::from_str(&s)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use testresult::TestResult;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(
            config.zzzync.republish_interval,
            Duration::from_secs(10 * 60 * 60)
        );
        assert_eq!(config.zzzync.fetch_concurrency, 16);
        assert_eq!(config.live.max_orphans, 1024);
    }

    #[tokio::test]
    async fn load_partial_file() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("welo.toml");
        tokio::fs::write(
            &path,
            "[zzzync]\nrepublish_interval = \"30m\"\n\n[live]\nmax_orphans = 8\n",
        )
        .await?;
        let config = Config::load(&path).await?;
        assert_eq!(config.zzzync.republish_interval, Duration::from_secs(30 * 60));
        assert_eq!(config.zzzync.fetch_concurrency, 16);
        assert_eq!(config.live.max_orphans, 8);

        assert!(Config::load(dir.path().join("missing.toml")).await.is_err());
        Ok(())
    }

    #[test]
    fn toml_roundtrip() -> TestResult {
        let config = Config::default();
        let text = toml::to_string(&config)?;
        assert!(text.contains("republish_interval = \"10h\""));
        assert_eq!(toml::from_str::<Config>(&text)?, config);
        Ok(())
    }
}
