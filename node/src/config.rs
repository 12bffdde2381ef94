use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use config as config_rs;
use operator::BackendMap;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct NodeConfiguration {
    pub data_dir: PathBuf,
    pub keypair_path: PathBuf,
    pub ledger: LedgerSection,
    /// Marketplace vault address receiving the marketplace fee share.
    pub marketplace_address: String,
    pub poll_interval_secs: u64,
    /// Requests below this block height are ignored.
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Service transaction id -> inference backend.
    #[serde(default)]
    pub services: BackendMap,
    #[serde(default)]
    pub settlement: Option<SettlementSection>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LedgerSection {
    pub gateway_url: String,
    pub data_url: String,
    pub bundler_url: String,
    /// Bundler node label used for asset registration.
    pub registrar_node: String,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            gateway_url: "https://gateway.inferlay.net/graphql".to_string(),
            data_url: "https://gateway.inferlay.net/raw".to_string(),
            bundler_url: "https://bundler.inferlay.net".to_string(),
            registrar_node: "inferlay".to_string(),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SettlementSection {
    pub url: String,
}

impl NodeConfiguration {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let format = if ext == "toml" {
            config_rs::FileFormat::Toml
        } else {
            config_rs::FileFormat::Json
        };

        let cfg = config_rs::Config::builder()
            .add_source(config_rs::File::from(path).format(format))
            .build()
            .with_context(|| format!("failed to load config file: {}", path.display()))?;

        cfg.try_deserialize::<NodeConfiguration>()
            .with_context(|| format!("failed to deserialize config: {}", path.display()))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create config parent directory: {}",
                    parent.display()
                )
            })?;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let out = if ext == "toml" {
            toml::to_string_pretty(self).context("failed to serialize config as toml")?
        } else {
            serde_json::to_string_pretty(self).context("failed to serialize config as json")?
        };

        std::fs::write(path, out)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn merge_with_env(mut self) -> Self {
        if let Ok(v) = std::env::var("INFERLAY_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("INFERLAY_GATEWAY_URL") {
            self.ledger.gateway_url = v;
        }
        if let Ok(v) = std::env::var("INFERLAY_DATA_URL") {
            self.ledger.data_url = v;
        }
        if let Ok(v) = std::env::var("INFERLAY_BUNDLER_URL") {
            self.ledger.bundler_url = v;
        }
        if let Ok(v) = std::env::var("INFERLAY_MARKETPLACE_ADDRESS") {
            self.marketplace_address = v;
        }
        if let Ok(v) = std::env::var("INFERLAY_POLL_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.poll_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("INFERLAY_START_BLOCK") {
            if let Ok(n) = v.parse::<u64>() {
                self.start_block = Some(n);
            }
        }
        if let Ok(v) = std::env::var("INFERLAY_SETTLEMENT_URL") {
            if !v.trim().is_empty() {
                self.settlement = Some(SettlementSection { url: v });
            }
        }

        self.keypair_path = crate::keypair::default_keypair_path(&self.data_dir);
        self
    }

    pub fn merge_with_cli(mut self, cli_args: &crate::cli::Cli) -> Self {
        match &cli_args.command {
            crate::cli::Commands::Init(args) => {
                if let Some(v) = &args.data_dir {
                    self.data_dir = v.clone();
                }
                self.keypair_path = crate::keypair::default_keypair_path(&self.data_dir);
            }
            crate::cli::Commands::Start(args) => {
                if let Some(v) = &args.data_dir {
                    self.data_dir = v.clone();
                }
                if let Some(v) = &args.gateway_url {
                    self.ledger.gateway_url = v.clone();
                }
                if let Some(v) = &args.data_url {
                    self.ledger.data_url = v.clone();
                }
                if let Some(v) = &args.bundler_url {
                    self.ledger.bundler_url = v.clone();
                }
                if let Some(v) = args.poll_interval {
                    self.poll_interval_secs = v;
                }
                if let Some(v) = args.start_block {
                    self.start_block = Some(v);
                }
                if args.disable_settlement {
                    self.settlement = None;
                }
                self.keypair_path = crate::keypair::default_keypair_path(&self.data_dir);
            }
            _ => {}
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!(
                "data_dir: failed to create or access directory: {}",
                self.data_dir.display()
            )
        })?;

        let test_path = self.data_dir.join(".write_test");
        std::fs::write(&test_path, b"")
            .with_context(|| format!("data_dir: not writable: {}", self.data_dir.display()))?;
        let _ = std::fs::remove_file(&test_path);

        validate_url("ledger.gateway_url", &self.ledger.gateway_url)?;
        validate_url("ledger.data_url", &self.ledger.data_url)?;
        validate_url("ledger.bundler_url", &self.ledger.bundler_url)?;
        if let Some(settlement) = &self.settlement {
            validate_url("settlement.url", &settlement.url)?;
        }

        if self.marketplace_address.trim().is_empty() {
            return Err(anyhow!("marketplace_address: must not be empty"));
        }

        if self.poll_interval_secs == 0 || self.poll_interval_secs > 3600 {
            return Err(anyhow!(
                "poll_interval_secs: must be between 1 and 3600"
            ));
        }

        if self.services.is_empty() {
            return Err(anyhow!("services: at least one backend must be configured"));
        }
        for (service_id, entry) in &self.services {
            validate_url(&format!("services.{service_id}.url"), &entry.url)?;
        }

        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("inferlay").join("config.toml")
    }

    pub fn default_data_dir() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("inferlay")
    }
}

impl Default for NodeConfiguration {
    fn default() -> Self {
        let data_dir = Self::default_data_dir();
        Self {
            keypair_path: crate::keypair::default_keypair_path(&data_dir),
            data_dir,
            ledger: LedgerSection::default(),
            marketplace_address: String::new(),
            poll_interval_secs: 30,
            start_block: None,
            services: BackendMap::new(),
            settlement: None,
        }
    }
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(anyhow!("{field}: must be an http(s) URL, got '{value}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use operator::{BackendEntry, PayloadFormat};

    fn valid_config(data_dir: PathBuf) -> NodeConfiguration {
        let mut cfg = NodeConfiguration {
            data_dir,
            marketplace_address: "vault-address".to_string(),
            ..NodeConfiguration::default()
        };
        cfg.services.insert(
            "svc-creation-tx".to_string(),
            BackendEntry {
                url: "http://127.0.0.1:7860".to_string(),
                payload_format: PayloadFormat::FormBased,
                settings: None,
            },
        );
        cfg
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let cfg = valid_config(dir.path().to_path_buf());
        cfg.save_to_file(&path).unwrap();
        let loaded = NodeConfiguration::load_from_file(&path).unwrap();

        assert_eq!(loaded.marketplace_address, "vault-address");
        assert_eq!(loaded.services.len(), 1);
        assert_eq!(
            loaded.services["svc-creation-tx"].payload_format,
            PayloadFormat::FormBased
        );
    }

    #[test]
    fn validation_rejects_empty_services_and_bad_urls() {
        let dir = tempfile::tempdir().unwrap();

        let mut cfg = valid_config(dir.path().to_path_buf());
        cfg.services.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config(dir.path().to_path_buf());
        cfg.ledger.gateway_url = "not-a-url".to_string();
        assert!(cfg.validate().is_err());

        assert!(valid_config(dir.path().to_path_buf()).validate().is_ok());
    }
}
