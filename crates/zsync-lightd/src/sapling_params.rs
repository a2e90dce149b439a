//! Sapling proving parameters: download when missing, verify by SHA-256

use crate::engine::ScanningEngine;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Spend parameters file name
pub const SPEND_PARAMS_FILENAME: &str = "sapling-spend.params";
/// Output parameters file name
pub const OUTPUT_PARAMS_FILENAME: &str = "sapling-output.params";
/// Default download location of the parameter files
pub const DEFAULT_PARAMS_SOURCE: &str = "https://download.z.cash/downloads/";

/// SHA-256 of `sapling-spend.params`
pub const SPEND_PARAMS_SHA256: &str =
    "8e48ffd23abb3a5fd9c5589204f32d9c31285a04b78096ba40a79b75677efc13";
/// SHA-256 of `sapling-output.params`
pub const OUTPUT_PARAMS_SHA256: &str =
    "2f0ebbcbb9bb0bcffe95a397e7eba89c29eb4dde6191c339db88570e3f3fb0e4";

/// Where parameters live and where they are fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaplingParamsConfig {
    /// Local spend parameters path
    pub spend_path: PathBuf,
    /// Local output parameters path
    pub output_path: PathBuf,
    /// Spend parameters source URL
    pub spend_source_url: String,
    /// Output parameters source URL
    pub output_source_url: String,
    /// Expected SHA-256 (hex) of the spend file, `None` to skip verification
    pub spend_sha256: Option<String>,
    /// Expected SHA-256 (hex) of the output file, `None` to skip verification
    pub output_sha256: Option<String>,
}

impl SaplingParamsConfig {
    /// Parameters stored under `dir`, fetched from the default source
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            spend_path: dir.join(SPEND_PARAMS_FILENAME),
            output_path: dir.join(OUTPUT_PARAMS_FILENAME),
            spend_source_url: format!("{}{}", DEFAULT_PARAMS_SOURCE, SPEND_PARAMS_FILENAME),
            output_source_url: format!("{}{}", DEFAULT_PARAMS_SOURCE, OUTPUT_PARAMS_FILENAME),
            spend_sha256: Some(SPEND_PARAMS_SHA256.to_string()),
            output_sha256: Some(OUTPUT_PARAMS_SHA256.to_string()),
        }
    }
}

/// Downloads a file, returning the SHA-256 (hex) of what was written
#[async_trait]
pub trait ParamsFetcher: Send + Sync {
    /// Download `url` into `dest`
    async fn download(&self, url: &str, dest: &Path) -> Result<String>;
}

/// HTTP fetcher streaming the body to disk
pub struct HttpParamsFetcher {
    client: reqwest::Client,
}

impl HttpParamsFetcher {
    /// Create a fetcher with a generous timeout for ~50 MB downloads
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ParamsFetcher for HttpParamsFetcher {
    async fn download(&self, url: &str, dest: &Path) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Network(format!("Failed to download {}: {}", url, e)))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Network(format!("Download of {} interrupted: {}", url, e)))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Ensures parameters exist before the wallet needs to spend
pub struct SaplingParametersHandler {
    config: SaplingParamsConfig,
    engine: Arc<dyn ScanningEngine>,
    fetcher: Arc<dyn ParamsFetcher>,
}

impl SaplingParametersHandler {
    /// Create a handler
    pub fn new(config: SaplingParamsConfig, engine: Arc<dyn ScanningEngine>, fetcher: Arc<dyn ParamsFetcher>) -> Self {
        Self { config, engine, fetcher }
    }

    /// Download missing parameter files when the wallet holds shielded funds
    pub async fn handle_if_needed(&self) -> Result<()> {
        match self.engine.balance().await {
            Ok(balance) if balance.total_shielded == 0 && balance.verified_shielded == 0 => {
                debug!("No shielded balance; sapling parameters not needed yet");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                error!("Couldn't fetch shielded balance, won't download sapling parameters: {}", e);
                return Ok(());
            }
        }

        let (spend, output) = tokio::join!(
            self.ensure(
                &self.config.spend_path,
                &self.config.spend_source_url,
                self.config.spend_sha256.as_deref()
            ),
            self.ensure(
                &self.config.output_path,
                &self.config.output_source_url,
                self.config.output_sha256.as_deref()
            ),
        );
        spend?;
        output?;
        Ok(())
    }

    async fn ensure(&self, path: &Path, url: &str, expected: Option<&str>) -> Result<()> {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Downloading {} to {}", url, path.display());
        let partial = path.with_extension("part");
        let digest = match self.fetcher.download(url, &partial).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected {
            if !digest.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(Error::SaplingParams(format!(
                    "{} hash mismatch: expected {}, found {}",
                    path.display(),
                    expected,
                    digest
                )));
            }
        }

        tokio::fs::rename(&partial, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WalletBalance;
    use crate::testing::MockEngine;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use zsync_params::Network;

    #[derive(Default)]
    struct FixedFetcher {
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ParamsFetcher for FixedFetcher {
        async fn download(&self, url: &str, dest: &Path) -> Result<String> {
            self.requested.lock().push(url.to_string());
            let body = b"params";
            tokio::fs::write(dest, body).await?;
            Ok(hex::encode(Sha256::digest(body)))
        }
    }

    fn config(dir: &TempDir, sha: Option<String>) -> SaplingParamsConfig {
        SaplingParamsConfig {
            spend_sha256: sha.clone(),
            output_sha256: sha,
            ..SaplingParamsConfig::in_dir(dir.path().join("params"))
        }
    }

    #[tokio::test]
    async fn test_skips_without_balance() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FixedFetcher::default());
        let engine = Arc::new(MockEngine::new(Network::regtest()));
        let handler = SaplingParametersHandler::new(config(&dir, None), engine, fetcher.clone());

        handler.handle_if_needed().await.unwrap();
        assert!(fetcher.requested.lock().is_empty());
    }

    #[tokio::test]
    async fn test_downloads_missing_files_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FixedFetcher::default());
        let engine = Arc::new(MockEngine::new(Network::regtest()));
        engine.set_balance(WalletBalance {
            total_shielded: 1_000,
            verified_shielded: 0,
        });
        let sha = hex::encode(Sha256::digest(b"params"));
        let cfg = config(&dir, Some(sha));
        let handler = SaplingParametersHandler::new(cfg.clone(), engine, fetcher.clone());

        handler.handle_if_needed().await.unwrap();
        handler.handle_if_needed().await.unwrap();

        assert_eq!(fetcher.requested.lock().len(), 2);
        assert!(cfg.spend_path.exists());
        assert!(cfg.output_path.exists());
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FixedFetcher::default());
        let engine = Arc::new(MockEngine::new(Network::regtest()));
        engine.set_balance(WalletBalance {
            total_shielded: 1,
            verified_shielded: 1,
        });
        let cfg = config(&dir, Some(SPEND_PARAMS_SHA256.to_string()));
        let handler = SaplingParametersHandler::new(cfg.clone(), engine, fetcher);

        let err = handler.handle_if_needed().await.unwrap_err();
        assert!(matches!(err, Error::SaplingParams(_)));
        assert!(!cfg.spend_path.exists());
    }
}
