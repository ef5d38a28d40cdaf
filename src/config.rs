use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

use crate::painting::{Asset, CryptoContext};
use crate::sizer::FeeSchedule;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub painting: PaintingCfg,
    #[serde(default)]
    pub search: Search,
    pub crypto: Crypto,
    #[serde(default)]
    pub fees: Fees,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaintingCfg {
    pub rows: u32,
    pub columns: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Search {
    #[serde(default = "default_version")]
    pub protocol_version: u32,
    #[serde(default = "default_step")]
    pub step_millis: u64,             // simulator pacing between replies
}

#[derive(Debug, Deserialize, Clone)]
pub struct Crypto {
    pub asset: Asset,
    pub xpub: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Fees {
    #[serde(default = "default_base")]
    pub base_vbytes: u64,
    #[serde(default = "default_input")]
    pub input_vbytes: u64,            // P2WPKH spend
    #[serde(default = "default_output")]
    pub output_vbytes: u64,           // P2WPKH output
    #[serde(default = "default_sink_fixed")]
    pub sink_fixed_vbytes: u64,
    #[serde(default = "default_sink_shared")]
    pub sink_shared_vbytes: u64,
    #[serde(default = "default_fee_rate")]
    pub fee_per_vbyte: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_version() -> u32 { 1 }
fn default_step() -> u64 { 25 }
fn default_base() -> u64 { 10 }
fn default_input() -> u64 { 68 }
fn default_output() -> u64 { 31 }
fn default_sink_fixed() -> u64 { 68 }
fn default_sink_shared() -> u64 { 10 }
fn default_fee_rate() -> u64 { 1 }
fn default_bind() -> String { "127.0.0.1:9100".into() }

impl Default for Search {
    fn default() -> Self {
        Self { protocol_version: default_version(), step_millis: default_step() }
    }
}

impl Default for Fees {
    fn default() -> Self {
        Self {
            base_vbytes: default_base(),
            input_vbytes: default_input(),
            output_vbytes: default_output(),
            sink_fixed_vbytes: default_sink_fixed(),
            sink_shared_vbytes: default_sink_shared(),
            fee_per_vbyte: default_fee_rate(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self { enabled: false, bind: default_bind() }
    }
}

impl Fees {
    pub fn schedule(&self) -> FeeSchedule {
        FeeSchedule {
            base_vbytes: self.base_vbytes,
            input_vbytes: self.input_vbytes,
            output_vbytes: self.output_vbytes,
            sink_fixed_vbytes: self.sink_fixed_vbytes,
            sink_shared_vbytes: self.sink_shared_vbytes,
        }
    }
}

impl Config {
    pub fn crypto_context(&self) -> CryptoContext {
        CryptoContext { asset: self.crypto.asset, xpub: self.crypto.xpub.clone() }
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text)
        .with_context(|| "📝  invalid TOML in config file".to_string())?;
    if cfg.painting.rows == 0 || cfg.painting.columns == 0 {
        anyhow::bail!("painting dimensions must be non-zero (got {}x{})", cfg.painting.rows, cfg.painting.columns);
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load_from_str(r#"
[painting]
rows = 4
columns = 6

[crypto]
asset = "TBTC"
xpub = "tpubD6NzVbkrYhZ4"
"#).unwrap();
        assert_eq!(cfg.painting.columns, 6);
        assert_eq!(cfg.search.protocol_version, 1);
        assert_eq!(cfg.fees.schedule(), FeeSchedule::default());
        assert_eq!(cfg.crypto_context().asset, Asset::Tbtc);
        assert!(!cfg.metrics.enabled);
    }

    #[test]
    fn zero_sized_painting_is_rejected() {
        let err = load_from_str(r#"
[painting]
rows = 0
columns = 6

[crypto]
asset = "BTC"
xpub = "xpub"
"#).unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }
}
