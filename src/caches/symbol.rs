//! Symbol metadata: canonical coin <-> display symbol
//!
//! Spot pairs arrive in fills as index names (`@107`); displays are
//! `BASE/QUOTE` resolved through the spot metadata's token table. Perp
//! names are their own display after stripping a builder-dex prefix.
//! The maps are whole-snapshot swapped so readers never see a half
//! refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

const REFRESH_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct SymbolCache {
    spot: ArcSwap<HashMap<String, String>>,
    perp: ArcSwap<HashMap<String, String>>,
}

impl SymbolCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_spot_symbol(&self, coin: &str) -> Option<String> {
        self.spot.load().get(coin).cloned()
    }

    pub fn get_perp_symbol(&self, coin: &str) -> Option<String> {
        self.perp.load().get(normalize_perp_coin(coin)).cloned()
    }

    pub fn replace_spot(&self, map: HashMap<String, String>) {
        self.spot.store(Arc::new(map));
    }

    pub fn replace_perp(&self, map: HashMap<String, String>) {
        self.perp.store(Arc::new(map));
    }

    pub fn spot_len(&self) -> usize {
        self.spot.load().len()
    }

    pub fn perp_len(&self) -> usize {
        self.perp.load().len()
    }
}

/// Builder-deployed perps carry a `dex:` prefix; the exchange metadata
/// lists them bare.
pub fn normalize_perp_coin(coin: &str) -> &str {
    match coin.split_once(':') {
        Some((_, bare)) => bare,
        None => coin,
    }
}

// ============================================================================
// Metadata loader (full refresh every 2h)
// ============================================================================

#[derive(Debug, Deserialize)]
struct SpotMeta {
    tokens: Vec<SpotToken>,
    universe: Vec<SpotPair>,
}

#[derive(Debug, Deserialize)]
struct SpotToken {
    name: String,
    index: u64,
}

#[derive(Debug, Deserialize)]
struct SpotPair {
    name: String,
    tokens: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct PerpMeta {
    universe: Vec<PerpAsset>,
}

#[derive(Debug, Deserialize)]
struct PerpAsset {
    name: String,
}

pub struct SymbolLoader {
    http: reqwest::Client,
    info_url: String,
    cache: Arc<SymbolCache>,
}

impl SymbolLoader {
    pub fn new(info_url: &str, cache: Arc<SymbolCache>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            info_url: info_url.to_string(),
            cache,
        })
    }

    /// Fetch both metadata sets and swap in fresh maps.
    pub async fn load(&self) -> Result<()> {
        let spot: SpotMeta = self
            .http
            .post(&self.info_url)
            .json(&json!({ "type": "spotMeta" }))
            .send()
            .await
            .context("spotMeta request failed")?
            .error_for_status()
            .context("spotMeta request rejected")?
            .json()
            .await
            .context("Failed to parse spotMeta response")?;

        let perp: PerpMeta = self
            .http
            .post(&self.info_url)
            .json(&json!({ "type": "meta" }))
            .send()
            .await
            .context("meta request failed")?
            .error_for_status()
            .context("meta request rejected")?
            .json()
            .await
            .context("Failed to parse meta response")?;

        let spot_map = build_spot_map(&spot);
        let perp_map: HashMap<String, String> = perp
            .universe
            .into_iter()
            .map(|asset| (asset.name.clone(), asset.name))
            .collect();

        info!(
            spot = spot_map.len(),
            perp = perp_map.len(),
            "Symbol metadata refreshed"
        );
        self.cache.replace_spot(spot_map);
        self.cache.replace_perp(perp_map);
        Ok(())
    }

    /// Refresh forever; failures keep the previous snapshot.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // initial load happened at startup
        loop {
            ticker.tick().await;
            if let Err(e) = self.load().await {
                warn!(error = %e, "Symbol metadata refresh failed, keeping previous snapshot");
            }
        }
    }
}

fn build_spot_map(meta: &SpotMeta) -> HashMap<String, String> {
    let token_names: HashMap<u64, &str> = meta
        .tokens
        .iter()
        .map(|t| (t.index, t.name.as_str()))
        .collect();

    let mut map = HashMap::new();
    for pair in &meta.universe {
        let (Some(base), Some(quote)) = (
            pair.tokens.first().and_then(|i| token_names.get(i)),
            pair.tokens.get(1).and_then(|i| token_names.get(i)),
        ) else {
            warn!(pair = %pair.name, "Spot pair references unknown tokens");
            continue;
        };
        let display = format!("{base}/{quote}");
        // index name ("@107") and canonical pair name both resolve
        map.insert(pair.name.clone(), display.clone());
        map.insert(display.clone(), display);
    }
    map
}
