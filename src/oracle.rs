//! Price Oracle: provider fan-out, per-call timeout, and consensus
//! evaluation.

use crate::clock::Clock;
use crate::config::OracleConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, Duration};
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct PricePoint {
    pub id: String,
    pub ok: bool,
    pub price: f64,
    pub ts: i64,
    pub source: String,
    pub error: Option<String>,
}

/// A price source: `{id, supports, fetch(pair, {timeoutMs})}`.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    fn id(&self) -> String;
    fn supports(&self, pair: &str) -> bool;
    async fn fetch(&self, pair: &str) -> PricePoint;
}

/// Synthetic provider returning a fixed price for every pair in its map.
/// Requested via provider id `"static"` with `staticCount` instances.
pub struct StaticProvider {
    id: String,
    prices: HashMap<String, f64>,
}

impl StaticProvider {
    pub fn new(id: impl Into<String>, prices: HashMap<String, f64>) -> Self {
        Self { id: id.into(), prices }
    }
}

#[async_trait]
impl PriceProvider for StaticProvider {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn supports(&self, pair: &str) -> bool {
        self.prices.contains_key(pair)
    }

    async fn fetch(&self, pair: &str) -> PricePoint {
        match self.prices.get(pair) {
            Some(&price) => PricePoint {
                id: self.id.clone(),
                ok: true,
                price,
                ts: 0,
                source: self.id.clone(),
                error: None,
            },
            None => PricePoint {
                id: self.id.clone(),
                ok: false,
                price: 0.0,
                ts: 0,
                source: self.id.clone(),
                error: Some("pair not configured".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusResult {
    pub ok: bool,
    pub median: Option<f64>,
    pub agreeing: Vec<String>,
    pub outliers: Vec<String>,
    pub spread_bps: Option<f64>,
    pub error: Option<String>,
}

/// Median-of-ok-prices with deviation and quorum thresholds.
pub fn evaluate_consensus(
    points: &[PricePoint],
    max_deviation_bps: f64,
    min_agree: usize,
) -> ConsensusResult {
    let mut prices: Vec<f64> = points.iter().map(|p| p.price).collect();
    if prices.is_empty() {
        return ConsensusResult {
            ok: false,
            median: None,
            agreeing: vec![],
            outliers: vec![],
            spread_bps: None,
            error: Some("no valid points".to_string()),
        };
    }

    prices.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = median_of(&prices);

    let mut agreeing = Vec::new();
    let mut outliers = Vec::new();
    for p in points {
        let deviation_bps = if median > 0.0 {
            Some((p.price - median).abs() / median * 10_000.0)
        } else {
            None
        };
        match deviation_bps {
            Some(bps) if bps <= max_deviation_bps => agreeing.push(p),
            _ => outliers.push(p),
        }
    }

    let spread_bps = if !agreeing.is_empty() {
        let agreeing_prices: Vec<f64> = agreeing.iter().map(|p| p.price).collect();
        let min = agreeing_prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = agreeing_prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if min > 0.0 {
            Some((max - min).abs() / min * 10_000.0)
        } else {
            None
        }
    } else {
        None
    };

    let ok = agreeing.len() >= min_agree;

    ConsensusResult {
        ok,
        median: Some(median),
        agreeing: agreeing.into_iter().map(|p| p.id.clone()).collect(),
        outliers: outliers.into_iter().map(|p| p.id.clone()).collect(),
        spread_bps,
        error: if ok { None } else { Some("insufficient consensus".to_string()) },
    }
}

fn median_of(sorted_prices: &[f64]) -> f64 {
    let n = sorted_prices.len();
    if n % 2 == 1 {
        sorted_prices[n / 2]
    } else {
        (sorted_prices[n / 2 - 1] + sorted_prices[n / 2]) / 2.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairResult {
    pub ok: bool,
    pub error: Option<String>,
    pub median: Option<f64>,
    pub agreeing: Vec<String>,
    pub outliers: Vec<String>,
    pub spread_bps: Option<f64>,
    pub ok_sources: usize,
    pub sources: Vec<PricePoint>,
    pub max_deviation_bps: f64,
    pub min_ok: usize,
    pub min_agree: usize,
    pub required_providers: usize,
    pub providers_configured: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    pub ok: bool,
    pub providers: Vec<String>,
    pub pairs: HashMap<String, PairResult>,
}

impl Snapshot {
    /// The snapshot is already an owned, immutable value, so cloning it is
    /// a plain `Clone`.
    pub fn clone_snapshot(&self) -> Snapshot {
        self.clone()
    }

    /// Read-only summary for host observability, not part of the wire
    /// protocol.
    pub fn stats(&self) -> OracleStats {
        OracleStats {
            providers_configured: self.providers.len(),
            pairs_ok: self.pairs.values().filter(|p| p.ok).count(),
            pairs_total: self.pairs.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleStats {
    pub providers_configured: usize,
    pub pairs_ok: usize,
    pub pairs_total: usize,
}

pub struct PriceOracle {
    clock: Arc<dyn Clock>,
    config: OracleConfig,
    providers: Vec<Arc<dyn PriceProvider>>,
    latest: Mutex<Option<Snapshot>>,
}

impl PriceOracle {
    pub fn new(clock: Arc<dyn Clock>, config: OracleConfig, providers: Vec<Arc<dyn PriceProvider>>) -> Arc<Self> {
        Arc::new(Self { clock, config, providers, latest: Mutex::new(None) })
    }

    /// Most recent snapshot taken by `tick()` or `run_ticker`, if any.
    pub async fn latest_snapshot(&self) -> Option<Snapshot> {
        self.latest.lock().await.as_ref().map(Snapshot::clone_snapshot)
    }

    /// Poll on `poll_ms` until stopped, storing each round as `latest_snapshot`.
    pub async fn run_ticker(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.config.poll_ms.max(1)));
        loop {
            ticker.tick().await;
            let snapshot = self.tick().await;
            debug!(ok = snapshot.ok, "price oracle tick completed");
            *self.latest.lock().await = Some(snapshot);
        }
    }

    /// One polling round across all configured pairs.
    pub async fn tick(&self) -> Snapshot {
        let ts = self.clock.now_ms() as i64;
        let provider_ids: Vec<String> = self.providers.iter().map(|p| p.id()).collect();
        let misconfigured = self.providers.len() < self.config.required_providers;

        let mut pairs = HashMap::new();
        let mut all_ok = true;

        for pair in &self.config.pairs {
            let pair_result = if misconfigured {
                all_ok = false;
                PairResult {
                    ok: false,
                    error: Some("misconfigured: fewer providers configured than required".to_string()),
                    median: None,
                    agreeing: vec![],
                    outliers: vec![],
                    spread_bps: None,
                    ok_sources: 0,
                    sources: vec![],
                    max_deviation_bps: self.config.max_deviation_bps,
                    min_ok: self.config.min_ok,
                    min_agree: self.config.min_agree,
                    required_providers: self.config.required_providers,
                    providers_configured: self.providers.len(),
                }
            } else {
                let supporting: Vec<&Arc<dyn PriceProvider>> =
                    self.providers.iter().filter(|p| p.supports(pair)).collect();

                let mut results = Vec::with_capacity(supporting.len());
                for provider in supporting {
                    let point = match timeout(
                        Duration::from_millis(self.config.timeout_ms),
                        provider.fetch(pair),
                    )
                    .await
                    {
                        Ok(point) => point,
                        Err(_) => PricePoint {
                            id: provider.id(),
                            ok: false,
                            price: 0.0,
                            ts,
                            source: provider.id(),
                            error: Some("timeout".to_string()),
                        },
                    };
                    results.push(point);
                }

                let ok_points: Vec<PricePoint> =
                    results.iter().filter(|p| p.ok && p.price > 0.0).cloned().collect();
                let ok_sources = ok_points.len();

                let consensus =
                    evaluate_consensus(&ok_points, self.config.max_deviation_bps, self.config.min_agree);
                let pair_ok = ok_sources >= self.config.min_ok && consensus.ok;
                if !pair_ok {
                    all_ok = false;
                }

                PairResult {
                    ok: pair_ok,
                    error: if pair_ok { None } else { consensus.error.clone() },
                    median: consensus.median,
                    agreeing: consensus.agreeing,
                    outliers: consensus.outliers,
                    spread_bps: consensus.spread_bps,
                    ok_sources,
                    sources: results,
                    max_deviation_bps: self.config.max_deviation_bps,
                    min_ok: self.config.min_ok,
                    min_agree: self.config.min_agree,
                    required_providers: self.config.required_providers,
                    providers_configured: self.providers.len(),
                }
            };
            pairs.insert(pair.clone(), pair_result);
        }

        Snapshot { kind: "price_snapshot".to_string(), ts, ok: all_ok, providers: provider_ids, pairs }
    }
}

/// Build `staticCount` synthetic providers, each returning the fixed prices
/// in `static_prices`, when provider id `"static"` is requested.
pub fn build_static_providers(count: usize, prices: &HashMap<String, f64>) -> Vec<Arc<dyn PriceProvider>> {
    (0..count)
        .map(|i| Arc::new(StaticProvider::new(format!("static-{i}"), prices.clone())) as Arc<dyn PriceProvider>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn point(id: &str, price: f64) -> PricePoint {
        PricePoint { id: id.to_string(), ok: true, price, ts: 0, source: id.to_string(), error: None }
    }

    #[test]
    fn empty_points_yield_not_ok_none_median() {
        let result = evaluate_consensus(&[], 50.0, 1);
        assert!(!result.ok);
        assert_eq!(result.median, None);
    }

    #[test]
    fn even_length_median_is_mean_of_middle_two() {
        let points = vec![point("a", 100.0), point("b", 200.0)];
        let result = evaluate_consensus(&points, 10_000.0, 2);
        assert_eq!(result.median, Some(150.0));
    }

    #[test]
    fn every_point_is_agreeing_or_outlier_exactly_once() {
        let points = vec![point("a", 100.0), point("b", 100.0), point("c", 120.0)];
        let result = evaluate_consensus(&points, 50.0, 3);
        assert_eq!(result.agreeing.len() + result.outliers.len(), points.len());
        assert!(!result.ok);
        assert!(result.error.as_deref().unwrap().contains("insufficient consensus"));
    }

    #[tokio::test]
    async fn oracle_healthy_scenario() {
        let clock = Arc::new(ManualClock::new(0));
        let mut prices = HashMap::new();
        prices.insert("BTC_USDT".to_string(), 200_000.0);
        prices.insert("USDT_USD".to_string(), 1.0);
        let providers = build_static_providers(5, &prices);
        let config = OracleConfig {
            pairs: vec!["BTC_USDT".to_string(), "USDT_USD".to_string()],
            providers: vec!["static".to_string()],
            required_providers: 5,
            min_ok: 2,
            min_agree: 2,
            max_deviation_bps: 10.0,
            timeout_ms: 5_000,
            static_prices: prices,
            static_count: 5,
            ..Default::default()
        };
        let oracle = PriceOracle::new(clock, config, providers);
        let snapshot = oracle.tick().await;
        assert!(snapshot.ok);
        assert_eq!(snapshot.providers.len(), 5);
        assert_eq!(snapshot.pairs["BTC_USDT"].median, Some(200_000.0));
        assert_eq!(snapshot.pairs["USDT_USD"].median, Some(1.0));
    }

    #[tokio::test]
    async fn oracle_misconfigured_scenario() {
        let clock = Arc::new(ManualClock::new(0));
        let mut prices = HashMap::new();
        prices.insert("BTC_USDT".to_string(), 200_000.0);
        let providers = build_static_providers(2, &prices);
        let config = OracleConfig {
            pairs: vec!["BTC_USDT".to_string()],
            providers: vec!["static".to_string()],
            required_providers: 5,
            min_ok: 1,
            min_agree: 1,
            max_deviation_bps: 50.0,
            timeout_ms: 5_000,
            static_prices: prices,
            static_count: 2,
            ..Default::default()
        };
        let oracle = PriceOracle::new(clock, config, providers);
        let snapshot = oracle.tick().await;
        assert!(!snapshot.pairs["BTC_USDT"].ok);
        assert!(snapshot.pairs["BTC_USDT"].error.as_deref().unwrap().contains("misconfigured"));
    }

    #[tokio::test]
    async fn oracle_no_consensus_scenario() {
        let clock = Arc::new(ManualClock::new(0));
        let providers: Vec<Arc<dyn PriceProvider>> = vec![
            Arc::new(StaticProvider::new("p1", HashMap::from([("BTC_USDT".to_string(), 100.0)]))),
            Arc::new(StaticProvider::new("p2", HashMap::from([("BTC_USDT".to_string(), 100.0)]))),
            Arc::new(StaticProvider::new("p3", HashMap::from([("BTC_USDT".to_string(), 120.0)]))),
        ];
        let config = OracleConfig {
            pairs: vec!["BTC_USDT".to_string()],
            providers: vec!["p1".to_string(), "p2".to_string(), "p3".to_string()],
            required_providers: 3,
            min_ok: 3,
            min_agree: 3,
            max_deviation_bps: 50.0,
            timeout_ms: 5_000,
            static_prices: HashMap::new(),
            static_count: 0,
            ..Default::default()
        };
        let oracle = PriceOracle::new(clock, config, providers);
        let snapshot = oracle.tick().await;
        assert!(!snapshot.pairs["BTC_USDT"].ok);
        assert!(snapshot.pairs["BTC_USDT"].error.as_deref().unwrap().contains("insufficient consensus"));
    }
}
