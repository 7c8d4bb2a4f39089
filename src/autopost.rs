//! Autopost scheduler: supervised periodic jobs with admission-time
//! validity horizons, inventory pruning, and terminal-stop conditions
//!
//! The per-job serial queue is a single-consumer work channel: the tick
//! timer enqueues a tick, a worker task drains it, so a slow run cannot
//! overlap the next tick.

use crate::clock::Clock;
use crate::error::AutopostError;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::info;

pub const MIN_INTERVAL_SEC: u64 = 1;
pub const MAX_INTERVAL_SEC: u64 = 86_400;
pub const MIN_TTL_SEC: u64 = 10;
pub const MAX_TTL_SEC: u64 = 604_800;
pub const MIN_HORIZON_SEC: i64 = 10;
pub const MAX_HORIZON_SEC: i64 = 604_800;
pub const MAX_NAME_COLLISION_ATTEMPTS: u32 = 20;

const INSUFFICIENT_FUNDS_SIGNATURES: &[&str] = &[
    "insufficient ln",
    "insufficient lightning",
    "insufficient usdt",
    "insufficient sol",
    "insufficient funds",
    "no active lightning channels",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    OfferPost,
    RfqPost,
}

impl Tool {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "OFFER_POST" => Some(Tool::OfferPost),
            "RFQ_POST" => Some(Tool::RfqPost),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Tool::OfferPost => "OFFER_POST",
            Tool::RfqPost => "RFQ_POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub ok: bool,
    pub envelope_signer: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub id: String,
    pub state: String,
    pub maker: String,
    pub updated_at: i64,
    pub btc_sats: i64,
    pub usdt_amount: String,
}

/// Runs a tool invocation against the host's trade engine.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run_tool(&self, tool: Tool, args: Value) -> Result<RunResult, String>;
    async fn get_trade(&self, trade_id: &str) -> Option<Trade>;
    async fn list_trades(&self, limit: usize) -> Vec<Trade>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Expired,
    Filled,
    FilledWithState(String),
    InsufficientFunds,
    Manual,
}

impl StopReason {
    pub fn as_str(&self) -> String {
        match self {
            StopReason::Expired => "expired".to_string(),
            StopReason::Filled => "filled".to_string(),
            StopReason::FilledWithState(s) => format!("filled:{s}"),
            StopReason::InsufficientFunds => "insufficient_funds".to_string(),
            StopReason::Manual => "manual".to_string(),
        }
    }
}

pub struct StartRequest {
    pub name: String,
    pub tool: String,
    pub interval_sec: u64,
    pub ttl_sec: u64,
    pub valid_until_unix: Option<i64>,
    pub args: Value,
}

struct Job {
    name: String,
    tool: Tool,
    interval_sec: u64,
    valid_until_unix: i64,
    args: Value,
    trade_id: Option<String>,
    peer_signer_hex: Option<String>,
    runs: u64,
    started_at: i64,
    last_run_at: Option<i64>,
    last_ok: Option<bool>,
    last_error: Option<String>,
    handle: Option<JoinHandle<()>>,
    tick_tx: mpsc::Sender<()>,
}

/// Sanitize a job name for use in a collision-safe candidate: trims,
/// replaces disallowed characters, caps length at 64, and is idempotent
/// under repeated application.
pub fn sanitize_job_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let truncated: String = cleaned.chars().take(64).collect();
    if truncated.is_empty() {
        "job".to_string()
    } else {
        truncated
    }
}

pub struct AutopostManager {
    clock: Arc<dyn Clock>,
    tool_runner: Arc<dyn ToolRunner>,
    jobs: Mutex<HashMap<String, Job>>,
}

impl AutopostManager {
    pub fn new(clock: Arc<dyn Clock>, tool_runner: Arc<dyn ToolRunner>) -> Arc<Self> {
        Arc::new(Self { clock, tool_runner, jobs: Mutex::new(HashMap::new()) })
    }

    fn now_i64(&self) -> i64 {
        self.clock.now_ms() as i64 / 1000
    }

    /// Validate, resolve name collisions, run immediately, then arm the
    /// periodic timer.
    pub async fn start(self: &Arc<Self>, req: StartRequest) -> Result<String, AutopostError> {
        let tool = Tool::parse(&req.tool).ok_or_else(|| AutopostError::UnknownTool(req.tool.clone()))?;

        if req.interval_sec < MIN_INTERVAL_SEC || req.interval_sec > MAX_INTERVAL_SEC {
            return Err(AutopostError::BadInterval(req.interval_sec));
        }
        if req.ttl_sec < MIN_TTL_SEC || req.ttl_sec > MAX_TTL_SEC {
            return Err(AutopostError::BadTtl(req.ttl_sec));
        }

        let now = self.now_i64();
        let valid_until_unix = req.valid_until_unix.unwrap_or(now + req.ttl_sec as i64);
        let horizon = valid_until_unix - now;
        if valid_until_unix < 1 || !(MIN_HORIZON_SEC..=MAX_HORIZON_SEC).contains(&horizon) {
            return Err(AutopostError::BadHorizon(horizon));
        }

        let name = self.resolve_name(&req.name).await?;

        let trade_id = req
            .args
            .get("trade_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let (tick_tx, tick_rx) = mpsc::channel(1);

        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            name.clone(),
            Job {
                name: name.clone(),
                tool,
                interval_sec: req.interval_sec,
                valid_until_unix,
                args: req.args,
                trade_id,
                peer_signer_hex: None,
                runs: 0,
                started_at: now,
                last_run_at: None,
                last_ok: None,
                last_error: None,
                handle: None,
                tick_tx,
            },
        );
        drop(jobs);

        self.run_once(&name).await;

        let manager = self.clone();
        let job_name = name.clone();
        let interval_ms = (req.interval_sec * 1000).max(1000);
        let handle = tokio::spawn(async move {
            manager.run_worker(job_name, tick_rx, interval_ms).await;
        });

        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&name) {
            job.handle = Some(handle);
        }

        Ok(name)
    }

    async fn resolve_name(&self, requested: &str) -> Result<String, AutopostError> {
        let jobs = self.jobs.lock().await;
        if !jobs.contains_key(requested) {
            return Ok(requested.to_string());
        }
        let sanitized = sanitize_job_name(requested);
        for _ in 0..MAX_NAME_COLLISION_ATTEMPTS {
            let epoch_ms = self.clock.now_ms();
            let suffix: u32 = rand::thread_rng().gen();
            let candidate = format!("{sanitized}_{epoch_ms}_{suffix:08x}");
            if !jobs.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(AutopostError::NameCollision(requested.to_string()))
    }

    /// Periodic timer loop: a tick enqueues via the single-slot channel, and
    /// the per-job worker below drains it, serializing runs.
    async fn run_worker(self: Arc<Self>, name: String, mut tick_rx: mpsc::Receiver<()>, interval_ms: u64) {
        let mut ticker = interval(Duration::from_millis(interval_ms));
        ticker.tick().await; // first tick fires immediately; already ran once in start().
        loop {
            ticker.tick().await;
            {
                let jobs = self.jobs.lock().await;
                if !jobs.contains_key(&name) {
                    return;
                }
                if jobs[&name].tick_tx.try_send(()).is_err() {
                    // Previous tick still draining; skip this one.
                    continue;
                }
            }
            if tick_rx.recv().await.is_none() {
                return;
            }
            self.run_once(&name).await;
            let jobs = self.jobs.lock().await;
            if !jobs.contains_key(&name) {
                return;
            }
        }
    }

    /// One scheduled execution of the job.
    async fn run_once(self: &Arc<Self>, name: &str) {
        let now = self.now_i64();

        let snapshot = {
            let jobs = self.jobs.lock().await;
            jobs.get(name).map(|j| {
                (
                    j.tool,
                    j.valid_until_unix,
                    j.args.clone(),
                    j.trade_id.clone(),
                    j.peer_signer_hex.clone(),
                    j.started_at,
                )
            })
        };
        let Some((tool, valid_until_unix, args, trade_id, peer_signer_hex, started_at)) = snapshot
        else {
            return;
        };

        if now >= valid_until_unix {
            self.stop(name, StopReason::Expired).await;
            return;
        }

        let mut run_args = args.clone();

        if tool == Tool::OfferPost {
            if let Some(obj) = run_args.as_object_mut() {
                if let Some(offers) = obj.get_mut("offers").and_then(|v| v.as_array_mut()) {
                    normalize_offer_line_indexes(offers);
                }
            }
            if let Some(peer_signer) = &peer_signer_hex {
                let trades = self.tool_runner.list_trades(250).await;
                let claimed: Vec<&Trade> = trades
                    .iter()
                    .filter(|t| {
                        t.state == "claimed" && &t.maker == peer_signer && t.updated_at >= started_at
                    })
                    .collect();
                if let Some(obj) = run_args.as_object_mut() {
                    if let Some(Value::Array(offers)) = obj.get_mut("offers") {
                        for trade in &claimed {
                            prune_matching_offer(offers, trade.btc_sats, &trade.usdt_amount);
                        }
                    }
                }
                let offers_empty = run_args
                    .get("offers")
                    .and_then(|v| v.as_array())
                    .map(|a| a.is_empty())
                    .unwrap_or(false);
                if offers_empty {
                    self.stop(name, StopReason::Filled).await;
                    return;
                }
            }
        }

        if tool == Tool::RfqPost {
            if let Some(trade_id) = &trade_id {
                if let Some(trade) = self.tool_runner.get_trade(trade_id).await {
                    if trade.state != "rfq" && trade.state != "rfq_posted" {
                        self.stop(name, StopReason::FilledWithState(trade.state)).await;
                        return;
                    }
                }
            }
        }

        if let Some(obj) = run_args.as_object_mut() {
            obj.insert("valid_until_unix".to_string(), Value::from(valid_until_unix));
            if tool == Tool::OfferPost {
                obj.remove("ttl_sec");
            }
        }

        let result = self.tool_runner.run_tool(tool, run_args).await;

        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(name) else { return };
        job.runs += 1;
        job.last_run_at = Some(now);

        match result {
            Ok(res) => {
                job.last_ok = Some(true);
                job.last_error = None;
                if job.peer_signer_hex.is_none() {
                    job.peer_signer_hex = res.envelope_signer;
                }
            }
            Err(message) => {
                job.last_ok = Some(false);
                job.last_error = Some(message.clone());
                let lower = message.to_lowercase();
                if INSUFFICIENT_FUNDS_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
                    drop(jobs);
                    self.stop(name, StopReason::InsufficientFunds).await;
                }
            }
        }
    }

    /// Clears the timer and removes the job from the manager.
    pub async fn stop(&self, name: &str, reason: StopReason) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.remove(name) {
            if let Some(handle) = job.handle {
                handle.abort();
            }
            info!(job = name, reason = reason.as_str().as_str(), "autopost job stopped");
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.jobs.lock().await.contains_key(name)
    }

    pub async fn runs(&self, name: &str) -> Option<u64> {
        self.jobs.lock().await.get(name).map(|j| j.runs)
    }

    /// Read-only scheduler counters for host observability, not part of
    /// the wire protocol.
    pub async fn stats(&self) -> SchedulerStats {
        let jobs = self.jobs.lock().await;
        SchedulerStats {
            running_jobs: jobs.len(),
            total_runs: jobs.values().map(|j| j.runs).sum(),
            failing_jobs: jobs.values().filter(|j| j.last_ok == Some(false)).count(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub running_jobs: usize,
    pub total_runs: u64,
    pub failing_jobs: usize,
}

/// Normalize `offers[].line_index` to unique non-negative integers:
/// prefer the provided index, else positional; on collision, the first
/// free integer >= position.
fn normalize_offer_line_indexes(offers: &mut [Value]) {
    let mut claimed = std::collections::HashSet::new();
    for (position, offer) in offers.iter_mut().enumerate() {
        let provided = offer.get("line_index").and_then(|v| v.as_i64()).filter(|&i| i >= 0);
        let candidate = match provided {
            Some(idx) if !claimed.contains(&idx) => idx,
            _ => {
                let mut candidate = position as i64;
                while claimed.contains(&candidate) {
                    candidate += 1;
                }
                candidate
            }
        };
        claimed.insert(candidate);
        if let Some(obj) = offer.as_object_mut() {
            obj.insert("line_index".to_string(), Value::from(candidate));
        }
    }
}

fn prune_matching_offer(offers: &mut Vec<Value>, btc_sats: i64, usdt_amount: &str) {
    if let Some(pos) = offers.iter().position(|o| {
        o.get("btc_sats").and_then(|v| v.as_i64()) == Some(btc_sats)
            && o.get("usdt_amount").and_then(|v| v.as_str()) == Some(usdt_amount)
    }) {
        offers.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    struct StubRunner {
        fail_with: Option<String>,
    }

    #[async_trait]
    impl ToolRunner for StubRunner {
        async fn run_tool(&self, _tool: Tool, _args: Value) -> Result<RunResult, String> {
            match &self.fail_with {
                Some(msg) => Err(msg.clone()),
                None => Ok(RunResult { ok: true, envelope_signer: Some("signer1".to_string()), error: None }),
            }
        }
        async fn get_trade(&self, _trade_id: &str) -> Option<Trade> {
            None
        }
        async fn list_trades(&self, _limit: usize) -> Vec<Trade> {
            vec![]
        }
    }

    #[test]
    fn sanitize_job_name_is_idempotent_and_bounded() {
        let long = "x".repeat(200);
        let once = sanitize_job_name(&long);
        assert!(once.len() <= 64);
        assert_eq!(sanitize_job_name(&once), once);
    }

    #[test]
    fn offer_line_index_normalization_resolves_collisions() {
        let mut offers = vec![
            json!({"btc_sats": 1, "line_index": 0}),
            json!({"btc_sats": 2, "line_index": 0}),
        ];
        normalize_offer_line_indexes(&mut offers);
        let a = offers[0].get("line_index").unwrap().as_i64().unwrap();
        let b = offers[1].get("line_index").unwrap().as_i64().unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn rejects_unknown_tool() {
        let clock = Arc::new(ManualClock::new(0));
        let runner = Arc::new(StubRunner { fail_with: None });
        let mgr = AutopostManager::new(clock, runner);
        let err = mgr
            .start(StartRequest {
                name: "job1".to_string(),
                tool: "BOGUS".to_string(),
                interval_sec: 1,
                ttl_sec: 60,
                valid_until_unix: None,
                args: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AutopostError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn rejects_out_of_range_interval() {
        let clock = Arc::new(ManualClock::new(0));
        let runner = Arc::new(StubRunner { fail_with: None });
        let mgr = AutopostManager::new(clock, runner);
        let err = mgr
            .start(StartRequest {
                name: "job1".to_string(),
                tool: "OFFER_POST".to_string(),
                interval_sec: 0,
                ttl_sec: 60,
                valid_until_unix: None,
                args: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AutopostError::BadInterval(0)));
    }

    #[tokio::test]
    async fn expiry_stops_job_at_horizon() {
        let clock = Arc::new(ManualClock::new(0));
        let runner = Arc::new(StubRunner { fail_with: None });
        let mgr = AutopostManager::new(clock.clone(), runner);
        let name = mgr
            .start(StartRequest {
                name: "expiring".to_string(),
                tool: "OFFER_POST".to_string(),
                interval_sec: 1,
                ttl_sec: 10,
                valid_until_unix: None,
                args: json!({"offers": []}),
            })
            .await
            .unwrap();
        assert!(mgr.is_running(&name).await);
        clock.advance(10_000);
        mgr.run_once(&name).await;
        assert!(!mgr.is_running(&name).await);
    }

    #[tokio::test]
    async fn insufficient_funds_error_is_terminal() {
        let clock = Arc::new(ManualClock::new(0));
        let runner = Arc::new(StubRunner { fail_with: Some("Insufficient funds in wallet".to_string()) });
        let mgr = AutopostManager::new(clock, runner);
        let name = mgr
            .start(StartRequest {
                name: "job1".to_string(),
                tool: "RFQ_POST".to_string(),
                interval_sec: 60,
                ttl_sec: 600,
                valid_until_unix: None,
                args: json!({}),
            })
            .await
            .unwrap();
        assert!(!mgr.is_running(&name).await);
    }
}
