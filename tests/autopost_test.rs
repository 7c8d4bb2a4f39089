//! End-to-end autopost scenario: a filled maker offer prunes its line
//! and the job terminates.

use async_trait::async_trait;
use serde_json::json;
use sidechannel::{AutopostManager, StartRequest, ToolRunner};
use sidechannel::autopost::{RunResult, Tool, Trade};
use sidechannel::clock::ManualClock;
use std::sync::{Arc, Mutex};

struct FillingRunner {
    trades: Mutex<Vec<Trade>>,
}

#[async_trait]
impl ToolRunner for FillingRunner {
    async fn run_tool(&self, _tool: Tool, _args: serde_json::Value) -> Result<RunResult, String> {
        Ok(RunResult { ok: true, envelope_signer: Some("maker1".to_string()), error: None })
    }

    async fn get_trade(&self, _trade_id: &str) -> Option<Trade> {
        None
    }

    async fn list_trades(&self, _limit: usize) -> Vec<Trade> {
        self.trades.lock().unwrap().clone()
    }
}

#[tokio::test(start_paused = true)]
async fn fill_prune_terminates_job_when_offers_empty() {
    let clock = Arc::new(ManualClock::new(0));
    let runner = Arc::new(FillingRunner { trades: Mutex::new(vec![]) });
    let mgr = AutopostManager::new(clock.clone(), runner.clone());

    let name = mgr
        .start(StartRequest {
            name: "maker-job".to_string(),
            tool: "OFFER_POST".to_string(),
            interval_sec: 1,
            ttl_sec: 600,
            valid_until_unix: None,
            args: json!({"offers": [{"btc_sats": 1, "usdt_amount": "1"}]}),
        })
        .await
        .expect("valid start request");

    assert!(mgr.is_running(&name).await);
    assert_eq!(mgr.runs(&name).await, Some(1));

    // A claimed trade matching the advertised line arrives, with
    // updated_at after the job started.
    *runner.trades.lock().unwrap() = vec![Trade {
        id: "t1".to_string(),
        state: "claimed".to_string(),
        maker: "maker1".to_string(),
        updated_at: 1,
        btc_sats: 1,
        usdt_amount: "1".to_string(),
    }];

    clock.advance(1_000);
    tokio::time::advance(std::time::Duration::from_millis(1_100)).await;
    tokio::task::yield_now().await;

    assert!(!mgr.is_running(&name).await);
}
