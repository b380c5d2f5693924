//! Test doubles shared by the runner and registry tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::channel::{
    Channel, ChannelStatus, ChannelTester, ChannelType, NewChannel, ProbeError, ProbeReport,
    ProviderError,
};
use crate::jobs::{NewTestJob, TestJobOptions};
use crate::storage::{ChannelStore, JobStore};

/// Replays scripted outcomes per (channel id, model); unscripted calls succeed.
#[derive(Default)]
pub struct ScriptedTester {
    script: Mutex<HashMap<(i64, String), VecDeque<ProbeReport>>>,
    calls: Mutex<Vec<(i64, String)>>,
    delay: Duration,
}

impl ScriptedTester {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn push(&self, channel_id: i64, model: &str, report: ProbeReport) {
        self.script
            .lock()
            .unwrap()
            .entry((channel_id, model.to_string()))
            .or_default()
            .push_back(report);
    }

    pub fn push_many(&self, channel_id: i64, model: &str, report: ProbeReport, times: usize) {
        for _ in 0..times {
            self.push(channel_id, model, report.clone());
        }
    }

    pub fn calls(&self) -> Vec<(i64, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, channel_id: i64, model: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(id, m)| *id == channel_id && m == model)
            .count()
    }
}

#[async_trait::async_trait]
impl ChannelTester for ScriptedTester {
    async fn test(&self, channel: &Channel, model: &str) -> ProbeReport {
        self.calls
            .lock()
            .unwrap()
            .push((channel.id, model.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&(channel.id, model.to_string()))
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| ProbeReport::success(Duration::from_millis(25)))
    }
}

pub fn server_error() -> ProbeReport {
    ProbeReport::failure(
        Duration::from_millis(40),
        ProbeError::from_provider(
            "status code 500: upstream exploded",
            ProviderError {
                message: "upstream exploded".to_string(),
                code: Some("server_error".to_string()),
                status: 500,
            },
        ),
    )
}

pub fn rate_limited() -> ProbeReport {
    ProbeReport::failure(
        Duration::from_millis(10),
        ProbeError::from_provider(
            "status code 429: slow down",
            ProviderError {
                message: "slow down".to_string(),
                code: Some("rate_limit_exceeded".to_string()),
                status: 429,
            },
        ),
    )
}

pub fn add_channel(store: &ChannelStore, name: &str, models: &str) -> Channel {
    let id = store
        .insert(&NewChannel {
            name: name.to_string(),
            channel_type: ChannelType::OpenAi,
            status: ChannelStatus::Enabled,
            base_url: "https://api.example.com".to_string(),
            key: "sk-test".to_string(),
            models: models.to_string(),
            test_model: None,
        })
        .unwrap();
    store.get(id).unwrap().unwrap()
}

pub fn add_job(store: &JobStore, channel_ids: Vec<i64>, interval_ms: i64, retry_limit: i64) -> i64 {
    store
        .create_job(&NewTestJob {
            requester_id: 1,
            concurrency: 2,
            interval_ms,
            retry_limit,
            options: TestJobOptions {
                channel_ids,
                ..Default::default()
            },
        })
        .unwrap()
}
