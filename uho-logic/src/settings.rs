use crate::{
    backfill::BackfillSettings, fanout, pipeline::PollerSettings, rpc::RpcSettings,
    webhooks::WebhookSettings,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub backfill: BackfillSettings,
    #[serde(default)]
    pub webhooks: WebhookSettings,
    #[serde(default)]
    pub fanout: FanoutSettings,
}

impl Settings {
    pub fn default(database_url: String) -> Self {
        Self {
            database: DatabaseSettings {
                url: database_url,
                max_connections: default_max_connections(),
            },
            rpc: RpcSettings::default(),
            poller: PollerSettings::default(),
            backfill: BackfillSettings::default(),
            webhooks: WebhookSettings::default(),
            fanout: FanoutSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FanoutSettings {
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

fn default_backlog() -> usize {
    fanout::DEFAULT_BACKLOG
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn minimal_config_gets_documented_defaults() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "database": { "url": "postgres://localhost/uho" }
        }))
        .unwrap();
        assert_eq!(settings.poller.poll_interval, Duration::from_millis(2000));
        assert_eq!(settings.rpc.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.rpc.max_retries, 3);
        assert_eq!(settings.backfill.demo_max_slots, 10_000);
        assert_eq!(settings.backfill.request_delay, Duration::from_millis(100));
        assert_eq!(settings.webhooks.retry_schedule.len(), 5);
        assert_eq!(
            settings.webhooks.retry_schedule[1],
            Duration::from_secs(30)
        );
        assert_eq!(settings.fanout.backlog, 1000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Settings, _> = serde_json::from_value(serde_json::json!({
            "database": { "url": "postgres://localhost/uho" },
            "typo_section": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn durations_deserialize_from_scalar_units() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "database": { "url": "postgres://localhost/uho" },
            "poller": { "poll_interval": 500 },
            "backfill": { "request_delay": 250, "progress_interval": 10 }
        }))
        .unwrap();
        assert_eq!(settings.poller.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.backfill.request_delay, Duration::from_millis(250));
        assert_eq!(
            settings.backfill.progress_interval,
            Duration::from_secs(10)
        );
    }
}
