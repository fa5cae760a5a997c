//! HTTP access to the activity backend: history pages, the pending list and
//! payload enrichment. Behind a trait so the reconciler can be exercised
//! against a scripted gateway.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;

use walletfeed_config::GatewayConfig;
use walletfeed_core_types::{sort_activities, Activity, Network};

#[derive(Debug, Clone, Default)]
pub struct ConfirmedActivitiesFilter {
    pub address: String,
    /// Only activities strictly newer than this land in the response; `None`
    /// fetches the newest page unconditionally.
    pub from_timestamp: Option<i64>,
}

#[async_trait]
pub trait ActivityGateway: Send + Sync {
    async fn fetch_confirmed_activities(
        &self,
        network: Network,
        filter: &ConfirmedActivitiesFilter,
        limit: usize,
    ) -> Result<Vec<Activity>>;

    async fn fetch_pending_activities(
        &self,
        network: Network,
        address: &str,
    ) -> Result<Vec<Activity>>;

    /// Resolves full payloads for a batch of confirmed activities. The
    /// response must keep the batch's cardinality.
    async fn enrich(&self, network: Network, activities: Vec<Activity>) -> Result<Vec<Activity>>;
}

pub struct HttpActivityGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpActivityGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("build http client")?;
        Ok(Self { client, config })
    }

    fn base_url(&self, network: Network) -> &str {
        match network {
            Network::Mainnet => &self.config.mainnet_http_url,
            Network::Testnet => &self.config.testnet_http_url,
        }
    }
}

#[async_trait]
impl ActivityGateway for HttpActivityGateway {
    async fn fetch_confirmed_activities(
        &self,
        network: Network,
        filter: &ConfirmedActivitiesFilter,
        limit: usize,
    ) -> Result<Vec<Activity>> {
        let url = format!("{}/activities", self.base_url(network));
        let mut request = self
            .client
            .get(&url)
            .query(&[("address", filter.address.as_str())])
            .query(&[("limit", limit)]);
        if let Some(from_timestamp) = filter.from_timestamp {
            request = request.query(&[("from_timestamp", from_timestamp)]);
        }

        let mut activities: Vec<Activity> = request
            .send()
            .await
            .context("confirmed activities request failed")?
            .error_for_status()
            .context("confirmed activities request rejected")?
            .json()
            .await
            .context("confirmed activities response malformed")?;
        sort_activities(&mut activities);
        Ok(activities)
    }

    async fn fetch_pending_activities(
        &self,
        network: Network,
        address: &str,
    ) -> Result<Vec<Activity>> {
        let url = format!("{}/pending-activities", self.base_url(network));
        let mut activities: Vec<Activity> = self
            .client
            .get(&url)
            .query(&[("address", address)])
            .send()
            .await
            .context("pending activities request failed")?
            .error_for_status()
            .context("pending activities request rejected")?
            .json()
            .await
            .context("pending activities response malformed")?;
        sort_activities(&mut activities);
        Ok(activities)
    }

    async fn enrich(&self, network: Network, activities: Vec<Activity>) -> Result<Vec<Activity>> {
        let url = format!("{}/activities/enrich", self.base_url(network));
        let expected = activities.len();
        let enriched: Vec<Activity> = self
            .client
            .post(&url)
            .json(&activities)
            .send()
            .await
            .context("enrich request failed")?
            .error_for_status()
            .context("enrich request rejected")?
            .json()
            .await
            .context("enrich response malformed")?;
        ensure!(
            enriched.len() == expected,
            "enrich returned {} activities for a batch of {expected}",
            enriched.len()
        );
        Ok(enriched)
    }
}
