//! HTTP client for the election service.
//!
//! The election service speaks camelCase JSON with dollar amounts. This
//! module maps its payloads onto [`ElectionInfo`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument};

use electa_core::error::{UpstreamError, UpstreamResult};
use electa_core::models::{ElectionId, Money};
use electa_core::ports::{
    ElectionDirectory, ElectionInfo, ElectionStatus, Pricing, PrizeConfig, RewardType,
};

use crate::client::{ServiceConfig, build_client, endpoint, read_json, transport_error};

/// [`ElectionDirectory`] backed by the election service's REST API.
pub struct HttpElectionDirectory {
    config: ServiceConfig,
    http: reqwest::Client,
}

impl HttpElectionDirectory {
    pub fn new(config: ServiceConfig) -> UpstreamResult<Self> {
        let http = build_client(&config)?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl ElectionDirectory for HttpElectionDirectory {
    #[instrument(skip_all, fields(election_id = %id))]
    async fn get_election(&self, id: &ElectionId) -> UpstreamResult<Option<ElectionInfo>> {
        let mut request = self
            .http
            .get(endpoint(&self.config.base_url, &["elections", id.as_str()]));
        if let Some(token) = &self.config.service_token {
            request = request.header("x-service-token", token);
        }
        let response = request.send().await.map_err(transport_error)?;

        let Some(payload) = read_json::<ElectionPayload>(response, &[StatusCode::NOT_FOUND]).await?
        else {
            debug!("Election not found");
            return Ok(None);
        };
        payload.into_info().map(Some)
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElectionPayload {
    id: String,
    creator_id: String,
    #[serde(default)]
    title: String,
    status: String,
    #[serde(default)]
    regional_pricing: Vec<RegionalPrice>,
    #[serde(default)]
    participation_fee: Option<f64>,
    #[serde(default)]
    prize_pool: Option<PrizePool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegionalPrice {
    region_code: String,
    fee: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrizePool {
    reward_type: String,
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    winner_count: u32,
}

impl ElectionPayload {
    fn into_info(self) -> UpstreamResult<ElectionInfo> {
        let mut fee_by_region = BTreeMap::new();
        for price in self.regional_pricing {
            fee_by_region.insert(price.region_code, dollars(price.fee)?);
        }
        let default_fee = self.participation_fee.map(dollars).transpose()?;

        let prize = match self.prize_pool {
            Some(pool) => Some(PrizeConfig {
                reward_type: reward_type(&pool.reward_type)?,
                amount: dollars(pool.amount)?,
                winner_count: pool.winner_count,
            }),
            None => None,
        };

        Ok(ElectionInfo {
            id: ElectionId::new(self.id),
            creator_id: self.creator_id.into(),
            title: self.title,
            status: election_status(&self.status)?,
            pricing: Pricing {
                fee_by_region,
                default_fee,
            },
            prize,
        })
    }
}

fn dollars(value: f64) -> UpstreamResult<Money> {
    Money::from_dollars(value)
        .filter(|m| !m.is_negative())
        .ok_or_else(|| UpstreamError::InvalidResponse(format!("invalid amount {value}")))
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

fn election_status(value: &str) -> UpstreamResult<ElectionStatus> {
    match normalize(value).as_str() {
        "draft" => Ok(ElectionStatus::Draft),
        "scheduled" | "upcoming" | "published" => Ok(ElectionStatus::Scheduled),
        "active" | "ongoing" => Ok(ElectionStatus::Active),
        "completed" | "ended" => Ok(ElectionStatus::Completed),
        "cancelled" | "canceled" => Ok(ElectionStatus::Cancelled),
        _ => Err(UpstreamError::InvalidResponse(format!(
            "unknown election status {value}"
        ))),
    }
}

fn reward_type(value: &str) -> UpstreamResult<RewardType> {
    match normalize(value).as_str() {
        "monetary" => Ok(RewardType::Monetary),
        "non_monetary" | "nonmonetary" => Ok(RewardType::NonMonetary),
        "projected_revenue" | "projectedrevenue" => Ok(RewardType::ProjectedRevenue),
        _ => Err(UpstreamError::InvalidResponse(format!(
            "unknown reward type {value}"
        ))),
    }
}
