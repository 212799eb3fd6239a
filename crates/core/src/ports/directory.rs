//! Port trait for the election service.
//!
//! Elections are owned by another service. The wallet only reads what it
//! needs to price participation, gate publishing and settle funds.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamResult;
use crate::models::{AccountId, ElectionId, Money};

/// Lifecycle of an election as reported by the election service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStatus {
    Draft,
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl ElectionStatus {
    pub fn has_ended(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Nature of an election's reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    /// Cash pool funded by the creator and held in escrow.
    Monetary,
    NonMonetary,
    ProjectedRevenue,
}

/// Prize configuration of an election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeConfig {
    pub reward_type: RewardType,
    /// Total pool for monetary rewards.
    pub amount: Money,
    pub winner_count: u32,
}

impl PrizeConfig {
    /// Whether publishing requires a completed escrow deposit.
    pub fn requires_deposit(&self) -> bool {
        self.reward_type == RewardType::Monetary && self.amount.is_positive()
    }
}

/// Participation pricing, per region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub fee_by_region: BTreeMap<String, Money>,
    pub default_fee: Option<Money>,
}

impl Pricing {
    /// Fee for a region code (case-insensitive), else the default fee.
    pub fn fee_for(&self, region: &str) -> Option<Money> {
        let region = region.to_ascii_lowercase();
        self.fee_by_region
            .iter()
            .find(|(code, _)| code.to_ascii_lowercase() == region)
            .map(|(_, fee)| *fee)
            .or(self.default_fee)
    }
}

/// Election as seen by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionInfo {
    pub id: ElectionId,
    pub creator_id: AccountId,
    pub title: String,
    pub status: ElectionStatus,
    #[serde(default)]
    pub pricing: Pricing,
    #[serde(default)]
    pub prize: Option<PrizeConfig>,
}

/// Port trait for election lookups.
#[async_trait]
pub trait ElectionDirectory: Send + Sync {
    /// Get an election, `None` if it does not exist.
    async fn get_election(&self, id: &ElectionId) -> UpstreamResult<Option<ElectionInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_for_region_falls_back_to_default() {
        let mut pricing = Pricing {
            fee_by_region: BTreeMap::new(),
            default_fee: Some(Money::from_cents(300)),
        };
        pricing
            .fee_by_region
            .insert("US".to_string(), Money::from_cents(500));

        assert_eq!(pricing.fee_for("us"), Some(Money::from_cents(500)));
        assert_eq!(pricing.fee_for("fr"), Some(Money::from_cents(300)));

        pricing.default_fee = None;
        assert_eq!(pricing.fee_for("fr"), None);
    }

    #[test]
    fn test_only_funded_monetary_prizes_require_deposit() {
        let mut prize = PrizeConfig {
            reward_type: RewardType::Monetary,
            amount: Money::from_dollars_whole(1000),
            winner_count: 10,
        };
        assert!(prize.requires_deposit());

        prize.reward_type = RewardType::ProjectedRevenue;
        assert!(!prize.requires_deposit());
    }
}
