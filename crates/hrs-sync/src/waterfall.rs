//! Per-hotel review budget split across quality pools.
//!
//! Pools are drained in strict order: `negative`, then `evidence`, then
//! `latest`. `latest` only gets what the first two actually delivered short of
//! the per-hotel cap, so its final size is known once both have settled.

use hrs_core::{HotelCandidate, PolicyError, ReviewPool};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaterfallPolicy {
    pub max_per_hotel: u32,
    pub negative_cap: u32,
    pub evidence_cap: u32,
    /// Hotels with fewer known reviews are skipped outright.
    pub min_reviews: u32,
}

impl Default for WaterfallPolicy {
    fn default() -> Self {
        Self {
            max_per_hotel: 300,
            negative_cap: 100,
            evidence_cap: 150,
            min_reviews: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuota {
    pub pool: ReviewPool,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Circuit breaker: too few reviews to be worth a fetch.
    Skip { review_count: u32, threshold: u32 },
    /// Sub-quotas in waterfall order; zero targets are left out.
    Collect { sub_quotas: Vec<SubQuota> },
}

impl ReviewDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, ReviewDecision::Skip { .. })
    }

    pub fn target_for(&self, pool: ReviewPool) -> Option<u32> {
        match self {
            ReviewDecision::Skip { .. } => None,
            ReviewDecision::Collect { sub_quotas } => {
                sub_quotas.iter().find(|q| q.pool == pool).map(|q| q.target)
            }
        }
    }
}

impl WaterfallPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_per_hotel == 0 {
            return Err(PolicyError::InvalidBudget {
                max_per_hotel: self.max_per_hotel,
            });
        }
        Ok(())
    }

    /// Effective caps with `negative + evidence <= max_per_hotel`.
    pub fn effective_caps(&self) -> (u32, u32) {
        let negative = self.negative_cap.min(self.max_per_hotel);
        let evidence = self.evidence_cap.min(self.max_per_hotel - negative);
        (negative, evidence)
    }

    pub fn plan_hotel(&self, hotel: &HotelCandidate) -> Result<ReviewDecision, PolicyError> {
        self.validate()?;
        let known = hotel.review_count_hint;
        if known < self.min_reviews {
            return Ok(ReviewDecision::Skip {
                review_count: known,
                threshold: self.min_reviews,
            });
        }

        let (negative_cap, evidence_cap) = self.effective_caps();
        // Without a per-pool count the total is the only bound we have.
        let negative = negative_cap
            .min(hotel.pool_counts.negative.unwrap_or(known))
            .min(known);
        let evidence = evidence_cap
            .min(hotel.pool_counts.evidence.unwrap_or(known))
            .min(known);
        let latest = self.latest_target(negative, evidence, known);

        let sub_quotas = [
            (ReviewPool::Negative, negative),
            (ReviewPool::Evidence, evidence),
            (ReviewPool::Latest, latest),
        ]
        .into_iter()
        .filter(|(_, target)| *target > 0)
        .map(|(pool, target)| SubQuota { pool, target })
        .collect();

        Ok(ReviewDecision::Collect { sub_quotas })
    }

    /// Size of the `latest` pool given what `negative` and `evidence` actually delivered.
    pub fn latest_target(&self, negative_fulfilled: u32, evidence_fulfilled: u32, available: u32) -> u32 {
        self.max_per_hotel
            .saturating_sub(negative_fulfilled)
            .saturating_sub(evidence_fulfilled)
            .min(available)
    }

    /// Scheduling priority of a hotel's review tasks before the pool offset.
    pub fn hotel_priority(hotel: &HotelCandidate) -> i32 {
        let volume = match hotel.review_count_hint {
            n if n > 1000 => 10,
            n if n > 500 => 8,
            n if n > 200 => 5,
            _ => 0,
        };
        let rating = hotel.rating.map(|r| r.max(0.0) as i32).unwrap_or(0);
        volume + rating
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrs_core::{PoolCounts, PriceTier, StratificationCell};
    use proptest::prelude::*;

    fn hotel(hint: u32, pools: PoolCounts) -> HotelCandidate {
        HotelCandidate {
            external_id: "10019773".into(),
            name: "Riverside".into(),
            cell: StratificationCell::new("cbd", "39584", PriceTier::Comfort),
            ranking_score: 1.0,
            review_count_hint: hint,
            rating: Some(4.7),
            pool_counts: pools,
        }
    }

    #[test]
    fn low_volume_hotel_is_skipped() {
        let decision = WaterfallPolicy::default()
            .plan_hotel(&hotel(40, PoolCounts::default()))
            .unwrap();
        assert_eq!(
            decision,
            ReviewDecision::Skip {
                review_count: 40,
                threshold: 50
            }
        );
    }

    #[test]
    fn large_hotel_gets_full_waterfall() {
        let decision = WaterfallPolicy::default()
            .plan_hotel(&hotel(500, PoolCounts::default()))
            .unwrap();
        assert_eq!(decision.target_for(ReviewPool::Negative), Some(100));
        assert_eq!(decision.target_for(ReviewPool::Evidence), Some(150));
        assert_eq!(decision.target_for(ReviewPool::Latest), Some(50));
    }

    #[test]
    fn sparse_pools_shrink_targets_and_grow_latest() {
        let decision = WaterfallPolicy::default()
            .plan_hotel(&hotel(
                800,
                PoolCounts {
                    negative: Some(12),
                    evidence: Some(0),
                },
            ))
            .unwrap();
        let ReviewDecision::Collect { sub_quotas } = decision else {
            panic!("expected collect");
        };
        assert_eq!(
            sub_quotas,
            vec![
                SubQuota {
                    pool: ReviewPool::Negative,
                    target: 12
                },
                SubQuota {
                    pool: ReviewPool::Latest,
                    target: 288
                },
            ]
        );
    }

    #[test]
    fn latest_uses_fulfilled_counts() {
        let policy = WaterfallPolicy::default();
        assert_eq!(policy.latest_target(100, 150, 5000), 50);
        assert_eq!(policy.latest_target(30, 20, 5000), 250);
        assert_eq!(policy.latest_target(30, 20, 120), 120);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let policy = WaterfallPolicy {
            max_per_hotel: 0,
            ..Default::default()
        };
        assert_eq!(
            policy.plan_hotel(&hotel(500, PoolCounts::default())),
            Err(PolicyError::InvalidBudget { max_per_hotel: 0 })
        );
    }

    #[test]
    fn caps_are_clamped_to_the_hotel_budget() {
        let policy = WaterfallPolicy {
            max_per_hotel: 120,
            ..Default::default()
        };
        assert_eq!(policy.effective_caps(), (100, 20));
    }

    #[test]
    fn review_priority_rewards_volume_and_rating() {
        assert_eq!(WaterfallPolicy::hotel_priority(&hotel(2345, PoolCounts::default())), 14);
        assert_eq!(WaterfallPolicy::hotel_priority(&hotel(612, PoolCounts::default())), 12);
        assert_eq!(WaterfallPolicy::hotel_priority(&hotel(188, PoolCounts::default())), 4);
    }

    proptest! {
        #[test]
        fn sub_quotas_respect_caps(
            hint in 0u32..5000,
            negative in proptest::option::of(0u32..400),
            evidence in proptest::option::of(0u32..400),
        ) {
            let policy = WaterfallPolicy::default();
            let decision = policy
                .plan_hotel(&hotel(hint, PoolCounts { negative, evidence }))
                .unwrap();
            if hint < policy.min_reviews {
                prop_assert!(decision.is_skip());
            } else {
                let ReviewDecision::Collect { sub_quotas } = decision else {
                    return Err(TestCaseError::fail("expected collect"));
                };
                let mut last_pool = None;
                let mut sum = 0;
                for quota in &sub_quotas {
                    prop_assert!(quota.target > 0);
                    prop_assert!(Some(quota.pool) > last_pool);
                    last_pool = Some(quota.pool);
                    match quota.pool {
                        ReviewPool::Negative => prop_assert!(quota.target <= 100),
                        ReviewPool::Evidence => prop_assert!(quota.target <= 150),
                        ReviewPool::Latest => {}
                    }
                    sum += quota.target;
                }
                prop_assert!(sum <= 300);
            }
        }
    }
}
