//! Relayer stake gate
//!
//! A relayer keeps at least twice the contract's required stake so that a
//! single slashing event cannot push it below the minimum.

use std::sync::Arc;

use alloy::primitives::U256;
use eyre::{Result, WrapErr};
use tracing::{info, warn};

use crate::hub::LedgerClient;
use crate::types::RelayerStake;

/// Result of an eligibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Stake already above threshold
    Eligible,
    /// Stake was topped up by `amount` and now clears the threshold
    ToppedUp { amount: U256 },
    /// Stake is still below threshold after the top-up attempt
    Insufficient { staked: U256, threshold: U256 },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Eligibility::Insufficient { .. })
    }
}

pub struct RelayEligibilityManager {
    ledger: Arc<dyn LedgerClient>,
}

impl RelayEligibilityManager {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }

    async fn current_stake(&self) -> Result<RelayerStake> {
        let staked = self
            .ledger
            .my_stake()
            .await
            .wrap_err("Failed to read relayer stake")?;
        Ok(RelayerStake {
            address: self.ledger.relayer_address(),
            staked,
        })
    }

    /// Check the stake and top it up to the threshold if needed
    pub async fn check_eligible(&self) -> Result<Eligibility> {
        let required = self
            .ledger
            .required_stake()
            .await
            .wrap_err("Failed to read required stake")?;
        let threshold = RelayerStake::threshold(required);
        let stake = self.current_stake().await?;

        if stake.is_eligible(required) {
            return Ok(Eligibility::Eligible);
        }

        let amount = stake.deficit(required);
        info!(
            relayer = %stake.address,
            staked = %stake.staked,
            threshold = %threshold,
            amount = %amount,
            "Stake below threshold, topping up"
        );

        let outcome = self
            .ledger
            .stake(amount)
            .await
            .wrap_err("Failed to submit stake top-up")?;
        if !outcome.success {
            warn!(tx_hash = %hex::encode(outcome.tx_hash), "Stake top-up reverted");
        }

        // Trust the contract, not the receipt
        let after = self.current_stake().await?;
        if after.is_eligible(required) {
            info!(relayer = %after.address, staked = %after.staked, "Relayer stake topped up");
            Ok(Eligibility::ToppedUp { amount })
        } else {
            warn!(
                relayer = %after.address,
                staked = %after.staked,
                threshold = %threshold,
                "Relayer stake still below threshold"
            );
            Ok(Eligibility::Insufficient {
                staked: after.staked,
                threshold,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockSourceChain, SimulatedHub};
    use alloy::primitives::Address;
    use std::time::Duration;

    const RELAYER: Address = Address::repeat_byte(0x11);

    fn setup() -> (Arc<SimulatedHub>, RelayEligibilityManager) {
        let source = MockSourceChain::new();
        let hub = SimulatedHub::new(&source.header(0).unwrap(), Duration::from_secs(7200));
        let manager = RelayEligibilityManager::new(Arc::new(hub.handle(RELAYER)));
        (hub, manager)
    }

    #[tokio::test]
    async fn test_already_eligible_does_not_stake() {
        let (hub, manager) = setup();
        hub.set_stake(RELAYER, U256::from(250u64));

        let result = manager.check_eligible().await.unwrap();
        assert_eq!(result, Eligibility::Eligible);
        assert!(hub.stake_calls().is_empty());
    }

    #[tokio::test]
    async fn test_tops_up_exact_deficit() {
        let (hub, manager) = setup();
        hub.set_stake(RELAYER, U256::from(130u64));

        let result = manager.check_eligible().await.unwrap();
        assert_eq!(
            result,
            Eligibility::ToppedUp {
                amount: U256::from(70u64)
            }
        );
        assert!(result.is_eligible());
        assert_eq!(hub.stake_calls(), vec![(RELAYER, U256::from(70u64))]);
        assert_eq!(hub.stake_of(RELAYER), U256::from(200u64));
    }

    #[tokio::test]
    async fn test_reverted_top_up_is_insufficient() {
        let (hub, manager) = setup();
        hub.set_stake(RELAYER, U256::from(50u64));
        hub.freeze_stake(RELAYER);

        let result = manager.check_eligible().await.unwrap();
        assert_eq!(
            result,
            Eligibility::Insufficient {
                staked: U256::from(50u64),
                threshold: U256::from(200u64),
            }
        );
        assert!(!result.is_eligible());
        assert_eq!(hub.stake_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_follows_required_stake() {
        let (hub, manager) = setup();
        hub.set_required_stake(U256::from(10u64));
        hub.set_stake(RELAYER, U256::from(20u64));
        assert_eq!(manager.check_eligible().await.unwrap(), Eligibility::Eligible);

        hub.set_required_stake(U256::from(11u64));
        assert_eq!(
            manager.check_eligible().await.unwrap(),
            Eligibility::ToppedUp {
                amount: U256::from(2u64)
            }
        );
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let (hub, manager) = setup();
        hub.fail_next_calls(1);
        assert!(manager.check_eligible().await.is_err());
        assert!(hub.stake_calls().is_empty());
    }
}
