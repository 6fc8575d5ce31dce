// Copyright 2024 Escrow Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Gas pricing policy of the wallet.
//!
//! All scaling happens in fixed point (three decimals) on [`U256`];
//! wei amounts never pass through floats.

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;

use escrow_relayer_config::SubmitterConfig;

const DEFAULT_PRIORITY_ADJUSTMENT_FACTOR: f64 = 1.1;

/// The configured pricing rules of one chain's wallet.
#[derive(Debug, Clone)]
pub struct GasPolicy {
    /// Price with `gasPrice` instead of the EIP-1559 fee fields.
    pub legacy_transactions: bool,
    /// Hard `maxFeePerGas`; the RPC estimate is used when unset.
    pub max_fee_per_gas: Option<U256>,
    /// Multiplier over the RPC priority fee.
    pub max_priority_fee_adjustment_factor: f64,
    /// Cap on the adjusted priority fee.
    pub max_allowed_priority_fee_per_gas: Option<U256>,
    /// Multiplier over the RPC legacy gas price.
    pub gas_price_adjustment_factor: f64,
    /// Cap on the adjusted legacy gas price.
    pub max_allowed_gas_price: Option<U256>,
    /// Fee multiplier for replacing a stuck transaction.
    pub priority_adjustment_factor: f64,
}

impl GasPolicy {
    /// Builds the policy from the effective submitter config.
    pub fn from_config(config: &SubmitterConfig) -> Self {
        Self {
            legacy_transactions: config.legacy_transactions,
            max_fee_per_gas: config.max_fee_per_gas.map(U256::from),
            max_priority_fee_adjustment_factor: config
                .max_priority_fee_adjustment_factor
                .unwrap_or(1.0),
            max_allowed_priority_fee_per_gas: config
                .max_allowed_priority_fee_per_gas
                .map(U256::from),
            gas_price_adjustment_factor: config
                .gas_price_adjustment_factor
                .unwrap_or(1.0),
            max_allowed_gas_price: config
                .max_allowed_gas_price
                .map(U256::from),
            priority_adjustment_factor: config
                .priority_adjustment_factor
                .unwrap_or(DEFAULT_PRIORITY_ADJUSTMENT_FACTOR),
        }
    }
}

/// Multiplies a wei amount by a small factor in fixed point.
pub fn scale(value: U256, factor: f64) -> U256 {
    let milli = (factor * 1000.0).round() as u64;
    value * U256::from(milli) / U256::from(1000u64)
}

/// The price assigned to a transaction, by fee market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPrice {
    /// EIP-1559 fee fields.
    Eip1559 {
        /// Cap on the total fee per gas.
        max_fee_per_gas: U256,
        /// Tip per gas.
        max_priority_fee_per_gas: U256,
    },
    /// Pre-1559 single gas price.
    Legacy {
        /// The gas price.
        gas_price: U256,
    },
}

impl GasPrice {
    /// Prices a transaction from the policy and the RPC fee data.
    pub fn from_fee_data(
        policy: &GasPolicy,
        rpc_max_fee_per_gas: U256,
        rpc_priority_fee: U256,
    ) -> Self {
        if policy.legacy_transactions {
            let adjusted = scale(
                rpc_max_fee_per_gas,
                policy.gas_price_adjustment_factor,
            );
            let gas_price = match policy.max_allowed_gas_price {
                Some(cap) => adjusted.min(cap),
                None => adjusted,
            };
            return Self::Legacy { gas_price };
        }
        let max_fee_per_gas =
            policy.max_fee_per_gas.unwrap_or(rpc_max_fee_per_gas);
        let adjusted = scale(
            rpc_priority_fee,
            policy.max_priority_fee_adjustment_factor,
        );
        let capped = match policy.max_allowed_priority_fee_per_gas {
            Some(cap) => adjusted.min(cap),
            None => adjusted,
        };
        Self::Eip1559 {
            max_fee_per_gas,
            // the tip can never exceed the total fee cap.
            max_priority_fee_per_gas: capped.min(max_fee_per_gas),
        }
    }

    /// Scales every component, for replacing a stuck transaction at the
    /// same nonce.
    pub fn bump(&self, factor: f64) -> GasPrice {
        match *self {
            Self::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Self::Eip1559 {
                max_fee_per_gas: scale(max_fee_per_gas, factor),
                max_priority_fee_per_gas: scale(
                    max_priority_fee_per_gas,
                    factor,
                ),
            },
            Self::Legacy { gas_price } => Self::Legacy {
                gas_price: scale(gas_price, factor),
            },
        }
    }

    /// Writes the price into a transaction request.
    pub fn apply(&self, tx: &mut TypedTransaction) {
        match (self, tx) {
            (
                Self::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
                TypedTransaction::Eip1559(inner),
            ) => {
                inner.max_fee_per_gas = Some(*max_fee_per_gas);
                inner.max_priority_fee_per_gas =
                    Some(*max_priority_fee_per_gas);
            }
            (
                Self::Eip1559 {
                    max_fee_per_gas, ..
                },
                other,
            ) => {
                other.set_gas_price(*max_fee_per_gas);
            }
            (Self::Legacy { gas_price }, t) => {
                t.set_gas_price(*gas_price);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GasPolicy {
        GasPolicy {
            legacy_transactions: false,
            max_fee_per_gas: Some(U256::from(100_000_000_000u64)),
            max_priority_fee_adjustment_factor: 1.5,
            max_allowed_priority_fee_per_gas: Some(U256::from(
                3_000_000_000u64,
            )),
            gas_price_adjustment_factor: 1.2,
            max_allowed_gas_price: Some(U256::from(80_000_000_000u64)),
            priority_adjustment_factor: 1.1,
        }
    }

    #[test]
    fn scale_is_fixed_point() {
        assert_eq!(
            scale(U256::from(1_000u64), 1.1),
            U256::from(1_100u64)
        );
        assert_eq!(scale(U256::from(1_000u64), 1.0), U256::from(1_000u64));
        // large values stay exact, no float precision loss.
        let wei = U256::from(10u64).pow(U256::from(20u64));
        assert_eq!(
            scale(wei, 1.5),
            wei * U256::from(1500u64) / U256::from(1000u64)
        );
    }

    #[test]
    fn eip1559_priority_fee_is_adjusted_and_capped() {
        let price = GasPrice::from_fee_data(
            &policy(),
            U256::from(50_000_000_000u64),
            U256::from(1_000_000_000u64),
        );
        // config cap wins over the RPC max fee; priority = rpc * 1.5.
        assert_eq!(
            price,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(100_000_000_000u64),
                max_priority_fee_per_gas: U256::from(1_500_000_000u64),
            }
        );

        let capped = GasPrice::from_fee_data(
            &policy(),
            U256::from(50_000_000_000u64),
            U256::from(10_000_000_000u64),
        );
        assert_eq!(
            capped,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(100_000_000_000u64),
                max_priority_fee_per_gas: U256::from(3_000_000_000u64),
            }
        );
    }

    #[test]
    fn priority_fee_never_exceeds_fee_cap() {
        let mut low_cap = policy();
        low_cap.max_fee_per_gas = Some(U256::from(1_000_000_000u64));
        low_cap.max_allowed_priority_fee_per_gas = None;
        let price = GasPrice::from_fee_data(
            &low_cap,
            U256::from(50_000_000_000u64),
            U256::from(2_000_000_000u64),
        );
        let GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } = price
        else {
            panic!("expected eip1559 price");
        };
        assert!(max_priority_fee_per_gas <= max_fee_per_gas);
    }

    #[test]
    fn legacy_price_is_adjusted_and_capped() {
        let mut legacy = policy();
        legacy.legacy_transactions = true;
        let price = GasPrice::from_fee_data(
            &legacy,
            U256::from(50_000_000_000u64),
            U256::zero(),
        );
        assert_eq!(
            price,
            GasPrice::Legacy {
                gas_price: U256::from(60_000_000_000u64),
            }
        );
        let capped = GasPrice::from_fee_data(
            &legacy,
            U256::from(90_000_000_000u64),
            U256::zero(),
        );
        assert_eq!(
            capped,
            GasPrice::Legacy {
                gas_price: U256::from(80_000_000_000u64),
            }
        );
    }

    #[test]
    fn bump_scales_every_component() {
        let price = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(100u64),
            max_priority_fee_per_gas: U256::from(10u64),
        };
        assert_eq!(
            price.bump(1.1),
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(110u64),
                max_priority_fee_per_gas: U256::from(11u64),
            }
        );
        let legacy = GasPrice::Legacy {
            gas_price: U256::from(1_000u64),
        };
        assert_eq!(
            legacy.bump(1.1),
            GasPrice::Legacy {
                gas_price: U256::from(1_100u64),
            }
        );
    }
}
