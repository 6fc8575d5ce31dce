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

//! The profitability gate in front of the submit queue.
//!
//! A bounty is worth relaying when it pays for the gas the delivery
//! will consume: the simulation estimate must fit in the gas the bounty
//! covers, and the unit price the bounty committed must match what the
//! destination chain currently charges. Priority orders skip the price
//! check; the pipeline's simulation still gates them.

use ethers::types::U256;

use escrow_relayer_store::records::Bounty;

/// Decides whether a delivery is worth submitting.
pub fn should_relay(
    bounty: &Bounty,
    gas_estimate: U256,
    destination_gas_price: U256,
    priority: bool,
) -> bool {
    if priority {
        return true;
    }
    let (Some(max_gas_delivery), Some(price_of_delivery_gas)) =
        (bounty.max_gas_delivery, bounty.price_of_delivery_gas)
    else {
        // a sparse bounty has no economics to evaluate against.
        return false;
    };
    gas_estimate <= max_gas_delivery
        && price_of_delivery_gas >= destination_gas_price
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    fn bounty(max_gas: u64, price: u64) -> Bounty {
        let mut bounty = Bounty::sparse(H256::from_low_u64_be(1));
        bounty.max_gas_delivery = Some(U256::from(max_gas));
        bounty.price_of_delivery_gas = Some(U256::from(price));
        bounty
    }

    #[test]
    fn covered_and_priced_deliveries_pass() {
        let b = bounty(200_000, 2_000_000_000);
        assert!(should_relay(
            &b,
            U256::from(150_000u64),
            U256::from(1_500_000_000u64),
            false,
        ));
    }

    #[test]
    fn over_budget_gas_fails() {
        let b = bounty(100_000, 2_000_000_000);
        assert!(!should_relay(
            &b,
            U256::from(150_000u64),
            U256::from(1_000_000_000u64),
            false,
        ));
    }

    #[test]
    fn underpriced_bounty_fails() {
        let b = bounty(200_000, 1_000_000_000);
        assert!(!should_relay(
            &b,
            U256::from(150_000u64),
            U256::from(2_000_000_000u64),
            false,
        ));
    }

    #[test]
    fn sparse_bounty_fails() {
        let b = Bounty::sparse(H256::from_low_u64_be(1));
        assert!(!should_relay(
            &b,
            U256::from(1u64),
            U256::from(1u64),
            false,
        ));
    }

    #[test]
    fn priority_bypasses_the_cost_check() {
        let b = bounty(1, 1);
        assert!(should_relay(
            &b,
            U256::from(1_000_000u64),
            U256::from(u64::MAX),
            true,
        ));
    }
}
