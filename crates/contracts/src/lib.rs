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

//! # Escrow Contracts
//!
//! Bindings for the on-chain surface of the incentivized message escrow,
//! plus the codecs the relayer needs on top of it: the GARP message
//! framing and the mock attestation scheme.

use ethers::contract::abigen;

/// The GARP cross-chain message framing.
pub mod garp;
/// The signed-message attestation scheme of the mock AMB.
pub mod mock_attestation;

abigen!(
    IncentivizedMessageEscrow,
    r#"[
        event BountyPlaced(bytes32 indexed messageIdentifier, uint256 maxGasDelivery, uint256 maxGasAck, address refundGasTo, uint256 priceOfDeliveryGas, uint256 priceOfAckGas, uint256 targetDelta)
        event MessageDelivered(bytes32 indexed messageIdentifier)
        event BountyClaimed(bytes32 indexed messageIdentifier, uint256 gasSpentOnDestination, uint256 gasSpentOnSource, uint256 destinationRelayerReward, uint256 sourceRelayerReward)
        event BountyIncreased(bytes32 indexed messageIdentifier, uint256 newDeliveryGasPrice, uint256 newAckGasPrice)
        event Message(bytes32 destinationIdentifier, bytes recipient, bytes message)
        function processPacket(bytes messagingProtocolContext, bytes rawMessage, bytes32 feeRecipient) payable
    ]"#
);

/// Left-pads an EVM address into the 32-byte form used by the escrow in
/// signed payloads and identifiers.
pub fn address_to_bytes32(address: ethers::types::Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    #[test]
    fn address_padding_is_left_aligned_zeros() {
        let address = Address::from_low_u64_be(0xdead);
        let padded = address_to_bytes32(address);
        assert!(padded[..12].iter().all(|b| *b == 0));
        assert_eq!(&padded[12..], address.as_bytes());
    }
}
