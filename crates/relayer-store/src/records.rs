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

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// The 32-byte identifier chosen by the escrow contract, the primary key
/// joining all per-message state.
pub type MessageIdentifier = H256;

/// Serde codec serializing a [`U256`] as a decimal string.
///
/// On-chain quantities are unbounded integers on the wire; they must
/// never pass through floats or hex-with-truncation.
pub mod u256_dec {
    use super::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes the value as its decimal string rendering.
    pub fn serialize<S: Serializer>(
        value: &U256,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserializes a decimal string into the value.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_dec_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// [`u256_dec`] lifted over `Option`.
pub mod u256_dec_opt {
    use super::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes `Some` as a decimal string, `None` as null.
    pub fn serialize<S: Serializer>(
        value: &Option<U256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes a nullable decimal string.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| U256::from_dec_str(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The lifecycle status of a bounty. The ordering is the lifecycle:
/// writes take the maximum, so the status never regresses.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum BountyStatus {
    /// The bounty was placed on the source chain.
    BountyPlaced,
    /// The message was executed on the destination chain.
    MessageDelivered,
    /// The ack was processed and the bounty paid out on the source
    /// chain.
    BountyClaimed,
}

/// The per-message bounty record, the root of the domain graph.
///
/// Most fields are optional: the record may be created sparsely by a
/// destination-side observation before the source-side `BountyPlaced`
/// event has been scanned, and fills in monotonically afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounty {
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The chain the bounty was placed on.
    #[serde(default)]
    pub from_chain_id: Option<u64>,
    /// The chain the message was (or will be) delivered on.
    #[serde(default)]
    pub to_chain_id: Option<u64>,
    /// Gas the bounty pays for on the delivery leg.
    #[serde(default, with = "u256_dec_opt")]
    pub max_gas_delivery: Option<U256>,
    /// Gas the bounty pays for on the ack leg.
    #[serde(default, with = "u256_dec_opt")]
    pub max_gas_ack: Option<U256>,
    /// Where unspent gas refunds go.
    #[serde(default)]
    pub refund_gas_to: Option<Address>,
    /// Unit price committed for delivery gas. Only ever increases.
    #[serde(default, with = "u256_dec_opt")]
    pub price_of_delivery_gas: Option<U256>,
    /// Unit price committed for ack gas. Only ever increases.
    #[serde(default, with = "u256_dec_opt")]
    pub price_of_ack_gas: Option<U256>,
    /// The desired delivery-to-ack time window.
    #[serde(default, with = "u256_dec_opt")]
    pub target_delta: Option<U256>,
    /// Lifecycle status, non-decreasing.
    pub status: BountyStatus,
    /// The application that escrowed the message on the source chain.
    #[serde(default)]
    pub source_address: Option<Address>,
    /// The application the message is addressed to.
    #[serde(default)]
    pub destination_address: Option<Address>,
    /// Whether the bounty is settled from the relayer's point of view.
    #[serde(default)]
    pub finalised: bool,
    /// Source transaction that placed the bounty.
    #[serde(default)]
    pub submit_transaction_hash: Option<H256>,
    /// Destination transaction that executed the delivery.
    #[serde(default)]
    pub exec_transaction_hash: Option<H256>,
    /// Source transaction that processed the ack.
    #[serde(default)]
    pub ack_transaction_hash: Option<H256>,
    /// Gas the relayer spent delivering, as observed in the receipt.
    #[serde(default, with = "u256_dec_opt")]
    pub delivery_gas_cost: Option<U256>,
}

impl Bounty {
    /// An empty record carrying nothing but the identifier, the base of
    /// every partial registration.
    pub fn sparse(message_identifier: MessageIdentifier) -> Self {
        Self {
            message_identifier,
            from_chain_id: None,
            to_chain_id: None,
            max_gas_delivery: None,
            max_gas_ack: None,
            refund_gas_to: None,
            price_of_delivery_gas: None,
            price_of_ack_gas: None,
            target_delta: None,
            status: BountyStatus::BountyPlaced,
            source_address: None,
            destination_address: None,
            finalised: false,
            submit_transaction_hash: None,
            exec_transaction_hash: None,
            ack_transaction_hash: None,
            delivery_gas_cost: None,
        }
    }

    /// The full record constructed from a source-side `BountyPlaced`
    /// observation.
    pub fn placed(event: &BountyPlacedEvent) -> Self {
        Self {
            from_chain_id: Some(event.from_chain_id),
            max_gas_delivery: Some(event.max_gas_delivery),
            max_gas_ack: Some(event.max_gas_ack),
            refund_gas_to: Some(event.refund_gas_to),
            price_of_delivery_gas: Some(event.price_of_delivery_gas),
            price_of_ack_gas: Some(event.price_of_ack_gas),
            target_delta: Some(event.target_delta),
            source_address: Some(event.source_address),
            submit_transaction_hash: Some(event.transaction_hash),
            ..Self::sparse(event.message_identifier)
        }
    }

    /// The sparse record constructed from a destination-side
    /// `MessageDelivered` observation.
    pub fn delivered(event: &MessageDeliveredEvent) -> Self {
        Self {
            to_chain_id: Some(event.to_chain_id),
            status: BountyStatus::MessageDelivered,
            exec_transaction_hash: Some(event.transaction_hash),
            ..Self::sparse(event.message_identifier)
        }
    }

    /// The sparse record constructed from a source-side `BountyClaimed`
    /// observation.
    pub fn claimed(event: &BountyClaimedEvent) -> Self {
        Self {
            from_chain_id: Some(event.from_chain_id),
            status: BountyStatus::BountyClaimed,
            ack_transaction_hash: Some(event.transaction_hash),
            finalised: true,
            ..Self::sparse(event.message_identifier)
        }
    }

    /// Merges an incoming observation into the stored record.
    ///
    /// Status advances to the maximum, populated fields are preserved
    /// over absent ones, the stored side wins when both are populated,
    /// and gas prices take the field-wise maximum.
    pub fn merge(self, incoming: Bounty) -> Bounty {
        fn keep<T>(stored: Option<T>, incoming: Option<T>) -> Option<T> {
            stored.or(incoming)
        }
        fn max_price(
            stored: Option<U256>,
            incoming: Option<U256>,
        ) -> Option<U256> {
            match (stored, incoming) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            }
        }
        Bounty {
            message_identifier: self.message_identifier,
            from_chain_id: keep(self.from_chain_id, incoming.from_chain_id),
            to_chain_id: keep(self.to_chain_id, incoming.to_chain_id),
            max_gas_delivery: keep(
                self.max_gas_delivery,
                incoming.max_gas_delivery,
            ),
            max_gas_ack: keep(self.max_gas_ack, incoming.max_gas_ack),
            refund_gas_to: keep(self.refund_gas_to, incoming.refund_gas_to),
            price_of_delivery_gas: max_price(
                self.price_of_delivery_gas,
                incoming.price_of_delivery_gas,
            ),
            price_of_ack_gas: max_price(
                self.price_of_ack_gas,
                incoming.price_of_ack_gas,
            ),
            target_delta: keep(self.target_delta, incoming.target_delta),
            status: self.status.max(incoming.status),
            source_address: keep(
                self.source_address,
                incoming.source_address,
            ),
            destination_address: keep(
                self.destination_address,
                incoming.destination_address,
            ),
            finalised: self.finalised || incoming.finalised,
            submit_transaction_hash: keep(
                self.submit_transaction_hash,
                incoming.submit_transaction_hash,
            ),
            exec_transaction_hash: keep(
                self.exec_transaction_hash,
                incoming.exec_transaction_hash,
            ),
            ack_transaction_hash: keep(
                self.ack_transaction_hash,
                incoming.ack_transaction_hash,
            ),
            delivery_gas_cost: keep(
                self.delivery_gas_cost,
                incoming.delivery_gas_cost,
            ),
        }
    }
}

/// A source-side `BountyPlaced` observation.
#[derive(Debug, Clone)]
pub struct BountyPlacedEvent {
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The chain the event was observed on.
    pub from_chain_id: u64,
    /// Gas paid for on the delivery leg.
    pub max_gas_delivery: U256,
    /// Gas paid for on the ack leg.
    pub max_gas_ack: U256,
    /// Refund recipient.
    pub refund_gas_to: Address,
    /// Committed delivery gas unit price.
    pub price_of_delivery_gas: U256,
    /// Committed ack gas unit price.
    pub price_of_ack_gas: U256,
    /// Desired delivery-to-ack window.
    pub target_delta: U256,
    /// The escrow contract that emitted the event.
    pub source_address: Address,
    /// The transaction the event was emitted in.
    pub transaction_hash: H256,
}

/// A destination-side `MessageDelivered` observation.
#[derive(Debug, Clone)]
pub struct MessageDeliveredEvent {
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The chain the delivery executed on.
    pub to_chain_id: u64,
    /// The delivery transaction.
    pub transaction_hash: H256,
}

/// A source-side `BountyClaimed` observation.
#[derive(Debug, Clone)]
pub struct BountyClaimedEvent {
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The chain the claim executed on.
    pub from_chain_id: u64,
    /// The ack transaction.
    pub transaction_hash: H256,
}

/// A source-side `BountyIncreased` observation.
#[derive(Debug, Clone)]
pub struct BountyIncreasedEvent {
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The new delivery gas unit price.
    pub new_delivery_gas_price: U256,
    /// The new ack gas unit price.
    pub new_ack_gas_price: U256,
}

/// The raw cross-chain message as observed at the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbMessage {
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The configured tag of the bridge that carries the message.
    pub amb: String,
    /// The chain the message was emitted on.
    pub source_chain: u64,
    /// The chain the message is addressed to.
    pub destination_chain: u64,
    /// The escrow that emitted the message.
    pub source_escrow: Address,
    /// The raw GARP message bytes.
    pub payload: Bytes,
    /// Bridge-specific context needed to recover a failed delivery.
    #[serde(default)]
    pub recovery_context: Option<Bytes>,
    /// Whether the message asked for priority handling.
    #[serde(default)]
    pub priority: bool,
    /// The source block the message was observed in.
    pub block_number: u64,
    /// The source transaction the message was observed in.
    pub transaction_hash: H256,
}

/// The delivery-ready tuple handed to a destination-chain submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbPayload {
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The configured tag of the bridge that carries the message.
    pub amb: String,
    /// The chain to submit on.
    pub destination_chain_id: u64,
    /// The raw GARP message bytes.
    pub message: Bytes,
    /// Proof context the escrow requires, e.g. an encoded signature.
    #[serde(default)]
    pub message_ctx: Option<Bytes>,
    /// Whether the order bypasses the cost evaluation.
    #[serde(default)]
    pub priority: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed_event(id: u64) -> BountyPlacedEvent {
        BountyPlacedEvent {
            message_identifier: H256::from_low_u64_be(id),
            from_chain_id: 1,
            max_gas_delivery: U256::from(200_000u64),
            max_gas_ack: U256::from(200_000u64),
            refund_gas_to: Address::from_low_u64_be(0xf00d),
            price_of_delivery_gas: U256::from(1_000_000_000u64),
            price_of_ack_gas: U256::from(2_000_000_000u64),
            target_delta: U256::from(3600u64),
            source_address: Address::from_low_u64_be(0xeeee),
            transaction_hash: H256::from_low_u64_be(0xdead),
        }
    }

    #[test]
    fn status_ordering_is_the_lifecycle() {
        assert!(BountyStatus::BountyPlaced < BountyStatus::MessageDelivered);
        assert!(
            BountyStatus::MessageDelivered < BountyStatus::BountyClaimed
        );
    }

    #[test]
    fn merge_never_regresses_status() {
        let delivered = Bounty::delivered(&MessageDeliveredEvent {
            message_identifier: H256::from_low_u64_be(1),
            to_chain_id: 2,
            transaction_hash: H256::from_low_u64_be(0xbeef),
        });
        let placed = Bounty::placed(&placed_event(1));
        // delivery arrived first; the late BountyPlaced merge fills the
        // economic fields without lowering the status.
        let merged = delivered.clone().merge(placed);
        assert_eq!(merged.status, BountyStatus::MessageDelivered);
        assert_eq!(merged.to_chain_id, Some(2));
        assert_eq!(merged.from_chain_id, Some(1));
        assert_eq!(
            merged.max_gas_delivery,
            Some(U256::from(200_000u64))
        );
        assert_eq!(
            merged.exec_transaction_hash,
            delivered.exec_transaction_hash
        );
    }

    #[test]
    fn merge_prefers_stored_fields() {
        let mut stored = Bounty::placed(&placed_event(1));
        stored.destination_address = Some(Address::from_low_u64_be(0xaa));
        let mut incoming = Bounty::placed(&placed_event(1));
        incoming.destination_address = Some(Address::from_low_u64_be(0xbb));
        let merged = stored.merge(incoming);
        assert_eq!(
            merged.destination_address,
            Some(Address::from_low_u64_be(0xaa))
        );
    }

    #[test]
    fn merge_takes_max_gas_prices() {
        let stored = Bounty::placed(&placed_event(1));
        let mut incoming = Bounty::placed(&placed_event(1));
        incoming.price_of_delivery_gas = Some(U256::from(5u64));
        incoming.price_of_ack_gas = Some(U256::from(9_000_000_000u64));
        let merged = stored.merge(incoming);
        assert_eq!(
            merged.price_of_delivery_gas,
            Some(U256::from(1_000_000_000u64))
        );
        assert_eq!(
            merged.price_of_ack_gas,
            Some(U256::from(9_000_000_000u64))
        );
    }

    #[test]
    fn bounty_serializes_prices_as_decimal_strings() {
        let bounty = Bounty::placed(&placed_event(1));
        let json = serde_json::to_value(&bounty).unwrap();
        assert_eq!(json["priceOfDeliveryGas"], "1000000000");
        assert_eq!(json["maxGasDelivery"], "200000");
        let back: Bounty = serde_json::from_value(json).unwrap();
        assert_eq!(back, bounty);
    }

    #[test]
    fn amb_payload_roundtrips() {
        let payload = AmbPayload {
            message_identifier: H256::from_low_u64_be(7),
            amb: "mock".into(),
            destination_chain_id: 2,
            message: Bytes::from(vec![1, 2, 3]),
            message_ctx: Some(Bytes::from(vec![9, 9])),
            priority: true,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: AmbPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
