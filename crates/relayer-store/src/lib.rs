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

//! # Relayer Store Module
//!
//! The store is the single cross-worker integration point of the relayer:
//! a durable key/value side holding the per-message state (bounties, AMB
//! messages, proofs) and a best-effort pub-sub side the workers use as a
//! message bus.
//!
//! Every write merges into the existing record; populated fields are
//! never cleared and the bounty status only ever advances.

use ethers::types::{Address, H256, U256};

use records::{
    AmbMessage, AmbPayload, Bounty, BountyClaimedEvent, BountyIncreasedEvent,
    BountyPlacedEvent, MessageDeliveredEvent, MessageIdentifier,
};

/// The in-process pub-sub bus and its channel naming.
pub mod bus;
/// A module for managing in-memory storage of the relayer.
pub mod mem;
/// The domain records shared by all workers.
pub mod records;
/// A module for setting up and managing a [Sled](https://sled.rs)-based
/// database.
pub mod sled;

pub use bus::{KeyAction, KeyNotification, PubSubBus};
pub use mem::InMemoryStore;
pub use sled::SledStore;

/// The typed operations over the per-message bounty records.
///
/// All operations are merge-safe: concurrent writers on different chains
/// (the source getter placing the bounty, the destination getter
/// observing the delivery) may interleave arbitrarily without losing
/// fields or regressing the status.
pub trait BountyRegistry: Send + Sync {
    /// Create-or-merge the bounty for a `BountyPlaced` event. On
    /// conflict, the stored record's populated fields win over the
    /// freshly constructed ones.
    fn register_bounty_placed(
        &self,
        event: BountyPlacedEvent,
    ) -> escrow_relayer_utils::Result<Bounty>;

    /// Advance the status to at least `MessageDelivered` and fill the
    /// execution transaction hash and destination chain. Creates a
    /// sparse record when the source event was missed.
    fn register_message_delivered(
        &self,
        event: MessageDeliveredEvent,
    ) -> escrow_relayer_utils::Result<Bounty>;

    /// Advance the status to `BountyClaimed` and fill the ack
    /// transaction hash. Creates a sparse record when the source event
    /// was missed.
    fn register_bounty_claimed(
        &self,
        event: BountyClaimedEvent,
    ) -> escrow_relayer_utils::Result<Bounty>;

    /// Raise the gas prices to the field-wise maximum. Only writes when
    /// at least one price strictly increased; returns the stored record
    /// when it did.
    fn register_bounty_increased(
        &self,
        event: BountyIncreasedEvent,
    ) -> escrow_relayer_utils::Result<Option<Bounty>>;

    /// Record the destination application address of a message.
    fn register_destination_address(
        &self,
        message_identifier: MessageIdentifier,
        destination: Address,
    ) -> escrow_relayer_utils::Result<()>;

    /// Record the gas spent delivering a message. Ack submissions do not
    /// register cost.
    fn register_delivery_cost(
        &self,
        message_identifier: MessageIdentifier,
        gas_cost: U256,
    ) -> escrow_relayer_utils::Result<()>;

    /// Get the bounty stored for a message, if any.
    fn get_bounty(
        &self,
        message_identifier: &MessageIdentifier,
    ) -> escrow_relayer_utils::Result<Option<Bounty>>;

    /// Scan all stored bounties.
    fn bounties(&self) -> escrow_relayer_utils::Result<Vec<Bounty>>;
}

/// The typed operations over observed AMB messages.
pub trait AmbRegistry: Send + Sync {
    /// Store a message by its identifier.
    fn set_amb(&self, amb: AmbMessage) -> escrow_relayer_utils::Result<()>;

    /// Get a message by its identifier.
    fn get_amb(
        &self,
        message_identifier: &MessageIdentifier,
    ) -> escrow_relayer_utils::Result<Option<AmbMessage>>;

    /// Store the secondary payload-hash index entry for a message. Used
    /// by collectors whose attestation arrives detached from the packet.
    fn set_payload_amb(
        &self,
        payload_hash: H256,
        amb: AmbMessage,
    ) -> escrow_relayer_utils::Result<()>;

    /// Look a message up through the payload-hash index.
    fn get_amb_by_payload_hash(
        &self,
        payload_hash: &H256,
    ) -> escrow_relayer_utils::Result<Option<AmbMessage>>;

    /// All messages observed in a given source transaction. Serves the
    /// `getAMBs` HTTP query.
    fn ambs_by_transaction_hash(
        &self,
        transaction_hash: &H256,
    ) -> escrow_relayer_utils::Result<Vec<AmbMessage>>;
}

/// Publishing and subscribing to deliverable proofs, keyed by
/// destination chain.
pub trait ProofChannel: Send + Sync {
    /// Publish a delivery-ready payload to the submitter of the
    /// destination chain.
    fn submit_proof(
        &self,
        destination_chain_id: u64,
        payload: &AmbPayload,
    ) -> escrow_relayer_utils::Result<()>;

    /// Subscribe to the proof stream of a chain.
    fn subscribe_proofs(
        &self,
        chain_id: u64,
    ) -> tokio::sync::broadcast::Receiver<serde_json::Value>;
}
