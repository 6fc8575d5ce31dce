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

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use parking_lot::RwLock;

use crate::bus::{self, KeyAction, PubSubBus};
use crate::records::{
    AmbMessage, AmbPayload, Bounty, BountyClaimedEvent, BountyIncreasedEvent,
    BountyPlacedEvent, MessageDeliveredEvent, MessageIdentifier,
};
use crate::{AmbRegistry, BountyRegistry, ProofChannel};

/// InMemoryStore keeps the relayer state in process memory. Same trait
/// surface as the sled store, used by tests and dry runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    bounties: Arc<RwLock<HashMap<MessageIdentifier, Bounty>>>,
    ambs: Arc<RwLock<HashMap<MessageIdentifier, AmbMessage>>>,
    proofs: Arc<RwLock<HashMap<H256, AmbMessage>>>,
    bus: PubSubBus,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The pub-sub bus shared by all workers of the process.
    pub fn bus(&self) -> &PubSubBus {
        &self.bus
    }

    fn merge_bounty(&self, incoming: Bounty) -> Bounty {
        let id = incoming.message_identifier;
        let merged = {
            let mut guard = self.bounties.write();
            let next = match guard.remove(&id) {
                Some(stored) => stored.merge(incoming),
                None => incoming,
            };
            guard.insert(id, next.clone());
            next
        };
        self.bus.notify_key(bus::bounty_key(&id), KeyAction::Set);
        merged
    }
}

impl BountyRegistry for InMemoryStore {
    fn register_bounty_placed(
        &self,
        event: BountyPlacedEvent,
    ) -> escrow_relayer_utils::Result<Bounty> {
        Ok(self.merge_bounty(Bounty::placed(&event)))
    }

    fn register_message_delivered(
        &self,
        event: MessageDeliveredEvent,
    ) -> escrow_relayer_utils::Result<Bounty> {
        Ok(self.merge_bounty(Bounty::delivered(&event)))
    }

    fn register_bounty_claimed(
        &self,
        event: BountyClaimedEvent,
    ) -> escrow_relayer_utils::Result<Bounty> {
        Ok(self.merge_bounty(Bounty::claimed(&event)))
    }

    fn register_bounty_increased(
        &self,
        event: BountyIncreasedEvent,
    ) -> escrow_relayer_utils::Result<Option<Bounty>> {
        let id = event.message_identifier;
        let written = {
            let mut guard = self.bounties.write();
            let Some(stored) = guard.get_mut(&id) else {
                return Ok(None);
            };
            let next_delivery = stored
                .price_of_delivery_gas
                .map_or(event.new_delivery_gas_price, |p| {
                    p.max(event.new_delivery_gas_price)
                });
            let next_ack = stored
                .price_of_ack_gas
                .map_or(event.new_ack_gas_price, |p| {
                    p.max(event.new_ack_gas_price)
                });
            let increased = stored.price_of_delivery_gas
                != Some(next_delivery)
                || stored.price_of_ack_gas != Some(next_ack);
            if !increased {
                return Ok(None);
            }
            stored.price_of_delivery_gas = Some(next_delivery);
            stored.price_of_ack_gas = Some(next_ack);
            stored.clone()
        };
        self.bus.notify_key(bus::bounty_key(&id), KeyAction::Set);
        Ok(Some(written))
    }

    fn register_destination_address(
        &self,
        message_identifier: MessageIdentifier,
        destination: Address,
    ) -> escrow_relayer_utils::Result<()> {
        let mut record = Bounty::sparse(message_identifier);
        record.destination_address = Some(destination);
        self.merge_bounty(record);
        Ok(())
    }

    fn register_delivery_cost(
        &self,
        message_identifier: MessageIdentifier,
        gas_cost: U256,
    ) -> escrow_relayer_utils::Result<()> {
        let mut record = Bounty::sparse(message_identifier);
        record.delivery_gas_cost = Some(gas_cost);
        self.merge_bounty(record);
        Ok(())
    }

    fn get_bounty(
        &self,
        message_identifier: &MessageIdentifier,
    ) -> escrow_relayer_utils::Result<Option<Bounty>> {
        Ok(self.bounties.read().get(message_identifier).cloned())
    }

    fn bounties(&self) -> escrow_relayer_utils::Result<Vec<Bounty>> {
        Ok(self.bounties.read().values().cloned().collect())
    }
}

impl AmbRegistry for InMemoryStore {
    fn set_amb(&self, amb: AmbMessage) -> escrow_relayer_utils::Result<()> {
        let id = amb.message_identifier;
        self.ambs.write().insert(id, amb.clone());
        self.bus.notify_key(bus::amb_key(&id), KeyAction::Set);
        if let Ok(value) = serde_json::to_value(&amb) {
            self.bus.publish(bus::AMB_CHANNEL, value);
        }
        Ok(())
    }

    fn get_amb(
        &self,
        message_identifier: &MessageIdentifier,
    ) -> escrow_relayer_utils::Result<Option<AmbMessage>> {
        Ok(self.ambs.read().get(message_identifier).cloned())
    }

    fn set_payload_amb(
        &self,
        payload_hash: H256,
        amb: AmbMessage,
    ) -> escrow_relayer_utils::Result<()> {
        self.proofs.write().insert(payload_hash, amb);
        self.bus
            .notify_key(bus::proof_key(&payload_hash), KeyAction::Set);
        Ok(())
    }

    fn get_amb_by_payload_hash(
        &self,
        payload_hash: &H256,
    ) -> escrow_relayer_utils::Result<Option<AmbMessage>> {
        Ok(self.proofs.read().get(payload_hash).cloned())
    }

    fn ambs_by_transaction_hash(
        &self,
        transaction_hash: &H256,
    ) -> escrow_relayer_utils::Result<Vec<AmbMessage>> {
        Ok(self
            .ambs
            .read()
            .values()
            .filter(|amb| amb.transaction_hash == *transaction_hash)
            .cloned()
            .collect())
    }
}

impl ProofChannel for InMemoryStore {
    fn submit_proof(
        &self,
        destination_chain_id: u64,
        payload: &AmbPayload,
    ) -> escrow_relayer_utils::Result<()> {
        let value = serde_json::to_value(payload)?;
        self.bus
            .publish(&bus::submit_channel(destination_chain_id), value);
        Ok(())
    }

    fn subscribe_proofs(
        &self,
        chain_id: u64,
    ) -> tokio::sync::broadcast::Receiver<serde_json::Value> {
        self.bus.subscribe(&bus::submit_channel(chain_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::BountyStatus;

    #[test]
    fn memory_store_mirrors_sled_semantics() {
        let store = InMemoryStore::new();
        store
            .register_message_delivered(MessageDeliveredEvent {
                message_identifier: H256::from_low_u64_be(1),
                to_chain_id: 2,
                transaction_hash: H256::from_low_u64_be(0xbe),
            })
            .unwrap();
        store
            .register_bounty_placed(BountyPlacedEvent {
                message_identifier: H256::from_low_u64_be(1),
                from_chain_id: 1,
                max_gas_delivery: U256::from(100u64),
                max_gas_ack: U256::from(100u64),
                refund_gas_to: Address::from_low_u64_be(1),
                price_of_delivery_gas: U256::from(10u64),
                price_of_ack_gas: U256::from(10u64),
                target_delta: U256::zero(),
                source_address: Address::from_low_u64_be(2),
                transaction_hash: H256::from_low_u64_be(0xaf),
            })
            .unwrap();
        let bounty = store
            .get_bounty(&H256::from_low_u64_be(1))
            .unwrap()
            .unwrap();
        assert_eq!(bounty.status, BountyStatus::MessageDelivered);
        assert_eq!(bounty.max_gas_delivery, Some(U256::from(100u64)));
    }
}
