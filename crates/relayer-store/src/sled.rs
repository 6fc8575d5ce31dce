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

use std::path::Path;

use ethers::types::{Address, H256, U256};

use crate::bus::{self, KeyAction, PubSubBus};
use crate::records::{
    AmbMessage, AmbPayload, Bounty, BountyClaimedEvent, BountyIncreasedEvent,
    BountyPlacedEvent, MessageDeliveredEvent, MessageIdentifier,
};
use crate::{AmbRegistry, BountyRegistry, ProofChannel};

const TREE_BOUNTY: &str = "bounty";
const TREE_AMB: &str = "amb";
const TREE_PROOF: &str = "proof";

/// SledStore is the durable store of the relayer, one
/// [Sled](https://sled.rs) tree per record kind, with the pub-sub bus
/// attached.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    bus: PubSubBus,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Create a new SledStore.
    pub fn open<P: AsRef<Path>>(
        path: P,
    ) -> escrow_relayer_utils::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self {
            db,
            bus: PubSubBus::new(),
        })
    }

    /// Creates a temporary SledStore.
    pub fn temporary() -> escrow_relayer_utils::Result<Self> {
        let dir = tempfile::tempdir()?;
        Self::open(dir.path())
    }

    /// The pub-sub bus shared by all workers of the process.
    pub fn bus(&self) -> &PubSubBus {
        &self.bus
    }

    /// Gets the total amount of data stored on disk.
    pub fn get_data_stored_size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or_default()
    }

    /// Merges `incoming` into the stored bounty with a lock-free
    /// read-modify-write, creating the record when absent.
    fn merge_bounty(
        &self,
        incoming: Bounty,
    ) -> escrow_relayer_utils::Result<Bounty> {
        let id = incoming.message_identifier;
        let tree = self.db.open_tree(TREE_BOUNTY)?;
        let merged = loop {
            let current = tree.get(id.as_bytes())?;
            let next = match &current {
                Some(raw) => serde_json::from_slice::<Bounty>(raw)?
                    .merge(incoming.clone()),
                None => incoming.clone(),
            };
            let encoded = serde_json::to_vec(&next)?;
            let swap = tree.compare_and_swap(
                id.as_bytes(),
                current,
                Some(encoded),
            )?;
            if swap.is_ok() {
                break next;
            }
        };
        self.db.flush()?;
        self.bus.notify_key(bus::bounty_key(&id), KeyAction::Set);
        Ok(merged)
    }
}

impl BountyRegistry for SledStore {
    #[tracing::instrument(skip(self, event), fields(id = ?event.message_identifier))]
    fn register_bounty_placed(
        &self,
        event: BountyPlacedEvent,
    ) -> escrow_relayer_utils::Result<Bounty> {
        self.merge_bounty(Bounty::placed(&event))
    }

    #[tracing::instrument(skip(self, event), fields(id = ?event.message_identifier))]
    fn register_message_delivered(
        &self,
        event: MessageDeliveredEvent,
    ) -> escrow_relayer_utils::Result<Bounty> {
        self.merge_bounty(Bounty::delivered(&event))
    }

    #[tracing::instrument(skip(self, event), fields(id = ?event.message_identifier))]
    fn register_bounty_claimed(
        &self,
        event: BountyClaimedEvent,
    ) -> escrow_relayer_utils::Result<Bounty> {
        self.merge_bounty(Bounty::claimed(&event))
    }

    #[tracing::instrument(skip(self, event), fields(id = ?event.message_identifier))]
    fn register_bounty_increased(
        &self,
        event: BountyIncreasedEvent,
    ) -> escrow_relayer_utils::Result<Option<Bounty>> {
        let id = event.message_identifier;
        let tree = self.db.open_tree(TREE_BOUNTY)?;
        let written = loop {
            let current = tree.get(id.as_bytes())?;
            let Some(raw) = &current else {
                // An increase for a bounty we never saw placed carries
                // no other fields worth keeping.
                return Ok(None);
            };
            let stored: Bounty = serde_json::from_slice(raw)?;
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
            let next = Bounty {
                price_of_delivery_gas: Some(next_delivery),
                price_of_ack_gas: Some(next_ack),
                ..stored
            };
            let encoded = serde_json::to_vec(&next)?;
            let swap = tree.compare_and_swap(
                id.as_bytes(),
                current,
                Some(encoded),
            )?;
            if swap.is_ok() {
                break next;
            }
        };
        self.db.flush()?;
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
        self.merge_bounty(record)?;
        Ok(())
    }

    fn register_delivery_cost(
        &self,
        message_identifier: MessageIdentifier,
        gas_cost: U256,
    ) -> escrow_relayer_utils::Result<()> {
        let mut record = Bounty::sparse(message_identifier);
        record.delivery_gas_cost = Some(gas_cost);
        self.merge_bounty(record)?;
        Ok(())
    }

    fn get_bounty(
        &self,
        message_identifier: &MessageIdentifier,
    ) -> escrow_relayer_utils::Result<Option<Bounty>> {
        let tree = self.db.open_tree(TREE_BOUNTY)?;
        tree.get(message_identifier.as_bytes())?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()
            .map_err(Into::into)
    }

    fn bounties(&self) -> escrow_relayer_utils::Result<Vec<Bounty>> {
        let tree = self.db.open_tree(TREE_BOUNTY)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }
}

impl AmbRegistry for SledStore {
    #[tracing::instrument(skip(self, amb), fields(id = ?amb.message_identifier))]
    fn set_amb(&self, amb: AmbMessage) -> escrow_relayer_utils::Result<()> {
        let tree = self.db.open_tree(TREE_AMB)?;
        let id = amb.message_identifier;
        tree.insert(id.as_bytes(), serde_json::to_vec(&amb)?)?;
        self.db.flush()?;
        self.bus.notify_key(bus::amb_key(&id), KeyAction::Set);
        // broadcast the arrival so other workers can react without
        // polling the tree.
        if let Ok(value) = serde_json::to_value(&amb) {
            self.bus.publish(bus::AMB_CHANNEL, value);
        }
        Ok(())
    }

    fn get_amb(
        &self,
        message_identifier: &MessageIdentifier,
    ) -> escrow_relayer_utils::Result<Option<AmbMessage>> {
        let tree = self.db.open_tree(TREE_AMB)?;
        tree.get(message_identifier.as_bytes())?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self, amb), fields(hash = ?payload_hash))]
    fn set_payload_amb(
        &self,
        payload_hash: H256,
        amb: AmbMessage,
    ) -> escrow_relayer_utils::Result<()> {
        let tree = self.db.open_tree(TREE_PROOF)?;
        tree.insert(payload_hash.as_bytes(), serde_json::to_vec(&amb)?)?;
        self.db.flush()?;
        self.bus
            .notify_key(bus::proof_key(&payload_hash), KeyAction::Set);
        Ok(())
    }

    fn get_amb_by_payload_hash(
        &self,
        payload_hash: &H256,
    ) -> escrow_relayer_utils::Result<Option<AmbMessage>> {
        let tree = self.db.open_tree(TREE_PROOF)?;
        tree.get(payload_hash.as_bytes())?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()
            .map_err(Into::into)
    }

    fn ambs_by_transaction_hash(
        &self,
        transaction_hash: &H256,
    ) -> escrow_relayer_utils::Result<Vec<AmbMessage>> {
        let tree = self.db.open_tree(TREE_AMB)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, raw) = entry?;
            let amb: AmbMessage = serde_json::from_slice(&raw)?;
            if amb.transaction_hash == *transaction_hash {
                out.push(amb);
            }
        }
        Ok(out)
    }
}

impl ProofChannel for SledStore {
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
    use ethers::types::Bytes;

    fn placed(id: u64, price: u64) -> BountyPlacedEvent {
        BountyPlacedEvent {
            message_identifier: H256::from_low_u64_be(id),
            from_chain_id: 1,
            max_gas_delivery: U256::from(200_000u64),
            max_gas_ack: U256::from(200_000u64),
            refund_gas_to: Address::from_low_u64_be(0xf00d),
            price_of_delivery_gas: U256::from(price),
            price_of_ack_gas: U256::from(price),
            target_delta: U256::from(3600u64),
            source_address: Address::from_low_u64_be(0xeeee),
            transaction_hash: H256::from_low_u64_be(0xaa00 + id),
        }
    }

    fn delivered(id: u64) -> MessageDeliveredEvent {
        MessageDeliveredEvent {
            message_identifier: H256::from_low_u64_be(id),
            to_chain_id: 2,
            transaction_hash: H256::from_low_u64_be(0xbb00 + id),
        }
    }

    fn claimed(id: u64) -> BountyClaimedEvent {
        BountyClaimedEvent {
            message_identifier: H256::from_low_u64_be(id),
            from_chain_id: 1,
            transaction_hash: H256::from_low_u64_be(0xcc00 + id),
        }
    }

    fn amb_message(id: u64, tx: u64) -> AmbMessage {
        AmbMessage {
            message_identifier: H256::from_low_u64_be(id),
            amb: "mock".into(),
            source_chain: 1,
            destination_chain: 2,
            source_escrow: Address::from_low_u64_be(0x5555),
            payload: Bytes::from(vec![id as u8]),
            recovery_context: None,
            priority: false,
            block_number: 100 + id,
            transaction_hash: H256::from_low_u64_be(tx),
        }
    }

    #[test]
    fn status_is_max_over_any_arrival_order() {
        // every permutation of the three lifecycle writes must converge
        // on the same record.
        let orders: [[u8; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for (n, order) in orders.iter().enumerate() {
            let store = SledStore::temporary().unwrap();
            let id = n as u64 + 1;
            for step in order {
                match step {
                    0 => {
                        store.register_bounty_placed(placed(id, 10)).unwrap();
                    }
                    1 => {
                        store
                            .register_message_delivered(delivered(id))
                            .unwrap();
                    }
                    _ => {
                        store.register_bounty_claimed(claimed(id)).unwrap();
                    }
                }
            }
            let bounty = store
                .get_bounty(&H256::from_low_u64_be(id))
                .unwrap()
                .unwrap();
            assert_eq!(bounty.status, BountyStatus::BountyClaimed);
            assert_eq!(bounty.from_chain_id, Some(1));
            assert_eq!(bounty.to_chain_id, Some(2));
            assert!(bounty.max_gas_delivery.is_some());
            assert!(bounty.submit_transaction_hash.is_some());
            assert!(bounty.exec_transaction_hash.is_some());
            assert!(bounty.ack_transaction_hash.is_some());
        }
    }

    #[test]
    fn delivered_before_placed_creates_sparse_record() {
        let store = SledStore::temporary().unwrap();
        store.register_message_delivered(delivered(9)).unwrap();

        let sparse = store
            .get_bounty(&H256::from_low_u64_be(9))
            .unwrap()
            .unwrap();
        assert_eq!(sparse.status, BountyStatus::MessageDelivered);
        assert_eq!(sparse.to_chain_id, Some(2));
        assert!(sparse.max_gas_delivery.is_none());

        store.register_bounty_placed(placed(9, 10)).unwrap();
        let full = store
            .get_bounty(&H256::from_low_u64_be(9))
            .unwrap()
            .unwrap();
        // the late placement fills the economics without lowering the
        // status.
        assert_eq!(full.status, BountyStatus::MessageDelivered);
        assert_eq!(full.max_gas_delivery, Some(U256::from(200_000u64)));
        assert_eq!(full.from_chain_id, Some(1));
    }

    #[test]
    fn bounty_increase_is_monotone() {
        let store = SledStore::temporary().unwrap();
        store.register_bounty_placed(placed(3, 10)).unwrap();
        for (new_price, expect_write) in
            [(20u64, true), (15, false), (25, true)]
        {
            let written = store
                .register_bounty_increased(BountyIncreasedEvent {
                    message_identifier: H256::from_low_u64_be(3),
                    new_delivery_gas_price: U256::from(new_price),
                    new_ack_gas_price: U256::from(new_price),
                })
                .unwrap();
            assert_eq!(written.is_some(), expect_write);
        }
        let bounty = store
            .get_bounty(&H256::from_low_u64_be(3))
            .unwrap()
            .unwrap();
        assert_eq!(bounty.price_of_delivery_gas, Some(U256::from(25u64)));
        assert_eq!(bounty.price_of_ack_gas, Some(U256::from(25u64)));
    }

    #[test]
    fn increase_without_placed_bounty_is_ignored() {
        let store = SledStore::temporary().unwrap();
        let written = store
            .register_bounty_increased(BountyIncreasedEvent {
                message_identifier: H256::from_low_u64_be(404),
                new_delivery_gas_price: U256::from(10u64),
                new_ack_gas_price: U256::from(10u64),
            })
            .unwrap();
        assert!(written.is_none());
        assert!(store
            .get_bounty(&H256::from_low_u64_be(404))
            .unwrap()
            .is_none());
    }

    #[test]
    fn small_field_registrations_merge_in() {
        let store = SledStore::temporary().unwrap();
        store.register_bounty_placed(placed(4, 10)).unwrap();
        store
            .register_destination_address(
                H256::from_low_u64_be(4),
                Address::from_low_u64_be(0xabcd),
            )
            .unwrap();
        store
            .register_delivery_cost(
                H256::from_low_u64_be(4),
                U256::from(150_000u64),
            )
            .unwrap();
        let bounty = store
            .get_bounty(&H256::from_low_u64_be(4))
            .unwrap()
            .unwrap();
        assert_eq!(
            bounty.destination_address,
            Some(Address::from_low_u64_be(0xabcd))
        );
        assert_eq!(bounty.delivery_gas_cost, Some(U256::from(150_000u64)));
        // the placed fields survived the partial updates.
        assert_eq!(bounty.status, BountyStatus::BountyPlaced);
        assert_eq!(bounty.max_gas_ack, Some(U256::from(200_000u64)));
    }

    #[test]
    fn amb_lookup_by_transaction_hash() {
        let store = SledStore::temporary().unwrap();
        store.set_amb(amb_message(1, 0x77)).unwrap();
        store.set_amb(amb_message(2, 0x77)).unwrap();
        store.set_amb(amb_message(3, 0x88)).unwrap();

        let found = store
            .ambs_by_transaction_hash(&H256::from_low_u64_be(0x77))
            .unwrap();
        assert_eq!(found.len(), 2);
        let found = store
            .ambs_by_transaction_hash(&H256::from_low_u64_be(0x99))
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn payload_hash_index_roundtrips() {
        let store = SledStore::temporary().unwrap();
        let hash = H256::from_low_u64_be(0x1234);
        store.set_payload_amb(hash, amb_message(5, 0x55)).unwrap();
        let found = store.get_amb_by_payload_hash(&hash).unwrap().unwrap();
        assert_eq!(found.message_identifier, H256::from_low_u64_be(5));
        // the primary index is untouched by the secondary write.
        assert!(store
            .get_amb(&H256::from_low_u64_be(5))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn submit_proof_reaches_the_destination_channel() {
        let store = SledStore::temporary().unwrap();
        let mut rx = store.subscribe_proofs(2);
        let payload = AmbPayload {
            message_identifier: H256::from_low_u64_be(1),
            amb: "mock".into(),
            destination_chain_id: 2,
            message: Bytes::from(vec![1]),
            message_ctx: None,
            priority: false,
        };
        store.submit_proof(2, &payload).unwrap();
        let raw = rx.recv().await.unwrap();
        let got: AmbPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(got, payload);
    }
}
