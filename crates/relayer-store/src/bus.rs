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

//! The pub-sub side of the store.
//!
//! Channels carry JSON values and are best-effort per subscriber: a slow
//! subscriber drops messages, durability lives on the key/value side.
//! Channel and key names follow the `relayer:<name>` layout of the
//! deployment schema.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::records::MessageIdentifier;

/// Namespace prefix shared by every channel and key.
pub const PREFIX: &str = "relayer:";
/// The proof arrival broadcast channel.
pub const AMB_CHANNEL: &str = "amb";
/// The generic change-notification channel.
pub const KEY_CHANNEL: &str = "key";

const CHANNEL_CAPACITY: usize = 512;

/// The submitter request stream of a chain.
pub fn submit_channel(chain_id: u64) -> String {
    format!("submit-{chain_id}")
}

/// The notification key of a bounty record.
pub fn bounty_key(message_identifier: &MessageIdentifier) -> String {
    format!("{PREFIX}bounty:{message_identifier:?}")
}

/// The notification key of an AMB message record.
pub fn amb_key(message_identifier: &MessageIdentifier) -> String {
    format!("{PREFIX}amb:{message_identifier:?}")
}

/// The notification key of a proof index record.
pub fn proof_key(payload_hash: &ethers::types::H256) -> String {
    format!("{PREFIX}proof:{payload_hash:?}")
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    /// The key was written.
    Set,
    /// The key was deleted.
    Del,
}

/// The payload of the `key` channel, letting subscribers react to
/// arbitrary state changes without polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyNotification {
    /// The full key that changed.
    pub key: String,
    /// What happened to it.
    pub action: KeyAction,
}

/// An in-process pub-sub bus over named broadcast channels.
///
/// The write (`set` then `publish`) pair is ordered but not atomic:
/// a racing subscriber may read the pre-update value.
#[derive(Clone, Default)]
pub struct PubSubBus {
    channels:
        Arc<RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>>,
}

impl std::fmt::Debug for PubSubBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubBus").finish()
    }
}

impl PubSubBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<serde_json::Value> {
        let full = format!("{PREFIX}{channel}");
        if let Some(sender) = self.channels.read().get(&full) {
            return sender.clone();
        }
        let mut guard = self.channels.write();
        guard
            .entry(full)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publishes a JSON value on a channel, returning how many
    /// subscribers it reached.
    pub fn publish(&self, channel: &str, value: serde_json::Value) -> usize {
        let sender = self.sender(channel);
        let receivers = sender.send(value).unwrap_or(0);
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::TRACE,
            kind = %escrow_relayer_utils::probe::Kind::Bus,
            %channel,
            %receivers,
        );
        receivers
    }

    /// Subscribes to a channel. Messages published before the
    /// subscription are not replayed.
    pub fn subscribe(
        &self,
        channel: &str,
    ) -> broadcast::Receiver<serde_json::Value> {
        self.sender(channel).subscribe()
    }

    /// Publishes a `key` notification for a write or delete.
    pub fn notify_key(&self, key: String, action: KeyAction) {
        if let Ok(value) =
            serde_json::to_value(KeyNotification { key, action })
        {
            self.publish(KEY_CHANNEL, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_only_the_named_channel() {
        let bus = PubSubBus::new();
        let mut submit_2 = bus.subscribe(&submit_channel(2));
        let mut submit_3 = bus.subscribe(&submit_channel(3));

        bus.publish(&submit_channel(2), serde_json::json!({"x": 1}));

        let got = submit_2.recv().await.unwrap();
        assert_eq!(got["x"], 1);
        assert!(submit_3.try_recv().is_err());
    }

    #[tokio::test]
    async fn key_notifications_roundtrip() {
        let bus = PubSubBus::new();
        let mut keys = bus.subscribe(KEY_CHANNEL);
        let id = ethers::types::H256::from_low_u64_be(5);
        bus.notify_key(bounty_key(&id), KeyAction::Set);

        let raw = keys.recv().await.unwrap();
        let note: KeyNotification = serde_json::from_value(raw).unwrap();
        assert_eq!(note.action, KeyAction::Set);
        assert!(note.key.starts_with("relayer:bounty:0x"));
    }

    #[test]
    fn subscribers_before_publish_see_messages_after() {
        let bus = PubSubBus::new();
        let mut rx = bus.subscribe(AMB_CHANNEL);
        assert_eq!(bus.publish(AMB_CHANNEL, serde_json::json!(42)), 1);
        assert_eq!(rx.try_recv().unwrap(), serde_json::json!(42));
        // no subscribers on an unrelated channel.
        assert_eq!(bus.publish("other", serde_json::json!(1)), 0);
    }
}
