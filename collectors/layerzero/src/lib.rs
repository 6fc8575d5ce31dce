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

#![warn(missing_docs)]
//! # LayerZero Collector
//!
//! Sniffs `PacketSent` events off the LayerZero V2 endpoint, keeps the
//! packets our escrow sent, and indexes them twice: by message
//! identifier and by payload hash. The delivery proof is an endpoint
//! attestation that arrives through a separate path; the payload-hash
//! index is what a later attestation event correlates against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::abi::RawLog;
use ethers::contract::abigen;
use ethers::prelude::EthEvent;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Filter, Log, H256};

use escrow_chain_monitor::MonitorHandle;
use escrow_contracts::garp::GarpMessage;
use escrow_getter::next_window;
use escrow_relayer_config::GetterConfig;
use escrow_relayer_store::records::AmbMessage;
use escrow_relayer_store::{AmbRegistry, BountyRegistry};
use escrow_relayer_utils::retry::ConstantWithMaxRetryCount;
use escrow_relayer_utils::Error;

/// The endpoint packet framing.
pub mod packet;

pub use packet::Packet;

/// The configured tag of this bridge.
pub const AMB_TAG: &str = "layerzero";

const HANDLE_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_HANDLE_RETRY_COUNT: usize = 5;

abigen!(
    LayerZeroEndpointV2,
    r#"[
        event PacketSent(bytes encodedPacket, bytes options, address sendLibrary)
    ]"#
);

/// The per-chain LayerZero endpoint sniffer.
#[derive(typed_builder::TypedBuilder)]
pub struct LayerZeroCollector<S> {
    chain_id: u64,
    /// The escrow whose packets we relay; everything else is ignored.
    incentives_address: Address,
    endpoint_address: Address,
    /// Destination endpoint id to chain id, from the chain configs.
    eid_to_chain: HashMap<u32, u64>,
    config: GetterConfig,
    #[builder(setter(into))]
    store: Arc<S>,
    monitor: MonitorHandle,
    client: Arc<Provider<Http>>,
}

impl<S> LayerZeroCollector<S>
where
    S: AmbRegistry + BountyRegistry,
{
    /// Runs the sniffer's scan loop, same windowing as the getter.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id, amb = AMB_TAG))]
    pub async fn run(mut self) -> escrow_relayer_utils::Result<()> {
        let first = self.monitor.first_status().await?;
        let mut from_block = self
            .config
            .starting_block
            .unwrap_or(first.block_number);
        tracing::debug!(
            "starting packet scan at #{from_block} (tip #{})",
            first.block_number,
        );

        loop {
            let tip = self
                .monitor
                .latest()
                .map(|s| s.block_number)
                .unwrap_or(first.block_number);
            let Some((from, to)) = next_window(
                from_block,
                tip,
                self.config.max_blocks,
                self.config.stopping_block,
            ) else {
                tokio::time::sleep(Duration::from_millis(
                    self.config.processing_interval,
                ))
                .await;
                continue;
            };

            // the endpoint address rides in topics[1], zero-padded.
            let filter = Filter::new()
                .address(self.endpoint_address)
                .topic0(PacketSentFilter::signature())
                .topic1(H256::from(
                    escrow_contracts::address_to_bytes32(
                        self.endpoint_address,
                    ),
                ))
                .from_block(from)
                .to_block(to);
            let logs = self.get_logs_forever(&filter).await;
            for log in logs {
                if let Err(e) = self.handle_log_with_retry(&log).await {
                    tracing::error!(?e, "Error while handling the event");
                }
            }
            tracing::event!(
                target: escrow_relayer_utils::probe::TARGET,
                tracing::Level::TRACE,
                kind = %escrow_relayer_utils::probe::Kind::Collector,
                amb = AMB_TAG,
                chain_id = %self.chain_id,
                %from,
                %to,
            );
            from_block = to + 1;
            if matches!(self.config.stopping_block, Some(stop) if to >= stop)
            {
                tracing::info!("reached stopping block #{to}, exiting");
                self.monitor.close();
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(
                self.config.processing_interval,
            ))
            .await;
        }
    }

    async fn get_logs_forever(&self, filter: &Filter) -> Vec<Log> {
        loop {
            match self.client.get_logs(filter).await {
                Ok(logs) => return logs,
                Err(e) => {
                    tracing::warn!("getLogs failed, will retry: {}", e);
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_interval,
                    ))
                    .await;
                }
            }
        }
    }

    /// Wraps [`Self::handle_log`] in a bounded constant retry: store
    /// hiccups get a few more chances, packets that do not decode are
    /// dropped on the first attempt.
    async fn handle_log_with_retry(
        &self,
        log: &Log,
    ) -> escrow_relayer_utils::Result<()> {
        let backoff = ConstantWithMaxRetryCount::new(
            HANDLE_RETRY_INTERVAL,
            MAX_HANDLE_RETRY_COUNT,
        );
        backoff::future::retry(backoff, || async {
            self.handle_log(log).map_err(|e| {
                if matches!(e, Error::MalformedRecord(_) | Error::Abi(_)) {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        })
        .await
    }

    fn handle_log(&self, log: &Log) -> escrow_relayer_utils::Result<()> {
        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };
        let event = PacketSentFilter::decode_log(&raw)?;
        let packet = Packet::decode(&event.encoded_packet)?;
        if packet.sender != self.incentives_address {
            tracing::trace!(
                sender = ?packet.sender,
                "packet from a foreign application, skipping",
            );
            return Ok(());
        }
        let garp = GarpMessage::decode(&packet.message)?;
        let Some(&destination_chain) =
            self.eid_to_chain.get(&packet.dst_eid)
        else {
            tracing::warn!(
                dst_eid = packet.dst_eid,
                "packet for an unconfigured destination endpoint",
            );
            return Ok(());
        };
        tracing::debug!(
            id = ?garp.message_identifier,
            guid = ?packet.guid,
            %destination_chain,
            "observed endpoint packet",
        );

        let amb = AmbMessage {
            message_identifier: garp.message_identifier,
            amb: AMB_TAG.to_string(),
            source_chain: self.chain_id,
            destination_chain,
            source_escrow: self.incentives_address,
            payload: packet.message.clone(),
            recovery_context: Some(packet.guid.as_bytes().to_vec().into()),
            priority: false,
            block_number: log.block_number.unwrap_or_default().as_u64(),
            transaction_hash: log.transaction_hash.unwrap_or_default(),
        };
        self.store.set_amb(amb.clone())?;
        self.store.register_destination_address(
            garp.message_identifier,
            garp.destination,
        )?;
        // the proof is published once the endpoint attestation shows up;
        // until then the payload hash is the correlation key.
        self.store.set_payload_amb(packet.payload_hash(), amb)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_contracts::garp::CTX_SOURCE_TO_DESTINATION;
    use escrow_relayer_store::InMemoryStore;
    use ethers::abi::Token;
    use ethers::types::Bytes;

    fn collector(
        store: Arc<InMemoryStore>,
    ) -> LayerZeroCollector<InMemoryStore> {
        let monitor = escrow_chain_monitor::ChainMonitor::new(
            1,
            Duration::from_millis(10),
        );
        LayerZeroCollector::builder()
            .chain_id(1)
            .incentives_address(Address::from_low_u64_be(0x5555))
            .endpoint_address(Address::from_low_u64_be(0x6666))
            .eid_to_chain(HashMap::from([(30102u32, 2u64)]))
            .config(GetterConfig::default())
            .store(store)
            .monitor(monitor.subscribe())
            .client(Arc::new(
                Provider::try_from("http://localhost:8545").unwrap(),
            ))
            .build()
    }

    fn packet(sender: Address, id: u64) -> Packet {
        let garp = GarpMessage {
            context: CTX_SOURCE_TO_DESTINATION,
            message_identifier: H256::from_low_u64_be(id),
            sender: Address::from_low_u64_be(0x1111),
            destination: Address::from_low_u64_be(0x2222),
            payload: Bytes::from(vec![0xaa]),
        };
        Packet {
            nonce: 1,
            src_eid: 30101,
            sender,
            dst_eid: 30102,
            receiver: Address::from_low_u64_be(0x7777),
            guid: H256::from_low_u64_be(0xfeed),
            message: Bytes::from(garp.encode()),
        }
    }

    fn packet_sent_log(packet: &Packet) -> Log {
        let data = ethers::abi::encode(&[
            Token::Bytes(packet.encode()),
            Token::Bytes(vec![]),
            Token::Address(Address::from_low_u64_be(0x8888)),
        ]);
        Log {
            address: Address::from_low_u64_be(0x6666),
            topics: vec![PacketSentFilter::signature()],
            data: Bytes::from(data),
            block_number: Some(10u64.into()),
            transaction_hash: Some(H256::from_low_u64_be(0x11)),
            ..Default::default()
        }
    }

    #[test]
    fn escrow_packets_are_indexed_twice() {
        let store = Arc::new(InMemoryStore::new());
        let collector = collector(store.clone());
        let packet = packet(Address::from_low_u64_be(0x5555), 0xaa);

        collector.handle_log(&packet_sent_log(&packet)).unwrap();

        let by_id = store
            .get_amb(&H256::from_low_u64_be(0xaa))
            .unwrap()
            .unwrap();
        assert_eq!(by_id.amb, AMB_TAG);
        assert_eq!(by_id.destination_chain, 2);

        let by_hash = store
            .get_amb_by_payload_hash(&packet.payload_hash())
            .unwrap()
            .unwrap();
        assert_eq!(by_hash.message_identifier, by_id.message_identifier);
    }

    #[test]
    fn foreign_sender_packets_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let collector = collector(store.clone());
        let packet = packet(Address::from_low_u64_be(0x9999), 0xbb);

        collector.handle_log(&packet_sent_log(&packet)).unwrap();
        assert!(store
            .get_amb(&H256::from_low_u64_be(0xbb))
            .unwrap()
            .is_none());
    }

    #[test]
    fn unknown_destination_eid_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let collector = collector(store.clone());
        let mut packet = packet(Address::from_low_u64_be(0x5555), 0xcc);
        packet.dst_eid = 40404;

        collector.handle_log(&packet_sent_log(&packet)).unwrap();
        assert!(store
            .get_amb(&H256::from_low_u64_be(0xcc))
            .unwrap()
            .is_none());
    }
}
