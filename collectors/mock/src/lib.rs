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
//! # Mock Collector
//!
//! The reference AMB: the escrow itself emits `Message` events, and the
//! proof the destination escrow accepts is an ECDSA signature from the
//! configured attestation key. The collector scans those events, stores
//! the message, signs it and publishes the delivery-ready payload to the
//! destination chain's submitter.

use std::sync::Arc;
use std::time::Duration;

use ethers::abi::RawLog;
use ethers::contract::EthLogDecode;
use ethers::prelude::EthEvent;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Filter, Log, H256, U256};

use escrow_chain_monitor::MonitorHandle;
use escrow_contracts::garp::GarpMessage;
use escrow_contracts::{
    mock_attestation, IncentivizedMessageEscrowEvents, MessageFilter,
};
use escrow_getter::next_window;
use escrow_relayer_config::GetterConfig;
use escrow_relayer_store::records::{AmbMessage, AmbPayload};
use escrow_relayer_store::{AmbRegistry, BountyRegistry, ProofChannel};
use escrow_relayer_utils::retry::ConstantWithMaxRetryCount;
use escrow_relayer_utils::Error;

/// The configured tag of this bridge.
pub const AMB_TAG: &str = "mock";

const HANDLE_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_HANDLE_RETRY_COUNT: usize = 5;

/// The per-chain mock bridge collector.
#[derive(typed_builder::TypedBuilder)]
pub struct MockCollector<S> {
    chain_id: u64,
    escrow_address: Address,
    signer: LocalWallet,
    config: GetterConfig,
    #[builder(setter(into))]
    store: Arc<S>,
    monitor: MonitorHandle,
    client: Arc<Provider<Http>>,
}

impl<S> MockCollector<S>
where
    S: AmbRegistry + BountyRegistry + ProofChannel,
{
    /// Runs the collector's scan loop, same windowing as the getter.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id, amb = AMB_TAG))]
    pub async fn run(mut self) -> escrow_relayer_utils::Result<()> {
        let first = self.monitor.first_status().await?;
        let mut from_block = self
            .config
            .starting_block
            .unwrap_or(first.block_number);
        tracing::debug!(
            "starting message scan at #{from_block} (tip #{})",
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

            let filter = Filter::new()
                .address(self.escrow_address)
                .topic0(MessageFilter::signature())
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
    /// hiccups get a few more chances, records that do not decode are
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
        let event = IncentivizedMessageEscrowEvents::decode_log(&raw)?;
        let IncentivizedMessageEscrowEvents::MessageFilter(message) = event
        else {
            return Ok(());
        };
        self.handle_message(
            message,
            log.block_number.unwrap_or_default().as_u64(),
            log.transaction_hash.unwrap_or_default(),
        )
    }

    fn handle_message(
        &self,
        event: MessageFilter,
        block_number: u64,
        transaction_hash: H256,
    ) -> escrow_relayer_utils::Result<()> {
        let garp = GarpMessage::decode(&event.message)?;
        let destination_chain =
            chain_id_from_identifier(event.destination_identifier);
        tracing::debug!(
            id = ?garp.message_identifier,
            %destination_chain,
            "observed escrow message",
        );

        self.store.set_amb(AmbMessage {
            message_identifier: garp.message_identifier,
            amb: AMB_TAG.to_string(),
            source_chain: self.chain_id,
            destination_chain,
            source_escrow: self.escrow_address,
            payload: event.message.clone(),
            recovery_context: None,
            priority: false,
            block_number,
            transaction_hash,
        })?;
        self.store.register_destination_address(
            garp.message_identifier,
            garp.destination,
        )?;

        let context = mock_attestation::sign(
            &self.signer,
            self.escrow_address,
            &event.message,
        )?;
        self.store.submit_proof(
            destination_chain,
            &AmbPayload {
                message_identifier: garp.message_identifier,
                amb: AMB_TAG.to_string(),
                destination_chain_id: destination_chain,
                message: event.message,
                message_ctx: Some(context),
                priority: false,
            },
        )?;
        Ok(())
    }
}

/// The low 64 bits of a bytes32 chain identifier.
fn chain_id_from_identifier(identifier: [u8; 32]) -> u64 {
    U256::from_big_endian(&identifier).low_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_contracts::garp::CTX_SOURCE_TO_DESTINATION;
    use escrow_relayer_store::InMemoryStore;
    use ethers::abi::Token;
    use ethers::types::Bytes;

    const SIGNER_KEY: &str =
        "0x0000000000000000000000000000000000000000000000000000000000000042";

    fn collector(
        store: Arc<InMemoryStore>,
    ) -> MockCollector<InMemoryStore> {
        let monitor = escrow_chain_monitor::ChainMonitor::new(
            1,
            Duration::from_millis(10),
        );
        MockCollector::builder()
            .chain_id(1)
            .escrow_address(Address::from_low_u64_be(0x5555))
            .signer(SIGNER_KEY.parse().unwrap())
            .config(GetterConfig::default())
            .store(store)
            .monitor(monitor.subscribe())
            .client(Arc::new(
                Provider::try_from("http://localhost:8545").unwrap(),
            ))
            .build()
    }

    fn garp_bytes(id: u64) -> Vec<u8> {
        GarpMessage {
            context: CTX_SOURCE_TO_DESTINATION,
            message_identifier: H256::from_low_u64_be(id),
            sender: Address::from_low_u64_be(0x1111),
            destination: Address::from_low_u64_be(0x2222),
            payload: Bytes::from(vec![0xab, 0xcd]),
        }
        .encode()
    }

    fn message_log(id: u64, destination_chain: u64) -> Log {
        let data = ethers::abi::encode(&[
            Token::FixedBytes(
                H256::from_low_u64_be(destination_chain)
                    .as_bytes()
                    .to_vec(),
            ),
            Token::Bytes(
                Address::from_low_u64_be(0x2222).as_bytes().to_vec(),
            ),
            Token::Bytes(garp_bytes(id)),
        ]);
        Log {
            address: Address::from_low_u64_be(0x5555),
            topics: vec![MessageFilter::signature()],
            data: Bytes::from(data),
            block_number: Some(42u64.into()),
            transaction_hash: Some(H256::from_low_u64_be(0x99)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn message_events_store_and_publish_a_signed_payload() {
        let store = Arc::new(InMemoryStore::new());
        let mut proofs = store.subscribe_proofs(2);
        let collector = collector(store.clone());

        collector.handle_log(&message_log(0xaa, 2)).unwrap();

        // the raw message is stored under its identifier.
        let amb = store
            .get_amb(&H256::from_low_u64_be(0xaa))
            .unwrap()
            .unwrap();
        assert_eq!(amb.amb, AMB_TAG);
        assert_eq!(amb.destination_chain, 2);
        assert_eq!(amb.block_number, 42);

        // the destination application landed on the bounty record.
        let bounty = store
            .get_bounty(&H256::from_low_u64_be(0xaa))
            .unwrap()
            .unwrap();
        assert_eq!(
            bounty.destination_address,
            Some(Address::from_low_u64_be(0x2222))
        );

        // the published payload carries a recoverable signature over
        // the escrow-bound message.
        let raw = proofs.recv().await.unwrap();
        let payload: AmbPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.destination_chain_id, 2);
        let signer: LocalWallet = SIGNER_KEY.parse().unwrap();
        let recovered = mock_attestation::recover(
            Address::from_low_u64_be(0x5555),
            &payload.message,
            payload.message_ctx.as_ref().unwrap(),
        )
        .unwrap();
        assert_eq!(recovered, ethers::signers::Signer::address(&signer));
    }

    #[test]
    fn non_message_events_are_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let collector = collector(store.clone());
        let log = Log {
            topics: vec![
                escrow_contracts::MessageDeliveredFilter::signature(),
                H256::from_low_u64_be(1),
            ],
            ..Default::default()
        };
        collector.handle_log(&log).unwrap();
        assert!(store.get_amb(&H256::from_low_u64_be(1)).unwrap().is_none());
    }
}
