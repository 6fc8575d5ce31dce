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
//! # Getter
//!
//! The per-chain scanner over the incentivized escrow's bounty events.
//! It walks a moving block window below the monitor's tip, decodes the
//! four bounty events and writes them into the store. Transport errors
//! retry forever; a log that fails to decode is skipped.

use std::sync::Arc;
use std::time::Duration;

use ethers::abi::RawLog;
use ethers::contract::EthLogDecode;
use ethers::prelude::EthEvent;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Filter, Log, ValueOrArray, H256};

use escrow_chain_monitor::MonitorHandle;
use escrow_contracts::{
    BountyClaimedFilter, BountyIncreasedFilter, BountyPlacedFilter,
    IncentivizedMessageEscrowEvents, MessageDeliveredFilter,
};
use escrow_relayer_config::GetterConfig;
use escrow_relayer_utils::retry::ConstantWithMaxRetryCount;
use escrow_relayer_utils::Error;
use escrow_relayer_store::records::{
    BountyClaimedEvent, BountyIncreasedEvent, BountyPlacedEvent,
    MessageDeliveredEvent,
};
use escrow_relayer_store::BountyRegistry;

const HANDLE_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_HANDLE_RETRY_COUNT: usize = 5;

/// Computes the next inclusive scan window, bounded by the tip, the
/// per-cycle block cap and the optional stopping block. `None` when
/// there is nothing to scan yet.
pub fn next_window(
    from_block: u64,
    tip: u64,
    max_blocks: u64,
    stopping_block: Option<u64>,
) -> Option<(u64, u64)> {
    let mut to_block = tip.min(from_block.saturating_add(max_blocks));
    if let Some(stop) = stopping_block {
        to_block = to_block.min(stop);
    }
    (to_block >= from_block).then_some((from_block, to_block))
}

/// The per-chain bounty event watcher.
#[derive(typed_builder::TypedBuilder)]
pub struct BountyWatcher<S: BountyRegistry> {
    chain_id: u64,
    escrow_address: Address,
    config: GetterConfig,
    #[builder(setter(into))]
    store: Arc<S>,
    monitor: MonitorHandle,
    client: Arc<Provider<Http>>,
}

impl<S: BountyRegistry> BountyWatcher<S> {
    /// Runs the scan loop. Returns `Ok(())` once the stopping block is
    /// reached; without one, runs until shutdown.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id, address = %self.escrow_address))]
    pub async fn run(mut self) -> escrow_relayer_utils::Result<()> {
        let first = self.monitor.first_status().await?;
        let mut from_block = self
            .config
            .starting_block
            .unwrap_or(first.block_number);
        let signatures = bounty_event_signatures();
        tracing::debug!(
            "starting bounty scan at #{from_block} (tip #{})",
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
                .topic0(ValueOrArray::Array(
                    signatures.iter().copied().map(Some).collect(),
                ))
                .from_block(from)
                .to_block(to);
            let logs = self.get_logs_forever(&filter).await;
            tracing::trace!("Found #{} events in [{from}, {to}]", logs.len());
            for log in logs {
                if let Err(e) = self.handle_log_with_retry(&log).await {
                    // a malformed record must not wedge the scanner.
                    tracing::error!(?e, "Error while handling the event");
                }
            }
            tracing::event!(
                target: escrow_relayer_utils::probe::TARGET,
                tracing::Level::TRACE,
                kind = %escrow_relayer_utils::probe::Kind::Sync,
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

    /// `eth_getLogs` with unbounded retry: the scanner blocks until the
    /// transport recovers, losing nothing.
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
        let transaction_hash = log.transaction_hash.unwrap_or_default();
        let event = IncentivizedMessageEscrowEvents::decode_log(&raw)?;
        use IncentivizedMessageEscrowEvents::*;
        match event {
            BountyPlacedFilter(event) => {
                self.store.register_bounty_placed(BountyPlacedEvent {
                    message_identifier: H256::from(
                        event.message_identifier,
                    ),
                    from_chain_id: self.chain_id,
                    max_gas_delivery: event.max_gas_delivery,
                    max_gas_ack: event.max_gas_ack,
                    refund_gas_to: event.refund_gas_to,
                    price_of_delivery_gas: event.price_of_delivery_gas,
                    price_of_ack_gas: event.price_of_ack_gas,
                    target_delta: event.target_delta,
                    source_address: self.escrow_address,
                    transaction_hash,
                })?;
            }
            MessageDeliveredFilter(event) => {
                self.store.register_message_delivered(
                    MessageDeliveredEvent {
                        message_identifier: H256::from(
                            event.message_identifier,
                        ),
                        to_chain_id: self.chain_id,
                        transaction_hash,
                    },
                )?;
            }
            BountyClaimedFilter(event) => {
                self.store.register_bounty_claimed(BountyClaimedEvent {
                    message_identifier: H256::from(
                        event.message_identifier,
                    ),
                    from_chain_id: self.chain_id,
                    transaction_hash,
                })?;
            }
            BountyIncreasedFilter(event) => {
                self.store.register_bounty_increased(
                    BountyIncreasedEvent {
                        message_identifier: H256::from(
                            event.message_identifier,
                        ),
                        new_delivery_gas_price: event
                            .new_delivery_gas_price,
                        new_ack_gas_price: event.new_ack_gas_price,
                    },
                )?;
            }
            MessageFilter(_) => {
                // the application message stream belongs to the mock
                // collector, not the bounty scanner.
            }
        }
        Ok(())
    }
}

/// The topic0 set of the four bounty events.
pub fn bounty_event_signatures() -> Vec<H256> {
    vec![
        BountyPlacedFilter::signature(),
        MessageDeliveredFilter::signature(),
        BountyClaimedFilter::signature(),
        BountyIncreasedFilter::signature(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::Token;
    use ethers::types::{Bytes, U256};
    use escrow_relayer_store::records::BountyStatus;
    use escrow_relayer_store::InMemoryStore;

    #[test]
    fn windows_cover_the_catchup_range_exactly() {
        // start 100, tip 500, 50 blocks per step: 8 calls.
        let mut from = 100u64;
        let mut windows = Vec::new();
        while let Some((a, b)) = next_window(from, 500, 50, Some(500)) {
            windows.push((a, b));
            from = b + 1;
            if b >= 500 {
                break;
            }
        }
        assert_eq!(windows.len(), 8);
        assert_eq!(windows.first(), Some(&(100, 150)));
        assert_eq!(windows[1], (151, 201));
        assert_eq!(windows.last(), Some(&(457, 500)));
    }

    #[test]
    fn window_is_none_until_the_tip_catches_up() {
        assert_eq!(next_window(100, 99, 50, None), None);
        assert_eq!(next_window(100, 100, 50, None), Some((100, 100)));
    }

    #[test]
    fn stopping_block_clamps_the_window() {
        assert_eq!(next_window(90, 500, 50, Some(100)), Some((90, 100)));
        assert_eq!(next_window(101, 500, 50, Some(100)), None);
    }

    fn watcher(store: Arc<InMemoryStore>) -> BountyWatcher<InMemoryStore> {
        let monitor = escrow_chain_monitor::ChainMonitor::new(
            1,
            Duration::from_millis(10),
        );
        BountyWatcher::builder()
            .chain_id(1)
            .escrow_address(Address::from_low_u64_be(0x5555))
            .config(GetterConfig::default())
            .store(store)
            .monitor(monitor.subscribe())
            .client(Arc::new(
                Provider::try_from("http://localhost:8545").unwrap(),
            ))
            .build()
    }

    fn bounty_placed_log(id: u64) -> Log {
        let data = ethers::abi::encode(&[
            Token::Uint(U256::from(200_000u64)),
            Token::Uint(U256::from(100_000u64)),
            Token::Address(Address::from_low_u64_be(0xf00d)),
            Token::Uint(U256::from(1_000_000_000u64)),
            Token::Uint(U256::from(2_000_000_000u64)),
            Token::Uint(U256::from(3600u64)),
        ]);
        Log {
            address: Address::from_low_u64_be(0x5555),
            topics: vec![
                BountyPlacedFilter::signature(),
                H256::from_low_u64_be(id),
            ],
            data: Bytes::from(data),
            transaction_hash: Some(H256::from_low_u64_be(0x77)),
            ..Default::default()
        }
    }

    #[test]
    fn bounty_placed_logs_reach_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = watcher(store.clone());
        watcher.handle_log(&bounty_placed_log(0xaa)).unwrap();

        let bounty = store
            .get_bounty(&H256::from_low_u64_be(0xaa))
            .unwrap()
            .unwrap();
        assert_eq!(bounty.status, BountyStatus::BountyPlaced);
        assert_eq!(bounty.from_chain_id, Some(1));
        assert_eq!(
            bounty.price_of_delivery_gas,
            Some(U256::from(1_000_000_000u64))
        );
        assert_eq!(
            bounty.submit_transaction_hash,
            Some(H256::from_low_u64_be(0x77))
        );
    }

    #[test]
    fn delivered_logs_advance_the_status() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = watcher(store.clone());
        watcher.handle_log(&bounty_placed_log(0xbb)).unwrap();

        let delivered = Log {
            address: Address::from_low_u64_be(0x5555),
            topics: vec![
                MessageDeliveredFilter::signature(),
                H256::from_low_u64_be(0xbb),
            ],
            data: Bytes::default(),
            transaction_hash: Some(H256::from_low_u64_be(0x88)),
            ..Default::default()
        };
        watcher.handle_log(&delivered).unwrap();

        let bounty = store
            .get_bounty(&H256::from_low_u64_be(0xbb))
            .unwrap()
            .unwrap();
        assert_eq!(bounty.status, BountyStatus::MessageDelivered);
        assert_eq!(
            bounty.exec_transaction_hash,
            Some(H256::from_low_u64_be(0x88))
        );
    }

    #[test]
    fn garbage_logs_are_rejected_not_panicking() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = watcher(store);
        let garbage = Log {
            topics: vec![H256::from_low_u64_be(0xdead)],
            ..Default::default()
        };
        assert!(watcher.handle_log(&garbage).is_err());
    }

    #[tokio::test]
    async fn undecodable_logs_are_not_retried() {
        let store = Arc::new(InMemoryStore::new());
        let watcher = watcher(store);
        let garbage = Log {
            topics: vec![H256::from_low_u64_be(0xdead)],
            ..Default::default()
        };
        // a decode failure is permanent; the retry wrapper must give up
        // well inside one retry interval.
        let verdict = tokio::time::timeout(
            HANDLE_RETRY_INTERVAL / 2,
            watcher.handle_log_with_retry(&garbage),
        )
        .await
        .expect("permanent failures return immediately");
        assert!(verdict.is_err());
    }
}
