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
//! # Chain Monitor
//!
//! One long-running task per chain polls the RPC for the latest block
//! height and broadcasts it to every subscribed worker. Scanners never
//! query the tip themselves.

use std::sync::Arc;
use std::time::Duration;

use ethers::providers::Middleware;
use tokio::sync::watch;

/// A tip observation broadcast to the workers of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStatus {
    /// The latest block number reported by the RPC.
    pub block_number: u64,
}

/// The per-chain block height broadcaster.
pub struct ChainMonitor {
    chain_id: u64,
    polling_interval: Duration,
    sender: watch::Sender<Option<MonitorStatus>>,
}

impl ChainMonitor {
    /// Creates a monitor for a chain.
    pub fn new(chain_id: u64, polling_interval: Duration) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            chain_id,
            polling_interval,
            sender,
        }
    }

    /// Opens a subscription port. Ports opened before `run` starts see
    /// the first status.
    pub fn subscribe(&self) -> MonitorHandle {
        MonitorHandle {
            rx: Some(self.sender.subscribe()),
        }
    }

    /// Pushes a tip observation to all ports. Exposed for the polling
    /// loop and for tests.
    pub fn broadcast(&self, block_number: u64) {
        self.sender
            .send_if_modified(|current| {
                let next = MonitorStatus { block_number };
                if *current == Some(next) {
                    false
                } else {
                    *current = Some(next);
                    true
                }
            });
    }

    /// Polls the RPC forever, broadcasting each new tip. Transport
    /// errors retry with a constant backoff.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn run<M: Middleware + 'static>(
        self,
        client: Arc<M>,
    ) -> escrow_relayer_utils::Result<()> {
        let backoff = backoff::backoff::Constant::new(Duration::from_secs(1));
        let task = || async {
            loop {
                let tip = match client.get_block_number().await {
                    Ok(number) => number.as_u64(),
                    Err(e) => {
                        tracing::error!(
                            "Error while fetching block number: {}",
                            e
                        );
                        return Err(backoff::Error::transient(
                            escrow_relayer_utils::Error::Generic(
                                "failed to fetch block number",
                            ),
                        ));
                    }
                };
                self.broadcast(tip);
                tokio::time::sleep(self.polling_interval).await;
            }
        };
        backoff::future::retry(backoff, task).await?;
        Ok(())
    }
}

/// A subscription port to a [`ChainMonitor`], carrying an idempotent
/// [`MonitorHandle::close`].
pub struct MonitorHandle {
    rx: Option<watch::Receiver<Option<MonitorStatus>>>,
}

impl MonitorHandle {
    /// The most recent status, if the monitor produced one yet.
    pub fn latest(&self) -> Option<MonitorStatus> {
        self.rx.as_ref().and_then(|rx| *rx.borrow())
    }

    /// Waits for the first status after startup.
    pub async fn first_status(
        &mut self,
    ) -> escrow_relayer_utils::Result<MonitorStatus> {
        loop {
            if let Some(status) = self.latest() {
                return Ok(status);
            }
            self.changed().await?;
        }
    }

    /// Waits until the monitor broadcasts a new status.
    pub async fn changed(&mut self) -> escrow_relayer_utils::Result<()> {
        match self.rx.as_mut() {
            Some(rx) => rx.changed().await.map_err(|_| {
                escrow_relayer_utils::Error::Generic("monitor went away")
            }),
            None => {
                Err(escrow_relayer_utils::Error::Generic("port closed"))
            }
        }
    }

    /// Closes the port. Idempotent.
    pub fn close(&mut self) {
        self.rx = None;
    }
}
