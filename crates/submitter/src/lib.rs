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
//! # Submitter
//!
//! The destination-side pipeline of one chain: a dispatcher consumes
//! the chain's proof stream, joins each payload with its bounty, and
//! drives it through three chained queues (evaluate, submit, confirm)
//! under a global in-flight cap. Dropping an order because a competitor
//! delivered first is a normal terminal state, not an error.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ethers::types::Address;
use tokio::time::Instant;

use escrow_contracts::IncentivizedMessageEscrow;
use escrow_order_queue::{ProcessingQueue, ProcessingQueueConfig};
use escrow_relayer_config::SubmitterConfig;
use escrow_relayer_store::records::AmbPayload;
use escrow_relayer_store::{AmbRegistry, BountyRegistry, ProofChannel};
use escrow_relayer_utils::SignerClient;
use escrow_tx_wallet::WalletHandle;

/// The profitability policy.
pub mod evaluator;
/// The order records flowing through the pipeline.
pub mod orders;
/// The three queue stages.
pub mod queues;

pub use orders::{ConfirmOrder, EvalOrder, SubmitOrder, SubmitOrderResult};
pub use queues::{ConfirmHandler, EvalHandler, InFlightLimiter, SubmitHandler};

/// The per-chain submitter worker.
pub struct Submitter<S> {
    chain_id: u64,
    config: SubmitterConfig,
    /// AMB tag to escrow address, for building `processPacket` calls.
    escrows: HashMap<String, Address>,
    store: Arc<S>,
    client: Arc<SignerClient>,
    wallet: WalletHandle,
}

impl<S> Submitter<S>
where
    S: BountyRegistry + AmbRegistry + ProofChannel + 'static,
{
    /// Creates the worker for one chain.
    pub fn new(
        chain_id: u64,
        config: SubmitterConfig,
        escrows: HashMap<String, Address>,
        store: Arc<S>,
        client: Arc<SignerClient>,
        wallet: WalletHandle,
    ) -> Self {
        Self {
            chain_id,
            config,
            escrows,
            store,
            client,
            wallet,
        }
    }

    /// Runs the dispatcher and its three queues until shutdown.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn run(self) -> escrow_relayer_utils::Result<()> {
        if !self.config.enabled {
            tracing::info!("submitter disabled on this chain");
            return Ok(());
        }
        let limiter =
            InFlightLimiter::new(self.config.max_pending_transactions);
        let queue_config = ProcessingQueueConfig {
            retry_interval: Duration::from_millis(
                self.config.retry_interval,
            ),
            processing_interval: Duration::from_millis(
                self.config.processing_interval,
            ),
            max_tries: self.config.max_tries,
            initial_delay: Duration::ZERO,
        };
        let contracts: HashMap<_, _> = self
            .escrows
            .iter()
            .map(|(amb, address)| {
                (
                    amb.clone(),
                    IncentivizedMessageEscrow::new(
                        *address,
                        self.client.clone(),
                    ),
                )
            })
            .collect();

        // submit first, then confirm (which feeds back into submit),
        // then eval in front of both.
        let submit_handler = Arc::new(SubmitHandler {
            chain_id: self.chain_id,
            client: self.client.clone(),
            wallet: self.wallet.clone(),
            confirm_queue: OnceLock::new(),
            limiter: limiter.clone(),
        });
        let (submit_queue, submit_handle) = ProcessingQueue::new(
            format!("submit-{}", self.chain_id),
            queue_config.clone(),
            submit_handler.clone(),
        );

        let confirm_handler = Arc::new(ConfirmHandler {
            chain_id: self.chain_id,
            config: self.config.clone(),
            client: self.client.clone(),
            store: self.store.clone(),
            submit_queue: submit_handle.clone(),
            limiter: limiter.clone(),
        });
        let (confirm_queue, confirm_handle) = ProcessingQueue::new(
            format!("confirm-{}", self.chain_id),
            queue_config.clone(),
            confirm_handler,
        );
        submit_handler
            .confirm_queue
            .set(confirm_handle)
            .unwrap_or_else(|_| unreachable!("linked exactly once"));

        let eval_handler = Arc::new(EvalHandler {
            chain_id: self.chain_id,
            config: self.config.clone(),
            escrows: contracts,
            client: self.client.clone(),
            store: self.store.clone(),
            submit_queue: submit_handle,
            limiter: limiter.clone(),
        });
        let (eval_queue, eval_handle) = ProcessingQueue::new(
            format!("eval-{}", self.chain_id),
            ProcessingQueueConfig {
                initial_delay: Duration::from_millis(
                    self.config.new_orders_delay,
                ),
                ..queue_config
            },
            eval_handler,
        );

        tokio::spawn(eval_queue.run());
        tokio::spawn(submit_queue.run());
        tokio::spawn(confirm_queue.run());
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %escrow_relayer_utils::probe::Kind::Submitter,
            chain_id = %self.chain_id,
            starting = true,
        );

        // the dispatcher: one EvalOrder per (message, leg) in flight at
        // a time; the limiter forgets a key when its order terminates.
        let mut proofs = self.store.subscribe_proofs(self.chain_id);
        let evaluation_window = Duration::from_millis(
            self.config.new_orders_delay
                + u64::from(self.config.max_tries)
                    * self.config.retry_interval,
        );
        loop {
            let raw = match proofs.recv().await {
                Ok(raw) => raw,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(
                    n,
                )) => {
                    tracing::warn!("proof stream lagged by {n} messages");
                    continue;
                }
                Err(
                    tokio::sync::broadcast::error::RecvError::Closed,
                ) => break,
            };
            let payload: AmbPayload = match serde_json::from_value(raw) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!("undecodable proof payload: {}", e);
                    continue;
                }
            };
            let message_identifier = payload.message_identifier;
            let is_delivery =
                orders::is_delivery_message(&payload.message);
            if !limiter.admit(message_identifier, is_delivery).await {
                tracing::trace!(
                    id = ?message_identifier,
                    "duplicate proof, already in flight",
                );
                continue;
            }
            let from_chain_id = self
                .store
                .get_amb(&message_identifier)
                .ok()
                .flatten()
                .map(|amb| amb.source_chain);
            let order = EvalOrder {
                amb: payload.amb,
                from_chain_id,
                message_identifier,
                message: payload.message,
                message_ctx: payload.message_ctx,
                priority: payload.priority,
                evaluation_deadline: Instant::now() + evaluation_window,
                retry_evaluation: true,
            };
            if eval_handle.enqueue(order).await.is_err() {
                limiter.release(message_identifier, is_delivery);
                break;
            }
        }
        Ok(())
    }
}
