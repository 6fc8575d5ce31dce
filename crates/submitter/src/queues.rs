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

//! The three pipeline stages: evaluate, submit, confirm.
//!
//! Stages compose through the completion hooks: an approved evaluation
//! enqueues into the submit queue, a confirmed submission into the
//! confirm queue, and a confirmation that never settles goes back to
//! the submit queue with its requeue count bumped. A drop at any stage
//! returns the order's in-flight permit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use ethers::providers::Middleware;
use ethers::types::U256;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use escrow_contracts::IncentivizedMessageEscrow;
use escrow_order_queue::{QueueHandle, QueueOrderHandler};
use escrow_relayer_config::SubmitterConfig;
use escrow_relayer_store::records::MessageIdentifier;
use escrow_relayer_store::BountyRegistry;
use escrow_relayer_utils::{Error, SignerClient};
use escrow_tx_wallet::WalletHandle;

use crate::evaluator;
use crate::orders::{
    is_delivery_message, ConfirmOrder, EvalOrder, SubmitOrder,
    SubmitOrderResult,
};

/// The pipeline-wide in-flight gate: a permit cap plus the set of
/// (message, leg) keys currently somewhere in the pipeline. The
/// dispatcher admits orders through it and every terminal completion
/// releases them, so the set stays bounded by the backlog instead of
/// growing with process lifetime.
pub struct InFlightLimiter {
    semaphore: Semaphore,
    in_flight: Mutex<HashSet<(MessageIdentifier, bool)>>,
}

impl InFlightLimiter {
    /// Creates a limiter with the given number of permits.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Semaphore::new(capacity.max(1)),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Admits one order per (message, leg). Returns `false` without
    /// waiting when that order is already in flight; otherwise takes a
    /// permit, waiting while the pipeline is full.
    pub async fn admit(
        &self,
        message_identifier: MessageIdentifier,
        is_delivery: bool,
    ) -> bool {
        if !self
            .in_flight
            .lock()
            .insert((message_identifier, is_delivery))
        {
            return false;
        }
        if let Ok(permit) = self.semaphore.acquire().await {
            permit.forget();
        }
        true
    }

    /// Non-waiting [`Self::admit`]; rolls the key back when the
    /// pipeline is full. Used by the tests.
    pub fn try_admit(
        &self,
        message_identifier: MessageIdentifier,
        is_delivery: bool,
    ) -> bool {
        let key = (message_identifier, is_delivery);
        if !self.in_flight.lock().insert(key) {
            return false;
        }
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => {
                self.in_flight.lock().remove(&key);
                false
            }
        }
    }

    /// Returns the permit and forgets the order once it has left the
    /// pipeline for good.
    pub fn release(
        &self,
        message_identifier: MessageIdentifier,
        is_delivery: bool,
    ) {
        self.in_flight
            .lock()
            .remove(&(message_identifier, is_delivery));
        self.semaphore.add_permits(1);
    }
}

/// Resolves the bounty, estimates and prices the delivery, and builds
/// the `processPacket` transaction.
pub struct EvalHandler<S> {
    pub(crate) chain_id: u64,
    pub(crate) config: SubmitterConfig,
    pub(crate) escrows:
        HashMap<String, IncentivizedMessageEscrow<SignerClient>>,
    pub(crate) client: Arc<SignerClient>,
    pub(crate) store: Arc<S>,
    pub(crate) submit_queue: QueueHandle<SubmitOrder>,
    pub(crate) limiter: Arc<InFlightLimiter>,
}

#[async_trait::async_trait]
impl<S> QueueOrderHandler for EvalHandler<S>
where
    S: BountyRegistry + 'static,
{
    type Order = EvalOrder;
    type Output = SubmitOrder;

    async fn handle_order(
        &self,
        order: &EvalOrder,
        _retry_count: u32,
    ) -> escrow_relayer_utils::Result<Option<SubmitOrder>> {
        let Some(bounty) =
            self.store.get_bounty(&order.message_identifier)?
        else {
            if order.retry_evaluation
                && Instant::now() < order.evaluation_deadline
            {
                // the source getter may simply not have caught up yet.
                return Err(Error::BountyNotSeen {
                    message_identifier: format!(
                        "{:?}",
                        order.message_identifier
                    ),
                });
            }
            tracing::debug!(
                id = ?order.message_identifier,
                "no bounty before the evaluation deadline, dropping",
            );
            return Ok(None);
        };

        let Some(contract) = self.escrows.get(&order.amb) else {
            tracing::warn!(
                amb = %order.amb,
                "proof from an AMB without an escrow on this chain",
            );
            return Ok(None);
        };
        let mut call = contract.process_packet(
            order.message_ctx.clone().unwrap_or_default(),
            order.message.clone(),
            escrow_contracts::address_to_bytes32(
                bounty.refund_gas_to.unwrap_or_default(),
            ),
        );
        if self.config.legacy_transactions {
            call = call.legacy();
        }
        let gas_estimate = match call.estimate_gas().await {
            Ok(estimate) => estimate,
            Err(e) => {
                let e: Error = e.into();
                if e.is_call_exception() {
                    tracing::debug!(
                        id = ?order.message_identifier,
                        "delivery simulation reverted, dropping",
                    );
                    return Ok(None);
                }
                return Err(e);
            }
        };

        let destination_gas_price =
            self.client.inner().get_gas_price().await?;
        if !evaluator::should_relay(
            &bounty,
            gas_estimate,
            destination_gas_price,
            order.priority,
        ) {
            tracing::event!(
                target: escrow_relayer_utils::probe::TARGET,
                tracing::Level::DEBUG,
                kind = %escrow_relayer_utils::probe::Kind::Submitter,
                chain_id = %self.chain_id,
                id = ?order.message_identifier,
                underfunded = true,
                %gas_estimate,
                %destination_gas_price,
            );
            return Ok(None);
        }

        let buffer =
            self.config.gas_limit_buffer_for(&order.amb);
        let mut transaction_request = call.tx.clone();
        transaction_request.set_gas(gas_estimate + U256::from(buffer));
        Ok(Some(SubmitOrder {
            amb: order.amb.clone(),
            from_chain_id: order.from_chain_id,
            message_identifier: order.message_identifier,
            message: order.message.clone(),
            message_ctx: order.message_ctx.clone(),
            priority: order.priority,
            is_delivery: is_delivery_message(&order.message),
            transaction_request,
            requeue_count: 0,
        }))
    }

    async fn on_order_completion(
        &self,
        order: EvalOrder,
        success: bool,
        result: Option<SubmitOrder>,
        retry_count: u32,
    ) {
        let is_delivery = is_delivery_message(&order.message);
        match (success, result) {
            (true, Some(submit_order)) => {
                if self.submit_queue.enqueue(submit_order).await.is_err() {
                    tracing::error!("submit queue is gone");
                    self.limiter
                        .release(order.message_identifier, is_delivery);
                }
            }
            _ => {
                tracing::trace!(
                    id = ?order.message_identifier,
                    retry_count,
                    "evaluation dropped the order",
                );
                self.limiter
                    .release(order.message_identifier, is_delivery);
            }
        }
    }
}

/// Hands approved orders to the wallet; detects competing deliveries on
/// every retry with a fresh static call.
pub struct SubmitHandler {
    pub(crate) chain_id: u64,
    pub(crate) client: Arc<SignerClient>,
    pub(crate) wallet: WalletHandle,
    pub(crate) confirm_queue: OnceLock<QueueHandle<ConfirmOrder>>,
    pub(crate) limiter: Arc<InFlightLimiter>,
}

#[async_trait::async_trait]
impl QueueOrderHandler for SubmitHandler {
    type Order = SubmitOrder;
    type Output = SubmitOrderResult;

    async fn handle_order(
        &self,
        order: &SubmitOrder,
        retry_count: u32,
    ) -> escrow_relayer_utils::Result<Option<SubmitOrderResult>> {
        if retry_count > 0 || order.requeue_count > 0 {
            // a previous attempt may have lost the race to a competing
            // relayer; that shows up as a reverting static call.
            if let Err(e) = self
                .client
                .inner()
                .call(&order.transaction_request, None)
                .await
            {
                let e: Error = e.into();
                if e.is_call_exception() {
                    tracing::info!(
                        id = ?order.message_identifier,
                        "message already processed on chain, dropping",
                    );
                    return Ok(None);
                }
                return Err(e);
            }
        }

        let result = self
            .wallet
            .submit(order.transaction_request.clone())
            .await?;
        if let Some(reason) = result.submission_error {
            return Err(Error::TxSubmission(reason));
        }
        if let Some(reason) = result.confirmation_error {
            return Err(Error::TxConfirmation(reason));
        }
        let receipt = result.receipt.ok_or(Error::Generic(
            "wallet confirmed without a receipt",
        ))?;
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %escrow_relayer_utils::probe::Kind::Submitter,
            chain_id = %self.chain_id,
            id = ?order.message_identifier,
            submitted = true,
            tx_hash = ?receipt.transaction_hash,
        );
        Ok(Some(SubmitOrderResult {
            tx_hash: receipt.transaction_hash,
            receipt,
        }))
    }

    async fn on_order_completion(
        &self,
        order: SubmitOrder,
        success: bool,
        result: Option<SubmitOrderResult>,
        retry_count: u32,
    ) {
        let message_identifier = order.message_identifier;
        let is_delivery = order.is_delivery;
        match (success, result) {
            (true, Some(result)) => {
                let confirm = ConfirmOrder {
                    order,
                    tx_hash: result.tx_hash,
                    receipt: result.receipt,
                };
                let Some(queue) = self.confirm_queue.get() else {
                    tracing::error!("confirm queue was never linked");
                    self.limiter.release(message_identifier, is_delivery);
                    return;
                };
                if queue.enqueue(confirm).await.is_err() {
                    tracing::error!("confirm queue is gone");
                    self.limiter.release(message_identifier, is_delivery);
                }
            }
            _ => {
                tracing::debug!(
                    id = ?message_identifier,
                    retry_count,
                    "submission dropped the order",
                );
                self.limiter.release(message_identifier, is_delivery);
            }
        }
    }
}

/// Waits out the configured extra confirmations and performs the
/// post-delivery bookkeeping.
pub struct ConfirmHandler<S> {
    pub(crate) chain_id: u64,
    pub(crate) config: SubmitterConfig,
    pub(crate) client: Arc<SignerClient>,
    pub(crate) store: Arc<S>,
    pub(crate) submit_queue: QueueHandle<SubmitOrder>,
    pub(crate) limiter: Arc<InFlightLimiter>,
}

#[async_trait::async_trait]
impl<S> QueueOrderHandler for ConfirmHandler<S>
where
    S: BountyRegistry + 'static,
{
    type Order = ConfirmOrder;
    type Output = ();

    async fn handle_order(
        &self,
        order: &ConfirmOrder,
        _retry_count: u32,
    ) -> escrow_relayer_utils::Result<Option<()>> {
        if self.config.confirmations > 1 {
            let current =
                self.client.inner().get_block_number().await?.as_u64();
            let mined =
                order.receipt.block_number.unwrap_or_default().as_u64();
            if mined + self.config.confirmations - 1 > current {
                return Err(Error::TxConfirmation(
                    "awaiting additional confirmations".to_string(),
                ));
            }
            let still_there = self
                .client
                .inner()
                .get_transaction_receipt(order.tx_hash)
                .await?;
            if still_there.is_none() {
                return Err(Error::TxConfirmation(
                    "receipt vanished, possible reorg".to_string(),
                ));
            }
        }
        if order.order.is_delivery {
            // ack submissions intentionally do not register cost.
            self.store.register_delivery_cost(
                order.order.message_identifier,
                order.receipt.gas_used.unwrap_or_default(),
            )?;
        }
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %escrow_relayer_utils::probe::Kind::Submitter,
            chain_id = %self.chain_id,
            id = ?order.order.message_identifier,
            confirmed = true,
            tx_hash = ?order.tx_hash,
        );
        Ok(Some(()))
    }

    async fn on_order_completion(
        &self,
        order: ConfirmOrder,
        success: bool,
        _result: Option<()>,
        retry_count: u32,
    ) {
        let message_identifier = order.order.message_identifier;
        let is_delivery = order.order.is_delivery;
        if success {
            self.limiter.release(message_identifier, is_delivery);
            return;
        }
        // the receipt never settled; push the order back through the
        // submit queue, whose simulation decides whether the message
        // still needs us.
        let mut resubmit = order.order;
        resubmit.requeue_count += 1;
        if resubmit.requeue_count <= self.config.max_tries {
            tracing::warn!(
                id = ?message_identifier,
                requeue_count = resubmit.requeue_count,
                retry_count,
                "confirmation failed, requeueing the submission",
            );
            if self.submit_queue.enqueue(resubmit).await.is_err() {
                tracing::error!("submit queue is gone");
                self.limiter.release(message_identifier, is_delivery);
            }
        } else {
            tracing::error!(
                id = ?message_identifier,
                "confirmation requeues exhausted, giving the order up",
            );
            self.limiter.release(message_identifier, is_delivery);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    fn id(n: u64) -> MessageIdentifier {
        H256::from_low_u64_be(n)
    }

    #[tokio::test]
    async fn limiter_caps_and_releases() {
        let limiter = InFlightLimiter::new(2);
        assert!(limiter.try_admit(id(1), true));
        assert!(limiter.try_admit(id(2), true));
        assert!(!limiter.try_admit(id(3), true));
        limiter.release(id(1), true);
        assert!(limiter.try_admit(id(3), true));

        // a blocked admit resumes once a permit returns.
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.admit(id(4), true).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        limiter.release(id(2), true);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_orders_are_rejected_until_released() {
        let limiter = InFlightLimiter::new(8);
        assert!(limiter.admit(id(1), true).await);
        // the same (message, leg) is refused while in flight.
        assert!(!limiter.admit(id(1), true).await);
        // the ack leg of the same message is its own order.
        assert!(limiter.admit(id(1), false).await);

        // a terminal completion forgets the key, so a later proof for
        // the same message can re-enter the pipeline.
        limiter.release(id(1), true);
        assert!(limiter.admit(id(1), true).await);
    }

    #[test]
    fn a_full_pipeline_rolls_the_key_back() {
        let limiter = InFlightLimiter::new(1);
        assert!(limiter.try_admit(id(1), true));
        assert!(!limiter.try_admit(id(2), true));
        // the refused key must not linger as in-flight.
        limiter.release(id(1), true);
        assert!(limiter.try_admit(id(2), true));
    }
}
