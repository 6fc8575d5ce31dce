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
//! # Transaction Wallet
//!
//! One task per chain owns the signing key and a local nonce counter;
//! every transaction of that chain funnels through its request channel,
//! so nonces form a single total order. The wallet simulates, prices,
//! broadcasts, confirms, reprices stuck transactions at the same nonce
//! and, as a last resort, cancels them with a zero-value self-transfer.
//! A failed cancellation stalls the wallet fatally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::providers::Middleware;
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    BlockNumber, Eip1559TransactionRequest, TransactionReceipt,
    TransactionRequest, H256, U256,
};
use tokio::sync::{mpsc, oneshot};

use escrow_relayer_config::SubmitterConfig;
use escrow_relayer_utils::SignerClient;

pub use gas::{GasPolicy, GasPrice};

/// Gas pricing policy.
pub mod gas;

const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// What the wallet reports back for one accepted request.
#[derive(Debug, Default)]
pub struct WalletTxResult {
    /// Hash of the broadcast transaction (the latest replacement).
    pub tx_hash: Option<H256>,
    /// The confirmation receipt, when one was obtained.
    pub receipt: Option<TransactionReceipt>,
    /// Set when the transaction never made it on the wire.
    pub submission_error: Option<String>,
    /// Set when the transaction was broadcast but never usably
    /// confirmed.
    pub confirmation_error: Option<String>,
}

struct WalletRequest {
    tx: TypedTransaction,
    reply: oneshot::Sender<WalletTxResult>,
}

/// The request port other workers use to reach a chain's wallet.
#[derive(Clone)]
pub struct WalletHandle {
    tx: mpsc::Sender<WalletRequest>,
}

impl WalletHandle {
    /// Submits a transaction and waits for its terminal result. Blocks
    /// at the channel while the wallet is at its pending cap.
    pub async fn submit(
        &self,
        tx: TypedTransaction,
    ) -> escrow_relayer_utils::Result<WalletTxResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WalletRequest { tx, reply })
            .await
            .map_err(|_| {
                escrow_relayer_utils::Error::Generic("wallet is gone")
            })?;
        rx.await.map_err(|_| {
            escrow_relayer_utils::Error::Generic(
                "wallet dropped the request",
            )
        })
    }
}

/// Scheduling and pricing parameters of one chain's wallet.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Cap on simultaneously pending transactions.
    pub max_pending_transactions: usize,
    /// How long a broadcast transaction may stay unconfirmed before it
    /// is repriced.
    pub confirmation_timeout: Duration,
    /// Replacements attempted before falling back to cancellation.
    pub max_tries: u32,
    /// Warn when the balance estimate drops below this.
    pub low_balance_warning: Option<U256>,
    /// The gas pricing rules.
    pub policy: GasPolicy,
}

impl WalletConfig {
    /// Builds the wallet config from the effective submitter config.
    pub fn from_submitter(config: &SubmitterConfig) -> Self {
        Self {
            max_pending_transactions: config.max_pending_transactions,
            confirmation_timeout: Duration::from_millis(
                config.confirmation_timeout,
            ),
            max_tries: config.max_tries,
            low_balance_warning: config
                .low_balance_warning
                .map(U256::from),
            policy: GasPolicy::from_config(config),
        }
    }
}

struct PendingTx {
    tx: TypedTransaction,
    nonce: U256,
    tx_hash: H256,
    price: GasPrice,
    submitted_at: Instant,
    reprices: u32,
    cancelling: bool,
    reply: Option<oneshot::Sender<WalletTxResult>>,
}

/// The per-chain wallet task.
pub struct EvmWallet {
    chain_id: u64,
    config: WalletConfig,
    client: Arc<SignerClient>,
    rx: mpsc::Receiver<WalletRequest>,
}

impl EvmWallet {
    /// Creates the wallet task and its request port. The channel is
    /// bounded at the pending cap, so producers back off naturally.
    pub fn new(
        chain_id: u64,
        config: WalletConfig,
        client: Arc<SignerClient>,
    ) -> (Self, WalletHandle) {
        let (tx, rx) =
            mpsc::channel(config.max_pending_transactions.max(1));
        (
            Self {
                chain_id,
                config,
                client,
                rx,
            },
            WalletHandle { tx },
        )
    }

    /// Runs the wallet until every handle is dropped and all pending
    /// transactions settled, or until it stalls fatally.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn run(mut self) -> escrow_relayer_utils::Result<()> {
        let address = self.client.address();
        let mut next_nonce = self
            .client
            .inner()
            .get_transaction_count(
                address,
                Some(BlockNumber::Pending.into()),
            )
            .await?;
        let mut balance =
            self.client.inner().get_balance(address, None).await?;
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %escrow_relayer_utils::probe::Kind::TxWallet,
            chain_id = %self.chain_id,
            starting = true,
            %next_nonce,
            %balance,
        );

        let mut pending: Vec<PendingTx> = Vec::new();
        let mut poll = tokio::time::interval(CONFIRMATION_POLL_INTERVAL);
        let mut open = true;
        // detach the request channel so the select arms can borrow the
        // wallet itself.
        let (_closed, placeholder) = mpsc::channel(1);
        let mut rx = std::mem::replace(&mut self.rx, placeholder);
        loop {
            tokio::select! {
                maybe_req = rx.recv(), if open
                    && pending.len() < self.config.max_pending_transactions =>
                {
                    match maybe_req {
                        Some(req) => {
                            if let Some(item) =
                                self.accept(req, &mut next_nonce).await
                            {
                                pending.push(item);
                            }
                        }
                        None => open = false,
                    }
                }
                _ = poll.tick() => {
                    self.survey(&mut pending, &mut balance).await?;
                }
            }
            if !open && pending.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Simulates, prices, nonces and broadcasts one request. Returns
    /// the pending record, or `None` when the request was rejected and
    /// already answered.
    async fn accept(
        &self,
        req: WalletRequest,
        next_nonce: &mut U256,
    ) -> Option<PendingTx> {
        let mut tx = req.tx;
        tx.set_from(self.client.address());
        tx.set_chain_id(self.chain_id);

        // dry run before a nonce is burned on a doomed transaction.
        if let Err(e) = self.client.inner().call(&tx, None).await {
            tracing::debug!("wallet dry run failed: {}", e);
            let _ = req.reply.send(WalletTxResult {
                submission_error: Some(e.to_string()),
                ..Default::default()
            });
            return None;
        }

        let price = match self.fetch_price().await {
            Ok(price) => price,
            Err(e) => {
                let _ = req.reply.send(WalletTxResult {
                    submission_error: Some(e.to_string()),
                    ..Default::default()
                });
                return None;
            }
        };
        price.apply(&mut tx);
        tx.set_nonce(*next_nonce);

        let tx_hash = match self.sign_and_broadcast(&tx).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!("Error while sending tx: {}", e);
                let _ = req.reply.send(WalletTxResult {
                    submission_error: Some(e.to_string()),
                    ..Default::default()
                });
                return None;
            }
        };
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %escrow_relayer_utils::probe::Kind::TxWallet,
            chain_id = %self.chain_id,
            pending = true,
            nonce = %next_nonce,
            %tx_hash,
        );
        let nonce = *next_nonce;
        *next_nonce += U256::one();
        Some(PendingTx {
            tx,
            nonce,
            tx_hash,
            price,
            submitted_at: Instant::now(),
            reprices: 0,
            cancelling: false,
            reply: Some(req.reply),
        })
    }

    async fn fetch_price(
        &self,
    ) -> escrow_relayer_utils::Result<GasPrice> {
        if self.config.policy.legacy_transactions {
            let gas_price = self.client.inner().get_gas_price().await?;
            Ok(GasPrice::from_fee_data(
                &self.config.policy,
                gas_price,
                U256::zero(),
            ))
        } else {
            let (max_fee, priority) =
                self.client.inner().estimate_eip1559_fees(None).await?;
            Ok(GasPrice::from_fee_data(
                &self.config.policy,
                max_fee,
                priority,
            ))
        }
    }

    async fn sign_and_broadcast(
        &self,
        tx: &TypedTransaction,
    ) -> escrow_relayer_utils::Result<H256> {
        let signature =
            self.client.signer().sign_transaction(tx).await?;
        let raw = tx.rlp_signed(&signature);
        let pending = self.client.inner().send_raw_transaction(raw).await?;
        Ok(*pending)
    }

    /// One confirmation pass over the pending set. Returns the fatal
    /// stall error when a cancellation cannot be placed or confirmed.
    async fn survey(
        &self,
        pending: &mut Vec<PendingTx>,
        balance: &mut U256,
    ) -> escrow_relayer_utils::Result<()> {
        let mut i = 0;
        while i < pending.len() {
            match self
                .client
                .inner()
                .get_transaction_receipt(pending[i].tx_hash)
                .await
            {
                Ok(Some(receipt)) => {
                    let item = pending.remove(i);
                    self.settle(item, receipt, balance);
                }
                Ok(None) => {
                    let timed_out = pending[i].submitted_at.elapsed()
                        >= self.config.confirmation_timeout;
                    if timed_out {
                        self.replace(&mut pending[i]).await?;
                    }
                    i += 1;
                }
                Err(e) => {
                    tracing::debug!(
                        "receipt poll failed for {:?}: {}",
                        pending[i].tx_hash,
                        e
                    );
                    i += 1;
                }
            }
        }
        Ok(())
    }

    fn settle(
        &self,
        mut item: PendingTx,
        receipt: TransactionReceipt,
        balance: &mut U256,
    ) {
        // keep a local spend estimate so a draining account is noticed
        // before submissions start bouncing.
        if let (Some(gas_used), Some(price)) =
            (receipt.gas_used, receipt.effective_gas_price)
        {
            *balance = balance.saturating_sub(gas_used * price);
        }
        if let Some(threshold) = self.config.low_balance_warning {
            if *balance < threshold {
                tracing::warn!(
                    chain_id = %self.chain_id,
                    %balance,
                    "relayer account balance below the warning threshold",
                );
            }
        }
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %escrow_relayer_utils::probe::Kind::TxWallet,
            chain_id = %self.chain_id,
            finalized = true,
            nonce = %item.nonce,
            tx_hash = ?receipt.transaction_hash,
            cancelled = item.cancelling,
        );
        let result = if item.cancelling {
            WalletTxResult {
                tx_hash: Some(receipt.transaction_hash),
                receipt: None,
                submission_error: None,
                confirmation_error: Some(
                    "transaction replaced by a cancellation".to_string(),
                ),
            }
        } else if receipt.status == Some(0u64.into()) {
            WalletTxResult {
                tx_hash: Some(receipt.transaction_hash),
                receipt: Some(receipt),
                submission_error: None,
                confirmation_error: Some(
                    "transaction reverted on chain".to_string(),
                ),
            }
        } else {
            WalletTxResult {
                tx_hash: Some(receipt.transaction_hash),
                receipt: Some(receipt),
                submission_error: None,
                confirmation_error: None,
            }
        };
        if let Some(reply) = item.reply.take() {
            let _ = reply.send(result);
        }
    }

    /// Replaces a stuck transaction at the same nonce: repriced while
    /// attempts remain, cancelled afterwards, fatal when even the
    /// cancellation cannot be placed.
    async fn replace(
        &self,
        item: &mut PendingTx,
    ) -> escrow_relayer_utils::Result<()> {
        let factor = self.config.policy.priority_adjustment_factor;
        if item.cancelling {
            // the cancellation itself did not land within the timeout.
            if let Some(reply) = item.reply.take() {
                let _ = reply.send(WalletTxResult {
                    tx_hash: Some(item.tx_hash),
                    confirmation_error: Some(
                        "wallet stalled: cancellation unconfirmed"
                            .to_string(),
                    ),
                    ..Default::default()
                });
            }
            return Err(escrow_relayer_utils::Error::WalletStalled {
                chain_id: self.chain_id,
            });
        }
        if item.reprices < self.config.max_tries {
            item.reprices += 1;
            item.price = item.price.bump(factor);
            item.price.apply(&mut item.tx);
            tracing::event!(
                target: escrow_relayer_utils::probe::TARGET,
                tracing::Level::DEBUG,
                kind = %escrow_relayer_utils::probe::Kind::TxWallet,
                chain_id = %self.chain_id,
                repriced = true,
                nonce = %item.nonce,
                attempt = item.reprices,
            );
            match self.sign_and_broadcast(&item.tx).await {
                Ok(hash) => item.tx_hash = hash,
                Err(e) => {
                    // the previous broadcast stays valid; try again
                    // after another timeout window.
                    tracing::warn!(
                        "replacement broadcast failed at nonce {}: {}",
                        item.nonce,
                        e
                    );
                }
            }
            item.submitted_at = Instant::now();
            return Ok(());
        }

        // repricing exhausted, free the nonce with a zero-value
        // self-transfer priced above the stuck transaction.
        let mut cancel = self.cancellation_request();
        cancel.set_nonce(item.nonce);
        cancel.set_chain_id(self.chain_id);
        item.price = item.price.bump(factor);
        item.price.apply(&mut cancel);
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::WARN,
            kind = %escrow_relayer_utils::probe::Kind::TxWallet,
            chain_id = %self.chain_id,
            cancelling = true,
            nonce = %item.nonce,
        );
        match self.sign_and_broadcast(&cancel).await {
            Ok(hash) => {
                item.tx = cancel;
                item.tx_hash = hash;
                item.cancelling = true;
                item.submitted_at = Instant::now();
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "cancellation broadcast failed at nonce {}: {}",
                    item.nonce,
                    e
                );
                if let Some(reply) = item.reply.take() {
                    let _ = reply.send(WalletTxResult {
                        tx_hash: Some(item.tx_hash),
                        confirmation_error: Some(
                            "wallet stalled: cancellation rejected"
                                .to_string(),
                        ),
                        ..Default::default()
                    });
                }
                Err(escrow_relayer_utils::Error::WalletStalled {
                    chain_id: self.chain_id,
                })
            }
        }
    }

    /// A zero-value self-transfer claiming a stuck nonce.
    fn cancellation_request(&self) -> TypedTransaction {
        let address = self.client.address();
        if self.config.policy.legacy_transactions {
            TypedTransaction::Legacy(
                TransactionRequest::new()
                    .from(address)
                    .to(address)
                    .value(0u64)
                    .gas(21_000u64),
            )
        } else {
            TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .from(address)
                    .to(address)
                    .value(0u64)
                    .gas(21_000u64),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet_for_tests(legacy: bool) -> EvmWallet {
        let config = WalletConfig {
            max_pending_transactions: 4,
            confirmation_timeout: Duration::from_millis(100),
            max_tries: 2,
            low_balance_warning: None,
            policy: GasPolicy {
                legacy_transactions: legacy,
                max_fee_per_gas: None,
                max_priority_fee_adjustment_factor: 1.0,
                max_allowed_priority_fee_per_gas: None,
                gas_price_adjustment_factor: 1.0,
                max_allowed_gas_price: None,
                priority_adjustment_factor: 1.1,
            },
        };
        let provider = ethers::providers::Provider::try_from(
            "http://localhost:8545",
        )
        .unwrap();
        let signer: ethers::signers::LocalWallet =
            "0x0000000000000000000000000000000000000000000000000000000000000001"
                .parse()
                .unwrap();
        let client = Arc::new(ethers::middleware::SignerMiddleware::new(
            provider, signer,
        ));
        EvmWallet::new(1, config, client).0
    }

    #[test]
    fn cancellation_is_a_zero_value_self_transfer() {
        let wallet = wallet_for_tests(false);
        let cancel = wallet.cancellation_request();
        let TypedTransaction::Eip1559(inner) = &cancel else {
            panic!("expected an eip1559 request");
        };
        assert_eq!(inner.value, Some(U256::zero()));
        assert_eq!(inner.gas, Some(U256::from(21_000u64)));
        let to = inner.to.clone().unwrap();
        assert_eq!(
            to,
            ethers::types::NameOrAddress::Address(
                wallet.client.address()
            )
        );
    }

    #[test]
    fn legacy_cancellation_uses_a_legacy_request() {
        let wallet = wallet_for_tests(true);
        let cancel = wallet.cancellation_request();
        assert!(matches!(cancel, TypedTransaction::Legacy(_)));
    }
}
