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

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, TransactionReceipt, H256};
use tokio::time::Instant;

use escrow_contracts::garp::GarpMessage;
use escrow_relayer_store::records::MessageIdentifier;

/// A proof waiting to be evaluated against its bounty.
#[derive(Debug, Clone)]
pub struct EvalOrder {
    /// The bridge the proof came from.
    pub amb: String,
    /// The chain the message was emitted on, when locally known.
    pub from_chain_id: Option<u64>,
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The raw GARP message bytes.
    pub message: Bytes,
    /// Proof context the escrow requires.
    pub message_ctx: Option<Bytes>,
    /// Bypass the cost evaluation.
    pub priority: bool,
    /// Give up waiting for the bounty after this point.
    pub evaluation_deadline: Instant,
    /// Whether a missing bounty is worth waiting for at all.
    pub retry_evaluation: bool,
}

/// An approved order carrying its built transaction.
#[derive(Debug, Clone)]
pub struct SubmitOrder {
    /// The bridge the proof came from.
    pub amb: String,
    /// The chain the message was emitted on, when locally known.
    pub from_chain_id: Option<u64>,
    /// Primary key.
    pub message_identifier: MessageIdentifier,
    /// The raw GARP message bytes.
    pub message: Bytes,
    /// Proof context the escrow requires.
    pub message_ctx: Option<Bytes>,
    /// Bypass the cost evaluation.
    pub priority: bool,
    /// Delivery leg (as opposed to the ack leg).
    pub is_delivery: bool,
    /// The `processPacket` transaction, gas limit included.
    pub transaction_request: TypedTransaction,
    /// Times this order re-entered the submit queue from confirmation.
    pub requeue_count: u32,
}

/// The outcome of a submission: the broadcast hash and its receipt.
#[derive(Debug, Clone)]
pub struct SubmitOrderResult {
    /// Hash of the confirmed transaction.
    pub tx_hash: H256,
    /// The confirmation receipt.
    pub receipt: TransactionReceipt,
}

/// A confirmed submission awaiting its extra confirmations and the
/// bookkeeping writes.
#[derive(Debug, Clone)]
pub struct ConfirmOrder {
    /// The submitted order.
    pub order: SubmitOrder,
    /// Hash of the confirmed transaction.
    pub tx_hash: H256,
    /// The confirmation receipt.
    pub receipt: TransactionReceipt,
}

/// Whether a raw GARP message is the delivery leg. Falls back to
/// delivery when the context byte cannot be read.
pub fn is_delivery_message(message: &[u8]) -> bool {
    GarpMessage::decode(message)
        .map(|garp| garp.is_delivery())
        .unwrap_or(true)
}
