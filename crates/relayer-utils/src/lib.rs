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
//! # Relayer Utils
//!
//! Shared error type and small helpers used by every crate of the
//! escrow relayer workspace.

use ethers::middleware::SignerMiddleware;
use ethers::prelude::{Http, LocalWallet, Provider};

/// A module used for debugging relayer lifecycle, sync state, or other
/// relayer state in a machine-readable way.
pub mod probe;
/// Retry backoff policies.
pub mod retry;

/// Convenience alias over the relayer [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The concrete signing client used by all chain-facing workers.
pub type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// An enum of all possible errors that could be encountered during the
/// execution of the escrow relayer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Error in Http Provider (ethers client).
    #[error(transparent)]
    EthersProvider(#[from] ethers::providers::ProviderError),
    /// Smart contract error.
    #[error(transparent)]
    EthersContractCall(
        #[from] ethers::contract::ContractError<Provider<Http>>,
    ),
    /// Smart contract error (signing client).
    #[error(transparent)]
    EthersContractCallWithSigner(
        #[from] ethers::contract::ContractError<SignerClient>,
    ),
    /// Ether wallet errors.
    #[error(transparent)]
    EtherWallet(#[from] ethers::signers::WalletError),
    /// Signature recovery error.
    #[error(transparent)]
    Signature(#[from] ethers::types::SignatureError),
    /// ABI Error.
    #[error(transparent)]
    Abi(#[from] ethers::abi::Error),
    /// Chain not found in the configuration.
    #[error("Chain Not Found: {}", chain_id)]
    ChainNotFound {
        /// The chain id of the chain.
        chain_id: String,
    },
    /// AMB not found in the configuration.
    #[error("AMB Not Found: {}", amb)]
    AmbNotFound {
        /// The configured name of the AMB.
        amb: String,
    },
    /// Missing secrets in the config.
    #[error("Missing required private key in the config")]
    MissingSecrets,
    /// A record could not be decoded into a domain value.
    #[error("Malformed record: {}", _0)]
    MalformedRecord(String),
    /// The bounty for a message has not been observed yet.
    #[error("Bounty not yet observed for message {}", message_identifier)]
    BountyNotSeen {
        /// The message identifier the bounty is missing for.
        message_identifier: String,
    },
    /// Transaction submission failed before the transaction was broadcast.
    #[error("Transaction submission failed: {}", _0)]
    TxSubmission(String),
    /// A broadcast transaction never confirmed.
    #[error("Transaction failed to confirm: {}", _0)]
    TxConfirmation(String),
    /// The wallet could neither replace nor cancel a stuck transaction.
    #[error("Wallet stalled on chain {}: replacement and cancellation failed", chain_id)]
    WalletStalled {
        /// The chain the wallet task is serving.
        chain_id: u64,
    },
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
}

impl Error {
    /// Whether the underlying cause is a reverted `eth_call`, which the
    /// pipeline treats as "somebody else already delivered".
    pub fn is_call_exception(&self) -> bool {
        match self {
            Self::EthersProvider(e) => provider_error_is_revert(e),
            Self::EthersContractCall(e) => contract_error_is_revert(e),
            Self::EthersContractCallWithSigner(e) => {
                contract_error_is_revert(e)
            }
            _ => false,
        }
    }
}

fn provider_error_is_revert(e: &ethers::providers::ProviderError) -> bool {
    use ethers::providers::RpcError;
    match e {
        ethers::providers::ProviderError::JsonRpcClientError(inner) => inner
            .as_error_response()
            .map(|resp| {
                resp.code == 3
                    || resp.message.to_lowercase().contains("revert")
            })
            .unwrap_or(false),
        _ => false,
    }
}

fn contract_error_is_revert<M: ethers::providers::Middleware>(
    e: &ethers::contract::ContractError<M>,
) -> bool {
    if matches!(e, ethers::contract::ContractError::Revert(_)) {
        return true;
    }
    // Middleware stacks render reverts differently; fall back on the
    // rendered message the same way the RPC surfaces them.
    let rendered = e.to_string().to_lowercase();
    rendered.contains("revert") || rendered.contains("call exception")
}
