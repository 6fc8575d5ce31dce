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
//! # Relayer Context Module
//!
//! The context holds everything with process lifetime: the parsed
//! configuration, the store, and the shutdown/fatal broadcast channels
//! every worker subscribes to.

use std::sync::Arc;
use std::time::Duration;

use ethers::middleware::SignerMiddleware;
use ethers::prelude::{Http, LocalWallet, Provider};
use ethers::signers::Signer;
use tokio::sync::broadcast;

use escrow_relayer_config::EscrowRelayerConfig;
use escrow_relayer_store::SledStore;
use escrow_relayer_utils::SignerClient;

/// RelayerContext contains the relayer's configuration, store and
/// lifecycle signals.
#[derive(Clone)]
pub struct RelayerContext {
    /// The configuration of the relayer.
    pub config: EscrowRelayerConfig,
    /// Broadcasts a shutdown signal to all active workers.
    ///
    /// When a worker task is spawned it is handed a receiver; on
    /// graceful shutdown a `()` is sent, each worker reaches a safe
    /// state and completes.
    notify_shutdown: broadcast::Sender<()>,
    /// Broadcasts fatal conditions (a stalled wallet) so the binary can
    /// exit non-zero.
    notify_fatal: broadcast::Sender<String>,
    store: SledStore,
}

impl RelayerContext {
    /// Creates a new RelayerContext.
    pub fn new(config: EscrowRelayerConfig, store: SledStore) -> Self {
        let (notify_shutdown, _) = broadcast::channel(2);
        let (notify_fatal, _) = broadcast::channel(2);
        Self {
            config,
            notify_shutdown,
            notify_fatal,
            store,
        }
    }

    /// Returns a receiver handle for the shutdown signal.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends a shutdown signal to all subscribed workers.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// Reports a fatal condition; the binary exits non-zero.
    pub fn fatal(&self, reason: String) {
        tracing::event!(
            target: escrow_relayer_utils::probe::TARGET,
            tracing::Level::ERROR,
            kind = %escrow_relayer_utils::probe::Kind::Lifecycle,
            fatal = true,
            %reason,
        );
        let _ = self.notify_fatal.send(reason);
    }

    /// Returns a receiver handle for fatal conditions.
    pub fn fatal_signal(&self) -> broadcast::Receiver<String> {
        self.notify_fatal.subscribe()
    }

    /// Returns a new RPC provider for a chain.
    pub fn evm_provider(
        &self,
        chain_id: u64,
    ) -> escrow_relayer_utils::Result<Provider<Http>> {
        let chain = self.config.chain(chain_id).ok_or_else(|| {
            escrow_relayer_utils::Error::ChainNotFound {
                chain_id: chain_id.to_string(),
            }
        })?;
        let provider = Provider::<Http>::try_from(chain.rpc.as_str())
            .map_err(escrow_relayer_utils::Error::Url)?
            .interval(Duration::from_millis(500));
        Ok(provider)
    }

    /// Sets up and returns the relayer wallet bound to a chain.
    pub fn evm_wallet(
        &self,
        chain_id: u64,
    ) -> escrow_relayer_utils::Result<LocalWallet> {
        let key = &self.config.relayer.private_key;
        let wallet = LocalWallet::from_bytes(key.as_bytes())?
            .with_chain_id(chain_id);
        Ok(wallet)
    }

    /// A signing client for a chain: the provider wrapped with the
    /// relayer wallet.
    pub fn evm_signer(
        &self,
        chain_id: u64,
    ) -> escrow_relayer_utils::Result<Arc<SignerClient>> {
        let provider = self.evm_provider(chain_id)?;
        let wallet = self.evm_wallet(chain_id)?;
        Ok(Arc::new(SignerMiddleware::new(provider, wallet)))
    }

    /// Returns the [Sled](https://sled.rs)-based database store.
    pub fn store(&self) -> &SledStore {
        &self.store
    }
}

/// A wrapper around a receiver of the shutdown broadcast.
pub struct Shutdown {
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Wraps a broadcast receiver.
    pub fn new(notify: broadcast::Receiver<()>) -> Self {
        Self { notify }
    }

    /// Completes when the shutdown signal fires.
    pub async fn recv(&mut self) {
        let _ = self.notify.recv().await;
    }
}
