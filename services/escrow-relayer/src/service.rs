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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::Address;

use escrow_chain_monitor::ChainMonitor;
use escrow_collector_layerzero::LayerZeroCollector;
use escrow_collector_mock::MockCollector;
use escrow_getter::BountyWatcher;
use escrow_relayer_config::{AmbKind, ChainConfig};
use escrow_relayer_context::RelayerContext;
use escrow_relayer_store::SledStore;
use escrow_submitter::Submitter;
use escrow_tx_wallet::{EvmWallet, WalletConfig};

/// Fires up all background workers for all enabled chains: one monitor,
/// one getter per escrow, one collector per enabled AMB, the wallet and
/// the submitter. This does not block; every worker lands on its own
/// task wrapped with the shutdown signal.
pub async fn ignite(
    ctx: &RelayerContext,
) -> escrow_relayer_utils::Result<()> {
    // destination endpoint id -> chain id, over every configured chain.
    let eid_to_chain: HashMap<u32, u64> = ctx
        .config
        .chains
        .iter()
        .filter_map(|chain| {
            chain
                .ambs
                .get(escrow_collector_layerzero::AMB_TAG)
                .and_then(|overrides| overrides.eid)
                .map(|eid| (eid, chain.chain_id))
        })
        .collect();

    for chain in ctx.config.chains.clone() {
        if !chain.enabled {
            continue;
        }
        tracing::debug!(
            "Starting background workers for the ({}) chain.",
            chain.display_name(),
        );
        start_chain_workers(ctx, &chain, &eid_to_chain).await?;
    }
    Ok(())
}

async fn start_chain_workers(
    ctx: &RelayerContext,
    chain: &ChainConfig,
    eid_to_chain: &HashMap<u32, u64>,
) -> escrow_relayer_utils::Result<()> {
    let chain_id = chain.chain_id;
    let store: Arc<SledStore> = Arc::new(ctx.store().clone());
    let provider = Arc::new(ctx.evm_provider(chain_id)?);
    let getter_config = ctx.config.getter_for(chain);
    let submitter_config = ctx.config.submitter_for(chain);

    let monitor = ChainMonitor::new(
        chain_id,
        Duration::from_millis(getter_config.processing_interval),
    );

    // resolve the enabled AMBs of this chain up front, ports and
    // escrow addresses included, before the monitor task is consumed.
    let mut escrow_addresses: HashMap<String, Address> = HashMap::new();
    let mut collectors = Vec::new();
    for (tag, amb) in ctx.config.ambs.iter().filter(|(_, a)| a.enabled) {
        let Some(kind) = AmbKind::from_tag(tag) else {
            continue;
        };
        let resolved = ctx.config.amb_for(tag, chain)?;
        escrow_addresses.insert(tag.clone(), resolved.incentives_address);
        collectors.push((tag.clone(), kind, amb.clone(), resolved));
    }

    // every port is opened before the monitor task consumes `monitor`.
    let mut distinct_escrows: Vec<Address> = Vec::new();
    for address in escrow_addresses.values() {
        if !distinct_escrows.contains(address) {
            distinct_escrows.push(*address);
        }
    }
    let mut getter_ports: Vec<_> =
        distinct_escrows.iter().map(|_| monitor.subscribe()).collect();
    let mut collector_ports: Vec<_> =
        collectors.iter().map(|_| monitor.subscribe()).collect();

    // the monitor itself.
    {
        let mut shutdown = ctx.shutdown_signal();
        let provider = provider.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = monitor.run(provider) => {
                    tracing::warn!(
                        "chain monitor for ({chain_id}) stopped: {result:?}",
                    );
                }
                _ = shutdown.recv() => {
                    tracing::trace!(
                        "Stopping chain monitor for ({chain_id})",
                    );
                }
            }
        });
    }

    // one bounty getter per distinct escrow address on this chain.
    for address in distinct_escrows {
        let port = getter_ports
            .pop()
            .expect("one port was opened per escrow");
        let watcher = BountyWatcher::<SledStore>::builder()
            .chain_id(chain_id)
            .escrow_address(address)
            .config(getter_config.clone())
            .store(store.clone())
            .monitor(port)
            .client(provider.clone())
            .build();
        let mut shutdown = ctx.shutdown_signal();
        tokio::spawn(async move {
            tokio::select! {
                result = watcher.run() => {
                    tracing::warn!(
                        "bounty getter for ({address}) stopped: {result:?}",
                    );
                }
                _ = shutdown.recv() => {
                    tracing::trace!(
                        "Stopping bounty getter for ({address})",
                    );
                }
            }
        });
    }

    // collectors, one isolated task per (chain, AMB).
    for (tag, kind, amb, resolved) in collectors {
        let port = collector_ports
            .pop()
            .expect("one port was opened per collector");
        let mut shutdown = ctx.shutdown_signal();
        match kind {
            AmbKind::Mock => {
                let key = amb
                    .private_key
                    .as_ref()
                    .ok_or(escrow_relayer_utils::Error::MissingSecrets)?;
                let signer =
                    ethers::signers::LocalWallet::from_bytes(
                        key.as_bytes(),
                    )?;
                let collector = MockCollector::<SledStore>::builder()
                    .chain_id(chain_id)
                    .escrow_address(resolved.incentives_address)
                    .signer(signer)
                    .config(getter_config.clone())
                    .store(store.clone())
                    .monitor(port)
                    .client(provider.clone())
                    .build();
                tokio::spawn(async move {
                    tokio::select! {
                        result = collector.run() => {
                            tracing::warn!(
                                "collector ({tag}) on ({chain_id}) \
                                 stopped: {result:?}",
                            );
                        }
                        _ = shutdown.recv() => {
                            tracing::trace!(
                                "Stopping collector ({tag}) on \
                                 ({chain_id})",
                            );
                        }
                    }
                });
            }
            AmbKind::LayerZero => {
                let endpoint = resolved.endpoint_address.ok_or(
                    escrow_relayer_utils::Error::Generic(
                        "layerZero collector needs an endpoint address",
                    ),
                )?;
                let collector = LayerZeroCollector::<SledStore>::builder()
                    .chain_id(chain_id)
                    .incentives_address(resolved.incentives_address)
                    .endpoint_address(endpoint)
                    .eid_to_chain(eid_to_chain.clone())
                    .config(getter_config.clone())
                    .store(store.clone())
                    .monitor(port)
                    .client(provider.clone())
                    .build();
                tokio::spawn(async move {
                    tokio::select! {
                        result = collector.run() => {
                            tracing::warn!(
                                "collector ({tag}) on ({chain_id}) \
                                 stopped: {result:?}",
                            );
                        }
                        _ = shutdown.recv() => {
                            tracing::trace!(
                                "Stopping collector ({tag}) on \
                                 ({chain_id})",
                            );
                        }
                    }
                });
            }
        }
    }

    // the wallet and the submitter riding on it.
    if submitter_config.enabled {
        let client = ctx.evm_signer(chain_id)?;
        let (wallet, wallet_handle) = EvmWallet::new(
            chain_id,
            WalletConfig::from_submitter(&submitter_config),
            client.clone(),
        );
        {
            let mut shutdown = ctx.shutdown_signal();
            let fatal_ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = wallet.run() => {
                        if let Err(e) = result {
                            // a stalled wallet takes the process down.
                            fatal_ctx.fatal(e.to_string());
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::trace!(
                            "Stopping wallet for ({chain_id})",
                        );
                    }
                }
            });
        }

        let submitter = Submitter::new(
            chain_id,
            submitter_config,
            escrow_addresses,
            store,
            client,
            wallet_handle,
        );
        let mut shutdown = ctx.shutdown_signal();
        tokio::spawn(async move {
            tokio::select! {
                result = submitter.run() => {
                    tracing::warn!(
                        "submitter for ({chain_id}) stopped: {result:?}",
                    );
                }
                _ = shutdown.recv() => {
                    tracing::trace!(
                        "Stopping submitter for ({chain_id})",
                    );
                }
            }
        });
    } else {
        tracing::warn!("Submitter is disabled for ({chain_id}).");
    }
    Ok(())
}
