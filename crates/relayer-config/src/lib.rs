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
//! # Relayer Configuration Module
//!
//! Loads and validates the `config.<env>.yaml` file driving the relayer:
//! the global relayer section (key, log level, getter and submitter
//! defaults), the enabled AMBs, and the chain list with its per-chain
//! overrides.

/// CLI configuration.
#[cfg(feature = "cli")]
pub mod cli;
/// Utils for loading and verifying configuration files.
pub mod utils;

use std::collections::HashMap;

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use escrow_relayer_types::{PrivateKey, RpcUrl};

const fn default_port() -> u16 {
    9933
}
const fn enabled_default() -> bool {
    true
}
const fn default_true() -> bool {
    true
}

/// The root configuration of the escrow relayer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EscrowRelayerConfig {
    /// Global relayer settings and worker defaults.
    pub relayer: RelayerSection,
    /// Enabled AMBs, keyed by their configured tag.
    #[serde(default)]
    pub ambs: HashMap<String, AmbConfig>,
    /// The chains this relayer serves.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

impl EscrowRelayerConfig {
    /// The effective getter configuration of a chain.
    pub fn getter_for(&self, chain: &ChainConfig) -> GetterConfig {
        self.relayer.getter.apply(&chain.getter)
    }

    /// The effective submitter configuration of a chain.
    pub fn submitter_for(&self, chain: &ChainConfig) -> SubmitterConfig {
        self.relayer.submitter.apply(&chain.submitter)
    }

    /// The effective per-(chain, AMB) settings, merged over the global
    /// AMB section.
    pub fn amb_for(
        &self,
        amb_name: &str,
        chain: &ChainConfig,
    ) -> escrow_relayer_utils::Result<ResolvedAmbConfig> {
        let global = self.ambs.get(amb_name).ok_or_else(|| {
            escrow_relayer_utils::Error::AmbNotFound {
                amb: amb_name.to_string(),
            }
        })?;
        let overrides = chain.ambs.get(amb_name);
        let incentives_address = overrides
            .and_then(|o| o.incentives_address)
            .or(global.incentives_address)
            .ok_or(escrow_relayer_utils::Error::Generic(
                "missing incentivesAddress for AMB",
            ))?;
        Ok(ResolvedAmbConfig {
            incentives_address,
            private_key: global.private_key.clone(),
            endpoint_address: overrides.and_then(|o| o.endpoint_address),
            eid: overrides.and_then(|o| o.eid),
        })
    }

    /// The chain config for a chain id.
    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

/// Global relayer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayerSection {
    /// The relayer's signing key, shared by all chain wallets.
    #[serde(skip_serializing)]
    pub private_key: PrivateKey,
    /// Log level name (`trace`..`error`).
    #[serde(default)]
    pub log_level: Option<String>,
    /// Port of the HTTP query API.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Getter defaults, overridable per chain.
    #[serde(default)]
    pub getter: GetterConfig,
    /// Submitter defaults, overridable per chain.
    #[serde(default)]
    pub submitter: SubmitterConfig,
}

/// Getter (bounty scanner) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GetterConfig {
    /// Milliseconds between retries of a failed RPC call.
    pub retry_interval: u64,
    /// Milliseconds between scan cycles.
    pub processing_interval: u64,
    /// Upper bound on blocks fetched per `getLogs` window.
    pub max_blocks: u64,
    /// First block to scan; defaults to the chain tip at startup.
    pub starting_block: Option<u64>,
    /// Last block to scan; the worker exits cleanly once reached.
    pub stopping_block: Option<u64>,
}

impl Default for GetterConfig {
    fn default() -> Self {
        Self {
            retry_interval: 2_000,
            processing_interval: 100,
            max_blocks: 1_000,
            starting_block: None,
            stopping_block: None,
        }
    }
}

impl GetterConfig {
    /// Applies a per-chain override on top of these defaults.
    pub fn apply(&self, overrides: &GetterOverrides) -> GetterConfig {
        GetterConfig {
            retry_interval: overrides
                .retry_interval
                .unwrap_or(self.retry_interval),
            processing_interval: overrides
                .processing_interval
                .unwrap_or(self.processing_interval),
            max_blocks: overrides.max_blocks.unwrap_or(self.max_blocks),
            starting_block: overrides
                .starting_block
                .or(self.starting_block),
            stopping_block: overrides
                .stopping_block
                .or(self.stopping_block),
        }
    }
}

/// Per-chain getter overrides; unset fields fall back to the globals.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GetterOverrides {
    /// See [`GetterConfig::retry_interval`].
    pub retry_interval: Option<u64>,
    /// See [`GetterConfig::processing_interval`].
    pub processing_interval: Option<u64>,
    /// See [`GetterConfig::max_blocks`].
    pub max_blocks: Option<u64>,
    /// See [`GetterConfig::starting_block`].
    pub starting_block: Option<u64>,
    /// See [`GetterConfig::stopping_block`].
    pub stopping_block: Option<u64>,
}

/// Submitter and wallet settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SubmitterConfig {
    /// Whether the submitter runs at all on this chain.
    pub enabled: bool,
    /// Milliseconds to hold fresh orders before evaluating them.
    pub new_orders_delay: u64,
    /// Milliseconds between retries inside the pipeline queues.
    pub retry_interval: u64,
    /// Milliseconds between queue scheduling ticks.
    pub processing_interval: u64,
    /// Attempts per order before it fails terminally.
    pub max_tries: u32,
    /// Global in-flight cap across the eval/submit/confirm pipeline and
    /// the wallet.
    pub max_pending_transactions: usize,
    /// Extra block confirmations required after the receipt.
    pub confirmations: u64,
    /// Milliseconds a broadcast transaction may stay unconfirmed before
    /// the wallet reprices it.
    pub confirmation_timeout: u64,
    /// Gas added on top of the simulation estimate, keyed by AMB tag
    /// with a `default` entry.
    pub gas_limit_buffer: HashMap<String, u64>,
    /// Hard cap applied as `maxFeePerGas` (wei); RPC estimate if unset.
    pub max_fee_per_gas: Option<u128>,
    /// Multiplier over the RPC priority fee.
    pub max_priority_fee_adjustment_factor: Option<f64>,
    /// Cap on the adjusted priority fee (wei).
    pub max_allowed_priority_fee_per_gas: Option<u128>,
    /// Multiplier over the RPC legacy gas price.
    pub gas_price_adjustment_factor: Option<f64>,
    /// Cap on the adjusted legacy gas price (wei).
    pub max_allowed_gas_price: Option<u128>,
    /// Fee multiplier applied when replacing a stuck transaction.
    pub priority_adjustment_factor: Option<f64>,
    /// Warn when the relayer account balance estimate drops below this
    /// many wei.
    pub low_balance_warning: Option<u128>,
    /// Use legacy (pre EIP-1559) gas pricing on this chain.
    pub legacy_transactions: bool,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            new_orders_delay: 0,
            retry_interval: 2_000,
            processing_interval: 100,
            max_tries: 3,
            max_pending_transactions: 50,
            confirmations: 1,
            confirmation_timeout: 90_000,
            gas_limit_buffer: HashMap::new(),
            max_fee_per_gas: None,
            max_priority_fee_adjustment_factor: None,
            max_allowed_priority_fee_per_gas: None,
            gas_price_adjustment_factor: None,
            max_allowed_gas_price: None,
            priority_adjustment_factor: None,
            low_balance_warning: None,
            legacy_transactions: false,
        }
    }
}

impl SubmitterConfig {
    /// Applies a per-chain override on top of these defaults.
    pub fn apply(&self, overrides: &SubmitterOverrides) -> SubmitterConfig {
        SubmitterConfig {
            enabled: overrides.enabled.unwrap_or(self.enabled),
            new_orders_delay: overrides
                .new_orders_delay
                .unwrap_or(self.new_orders_delay),
            retry_interval: overrides
                .retry_interval
                .unwrap_or(self.retry_interval),
            processing_interval: overrides
                .processing_interval
                .unwrap_or(self.processing_interval),
            max_tries: overrides.max_tries.unwrap_or(self.max_tries),
            max_pending_transactions: overrides
                .max_pending_transactions
                .unwrap_or(self.max_pending_transactions),
            confirmations: overrides
                .confirmations
                .unwrap_or(self.confirmations),
            confirmation_timeout: overrides
                .confirmation_timeout
                .unwrap_or(self.confirmation_timeout),
            gas_limit_buffer: if overrides.gas_limit_buffer.is_empty() {
                self.gas_limit_buffer.clone()
            } else {
                overrides.gas_limit_buffer.clone()
            },
            max_fee_per_gas: overrides
                .max_fee_per_gas
                .or(self.max_fee_per_gas),
            max_priority_fee_adjustment_factor: overrides
                .max_priority_fee_adjustment_factor
                .or(self.max_priority_fee_adjustment_factor),
            max_allowed_priority_fee_per_gas: overrides
                .max_allowed_priority_fee_per_gas
                .or(self.max_allowed_priority_fee_per_gas),
            gas_price_adjustment_factor: overrides
                .gas_price_adjustment_factor
                .or(self.gas_price_adjustment_factor),
            max_allowed_gas_price: overrides
                .max_allowed_gas_price
                .or(self.max_allowed_gas_price),
            priority_adjustment_factor: overrides
                .priority_adjustment_factor
                .or(self.priority_adjustment_factor),
            low_balance_warning: overrides
                .low_balance_warning
                .or(self.low_balance_warning),
            legacy_transactions: overrides
                .legacy_transactions
                .unwrap_or(self.legacy_transactions),
        }
    }

    /// The gas limit buffer for an AMB, falling back to the `default`
    /// entry.
    pub fn gas_limit_buffer_for(&self, amb: &str) -> u64 {
        self.gas_limit_buffer
            .get(amb)
            .or_else(|| self.gas_limit_buffer.get("default"))
            .copied()
            .unwrap_or(0)
    }
}

/// Per-chain submitter overrides; unset fields fall back to the globals.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SubmitterOverrides {
    /// See [`SubmitterConfig::enabled`].
    pub enabled: Option<bool>,
    /// See [`SubmitterConfig::new_orders_delay`].
    pub new_orders_delay: Option<u64>,
    /// See [`SubmitterConfig::retry_interval`].
    pub retry_interval: Option<u64>,
    /// See [`SubmitterConfig::processing_interval`].
    pub processing_interval: Option<u64>,
    /// See [`SubmitterConfig::max_tries`].
    pub max_tries: Option<u32>,
    /// See [`SubmitterConfig::max_pending_transactions`].
    pub max_pending_transactions: Option<usize>,
    /// See [`SubmitterConfig::confirmations`].
    pub confirmations: Option<u64>,
    /// See [`SubmitterConfig::confirmation_timeout`].
    pub confirmation_timeout: Option<u64>,
    /// See [`SubmitterConfig::gas_limit_buffer`].
    pub gas_limit_buffer: HashMap<String, u64>,
    /// See [`SubmitterConfig::max_fee_per_gas`].
    pub max_fee_per_gas: Option<u128>,
    /// See [`SubmitterConfig::max_priority_fee_adjustment_factor`].
    pub max_priority_fee_adjustment_factor: Option<f64>,
    /// See [`SubmitterConfig::max_allowed_priority_fee_per_gas`].
    pub max_allowed_priority_fee_per_gas: Option<u128>,
    /// See [`SubmitterConfig::gas_price_adjustment_factor`].
    pub gas_price_adjustment_factor: Option<f64>,
    /// See [`SubmitterConfig::max_allowed_gas_price`].
    pub max_allowed_gas_price: Option<u128>,
    /// See [`SubmitterConfig::priority_adjustment_factor`].
    pub priority_adjustment_factor: Option<f64>,
    /// See [`SubmitterConfig::low_balance_warning`].
    pub low_balance_warning: Option<u128>,
    /// See [`SubmitterConfig::legacy_transactions`].
    pub legacy_transactions: Option<bool>,
}

/// The closed set of supported bridge protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmbKind {
    /// The signed-message reference bridge.
    Mock,
    /// The LayerZero V2 endpoint sniffer.
    LayerZero,
}

impl AmbKind {
    /// Resolves a configured AMB tag into its kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "mock" => Some(Self::Mock),
            "layerZero" | "layerzero" => Some(Self::LayerZero),
            _ => None,
        }
    }
}

/// Global configuration of one AMB.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AmbConfig {
    /// Whether collectors for this AMB are started.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// The escrow address, unless overridden per chain.
    #[serde(default)]
    pub incentives_address: Option<Address>,
    /// The attestation signing key (mock bridge only).
    #[serde(default, skip_serializing)]
    pub private_key: Option<PrivateKey>,
}

/// Per-(chain, AMB) overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChainAmbOverrides {
    /// Chain-local escrow address.
    pub incentives_address: Option<Address>,
    /// Chain-local bridge endpoint (LayerZero).
    pub endpoint_address: Option<Address>,
    /// The LayerZero endpoint id of this chain.
    pub eid: Option<u32>,
}

/// Fully resolved per-(chain, AMB) settings.
#[derive(Debug, Clone)]
pub struct ResolvedAmbConfig {
    /// The escrow address on this chain.
    pub incentives_address: Address,
    /// The attestation signing key (mock bridge only).
    pub private_key: Option<PrivateKey>,
    /// The bridge endpoint on this chain (LayerZero).
    pub endpoint_address: Option<Address>,
    /// The LayerZero endpoint id of this chain.
    pub eid: Option<u32>,
}

/// One chain served by the relayer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// The EVM chain id.
    pub chain_id: u64,
    /// Human readable name, for the logs.
    #[serde(default)]
    pub name: Option<String>,
    /// Http(s) endpoint for the chain RPC.
    #[serde(skip_serializing)]
    pub rpc: RpcUrl,
    /// Whether workers are started for this chain.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Getter overrides.
    #[serde(default)]
    pub getter: GetterOverrides,
    /// Submitter overrides.
    #[serde(default)]
    pub submitter: SubmitterOverrides,
    /// Per-AMB overrides, keyed by AMB tag.
    #[serde(flatten)]
    pub ambs: HashMap<String, ChainAmbOverrides>,
}

impl ChainConfig {
    /// The name used in the logs.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.chain_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fall_back_to_defaults() {
        let global = GetterConfig::default();
        let overrides = GetterOverrides {
            max_blocks: Some(50),
            starting_block: Some(100),
            ..Default::default()
        };
        let effective = global.apply(&overrides);
        assert_eq!(effective.max_blocks, 50);
        assert_eq!(effective.starting_block, Some(100));
        assert_eq!(effective.retry_interval, global.retry_interval);
    }

    #[test]
    fn gas_limit_buffer_falls_back_to_default_entry() {
        let mut config = SubmitterConfig::default();
        config.gas_limit_buffer.insert("default".into(), 25_000);
        config.gas_limit_buffer.insert("mock".into(), 10_000);
        assert_eq!(config.gas_limit_buffer_for("mock"), 10_000);
        assert_eq!(config.gas_limit_buffer_for("layerZero"), 25_000);
    }

    #[test]
    fn amb_tags_resolve_to_kinds() {
        assert_eq!(AmbKind::from_tag("mock"), Some(AmbKind::Mock));
        assert_eq!(
            AmbKind::from_tag("layerZero"),
            Some(AmbKind::LayerZero)
        );
        assert_eq!(AmbKind::from_tag("wormhole"), None);
    }
}
