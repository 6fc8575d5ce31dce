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

use derive_more::Display;
/// Target for the probe logger.
pub const TARGET: &str = "escrow_probe";

/// The Kind of the Probe.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// When the Lifecycle of the Relayer changes, like starting or
    /// shutting down.
    #[display(fmt = "lifecycle")]
    Lifecycle,
    /// Getter sync state on a specific chain.
    #[display(fmt = "sync")]
    Sync,
    /// Per-chain wallet state (submission, repricing, cancellation).
    #[display(fmt = "tx_wallet")]
    TxWallet,
    /// Submitter pipeline state on a specific chain.
    #[display(fmt = "submitter")]
    Submitter,
    /// Collector state on a specific (chain, AMB) pair.
    #[display(fmt = "collector")]
    Collector,
    /// Store pub-sub bus traffic.
    #[display(fmt = "bus")]
    Bus,
    /// When the relayer will retry to do something.
    #[display(fmt = "retry")]
    Retry,
}
