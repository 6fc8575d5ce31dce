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

use std::path::Path;

use config::{Config, Environment, File, FileFormat};

use crate::{AmbKind, EscrowRelayerConfig};

/// The config file name for an environment tag, `config.<env>.yaml`.
pub fn config_file_name(env: &str) -> String {
    format!("config.{env}.yaml")
}

/// Parses the configuration from a YAML file plus the `RELAYER`-prefixed
/// environment overlay, then validates it.
pub fn parse_from_file<P: AsRef<Path>>(
    path: P,
) -> escrow_relayer_utils::Result<EscrowRelayerConfig> {
    tracing::trace!("Loading config file: {}", path.as_ref().display());
    let builder = Config::builder()
        .add_source(File::from(path.as_ref()).format(FileFormat::Yaml))
        .add_source(
            Environment::with_prefix("RELAYER")
                .separator("__")
                .try_parsing(true),
        );
    let cfg = builder.build()?;
    let config: Result<
        EscrowRelayerConfig,
        serde_path_to_error::Error<config::ConfigError>,
    > = serde_path_to_error::deserialize(cfg);
    match config {
        Ok(c) => {
            verify(&c)?;
            Ok(c)
        }
        Err(e) => {
            tracing::error!("{}", e);
            Err(e.into())
        }
    }
}

/// Loads `config.<env>.yaml` from a directory.
pub fn load<P: AsRef<Path>>(
    config_dir: P,
    env: &str,
) -> escrow_relayer_utils::Result<EscrowRelayerConfig> {
    let path = config_dir.as_ref().join(config_file_name(env));
    if !path.is_file() {
        tracing::error!(
            "No config file at {} for environment `{}`",
            path.display(),
            env,
        );
        return Err(escrow_relayer_utils::Error::Generic(
            "config file not found for the selected environment",
        ));
    }
    parse_from_file(path)
}

/// Makes sure the config is valid by going through the whole config and
/// doing some basic checks. The process must refuse to start on any
/// violation.
pub fn verify(
    config: &EscrowRelayerConfig,
) -> escrow_relayer_utils::Result<()> {
    tracing::trace!("Checking configuration sanity ...");
    if config.chains.iter().filter(|c| c.enabled).count() == 0 {
        return Err(escrow_relayer_utils::Error::Generic(
            "no enabled chains configured",
        ));
    }
    for (tag, amb) in config.ambs.iter().filter(|(_, a)| a.enabled) {
        let Some(kind) = AmbKind::from_tag(tag) else {
            tracing::error!("Unknown AMB tag in config: {}", tag);
            return Err(escrow_relayer_utils::Error::Generic(
                "unknown AMB tag in config",
            ));
        };
        if kind == AmbKind::Mock && amb.private_key.is_none() {
            return Err(escrow_relayer_utils::Error::MissingSecrets);
        }
        for chain in config.chains.iter().filter(|c| c.enabled) {
            let resolved = config.amb_for(tag, chain)?;
            if kind == AmbKind::LayerZero
                && (resolved.endpoint_address.is_none()
                    || resolved.eid.is_none())
            {
                tracing::error!(
                    "layerZero on chain {} needs endpointAddress and eid",
                    chain.chain_id,
                );
                return Err(escrow_relayer_utils::Error::Generic(
                    "incomplete layerZero chain configuration",
                ));
            }
        }
    }
    for chain in config.chains.iter().filter(|c| c.enabled) {
        let getter = config.getter_for(chain);
        if getter.max_blocks == 0 {
            return Err(escrow_relayer_utils::Error::Generic(
                "maxBlocks must be positive",
            ));
        }
        if let (Some(start), Some(stop)) =
            (getter.starting_block, getter.stopping_block)
        {
            if stop < start {
                return Err(escrow_relayer_utils::Error::Generic(
                    "stoppingBlock precedes startingBlock",
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
relayer:
  private-key: "0x0000000000000000000000000000000000000000000000000000000000000001"
  log-level: debug
  getter:
    max-blocks: 1000
    retry-interval: 2000
  submitter:
    max-tries: 3
    max-pending-transactions: 10
    gas-limit-buffer:
      default: 25000
      mock: 10000
ambs:
  mock:
    incentives-address: "0x00000000000000000000000000000000000000aa"
    private-key: "0x0000000000000000000000000000000000000000000000000000000000000002"
  layerzero:
    incentives-address: "0x00000000000000000000000000000000000000aa"
chains:
  - chain-id: 1
    name: local-one
    rpc: "http://localhost:8545"
    getter:
      starting-block: 100
      max-blocks: 50
    layerzero:
      endpoint-address: "0x00000000000000000000000000000000000000bb"
      eid: 30101
  - chain-id: 2
    name: local-two
    rpc: "http://localhost:8546"
    layerzero:
      endpoint-address: "0x00000000000000000000000000000000000000cc"
      eid: 30102
"#;

    fn write_sample(dir: &std::path::Path, env: &str) {
        let mut f = std::fs::File::create(dir.join(config_file_name(env)))
            .unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
    }

    #[test]
    fn loads_and_merges_the_sample() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "test");
        let config = load(dir.path(), "test").unwrap();

        assert_eq!(config.chains.len(), 2);
        let one = config.chain(1).unwrap();
        let getter = config.getter_for(one);
        // per-chain override wins, globals fill the rest.
        assert_eq!(getter.max_blocks, 50);
        assert_eq!(getter.starting_block, Some(100));
        assert_eq!(getter.retry_interval, 2_000);

        let submitter = config.submitter_for(one);
        assert_eq!(submitter.max_pending_transactions, 10);
        assert_eq!(submitter.gas_limit_buffer_for("mock"), 10_000);
        assert_eq!(submitter.gas_limit_buffer_for("layerzero"), 25_000);

        let lz = config.amb_for("layerzero", one).unwrap();
        assert_eq!(lz.eid, Some(30101));
        assert!(lz.endpoint_address.is_some());
    }

    #[test]
    fn missing_environment_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "test");
        assert!(load(dir.path(), "production").is_err());
    }

    #[test]
    fn verify_rejects_inverted_block_range() {
        let dir = tempfile::tempdir().unwrap();
        let bad = SAMPLE.replace(
            "starting-block: 100",
            "starting-block: 100\n      stopping-block: 50",
        );
        std::fs::write(dir.path().join(config_file_name("test")), bad)
            .unwrap();
        assert!(load(dir.path(), "test").is_err());
    }
}
