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

use std::str::FromStr;

use ethereum_types::Secret;
use serde::Deserialize;

/// PrivateKey represents a secp256k1 private key loaded from the config.
///
/// The accepted formats are:
/// 1. a raw hex string with the `0x` prefix
///    (`0x8917…0318`),
/// 2. `$VAR`, the name of an environment variable holding such a hex
///    string,
/// 3. `file:<path>`, a file whose content is such a hex string.
#[derive(Clone)]
pub struct PrivateKey(Secret);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").finish()
    }
}

impl From<Secret> for PrivateKey {
    fn from(secret: Secret) -> Self {
        PrivateKey(secret)
    }
}

impl std::ops::Deref for PrivateKey {
    type Target = Secret;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn parse_hex_key<E: serde::de::Error>(value: &str) -> Result<Secret, E> {
    Secret::from_str(value).map_err(|e| {
        E::custom(format!(
            "{e}\n expected a 66 chars string (including the 0x prefix) \
             but found {} chars",
            value.len()
        ))
    })
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PrivateKeyVisitor;
        impl<'de> serde::de::Visitor<'de> for PrivateKeyVisitor {
            type Value = Secret;

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                formatter.write_str(
                    "hex string, $ENV_VAR or file:<path> containing a hex \
                     string",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value.starts_with("0x") {
                    parse_hex_key(value)
                } else if let Some(var) = value.strip_prefix('$') {
                    tracing::trace!("Reading {} from env", var);
                    let val = std::env::var(var).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "error while loading the env var {var}: {e}",
                        ))
                    })?;
                    parse_hex_key(val.trim())
                } else if let Some(path) = value.strip_prefix("file:") {
                    let val =
                        std::fs::read_to_string(path).map_err(|e| {
                            serde::de::Error::custom(format!(
                                "error while reading file path {path}: {e}",
                            ))
                        })?;
                    parse_hex_key(val.trim())
                } else {
                    Err(serde::de::Error::custom(
                        "expected a 0x-prefixed hex string, $ENV_VAR or \
                         file:<path>",
                    ))
                }
            }
        }

        let secret = deserializer.deserialize_str(PrivateKeyVisitor)?;
        Ok(Self(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        key: PrivateKey,
    }

    #[test]
    fn parses_raw_hex() {
        let raw = r#"{"key": "0x000000000000000000000000000000000000000000000000000000000000dead"}"#;
        let w: Wrapper = serde_json::from_str(raw).unwrap();
        assert_eq!(w.key.as_bytes()[31], 0xad);
    }

    #[test]
    fn parses_env_var() {
        std::env::set_var(
            "TEST_RELAYER_PK",
            "0x000000000000000000000000000000000000000000000000000000000000beef",
        );
        let raw = r#"{"key": "$TEST_RELAYER_PK"}"#;
        let w: Wrapper = serde_json::from_str(raw).unwrap();
        assert_eq!(w.key.as_bytes()[31], 0xef);
    }

    #[test]
    fn rejects_garbage() {
        let raw = r#"{"key": "not-a-key"}"#;
        assert!(serde_json::from_str::<Wrapper>(raw).is_err());
    }
}
