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

//! The GARP message framing.
//!
//! Every cross-chain message emitted by the escrow is framed as:
//!
//! ```text
//! byte  0        context (delivery / ack leg)
//! bytes 1..33    message identifier
//! bytes 33..53   source application address
//! bytes 53..73   destination application address
//! bytes 73..     application payload
//! ```

use ethers::types::{Address, Bytes, H256};
use escrow_relayer_utils::Error;

/// Context tag of the delivery leg (source to destination).
pub const CTX_SOURCE_TO_DESTINATION: u8 = 0x00;
/// Context tag of the ack leg (destination back to source).
pub const CTX_DESTINATION_TO_SOURCE: u8 = 0x01;

const HEADER_LEN: usize = 1 + 32 + 20 + 20;

/// A decoded GARP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GarpMessage {
    /// The leg this message belongs to, see the `CTX_*` constants.
    pub context: u8,
    /// The unique identifier tying all per-message state together.
    pub message_identifier: H256,
    /// The application that sent the message on the source chain.
    pub sender: Address,
    /// The application the message is addressed to.
    pub destination: Address,
    /// The opaque application payload.
    pub payload: Bytes,
}

impl GarpMessage {
    /// Whether this message is the delivery leg.
    pub fn is_delivery(&self) -> bool {
        self.context == CTX_SOURCE_TO_DESTINATION
    }

    /// Decodes a raw GARP message.
    pub fn decode(raw: &[u8]) -> escrow_relayer_utils::Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::MalformedRecord(format!(
                "GARP message too short: {} bytes, expected at least {}",
                raw.len(),
                HEADER_LEN,
            )));
        }
        Ok(Self {
            context: raw[0],
            message_identifier: H256::from_slice(&raw[1..33]),
            sender: Address::from_slice(&raw[33..53]),
            destination: Address::from_slice(&raw[53..73]),
            payload: Bytes::from(raw[HEADER_LEN..].to_vec()),
        })
    }

    /// Encodes this message back into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.context);
        out.extend_from_slice(self.message_identifier.as_bytes());
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(self.destination.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GarpMessage {
        GarpMessage {
            context: CTX_SOURCE_TO_DESTINATION,
            message_identifier: H256::from_low_u64_be(0xaaaa),
            sender: Address::from_low_u64_be(0x1111),
            destination: Address::from_low_u64_be(0x2222),
            payload: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
        }
    }

    #[test]
    fn roundtrip() {
        let message = sample();
        let decoded = GarpMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let message = GarpMessage {
            payload: Bytes::default(),
            ..sample()
        };
        let decoded = GarpMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn rejects_truncated_header() {
        let raw = sample().encode();
        assert!(GarpMessage::decode(&raw[..HEADER_LEN - 1]).is_err());
    }
}
