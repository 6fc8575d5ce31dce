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

//! The LayerZero V2 packet framing.
//!
//! ```text
//! bytes 0..8      nonce, big endian
//! bytes 8..12     source endpoint id
//! bytes 12..44    sender, address left-padded to 32 bytes
//! bytes 44..48    destination endpoint id
//! bytes 48..80    receiver, address left-padded to 32 bytes
//! bytes 80..112   guid
//! bytes 112..     inner message
//! ```

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use escrow_relayer_utils::Error;

const HEADER_LEN: usize = 8 + 4 + 32 + 4 + 32 + 32;

/// A decoded endpoint packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Channel nonce assigned by the endpoint.
    pub nonce: u64,
    /// Source endpoint id.
    pub src_eid: u32,
    /// The application that sent the packet.
    pub sender: Address,
    /// Destination endpoint id.
    pub dst_eid: u32,
    /// The application the packet is addressed to.
    pub receiver: Address,
    /// The globally unique packet id.
    pub guid: H256,
    /// The inner message.
    pub message: Bytes,
}

impl Packet {
    /// Decodes a raw encoded packet.
    pub fn decode(raw: &[u8]) -> escrow_relayer_utils::Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::MalformedRecord(format!(
                "packet too short: {} bytes, expected at least {}",
                raw.len(),
                HEADER_LEN,
            )));
        }
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&raw[0..8]);
        let mut src_eid_bytes = [0u8; 4];
        src_eid_bytes.copy_from_slice(&raw[8..12]);
        let mut dst_eid_bytes = [0u8; 4];
        dst_eid_bytes.copy_from_slice(&raw[44..48]);
        Ok(Self {
            nonce: u64::from_be_bytes(nonce_bytes),
            src_eid: u32::from_be_bytes(src_eid_bytes),
            sender: Address::from_slice(&raw[24..44]),
            dst_eid: u32::from_be_bytes(dst_eid_bytes),
            receiver: Address::from_slice(&raw[60..80]),
            guid: H256::from_slice(&raw[80..112]),
            message: Bytes::from(raw[HEADER_LEN..].to_vec()),
        })
    }

    /// Encodes this packet back into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.message.len());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.src_eid.to_be_bytes());
        out.extend_from_slice(&escrow_contracts::address_to_bytes32(
            self.sender,
        ));
        out.extend_from_slice(&self.dst_eid.to_be_bytes());
        out.extend_from_slice(&escrow_contracts::address_to_bytes32(
            self.receiver,
        ));
        out.extend_from_slice(self.guid.as_bytes());
        out.extend_from_slice(&self.message);
        out
    }

    /// The hash the detached attestation will be correlated by:
    /// `keccak256(abi.encode(bytes32 guid, bytes message))`.
    pub fn payload_hash(&self) -> H256 {
        let encoded = abi::encode(&[
            Token::FixedBytes(self.guid.as_bytes().to_vec()),
            Token::Bytes(self.message.to_vec()),
        ]);
        H256::from(keccak256(encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet {
            nonce: 7,
            src_eid: 30101,
            sender: Address::from_low_u64_be(0x1111),
            dst_eid: 30102,
            receiver: Address::from_low_u64_be(0x2222),
            guid: H256::from_low_u64_be(0xfeed),
            message: Bytes::from(vec![1, 2, 3, 4, 5]),
        }
    }

    #[test]
    fn roundtrip() {
        let packet = sample();
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrip_empty_message() {
        let packet = Packet {
            message: Bytes::default(),
            ..sample()
        };
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_truncated_header() {
        let raw = sample().encode();
        assert!(Packet::decode(&raw[..HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn payload_hash_commits_to_guid_and_message() {
        let a = sample();
        let mut b = sample();
        b.guid = H256::from_low_u64_be(0xbeef);
        assert_ne!(a.payload_hash(), b.payload_hash());
        let mut c = sample();
        c.message = Bytes::from(vec![9]);
        assert_ne!(a.payload_hash(), c.payload_hash());
        // nonce is not part of the commitment.
        let mut d = sample();
        d.nonce = 100;
        assert_eq!(a.payload_hash(), d.payload_hash());
    }
}
