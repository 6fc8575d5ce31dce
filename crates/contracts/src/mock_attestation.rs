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

//! The mock AMB attestation scheme.
//!
//! The mock escrow accepts any message carrying an ECDSA signature over
//! `keccak256(bytes32(escrow_address) ‖ message)` from the configured
//! signer. The signature travels in the payload context, ABI-encoded as
//! `(uint8 v, uint256 r, uint256 s)`.

use ethers::abi::{self, ParamType, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, RecoveryMessage, Signature, H256, U256};
use ethers::utils::keccak256;
use escrow_relayer_utils::Error;

use crate::address_to_bytes32;

/// The preimage the mock escrow verifies: the escrow address left-padded
/// to 32 bytes, followed by the raw message.
pub fn encode_message(escrow: Address, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + message.len());
    out.extend_from_slice(&address_to_bytes32(escrow));
    out.extend_from_slice(message);
    out
}

/// The digest the attestation signs.
pub fn message_digest(escrow: Address, message: &[u8]) -> H256 {
    H256::from(keccak256(encode_message(escrow, message)))
}

/// ABI-encodes a signature as `(uint8 v, uint256 r, uint256 s)`.
pub fn encode_signature(signature: &Signature) -> Bytes {
    abi::encode(&[
        Token::Uint(U256::from(signature.v)),
        Token::Uint(signature.r),
        Token::Uint(signature.s),
    ])
    .into()
}

/// Decodes a signature previously encoded with [`encode_signature`].
pub fn decode_signature(raw: &[u8]) -> escrow_relayer_utils::Result<Signature> {
    let tokens = abi::decode(
        &[
            ParamType::Uint(8),
            ParamType::Uint(256),
            ParamType::Uint(256),
        ],
        raw,
    )?;
    match (&tokens[0], &tokens[1], &tokens[2]) {
        (Token::Uint(v), Token::Uint(r), Token::Uint(s)) => Ok(Signature {
            v: v.as_u64(),
            r: *r,
            s: *s,
        }),
        _ => Err(Error::MalformedRecord(
            "mock signature tokens of unexpected shape".into(),
        )),
    }
}

/// Signs the attestation over `message` with the relayer's mock key and
/// returns the encoded proof context.
pub fn sign(
    wallet: &LocalWallet,
    escrow: Address,
    message: &[u8],
) -> escrow_relayer_utils::Result<Bytes> {
    let signature = wallet.sign_hash(message_digest(escrow, message))?;
    Ok(encode_signature(&signature))
}

/// Recovers the signer address of an encoded attestation.
pub fn recover(
    escrow: Address,
    message: &[u8],
    context: &[u8],
) -> escrow_relayer_utils::Result<Address> {
    let signature = decode_signature(context)?;
    let digest = message_digest(escrow, message);
    Ok(signature.recover(RecoveryMessage::Hash(digest))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ONE: &str =
        "0x0000000000000000000000000000000000000000000000000000000000000001";
    const KEY_TWO: &str =
        "0x0000000000000000000000000000000000000000000000000000000000000002";

    #[test]
    fn sign_encode_recover_roundtrip() {
        let wallet: LocalWallet = KEY_ONE.parse().unwrap();
        let escrow = Address::from_low_u64_be(0x5555);
        let message = b"an arbitrary cross-chain message".to_vec();

        let context = sign(&wallet, escrow, &message).unwrap();
        // v (as uint8), r and s each padded to one word.
        assert_eq!(context.len(), 96);
        let recovered = recover(escrow, &message, &context).unwrap();
        assert_eq!(recovered, wallet.address());
    }

    #[test]
    fn recover_rejects_wrong_message() {
        let wallet: LocalWallet = KEY_TWO.parse().unwrap();
        let escrow = Address::from_low_u64_be(0x5555);
        let context = sign(&wallet, escrow, b"original").unwrap();
        let recovered = recover(escrow, b"tampered", &context).unwrap();
        assert_ne!(recovered, wallet.address());
    }
}
