//! Utility functions for hashing, identifiers and serialization

use super::error::WorkflowError;
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32, e.g. `cert_1...`
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Hex encoded SHA-256 of `bytes`. Every content address in the crate is one of these.
pub fn content_hash(bytes: &[u8]) -> String {
    sha256::digest(bytes)
}

pub fn to_cbor<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, WorkflowError> {
    minicbor::to_vec(value).map_err(|e| WorkflowError::Codec(e.to_string()))
}

pub fn from_cbor<T>(bytes: &[u8]) -> Result<T, WorkflowError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| WorkflowError::Codec(e.to_string()))
}
