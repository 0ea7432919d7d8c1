//! Hex boundary types shared with the API layer.
//!
//! The external API layer speaks hex strings over the wire; the bridge
//! speaks raw bytes. These types are the translation, kept here so both
//! sides agree on field names and casing (uppercase hex out, any casing
//! accepted in).

use serde::{Deserialize, Serialize};

use crate::bridge::{BridgeError, BridgeResult, SignOutput};

/// An incoming sign request as the API layer hands it over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    /// Command selector forwarded verbatim to the native module.
    pub cmd: String,
    /// Hex-encoded payload bytes.
    pub src: String,
    /// Caller-chosen sequence number, non-negative.
    pub seq: u32,
}

impl SignRequest {
    /// Decode the hex payload. Malformed hex is a client fault and never
    /// reaches the native call.
    pub fn decode_payload(&self) -> BridgeResult<Vec<u8>> {
        hex::decode(self.src.trim())
            .map_err(|e| BridgeError::InvalidInput(format!("invalid hex payload: {}", e)))
    }
}

/// A completed sign result, hex-encoded for the wire.
///
/// Field names match the wire schema the API layer serves (`sign`, not
/// `signature`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignReply {
    /// Uppercase hex token bytes.
    pub token: String,
    /// Uppercase hex auxiliary bytes.
    pub extra: String,
    /// Uppercase hex signature bytes.
    pub sign: String,
}

impl SignReply {
    /// Encode a bridge result for the wire.
    pub fn from_output(output: &SignOutput) -> Self {
        Self {
            token: hex::encode_upper(&output.token),
            extra: hex::encode_upper(&output.extra),
            sign: hex::encode_upper(&output.signature),
        }
    }

    /// Decode back into raw buffers. Used to verify the encoding boundary
    /// is lossless.
    pub fn decode(&self) -> BridgeResult<SignOutput> {
        let field = |name: &str, value: &str| {
            hex::decode(value)
                .map_err(|e| BridgeError::InvalidInput(format!("invalid hex in {}: {}", name, e)))
        };
        Ok(SignOutput {
            token: field("token", &self.token)?,
            extra: field("extra", &self.extra)?,
            signature: field("sign", &self.sign)?,
        })
    }
}
