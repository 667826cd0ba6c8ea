use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::template::{self, Macros};
use crate::types::SignatureConfig;

type HmacSha256 = Hmac<Sha256>;

/// Signature to attach to an outgoing postback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostbackSignature {
    /// Query parameter name and value.
    pub param: (String, String),
    /// Header name and value.
    pub header: (String, String),
}

/// Sign the rendered signature template of a profile.
///
/// Returns `None` when signing is disabled for the profile. The payload is
/// built from `config.payload_template`, never from the final URL.
pub fn sign_postback(config: &SignatureConfig, macros: &Macros) -> Option<PostbackSignature> {
    if !config.enabled {
        return None;
    }

    let payload = template::render(&config.payload_template, macros);
    let signature = compute_signature(config.secret.as_bytes(), payload.as_bytes());

    Some(PostbackSignature {
        param: (config.param_name.clone(), signature.clone()),
        header: (config.header_name.clone(), signature),
    })
}

/// Compute the lowercase hex HMAC-SHA256 of `payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    // HMAC accepts keys of any length, including empty ones.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a received signature, for tracker-side receivers.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&signature).is_ok()
}
