use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::IngressError;

/// Header GitHub puts the body signature in.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

fn keyed(secret: &[u8]) -> Result<HmacSha256, IngressError> {
    HmacSha256::new_from_slice(secret).map_err(|_| IngressError::SignatureMismatch)
}

/// Signature header value for `body`, as GitHub computes it.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, IngressError> {
    let mut mac = keyed(secret)?;
    mac.update(body);
    Ok(format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes())))
}

/// Check `header` against the HMAC-SHA256 of the raw body.
/// The digest comparison is constant-time.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    header: Option<&str>,
) -> Result<(), IngressError> {
    let header = header.ok_or(IngressError::MissingSignature)?;
    let provided = header
        .trim()
        .strip_prefix(PREFIX)
        .and_then(|digest| hex::decode(digest).ok())
        .ok_or(IngressError::SignatureMismatch)?;

    let mut mac = keyed(secret)?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| IngressError::SignatureMismatch)
}
