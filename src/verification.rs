use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the GitHub-style signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const PREFIX: &str = "sha256=";

fn mac_for(secret: &str, body: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
    mac.update(body);
    mac
}

/// Produce the `sha256=<hex>` header value for `body` signed with `secret`.
pub fn sign(body: &[u8], secret: &str) -> String {
    let digest = mac_for(secret, body).finalize().into_bytes();
    format!("{PREFIX}{}", hex::encode(digest))
}

/// Verify a GitHub-style HMAC signature over the raw, unparsed body.
/// Expects header value like "sha256=<hex>".
///
/// The digest comparison goes through `Mac::verify_slice`, which is
/// constant-time with respect to the position of the first differing byte.
pub fn verify(body: &[u8], signature_header: &str, secret: &str) -> bool {
    let expected_hex = match signature_header.trim().strip_prefix(PREFIX) {
        Some(h) => h,
        None => return false,
    };
    let expected = match hex::decode(expected_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    mac_for(secret, body).verify_slice(&expected).is_ok()
}
