// Node-originated request signing (spec §6: "HMAC-SHA256 signatures
// with timestamp anti-replay, window ±60s"). The canonical message is
// `METHOD\nPATH\nTIMESTAMP\nBODY`, the common shape across the wider
// example pack's request-signing code (mirrors the intent, not the
// wire format, of `Dicklesworthstone-asupersync`'s HMAC-chained
// capability tokens: a key, a canonical byte string, constant-time
// comparison).

use hmac::{Hmac, Mac};
use orbit_base::error::{err, Result};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const REPLAY_WINDOW: chrono::Duration = chrono::Duration::seconds(60);

fn canonical_message(method: &str, path: &str, timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(method.len() + path.len() + body.len() + 24);
    msg.extend_from_slice(method.as_bytes());
    msg.push(b'\n');
    msg.extend_from_slice(path.as_bytes());
    msg.push(b'\n');
    msg.extend_from_slice(timestamp.to_string().as_bytes());
    msg.push(b'\n');
    msg.extend_from_slice(body);
    msg
}

/// Compute the hex-encoded signature a node would attach to a request,
/// for building outbound requests or for test fixtures.
pub fn sign(secret: &[u8], method: &str, path: &str, timestamp: i64, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| err(format!("invalid hmac key: {e}")))?;
    mac.update(&canonical_message(method, path, timestamp, body));
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

/// Verify a node-originated request's signature and timestamp freshness.
/// Constant-time comparison is delegated to `hmac`'s own
/// `verify_slice`, never a manual `==` over the digest.
pub fn verify(
    secret: &[u8],
    method: &str,
    path: &str,
    timestamp: i64,
    body: &[u8],
    signature_hex: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let request_time = chrono::DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| err("invalid request timestamp"))?;
    let skew = (now - request_time).num_seconds().abs();
    if skew > REPLAY_WINDOW.num_seconds() {
        return Err(err(format!("request timestamp outside {}s anti-replay window", REPLAY_WINDOW.num_seconds())));
    }

    let signature = hex_decode(signature_hex).ok_or_else(|| err("signature is not valid hex"))?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| err(format!("invalid hmac key: {e}")))?;
    mac.update(&canonical_message(method, path, timestamp, body));
    mac.verify_slice(&signature).map_err(|_| err("signature mismatch"))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
