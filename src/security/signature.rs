use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::domain::error::ControlError;

type HmacSha256 = Hmac<Sha256>;

#[must_use]
pub fn canonical_payload(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| *key);
            out.push('{');
            for (index, (key, item)) in entries.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn secret_bytes(secret: &str) -> Vec<u8> {
    match BASE64.decode(secret.trim()) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => secret.as_bytes().to_vec(),
    }
}

fn compute_mac(payload: &Value, secret: &str) -> Option<Vec<u8>> {
    let canonical = canonical_payload(payload);
    let mut mac = HmacSha256::new_from_slice(&secret_bytes(secret)).ok()?;
    mac.update(canonical.as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}

pub fn sign_payload(payload: &Value, secret: &str) -> Result<String, ControlError> {
    let mac = compute_mac(payload, secret)
        .ok_or_else(|| ControlError::Protocol("signing key rejected".to_owned()))?;
    Ok(BASE64.encode(mac))
}

#[must_use]
pub fn verify_payload(payload: &Value, signature: &str, secret: &str) -> bool {
    let Some(expected) = compute_mac(payload, secret) else {
        return false;
    };
    let Ok(provided) = BASE64.decode(signature.trim()) else {
        return false;
    };
    expected.ct_eq(&provided).into()
}
