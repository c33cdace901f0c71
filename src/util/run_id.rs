use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use uuid::Uuid;

const RUN_ID_LEN_BYTES: usize = 16;

/// Fresh run id for one daemon process: a v4 UUID, base64 without padding.
pub fn new_run_id() -> String {
    encode_uuid(Uuid::new_v4())
}

pub fn encode_uuid(uuid: Uuid) -> String {
    STANDARD_NO_PAD.encode(uuid.as_bytes())
}

/// Normalizes a run id copied from a log line or snapshot. URL-safe input
/// is accepted and re-encoded in the standard alphabet.
pub fn parse_run_id(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('=');
    let decoded = STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .with_context(|| format!("invalid base64 run id '{input}'"))?;
    if decoded.len() != RUN_ID_LEN_BYTES {
        return Err(anyhow!(
            "invalid run id length: expected {} bytes, got {}",
            RUN_ID_LEN_BYTES,
            decoded.len()
        ));
    }
    Ok(STANDARD_NO_PAD.encode(decoded))
}
