use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSignature {
    pub public_key_hex: String,
    pub signature_hex: String,
}

pub fn verify_digest_signature_hex(
    sha256_hex_digest: &str,
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let digest = hex::decode(sha256_hex_digest.trim())
        .context("failed to decode artifact digest hex")?;
    if digest.len() != 32 {
        return Err(anyhow!(
            "invalid artifact digest length: expected 32 bytes, got {}",
            digest.len()
        ));
    }

    let verifying_key = decode_public_key(public_key_hex)?;
    let signature = decode_signature(signature_hex)?;
    Ok(verifying_key.verify(&digest, &signature).is_ok())
}

fn decode_public_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(public_key_hex.trim()).context("failed to decode publisher key hex")?;
    let len = bytes.len();
    let array: [u8; 32] = bytes.try_into().map_err(|_| {
        anyhow!("invalid publisher key length: expected 32 bytes, got {len}")
    })?;
    VerifyingKey::from_bytes(&array).context("invalid publisher key bytes")
}

fn decode_signature(signature_hex: &str) -> Result<Signature> {
    let bytes = hex::decode(signature_hex.trim()).context("failed to decode signature hex")?;
    let len = bytes.len();
    let array: [u8; 64] = bytes.try_into().map_err(|_| {
        anyhow!("invalid signature length: expected 64 bytes, got {len}")
    })?;
    Ok(Signature::from_bytes(&array))
}
