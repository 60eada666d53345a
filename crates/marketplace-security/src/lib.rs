mod checksum;
mod signature;

pub use checksum::{sha256_hex, verify_sha256_digest, Sha256Stream};
pub use signature::{verify_digest_signature_hex, ArtifactSignature};
