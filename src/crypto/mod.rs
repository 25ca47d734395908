pub mod asymmetric;
pub mod jws;

pub const SHA256_LENGTH: usize = 32;

/// Computes the SHA2-256 digest over the provided byte slice.
///
/// # Panics
///
/// If the hashing engine returns a digest with an unexpected length.
pub fn sha256(input: &[u8]) -> [u8; SHA256_LENGTH] {
    aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, input)
        .as_ref()
        .try_into()
        .expect("SHA256 returned a hash with size != 32")
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("JSON encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    SignatureGeneration(&'static str),
    #[error("{0}")]
    EncodingFailed(&'static str),
}
