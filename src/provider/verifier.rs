//! Signed server list verification
//!
//! A package is `{"data": ..., "signature": ..., "signingPublicKeyDigest": ...}`.
//! The digest must be base64(SHA-256(embedded key text)); the signature is
//! RSASSA-PKCS1-v1_5 with SHA-256 over `data`, checked against the embedded
//! base64 SubjectPublicKeyInfo key.

use crate::common::error::VerifyError;
use base64::Engine;
use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Authenticates a signed package and returns its data
pub trait SignedListVerifier: Send + Sync {
    fn verify(&self, package: &[u8], public_key: &str) -> Result<String, VerifyError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedPackage {
    data: Option<String>,
    signature: Option<String>,
    signing_public_key_digest: Option<String>,
}

/// RSA/SHA-256 verifier backed by `ring`
#[derive(Debug, Default, Clone, Copy)]
pub struct RsaSha256Verifier;

impl SignedListVerifier for RsaSha256Verifier {
    fn verify(&self, package: &[u8], public_key: &str) -> Result<String, VerifyError> {
        let package: SignedPackage = serde_json::from_slice(package)
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let (Some(data), Some(signature), Some(digest)) = (
            package.data,
            package.signature,
            package.signing_public_key_digest,
        ) else {
            return Err(VerifyError::Malformed("missing package field".into()));
        };

        let public_key = public_key.trim();
        let expected = base64::engine::general_purpose::STANDARD
            .encode(Sha256::digest(public_key.as_bytes()));
        if !bool::from(expected.as_bytes().ct_eq(digest.trim().as_bytes())) {
            return Err(VerifyError::WrongKey);
        }

        let spki = decode_base64(public_key)?;
        let rsa_key = spki_subject_public_key(&spki)
            .ok_or_else(|| VerifyError::Malformed("invalid public key".into()))?;
        let signature = decode_base64(&signature)?;

        UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, rsa_key)
            .verify(data.as_bytes(), &signature)
            .map_err(|_| VerifyError::InvalidSignature)?;

        Ok(data)
    }
}

fn decode_base64(value: &str) -> Result<Vec<u8>, VerifyError> {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| VerifyError::Malformed(e.to_string()))
}

/// Extract the PKCS#1 RSAPublicKey from a DER SubjectPublicKeyInfo:
/// SEQUENCE { SEQUENCE { algorithm }, BIT STRING { 0x00, key } }
fn spki_subject_public_key(spki: &[u8]) -> Option<&[u8]> {
    let (tag, body, _) = der_element(spki)?;
    if tag != 0x30 {
        return None;
    }
    let (tag, _algorithm, rest) = der_element(body)?;
    if tag != 0x30 {
        return None;
    }
    let (tag, bits, _) = der_element(rest)?;
    if tag != 0x03 {
        return None;
    }
    match bits.split_first() {
        Some((0, key)) if !key.is_empty() => Some(key),
        _ => None,
    }
}

/// Split one DER element into (tag, contents, remainder)
fn der_element(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let len = rest[..n]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}
