use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// A Veilchain signing identity: ECDSA P-256 keypair with the public half
/// pre-rendered as PEM (the on-chain representation).
///
/// The secret scalar is zeroized on drop by the underlying `SigningKey`.
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    public_key_pem: String,
}

impl KeyPair {
    /// Generate a fresh P-256 keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = *signing_key.verifying_key();
        let public_key_pem = verifying_key
            .to_public_key_pem(LineEnding::LF)
            .expect("SPKI encoding of a valid P-256 key is infallible");
        Self {
            signing_key,
            verifying_key,
            public_key_pem,
        }
    }

    /// Build a keypair from a raw 32-byte secret scalar. Fails when the
    /// bytes do not encode a valid P-256 scalar.
    pub fn from_secret_scalar_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_bytes(p256::FieldBytes::from_slice(bytes))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Restore a keypair from PKCS#8 DER private-key bytes (e.g. loaded
    /// from an encrypted key file).
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// PKCS#8 DER encoding of the private key; wrapped so the buffer is
    /// wiped when the caller drops it.
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let doc = self
            .signing_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// PEM (SPKI) encoding of the public key — the form stored on-chain.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Sign `message`; returns the fixed-size signature base64-encoded.
    pub fn sign(&self, message: &[u8]) -> String {
        let sig: Signature = self.signing_key.sign(message);
        BASE64.encode(sig.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature_b64: &str) -> Result<(), CryptoError> {
        verify_with_key(&self.verifying_key, message, signature_b64)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ public_key: <P-256 SPKI> }}")
    }
}

/// Verify a base64 detached signature against a PEM public key.
pub fn verify_signature(
    public_key_pem: &str,
    message: &[u8],
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_public_key_pem(public_key_pem)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    verify_with_key(&key, message, signature_b64)
}

fn verify_with_key(
    key: &VerifyingKey,
    message: &[u8],
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let raw = BASE64
        .decode(signature_b64)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sig = Signature::from_slice(&raw).map_err(|_| CryptoError::InvalidSignature)?;
    key.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let kp = KeyPair::generate();
        let message = b"permissioned ledger canonical content";
        let sig = kp.sign(message);
        assert!(verify_signature(kp.public_key_pem(), message, &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"original");
        assert!(verify_signature(kp.public_key_pem(), b"tampered", &sig).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = kp.sign(b"message");
        assert!(verify_signature(other.public_key_pem(), b"message", &sig).is_err());
    }

    #[test]
    fn pkcs8_round_trip_preserves_identity() {
        let kp = KeyPair::generate();
        let der = kp.to_pkcs8_der().unwrap();
        let restored = KeyPair::from_pkcs8_der(&der).unwrap();
        assert_eq!(kp.public_key_pem(), restored.public_key_pem());

        let sig = restored.sign(b"payload");
        assert!(verify_signature(kp.public_key_pem(), b"payload", &sig).is_ok());
    }
}
