//! Ed25519 key material shared by the overlay identity and the wallet
//!
//! Private keys persist as PKCS#8 PEM. Public keys travel either as hex
//! (HTTP headers) or as SPKI PEM (transaction submissions).

use crate::{types::sha256, Error, NodeId, Result};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use std::path::Path;

/// An ed25519 signing keypair
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS random source
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).map_err(|e| Error::Key(format!("random source: {}", e)))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Load a PEM keypair from `path`, creating and saving one if it is missing
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let pem = std::fs::read_to_string(path)?;
            let signing = SigningKey::from_pkcs8_pem(&pem)
                .map_err(|e| Error::Key(format!("{}: {}", path.display(), e)))?;
            tracing::debug!("Loaded keypair from {}", path.display());
            return Ok(Self { signing });
        }

        let keypair = Self::generate()?;
        keypair.save(path)?;
        tracing::info!("Generated new keypair at {}", path.display());
        Ok(keypair)
    }

    /// Write the private key as PKCS#8 PEM
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pem = self
            .signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Key(e.to_string()))?;
        std::fs::write(path, pem.as_bytes())?;
        Ok(())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().as_bytes())
    }

    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Key(e.to_string()))
    }

    /// Overlay identifier derived from the public key
    pub fn node_id(&self) -> NodeId {
        sha256(self.public_key().as_bytes())
    }

    /// Sign `message`, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", &self.public_key_hex()[..16])
    }
}

/// Check `signature` over `message` against `public_key`
///
/// Malformed signatures are a plain `false`, never an error.
pub fn verify(signature: &[u8], message: &[u8], public_key: &VerifyingKey) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    public_key.verify_strict(message, &signature).is_ok()
}

pub fn public_key_from_hex(s: &str) -> Result<VerifyingKey> {
    let bytes = crate::hex_to_hash(s.trim()).map_err(|e| Error::Validation(format!("public key: {}", e)))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Validation(format!("public key: {}", e)))
}

pub fn public_key_from_pem(pem: &str) -> Result<VerifyingKey> {
    VerifyingKey::from_public_key_pem(pem.trim())
        .map_err(|e| Error::Validation(format!("public key: {}", e)))
}
