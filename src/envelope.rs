//! Envelope encryption for detection payloads.
//!
//! Each warehouse owns one data-encryption key (DEK). Payload bytes are
//! sealed under the DEK with ChaCha20-Poly1305; the DEK itself is stored
//! only in wrapped form, under either the process master key or the
//! tenant KEM public key. The master key never touches payload bytes.

use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::LedgerError;

pub const DEK_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub const WRAP_SCHEME_MASTER_KEY: &str = "master-key";
pub const WRAP_SCHEME_ML_KEM_768: &str = "ml-kem-768";

/// Which key wraps tenant DEKs. One scheme per deployment; the chosen
/// scheme is recorded next to every wrapped blob so historical records
/// stay decryptable after a deployment switches.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WrapScheme {
    #[default]
    MasterKey,
    Kem,
}

impl std::fmt::Display for WrapScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WrapScheme::MasterKey => WRAP_SCHEME_MASTER_KEY,
            WrapScheme::Kem => WRAP_SCHEME_ML_KEM_768,
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for WrapScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            WRAP_SCHEME_MASTER_KEY => Ok(WrapScheme::MasterKey),
            WRAP_SCHEME_ML_KEM_768 => Ok(WrapScheme::Kem),
            other => Err(anyhow!("unknown wrap scheme: {}", other)),
        }
    }
}

/// Per-tenant data-encryption key. Zeroed on drop so the unwrapped key
/// never outlives the operation that needed it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Dek([u8; DEK_LEN]);

impl Dek {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DEK_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DEK_LEN]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; DEK_LEN] {
        &self.0
    }
}

impl PartialEq for Dek {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Dek {}

impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes stay out of logs.
        write!(f, "Dek(..)")
    }
}

/// A wrapped DEK as persisted on the warehouse row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantKeyMaterial {
    pub scheme: WrapScheme,
    pub key_version: u32,
    pub wrapped: Vec<u8>,
}

/// Detached-tag AEAD output for one detection payload. All three fields
/// are persisted together or not at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

const PAYLOAD_AAD: &[u8] = b"detection-payload";

fn wrap_aad(warehouse_id: i64, key_version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(10 + 8 + 4);
    aad.extend_from_slice(b"tenant-dek");
    aad.extend_from_slice(&warehouse_id.to_le_bytes());
    aad.extend_from_slice(&key_version.to_le_bytes());
    aad
}

/// Wrap a freshly generated DEK for a warehouse under the deployment's
/// scheme. The AAD binds warehouse id and key version, so a blob moved to
/// another tenant row or version fails to unwrap.
pub fn wrap_dek(
    dek: &Dek,
    warehouse_id: i64,
    key_version: u32,
    scheme: WrapScheme,
    master_key: &[u8; 32],
    kem_keypair: Option<&KemKeypair>,
) -> Result<TenantKeyMaterial> {
    let aad = wrap_aad(warehouse_id, key_version);
    let wrapped = match scheme {
        WrapScheme::MasterKey => wrap_under_key(master_key, &aad, dek.as_bytes())?,
        WrapScheme::Kem => {
            let kem_keypair = kem_keypair.ok_or_else(|| {
                LedgerError::TenantKeyUnavailable("KEM keypair missing for wrap".to_string())
            })?;
            let (kem_ct, shared_secret) = kem_encapsulate(kem_keypair)?;
            let mut kdf_info = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut kdf_info);
            let mut kek = kdf_kek(&shared_secret, &kdf_info);
            let inner = wrap_under_key(&kek, &aad, dek.as_bytes())?;
            kek.zeroize();

            let mut out = Vec::with_capacity(4 + kem_ct.len() + 32 + inner.len());
            out.extend_from_slice(&(kem_ct.len() as u32).to_le_bytes());
            out.extend_from_slice(&kem_ct);
            out.extend_from_slice(&kdf_info);
            out.extend_from_slice(&inner);
            out
        }
    };
    Ok(TenantKeyMaterial {
        scheme,
        key_version,
        wrapped,
    })
}

/// Inverse of [`wrap_dek`]. Dispatches on the scheme recorded with the
/// blob, not on the deployment default.
pub fn unwrap_dek(
    material: &TenantKeyMaterial,
    warehouse_id: i64,
    master_key: &[u8; 32],
    kem_keypair: Option<&KemKeypair>,
) -> Result<Dek> {
    let aad = wrap_aad(warehouse_id, material.key_version);
    match material.scheme {
        WrapScheme::MasterKey => unwrap_under_key(master_key, &aad, &material.wrapped),
        WrapScheme::Kem => {
            let kem_keypair = kem_keypair.ok_or_else(|| {
                LedgerError::Unwrap("KEM keypair missing for unwrap".to_string())
            })?;
            let mut cursor = 0usize;
            let ct_len = read_u32(&material.wrapped, &mut cursor)? as usize;
            let kem_ct = read_slice(&material.wrapped, &mut cursor, ct_len)?;
            let kdf_info = read_slice(&material.wrapped, &mut cursor, 32)?.to_vec();
            let inner = material.wrapped[cursor..].to_vec();

            let shared_secret = kem_decapsulate(kem_keypair, kem_ct)?;
            let mut kek = kdf_kek(&shared_secret, &kdf_info);
            let dek = unwrap_under_key(&kek, &aad, &inner);
            kek.zeroize();
            dek
        }
    }
}

/// Authenticated encryption of one payload. The nonce is freshly random
/// per call; reuse under the same DEK would break confidentiality, so
/// nonces are never derived or counted.
pub fn seal_payload(plaintext: &[u8], dek: &Dek) -> Result<SealedPayload> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut ciphertext = plaintext.to_vec();
    let tag = encrypt_detached(dek.as_bytes(), &nonce, PAYLOAD_AAD, &mut ciphertext)?;
    Ok(SealedPayload {
        ciphertext,
        nonce,
        tag,
    })
}

/// Fails closed with [`LedgerError::Authentication`] on any tag mismatch;
/// the AEAD verifies the tag in constant time before releasing a byte.
pub fn open_payload(sealed: &SealedPayload, dek: &Dek) -> Result<Vec<u8>> {
    let mut clear = sealed.ciphertext.clone();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(dek.as_bytes()));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            PAYLOAD_AAD,
            &mut clear,
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|_| LedgerError::Authentication)?;
    Ok(clear)
}

fn encrypt_detached(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_LEN]> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, buffer)
        .map_err(|_| anyhow!("payload encryption failed"))?;
    Ok(tag.into())
}

fn wrap_under_key(key: &[u8; 32], aad: &[u8], dek_bytes: &[u8; DEK_LEN]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut ciphertext = dek_bytes.to_vec();
    let tag = encrypt_detached(key, &nonce, aad, &mut ciphertext)?;
    let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn unwrap_under_key(key: &[u8; 32], aad: &[u8], wrap: &[u8]) -> Result<Dek> {
    if wrap.len() < NONCE_LEN + TAG_LEN + DEK_LEN {
        return Err(LedgerError::Unwrap("wrapped DEK truncated".to_string()).into());
    }
    let nonce = &wrap[..NONCE_LEN];
    let tag = &wrap[NONCE_LEN..NONCE_LEN + TAG_LEN];
    let mut ciphertext = wrap[NONCE_LEN + TAG_LEN..].to_vec();

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut ciphertext,
            Tag::from_slice(tag),
        )
        .map_err(|_| LedgerError::Unwrap("wrapped DEK failed integrity check".to_string()))?;

    if ciphertext.len() != DEK_LEN {
        ciphertext.zeroize();
        return Err(LedgerError::Unwrap("unwrapped DEK length mismatch".to_string()).into());
    }
    let mut bytes = [0u8; DEK_LEN];
    bytes.copy_from_slice(&ciphertext);
    ciphertext.zeroize();
    Ok(Dek::from_bytes(bytes))
}

fn kdf_kek(shared_secret: &[u8], kdf_info: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(kdf_info);
    hasher.finalize().into()
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *cursor + len > bytes.len() {
        return Err(LedgerError::Unwrap("wrapped DEK encoding invalid".to_string()).into());
    }
    let out = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(out)
}

#[derive(Clone, Debug)]
pub struct KemKeypair {
    #[cfg(feature = "pqc-wrap")]
    pub public: pqcrypto_kyber::kyber768::PublicKey,
    #[cfg(feature = "pqc-wrap")]
    pub secret: pqcrypto_kyber::kyber768::SecretKey,
}

#[cfg(feature = "pqc-wrap")]
impl KemKeypair {
    pub fn generate() -> Self {
        let (public, secret) = pqcrypto_kyber::kyber768::keypair();
        Self { public, secret }
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        use pqcrypto_traits::kem::PublicKey;
        self.public.as_bytes().to_vec()
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        use pqcrypto_traits::kem::SecretKey;
        self.secret.as_bytes().to_vec()
    }

    pub fn from_bytes(public: &[u8], secret: &[u8]) -> Result<Self> {
        use pqcrypto_traits::kem::{PublicKey, SecretKey};
        let public = pqcrypto_kyber::kyber768::PublicKey::from_bytes(public)
            .map_err(|_| LedgerError::KeyLoad("invalid KEM public key".to_string()))?;
        let secret = pqcrypto_kyber::kyber768::SecretKey::from_bytes(secret)
            .map_err(|_| LedgerError::KeyLoad("invalid KEM secret key".to_string()))?;
        Ok(Self { public, secret })
    }
}

#[cfg(not(feature = "pqc-wrap"))]
impl KemKeypair {
    pub fn generate() -> Self {
        Self {}
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        Vec::new()
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        Vec::new()
    }

    pub fn from_bytes(_public: &[u8], _secret: &[u8]) -> Result<Self> {
        Err(LedgerError::KeyLoad("pqc-wrap feature not enabled".to_string()).into())
    }
}

fn kem_encapsulate(kem: &KemKeypair) -> Result<(Vec<u8>, Vec<u8>)> {
    #[cfg(feature = "pqc-wrap")]
    {
        use pqcrypto_traits::kem::{Ciphertext, SharedSecret};
        let (shared, ct) = pqcrypto_kyber::kyber768::encapsulate(&kem.public);
        return Ok((ct.as_bytes().to_vec(), shared.as_bytes().to_vec()));
    }
    #[cfg(not(feature = "pqc-wrap"))]
    {
        let _ = kem;
        Err(LedgerError::TenantKeyUnavailable("pqc-wrap feature not enabled".to_string()).into())
    }
}

fn kem_decapsulate(kem: &KemKeypair, kem_ct: &[u8]) -> Result<Vec<u8>> {
    #[cfg(feature = "pqc-wrap")]
    {
        use pqcrypto_traits::kem::{Ciphertext, SharedSecret};
        let ct = pqcrypto_kyber::kyber768::Ciphertext::from_bytes(kem_ct)
            .map_err(|_| LedgerError::Unwrap("invalid KEM ciphertext".to_string()))?;
        let shared = pqcrypto_kyber::kyber768::decapsulate(&ct, &kem.secret);
        return Ok(shared.as_bytes().to_vec());
    }
    #[cfg(not(feature = "pqc-wrap"))]
    {
        let _ = (kem, kem_ct);
        Err(LedgerError::Unwrap("pqc-wrap feature not enabled".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_binds_warehouse_identity() -> Result<()> {
        let master = [9u8; 32];
        let dek = Dek::generate();
        let material = wrap_dek(&dek, 7, 1, WrapScheme::MasterKey, &master, None)?;

        // Same blob presented for a different warehouse must not unwrap.
        let err = unwrap_dek(&material, 8, &master, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::Unwrap(_))
        ));

        let recovered = unwrap_dek(&material, 7, &master, None)?;
        assert_eq!(recovered, dek);
        Ok(())
    }

    #[test]
    fn wrap_binds_key_version() -> Result<()> {
        let master = [3u8; 32];
        let dek = Dek::generate();
        let mut material = wrap_dek(&dek, 1, 1, WrapScheme::MasterKey, &master, None)?;
        material.key_version = 2;
        assert!(unwrap_dek(&material, 1, &master, None).is_err());
        Ok(())
    }

    #[test]
    fn wrap_scheme_parses_round_trip() -> Result<()> {
        for scheme in [WrapScheme::MasterKey, WrapScheme::Kem] {
            let parsed: WrapScheme = scheme.to_string().parse()?;
            assert_eq!(parsed, scheme);
        }
        assert!("fernet".parse::<WrapScheme>().is_err());
        Ok(())
    }

    #[cfg(feature = "pqc-wrap")]
    #[test]
    fn kem_wrap_round_trip() -> Result<()> {
        let master = [0u8; 32];
        let keypair = KemKeypair::generate();
        let dek = Dek::generate();
        let material = wrap_dek(&dek, 4, 1, WrapScheme::Kem, &master, Some(&keypair))?;
        assert_eq!(material.scheme, WrapScheme::Kem);
        let recovered = unwrap_dek(&material, 4, &master, Some(&keypair))?;
        assert_eq!(recovered, dek);

        let other = KemKeypair::generate();
        assert!(unwrap_dek(&material, 4, &master, Some(&other)).is_err());
        Ok(())
    }
}
