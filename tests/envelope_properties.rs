use anyhow::Result;
use std::collections::HashSet;

use detection_ledger::envelope::{
    open_payload, seal_payload, unwrap_dek, wrap_dek, Dek, SealedPayload, WrapScheme,
};
use detection_ledger::LedgerError;

fn assert_authentication_failure(sealed: &SealedPayload, dek: &Dek) {
    let err = open_payload(sealed, dek).expect_err("tampered payload must not open");
    assert!(
        matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::Authentication)
        ),
        "expected Authentication, got {:?}",
        err
    );
}

#[test]
fn payload_round_trip() -> Result<()> {
    let dek = Dek::generate();
    for plaintext in [
        &b""[..],
        &b"x"[..],
        &br#"{"total_karung":4,"nama_karung":"sack"}"#[..],
        &[0u8; 4096][..],
    ] {
        let sealed = seal_payload(plaintext, &dek)?;
        let opened = open_payload(&sealed, &dek)?;
        assert_eq!(opened, plaintext);
    }
    Ok(())
}

#[test]
fn wrong_dek_fails_authentication() -> Result<()> {
    let dek = Dek::generate();
    let other = Dek::generate();
    let sealed = seal_payload(b"counts", &dek)?;
    assert_authentication_failure(&sealed, &other);
    Ok(())
}

#[test]
fn every_bit_flip_is_detected() -> Result<()> {
    let dek = Dek::generate();
    let sealed = seal_payload(b"tamper target", &dek)?;

    for byte in 0..sealed.ciphertext.len() {
        for bit in 0..8 {
            let mut mutated = sealed.clone();
            mutated.ciphertext[byte] ^= 1 << bit;
            assert_authentication_failure(&mutated, &dek);
        }
    }
    for byte in 0..sealed.nonce.len() {
        for bit in 0..8 {
            let mut mutated = sealed.clone();
            mutated.nonce[byte] ^= 1 << bit;
            assert_authentication_failure(&mutated, &dek);
        }
    }
    for byte in 0..sealed.tag.len() {
        for bit in 0..8 {
            let mut mutated = sealed.clone();
            mutated.tag[byte] ^= 1 << bit;
            assert_authentication_failure(&mutated, &dek);
        }
    }
    Ok(())
}

#[test]
fn wrap_round_trip_and_wrong_key() -> Result<()> {
    let master = [7u8; 32];
    let wrong_master = [8u8; 32];
    let dek = Dek::generate();

    let material = wrap_dek(&dek, 1, 1, WrapScheme::MasterKey, &master, None)?;
    assert_eq!(material.scheme, WrapScheme::MasterKey);
    assert_eq!(material.key_version, 1);

    let recovered = unwrap_dek(&material, 1, &master, None)?;
    assert_eq!(recovered, dek);

    let err = unwrap_dek(&material, 1, &wrong_master, None).expect_err("wrong KEK must fail");
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Unwrap(_))
    ));
    Ok(())
}

#[test]
fn tampered_wrap_blob_fails() -> Result<()> {
    let master = [1u8; 32];
    let dek = Dek::generate();
    let mut material = wrap_dek(&dek, 3, 1, WrapScheme::MasterKey, &master, None)?;
    let last = material.wrapped.len() - 1;
    material.wrapped[last] ^= 0x01;
    assert!(unwrap_dek(&material, 3, &master, None).is_err());
    Ok(())
}

#[test]
fn nonces_never_repeat_under_one_dek() -> Result<()> {
    let dek = Dek::generate();
    let mut seen = HashSet::new();
    for _ in 0..10_000 {
        let sealed = seal_payload(b"same plaintext", &dek)?;
        assert!(seen.insert(sealed.nonce), "nonce collision");
    }
    Ok(())
}

#[test]
fn same_plaintext_yields_distinct_ciphertext() -> Result<()> {
    let dek = Dek::generate();
    let first = seal_payload(b"repeated", &dek)?;
    let second = seal_payload(b"repeated", &dek)?;
    assert_ne!(first.ciphertext, second.ciphertext);
    Ok(())
}
