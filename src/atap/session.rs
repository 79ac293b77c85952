//! Per-provisioning-attempt session state and key agreement.
//!
//! Each attempt generates a fresh ephemeral key pair. Once the device's
//! public key arrives in the CA Request, the shared secret is computed with
//! the negotiated curve and run through HKDF-SHA-256 twice: once for the
//! AES-128-GCM session key, once for the SoM authentication challenge.

use crate::{
    atap::{Algorithm, Operation, ECDH_KEY_LEN, GCM_IV_LEN, GCM_TAG_LEN, SESSION_KEY_LEN},
    error::{Error, Result},
};
use aes_gcm::{aead::AeadInPlace, Aes128Gcm, Key, KeyInit, Nonce, Tag};
use curve25519_dalek::montgomery::MontgomeryPoint;
use hkdf::Hkdf;
use p256::{ecdh, elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

enum HostSecret {
    P256(SecretKey),
    X25519([u8; 32]),
}

/// Ephemeral state for one ATAP exchange.
pub struct AtapSession {
    algorithm: Algorithm,
    operation: Operation,
    host_secret: HostSecret,
    host_pub: [u8; ECDH_KEY_LEN],
    device_pub: Option<[u8; ECDH_KEY_LEN]>,
    shared_key: Option<[u8; SESSION_KEY_LEN]>,
    auth_value: Option<[u8; SESSION_KEY_LEN]>,
}

impl AtapSession {
    /// Start a session with a freshly generated host key pair.
    pub fn new(algorithm: Algorithm, operation: Operation) -> Self {
        match algorithm {
            Algorithm::X25519 => {
                let mut secret = [0u8; 32];
                OsRng.fill_bytes(&mut secret);
                Self::from_x25519_secret(secret, operation)
            }
            Algorithm::P256 => Self::from_p256_secret(SecretKey::random(&mut OsRng), operation),
        }
    }

    /// Build a session from a caller supplied secret. Used where the frame
    /// must be reproducible (the SoM status probe); provisioning always
    /// generates fresh keys through [`AtapSession::new`].
    pub(crate) fn from_fixed_secret(
        algorithm: Algorithm,
        secret: [u8; 32],
        operation: Operation,
    ) -> Self {
        match algorithm {
            Algorithm::X25519 => Self::from_x25519_secret(secret, operation),
            Algorithm::P256 => {
                let secret = SecretKey::from_slice(&secret).expect("non-zero scalar below n");
                Self::from_p256_secret(secret, operation)
            }
        }
    }

    fn from_x25519_secret(secret: [u8; 32], operation: Operation) -> Self {
        let public = MontgomeryPoint::mul_base_clamped(secret);
        // One zero pad byte brings the key to the P256 wire width.
        let mut host_pub = [0u8; ECDH_KEY_LEN];
        host_pub[..32].copy_from_slice(public.as_bytes());
        Self {
            algorithm: Algorithm::X25519,
            operation,
            host_secret: HostSecret::X25519(secret),
            host_pub,
            device_pub: None,
            shared_key: None,
            auth_value: None,
        }
    }

    fn from_p256_secret(secret: SecretKey, operation: Operation) -> Self {
        let encoded = secret.public_key().to_encoded_point(true);
        let mut host_pub = [0u8; ECDH_KEY_LEN];
        host_pub.copy_from_slice(encoded.as_bytes());
        Self {
            algorithm: Algorithm::P256,
            operation,
            host_secret: HostSecret::P256(secret),
            host_pub,
            device_pub: None,
            shared_key: None,
            auth_value: None,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn message_version(&self) -> u8 {
        self.operation.message_version()
    }

    pub fn host_pub(&self) -> &[u8; ECDH_KEY_LEN] {
        &self.host_pub
    }

    /// The SoM authentication challenge, available once keys are derived.
    pub fn auth_value(&self) -> Result<&[u8; SESSION_KEY_LEN]> {
        self.auth_value
            .as_ref()
            .ok_or_else(|| Error::CryptoFailure("session key not derived yet".into()))
    }

    /// Install the device's public key and derive the session keys.
    pub fn set_device_pub(&mut self, device_pub: [u8; ECDH_KEY_LEN]) -> Result<()> {
        let shared_secret = match (&self.host_secret, self.algorithm) {
            (HostSecret::P256(secret), Algorithm::P256) => {
                let peer = PublicKey::from_sec1_bytes(&device_pub).map_err(|_| {
                    Error::CryptoFailure("invalid device public key point".into())
                })?;
                let shared =
                    ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                shared.raw_secret_bytes().to_vec()
            }
            (HostSecret::X25519(secret), Algorithm::X25519) => {
                // Strip the pad byte added for wire width parity with P256.
                let mut peer = [0u8; 32];
                peer.copy_from_slice(&device_pub[..32]);
                let shared = MontgomeryPoint(peer).mul_clamped(*secret);
                if shared.as_bytes().iter().all(|&b| b == 0) {
                    return Err(Error::CryptoFailure("low order device public key".into()));
                }
                shared.as_bytes().to_vec()
            }
            _ => return Err(Error::CryptoFailure("algorithm mismatch".into())),
        };

        let mut salt = Vec::with_capacity(2 * ECDH_KEY_LEN);
        salt.extend_from_slice(&self.host_pub);
        salt.extend_from_slice(&device_pub);

        let hk = Hkdf::<Sha256>::new(Some(&salt), &shared_secret);
        let mut shared_key = [0u8; SESSION_KEY_LEN];
        hk.expand(b"KEY", &mut shared_key)
            .map_err(|_| Error::CryptoFailure("hkdf expand failed".into()))?;
        let mut auth_value = [0u8; SESSION_KEY_LEN];
        hk.expand(b"SIGN", &mut auth_value)
            .map_err(|_| Error::CryptoFailure("hkdf expand failed".into()))?;

        self.device_pub = Some(device_pub);
        self.shared_key = Some(shared_key);
        self.auth_value = Some(auth_value);
        Ok(())
    }

    fn cipher(&self) -> Result<Aes128Gcm> {
        let key = self
            .shared_key
            .as_ref()
            .ok_or_else(|| Error::CryptoFailure("session key not derived yet".into()))?;
        Ok(Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key)))
    }

    /// Seal a plaintext with a fresh random IV. AAD is empty on this wire.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; GCM_IV_LEN], Vec<u8>, [u8; GCM_TAG_LEN])> {
        let cipher = self.cipher()?;
        let mut iv = [0u8; GCM_IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), &[], &mut buffer)
            .map_err(|_| Error::CryptoFailure("gcm encrypt failed".into()))?;

        let mut tag_bytes = [0u8; GCM_TAG_LEN];
        tag_bytes.copy_from_slice(&tag);
        Ok((iv, buffer, tag_bytes))
    }

    /// Open a ciphertext; a tag mismatch is a crypto failure, not a parse
    /// error, so tampering is distinguishable from truncation.
    pub fn decrypt(
        &self,
        iv: &[u8; GCM_IV_LEN],
        ciphertext: &[u8],
        tag: &[u8; GCM_TAG_LEN],
    ) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(iv),
                &[],
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| Error::CryptoFailure("gcm decrypt failed".into()))?;
        Ok(buffer)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// The device half of the key exchange, built from the same primitives.
    pub struct FakeDevice {
        pub device_pub: [u8; ECDH_KEY_LEN],
        pub shared_key: [u8; SESSION_KEY_LEN],
        pub auth_value: [u8; SESSION_KEY_LEN],
    }

    impl FakeDevice {
        pub fn exchange(algorithm: Algorithm, host_pub: &[u8; ECDH_KEY_LEN]) -> Self {
            let (device_pub, shared) = match algorithm {
                Algorithm::X25519 => {
                    let mut secret = [0u8; 32];
                    OsRng.fill_bytes(&mut secret);
                    let mut device_pub = [0u8; ECDH_KEY_LEN];
                    device_pub[..32]
                        .copy_from_slice(MontgomeryPoint::mul_base_clamped(secret).as_bytes());
                    let mut peer = [0u8; 32];
                    peer.copy_from_slice(&host_pub[..32]);
                    let shared = MontgomeryPoint(peer).mul_clamped(secret);
                    (device_pub, shared.as_bytes().to_vec())
                }
                Algorithm::P256 => {
                    let secret = SecretKey::random(&mut OsRng);
                    let encoded = secret.public_key().to_encoded_point(true);
                    let mut device_pub = [0u8; ECDH_KEY_LEN];
                    device_pub.copy_from_slice(encoded.as_bytes());
                    let peer = PublicKey::from_sec1_bytes(host_pub).expect("host public key");
                    let shared =
                        ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                    (device_pub, shared.raw_secret_bytes().to_vec())
                }
            };

            let mut salt = Vec::with_capacity(2 * ECDH_KEY_LEN);
            salt.extend_from_slice(host_pub);
            salt.extend_from_slice(&device_pub);
            let hk = Hkdf::<Sha256>::new(Some(&salt), &shared);
            let mut shared_key = [0u8; SESSION_KEY_LEN];
            hk.expand(b"KEY", &mut shared_key).expect("hkdf");
            let mut auth_value = [0u8; SESSION_KEY_LEN];
            hk.expand(b"SIGN", &mut auth_value).expect("hkdf");

            Self {
                device_pub,
                shared_key,
                auth_value,
            }
        }

        pub fn seal(&self, plaintext: &[u8]) -> ([u8; GCM_IV_LEN], Vec<u8>, [u8; GCM_TAG_LEN]) {
            let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.shared_key));
            let mut iv = [0u8; GCM_IV_LEN];
            OsRng.fill_bytes(&mut iv);
            let mut buffer = plaintext.to_vec();
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&iv), &[], &mut buffer)
                .expect("gcm encrypt");
            let mut tag_bytes = [0u8; GCM_TAG_LEN];
            tag_bytes.copy_from_slice(&tag);
            (iv, buffer, tag_bytes)
        }
    }

    #[test]
    fn x25519_both_sides_agree() {
        let mut session = AtapSession::new(Algorithm::X25519, Operation::Issue);
        let device = FakeDevice::exchange(Algorithm::X25519, session.host_pub());
        session.set_device_pub(device.device_pub).expect("derive");

        assert_eq!(session.shared_key.expect("shared key"), device.shared_key);
        assert_eq!(*session.auth_value().expect("auth value"), device.auth_value);
    }

    #[test]
    fn p256_both_sides_agree() {
        let mut session = AtapSession::new(Algorithm::P256, Operation::IssueSom);
        let device = FakeDevice::exchange(Algorithm::P256, session.host_pub());
        session.set_device_pub(device.device_pub).expect("derive");

        assert_eq!(session.shared_key.expect("shared key"), device.shared_key);
        assert_eq!(*session.auth_value().expect("auth value"), device.auth_value);
    }

    #[test]
    fn derivation_is_deterministic_for_fixed_inputs() {
        let secret = [7u8; 32];
        let mut first = AtapSession::from_fixed_secret(Algorithm::X25519, secret, Operation::Issue);
        let mut second = AtapSession::from_fixed_secret(Algorithm::X25519, secret, Operation::Issue);
        let device = FakeDevice::exchange(Algorithm::X25519, first.host_pub());

        first.set_device_pub(device.device_pub).expect("derive");
        second.set_device_pub(device.device_pub).expect("derive");

        assert_eq!(first.shared_key, second.shared_key);
        assert_eq!(first.auth_value, second.auth_value);
    }

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let mut session = AtapSession::new(Algorithm::X25519, Operation::Issue);
        let device = FakeDevice::exchange(Algorithm::X25519, session.host_pub());
        session.set_device_pub(device.device_pub).expect("derive");

        let message = b"an opaque key bundle".to_vec();
        let (iv, ciphertext, tag) = session.encrypt(&message).expect("encrypt");
        assert_ne!(ciphertext, message);
        let plaintext = session.decrypt(&iv, &ciphertext, &tag).expect("decrypt");
        assert_eq!(plaintext, message);
    }

    #[test]
    fn tampered_tag_is_a_crypto_failure() {
        let mut session = AtapSession::new(Algorithm::X25519, Operation::Issue);
        let device = FakeDevice::exchange(Algorithm::X25519, session.host_pub());
        session.set_device_pub(device.device_pub).expect("derive");

        let (iv, ciphertext, mut tag) = session.encrypt(b"payload").expect("encrypt");
        tag[0] ^= 0xff;
        assert!(matches!(
            session.decrypt(&iv, &ciphertext, &tag),
            Err(Error::CryptoFailure(_))
        ));
    }

    #[test]
    fn p256_rejects_garbage_device_key() {
        let mut session = AtapSession::new(Algorithm::P256, Operation::Issue);
        let result = session.set_device_pub([0xaa; ECDH_KEY_LEN]);
        assert!(matches!(result, Err(Error::CryptoFailure(_))));
    }

    #[test]
    fn encrypt_before_derivation_fails() {
        let session = AtapSession::new(Algorithm::X25519, Operation::Issue);
        assert!(matches!(
            session.encrypt(b"payload"),
            Err(Error::CryptoFailure(_))
        ));
    }
}
