//! AThings Attestation Protocol message handling.
//!
//! The protocol is a three message exchange carried over the fastboot staging
//! area: the host stages an Operation Start frame, the device answers with a
//! CA Request, and the host stages back a CA Response holding the key bundle.
//! All integers on the wire are little endian.

pub mod codec;
pub mod session;

pub use codec::{CaRequest, DigestAlgorithm, SignatureVerifier};
pub use session::AtapSession;

/// Outer and inner header size: version byte, three reserved bytes, u32 length.
pub const HEADER_LEN: usize = 8;
/// Key exchange public keys are carried as 33 bytes (X25519 keys are padded).
pub const ECDH_KEY_LEN: usize = 33;
/// Length prefix size for variable fields.
pub const VAR_LEN: usize = 4;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
/// SHA-256 digests embedded in inner messages.
pub const HASH_LEN: usize = 32;
/// HKDF output size for both the session key and the auth value.
pub const SESSION_KEY_LEN: usize = 16;

/// Product flows speak version 1.
pub const MESSAGE_VERSION_1: u8 = 1;
/// Version 2 adds SoM key support but is otherwise compatible with version 1.
pub const MESSAGE_VERSION_2: u8 = 2;

/// Smallest possible product-flow CA Request: every variable field empty.
pub const MIN_CA_REQUEST_LEN: usize = HEADER_LEN
    + ECDH_KEY_LEN
    + GCM_IV_LEN
    + VAR_LEN
    + HEADER_LEN
    + VAR_LEN
    + VAR_LEN
    + HASH_LEN
    + VAR_LEN
    + VAR_LEN
    + VAR_LEN
    + GCM_TAG_LEN;

/// A version 2 SoM CA Request is fixed size: the inner message is exactly a
/// header plus the SoM id digest.
pub const SOM_CA_REQUEST_LEN: usize =
    HEADER_LEN + ECDH_KEY_LEN + GCM_IV_LEN + VAR_LEN + (HEADER_LEN + HASH_LEN) + GCM_TAG_LEN;

/// The supported key exchange algorithms.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum Algorithm {
    P256 = 1,
    X25519 = 2,
}

impl Algorithm {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Algorithm::P256),
            2 => Some(Algorithm::X25519),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// The operations a session may execute. Certify (1) is not supported.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum Operation {
    Issue = 2,
    IssueEnc = 3,
    IssueSom = 4,
    IssueEncSom = 5,
}

impl Operation {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            2 => Some(Operation::Issue),
            3 => Some(Operation::IssueEnc),
            4 => Some(Operation::IssueSom),
            5 => Some(Operation::IssueEncSom),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn is_som(self) -> bool {
        matches!(self, Operation::IssueSom | Operation::IssueEncSom)
    }

    /// The message version this operation speaks.
    pub fn message_version(self) -> u8 {
        if self.is_som() {
            MESSAGE_VERSION_2
        } else {
            MESSAGE_VERSION_1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_constants() {
        assert_eq!(MIN_CA_REQUEST_LEN, 133);
        assert_eq!(SOM_CA_REQUEST_LEN, 113);
    }

    #[test]
    fn algorithm_ids() {
        assert_eq!(Algorithm::from_id(1), Some(Algorithm::P256));
        assert_eq!(Algorithm::from_id(2), Some(Algorithm::X25519));
        assert_eq!(Algorithm::from_id(0), None);
        assert_eq!(Algorithm::from_id(3), None);
    }

    #[test]
    fn operation_ids_and_versions() {
        assert_eq!(Operation::from_id(2), Some(Operation::Issue));
        assert_eq!(Operation::from_id(5), Some(Operation::IssueEncSom));
        // Certify is unsupported and must not map.
        assert_eq!(Operation::from_id(1), None);
        assert_eq!(Operation::from_id(6), None);

        assert_eq!(Operation::Issue.message_version(), MESSAGE_VERSION_1);
        assert_eq!(Operation::IssueEnc.message_version(), MESSAGE_VERSION_1);
        assert_eq!(Operation::IssueSom.message_version(), MESSAGE_VERSION_2);
        assert_eq!(Operation::IssueEncSom.message_version(), MESSAGE_VERSION_2);
        assert!(!Operation::Issue.is_som());
        assert!(Operation::IssueSom.is_som());
    }
}
