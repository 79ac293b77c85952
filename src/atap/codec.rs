//! Binary framing for the three ATAP messages.
//!
//! Frames share an 8 byte outer header `{version, 0, 0, 0, payload_len}`.
//! The host emits Operation Start and CA Response; the device answers with a
//! CA Request whose inner message is sealed under the session key. The codec
//! validates structure strictly: any declared length that does not fit the
//! remaining buffer is a `BadRequest`, an authentication failure on the inner
//! message is a `CryptoFailure`.

use crate::{
    atap::{
        session::AtapSession, Algorithm, Operation, ECDH_KEY_LEN, GCM_IV_LEN, GCM_TAG_LEN,
        HASH_LEN, HEADER_LEN, MESSAGE_VERSION_2, MIN_CA_REQUEST_LEN, SOM_CA_REQUEST_LEN, VAR_LEN,
    },
    error::{Error, Result},
};

/// Digest negotiated from the SoM leaf certificate's signature algorithm.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

/// Capability that checks the SoM certificate chain and authentication
/// signature. The EPID-backed implementation lives outside this crate; tests
/// inject their own.
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` over `message` against the leaf of `chain` using
    /// `digest`. Returns `Ok(false)` for a well-formed but wrong signature.
    fn verify_signature(
        &self,
        chain: &[Vec<u8>],
        signature: &[u8],
        message: &[u8],
        digest: DigestAlgorithm,
    ) -> Result<bool>;
}

/// A parsed, decrypted CA Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaRequest {
    Product {
        /// DER certificates from the SoM key chain, leaf first.
        som_chain: Vec<Vec<u8>>,
        /// SoM key authentication signature over the session auth value.
        som_sig: Vec<u8>,
        product_id_hash: [u8; HASH_LEN],
    },
    Som {
        som_id_hash: [u8; HASH_LEN],
    },
}

// ecdsa-with-SHA256
const OID_ECDSA_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
// ecdsa-with-SHA512
const OID_ECDSA_SHA512: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x04];
// 1.2.840.113741.1.9.4.3, SHA-256 based vendor signature scheme
const OID_VENDOR_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf8, 0x4d, 0x01, 0x09, 0x04, 0x03];

fn header(version: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = version;
    out[4..8].copy_from_slice(&payload_len.to_le_bytes());
    out
}

fn parse_header(bytes: &[u8]) -> Result<(u8, u32)> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::BadRequest("Length invalid".into()));
    }
    let version = bytes[0];
    if version == 0 || version > MESSAGE_VERSION_2 {
        return Err(Error::BadRequest("Unsupported protocol version".into()));
    }
    if bytes[1] != 0 || bytes[2] != 0 || bytes[3] != 0 {
        return Err(Error::BadRequest("Reserved values set".into()));
    }
    let payload_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok((version, payload_len))
}

fn read_u32(bytes: &[u8], index: usize) -> Result<u32> {
    let end = index
        .checked_add(VAR_LEN)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::BadRequest("Length invalid".into()))?;
    let mut buf = [0u8; VAR_LEN];
    buf.copy_from_slice(&bytes[index..end]);
    Ok(u32::from_le_bytes(buf))
}

fn read_slice<'a>(bytes: &'a [u8], index: usize, len: usize) -> Result<&'a [u8]> {
    let end = index
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::BadRequest("Length invalid".into()))?;
    Ok(&bytes[index..end])
}

/// Encode the Operation Start frame for a session.
pub fn operation_start(session: &AtapSession) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + 2 + ECDH_KEY_LEN);
    frame.extend_from_slice(&header(
        session.message_version(),
        (2 + ECDH_KEY_LEN) as u32,
    ));
    frame.push(session.algorithm().id());
    frame.push(session.operation().id());
    frame.extend_from_slice(session.host_pub());
    frame
}

/// The fixed Operation Start blob the SoM status probe stages. Built from a
/// constant secret so the frame is identical on every probe; only the size of
/// the device's answer is ever examined.
pub fn probe_operation_start(algorithm: Algorithm) -> Vec<u8> {
    let session = AtapSession::from_fixed_secret(algorithm, [0x42; 32], Operation::Issue);
    operation_start(&session)
}

/// Parse and decrypt a CA Request, deriving the session keys as a side
/// effect. The expected shape (product or SoM) follows the session operation.
pub fn parse_ca_request(session: &mut AtapSession, bytes: &[u8]) -> Result<CaRequest> {
    if session.operation().is_som() {
        if bytes.len() != SOM_CA_REQUEST_LEN {
            return Err(Error::BadRequest("Length invalid".into()));
        }
    } else if bytes.len() < MIN_CA_REQUEST_LEN {
        return Err(Error::BadRequest("Length invalid".into()));
    }

    let (version, payload_len) = parse_header(bytes)?;
    if payload_len as usize > bytes.len() - HEADER_LEN {
        return Err(Error::BadRequest("Incorrect device message length".into()));
    }

    let mut device_pub = [0u8; ECDH_KEY_LEN];
    device_pub.copy_from_slice(read_slice(bytes, HEADER_LEN, ECDH_KEY_LEN)?);
    session.set_device_pub(device_pub)?;

    let mut iv = [0u8; GCM_IV_LEN];
    iv.copy_from_slice(read_slice(bytes, HEADER_LEN + ECDH_KEY_LEN, GCM_IV_LEN)?);

    let ct_len_index = HEADER_LEN + ECDH_KEY_LEN + GCM_IV_LEN;
    let ct_len = read_u32(bytes, ct_len_index)? as usize;
    if ct_len > bytes.len() - GCM_TAG_LEN - ct_len_index - VAR_LEN {
        return Err(Error::BadRequest("Encrypted message size too large".into()));
    }
    let ciphertext = read_slice(bytes, ct_len_index + VAR_LEN, ct_len)?;

    let mut tag = [0u8; GCM_TAG_LEN];
    tag.copy_from_slice(&bytes[bytes.len() - GCM_TAG_LEN..]);

    let inner = session.decrypt(&iv, ciphertext, &tag)?;

    let (inner_version, _inner_len) = parse_header(&inner)?;
    if inner_version != version {
        return Err(Error::BadRequest("Incorrect inner message version".into()));
    }
    let remaining = bytes.len() - HEADER_LEN - ECDH_KEY_LEN - GCM_IV_LEN - GCM_TAG_LEN;
    if inner.len() > remaining {
        return Err(Error::BadRequest(
            "Incorrect device inner message length".into(),
        ));
    }

    if session.operation().is_som() {
        parse_inner_som(&inner)
    } else {
        parse_inner_product(&inner)
    }
}

fn parse_inner_som(inner: &[u8]) -> Result<CaRequest> {
    if inner.len() != HEADER_LEN + HASH_LEN {
        return Err(Error::BadRequest("Length invalid".into()));
    }
    let mut som_id_hash = [0u8; HASH_LEN];
    som_id_hash.copy_from_slice(&inner[HEADER_LEN..]);
    Ok(CaRequest::Som { som_id_hash })
}

fn parse_inner_product(inner: &[u8]) -> Result<CaRequest> {
    let mut index = HEADER_LEN;

    let som_chain_len = read_u32(inner, index)? as usize;
    index += VAR_LEN;
    let som_chain_bytes = read_slice(inner, index, som_chain_len)?.to_vec();
    index += som_chain_len;

    let som_sig_len = read_u32(inner, index)? as usize;
    index += VAR_LEN;
    let som_sig = read_slice(inner, index, som_sig_len)?.to_vec();
    index += som_sig_len;

    let mut product_id_hash = [0u8; HASH_LEN];
    product_id_hash.copy_from_slice(read_slice(inner, index, HASH_LEN)?);
    index += HASH_LEN;

    // Non-empty trailing keys would ask us to certify; only issuing is
    // supported on this line.
    for _ in 0..3 {
        let key_len = read_u32(inner, index)?;
        index += VAR_LEN;
        if key_len != 0 {
            return Err(Error::BadRequest("Certify not supported".into()));
        }
    }

    Ok(CaRequest::Product {
        som_chain: split_cert_chain(&som_chain_bytes)?,
        som_sig,
        product_id_hash,
    })
}

/// The chain arrives as a run of `u32 length || DER certificate` records.
fn split_cert_chain(chain: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut certs = Vec::new();
    let mut index = 0;
    while index < chain.len() {
        let cert_len = read_u32(chain, index)? as usize;
        index += VAR_LEN;
        certs.push(read_slice(chain, index, cert_len)?.to_vec());
        index += cert_len;
    }
    Ok(certs)
}

/// Check the SoM authentication signature when one is present.
pub fn verify_som_signature(
    session: &AtapSession,
    request: &CaRequest,
    verifier: &dyn SignatureVerifier,
) -> Result<()> {
    let (chain, signature) = match request {
        CaRequest::Product {
            som_chain, som_sig, ..
        } => (som_chain, som_sig),
        CaRequest::Som { .. } => return Ok(()),
    };
    if signature.is_empty() || chain.is_empty() {
        return Ok(());
    }

    let digest = digest_for_cert(&chain[0])?;
    let auth_value = session.auth_value()?;
    if verifier.verify_signature(chain, signature, auth_value, digest)? {
        Ok(())
    } else {
        Err(Error::SignatureFailure(
            "SoM authentication signature did not verify".into(),
        ))
    }
}

/// Encode the CA Response around the opaque key bundle.
pub fn ca_response(session: &AtapSession, key_bundle: &[u8]) -> Result<Vec<u8>> {
    let (iv, ciphertext, tag) = session.encrypt(key_bundle)?;

    let payload_len = (GCM_IV_LEN + VAR_LEN + ciphertext.len() + GCM_TAG_LEN) as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len as usize);
    frame.extend_from_slice(&header(session.message_version(), payload_len));
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    frame.extend_from_slice(&ciphertext);
    frame.extend_from_slice(&tag);
    Ok(frame)
}

/// Read one DER TLV at `pos`, returning `(tag, content_start, content_len)`.
fn der_tlv(data: &[u8], pos: usize) -> Result<(u8, usize, usize)> {
    let malformed = || Error::BadRequest("Malformed certificate".into());
    let tag = *data.get(pos).ok_or_else(malformed)?;
    let first = *data.get(pos + 1).ok_or_else(malformed)?;
    if first < 0x80 {
        return Ok((tag, pos + 2, first as usize));
    }
    let len_bytes = (first & 0x7f) as usize;
    if len_bytes == 0 || len_bytes > 4 {
        return Err(malformed());
    }
    let mut len = 0usize;
    for i in 0..len_bytes {
        len = (len << 8) | *data.get(pos + 2 + i).ok_or_else(malformed)? as usize;
    }
    Ok((tag, pos + 2 + len_bytes, len))
}

/// Pull the signature algorithm OID out of an X.509 certificate and map it to
/// the digest the signature was made with.
fn digest_for_cert(cert: &[u8]) -> Result<DigestAlgorithm> {
    let malformed = || Error::BadRequest("Malformed certificate".into());

    // Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, ... }
    let (tag, body_start, body_len) = der_tlv(cert, 0)?;
    if tag != 0x30 || body_start + body_len > cert.len() {
        return Err(malformed());
    }
    let (tbs_tag, tbs_start, tbs_len) = der_tlv(cert, body_start)?;
    if tbs_tag != 0x30 {
        return Err(malformed());
    }
    // AlgorithmIdentifier ::= SEQUENCE { algorithm OBJECT IDENTIFIER, ... }
    let (alg_tag, alg_start, _alg_len) = der_tlv(cert, tbs_start + tbs_len)?;
    if alg_tag != 0x30 {
        return Err(malformed());
    }
    let (oid_tag, oid_start, oid_len) = der_tlv(cert, alg_start)?;
    if oid_tag != 0x06 {
        return Err(malformed());
    }
    let oid = read_slice(cert, oid_start, oid_len)
        .map_err(|_| malformed())?;

    match oid {
        _ if oid == OID_ECDSA_SHA256 || oid == OID_VENDOR_SHA256 => Ok(DigestAlgorithm::Sha256),
        _ if oid == OID_ECDSA_SHA512 => Ok(DigestAlgorithm::Sha512),
        _ => Err(Error::BadRequest("dgst algorithm not supported".into())),
    }
}
