use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use ring::hmac;
use sha2::{Digest, Sha256};

use shared::error::{Error, Result};

pub(crate) const MASTER_SECRET_LEN: usize = 48;
pub(crate) const VERIFY_DATA_LEN: usize = 12;
pub(crate) const GCM_TAG_LEN: usize = 16;
pub(crate) const GCM_EXPLICIT_NONCE_LEN: usize = 8;
const GCM_KEY_LEN: usize = 16;
const GCM_IMPLICIT_NONCE_LEN: usize = 4;

pub(crate) const SRTP_MASTER_KEY_LEN: usize = 16;
pub(crate) const SRTP_MASTER_SALT_LEN: usize = 14;
const EXTRACTOR_LABEL: &[u8] = b"EXTRACTOR-dtls_srtp";

/// A self-signed certificate whose SHA-256 fingerprint is the identity
/// anchor exchanged over signaling.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub der: Vec<u8>,
    pub fingerprint: String,
}

impl Certificate {
    /// Generates an ephemeral self-signed certificate, one per peer
    /// connection the way browsers do it.
    pub fn generate() -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec!["oxrtc".to_string()])
            .map_err(|e| Error::Other(format!("certificate generation: {e}")))?;
        let der = certified.cert.der().to_vec();
        let fingerprint = fingerprint_of(&der);
        Ok(Self { der, fingerprint })
    }
}

/// Colon-separated upper-case SHA-256 digest, the `a=fingerprint` value.
pub fn fingerprint_of(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// TLS 1.2 PRF with SHA-256 (RFC 5246 section 5).
pub(crate) fn prf(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let mut out = Vec::with_capacity(out_len);
    let mut a = hmac::sign(&key, &label_seed).as_ref().to_vec();
    while out.len() < out_len {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&a);
        ctx.update(&label_seed);
        out.extend_from_slice(ctx.sign().as_ref());
        a = hmac::sign(&key, &a).as_ref().to_vec();
    }
    out.truncate(out_len);
    out
}

pub(crate) fn master_secret(pre_master: &[u8], client_random: &[u8], server_random: &[u8]) -> Vec<u8> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    prf(pre_master, b"master secret", &seed, MASTER_SECRET_LEN)
}

pub(crate) fn verify_data(master: &[u8], handshake_hash: &[u8], is_client: bool) -> Vec<u8> {
    let label: &[u8] = if is_client {
        b"client finished"
    } else {
        b"server finished"
    };
    prf(master, label, handshake_hash, VERIFY_DATA_LEN)
}

/// SRTP master keys and salts for both directions, in the RFC 5764
/// extraction order: client key, server key, client salt, server salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpKeyingMaterial {
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub client_salt: Vec<u8>,
    pub server_salt: Vec<u8>,
}

pub(crate) fn export_srtp_keying_material(
    master: &[u8],
    client_random: &[u8],
    server_random: &[u8],
) -> SrtpKeyingMaterial {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    let total = 2 * (SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN);
    let material = prf(master, EXTRACTOR_LABEL, &seed, total);

    let mut offset = 0;
    let mut take = |n: usize| {
        let part = material[offset..offset + n].to_vec();
        offset += n;
        part
    };
    SrtpKeyingMaterial {
        client_key: take(SRTP_MASTER_KEY_LEN),
        server_key: take(SRTP_MASTER_KEY_LEN),
        client_salt: take(SRTP_MASTER_SALT_LEN),
        server_salt: take(SRTP_MASTER_SALT_LEN),
    }
}

/// Record protection state for one epoch and direction.
pub(crate) struct CipherState {
    key: LessSafeKey,
    implicit_nonce: [u8; GCM_IMPLICIT_NONCE_LEN],
}

impl CipherState {
    fn new(key: &[u8], implicit_nonce: &[u8]) -> Result<Self> {
        let unbound =
            UnboundKey::new(&AES_128_GCM, key).map_err(|_| Error::ErrDecryptFailed)?;
        let mut iv = [0u8; GCM_IMPLICIT_NONCE_LEN];
        iv.copy_from_slice(implicit_nonce);
        Ok(Self {
            key: LessSafeKey::new(unbound),
            implicit_nonce: iv,
        })
    }

    fn nonce(&self, explicit: &[u8]) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..GCM_IMPLICIT_NONCE_LEN].copy_from_slice(&self.implicit_nonce);
        nonce[GCM_IMPLICIT_NONCE_LEN..].copy_from_slice(explicit);
        Nonce::assume_unique_for_key(nonce)
    }

    /// Seals `plaintext` and returns explicit-nonce || ciphertext || tag.
    pub(crate) fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut explicit = [0u8; GCM_EXPLICIT_NONCE_LEN];
        rand::rng().fill_bytes(&mut explicit);

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(self.nonce(&explicit), Aad::from(aad), &mut in_out)
            .map_err(|_| Error::ErrDecryptFailed)?;

        let mut out = Vec::with_capacity(GCM_EXPLICIT_NONCE_LEN + in_out.len());
        out.extend_from_slice(&explicit);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Opens explicit-nonce || ciphertext || tag.
    pub(crate) fn open(&self, aad: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < GCM_EXPLICIT_NONCE_LEN + GCM_TAG_LEN {
            return Err(Error::ErrInvalidPacketLength);
        }
        let (explicit, ciphertext) = payload.split_at(GCM_EXPLICIT_NONCE_LEN);
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(self.nonce(explicit), Aad::from(aad), &mut in_out)
            .map_err(|_| Error::ErrDecryptFailed)?;
        Ok(plaintext.to_vec())
    }
}

/// Both directions' epoch-1 ciphers, derived from the master secret.
pub(crate) struct KeySchedule {
    pub(crate) client_write: CipherState,
    pub(crate) server_write: CipherState,
}

impl KeySchedule {
    pub(crate) fn new(master: &[u8], client_random: &[u8], server_random: &[u8]) -> Result<Self> {
        // RFC 5246 section 6.3, key expansion seeds server random first
        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(server_random);
        seed.extend_from_slice(client_random);
        let total = 2 * (GCM_KEY_LEN + GCM_IMPLICIT_NONCE_LEN);
        let block = prf(master, b"key expansion", &seed, total);

        let (client_key, rest) = block.split_at(GCM_KEY_LEN);
        let (server_key, rest) = rest.split_at(GCM_KEY_LEN);
        let (client_iv, server_iv) = rest.split_at(GCM_IMPLICIT_NONCE_LEN);

        Ok(Self {
            client_write: CipherState::new(client_key, client_iv)?,
            server_write: CipherState::new(server_key, server_iv)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // RFC 5246 PRF with SHA-256, the widely used "test label" vector
    #[test]
    fn test_prf_sha256_vector() {
        let secret = hex::decode("9bbe436ba940f017b17652849a71db35").unwrap();
        let seed = hex::decode("a0ba9f936cda311827a6f796ffd5198c").unwrap();
        let expected = hex::decode(
            "e3f229ba727be17b8d122620557cd453c2aab21d07c3d495329b52d4e61edb5a\
             6b301791e90d35c9c9a46b4e14baf9af0fa022f7077def17abfd3797c0564bab\
             4fbc91666e9def9b97fce34f796789baa48082d122ee42c5a72e5a5110fff701\
             87347b66",
        )
        .unwrap();
        assert_eq!(prf(&secret, b"test label", &seed, 100), expected);
    }

    #[test]
    fn test_fingerprint_shape() {
        let cert = Certificate::generate().unwrap();
        // 32 bytes, colon separated
        assert_eq!(cert.fingerprint.len(), 32 * 3 - 1);
        assert!(cert
            .fingerprint
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase() || c == ':'));
        assert_eq!(cert.fingerprint, fingerprint_of(&cert.der));
    }

    #[test]
    fn test_seal_open_round_trip() {
        let master = vec![7u8; MASTER_SECRET_LEN];
        let client_random = [1u8; 32];
        let server_random = [2u8; 32];
        let client = KeySchedule::new(&master, &client_random, &server_random).unwrap();
        let server = KeySchedule::new(&master, &client_random, &server_random).unwrap();

        let aad = [0u8; 13];
        let sealed = client.client_write.seal(&aad, b"hello dtls").unwrap();
        let opened = server.client_write.open(&aad, &sealed).unwrap();
        assert_eq!(opened, b"hello dtls");

        // tampering must fail authentication
        let mut bad = sealed.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert_eq!(
            server.client_write.open(&aad, &bad).err(),
            Some(Error::ErrDecryptFailed)
        );
    }

    #[test]
    fn test_exporter_is_symmetric() {
        let master = vec![9u8; MASTER_SECRET_LEN];
        let a = export_srtp_keying_material(&master, &[1u8; 32], &[2u8; 32]);
        let b = export_srtp_keying_material(&master, &[1u8; 32], &[2u8; 32]);
        assert_eq!(a, b);
        assert_eq!(a.client_key.len(), SRTP_MASTER_KEY_LEN);
        assert_eq!(a.client_salt.len(), SRTP_MASTER_SALT_LEN);
        assert_ne!(a.client_key, a.server_key);
    }
}
