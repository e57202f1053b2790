use aes::cipher::{KeyIvInit, StreamCipher};

use shared::error::{Error, Result};

pub(crate) type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub const MASTER_KEY_LEN: usize = 16;
pub const MASTER_SALT_LEN: usize = 14;
pub(crate) const SESSION_KEY_LEN: usize = 16;
pub(crate) const SESSION_SALT_LEN: usize = 14;
pub(crate) const AUTH_KEY_LEN: usize = 20;

pub(crate) const LABEL_SRTP_ENCRYPTION: u8 = 0x00;
pub(crate) const LABEL_SRTP_AUTHENTICATION: u8 = 0x01;
pub(crate) const LABEL_SRTP_SALT: u8 = 0x02;
pub(crate) const LABEL_SRTCP_ENCRYPTION: u8 = 0x03;
pub(crate) const LABEL_SRTCP_AUTHENTICATION: u8 = 0x04;
pub(crate) const LABEL_SRTCP_SALT: u8 = 0x05;

/// AES-CM key derivation (RFC 3711 section 4.3.1) with a key derivation
/// rate of zero.
pub(crate) fn derive(
    master_key: &[u8],
    master_salt: &[u8],
    label: u8,
    out_len: usize,
) -> Result<Vec<u8>> {
    if master_key.len() != MASTER_KEY_LEN {
        return Err(Error::ErrShortSrtpMasterKey);
    }
    if master_salt.len() != MASTER_SALT_LEN {
        return Err(Error::ErrShortSrtpMasterSalt);
    }

    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(master_salt);
    iv[7] ^= label;

    let mut key = [0u8; MASTER_KEY_LEN];
    key.copy_from_slice(master_key);

    let mut out = vec![0u8; out_len];
    let mut cipher = Aes128Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// The six session keys of one SRTP crypto context.
pub(crate) struct SessionKeys {
    pub(crate) rtp_key: Vec<u8>,
    pub(crate) rtp_auth_key: Vec<u8>,
    pub(crate) rtp_salt: Vec<u8>,
    pub(crate) rtcp_key: Vec<u8>,
    pub(crate) rtcp_auth_key: Vec<u8>,
    pub(crate) rtcp_salt: Vec<u8>,
}

impl SessionKeys {
    pub(crate) fn derive(master_key: &[u8], master_salt: &[u8]) -> Result<Self> {
        Ok(Self {
            rtp_key: derive(master_key, master_salt, LABEL_SRTP_ENCRYPTION, SESSION_KEY_LEN)?,
            rtp_auth_key: derive(master_key, master_salt, LABEL_SRTP_AUTHENTICATION, AUTH_KEY_LEN)?,
            rtp_salt: derive(master_key, master_salt, LABEL_SRTP_SALT, SESSION_SALT_LEN)?,
            rtcp_key: derive(master_key, master_salt, LABEL_SRTCP_ENCRYPTION, SESSION_KEY_LEN)?,
            rtcp_auth_key: derive(
                master_key,
                master_salt,
                LABEL_SRTCP_AUTHENTICATION,
                AUTH_KEY_LEN,
            )?,
            rtcp_salt: derive(master_key, master_salt, LABEL_SRTCP_SALT, SESSION_SALT_LEN)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // RFC 3711 appendix B.3 key derivation test vectors
    #[test]
    fn test_rfc3711_kdf_vectors() {
        let master_key = hex::decode("e1f97a0d3e018be0d64fa32c06de4139").unwrap();
        let master_salt = hex::decode("0ec675ad498afeebb6960b3aabe6").unwrap();

        assert_eq!(
            derive(&master_key, &master_salt, LABEL_SRTP_ENCRYPTION, 16).unwrap(),
            hex::decode("c61e7a93744f39ee10734afe3ff7a087").unwrap()
        );
        assert_eq!(
            derive(&master_key, &master_salt, LABEL_SRTP_SALT, 14).unwrap(),
            hex::decode("30cbbc08863d8c85d49db34a9ae1").unwrap()
        );
        assert_eq!(
            derive(&master_key, &master_salt, LABEL_SRTP_AUTHENTICATION, 20).unwrap(),
            hex::decode("cebe321f6ff7716b6fd4ab49af256a156d38baa4").unwrap()
        );
    }

    #[test]
    fn test_short_master_key_rejected() {
        let err = derive(&[0u8; 8], &[0u8; 14], LABEL_SRTP_ENCRYPTION, 16);
        assert_eq!(err.err(), Some(Error::ErrShortSrtpMasterKey));
        let err = derive(&[0u8; 16], &[0u8; 10], LABEL_SRTP_ENCRYPTION, 16);
        assert_eq!(err.err(), Some(Error::ErrShortSrtpMasterSalt));
    }
}
