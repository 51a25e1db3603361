//! AES-CM key derivation (RFC 3711 §4.3).

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};

use shared::error::{Error, Result};

use crate::{MASTER_KEY_LEN, MASTER_SALT_LEN};

const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;
const LABEL_RTCP_ENCRYPTION: u8 = 0x03;
const LABEL_RTCP_AUTH: u8 = 0x04;
const LABEL_RTCP_SALT: u8 = 0x05;

pub const SESSION_KEY_LEN: usize = 16;
pub const SESSION_AUTH_KEY_LEN: usize = 20;
pub const SESSION_SALT_LEN: usize = 14;

/// The six session keys derived from one master key/salt pair.
#[derive(Clone)]
pub struct SessionKeys {
    pub rtp_key: [u8; SESSION_KEY_LEN],
    pub rtp_auth_key: [u8; SESSION_AUTH_KEY_LEN],
    pub rtp_salt: [u8; SESSION_SALT_LEN],
    pub rtcp_key: [u8; SESSION_KEY_LEN],
    pub rtcp_auth_key: [u8; SESSION_AUTH_KEY_LEN],
    pub rtcp_salt: [u8; SESSION_SALT_LEN],
}

/// Derives the session keys with a key derivation rate of zero, so the
/// packet-index term of the key id is always zero.
pub fn derive_session_keys(master_key: &[u8], master_salt: &[u8]) -> Result<SessionKeys> {
    if master_key.len() != MASTER_KEY_LEN || master_salt.len() != MASTER_SALT_LEN {
        return Err(Error::SrtpBadKeyLength);
    }

    let cipher = Aes128::new(GenericArray::from_slice(master_key));

    let mut keys = SessionKeys {
        rtp_key: [0; SESSION_KEY_LEN],
        rtp_auth_key: [0; SESSION_AUTH_KEY_LEN],
        rtp_salt: [0; SESSION_SALT_LEN],
        rtcp_key: [0; SESSION_KEY_LEN],
        rtcp_auth_key: [0; SESSION_AUTH_KEY_LEN],
        rtcp_salt: [0; SESSION_SALT_LEN],
    };

    prf(&cipher, master_salt, LABEL_RTP_ENCRYPTION, &mut keys.rtp_key);
    prf(&cipher, master_salt, LABEL_RTP_AUTH, &mut keys.rtp_auth_key);
    prf(&cipher, master_salt, LABEL_RTP_SALT, &mut keys.rtp_salt);
    prf(&cipher, master_salt, LABEL_RTCP_ENCRYPTION, &mut keys.rtcp_key);
    prf(&cipher, master_salt, LABEL_RTCP_AUTH, &mut keys.rtcp_auth_key);
    prf(&cipher, master_salt, LABEL_RTCP_SALT, &mut keys.rtcp_salt);

    Ok(keys)
}

/// AES-CM pseudo-random function: the key id (label at byte 7) is XORed
/// into the master salt, shifted left 16 bits, and the resulting counter
/// block is encrypted with an incrementing 16-bit block index.
fn prf(cipher: &Aes128, master_salt: &[u8], label: u8, out: &mut [u8]) {
    let mut x = [0u8; 16];
    x[..MASTER_SALT_LEN].copy_from_slice(master_salt);
    x[7] ^= label;

    let mut filled = 0;
    let mut counter: u16 = 0;
    while filled < out.len() {
        let mut block = x;
        block[14..16].copy_from_slice(&counter.to_be_bytes());
        let mut ga = GenericArray::from(block);
        cipher.encrypt_block(&mut ga);

        let n = usize::min(16, out.len() - filled);
        out[filled..filled + n].copy_from_slice(&ga[..n]);
        filled += n;
        counter = counter.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vectors from RFC 3711 appendix B.3.
    #[test]
    fn test_rfc3711_key_derivation() {
        let master_key = [
            0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, 0xD6, 0x4F, 0xA3, 0x2C, 0x06, 0xDE,
            0x41, 0x39,
        ];
        let master_salt = [
            0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, 0xEB, 0xB6, 0x96, 0x0B, 0x3A, 0xAB, 0xE6,
        ];

        let keys = derive_session_keys(&master_key, &master_salt).unwrap();

        assert_eq!(
            keys.rtp_key,
            [
                0xC6, 0x1E, 0x7A, 0x93, 0x74, 0x4F, 0x39, 0xEE, 0x10, 0x73, 0x4A, 0xFE, 0x3F,
                0xF7, 0xA0, 0x87
            ]
        );
        assert_eq!(
            keys.rtp_salt,
            [
                0x30, 0xCB, 0xBC, 0x08, 0x86, 0x3D, 0x8C, 0x85, 0xD4, 0x9D, 0xB3, 0x4A, 0x9A,
                0xE1
            ]
        );
        assert_eq!(
            keys.rtp_auth_key,
            [
                0xCE, 0xBE, 0x32, 0x1F, 0x6F, 0xF7, 0x71, 0x6B, 0x6F, 0xD4, 0xAB, 0x49, 0xAF,
                0x25, 0x6A, 0x15, 0x6D, 0x38, 0xBA, 0xA4
            ]
        );
    }

    #[test]
    fn test_bad_lengths_rejected() {
        assert!(matches!(
            derive_session_keys(&[0; 15], &[0; 14]),
            Err(Error::SrtpBadKeyLength)
        ));
        assert!(matches!(
            derive_session_keys(&[0; 16], &[0; 13]),
            Err(Error::SrtpBadKeyLength)
        ));
    }
}
