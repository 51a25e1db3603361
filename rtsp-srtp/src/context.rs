//! SRTP/SRTCP protection context (RFC 3711).

use std::collections::HashMap;

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use bytes::Bytes;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use shared::error::{Error, Result};
use shared::marshal::{MarshalSize, Unmarshal};
use shared::replay_detector::SlidingWindowDetector;

use crate::kdf::{SessionKeys, derive_session_keys};
use crate::{AUTH_TAG_LEN, REPLAY_WINDOW};

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

const SRTCP_INDEX_LEN: usize = 4;
const SRTCP_E_FLAG: u32 = 0x8000_0000;
const SEQ_HALF: u16 = 1 << 15;

/// Per-SSRC stream state: rollover counter, highest accepted sequence
/// number, and replay windows for both directions of use.
struct StreamState {
    roc: u32,
    highest_seq: u16,
    started: bool,
    rtp_replay: SlidingWindowDetector,
    rtcp_replay: SlidingWindowDetector,
    rtcp_index: u32,
}

impl StreamState {
    fn new() -> Self {
        Self {
            roc: 0,
            highest_seq: 0,
            started: false,
            rtp_replay: SlidingWindowDetector::new(REPLAY_WINDOW),
            rtcp_replay: SlidingWindowDetector::new(REPLAY_WINDOW),
            rtcp_index: 0,
        }
    }

    /// Estimates the rollover counter for an incoming sequence number
    /// (RFC 3711 §3.3.1) without committing it.
    fn guess_roc(&self, seq: u16) -> u32 {
        if !self.started {
            return 0;
        }
        if self.highest_seq < SEQ_HALF {
            if seq.wrapping_sub(self.highest_seq) > SEQ_HALF {
                self.roc.wrapping_sub(1)
            } else {
                self.roc
            }
        } else if self.highest_seq.wrapping_sub(seq) > SEQ_HALF {
            self.roc.wrapping_add(1)
        } else {
            self.roc
        }
    }

    /// Commits an authenticated (roc, seq) pair. The rollover counter only
    /// advances.
    fn update(&mut self, roc: u32, seq: u16) {
        if !self.started {
            self.started = true;
            self.roc = roc;
            self.highest_seq = seq;
            return;
        }
        let index = ((roc as u64) << 16) | seq as u64;
        let highest = ((self.roc as u64) << 16) | self.highest_seq as u64;
        if index > highest {
            self.roc = roc;
            self.highest_seq = seq;
        }
    }
}

/// One directional SRTP/SRTCP context: derived session keys plus per-SSRC
/// stream state. A publisher owns an encrypt context; each subscriber owns
/// a decrypt context built from the same MIKEY TEK.
pub struct Context {
    keys: SessionKeys,
    streams: HashMap<u32, StreamState>,
}

impl Context {
    pub fn new(master_key: &[u8], master_salt: &[u8]) -> Result<Self> {
        Ok(Self {
            keys: derive_session_keys(master_key, master_salt)?,
            streams: HashMap::new(),
        })
    }

    /// Encrypts a marshaled RTP packet and appends the authentication tag.
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        let (header_len, seq, ssrc) = split_rtp(packet)?;

        let state = self.streams.entry(ssrc).or_insert_with(StreamState::new);
        let roc = if state.started && seq < state.highest_seq && state.highest_seq.wrapping_sub(seq) > SEQ_HALF {
            state.roc.wrapping_add(1)
        } else if state.started {
            state.roc
        } else {
            0
        };
        state.update(roc, seq);

        let index = ((roc as u64) << 16) | seq as u64;
        let mut out = packet.to_vec();
        let iv = rtp_iv(&self.keys.rtp_salt, ssrc, index);
        let mut cipher = Aes128Ctr::new(GenericArray::from_slice(&self.keys.rtp_key), GenericArray::from_slice(&iv));
        cipher.apply_keystream(&mut out[header_len..]);

        let tag = rtp_tag(&self.keys.rtp_auth_key, &out, roc)?;
        out.extend_from_slice(&tag);
        Ok(Bytes::from(out))
    }

    /// Verifies, decrypts, and strips the tag of an SRTP packet, updating
    /// ROC and replay state. Failures are uniform `SrtpAuthFailed` /
    /// `SrtpReplay` errors so callers can treat them as plain drops.
    pub fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < AUTH_TAG_LEN {
            return Err(Error::PacketTooShort);
        }
        let (payload, tag) = packet.split_at(packet.len() - AUTH_TAG_LEN);
        let (header_len, seq, ssrc) = split_rtp(payload)?;

        let state = self.streams.entry(ssrc).or_insert_with(StreamState::new);
        let roc = state.guess_roc(seq);
        let index = ((roc as u64) << 16) | seq as u64;

        if !state.rtp_replay.check(index) {
            return Err(Error::SrtpReplay);
        }

        let expected = rtp_tag(&self.keys.rtp_auth_key, payload, roc)?;
        if tag.ct_eq(&expected).unwrap_u8() != 1 {
            return Err(Error::SrtpAuthFailed);
        }

        state.rtp_replay.accept();
        state.update(roc, seq);

        let mut out = payload.to_vec();
        let iv = rtp_iv(&self.keys.rtp_salt, ssrc, index);
        let mut cipher = Aes128Ctr::new(GenericArray::from_slice(&self.keys.rtp_key), GenericArray::from_slice(&iv));
        cipher.apply_keystream(&mut out[header_len..]);
        Ok(Bytes::from(out))
    }

    /// Encrypts a marshaled RTCP packet, appending the E-flagged index word
    /// and the authentication tag.
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < 8 {
            return Err(Error::PacketTooShort);
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

        let state = self.streams.entry(ssrc).or_insert_with(StreamState::new);
        state.rtcp_index = (state.rtcp_index + 1) & !SRTCP_E_FLAG;
        let index = state.rtcp_index;

        let mut out = packet.to_vec();
        let iv = rtp_iv(&self.keys.rtcp_salt, ssrc, index as u64);
        let mut cipher = Aes128Ctr::new(GenericArray::from_slice(&self.keys.rtcp_key), GenericArray::from_slice(&iv));
        cipher.apply_keystream(&mut out[8..]);

        out.extend_from_slice(&(SRTCP_E_FLAG | index).to_be_bytes());
        let tag = rtcp_tag(&self.keys.rtcp_auth_key, &out)?;
        out.extend_from_slice(&tag);
        Ok(Bytes::from(out))
    }

    /// Verifies and decrypts an SRTCP packet, returning the plain RTCP bytes.
    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < 8 + SRTCP_INDEX_LEN + AUTH_TAG_LEN {
            return Err(Error::PacketTooShort);
        }
        let (authed, tag) = packet.split_at(packet.len() - AUTH_TAG_LEN);
        let expected = rtcp_tag(&self.keys.rtcp_auth_key, authed)?;
        if tag.ct_eq(&expected).unwrap_u8() != 1 {
            return Err(Error::SrtpAuthFailed);
        }

        let (body, index_word) = authed.split_at(authed.len() - SRTCP_INDEX_LEN);
        let word = u32::from_be_bytes([index_word[0], index_word[1], index_word[2], index_word[3]]);
        let encrypted = word & SRTCP_E_FLAG != 0;
        let index = word & !SRTCP_E_FLAG;
        let ssrc = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);

        let state = self.streams.entry(ssrc).or_insert_with(StreamState::new);
        if !state.rtcp_replay.check(index as u64) {
            return Err(Error::SrtpReplay);
        }
        state.rtcp_replay.accept();

        let mut out = body.to_vec();
        if encrypted {
            let iv = rtp_iv(&self.keys.rtcp_salt, ssrc, index as u64);
            let mut cipher = Aes128Ctr::new(GenericArray::from_slice(&self.keys.rtcp_key), GenericArray::from_slice(&iv));
            cipher.apply_keystream(&mut out[8..]);
        }
        Ok(Bytes::from(out))
    }
}

/// Header length, sequence number, and SSRC of a marshaled RTP packet.
fn split_rtp(packet: &[u8]) -> Result<(usize, u16, u32)> {
    let mut buf = Bytes::copy_from_slice(packet);
    let header = rtp::Header::unmarshal(&mut buf)?;
    let header_len = header.marshal_size();
    if packet.len() < header_len {
        return Err(Error::PacketTooShort);
    }
    Ok((header_len, header.sequence_number, header.ssrc))
}

/// The AES-CM counter block: session salt shifted left 16 bits, XORed with
/// the SSRC at bytes 4..8 and the packet index at bytes 8..14
/// (RFC 3711 §4.1.1).
fn rtp_iv(salt: &[u8; 14], ssrc: u32, index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(salt);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    for (i, b) in index.to_be_bytes()[2..].iter().enumerate() {
        iv[8 + i] ^= b;
    }
    iv
}

fn rtp_tag(auth_key: &[u8], authed: &[u8], roc: u32) -> Result<[u8; AUTH_TAG_LEN]> {
    let mut mac = HmacSha1::new_from_slice(auth_key)
        .map_err(|_| Error::SrtpBadKeyLength)?;
    mac.update(authed);
    mac.update(&roc.to_be_bytes());
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&full[..AUTH_TAG_LEN]);
    Ok(tag)
}

fn rtcp_tag(auth_key: &[u8], authed: &[u8]) -> Result<[u8; AUTH_TAG_LEN]> {
    let mut mac = HmacSha1::new_from_slice(auth_key)
        .map_err(|_| Error::SrtpBadKeyLength)?;
    mac.update(authed);
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&full[..AUTH_TAG_LEN]);
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::marshal::Marshal;

    const MASTER_KEY: [u8; 16] = [
        0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, 0xD6, 0x4F, 0xA3, 0x2C, 0x06, 0xDE, 0x41,
        0x39,
    ];
    const MASTER_SALT: [u8; 14] = [
        0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, 0xEB, 0xB6, 0x96, 0x0B, 0x3A, 0xAB, 0xE6,
    ];

    fn sample_rtp(seq: u16) -> Vec<u8> {
        let p = rtp::Packet {
            header: rtp::Header {
                payload_type: 96,
                sequence_number: seq,
                timestamp: 1000,
                ssrc: 0xDEADBEEF,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x10, 0x20, 0x30, 0x40, 0x50]),
        };
        p.marshal().unwrap().to_vec()
    }

    #[test]
    fn test_rtp_round_trip() {
        let mut enc = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();
        let mut dec = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();

        let plain = sample_rtp(1);
        let protected = enc.protect_rtp(&plain).unwrap();
        assert_eq!(protected.len(), plain.len() + AUTH_TAG_LEN);
        assert_ne!(&protected[12..plain.len()], &plain[12..]);

        let recovered = dec.unprotect_rtp(&protected).unwrap();
        assert_eq!(recovered.as_ref(), &plain[..]);
    }

    #[test]
    fn test_rtp_tampered_payload_rejected() {
        let mut enc = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();
        let mut dec = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();

        let mut protected = enc.protect_rtp(&sample_rtp(5)).unwrap().to_vec();
        protected[13] ^= 0xFF;
        assert_eq!(dec.unprotect_rtp(&protected), Err(Error::SrtpAuthFailed));
    }

    #[test]
    fn test_rtp_replay_rejected() {
        let mut enc = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();
        let mut dec = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();

        let protected = enc.protect_rtp(&sample_rtp(7)).unwrap();
        dec.unprotect_rtp(&protected).unwrap();
        assert_eq!(dec.unprotect_rtp(&protected), Err(Error::SrtpReplay));
    }

    #[test]
    fn test_roc_advances_across_wrap() {
        let mut enc = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();
        let mut dec = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();

        for seq in [65534u16, 65535, 0, 1] {
            let protected = enc.protect_rtp(&sample_rtp(seq)).unwrap();
            let recovered = dec.unprotect_rtp(&protected).unwrap();
            assert_eq!(recovered.as_ref(), &sample_rtp(seq)[..], "seq {seq}");
        }
    }

    #[test]
    fn test_rtcp_round_trip() {
        let mut enc = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();
        let mut dec = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();

        // minimal RR: header + ssrc
        let plain = [0x80u8, 201, 0x00, 0x01, 0x00, 0x00, 0x12, 0x34];
        let protected = enc.protect_rtcp(&plain).unwrap();
        assert_eq!(protected.len(), plain.len() + SRTCP_INDEX_LEN + AUTH_TAG_LEN);

        let recovered = dec.unprotect_rtcp(&protected).unwrap();
        assert_eq!(recovered.as_ref(), &plain[..]);
    }

    #[test]
    fn test_rtcp_tampered_rejected() {
        let mut enc = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();
        let mut dec = Context::new(&MASTER_KEY, &MASTER_SALT).unwrap();

        let plain = [0x80u8, 201, 0x00, 0x01, 0x00, 0x00, 0x12, 0x34];
        let mut protected = enc.protect_rtcp(&plain).unwrap().to_vec();
        let n = protected.len();
        protected[n - 1] ^= 0x01;
        assert_eq!(dec.unprotect_rtcp(&protected), Err(Error::SrtpAuthFailed));
    }
}
