//! MIKEY message codec (RFC 3830), restricted to the profile the
//! `a=key-mgmt:mikey` SDP attribute needs: a pre-shared-key message whose
//! KEMAC carries the SRTP TEK and salt with NULL encryption and NULL MAC.

use rand::{Rng, rng};

use shared::error::{Error, Result};

use crate::{MASTER_KEY_LEN, MASTER_SALT_LEN};

const MIKEY_VERSION: u8 = 1;
const DATA_TYPE_PSK_INIT: u8 = 0;

const PAYLOAD_LAST: u8 = 0;
const PAYLOAD_KEMAC: u8 = 1;
const PAYLOAD_T: u8 = 5;
const PAYLOAD_SP: u8 = 10;
const PAYLOAD_RAND: u8 = 11;

const CS_ID_MAP_SRTP_ID: u8 = 0;
const TS_TYPE_NTP_UTC: u8 = 0;
const ENCR_NULL: u8 = 0;
const MAC_NULL: u8 = 0;
const KEY_TYPE_TEK_SALT: u8 = 3;
const KV_NULL: u8 = 0;

/// One crypto-session entry of the HDR CS ID map: the SRTP stream the
/// message keys, with its rollover counter at the time of signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoSession {
    pub policy_no: u8,
    pub ssrc: u32,
    pub roc: u32,
}

/// A decoded MIKEY message. Payloads outside the supported profile are
/// rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MikeyMessage {
    pub csb_id: u32,
    pub crypto_sessions: Vec<CryptoSession>,
    /// NTP-UTC timestamp from the T payload.
    pub ts: u64,
    pub rand: Vec<u8>,
    /// Raw security-policy parameter TLVs, preserved verbatim.
    pub sp_params: Vec<(u8, Vec<u8>)>,
    /// SRTP master key (16 bytes).
    pub tek: Vec<u8>,
    /// SRTP master salt (14 bytes).
    pub salt: Vec<u8>,
}

impl MikeyMessage {
    /// Builds a publisher message keying one SSRC with a fresh random
    /// CSB id and RAND.
    pub fn new(ssrc: u32, ts: u64, tek: &[u8], salt: &[u8]) -> Result<Self> {
        if tek.len() != MASTER_KEY_LEN || salt.len() != MASTER_SALT_LEN {
            return Err(Error::SrtpBadKeyLength);
        }
        let mut rng = rng();
        let rand_bytes: [u8; 16] = rng.random();
        Ok(MikeyMessage {
            csb_id: rng.random(),
            crypto_sessions: vec![CryptoSession {
                policy_no: 0,
                ssrc,
                roc: 0,
            }],
            ts,
            rand: rand_bytes.to_vec(),
            sp_params: Vec::new(),
            tek: tek.to_vec(),
            salt: salt.to_vec(),
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader { data, pos: 0 };

        let version = r.u8()?;
        if version != MIKEY_VERSION {
            return Err(Error::Mikey(format!("unsupported version {version}")));
        }
        let data_type = r.u8()?;
        if data_type != DATA_TYPE_PSK_INIT {
            return Err(Error::Mikey(format!("unsupported data type {data_type}")));
        }
        let mut next = r.u8()?;
        let _v_prf = r.u8()?;
        let csb_id = r.u32()?;
        let n_cs = r.u8()?;
        let map_type = r.u8()?;
        if map_type != CS_ID_MAP_SRTP_ID {
            return Err(Error::Mikey(format!("unsupported CS ID map type {map_type}")));
        }
        let mut crypto_sessions = Vec::with_capacity(n_cs as usize);
        for _ in 0..n_cs {
            crypto_sessions.push(CryptoSession {
                policy_no: r.u8()?,
                ssrc: r.u32()?,
                roc: r.u32()?,
            });
        }

        let mut ts = 0u64;
        let mut rand_bytes = Vec::new();
        let mut sp_params = Vec::new();
        let mut tek = Vec::new();
        let mut salt = Vec::new();

        while next != PAYLOAD_LAST {
            match next {
                PAYLOAD_T => {
                    next = r.u8()?;
                    let ts_type = r.u8()?;
                    if ts_type != TS_TYPE_NTP_UTC {
                        return Err(Error::Mikey(format!("unsupported TS type {ts_type}")));
                    }
                    ts = r.u64()?;
                }
                PAYLOAD_RAND => {
                    next = r.u8()?;
                    let len = r.u8()? as usize;
                    rand_bytes = r.bytes(len)?.to_vec();
                }
                PAYLOAD_SP => {
                    next = r.u8()?;
                    let _policy_no = r.u8()?;
                    let prot_type = r.u8()?;
                    if prot_type != 0 {
                        return Err(Error::Mikey(format!(
                            "unsupported SP protection type {prot_type}"
                        )));
                    }
                    let mut param_len = r.u16()? as usize;
                    while param_len > 0 {
                        let ptype = r.u8()?;
                        let plen = r.u8()? as usize;
                        let value = r.bytes(plen)?.to_vec();
                        if param_len < 2 + plen {
                            return Err(Error::Mikey("SP parameter overrun".to_owned()));
                        }
                        param_len -= 2 + plen;
                        sp_params.push((ptype, value));
                    }
                }
                PAYLOAD_KEMAC => {
                    next = r.u8()?;
                    let encr_alg = r.u8()?;
                    if encr_alg != ENCR_NULL {
                        return Err(Error::Mikey(format!(
                            "unsupported KEMAC encryption {encr_alg}"
                        )));
                    }
                    let key_data_len = r.u16()? as usize;
                    let key_data = r.bytes(key_data_len)?;
                    (tek, salt) = parse_key_data(key_data)?;
                    let mac_alg = r.u8()?;
                    if mac_alg != MAC_NULL {
                        return Err(Error::Mikey(format!("unsupported KEMAC mac {mac_alg}")));
                    }
                }
                other => {
                    return Err(Error::Mikey(format!("unsupported payload {other}")));
                }
            }
        }

        if tek.is_empty() {
            return Err(Error::Mikey("no TEK in KEMAC".to_owned()));
        }

        Ok(MikeyMessage {
            csb_id,
            crypto_sessions,
            ts,
            rand: rand_bytes,
            sp_params,
            tek,
            salt,
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);

        // HDR
        out.push(MIKEY_VERSION);
        out.push(DATA_TYPE_PSK_INIT);
        out.push(PAYLOAD_T);
        out.push(0); // V clear, PRF MIKEY-1
        out.extend_from_slice(&self.csb_id.to_be_bytes());
        out.push(self.crypto_sessions.len() as u8);
        out.push(CS_ID_MAP_SRTP_ID);
        for cs in &self.crypto_sessions {
            out.push(cs.policy_no);
            out.extend_from_slice(&cs.ssrc.to_be_bytes());
            out.extend_from_slice(&cs.roc.to_be_bytes());
        }

        // T
        out.push(PAYLOAD_RAND);
        out.push(TS_TYPE_NTP_UTC);
        out.extend_from_slice(&self.ts.to_be_bytes());

        // RAND
        let next = if self.sp_params.is_empty() {
            PAYLOAD_KEMAC
        } else {
            PAYLOAD_SP
        };
        out.push(next);
        out.push(self.rand.len() as u8);
        out.extend_from_slice(&self.rand);

        // SP
        if !self.sp_params.is_empty() {
            out.push(PAYLOAD_KEMAC);
            out.push(0); // policy number
            out.push(0); // protection type SRTP
            let param_len: usize = self.sp_params.iter().map(|(_, v)| 2 + v.len()).sum();
            out.extend_from_slice(&(param_len as u16).to_be_bytes());
            for (ptype, value) in &self.sp_params {
                out.push(*ptype);
                out.push(value.len() as u8);
                out.extend_from_slice(value);
            }
        }

        // KEMAC with a single TEK+salt key-data sub-payload
        out.push(PAYLOAD_LAST);
        out.push(ENCR_NULL);
        let key_data_len = 4 + self.tek.len() + 2 + self.salt.len();
        out.extend_from_slice(&(key_data_len as u16).to_be_bytes());
        out.push(PAYLOAD_LAST);
        out.push((KEY_TYPE_TEK_SALT << 4) | KV_NULL);
        out.extend_from_slice(&(self.tek.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.tek);
        out.extend_from_slice(&(self.salt.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.salt);
        out.push(MAC_NULL);

        out
    }
}

/// Extracts (TEK, salt) from the KEMAC key-data bytes.
fn parse_key_data(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut r = Reader { data, pos: 0 };
    let _next = r.u8()?;
    let type_kv = r.u8()?;
    let key_type = type_kv >> 4;
    let key_len = r.u16()? as usize;
    let tek = r.bytes(key_len)?.to_vec();

    let salt = if key_type == KEY_TYPE_TEK_SALT || key_type == 1 {
        let salt_len = r.u16()? as usize;
        r.bytes(salt_len)?.to_vec()
    } else {
        Vec::new()
    };

    Ok((tek, salt))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Mikey("truncated message".to_owned()));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut v = [0u8; 8];
        v.copy_from_slice(b);
        Ok(u64::from_be_bytes(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let tek = [0x11u8; 16];
        let salt = [0x22u8; 14];
        let msg = MikeyMessage::new(0x38F27A2F, 0xDD31_FD2A_0000_0000, &tek, &salt).unwrap();

        let raw = msg.marshal();
        let parsed = MikeyMessage::parse(&raw).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.tek, tek);
        assert_eq!(parsed.salt, salt);
        assert_eq!(parsed.crypto_sessions[0].ssrc, 0x38F27A2F);
    }

    #[test]
    fn test_sp_params_round_trip() {
        let mut msg =
            MikeyMessage::new(1, 0, &[0u8; 16], &[0u8; 14]).unwrap();
        msg.sp_params = vec![(0, vec![6]), (1, vec![16])];
        let parsed = MikeyMessage::parse(&msg.marshal()).unwrap();
        assert_eq!(parsed.sp_params, msg.sp_params);
    }

    #[test]
    fn test_truncated_rejected() {
        let msg = MikeyMessage::new(1, 0, &[0u8; 16], &[0u8; 14]).unwrap();
        let raw = msg.marshal();
        assert!(MikeyMessage::parse(&raw[..raw.len() - 3]).is_err());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        assert!(MikeyMessage::new(1, 0, &[0u8; 8], &[0u8; 14]).is_err());
    }
}
