use aes::cipher::{KeyIvInit, StreamCipher};
use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::HashMap;

use shared::error::{Error, Result};
use shared::replay_detector::SlidingWindowDetector;

use crate::key_derivation::{Aes128Ctr, SessionKeys, SESSION_KEY_LEN};

type HmacSha1 = Hmac<Sha1>;

const AUTH_TAG_LEN: usize = 10;
const SRTCP_INDEX_LEN: usize = 4;
const SRTCP_E_BIT: u32 = 1 << 31;
const REPLAY_WINDOW: u64 = 64;

struct SsrcState {
    rollover_counter: u32,
    last_seq: u16,
    started: bool,
    replay: SlidingWindowDetector,
}

impl SsrcState {
    fn new() -> Self {
        Self {
            rollover_counter: 0,
            last_seq: 0,
            started: false,
            replay: SlidingWindowDetector::new(REPLAY_WINDOW),
        }
    }

    /// RFC 3711 section 3.3.1 index estimate from a received sequence
    /// number.
    fn estimate_rollover(&self, seq: u16) -> u32 {
        if !self.started {
            return 0;
        }
        if self.last_seq < 0x8000 {
            if seq as i32 - self.last_seq as i32 > 0x8000 {
                self.rollover_counter.wrapping_sub(1)
            } else {
                self.rollover_counter
            }
        } else if self.last_seq as i32 - 0x8000 > seq as i32 {
            self.rollover_counter.wrapping_add(1)
        } else {
            self.rollover_counter
        }
    }

    fn commit(&mut self, rollover: u32, seq: u16) {
        if !self.started {
            self.started = true;
            self.rollover_counter = rollover;
            self.last_seq = seq;
            return;
        }
        if rollover == self.rollover_counter.wrapping_add(1)
            || (rollover == self.rollover_counter && seq > self.last_seq)
        {
            self.rollover_counter = rollover;
            self.last_seq = seq;
        }
    }
}

/// One direction's SRTP/SRTCP crypto context, keyed by the master key and
/// salt exported from the DTLS handshake.
pub struct Context {
    keys: SessionKeys,
    rtp_states: HashMap<u32, SsrcState>,
    rtcp_index: u32,
    rtcp_replay: HashMap<u32, SlidingWindowDetector>,
}

impl Context {
    pub fn new(master_key: &[u8], master_salt: &[u8]) -> Result<Self> {
        Ok(Self {
            keys: SessionKeys::derive(master_key, master_salt)?,
            rtp_states: HashMap::new(),
            rtcp_index: 0,
            rtcp_replay: HashMap::new(),
        })
    }

    /// Encrypts and authenticates an RTP packet in place of its payload,
    /// returning header || ciphertext || tag.
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let header_len = rtp_header_len(packet)?;
        let ssrc = BigEndian::read_u32(&packet[8..12]);
        let seq = BigEndian::read_u16(&packet[2..4]);

        let state = self.rtp_states.entry(ssrc).or_insert_with(SsrcState::new);
        if state.started && seq < state.last_seq && state.last_seq - seq > 0x8000 {
            state.rollover_counter = state.rollover_counter.wrapping_add(1);
        }
        state.started = true;
        state.last_seq = seq;
        let rollover = state.rollover_counter;

        let mut out = packet.to_vec();
        let iv = rtp_iv(&self.keys.rtp_salt, ssrc, rollover, seq);
        apply_ctr(&self.keys.rtp_key, &iv, &mut out[header_len..])?;

        let tag = rtp_auth_tag(&self.keys.rtp_auth_key, &out, rollover);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verifies and decrypts an SRTP packet, enforcing per-SSRC replay
    /// protection.
    pub fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < AUTH_TAG_LEN {
            return Err(Error::ErrTooShortRtp);
        }
        let (body, tag) = packet.split_at(packet.len() - AUTH_TAG_LEN);
        let header_len = rtp_header_len(body)?;
        let ssrc = BigEndian::read_u32(&body[8..12]);
        let seq = BigEndian::read_u16(&body[2..4]);

        let state = self.rtp_states.entry(ssrc).or_insert_with(SsrcState::new);
        let rollover = state.estimate_rollover(seq);
        let index = (u64::from(rollover) << 16) | u64::from(seq);
        if !state.replay.check(index) {
            return Err(Error::ErrDuplicated);
        }

        let mut mac = HmacSha1::new_from_slice(&self.keys.rtp_auth_key)
            .expect("hmac accepts any key length");
        mac.update(body);
        mac.update(&rollover.to_be_bytes());
        if mac.verify_truncated_left(tag).is_err() {
            return Err(Error::ErrFailedToVerifyAuthTag);
        }
        state.replay.accept();
        state.commit(rollover, seq);

        let mut out = body.to_vec();
        let iv = rtp_iv(&self.keys.rtp_salt, ssrc, rollover, seq);
        apply_ctr(&self.keys.rtp_key, &iv, &mut out[header_len..])?;
        Ok(out)
    }

    /// Encrypts and authenticates an RTCP compound packet, appending the
    /// SRTCP index with the E bit and the tag.
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < 8 {
            return Err(Error::ErrTooShortRtcp);
        }
        let ssrc = BigEndian::read_u32(&packet[4..8]);
        self.rtcp_index = (self.rtcp_index + 1) & !SRTCP_E_BIT;
        let index = self.rtcp_index;

        let mut out = packet.to_vec();
        let iv = rtcp_iv(&self.keys.rtcp_salt, ssrc, index);
        apply_ctr(&self.keys.rtcp_key, &iv, &mut out[8..])?;

        out.extend_from_slice(&(index | SRTCP_E_BIT).to_be_bytes());
        let mut mac = HmacSha1::new_from_slice(&self.keys.rtcp_auth_key)
            .expect("hmac accepts any key length");
        mac.update(&out);
        let tag = mac.finalize().into_bytes();
        out.extend_from_slice(&tag[..AUTH_TAG_LEN]);
        Ok(out)
    }

    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < 8 + SRTCP_INDEX_LEN + AUTH_TAG_LEN {
            return Err(Error::ErrTooShortRtcp);
        }
        let (authed, tag) = packet.split_at(packet.len() - AUTH_TAG_LEN);
        let mut mac = HmacSha1::new_from_slice(&self.keys.rtcp_auth_key)
            .expect("hmac accepts any key length");
        mac.update(authed);
        if mac.verify_truncated_left(tag).is_err() {
            return Err(Error::ErrFailedToVerifyAuthTag);
        }

        let (body, index_raw) = authed.split_at(authed.len() - SRTCP_INDEX_LEN);
        let index_word = BigEndian::read_u32(index_raw);
        let encrypted = index_word & SRTCP_E_BIT != 0;
        let index = index_word & !SRTCP_E_BIT;
        let ssrc = BigEndian::read_u32(&body[4..8]);

        let replay = self
            .rtcp_replay
            .entry(ssrc)
            .or_insert_with(|| SlidingWindowDetector::new(REPLAY_WINDOW));
        if !replay.check(u64::from(index)) {
            return Err(Error::ErrDuplicated);
        }
        replay.accept();

        let mut out = body.to_vec();
        if encrypted {
            let iv = rtcp_iv(&self.keys.rtcp_salt, ssrc, index);
            apply_ctr(&self.keys.rtcp_key, &iv, &mut out[8..])?;
        }
        Ok(out)
    }
}

fn rtp_header_len(packet: &[u8]) -> Result<usize> {
    if packet.len() < 12 {
        return Err(Error::ErrTooShortRtp);
    }
    if packet[0] >> 6 != 2 {
        return Err(Error::ErrBadVersion);
    }
    let csrc_count = (packet[0] & 0x0F) as usize;
    let mut len = 12 + 4 * csrc_count;
    if packet[0] & 0x10 != 0 {
        if packet.len() < len + 4 {
            return Err(Error::ErrTooShortRtp);
        }
        let extension_words = BigEndian::read_u16(&packet[len + 2..len + 4]) as usize;
        len += 4 + 4 * extension_words;
    }
    if packet.len() < len {
        return Err(Error::ErrTooShortRtp);
    }
    Ok(len)
}

/// RFC 3711 section 4.1.1: IV = (salt << 16) ^ (ssrc << 64) ^ (index << 16)
/// with index = rollover || sequence.
fn rtp_iv(salt: &[u8], ssrc: u32, rollover: u32, seq: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..salt.len()].copy_from_slice(salt);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    for (i, b) in rollover.to_be_bytes().iter().enumerate() {
        iv[8 + i] ^= b;
    }
    for (i, b) in seq.to_be_bytes().iter().enumerate() {
        iv[12 + i] ^= b;
    }
    iv
}

fn rtcp_iv(salt: &[u8], ssrc: u32, index: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..salt.len()].copy_from_slice(salt);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    for (i, b) in index.to_be_bytes().iter().enumerate() {
        iv[10 + i] ^= b;
    }
    iv
}

fn apply_ctr(key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    if key.len() != SESSION_KEY_LEN {
        return Err(Error::ErrShortSrtpMasterKey);
    }
    let mut k = [0u8; SESSION_KEY_LEN];
    k.copy_from_slice(key);
    let mut cipher = Aes128Ctr::new(&k.into(), iv.into());
    cipher.apply_keystream(data);
    Ok(())
}

fn rtp_auth_tag(auth_key: &[u8], packet: &[u8], rollover: u32) -> [u8; AUTH_TAG_LEN] {
    let mut mac = HmacSha1::new_from_slice(auth_key).expect("hmac accepts any key length");
    mac.update(packet);
    mac.update(&rollover.to_be_bytes());
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&full[..AUTH_TAG_LEN]);
    tag
}
