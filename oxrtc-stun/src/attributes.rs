use byteorder::{BigEndian, ByteOrder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use shared::error::{Error, Result};

use crate::message::{Message, MAGIC_COOKIE};

pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_PRIORITY: u16 = 0x0024;
pub const ATTR_USE_CANDIDATE: u16 = 0x0025;
pub const ATTR_FINGERPRINT: u16 = 0x8028;
pub const ATTR_ICE_CONTROLLED: u16 = 0x8029;
pub const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

impl Message {
    pub fn add_username(&mut self, username: &str) {
        self.add_attribute(ATTR_USERNAME, username.as_bytes().to_vec());
    }

    pub fn username(&self) -> Option<String> {
        self.get_attribute(ATTR_USERNAME)
            .and_then(|v| String::from_utf8(v.to_vec()).ok())
    }

    pub fn add_priority(&mut self, priority: u32) {
        self.add_attribute(ATTR_PRIORITY, priority.to_be_bytes().to_vec());
    }

    pub fn priority(&self) -> Option<u32> {
        self.get_attribute(ATTR_PRIORITY)
            .filter(|v| v.len() == 4)
            .map(BigEndian::read_u32)
    }

    pub fn add_use_candidate(&mut self) {
        self.add_attribute(ATTR_USE_CANDIDATE, vec![]);
    }

    pub fn has_use_candidate(&self) -> bool {
        self.get_attribute(ATTR_USE_CANDIDATE).is_some()
    }

    pub fn add_ice_controlling(&mut self, tie_breaker: u64) {
        self.add_attribute(ATTR_ICE_CONTROLLING, tie_breaker.to_be_bytes().to_vec());
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.get_attribute(ATTR_ICE_CONTROLLING)
            .filter(|v| v.len() == 8)
            .map(BigEndian::read_u64)
    }

    pub fn add_ice_controlled(&mut self, tie_breaker: u64) {
        self.add_attribute(ATTR_ICE_CONTROLLED, tie_breaker.to_be_bytes().to_vec());
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.get_attribute(ATTR_ICE_CONTROLLED)
            .filter(|v| v.len() == 8)
            .map(BigEndian::read_u64)
    }

    pub fn add_error_code(&mut self, code: u16, reason: &str) {
        let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
        value.extend_from_slice(reason.as_bytes());
        self.add_attribute(ATTR_ERROR_CODE, value);
    }

    pub fn error_code(&self) -> Option<(u16, String)> {
        let value = self.get_attribute(ATTR_ERROR_CODE)?;
        if value.len() < 4 {
            return None;
        }
        let code = (value[2] as u16) * 100 + value[3] as u16;
        let reason = String::from_utf8_lossy(&value[4..]).to_string();
        Some((code, reason))
    }

    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) {
        let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
        let mut value = vec![0u8];
        match addr.ip() {
            IpAddr::V4(ip) => {
                value.push(FAMILY_IPV4);
                value.extend_from_slice(&xport.to_be_bytes());
                let xip = u32::from(ip) ^ MAGIC_COOKIE;
                value.extend_from_slice(&xip.to_be_bytes());
            }
            IpAddr::V6(ip) => {
                value.push(FAMILY_IPV6);
                value.extend_from_slice(&xport.to_be_bytes());
                let mut xor_mask = [0u8; 16];
                xor_mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                xor_mask[4..].copy_from_slice(&self.transaction_id.0);
                let octets = ip.octets();
                for (i, b) in octets.iter().enumerate() {
                    value.push(b ^ xor_mask[i]);
                }
            }
        }
        self.add_attribute(ATTR_XOR_MAPPED_ADDRESS, value);
    }

    pub fn xor_mapped_address(&self) -> Result<SocketAddr> {
        let value = self
            .get_attribute(ATTR_XOR_MAPPED_ADDRESS)
            .ok_or(Error::ErrAttributeNotFound)?;
        if value.len() < 8 {
            return Err(Error::ErrBadIpLength);
        }
        let port = BigEndian::read_u16(&value[2..4]) ^ (MAGIC_COOKIE >> 16) as u16;
        match value[1] {
            FAMILY_IPV4 => {
                let ip = Ipv4Addr::from(BigEndian::read_u32(&value[4..8]) ^ MAGIC_COOKIE);
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            FAMILY_IPV6 => {
                if value.len() < 20 {
                    return Err(Error::ErrBadIpLength);
                }
                let mut xor_mask = [0u8; 16];
                xor_mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                xor_mask[4..].copy_from_slice(&self.transaction_id.0);
                let mut octets = [0u8; 16];
                for i in 0..16 {
                    octets[i] = value[4 + i] ^ xor_mask[i];
                }
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => Err(Error::ErrBadIpLength),
        }
    }
}
