use std::fmt;

use crate::hash::double_sha256;
use crate::network::Net;
use crate::script;

const BASE58_ALPHABET: &[u8; 58] =
    b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const CASHADDR_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// A standard payment destination: pay-to-pubkey-hash or pay-to-script-hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    P2PKH([u8; 20]),
    P2SH([u8; 20]),
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddressError {
    BadChecksum,
    BadCharacter,
    BadLength,
    UnknownVersion(u8),
    WrongNetwork,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::BadChecksum => write!(f, "checksum mismatch"),
            AddressError::BadCharacter => write!(f, "invalid character"),
            AddressError::BadLength => write!(f, "invalid payload length"),
            AddressError::UnknownVersion(v) => write!(f, "unknown version byte {v:#04x}"),
            AddressError::WrongNetwork => write!(f, "address prefix is for another network"),
        }
    }
}

impl std::error::Error for AddressError {}

impl Address {
    #[must_use]
    pub fn hash160(&self) -> &[u8; 20] {
        match self {
            Address::P2PKH(h) | Address::P2SH(h) => h,
        }
    }

    /// The locking script paying to this address.
    #[must_use]
    pub fn to_script(&self) -> Vec<u8> {
        match self {
            Address::P2PKH(h) => script::p2pkh_script(h),
            Address::P2SH(h) => script::p2sh_script(h),
        }
    }

    /// The Electrum script hash used as the server-side identifier for
    /// this address.
    #[must_use]
    pub fn script_hash_hex(&self) -> String {
        script::script_hash_hex(&self.to_script())
    }

    /// Legacy Base58Check form: version byte + hash160 + 4 checksum bytes.
    #[must_use]
    pub fn to_base58(&self, net: &Net) -> String {
        let (version, hash) = match self {
            Address::P2PKH(h) => (net.p2pkh_version, h),
            Address::P2SH(h) => (net.p2sh_version, h),
        };
        let mut payload = Vec::with_capacity(21);
        payload.push(version);
        payload.extend_from_slice(hash);
        base58check_encode(&payload)
    }

    pub fn from_base58(s: &str, net: &Net) -> Result<Address, AddressError> {
        let payload = base58check_decode(s)?;
        if payload.len() != 21 {
            return Err(AddressError::BadLength);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        match payload[0] {
            v if v == net.p2pkh_version => Ok(Address::P2PKH(hash)),
            v if v == net.p2sh_version => Ok(Address::P2SH(hash)),
            v => Err(AddressError::UnknownVersion(v)),
        }
    }

    /// CashAddr form with the network's prefix.
    #[must_use]
    pub fn to_cashaddr(&self, net: &Net) -> String {
        let (kind, hash) = match self {
            Address::P2PKH(h) => (0u8, h),
            Address::P2SH(h) => (1u8, h),
        };
        // Version byte: type in bits 3..7, size code 0 for 160-bit hashes.
        let mut payload = Vec::with_capacity(21);
        payload.push(kind << 3);
        payload.extend_from_slice(hash);
        let data = convert_bits(&payload, 8, 5, true);

        let mut checked: Vec<u8> = expand_prefix(net.cashaddr_prefix);
        checked.extend_from_slice(&data);
        checked.extend_from_slice(&[0; 8]);
        let checksum = cashaddr_polymod(&checked);

        let mut out = String::with_capacity(net.cashaddr_prefix.len() + 1 + data.len() + 8);
        out.push_str(net.cashaddr_prefix);
        out.push(':');
        for d in &data {
            out.push(CASHADDR_CHARSET[*d as usize] as char);
        }
        for i in 0..8 {
            let d = ((checksum >> (5 * (7 - i))) & 0x1f) as usize;
            out.push(CASHADDR_CHARSET[d] as char);
        }
        out
    }

    /// Accepts both `prefix:payload` and bare payload forms, case
    /// insensitively.
    pub fn from_cashaddr(s: &str, net: &Net) -> Result<Address, AddressError> {
        let s = s.to_lowercase();
        let (prefix, payload) = match s.split_once(':') {
            Some((p, rest)) => (p, rest),
            None => (net.cashaddr_prefix, s.as_str()),
        };
        if prefix != net.cashaddr_prefix {
            return Err(AddressError::WrongNetwork);
        }

        let mut data = Vec::with_capacity(payload.len());
        for c in payload.bytes() {
            let value = CASHADDR_CHARSET
                .iter()
                .position(|&v| v == c)
                .ok_or(AddressError::BadCharacter)?;
            data.push(value as u8);
        }
        if data.len() < 9 {
            return Err(AddressError::BadLength);
        }

        let mut checked = expand_prefix(prefix);
        checked.extend_from_slice(&data);
        if cashaddr_polymod(&checked) != 0 {
            return Err(AddressError::BadChecksum);
        }

        let payload = convert_bits(&data[..data.len() - 8], 5, 8, false);
        if payload.len() != 21 {
            return Err(AddressError::BadLength);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        match payload[0] >> 3 {
            0 => Ok(Address::P2PKH(hash)),
            1 => Ok(Address::P2SH(hash)),
            v => Err(AddressError::UnknownVersion(v)),
        }
    }

    /// Parses either encoding.
    pub fn from_string(s: &str, net: &Net) -> Result<Address, AddressError> {
        Address::from_base58(s, net).or_else(|_| Address::from_cashaddr(s, net))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58(Net::selected()))
    }
}

pub fn base58check_encode(payload: &[u8]) -> String {
    let checksum = double_sha256(payload);
    let mut data = payload.to_vec();
    data.extend_from_slice(&checksum.0[..4]);

    let zeros = data.iter().take_while(|b| **b == 0).count();
    // Little-endian base-58 digits.
    let mut digits: Vec<u8> = Vec::new();
    for &byte in &data {
        let mut carry = u32::from(byte);
        for d in &mut digits {
            carry += u32::from(*d) << 8;
            *d = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    for _ in 0..zeros {
        out.push('1');
    }
    for &d in digits.iter().rev() {
        out.push(BASE58_ALPHABET[d as usize] as char);
    }
    out
}

pub fn base58check_decode(s: &str) -> Result<Vec<u8>, AddressError> {
    let mut bytes: Vec<u8> = Vec::new();
    for c in s.bytes() {
        let value = BASE58_ALPHABET
            .iter()
            .position(|&v| v == c)
            .ok_or(AddressError::BadCharacter)?;
        let mut carry = value as u32;
        for b in &mut bytes {
            carry += u32::from(*b) * 58;
            *b = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let zeros = s.bytes().take_while(|b| *b == b'1').count();
    for _ in 0..zeros {
        bytes.push(0);
    }
    bytes.reverse();

    if bytes.len() < 4 {
        return Err(AddressError::BadLength);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - 4);
    if double_sha256(payload).0[..4] != *checksum {
        return Err(AddressError::BadChecksum);
    }
    Ok(payload.to_vec())
}

fn expand_prefix(prefix: &str) -> Vec<u8> {
    let mut out: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    out.push(0);
    out
}

fn cashaddr_polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x0007_ffff_ffff) << 5) ^ u64::from(d);
        if c0 & 0x01 != 0 {
            c ^= 0x98_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e_4f43_e470;
        }
    }
    c ^ 1
}

/// Regroups the bit stream of `data` from `from`-bit to `to`-bit values.
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Vec<u8> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut out = Vec::new();
    let max = (1u32 << to) - 1;
    for &value in data {
        acc = (acc << from) | u32::from(value);
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max) as u8);
        }
    }
    if pad && bits > 0 {
        out.push(((acc << (to - bits)) & max) as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MAINNET;

    fn hash20(fill: u8) -> [u8; 20] {
        [fill; 20]
    }

    #[test]
    fn base58check_round_trip() {
        let mut payload = vec![MAINNET.p2pkh_version];
        payload.extend_from_slice(&hash20(0x5a));
        let encoded = base58check_encode(&payload);
        assert_eq!(base58check_decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn base58_leading_zero_bytes_become_ones() {
        let encoded = base58check_encode(&[0, 0, 1, 2, 3]);
        assert!(encoded.starts_with("11"));
        assert_eq!(base58check_decode(&encoded).unwrap(), vec![0, 0, 1, 2, 3]);
    }

    #[test]
    fn base58_rejects_corruption() {
        let addr = Address::P2PKH(hash20(7)).to_base58(&MAINNET);
        let mut corrupted = addr.into_bytes();
        let last = corrupted.last_mut().unwrap();
        *last = if *last == b'2' { b'3' } else { b'2' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        assert_eq!(
            base58check_decode(&corrupted).unwrap_err(),
            AddressError::BadChecksum
        );
    }

    #[test]
    fn known_p2pkh_vector() {
        // All-zero hash160 with version 0x00 is the classic burn address.
        let addr = Address::P2PKH(hash20(0));
        assert_eq!(
            addr.to_base58(&MAINNET),
            "1111111111111111111114oLvT2"
        );
        assert_eq!(
            Address::from_base58("1111111111111111111114oLvT2", &MAINNET).unwrap(),
            addr
        );
    }

    #[test]
    fn cashaddr_round_trip_both_kinds() {
        for addr in [Address::P2PKH(hash20(0x11)), Address::P2SH(hash20(0xee))] {
            let encoded = addr.to_cashaddr(&MAINNET);
            assert!(encoded.starts_with("bitcoincash:"));
            assert_eq!(Address::from_cashaddr(&encoded, &MAINNET).unwrap(), addr);
            // Bare (prefixless) and uppercase forms are accepted too.
            let bare = encoded.split_once(':').unwrap().1.to_string();
            assert_eq!(Address::from_cashaddr(&bare, &MAINNET).unwrap(), addr);
            assert_eq!(
                Address::from_cashaddr(&encoded.to_uppercase(), &MAINNET).unwrap(),
                addr
            );
        }
    }

    #[test]
    fn cashaddr_rejects_bad_checksum() {
        let encoded = Address::P2PKH(hash20(0x11)).to_cashaddr(&MAINNET);
        let mut chars: Vec<char> = encoded.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'q' { 'p' } else { 'q' };
        let corrupted: String = chars.into_iter().collect();
        assert_eq!(
            Address::from_cashaddr(&corrupted, &MAINNET).unwrap_err(),
            AddressError::BadChecksum
        );
    }

    #[test]
    fn from_string_accepts_both_encodings() {
        let addr = Address::P2SH(hash20(0x42));
        let legacy = addr.to_base58(&MAINNET);
        let cash = addr.to_cashaddr(&MAINNET);
        assert_eq!(Address::from_string(&legacy, &MAINNET).unwrap(), addr);
        assert_eq!(Address::from_string(&cash, &MAINNET).unwrap(), addr);
    }
}
