use crate::hash::sha256;

pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;

/// Appends the minimal push opcode for `data` followed by the data itself.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

#[must_use]
pub fn p2pkh_script(hash160: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    push_data(&mut script, hash160);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

#[must_use]
pub fn p2sh_script(hash160: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    push_data(&mut script, hash160);
    script.push(OP_EQUAL);
    script
}

/// The Electrum identifier for a locking script: sha256 of the script,
/// hex-encoded in reversed byte order.
#[must_use]
pub fn script_hash_hex(script: &[u8]) -> String {
    sha256(script).to_rev_hex()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_layout() {
        let script = p2pkh_script(&[0xab; 20]);
        assert_eq!(script.len(), 25);
        assert_eq!(script[0], OP_DUP);
        assert_eq!(script[1], OP_HASH160);
        assert_eq!(script[2], 20);
        assert_eq!(&script[3..23], &[0xab; 20]);
        assert_eq!(script[23], OP_EQUALVERIFY);
        assert_eq!(script[24], OP_CHECKSIG);
    }

    #[test]
    fn p2sh_layout() {
        let script = p2sh_script(&[0xcd; 20]);
        assert_eq!(script.len(), 23);
        assert_eq!(script[0], OP_HASH160);
        assert_eq!(script[22], OP_EQUAL);
    }

    #[test]
    fn push_data_selects_width_by_length() {
        let mut direct = Vec::new();
        push_data(&mut direct, &[0u8; 75]);
        assert_eq!(direct[0], 75);

        let mut one = Vec::new();
        push_data(&mut one, &[0u8; 76]);
        assert_eq!(&one[..2], &[OP_PUSHDATA1, 76]);

        let mut two = Vec::new();
        push_data(&mut two, &vec![0u8; 0x1234]);
        assert_eq!(&two[..3], &[OP_PUSHDATA2, 0x34, 0x12]);

        let mut four = Vec::new();
        push_data(&mut four, &vec![0u8; 0x0001_0000]);
        assert_eq!(&four[..5], &[OP_PUSHDATA4, 0, 0, 1, 0]);
    }

    #[test]
    fn script_hash_is_reversed_sha256() {
        let script = p2pkh_script(&[0; 20]);
        let forward = sha256(&script);
        let hexed = script_hash_hex(&script);
        assert_eq!(hexed, forward.to_rev_hex());
        assert_eq!(hexed.len(), 64);
    }
}
