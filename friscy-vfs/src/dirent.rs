//! `getdents64` record encoding (spec.md §4.1):
//! `{u64 d_ino, u64 d_off, u16 d_reclen, u8 d_type, char d_name[]\0}`,
//! each record padded to 8-byte alignment.

const FIXED_HEADER_LEN: usize = 8 + 8 + 2 + 1;

pub fn encode_dirent64(d_off: u64, name: &str, d_type: u8) -> Vec<u8> {
    let name_bytes = name.as_bytes();
    let unpadded = FIXED_HEADER_LEN + name_bytes.len() + 1;
    let reclen = (unpadded + 7) / 8 * 8;

    let mut buf = vec![0u8; reclen];
    // d_ino: synthesize from the name's hash so distinct entries get distinct inode numbers.
    let d_ino = fnv1a(name_bytes);
    buf[0..8].copy_from_slice(&d_ino.to_le_bytes());
    buf[8..16].copy_from_slice(&d_off.to_le_bytes());
    buf[16..18].copy_from_slice(&(reclen as u16).to_le_bytes());
    buf[18] = d_type;
    buf[19..19 + name_bytes.len()].copy_from_slice(name_bytes);
    // remaining bytes (null terminator + alignment pad) are already zeroed
    buf
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_8_byte_aligned_and_null_terminated() {
        let rec = encode_dirent64(1, "etc", 4);
        assert_eq!(rec.len() % 8, 0);
        assert_eq!(rec[16..18], (rec.len() as u16).to_le_bytes());
        assert_eq!(rec[18], 4);
        assert_eq!(&rec[19..22], b"etc");
        assert_eq!(rec[22], 0);
    }
}
