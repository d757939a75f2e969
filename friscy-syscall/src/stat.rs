//! `struct stat`/`struct statx` encoding for `fstat`/`newfstatat`/`statx`
//! (spec.md §4.9's file-I/O group). Byte layouts match the riscv64 LP64
//! generic glibc ABI.

use friscy_vfs::entry::VfsEntry;

pub const STAT_SIZE: usize = 128;
pub const STATX_SIZE: usize = 256;

pub const STATX_BASIC_STATS: u32 = 0x7ff;

fn synth_ino(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in name.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash | 1
}

/// Encodes a riscv64 `struct stat` (128 bytes) for `entry`.
pub fn encode_stat(entry: &VfsEntry) -> [u8; STAT_SIZE] {
    let mut buf = [0u8; STAT_SIZE];
    let ino = synth_ino(&entry.name);
    let mode = entry.kind.mode_bits() | (entry.mode & 0o7777);
    let blocks = entry.content.len().div_ceil(512) as u64;

    buf[0..8].copy_from_slice(&1u64.to_le_bytes()); // st_dev
    buf[8..16].copy_from_slice(&ino.to_le_bytes());
    buf[16..20].copy_from_slice(&mode.to_le_bytes());
    buf[20..24].copy_from_slice(&1u32.to_le_bytes()); // st_nlink
    buf[24..28].copy_from_slice(&entry.uid.to_le_bytes());
    buf[28..32].copy_from_slice(&entry.gid.to_le_bytes());
    // st_rdev [32..40] left zero
    buf[40..48].copy_from_slice(&(entry.size as i64).to_le_bytes());
    buf[48..52].copy_from_slice(&4096u32.to_le_bytes()); // st_blksize
    buf[56..64].copy_from_slice(&(blocks as i64).to_le_bytes());
    buf[64..72].copy_from_slice(&entry.mtime.to_le_bytes()); // st_atime
    buf[80..88].copy_from_slice(&entry.mtime.to_le_bytes()); // st_mtime
    buf[96..104].copy_from_slice(&entry.mtime.to_le_bytes()); // st_ctime
    buf
}

/// Encodes a riscv64 `struct statx` (256 bytes) for `entry`.
pub fn encode_statx(entry: &VfsEntry) -> [u8; STATX_SIZE] {
    let mut buf = [0u8; STATX_SIZE];
    let ino = synth_ino(&entry.name);
    let mode = (entry.kind.mode_bits() | (entry.mode & 0o7777)) as u16;
    let blocks = entry.content.len().div_ceil(512) as u64;

    buf[0..4].copy_from_slice(&STATX_BASIC_STATS.to_le_bytes());
    buf[4..8].copy_from_slice(&4096u32.to_le_bytes()); // stx_blksize
    buf[16..20].copy_from_slice(&1u32.to_le_bytes()); // stx_nlink
    buf[20..24].copy_from_slice(&entry.uid.to_le_bytes());
    buf[24..28].copy_from_slice(&entry.gid.to_le_bytes());
    buf[28..30].copy_from_slice(&mode.to_le_bytes());
    buf[32..40].copy_from_slice(&ino.to_le_bytes());
    buf[40..48].copy_from_slice(&entry.size.to_le_bytes());
    buf[48..56].copy_from_slice(&blocks.to_le_bytes());
    // stx_atime at 64, stx_mtime at 112, stx_ctime at 96 (statx_timestamp { i64 tv_sec; u32 tv_nsec; })
    buf[64..72].copy_from_slice(&entry.mtime.to_le_bytes());
    buf[96..104].copy_from_slice(&entry.mtime.to_le_bytes());
    buf[112..120].copy_from_slice(&entry.mtime.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy_vfs::entry::VfsEntry;

    #[test]
    fn stat_encodes_size_and_mode() {
        let mut entry = VfsEntry::new_file("x", 0o644, None);
        entry.content = vec![0u8; 10];
        entry.size = 10;
        let buf = encode_stat(&entry);
        assert_eq!(i64::from_le_bytes(buf[40..48].try_into().unwrap()), 10);
        let mode = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        assert_eq!(mode & 0o7777, 0o644);
        assert_eq!(mode & 0o170000, 0o100000);
    }

    #[test]
    fn statx_reports_basic_stats_mask() {
        let entry = VfsEntry::new_dir("d", 0o755, None);
        let buf = encode_statx(&entry);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), STATX_BASIC_STATS);
    }
}
