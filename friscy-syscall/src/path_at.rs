//! Resolves the `dirfd`/`path` pair every `*at` syscall takes (spec.md §4.9)
//! down to a single absolute-or-cwd-relative path string the rest of
//! `friscy-vfs`'s API already understands.

use friscy_vfs::Vfs;

use crate::flags::AT_FDCWD;

pub fn resolve_dirfd_path(vfs: &Vfs, dirfd: i32, path: &str) -> Result<String, i64> {
    if path.starts_with('/') || dirfd == AT_FDCWD {
        return Ok(path.to_string());
    }
    let dir_entry = vfs.fd_dir_entry(dirfd).map_err(|e| e.neg_errno())?;
    let base = vfs.path_of_entry(dir_entry);
    if path.is_empty() {
        return Ok(base);
    }
    Ok(format!("{}/{}", base.trim_end_matches('/'), path))
}
