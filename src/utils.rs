use rand::Rng;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Azureus-style client id: an 8-byte prefix
/// naming the client and version, followed by 12 random bytes.
const PEER_ID_PREFIX: &[u8; 8] = b"-RB0010-";

pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}

/// Returns `(bytes_free, bytes_total)` of the filesystem backing `path`,
/// for the `free-space` RPC. The standard library has no portable way to
/// ask a filesystem's capacity, so this reaches for `libc::statvfs`.
pub fn filesystem_capacity(path: &Path) -> io::Result<(u64, u64)> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let block_size = stat.f_frsize as u64;
    let free = stat.f_bavail as u64 * block_size;
    let total = stat.f_blocks as u64 * block_size;
    Ok((free, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_carries_the_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], PEER_ID_PREFIX);
    }

    #[test]
    fn peer_ids_are_not_all_identical() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }

    #[test]
    fn filesystem_capacity_reports_nonzero_total_for_tmp() {
        let (free, total) = filesystem_capacity(Path::new("/tmp")).unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }
}
