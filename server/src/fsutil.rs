//! Thin filesystem helpers: hole punching, free-space probing, and the
//! reflink fallback the file store tries between hardlink and plain copy.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

/// Punch a zero hole into `file`. Falls back to writing zeros where the
/// filesystem cannot deallocate ranges.
pub fn punch_hole(file: &mut File, offset: i64, len: i64) -> io::Result<()> {
    if len <= 0 {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset,
                len,
            )
        };
        if ret == 0 {
            // KEEP_SIZE leaves the length alone; extend if the hole ends
            // past the current end so reads see zeros.
            let end = (offset + len) as u64;
            if file.metadata()?.len() < end {
                file.set_len(end)?;
            }
            return Ok(());
        }
    }

    write_zeros(file, offset, len)
}

fn write_zeros(file: &mut File, offset: i64, len: i64) -> io::Result<()> {
    let zeros = [0u8; 32 * 1024];
    file.seek(SeekFrom::Start(offset as u64))?;
    let mut remaining = len as usize;
    while remaining > 0 {
        let want = zeros.len().min(remaining);
        file.write_all(&zeros[..want])?;
        remaining -= want;
    }
    Ok(())
}

/// Free bytes on the volume holding `path`.
pub fn free_space(path: &Path) -> io::Result<u64> {
    let probe = if path.exists() {
        path
    } else {
        path.parent().unwrap_or(Path::new("."))
    };
    let c_path = CString::new(probe.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Clone `src` into `dst` via FICLONE. Errors (EXDEV, unsupported fs) are
/// the caller's cue to fall back to a plain copy.
pub fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        const FICLONE: libc::c_ulong = 0x4004_9409;

        let src_f = File::open(src)?;
        let dst_f = File::create(dst)?;
        let ret = unsafe { libc::ioctl(dst_f.as_raw_fd(), FICLONE, src_f.as_raw_fd()) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            drop(dst_f);
            std::fs::remove_file(dst).ok();
            return Err(err);
        }
        return Ok(());
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (src, dst);
        Err(io::Error::new(io::ErrorKind::Unsupported, "reflink not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn punch_hole_zeroes_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, vec![0xFFu8; 64 * 1024]).unwrap();
        let mut file = File::options().read(true).write(true).open(&path).unwrap();

        punch_hole(&mut file, 4096, 8192).unwrap();

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut data).unwrap();
        assert!(data[..4096].iter().all(|&b| b == 0xFF));
        assert!(data[4096..12288].iter().all(|&b| b == 0));
        assert!(data[12288..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn punch_hole_extends_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let mut file = File::options().read(true).write(true).open(&path).unwrap();

        punch_hole(&mut file, 0, 1 << 20).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 1 << 20);
    }

    #[test]
    fn free_space_reports_nonzero() {
        let dir = tempdir().unwrap();
        assert!(free_space(dir.path()).unwrap() > 0);
    }
}
