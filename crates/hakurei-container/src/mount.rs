//! Mount primitives used by init and the ops.
//!
//! Within the user namespace that owns the mount namespace, init holds
//! `CAP_SYS_ADMIN` and may create bind mounts and mount `proc`, `devpts`,
//! `tmpfs` and `mqueue`.

use std::ffi::{CStr, CString};
use std::fs;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use hakurei_sys::last_errno;
use rustix::io::Errno;
use tracing::debug;

use crate::path::{mkdir_all, parent_perm, to_host};

pub const SOURCE_PROC: &CStr = c"proc";
pub const SOURCE_DEVPTS: &CStr = c"devpts";
pub const SOURCE_MQUEUE: &CStr = c"mqueue";
pub const SOURCE_TMPFS_ROOTFS: &str = "rootfs";
pub const SOURCE_TMPFS_DEVTMPFS: &str = "devtmpfs";
pub const SOURCE_TMPFS_EPHEMERAL: &str = "ephemeral";
pub const SOURCE_TMPFS_READONLY: &str = "readonly";

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mountinfo of init while the intermediate root is active; the only proc
/// then is the one under the old root.
fn host_mountinfo() -> PathBuf {
    to_host(MOUNTINFO)
}

#[inline]
pub(crate) fn path_to_cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)
}

/// Thin `mount(2)` wrapper; `None` passes a null pointer.
pub fn mount(
    source: Option<&CStr>,
    target: &Path,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
    data: Option<&CStr>,
) -> Result<(), Errno> {
    let target_c = path_to_cstring(target)?;
    let ptr = |s: Option<&CStr>| s.map_or(std::ptr::null(), CStr::as_ptr);
    let ret = unsafe {
        libc::mount(
            ptr(source),
            target_c.as_ptr(),
            ptr(fstype),
            flags,
            ptr(data).cast(),
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Change propagation of the mount at `target`.
pub fn set_propagation(target: &Path, flags: libc::c_ulong) -> Result<(), Errno> {
    mount(None, target, None, flags | libc::MS_SILENT, None)
}

pub fn umount_detach(target: &Path) -> Result<(), Errno> {
    let target_c = path_to_cstring(target)?;
    if unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) } != 0 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

pub fn pivot_root(new_root: &Path, put_old: &Path) -> Result<(), Errno> {
    rustix::process::pivot_root(new_root, put_old)
}

/// Set the hostname.
pub fn set_hostname(name: &str) -> Result<(), Errno> {
    let ret = unsafe { libc::sethostname(name.as_ptr().cast::<libc::c_char>(), name.len()) };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Bind `source` onto `target`, then remount with `flags`.
///
/// Only `MS_REC`, `MS_RDONLY` and `MS_NODEV` are meaningful in `flags`;
/// `MS_NOSUID` is always applied.
pub fn bind_mount(source: &Path, target: &Path, flags: libc::c_ulong) -> Result<(), Errno> {
    if source == target {
        debug!("resolved {:?} flags {flags:#x}", target);
    } else {
        debug!("resolved {:?} on {:?} flags {flags:#x}", source, target);
    }
    let source_c = path_to_cstring(source)?;
    mount(
        Some(&source_c),
        target,
        None,
        libc::MS_SILENT | libc::MS_BIND | (flags & libc::MS_REC),
        None,
    )?;
    remount(target, flags)
}

/// Apply `flags` to the mount at `target` and, with `MS_REC`, to every
/// mount below it.
///
/// Flags already set on a mount are carried over; the kernel refuses to
/// clear locked flags inherited from a more privileged namespace.
pub fn remount(target: &Path, flags: libc::c_ulong) -> Result<(), Errno> {
    let target = fs::canonicalize(target).map_err(|e| io_errno(&e))?;
    let want = libc::MS_NOSUID | (flags & libc::MS_NODEV) | (flags & libc::MS_RDONLY);

    remount_with_flags(&target, want)?;
    if flags & libc::MS_REC == 0 {
        return Ok(());
    }

    let info = fs::read(host_mountinfo()).map_err(|e| io_errno(&e))?;
    for point in submounts(&info, &target) {
        match remount_with_flags(&point, want) {
            Err(Errno::ACCESS) => debug!("skipping inaccessible mount {:?}", point),
            r => r?,
        }
    }
    Ok(())
}

fn remount_with_flags(target: &Path, want: libc::c_ulong) -> Result<(), Errno> {
    let have = mount_flags(target)?;
    if have & want == want {
        return Ok(());
    }
    mount(
        None,
        target,
        None,
        libc::MS_SILENT | libc::MS_BIND | libc::MS_REMOUNT | have | want,
        None,
    )
}

/// Per-mount flags of the filesystem at `target`, as `MS_*` bits.
fn mount_flags(target: &Path) -> Result<libc::c_ulong, Errno> {
    let target_c = path_to_cstring(target)?;
    let mut st = MaybeUninit::<libc::statvfs>::uninit();
    if unsafe { libc::statvfs(target_c.as_ptr(), st.as_mut_ptr()) } != 0 {
        return Err(last_errno());
    }
    let f = unsafe { st.assume_init() }.f_flag;
    let mut flags = 0;
    for (st_bit, ms_bit) in [
        (libc::ST_RDONLY, libc::MS_RDONLY),
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ] {
        if f & st_bit != 0 {
            flags |= ms_bit;
        }
    }
    Ok(flags)
}

/// Mount points strictly below `target`, in mountinfo order.
fn submounts(mountinfo: &[u8], target: &Path) -> Vec<PathBuf> {
    let prefix = target.as_os_str().as_bytes();
    String::from_utf8_lossy(mountinfo)
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|p| PathBuf::from(unescape_octal(p)))
        .filter(|p| {
            let b = p.as_os_str().as_bytes();
            b.len() > prefix.len()
                && b.starts_with(prefix)
                && (prefix == b"/" || b[prefix.len()] == b'/')
        })
        .collect()
}

/// Undo the `\ooo` escaping mountinfo applies to whitespace and backslashes.
fn unescape_octal(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\'
            && i + 3 < b.len()
            && b[i + 1..i + 4].iter().all(|c| (b'0'..=b'7').contains(c))
        {
            let v = b[i + 1..i + 4]
                .iter()
                .fold(0u32, |v, c| v * 8 + u32::from(c - b'0'));
            match u8::try_from(v) {
                Ok(v) => {
                    out.push(v);
                    i += 4;
                }
                Err(_) => {
                    out.push(b[i]);
                    i += 1;
                }
            }
        } else {
            out.push(b[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount a tmpfs named `fsname` at `target`, creating it with mode derived
/// from `perm`.
pub fn mount_tmpfs(
    fsname: &str,
    target: &Path,
    flags: libc::c_ulong,
    size: usize,
    perm: u32,
) -> Result<(), Errno> {
    mkdir_all(target, parent_perm(perm)).map_err(|e| io_errno(&e))?;
    let fsname = CString::new(fsname).map_err(|_| Errno::INVAL)?;
    let opt = CString::new(tmpfs_options(size, perm)).map_err(|_| Errno::INVAL)?;
    mount(Some(&fsname), target, Some(c"tmpfs"), flags, Some(&opt))
}

/// tmpfs takes `mode` as bare octal digits.
fn tmpfs_options(size: usize, perm: u32) -> String {
    let mut opt = format!("mode={perm:o}");
    if size > 0 {
        opt.push_str(&format!(",size={size}"));
    }
    opt
}

pub(crate) fn io_errno(e: &std::io::Error) -> Errno {
    Errno::from_io_error(e).unwrap_or(Errno::IO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_to_cstring_valid() {
        let cstr = path_to_cstring(Path::new("/tmp/test")).unwrap();
        assert_eq!(cstr.as_bytes(), b"/tmp/test");
    }

    #[test]
    fn unescape() {
        assert_eq!(unescape_octal(r"/mnt/a\040b"), "/mnt/a b");
        assert_eq!(unescape_octal(r"/x\134y"), r"/x\y");
        assert_eq!(unescape_octal(r"/trailing\04"), r"/trailing\04");
        assert_eq!(unescape_octal(r"/x\377"), "/x\u{fffd}");
        assert_eq!(unescape_octal(r"/a\400b"), r"/a\400b");
        assert_eq!(unescape_octal(r"\777\040"), r"\777 ");
    }

    #[test]
    fn tmpfs_mode_is_bare_octal() {
        assert_eq!(tmpfs_options(0, 0o755), "mode=755");
        assert_eq!(tmpfs_options(0, 0o1777), "mode=1777");
        assert_eq!(tmpfs_options(1 << 20, 0o700), "mode=700,size=1048576");
        assert!(!tmpfs_options(8, 0o755).contains("0o"));
    }

    #[test]
    fn mountinfo_read_through_old_root() {
        assert_eq!(host_mountinfo(), PathBuf::from("/host/proc/self/mountinfo"));
    }

    #[test]
    fn submounts_below_target() {
        let info = b"\
22 1 0:21 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:22 / /proc rw,nosuid shared:2 - proc proc rw
24 22 0:23 / /sysroot/usr rw shared:3 - tmpfs tmpfs rw
25 24 0:24 / /sysroot/usr/lib rw shared:4 - tmpfs tmpfs rw
26 22 0:25 / /sysroot/usrx rw shared:5 - tmpfs tmpfs rw
27 22 0:26 / /sysroot/my\\040dir rw shared:6 - tmpfs tmpfs rw
";
        let got = submounts(info, Path::new("/sysroot"));
        assert_eq!(
            got,
            [
                PathBuf::from("/sysroot/usr"),
                PathBuf::from("/sysroot/usr/lib"),
                PathBuf::from("/sysroot/usrx"),
                PathBuf::from("/sysroot/my dir"),
            ]
        );
        let got = submounts(info, Path::new("/sysroot/usr"));
        assert_eq!(got, [PathBuf::from("/sysroot/usr/lib")]);
    }

    #[test]
    fn flags_of_proc() {
        let flags = mount_flags(Path::new("/proc")).unwrap();
        assert_ne!(flags & libc::MS_NOSUID, 0);
    }
}
