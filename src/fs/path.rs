//! Paths and directories.

use core::mem;

use zerocopy::{AsBytes, FromBytes};

use crate::fs::inode::{InodeGuard, InodeRef, InodeType, ROOTINO};
use crate::fs::FileSystem;
use crate::param::ROOTDEV;
use crate::proc::KernelCtx;

/// Directory entries are fixed-size records of a dirent per file.
pub const DIRSIZ: usize = 14;

/// dirent size
pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct Dirent {
    /// Inum 0 marks a free slot.
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl Dirent {
    pub const fn zero() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }

    /// Fill in name. If name is shorter than DIRSIZ, a NUL character is
    /// appended as terminator.
    pub fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    /// Returns the slice which exactly contains the name, without NULs.
    pub fn get_name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        FileName::from_bytes(&self.name[..len])
    }
}

/// A path component.
///
/// Invariant: no NUL and no `/` characters, at most `DIRSIZ` bytes.
#[derive(PartialEq)]
#[repr(transparent)]
pub struct FileName {
    inner: [u8],
}

impl FileName {
    /// Truncates to the first DIRSIZ bytes.
    pub fn from_bytes(bytes: &[u8]) -> &Self {
        let bytes = &bytes[..bytes.len().min(DIRSIZ)];
        // SAFETY: `&FileName` is layout-compatible with `[u8]` because of
        // its attribute `#[repr(transparent)]`.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

#[repr(transparent)]
pub struct Path {
    inner: [u8],
}

impl Path {
    pub fn new(path: &str) -> &Self {
        Self::from_bytes(path.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of its
        // attribute `#[repr(transparent)]`.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Returns `Some((path, name))` where `name` is the next path element
    /// and `path` is the rest, with no leading slashes. The caller can
    /// check `path.is_empty_string()` to see if the name is the last one.
    /// If there is no name to remove, returns `None`.
    ///
    /// Examples:
    ///   skipelem("a/bb/c") = Some(("bb/c", "a"))
    ///   skipelem("///a//bb") = Some(("bb", "a"))
    ///   skipelem("a") = Some(("", "a"))
    ///   skipelem("") = skipelem("////") = None
    pub fn skipelem(&self) -> Option<(&Self, &FileName)> {
        let mut bytes = &self.inner;

        let name_start = bytes.iter().position(|ch| *ch != b'/')?;
        bytes = &bytes[name_start..];

        let len = bytes
            .iter()
            .position(|ch| *ch == b'/')
            .unwrap_or(bytes.len());

        let name = FileName::from_bytes(&bytes[..len]);

        bytes = &bytes[len..];

        let next_start = bytes
            .iter()
            .position(|ch| *ch != b'/')
            .unwrap_or(bytes.len());

        Some((Self::from_bytes(&bytes[next_start..]), name))
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }
}

impl FileSystem {
    /// Look for a directory entry in a directory.
    /// If found, return the entry's inode and the byte offset of the entry.
    pub fn dirlookup(
        &self,
        dp: &mut InodeGuard<'_>,
        name: &FileName,
    ) -> Result<(InodeRef, u32), ()> {
        assert_eq!(dp.typ, InodeType::Dir, "dirlookup not DIR");

        let mut de = Dirent::zero();
        let mut off = 0;
        while off < dp.size {
            let n = dp.readi(de.as_bytes_mut(), off).expect("dirlookup read");
            assert_eq!(n, DIRENT_SIZE, "dirlookup read");
            if de.inum != 0 && de.get_name() == name {
                // entry matches path element
                return Ok((self.iget(dp.dev, de.inum as u32), off));
            }
            off += DIRENT_SIZE as u32;
        }
        Err(())
    }

    /// Look up and return the inode for a path name, walking from the root
    /// directory. If `parent` is true, return the inode for the parent and
    /// the final path element.
    fn namex<'p>(
        &self,
        ctx: KernelCtx<'_>,
        path: &'p Path,
        parent: bool,
    ) -> Result<(InodeRef, Option<&'p FileName>), ()> {
        let mut ip = self.iget(ROOTDEV, ROOTINO);
        let mut rest = path;

        while let Some((next_path, name)) = rest.skipelem() {
            let mut dp = self.locki(ip, ctx);
            if dp.typ != InodeType::Dir {
                drop(dp);
                self.irelease(ip);
                return Err(());
            }

            // Stop one level early.
            if parent && next_path.is_empty_string() {
                drop(dp);
                return Ok((ip, Some(name)));
            }

            let next = match self.dirlookup(&mut dp, name) {
                Ok((next, _)) => next,
                Err(()) => {
                    drop(dp);
                    self.irelease(ip);
                    return Err(());
                }
            };
            drop(dp);
            self.irelease(ip);
            ip = next;
            rest = next_path;
        }

        if parent {
            self.irelease(ip);
            return Err(());
        }
        Ok((ip, None))
    }

    /// Look up the inode for a path name.
    pub fn namei(&self, ctx: KernelCtx<'_>, path: &Path) -> Result<InodeRef, ()> {
        self.namex(ctx, path, false).map(|(ip, _)| ip)
    }

    /// Look up the parent directory of a path name; also returns the final
    /// path element.
    pub fn nameiparent<'p>(
        &self,
        ctx: KernelCtx<'_>,
        path: &'p Path,
    ) -> Result<(InodeRef, &'p FileName), ()> {
        let (ip, name) = self.namex(ctx, path, true)?;
        Ok((ip, name.expect("nameiparent")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(p: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut rest = Path::new(p);
        while let Some((next, name)) = rest.skipelem() {
            out.push((
                String::from_utf8(next.as_bytes().to_vec()).unwrap(),
                String::from_utf8(name.as_bytes().to_vec()).unwrap(),
            ));
            rest = next;
        }
        out
    }

    #[test]
    fn skipelem_examples() {
        assert_eq!(
            parts("a/bb/c"),
            vec![
                ("bb/c".into(), "a".into()),
                ("c".into(), "bb".into()),
                ("".into(), "c".into())
            ]
        );
        assert_eq!(parts("///a//bb"), vec![
            ("bb".into(), "a".into()),
            ("".into(), "bb".into())
        ]);
        assert_eq!(parts(""), vec![]);
        assert_eq!(parts("////"), vec![]);
    }

    #[test]
    fn filename_truncates_to_dirsiz() {
        let name = FileName::from_bytes(b"averyverylongfilename");
        assert_eq!(name.as_bytes().len(), DIRSIZ);
    }

    #[test]
    fn dirent_name_round_trip() {
        let mut de = Dirent::zero();
        de.set_name(FileName::from_bytes(b"console"));
        assert_eq!(de.get_name().as_bytes(), b"console");
        de.set_name(FileName::from_bytes(b"exactly14chars"));
        assert_eq!(de.get_name().as_bytes(), b"exactly14chars");
    }
}
