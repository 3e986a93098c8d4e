//! Descriptors backed by the host filesystem.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirEntryExt, FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use log::*;
use nix::errno::Errno;

use crate::host::descriptor::FileMode;

bitflags::bitflags! {
    /// Open flags of the cage ABI (numerically the common Linux values).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const DIRECTORY = 0o200000;
    }
}

/// Seek origins of the cage ABI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

impl TryFrom<i32> for SeekWhence {
    type Error = Errno;

    fn try_from(v: i32) -> Result<Self, Errno> {
        match v {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// The stat record returned to cages.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct AbiStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i32,
    pub blocks: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl AbiStat {
    fn from_metadata(md: &fs::Metadata) -> Self {
        AbiStat {
            dev: md.dev(),
            ino: md.ino(),
            mode: md.mode(),
            nlink: md.nlink() as u32,
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev(),
            size: md.size() as i64,
            blksize: md.blksize() as i32,
            blocks: md.blocks() as i64,
            atime: md.atime(),
            mtime: md.mtime(),
            ctime: md.ctime(),
        }
    }
}

/// One packed directory record produced by getdents.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct AbiDirentHeader {
    ino: u64,
    off: u64,
    reclen: u16,
}

const DIRENT_HEADER_LEN: usize = std::mem::size_of::<AbiDirentHeader>();

enum IoKind {
    Regular(fs::File),
    // a snapshot taken at open, consumed record-at-a-time by getdents
    Directory { entries: Vec<(u64, String)>, pos: usize },
}

/// A host file or directory stream opened on behalf of a cage.
pub struct HostIoFile {
    kind: IoKind,
    mode: FileMode,
    path: PathBuf,
}

impl std::fmt::Debug for HostIoFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostIoFile({:?}, mode: {:?})", self.path, self.mode)
    }
}

fn errno_from_io(e: std::io::Error) -> Errno {
    match e.raw_os_error() {
        Some(raw) => Errno::from_i32(raw),
        None => Errno::EIO,
    }
}

impl HostIoFile {
    /// Open `path` on the host. ACL checks happen in the broker, not here.
    pub fn open(path: &Path, flags: OpenFlags, mode: u32) -> Result<Self, Errno> {
        let file_mode = match (
            flags.contains(OpenFlags::WRONLY),
            flags.contains(OpenFlags::RDWR),
        ) {
            (false, false) => FileMode::READ,
            (true, false) => FileMode::WRITE,
            (_, true) => FileMode::READ | FileMode::WRITE,
        };

        let md = fs::metadata(path);
        let is_dir = md.as_ref().map(|m| m.is_dir()).unwrap_or(false);
        if is_dir || flags.contains(OpenFlags::DIRECTORY) {
            if !is_dir {
                return Err(Errno::ENOTDIR);
            }
            if file_mode.contains(FileMode::WRITE) {
                return Err(Errno::EISDIR);
            }
            let mut entries = vec![(md.unwrap().ino(), ".".to_string()), (0, "..".to_string())];
            for ent in fs::read_dir(path).map_err(errno_from_io)? {
                let ent = ent.map_err(errno_from_io)?;
                let name = ent.file_name().to_string_lossy().into_owned();
                entries.push((ent.ino(), name));
            }
            debug!("opened directory {:?} with {} entries", path, entries.len());
            return Ok(Self {
                kind: IoKind::Directory { entries, pos: 0 },
                mode: file_mode,
                path: path.to_path_buf(),
            });
        }

        let mut options = fs::OpenOptions::new();
        options
            .read(file_mode.contains(FileMode::READ))
            .write(file_mode.contains(FileMode::WRITE))
            .create(flags.contains(OpenFlags::CREAT))
            .create_new(flags.contains(OpenFlags::CREAT | OpenFlags::EXCL))
            .truncate(flags.contains(OpenFlags::TRUNC) && file_mode.contains(FileMode::WRITE))
            .append(flags.contains(OpenFlags::APPEND))
            .mode(mode);
        let file = options.open(path).map_err(errno_from_io)?;
        Ok(Self {
            kind: IoKind::Regular(file),
            mode: file_mode,
            path: path.to_path_buf(),
        })
    }

    pub fn from_std(file: fs::File, mode: FileMode, path: PathBuf) -> Self {
        Self {
            kind: IoKind::Regular(file),
            mode,
            path,
        }
    }

    pub fn is_regular(&self) -> bool {
        matches!(self.kind, IoKind::Regular(_))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        if !self.mode.contains(FileMode::READ) {
            return Err(Errno::EBADF);
        }
        match &mut self.kind {
            IoKind::Regular(f) => f.read(buf).map_err(errno_from_io),
            IoKind::Directory { .. } => Err(Errno::EISDIR),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Errno> {
        if !self.mode.contains(FileMode::WRITE) {
            return Err(Errno::EBADF);
        }
        match &mut self.kind {
            IoKind::Regular(f) => f.write(buf).map_err(errno_from_io),
            IoKind::Directory { .. } => Err(Errno::EISDIR),
        }
    }

    pub fn seek(&mut self, offset: i64, whence: SeekWhence) -> Result<i64, Errno> {
        match &mut self.kind {
            IoKind::Regular(f) => {
                let pos = match whence {
                    SeekWhence::Set => {
                        SeekFrom::Start(u64::try_from(offset).map_err(|_| Errno::EINVAL)?)
                    }
                    SeekWhence::Cur => SeekFrom::Current(offset),
                    SeekWhence::End => SeekFrom::End(offset),
                };
                let new_pos = f.seek(pos).map_err(errno_from_io)?;
                Ok(new_pos as i64)
            }
            // rewinding a directory stream is the only seek it supports
            IoKind::Directory { pos, .. } => {
                if offset == 0 && whence == SeekWhence::Set {
                    *pos = 0;
                    Ok(0)
                } else {
                    Err(Errno::EINVAL)
                }
            }
        }
    }

    pub fn stat(&self) -> Result<AbiStat, Errno> {
        match &self.kind {
            IoKind::Regular(f) => {
                let md = f.metadata().map_err(errno_from_io)?;
                Ok(AbiStat::from_metadata(&md))
            }
            IoKind::Directory { .. } => {
                let md = fs::metadata(&self.path).map_err(errno_from_io)?;
                Ok(AbiStat::from_metadata(&md))
            }
        }
    }

    pub fn pread_all(&self, buf: &mut [u8], offset: i64) -> Result<usize, Errno> {
        let IoKind::Regular(f) = &self.kind else {
            return Err(Errno::EISDIR);
        };
        let offset = u64::try_from(offset).map_err(|_| Errno::EINVAL)?;
        let mut done = 0;
        while done < buf.len() {
            let n = f
                .read_at(&mut buf[done..], offset + done as u64)
                .map_err(errno_from_io)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    pub fn ioctl(&mut self, request: u64) -> Result<i32, Errno> {
        // no device requests are forwarded to the host
        debug!("ioctl request {:#x} on {:?} not supported", request, self.path);
        Err(Errno::EINVAL)
    }

    /// Fill `buf` with packed dirent records, advancing the stream. Returns
    /// the number of bytes produced; 0 means end of stream.
    pub fn getdents(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        let IoKind::Directory { entries, pos } = &mut self.kind else {
            return Err(Errno::ENOTDIR);
        };
        let mut out = 0;
        while *pos < entries.len() {
            let (ino, name) = &entries[*pos];
            let reclen = crate::utility::round_up_pow2(DIRENT_HEADER_LEN + name.len() + 1, 8);
            if out + reclen > buf.len() {
                if out == 0 {
                    return Err(Errno::EINVAL);
                }
                break;
            }
            let header = AbiDirentHeader {
                ino: *ino,
                off: (*pos + 1) as u64,
                reclen: reclen as u16,
            };
            // Safety: AbiDirentHeader is repr(C) and fits in the checked range.
            unsafe {
                std::ptr::write_unaligned(
                    buf[out..].as_mut_ptr() as *mut AbiDirentHeader,
                    header,
                );
            }
            buf[out + DIRENT_HEADER_LEN..out + DIRENT_HEADER_LEN + name.len()]
                .copy_from_slice(name.as_bytes());
            buf[out + DIRENT_HEADER_LEN + name.len()] = 0;
            out += reclen;
            *pos += 1;
        }
        Ok(out)
    }
}

/// stat() by path, for the path-based syscall.
pub fn stat_path(path: &Path) -> Result<AbiStat, Errno> {
    let md = fs::metadata(path).map_err(errno_from_io)?;
    Ok(AbiStat::from_metadata(&md))
}
