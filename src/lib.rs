//! Walk directory trees, deriving each entry's type from the directory listing.
//!
//! On Linux the entries are read with `getdents64` which reports a type tag for every record.
//! Only records tagged `DT_UNKNOWN` cost an additional `fstatat`. Other platforms use the
//! listing of `std::fs::read_dir`.
//!
//! ```no_run
//! use sprint_walk::{FileType, VisitResult, WalkDir};
//!
//! let mut files = 0;
//! WalkDir::new("/usr/share").walk(|_path, file_type| {
//!     if file_type == FileType::Regular {
//!         files += 1;
//!     }
//!     VisitResult::Continue
//! })?;
//! # Ok::<_, sprint_walk::Error>(())
//! ```
#[cfg(target_os = "linux")]
mod getdent;
mod read_dir;
mod walker;

#[cfg(target_os = "linux")]
pub use read_dir::GetdentsReader;
pub use read_dir::{DefaultReader, DirEntry, EntryList, EntryReader, FileType, Stats, StdReader};
pub use walker::{walk, Cause, Error, VisitResult, WalkDir};

/// The file type as the kernel reports it in a directory record or a `stat` mode.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) enum UnixFileType {
    BlockDevice = 1,
    CharDevice,
    Directory,
    NamedPipe,
    SymbolicLink,
    File,
    UnixSocket,
}

#[cfg(unix)]
impl UnixFileType {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn new(kind: libc::c_uchar) -> Option<Self> {
        match kind {
            libc::DT_BLK => Some(Self::BlockDevice),
            libc::DT_CHR => Some(Self::CharDevice),
            libc::DT_DIR => Some(Self::Directory),
            libc::DT_FIFO => Some(Self::NamedPipe),
            libc::DT_LNK => Some(Self::SymbolicLink),
            libc::DT_REG => Some(Self::File),
            libc::DT_SOCK => Some(Self::UnixSocket),
            // Actually, we'd expect DT_UNKNOWN but this doesn't hurt.
            _ => None,
        }
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn from_mode(mode: libc::mode_t) -> Option<Self> {
        match mode & libc::S_IFMT {
            libc::S_IFBLK => Some(Self::BlockDevice),
            libc::S_IFCHR => Some(Self::CharDevice),
            libc::S_IFDIR => Some(Self::Directory),
            libc::S_IFIFO => Some(Self::NamedPipe),
            libc::S_IFLNK => Some(Self::SymbolicLink),
            libc::S_IFREG => Some(Self::File),
            libc::S_IFSOCK => Some(Self::UnixSocket),
            _ => None,
        }
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn file_type(self) -> FileType {
        match self {
            UnixFileType::Directory => FileType::Directory,
            UnixFileType::File => FileType::Regular,
            UnixFileType::SymbolicLink => FileType::Symlink,
            UnixFileType::BlockDevice
            | UnixFileType::CharDevice
            | UnixFileType::NamedPipe
            | UnixFileType::UnixSocket => FileType::Other,
        }
    }
}
