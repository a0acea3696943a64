//! Listing a single directory into a sorted list of typed entries.
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::walker::Error;

/// The coarse type of a file, as far as the walk is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    Directory,
    Regular,
    Symlink,
    /// Devices, pipes and sockets.
    Other,
    /// The type could not be determined.
    ///
    /// Never produced by a successful listing. Passed for a root whose metadata query failed.
    Unknown,
}

/// One child of a listed directory.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// The directory this entry was listed from, shared by all its siblings.
    parent: Arc<Path>,
    /// The file name of this entry.
    name: OsString,
    file_type: FileType,
    /// The full path, allocated on first use.
    full_path: OnceCell<PathBuf>,
}

/// The entries of one directory, sorted by name.
///
/// Names are compared byte-wise and never repeat. The current and parent directory are never
/// part of the list.
#[derive(Debug, Clone, Default)]
pub struct EntryList {
    entries: Vec<DirEntry>,
}

/// Counts of the system calls issued by a reader.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    nr_close: usize,
    nr_getdent: usize,
    nr_open: usize,
    nr_read_dir: usize,
    nr_stat: usize,
}

/// Lists directories.
///
/// A listing is atomic: either all entries are returned or an error, never a truncated list.
/// Implementations must not follow symbolic links, neither for the entries nor for their types.
pub trait EntryReader {
    /// Read the immediate children of `dir`.
    fn read_dir(&mut self, dir: &Path) -> Result<EntryList, Error>;

    /// The system calls issued so far.
    fn stats(&self) -> &Stats;
}

/// The reader with the cheapest type information on this platform.
#[cfg(target_os = "linux")]
pub type DefaultReader = GetdentsReader;
/// The reader with the cheapest type information on this platform.
#[cfg(not(target_os = "linux"))]
pub type DefaultReader = StdReader;

/// Portable reader on top of `std::fs::read_dir`.
///
/// The standard library reports the type from the listing where the platform has it and
/// queries the metadata otherwise.
#[derive(Debug, Default)]
pub struct StdReader {
    stats: Stats,
}

#[cfg(target_os = "linux")]
pub use self::linux::GetdentsReader;

/// The default size of the `getdents64` buffer.
pub(crate) const DEFAULT_BUFFER: usize = 1 << 14;

/// Raise a buffer size to hold at least one record and cap it to what `getdents64` accepts.
#[cfg(target_os = "linux")]
pub(crate) fn clamp_buffer(size: usize) -> usize {
    use core::convert::TryFrom;
    let max = usize::try_from(libc::c_uint::MAX).unwrap_or(usize::MAX);
    size.max(crate::getdent::MIN_BUFFER).min(max)
}

/// Buffer sizes only matter for `getdents64`.
#[cfg(not(target_os = "linux"))]
pub(crate) fn clamp_buffer(size: usize) -> usize {
    size
}

impl FileType {
    pub fn is_dir(&self) -> bool {
        *self == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        *self == FileType::Regular
    }

    pub fn is_symlink(&self) -> bool {
        *self == FileType::Symlink
    }
}

impl From<fs::FileType> for FileType {
    fn from(meta: fs::FileType) -> Self {
        if meta.is_dir() {
            FileType::Directory
        } else if meta.is_file() {
            FileType::Regular
        } else if meta.is_symlink() {
            FileType::Symlink
        } else {
            FileType::Other
        }
    }
}

impl DirEntry {
    fn new(parent: Arc<Path>, name: OsString, file_type: FileType) -> Self {
        DirEntry {
            parent,
            name,
            file_type,
            full_path: OnceCell::new(),
        }
    }

    /// The directory that was listed.
    pub fn parent(&self) -> &Path {
        &self.parent
    }

    /// Return the filename of this entry.
    pub fn file_name(&self) -> &OsStr {
        &self.name
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Inspect the path of this entry.
    pub fn path(&self) -> &Path {
        self.full_path.get_or_init(|| self.parent.join(&self.name))
    }

    /// Convert the entry into a path
    ///
    /// Potentially more efficient than `path().to_owned()`.
    pub fn into_path(self) -> PathBuf {
        let DirEntry {
            parent,
            name,
            full_path,
            ..
        } = self;
        full_path.into_inner().unwrap_or_else(|| parent.join(name))
    }
}

impl EntryList {
    fn from_unsorted(mut entries: Vec<DirEntry>) -> Self {
        entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        debug_assert!(entries.windows(2).all(|w| w[0].name != w[1].name));
        EntryList { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DirEntry> {
        self.entries.iter()
    }
}

impl IntoIterator for EntryList {
    type Item = DirEntry;
    type IntoIter = std::vec::IntoIter<DirEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a EntryList {
    type Item = &'a DirEntry;
    type IntoIter = std::slice::Iter<'a, DirEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Stats {
    /// Directories opened for reading.
    pub fn opened(&self) -> usize {
        self.nr_open
    }

    /// Directory descriptors closed again.
    pub fn closed(&self) -> usize {
        self.nr_close
    }

    /// Calls to `getdents64`.
    pub fn getdents(&self) -> usize {
        self.nr_getdent
    }

    /// Complete listings through `std::fs::read_dir`.
    pub fn read_dirs(&self) -> usize {
        self.nr_read_dir
    }

    /// Metadata queries for entries whose type the listing did not report.
    pub fn stats(&self) -> usize {
        self.nr_stat
    }
}

impl StdReader {
    pub fn new() -> Self {
        StdReader::default()
    }
}

impl EntryReader for StdReader {
    fn read_dir(&mut self, dir: &Path) -> Result<EntryList, Error> {
        let list_err = |source| Error::List {
            path: dir.to_owned(),
            source,
        };

        self.stats.nr_read_dir += 1;
        let parent: Arc<Path> = Arc::from(dir);
        let mut entries = vec![];
        for entry in fs::read_dir(dir).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            let file_type = entry.file_type().map_err(|source| {
                debug!(dir = %dir.display(), name = ?entry.file_name(), %source, "file type query failed");
                Error::Stat {
                    path: entry.path(),
                    source,
                }
            })?;
            entries.push(DirEntry::new(
                parent.clone(),
                entry.file_name(),
                file_type.into(),
            ));
        }

        trace!(dir = %dir.display(), entries = entries.len(), "listed directory");
        Ok(EntryList::from_unsorted(entries))
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use core::mem;
    use std::ffi::{CString, OsStr};
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::sync::Arc;

    use tracing::{debug, trace};

    use super::{clamp_buffer, DirEntry, EntryList, EntryReader, FileType, Stats, DEFAULT_BUFFER};
    use crate::getdent::{DirentBuf, Entry, More};
    use crate::walker::Error;
    use crate::UnixFileType;

    /// Reads directories with `getdents64`, taking the entry types from the kernel records.
    ///
    /// Only records of type `DT_UNKNOWN`, which some file systems report for every entry, cost an
    /// additional `fstatat` each.
    pub struct GetdentsReader {
        /// The buffer for reading entries, reused for every directory.
        buffer: DirentBuf,
        stats: Stats,
    }

    struct DirFd(libc::c_int);

    impl GetdentsReader {
        pub fn new() -> Self {
            Self::with_buffer_size(DEFAULT_BUFFER)
        }

        /// Use a buffer of `size` bytes for each `getdents64` call.
        ///
        /// Sizes too small for a single record with a name of maximal length are raised to fit.
        pub fn with_buffer_size(size: usize) -> Self {
            GetdentsReader {
                buffer: DirentBuf::with_size(clamp_buffer(size)),
                stats: Stats::default(),
            }
        }

        fn typed(
            fd: &DirFd,
            entry: &Entry<'_>,
            stats: &mut Stats,
        ) -> io::Result<FileType> {
            if let Some(kind) = entry.file_type() {
                return Ok(kind.file_type());
            }

            stats.nr_stat += 1;
            let mode = fd.stat_at(entry.file_name_c())?;
            Ok(UnixFileType::from_mode(mode).map_or(FileType::Other, UnixFileType::file_type))
        }
    }

    impl Default for GetdentsReader {
        fn default() -> Self {
            GetdentsReader::new()
        }
    }

    impl EntryReader for GetdentsReader {
        fn read_dir(&mut self, dir: &Path) -> Result<EntryList, Error> {
            let fd = DirFd::open(dir).map_err(|source| {
                debug!(dir = %dir.display(), %source, "open of directory failed");
                Error::List {
                    path: dir.to_owned(),
                    source,
                }
            })?;
            self.stats.nr_open += 1;

            let listed = self.read_entries(&fd, dir);
            // Counted before the outcome is inspected, failed listings close their descriptor too.
            self.stats.nr_close += 1;
            let closed = fd.close();

            let entries = listed?;
            closed.map_err(|source| Error::List {
                path: dir.to_owned(),
                source,
            })?;
            trace!(dir = %dir.display(), entries = entries.len(), "listed directory");
            Ok(EntryList::from_unsorted(entries))
        }

        fn stats(&self) -> &Stats {
            &self.stats
        }
    }

    impl GetdentsReader {
        /// Drain all records of an open directory.
        fn read_entries(&mut self, fd: &DirFd, dir: &Path) -> Result<Vec<DirEntry>, Error> {
            let list_err = |source| Error::List {
                path: dir.to_owned(),
                source,
            };

            let parent: Arc<Path> = Arc::from(dir);
            let mut entries = vec![];

            loop {
                self.stats.nr_getdent += 1;
                match self.buffer.fill_buf(fd.0).map_err(list_err)? {
                    More::Done => break,
                    More::More => {}
                }

                for entry in self.buffer.iter() {
                    let entry = entry.map_err(|err| list_err(err.into()))?;
                    if entry.is_dot() {
                        continue;
                    }

                    let name = OsStr::from_bytes(entry.file_name());
                    let file_type = Self::typed(fd, &entry, &mut self.stats).map_err(|source| {
                        debug!(dir = %dir.display(), ?name, %source, "stat of untyped entry failed");
                        Error::Stat {
                            path: dir.join(name),
                            source,
                        }
                    })?;
                    entries.push(DirEntry::new(parent.clone(), name.to_owned(), file_type));
                }
            }

            Ok(entries)
        }
    }

    impl DirFd {
        fn open(path: &Path) -> io::Result<Self> {
            let raw_name = path.as_os_str().as_bytes().to_owned();
            let unix_name = CString::new(raw_name)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

            let result = unsafe {
                libc::open(
                    unix_name.as_c_str().as_ptr(),
                    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
                )
            };

            if result == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(DirFd(result))
        }

        /// Query the mode of a child without following it.
        fn stat_at(&self, name: &std::ffi::CStr) -> io::Result<libc::mode_t> {
            let mut stat: libc::stat = unsafe { mem::zeroed() };
            let result = unsafe {
                libc::fstatat(self.0, name.as_ptr(), &mut stat, libc::AT_SYMLINK_NOFOLLOW)
            };

            if result == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(stat.st_mode)
        }

        fn close(self) -> io::Result<()> {
            let fd = self.0;
            mem::forget(self);
            match unsafe { libc::close(fd) } {
                0 => Ok(()),
                _ => Err(io::Error::last_os_error()),
            }
        }
    }

    impl Drop for DirFd {
        fn drop(&mut self) {
            // Only reached on unwinding, `close` is called otherwise.
            let _ = unsafe { libc::close(self.0) };
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::getdent::{record, Entries};
        use std::fs;

        #[test]
        fn untyped_records_are_stated_once_without_following() {
            let temp = tempfile::tempdir().unwrap();
            fs::write(temp.path().join("file"), b"").unwrap();
            fs::create_dir(temp.path().join("dir")).unwrap();
            std::os::unix::fs::symlink("dir", temp.path().join("link")).unwrap();

            let fd = DirFd::open(temp.path()).unwrap();
            let mut stats = Stats::default();
            let expected = [
                ("file", FileType::Regular),
                ("dir", FileType::Directory),
                ("link", FileType::Symlink),
            ];

            for (i, &(name, file_type)) in expected.iter().enumerate() {
                let buf = record(name.as_bytes(), libc::DT_UNKNOWN);
                let entry = Entries::from_bytes(&buf).next().unwrap().ok().unwrap();
                assert_eq!(entry.file_type(), None);
                assert_eq!(GetdentsReader::typed(&fd, &entry, &mut stats).unwrap(), file_type);
                assert_eq!(stats.nr_stat, i + 1);
            }

            // A typed record costs no query, whatever its name.
            let buf = record(b"missing", libc::DT_REG);
            let entry = Entries::from_bytes(&buf).next().unwrap().ok().unwrap();
            assert_eq!(GetdentsReader::typed(&fd, &entry, &mut stats).unwrap(), FileType::Regular);
            assert_eq!(stats.nr_stat, expected.len());

            let buf = record(b"missing", libc::DT_UNKNOWN);
            let entry = Entries::from_bytes(&buf).next().unwrap().ok().unwrap();
            let err = GetdentsReader::typed(&fd, &entry, &mut stats).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::NotFound);
            assert_eq!(stats.nr_stat, expected.len() + 1);

            fd.close().unwrap();
        }

        #[test]
        fn every_opened_directory_is_closed() {
            let temp = tempfile::tempdir().unwrap();
            fs::create_dir(temp.path().join("dir")).unwrap();
            fs::write(temp.path().join("file"), b"").unwrap();

            let mut reader = GetdentsReader::new();
            reader.read_dir(temp.path()).unwrap();
            reader.read_dir(&temp.path().join("dir")).unwrap();
            assert!(reader.read_dir(&temp.path().join("file")).is_err());
            assert!(reader.read_dir(&temp.path().join("missing")).is_err());

            assert_eq!(reader.stats().opened(), 2);
            assert_eq!(reader.stats().closed(), 2);
            assert!(reader.stats().getdents() >= 4);
        }

        #[test]
        fn buffer_size_is_clamped() {
            assert_eq!(clamp_buffer(0), crate::getdent::MIN_BUFFER);
            assert_eq!(clamp_buffer(DEFAULT_BUFFER), DEFAULT_BUFFER);

            let temp = tempfile::tempdir().unwrap();
            fs::write(temp.path().join("file"), b"").unwrap();
            let mut reader = GetdentsReader::with_buffer_size(1);
            let list = reader.read_dir(temp.path()).unwrap();
            assert_eq!(list.len(), 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::Error;
    use std::fs;

    fn names(list: &EntryList) -> Vec<&OsStr> {
        list.iter().map(DirEntry::file_name).collect()
    }

    #[test]
    fn std_reader_sorts_and_types() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("b"), b"").unwrap();
        fs::create_dir(temp.path().join("a")).unwrap();
        fs::write(temp.path().join("C"), b"").unwrap();

        let list = StdReader::new().read_dir(temp.path()).unwrap();
        assert_eq!(names(&list), ["C", "a", "b"]);
        let types: Vec<_> = list.iter().map(DirEntry::file_type).collect();
        assert_eq!(
            types,
            [FileType::Regular, FileType::Directory, FileType::Regular]
        );
        assert_eq!(list.iter().nth(1).unwrap().path(), temp.path().join("a"));

        let dir = list.iter().nth(1).unwrap();
        assert!(dir.file_type().is_dir());
        assert!(!dir.file_type().is_file());
        assert_eq!(dir.parent(), temp.path());
        let file = list.iter().next().unwrap();
        assert!(file.file_type().is_file());
        assert!(!file.file_type().is_symlink());
        assert!(list.iter().all(|entry| entry.parent() == temp.path()));
    }

    #[test]
    fn missing_directory_is_a_list_error() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("missing");
        match StdReader::new().read_dir(&missing) {
            Err(Error::List { path, source }) => {
                assert_eq!(path, missing);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn getdents_reader_skips_dots_and_closes() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("file"), b"").unwrap();
        std::os::unix::fs::symlink("file", temp.path().join("link")).unwrap();

        let mut reader = GetdentsReader::new();
        let list = reader.read_dir(temp.path()).unwrap();
        assert_eq!(names(&list), ["file", "link"]);
        assert!(list.iter().nth(1).unwrap().file_type().is_symlink());
        assert_eq!(list.iter().nth(1).unwrap().file_type(), FileType::Symlink);
        assert_eq!(reader.stats().opened(), 1);
        assert_eq!(reader.stats().closed(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn getdents_reader_not_a_directory() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, b"").unwrap();

        match GetdentsReader::new().read_dir(&file) {
            Err(Error::List { source, .. }) => {
                assert_eq!(source.raw_os_error(), Some(libc::ENOTDIR));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
