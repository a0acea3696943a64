use bytemuck::{Pod, Zeroable};
use core::convert::TryFrom;
use core::mem;
use index_ext::Int;
use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;

use crate::UnixFileType;

/// A buffer for collecting results of `getdents64`.
pub struct DirentBuf {
    inner: Box<[u8]>,
    /// The number of bytes the kernel wrote on the last call.
    filled: usize,
}

/// A reference to a single entry.
pub struct Entry<'buf> {
    head: dirent64,
    /// The name, including its terminating null byte.
    name: &'buf CStr,
}

/// A consistency error of the result buffer.
#[derive(Debug)]
pub enum DirentErr {
    TooShort,
    InvalidOffset,
    InvalidLength,
    MissingNul,
}

/// Whether another call to `getdents64` may yield more entries.
#[derive(Debug, PartialEq)]
pub enum More {
    More,
    Done,
}

pub struct Entries<'a> {
    remaining: &'a [u8],
}

/// This is just an ffi descriptor type.
#[allow(non_snake_case, non_camel_case_types)]
// FFI type
// Be careful that this struct is actually zeroable and a Pod. In particular we want to avoid
// having any padding bytes.
#[repr(packed)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct dirent64 {
    /// The inode associated with the entry.
    d_ino: u64,
    /// The offset to the next entry, for seeking.
    d_off: i64,
    /// The length of the record, including the name and its padding.
    d_reclen: libc::c_ushort,
    /// The type indicated by the kernel, or unknown.
    d_type: libc::c_uchar,
    /// var length name, but we also have an array of such structs.
    d_name: [libc::c_char; 0],
}

// SAFETY: no padding due to packed.
unsafe impl Zeroable for dirent64 {}
unsafe impl Pod for dirent64 {}

/// The smallest buffer that is guaranteed to fit one record with a maximal name.
pub const MIN_BUFFER: usize = (mem::size_of::<dirent64>() + 256 + 7) / 8 * 8;

impl DirentBuf {
    pub fn with_size(length: usize) -> Self {
        assert!(length >= MIN_BUFFER, "Buffer can not hold a single entry.");
        libc::c_uint::try_from(length).expect("Buffer size invalid for `getdent` syscall.");

        DirentBuf {
            inner: vec![0; length].into(),
            filled: 0,
        }
    }

    /// Replace the content with the next batch of records of the directory.
    pub fn fill_buf(&mut self, fd: RawFd) -> io::Result<More> {
        self.filled = 0;
        let length = libc::c_uint::try_from(self.inner.len())
            .expect("Invalid buffer length should have been checked");
        let result = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                self.inner.as_mut_ptr() as *mut libc::c_void,
                length,
            )
        };

        match result {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(More::Done),
            n => {
                self.filled = usize::try_from(n)
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
                Ok(More::More)
            }
        }
    }

    /// Iterate the records written by the last fill.
    pub fn iter(&self) -> Entries<'_> {
        Entries::from_bytes(&self.inner[..self.filled])
    }
}

impl<'buf> Entry<'buf> {
    fn from_start(buf: &'buf [u8]) -> Result<(Self, &'buf [u8]), DirentErr> {
        let speculate = buf
            .get(..mem::size_of::<dirent64>())
            .ok_or(DirentErr::TooShort)?;
        let head: dirent64 = *bytemuck::from_bytes(speculate);
        let dirent64 { d_reclen, .. } = head;

        let spec_entry = buf.get_int(..d_reclen).ok_or(DirentErr::InvalidLength)?;
        let tail = buf.get_int(d_reclen..).ok_or(DirentErr::InvalidLength)?;

        // The record must at least contain its own header.
        let name_and_pad = spec_entry
            .get(mem::size_of::<dirent64>()..)
            .ok_or(DirentErr::InvalidOffset)?;
        // The name is null terminated, followed by padding up to the record length.
        let nul = name_and_pad
            .iter()
            .position(|&b| b == 0)
            .ok_or(DirentErr::MissingNul)?;
        let name = CStr::from_bytes_with_nul(&name_and_pad[..=nul])
            .map_err(|_| DirentErr::MissingNul)?;

        Ok((Entry { head, name }, tail))
    }

    pub fn file_name(&self) -> &'buf [u8] {
        self.name.to_bytes()
    }

    /// The name as a C string, usable for `*at` calls relative to the directory.
    pub fn file_name_c(&self) -> &'buf CStr {
        self.name
    }

    pub(crate) fn file_type(&self) -> Option<UnixFileType> {
        let dirent64 { d_type, .. } = self.head;
        UnixFileType::new(d_type)
    }

    /// The current or parent directory entry.
    pub fn is_dot(&self) -> bool {
        matches!(self.file_name(), b"." | b"..")
    }
}

impl<'a> Entries<'a> {
    /// Iterate the records in a buffer as filled by `getdents64`.
    pub fn from_bytes(remaining: &'a [u8]) -> Self {
        Entries { remaining }
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<Entry<'a>, DirentErr>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        match Entry::from_start(self.remaining) {
            Ok((entry, remaining)) => {
                self.remaining = remaining;
                Some(Ok(entry))
            }
            Err(err) => {
                self.remaining = <&'_ [u8]>::default();
                Some(Err(err))
            }
        }
    }
}

impl From<DirentErr> for io::Error {
    fn from(err: DirentErr) -> Self {
        let msg = match err {
            DirentErr::TooShort => "directory record shorter than its header",
            DirentErr::InvalidOffset => "directory record length below header size",
            DirentErr::InvalidLength => "directory record length exceeds buffer",
            DirentErr::MissingNul => "directory record name is not terminated",
        };
        io::Error::new(io::ErrorKind::InvalidData, msg)
    }
}

/// Encode a single record the way the kernel lays it out.
#[cfg(test)]
pub(crate) fn record(name: &[u8], kind: u8) -> Vec<u8> {
    let header = mem::size_of::<dirent64>();
    let reclen = (header + name.len() + 1 + 7) / 8 * 8;
    let head = dirent64 {
        d_ino: 1,
        d_off: 0,
        d_reclen: reclen as u16,
        d_type: kind,
        d_name: [],
    };
    let mut rec = bytemuck::bytes_of(&head).to_vec();
    rec.extend_from_slice(name);
    rec.resize(reclen, 0);
    rec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_consecutive_records() {
        let mut buf = record(b".", libc::DT_DIR);
        buf.extend(record(b"file", libc::DT_REG));
        buf.extend(record(b"link", libc::DT_UNKNOWN));

        let entries: Vec<_> = Entries::from_bytes(&buf)
            .map(|e| e.ok().unwrap())
            .collect();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_dot());
        assert_eq!(entries[1].file_name(), b"file");
        assert_eq!(entries[1].file_type(), Some(UnixFileType::File));
        assert_eq!(entries[2].file_type(), None);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut buf = record(b"file", libc::DT_REG);
        buf.truncate(buf.len() - 4);
        let mut entries = Entries::from_bytes(&buf);
        assert!(matches!(entries.next(), Some(Err(DirentErr::InvalidLength))));
        assert!(entries.next().is_none());
    }
}
