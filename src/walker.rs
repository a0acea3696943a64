use std::error::Error as StdError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[cfg(target_os = "linux")]
use crate::read_dir::GetdentsReader;
use crate::read_dir::{clamp_buffer, DirEntry, EntryReader, FileType, StdReader, DEFAULT_BUFFER};

/// The reason a visitor gave for aborting the walk.
pub type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// Configure walking over all files in a directory tree.
///
/// Every walk is self-contained: it owns its reader and buffers, and nothing is shared with other
/// walks running at the same time.
#[derive(Clone, Debug)]
pub struct WalkDir {
    /// The user supplied configuration.
    config: Configuration,
    path: PathBuf,
}

/// What the walk should do after a visit.
#[derive(Debug)]
pub enum VisitResult {
    /// Nothing special.
    Continue,
    /// Do not descend into the visited directory.
    ///
    /// Same as `Continue` for anything that is not a directory.
    SkipSubtree,
    /// Do not visit the remaining entries of the directory containing the visited path.
    ///
    /// Directories visited before have already been walked completely. A directory answering
    /// this is still descended into before its siblings are skipped.
    SkipSiblings,
    /// Descend into the visited symbolic link as if it were a directory.
    ///
    /// The path is then visited a second time, as a `Directory`. Same as `Continue` for anything
    /// that is not a symbolic link.
    TraverseSymlink,
    /// Stop the walk; it returns [`Error::Abort`] with this cause.
    Abort(Cause),
}

/// An error terminating a walk.
#[derive(Debug, Error)]
pub enum Error {
    /// A directory could not be opened or enumerated.
    #[error("could not list directory {}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The type of an entry was neither in the listing nor could it be queried.
    #[error("could not determine the file type of {}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The visitor stopped the walk.
    #[error("walk aborted by visitor: {0}")]
    Abort(#[source] Cause),
}

#[derive(Copy, Clone, Debug)]
struct Configuration {
    buffer_size: usize,
    portable: bool,
}

/// The state of one running walk.
struct Walk<'r, R: ?Sized, F> {
    reader: &'r mut R,
    visitor: F,
}

/// How the loop over the enclosing directory continues.
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    SkipSiblings,
}

/// A listed directory whose entries are being walked.
struct Level {
    entries: std::vec::IntoIter<DirEntry>,
    /// What the directory's own visit asked of its siblings, applied once it is done.
    flow: Flow,
}

/// The outcome of dispatching one path.
enum Step {
    /// A directory was listed and its entries are to be walked next.
    Descend(Level),
    Done(Flow),
}

/// Walk the tree at `root` with the default configuration.
///
/// See [`WalkDir::walk`].
pub fn walk<F>(root: impl AsRef<Path>, visitor: F) -> Result<(), Error>
where
    F: FnMut(&Path, FileType) -> VisitResult,
{
    WalkDir::new(root).walk(visitor)
}

// Public interfaces.

impl WalkDir {
    pub fn new(path: impl AsRef<Path>) -> Self {
        WalkDir {
            config: Configuration::default(),
            path: path.as_ref().to_owned(),
        }
    }

    /// The size of the buffer for each `getdents64` call.
    ///
    /// Only used by the Linux reader. Sizes too small for a single record with a name of maximal
    /// length are raised to fit.
    pub fn buffer_size(mut self, n: usize) -> Self {
        self.config.buffer_size = clamp_buffer(n);
        self
    }

    /// Use the listing of the standard library even where a faster reader is available.
    pub fn portable(mut self, yes: bool) -> Self {
        self.config.portable = yes;
        self
    }

    /// The root of the walk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk the tree, calling `visitor` for the root and each path below it.
    ///
    /// Directories are visited before their contents and the entries of each directory in
    /// byte-wise order of their names. Symbolic links are never followed unless the visitor
    /// answers [`VisitResult::TraverseSymlink`].
    ///
    /// If the root itself can not be queried, the visitor is called once with
    /// [`FileType::Unknown`]. The walk then succeeds unless the visitor aborts.
    pub fn walk<F>(&self, visitor: F) -> Result<(), Error>
    where
        F: FnMut(&Path, FileType) -> VisitResult,
    {
        #[cfg(target_os = "linux")]
        {
            if !self.config.portable {
                let mut reader = GetdentsReader::with_buffer_size(self.config.buffer_size);
                return self.walk_with(&mut reader, visitor);
            }
        }

        self.walk_with(&mut StdReader::new(), visitor)
    }

    /// Walk the tree, listing directories with the given reader.
    pub fn walk_with<R, F>(&self, reader: &mut R, visitor: F) -> Result<(), Error>
    where
        R: EntryReader + ?Sized,
        F: FnMut(&Path, FileType) -> VisitResult,
    {
        let mut walk = Walk { reader, visitor };
        let root = self.path.as_path();

        let file_type = match fs::symlink_metadata(root) {
            Ok(meta) => FileType::from(meta.file_type()),
            Err(err) => {
                debug!(root = %root.display(), %err, "metadata of root unavailable");
                return match walk.visit(root, FileType::Unknown) {
                    VisitResult::Abort(cause) => Err(abort(root, cause)),
                    _ => Ok(()),
                };
            }
        };

        walk.run(root, file_type)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            buffer_size: DEFAULT_BUFFER,
            portable: false,
        }
    }
}

impl VisitResult {
    /// Abort the walk with an error or message.
    pub fn abort(cause: impl Into<Cause>) -> Self {
        VisitResult::Abort(cause.into())
    }
}

impl Error {
    /// The path at which the walk failed, unless the visitor aborted.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Error::List { path, .. } | Error::Stat { path, .. } => Some(path),
            Error::Abort(_) => None,
        }
    }

    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Error::List { source, .. } | Error::Stat { source, .. } => Some(source),
            Error::Abort(_) => None,
        }
    }

    pub fn into_io_error(self) -> Option<io::Error> {
        match self {
            Error::List { source, .. } | Error::Stat { source, .. } => Some(source),
            Error::Abort(_) => None,
        }
    }

    /// The cause the visitor aborted with.
    pub fn into_abort(self) -> Option<Cause> {
        match self {
            Error::Abort(cause) => Some(cause),
            _ => None,
        }
    }
}

// Private implementation items.

impl<R, F> Walk<'_, R, F>
where
    R: EntryReader + ?Sized,
    F: FnMut(&Path, FileType) -> VisitResult,
{
    fn visit(&mut self, path: &Path, file_type: FileType) -> VisitResult {
        (self.visitor)(path, file_type)
    }

    /// Walk the tree below `root` depth-first, keeping the open directories on the heap.
    fn run(&mut self, root: &Path, file_type: FileType) -> Result<(), Error> {
        let mut stack = vec![];
        if let Step::Descend(level) = self.dispatch(root, file_type)? {
            stack.push(level);
        }

        while let Some(top) = stack.last_mut() {
            let entry = match top.entries.next() {
                Some(entry) => entry,
                None => {
                    // All children done, the directory's own answer now applies to its siblings.
                    if let Some(Level { flow: Flow::SkipSiblings, .. }) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            parent.skip_rest();
                        }
                    }
                    continue;
                }
            };

            let file_type = entry.file_type();
            let child = entry.into_path();
            match self.dispatch(&child, file_type)? {
                Step::Descend(level) => stack.push(level),
                Step::Done(Flow::SkipSiblings) => top.skip_rest(),
                Step::Done(Flow::Continue) => {}
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, path: &Path, file_type: FileType) -> Result<Step, Error> {
        match file_type {
            FileType::Directory => self.directory(path),
            other => self.leaf(path, other),
        }
    }

    /// Visit anything that is not a directory.
    fn leaf(&mut self, path: &Path, file_type: FileType) -> Result<Step, Error> {
        match self.visit(path, file_type) {
            VisitResult::Abort(cause) => Err(abort(path, cause)),
            VisitResult::SkipSiblings => Ok(Step::Done(Flow::SkipSiblings)),
            VisitResult::TraverseSymlink if file_type == FileType::Symlink => {
                self.directory(path)
            }
            VisitResult::Continue | VisitResult::SkipSubtree | VisitResult::TraverseSymlink => {
                Ok(Step::Done(Flow::Continue))
            }
        }
    }

    /// Visit a directory, then list its entries.
    fn directory(&mut self, path: &Path) -> Result<Step, Error> {
        let flow = match self.visit(path, FileType::Directory) {
            VisitResult::Abort(cause) => return Err(abort(path, cause)),
            VisitResult::SkipSubtree => return Ok(Step::Done(Flow::Continue)),
            VisitResult::SkipSiblings => Flow::SkipSiblings,
            VisitResult::Continue | VisitResult::TraverseSymlink => Flow::Continue,
        };

        let entries = self.reader.read_dir(path).map_err(|err| {
            debug!(dir = %path.display(), %err, "walk of subtree failed");
            err
        })?;

        Ok(Step::Descend(Level {
            entries: entries.into_iter(),
            flow,
        }))
    }
}

impl Level {
    fn skip_rest(&mut self) {
        self.entries = Vec::new().into_iter();
    }
}

fn abort(path: &Path, cause: Cause) -> Error {
    debug!(path = %path.display(), %cause, "visitor aborted the walk");
    Error::Abort(cause)
}
