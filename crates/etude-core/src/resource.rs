// src/resource.rs
use crate::http::{Method, Request, Status};
use crate::mime::HTML_MIME;
use libc::c_void;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

const WORLD_READABLE: u32 = 0o004;
const ANY_EXECUTABLE: u32 = 0o111;

/// Read-only private mapping of a whole file. Unmapped exactly once, on drop.
pub struct FileMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is read-only and owned by this value alone.
unsafe impl Send for FileMapping {}
unsafe impl Sync for FileMapping {}

impl FileMapping {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        Self::map(&file, len)
    }

    /// Map the first `len` bytes of `file`. Zero-length mappings are not
    /// possible and are reported as `InvalidInput`.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
        // SAFETY: mapping a valid descriptor read-only; the result is
        // checked against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` points at `len` readable bytes until `drop`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region returned by mmap, once.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len);
        }
    }
}

impl std::fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMapping").field("len", &self.len).finish()
    }
}

/// What a request target resolved to on disk.
#[derive(Debug)]
pub enum Resource {
    /// Regular file with content, mapped into memory. `mime` follows the
    /// file actually served, not the request target.
    File { map: FileMapping, mime: &'static str },
    /// Regular file of length zero.
    EmptyFile,
    /// Executable handed to the gateway.
    Script(PathBuf),
}

/// Map `req` onto the file system below `doc_root`.
///
/// Errors carry the status to answer with.
pub fn resolve(doc_root: &Path, req: &Request) -> Result<Resource, Status> {
    let relative = Path::new(req.path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        debug!(path = %req.path, "rejecting path with parent segment");
        return Err(Status::Forbidden);
    }

    let mut full = doc_root.join(relative);
    let mut meta = stat(&full)?;
    let mut mime = req.mime;
    if meta.is_dir() {
        full.push("index.html");
        meta = stat(&full)?;
        mime = HTML_MIME;
    }

    let mode = meta.permissions().mode();
    if mode & WORLD_READABLE == 0 {
        return Err(Status::Forbidden);
    }

    if req.dynamic {
        if meta.is_file() && mode & ANY_EXECUTABLE != 0 {
            return Ok(Resource::Script(full));
        }
        if req.method == Method::Post {
            return Err(Status::BadRequest);
        }
    }

    if !meta.is_file() {
        return Err(Status::Forbidden);
    }
    if meta.size() == 0 {
        return Ok(Resource::EmptyFile);
    }

    let file = File::open(&full).map_err(|e| io_status(&full, e))?;
    FileMapping::map(&file, meta.size() as usize)
        .map(|map| Resource::File { map, mime })
        .map_err(|e| {
            debug!(path = %full.display(), error = %e, "mmap failed");
            Status::InternalError
        })
}

fn stat(path: &Path) -> Result<std::fs::Metadata, Status> {
    std::fs::metadata(path).map_err(|e| io_status(path, e))
}

fn io_status(path: &Path, err: io::Error) -> Status {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => Status::NotFound,
        io::ErrorKind::PermissionDenied => Status::Forbidden,
        _ => {
            debug!(path = %path.display(), error = %err, "stat failed");
            Status::InternalError
        }
    }
}
