//! The contract between the selector and fd-owning objects, plus the
//! non-blocking fd I/O helpers shared by its implementors.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::buffer::{self, ChunkBuffer};
use crate::error::{last_errno, is_retryable_errno, Error, Result};
use crate::poller::SelectorEventData;
use crate::selector::Selector;

/// Sentinel for "no file descriptor".
pub const INVALID_FD: RawFd = -1;

/// An object driven by a [`Selector`]: it owns a file descriptor and
/// receives error/read/write notifications for it.
///
/// Each handler returns whether events should continue to be dispatched to
/// this object within the current loop step; handlers may close the object,
/// in which case the selector notices the invalid fd and stops. `close`
/// must be idempotent and must unregister the object from its selector
/// before closing the OS fd.
pub trait Selectable: Send + Sync {
    /// The back pointer slot managed by the selector during
    /// register/unregister.
    fn selector_handle(&self) -> &SelectorHandle;

    /// The fd should be read from.
    fn handle_read_event(&self, _event: SelectorEventData) -> bool {
        true
    }

    /// Data can be written out.
    fn handle_write_event(&self, _event: SelectorEventData) -> bool {
        true
    }

    /// An error condition occurred on the fd.
    fn handle_error_event(&self, _event: SelectorEventData) -> bool {
        true
    }

    /// The raw fd, or [`INVALID_FD`] once closed.
    fn get_fd(&self) -> RawFd;

    /// Closes this object and its fd.
    fn close(&self);
}

/// The back pointer from a selectable to the selector it is registered
/// with. Set on register, cleared on unregister; a selectable belongs to at
/// most one selector at a time.
#[derive(Default)]
pub struct SelectorHandle {
    selector: Mutex<Weak<Selector>>,
}

impl SelectorHandle {
    pub fn new() -> SelectorHandle {
        SelectorHandle::default()
    }

    /// The selector this object is currently registered with, if any.
    pub fn selector(&self) -> Option<Arc<Selector>> {
        self.selector.lock().unwrap().upgrade()
    }

    pub fn is_attached(&self) -> bool {
        self.selector().is_some()
    }

    pub fn is_attached_to(&self, selector: &Selector) -> bool {
        std::ptr::eq(self.selector.lock().unwrap().as_ptr(), selector)
    }

    pub(crate) fn attach(&self, selector: &Arc<Selector>) {
        *self.selector.lock().unwrap() = Arc::downgrade(selector);
    }

    pub(crate) fn detach(&self) {
        *self.selector.lock().unwrap() = Weak::new();
    }
}

/// Reads up to `buf.len()` bytes from `fd`. Would-block is reported as
/// `Ok(0)`; hard failures are translated errnos.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let cb = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if cb >= 0 {
        return Ok(cb as usize);
    }
    let errno = last_errno();
    if is_retryable_errno(errno) {
        return Ok(0);
    }
    Err(Error::from_errno(errno)
        .annotate(format!("reading {} bytes from file descriptor {fd}", buf.len())))
}

/// Writes `buf` to `fd`. Would-block is reported as `Ok(0)`.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let cb = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if cb >= 0 {
        return Ok(cb as usize);
    }
    let errno = last_errno();
    if is_retryable_errno(errno) {
        return Ok(0);
    }
    Err(Error::from_errno(errno)
        .annotate(format!("writing {} bytes to file descriptor {fd}", buf.len())))
}

/// Reads at most `len` bytes from `fd`, appending them to `buf` as one
/// chunk. Returns the number of bytes read.
pub fn read_to_buffer(fd: RawFd, buf: &mut ChunkBuffer, len: usize) -> Result<usize> {
    let mut scratch = vec![0u8; len];
    let cb = read_fd(fd, &mut scratch)?;
    if cb == 0 {
        return Ok(0);
    }
    scratch.truncate(cb);
    buf.append_bytes(Bytes::from(scratch));
    Ok(cb)
}

/// Writes the buffer's chunks to `fd` one at a time, bounded by the
/// optional byte cap. Returns the number of bytes written. Prefer
/// [`write_buffer_iovec`] for many small chunks.
pub fn write_buffer(fd: RawFd, buf: &ChunkBuffer, cap: Option<usize>) -> Result<usize> {
    let size_to_write = buffer::size_to_write(buf, cap);
    let mut written = 0usize;
    for mut chunk in buf.chunks() {
        if chunk.len() + written > size_to_write {
            chunk = &chunk[..size_to_write - written];
        }
        let cb = write_fd(fd, chunk).map_err(|e| e.annotate("writing buffer chunk"))?;
        written += cb;
        if written >= size_to_write || cb == 0 {
            break;
        }
    }
    Ok(written)
}

/// Scatter-gather write of the buffer's chunks to `fd`, bounded by the
/// optional byte cap. Returns the number of bytes written; would-block is
/// `Ok(0)`.
pub fn write_buffer_iovec(fd: RawFd, buf: &ChunkBuffer, cap: Option<usize>) -> Result<usize> {
    let size = buffer::size_to_write(buf, cap);
    if size == 0 {
        return Ok(0);
    }
    let (iovecs, _covered) = buffer::to_iovec(buf, size);
    let cb = unsafe { libc::writev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int) };
    if cb >= 0 {
        return Ok(cb as usize);
    }
    let errno = last_errno();
    if is_retryable_errno(errno) {
        return Ok(0);
    }
    Err(Error::from_errno(errno)
        .annotate(format!("writev of {size} bytes to file descriptor {fd}")))
}
