//! Readiness-polling backends.
//!
//! Two interchangeable multiplexers behind the [`Poller`] trait: an
//! edge-oriented epoll backend and a portable poll backend. Registrations
//! are keyed by fd; the fd doubles as the event token handed back in
//! [`SelectorEventData`]. Both backends register the selector's wake fd with
//! read|error desires at construction, so a cross-thread wakeup surfaces as
//! an ordinary readiness event carrying the wake token.

use std::collections::HashMap;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};

/// Desire bit: readiness for reading.
pub const WANT_READ: u32 = 0x1;
/// Desire bit: readiness for writing.
pub const WANT_WRITE: u32 = 0x2;
/// Desire bit: error conditions.
pub const WANT_ERROR: u32 = 0x4;
/// Read and error are on by default for every registered fd.
pub const DEFAULT_DESIRES: u32 = WANT_READ | WANT_ERROR;

/// The poll backend keeps a dense fd array capped at this many entries.
pub const MAX_POLL_FDS: usize = 4096;

/// One readiness event: the registered fd it fired for, the normalized
/// desire mask, and the backend-specific raw event bits.
#[derive(Debug, Clone, Copy)]
pub struct SelectorEventData {
    pub token: RawFd,
    pub desires: u32,
    pub raw: u32,
}

/// OS readiness multiplexer. All calls happen on the selector loop thread
/// (or before the loop starts).
pub trait Poller: Send {
    /// Registers an fd once with the given desire mask.
    fn add(&mut self, fd: RawFd, desires: u32) -> Result<()>;
    /// Replaces the desire mask of a registered fd.
    fn update(&mut self, fd: RawFd, desires: u32) -> Result<()>;
    /// Removes an fd.
    fn delete(&mut self, fd: RawFd) -> Result<()>;
    /// Blocks up to `timeout` and returns the ready events.
    fn step(&mut self, timeout: Duration) -> Result<Vec<SelectorEventData>>;

    fn is_hang_up_event(&self, raw: u32) -> bool;
    fn is_remote_hang_up_event(&self, raw: u32) -> bool;
    fn is_any_hang_up_event(&self, raw: u32) -> bool;
    fn is_error_event(&self, raw: u32) -> bool;
    fn is_input_event(&self, raw: u32) -> bool;
}

/// Millisecond timeout for epoll_wait / poll. Zero stays zero; any other
/// value is at least 1ms so short waits do not become busy spins.
fn timeout_millis(timeout: Duration) -> libc::c_int {
    if timeout.is_zero() {
        return 0;
    }
    timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int
}

// ── epoll backend ───────────────────────────────────────────────────────

pub struct EpollPoller {
    epfd: RawFd,
    max_events_per_step: usize,
}

impl EpollPoller {
    pub fn new(wake_fd: RawFd, max_events_per_step: usize) -> Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os_error().annotate("creating epoll file descriptor"));
        }
        let mut poller = EpollPoller {
            epfd,
            max_events_per_step,
        };
        poller
            .add(wake_fd, WANT_READ | WANT_ERROR)
            .map_err(|e| e.annotate("registering the wake file descriptor"))?;
        Ok(poller)
    }

    fn desires_to_events(desires: u32) -> u32 {
        let mut events = 0u32;
        if desires & WANT_READ != 0 {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if desires & WANT_WRITE != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        if desires & WANT_ERROR != 0 {
            events |= (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        }
        events
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, desires: u32) -> Result<()> {
        let mut event = libc::epoll_event {
            events: Self::desires_to_events(desires),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) } < 0 {
            return Err(Error::last_os_error()
                .annotate(format!("epoll_ctl op {op} for file descriptor {fd}")));
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

impl Poller for EpollPoller {
    fn add(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        if fd < 0 {
            return Err(Error::invalid_argument("cannot add an invalid fd to epoll"));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, desires)
    }

    fn update(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        if fd < 0 {
            return Err(Error::invalid_argument("cannot update an invalid fd in epoll"));
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, desires)
    }

    fn delete(&mut self, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Err(Error::invalid_argument("cannot delete an invalid fd from epoll"));
        }
        let mut event: libc::epoll_event = unsafe { mem::zeroed() };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event) } < 0 {
            return Err(Error::last_os_error()
                .annotate(format!("epoll_ctl delete for file descriptor {fd}")));
        }
        Ok(())
    }

    fn step(&mut self, timeout: Duration) -> Result<Vec<SelectorEventData>> {
        let mut raw_events: Vec<libc::epoll_event> =
            vec![unsafe { mem::zeroed() }; self.max_events_per_step];
        let num = unsafe {
            libc::epoll_wait(
                self.epfd,
                raw_events.as_mut_ptr(),
                raw_events.len() as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if num < 0 {
            let errno = crate::error::last_errno();
            if errno == libc::EINTR {
                return Ok(Vec::new());
            }
            return Err(Error::from_errno(errno).annotate("during epoll_wait"));
        }
        let mut events = Vec::with_capacity(num as usize);
        for raw in &raw_events[..num as usize] {
            let mut desires = 0u32;
            if raw.events & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                desires |= WANT_ERROR;
            }
            if raw.events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
                desires |= WANT_READ;
            }
            if raw.events & libc::EPOLLOUT as u32 != 0 {
                desires |= WANT_WRITE;
            }
            events.push(SelectorEventData {
                token: raw.u64 as RawFd,
                desires,
                raw: raw.events,
            });
        }
        Ok(events)
    }

    fn is_hang_up_event(&self, raw: u32) -> bool {
        raw & libc::EPOLLHUP as u32 != 0
    }
    fn is_remote_hang_up_event(&self, raw: u32) -> bool {
        raw & libc::EPOLLRDHUP as u32 != 0
    }
    fn is_any_hang_up_event(&self, raw: u32) -> bool {
        raw & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
    }
    fn is_error_event(&self, raw: u32) -> bool {
        raw & libc::EPOLLERR as u32 != 0
    }
    fn is_input_event(&self, raw: u32) -> bool {
        raw & libc::EPOLLIN as u32 != 0
    }
}

// ── poll backend ────────────────────────────────────────────────────────

pub struct PollPoller {
    fds: Vec<libc::pollfd>,
    // fd -> index into fds.
    index_of: HashMap<RawFd, usize>,
    // Indices vacated by delete; compacted at the top of the next step so
    // events already collected for this step are not lost.
    to_compact: Vec<usize>,
}

impl PollPoller {
    pub fn new(wake_fd: RawFd) -> Result<PollPoller> {
        let mut poller = PollPoller {
            fds: Vec::new(),
            index_of: HashMap::new(),
            to_compact: Vec::new(),
        };
        poller
            .add(wake_fd, WANT_READ | WANT_ERROR)
            .map_err(|e| e.annotate("registering the wake file descriptor"))?;
        Ok(poller)
    }

    fn desires_to_events(desires: u32) -> libc::c_short {
        let mut events: libc::c_short = 0;
        if desires & WANT_READ != 0 {
            events |= libc::POLLIN | libc::POLLRDHUP;
        }
        if desires & WANT_WRITE != 0 {
            events |= libc::POLLOUT;
        }
        if desires & WANT_ERROR != 0 {
            events |= libc::POLLERR | libc::POLLHUP;
        }
        events
    }

    fn compact(&mut self) {
        if self.to_compact.is_empty() {
            return;
        }
        self.to_compact.sort_unstable();
        for i in (0..self.to_compact.len()).rev() {
            let index = self.to_compact[i];
            let last = self.fds.len() - 1;
            if index != last {
                let moved_fd = self.fds[last].fd;
                self.fds.swap(index, last);
                if moved_fd >= 0 {
                    self.index_of.insert(moved_fd, index);
                }
            }
            self.fds.pop();
        }
        self.to_compact.clear();
    }
}

impl Poller for PollPoller {
    fn add(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        if fd < 0 {
            return Err(Error::invalid_argument("cannot add an invalid fd to poll"));
        }
        if self.fds.len() >= MAX_POLL_FDS {
            return Err(Error::resource_exhausted(format!(
                "poll backend is at its limit of {MAX_POLL_FDS} file descriptors"
            )));
        }
        self.index_of.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: Self::desires_to_events(desires),
            revents: 0,
        });
        Ok(())
    }

    fn update(&mut self, fd: RawFd, desires: u32) -> Result<()> {
        let Some(&index) = self.index_of.get(&fd) else {
            return Err(Error::not_found(format!(
                "file descriptor {fd} is not registered with the poll backend"
            )));
        };
        self.fds[index].events = Self::desires_to_events(desires);
        Ok(())
    }

    fn delete(&mut self, fd: RawFd) -> Result<()> {
        let Some(index) = self.index_of.remove(&fd) else {
            return Err(Error::not_found(format!(
                "file descriptor {fd} is not registered with the poll backend"
            )));
        };
        self.fds[index].fd = -1;
        self.to_compact.push(index);
        Ok(())
    }

    fn step(&mut self, timeout: Duration) -> Result<Vec<SelectorEventData>> {
        self.compact();
        let num = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        if num < 0 {
            let errno = crate::error::last_errno();
            if errno == libc::EINTR {
                return Ok(Vec::new());
            }
            return Err(Error::from_errno(errno).annotate("during poll"));
        }
        let mut events = Vec::with_capacity(num as usize);
        let mut remaining = num;
        for pfd in &mut self.fds {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let raw = pfd.revents as u16 as u32;
            pfd.revents = 0;
            if pfd.fd < 0 {
                continue;
            }
            let mut desires = 0u32;
            if raw & (libc::POLLERR | libc::POLLHUP | libc::POLLRDHUP) as u16 as u32 != 0 {
                desires |= WANT_ERROR;
            }
            if raw & (libc::POLLIN | libc::POLLPRI) as u16 as u32 != 0 {
                desires |= WANT_READ;
            }
            if raw & libc::POLLOUT as u16 as u32 != 0 {
                desires |= WANT_WRITE;
            }
            events.push(SelectorEventData {
                token: pfd.fd,
                desires,
                raw,
            });
        }
        Ok(events)
    }

    fn is_hang_up_event(&self, raw: u32) -> bool {
        raw & libc::POLLHUP as u16 as u32 != 0
    }
    fn is_remote_hang_up_event(&self, raw: u32) -> bool {
        raw & libc::POLLRDHUP as u16 as u32 != 0
    }
    fn is_any_hang_up_event(&self, raw: u32) -> bool {
        raw & (libc::POLLHUP | libc::POLLRDHUP) as u16 as u32 != 0
    }
    fn is_error_event(&self, raw: u32) -> bool {
        raw & libc::POLLERR as u16 as u32 != 0
    }
    fn is_input_event(&self, raw: u32) -> bool {
        raw & libc::POLLIN as u16 as u32 != 0
    }
}
