//! Non-blocking TCP connections.
//!
//! [`TcpConnection`] is the connect/read/write state machine at the heart
//! of the runtime: Disconnected → (Resolving →) Connecting → Connected →
//! Flushing → Disconnected, with two orthogonal half-close flags. Reads are
//! clamped by `FIONREAD` and the configured read limit; writes drain the
//! output buffer with a single scatter-gather `writev` per event. Closing
//! the write half flushes the output buffer, issues `shutdown(WR)`, and
//! arms a linger alarm in case the peer never closes its side.
//!
//! All event processing runs on the connection's selector thread. The
//! public close entry points hop there when called from another thread.

use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{debug, warn};

use crate::address::{sockaddr_len, HostPort};
use crate::buffer::ChunkBuffer;
use crate::config::TcpConnectionOptions;
use crate::dns::DnsResolver;
use crate::error::{is_retryable_errno, Error, Result, Status};
use crate::metrics;
use crate::poller::SelectorEventData;
use crate::selectable::{self, Selectable, SelectorHandle, INVALID_FD};
use crate::selector::Selector;
use crate::timeouter::{TimeoutId, Timeouter};

/// Extracts the pending socket error from an fd via `SO_ERROR`.
pub fn extract_socket_errno(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return crate::error::last_errno();
    }
    err
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Resolving = 1,
    Connecting = 2,
    Connected = 3,
    Flushing = 4,
}

impl ConnState {
    pub(crate) fn from_u8(value: u8) -> ConnState {
        match value {
            1 => ConnState::Resolving,
            2 => ConnState::Connecting,
            3 => ConnState::Connected,
            4 => ConnState::Flushing,
            _ => ConnState::Disconnected,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Resolving => "RESOLVING",
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::Flushing => "FLUSHING",
        }
    }
}

/// Which half of a connection a close notification concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDirective {
    Read,
    Write,
    ReadWrite,
}

impl CloseDirective {
    pub fn name(self) -> &'static str {
        match self {
            CloseDirective::Read => "CLOSE_READ",
            CloseDirective::Write => "CLOSE_WRITE",
            CloseDirective::ReadWrite => "CLOSE_READ_WRITE",
        }
    }
}

/// Called once the connection reaches Connected.
pub type ConnectHandler = Box<dyn FnMut() + Send>;
/// Called after new bytes land in the input buffer; a non-ok result closes
/// the connection with that status.
pub type ReadHandler = Box<dyn FnMut() -> Result<()> + Send>;
/// Called when the connection can take more output; a non-ok result closes
/// the connection with that status.
pub type WriteHandler = Box<dyn FnMut() -> Result<()> + Send>;
/// Called as halves of the connection close, with the closing status and
/// the affected half.
pub type CloseHandler = Box<dyn FnMut(Status, CloseDirective) + Send>;

/// Shared surface of [`TcpConnection`] and [`crate::SslConnection`].
pub trait Connection: Send + Sync {
    /// Starts connecting to a remote address; the connect handler fires on
    /// completion, the close handler on failure.
    fn connect(&self, remote: &HostPort) -> Result<()>;
    /// Flushes buffered output, closes the write half, and winds the
    /// connection down gracefully.
    fn flush_and_close(&self);
    /// Tears the connection down immediately.
    fn force_close(&self);
    fn set_send_buffer_size(&self, size: usize) -> Result<()>;
    fn set_recv_buffer_size(&self, size: usize) -> Result<()>;
    fn request_read_events(&self, enable: bool) -> Result<()>;
    fn request_write_events(&self, enable: bool) -> Result<()>;
    fn local_address(&self) -> HostPort;
    fn remote_address(&self) -> HostPort;
    fn state(&self) -> ConnState;
    /// One-line description for logging.
    fn describe(&self) -> String;
}

/// Timeout id used for the shutdown linger alarm.
const SHUTDOWN_TIMEOUT_ID: TimeoutId = -100;

/// One optional handler with re-entrancy-safe invocation.
///
/// The handler is taken out of the slot for the duration of a call, so it
/// may re-enter the owning object freely. A `set` or `clear` issued during
/// the call (including by the handler itself) wins over the put-back; the
/// epoch counter detects that.
pub(crate) struct HandlerSlot<T> {
    state: Mutex<SlotState<T>>,
}

struct SlotState<T> {
    handler: Option<T>,
    epoch: u64,
}

impl<T> HandlerSlot<T> {
    pub(crate) fn new() -> HandlerSlot<T> {
        HandlerSlot {
            state: Mutex::new(SlotState {
                handler: None,
                epoch: 0,
            }),
        }
    }

    pub(crate) fn set(&self, handler: T) {
        let mut state = self.state.lock().unwrap();
        state.handler = Some(handler);
        state.epoch += 1;
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.handler = None;
        state.epoch += 1;
    }

    /// Takes the handler for a call; pair with [`HandlerSlot::restore`].
    pub(crate) fn take(&self) -> Option<(T, u64)> {
        let mut state = self.state.lock().unwrap();
        let epoch = state.epoch;
        state.handler.take().map(|handler| (handler, epoch))
    }

    /// Puts a taken handler back unless the slot changed underneath the
    /// call.
    pub(crate) fn restore(&self, handler: T, epoch: u64) {
        let mut state = self.state.lock().unwrap();
        if state.epoch == epoch && state.handler.is_none() {
            state.handler = Some(handler);
        }
    }

    /// Takes, calls, and restores in one step.
    pub(crate) fn call_with<R>(&self, invoke: impl FnOnce(&mut T) -> R) -> Option<R> {
        let (mut handler, epoch) = self.take()?;
        let result = invoke(&mut handler);
        self.restore(handler, epoch);
        Some(result)
    }
}

/// The four application handler slots of a connection.
pub(crate) struct HandlerSlots {
    connect: HandlerSlot<ConnectHandler>,
    read: HandlerSlot<ReadHandler>,
    write: HandlerSlot<WriteHandler>,
    close: HandlerSlot<CloseHandler>,
}

impl HandlerSlots {
    pub(crate) fn new() -> HandlerSlots {
        HandlerSlots {
            connect: HandlerSlot::new(),
            read: HandlerSlot::new(),
            write: HandlerSlot::new(),
            close: HandlerSlot::new(),
        }
    }

    pub(crate) fn set_connect(&self, handler: ConnectHandler) {
        self.connect.set(handler);
    }
    pub(crate) fn clear_connect(&self) {
        self.connect.clear();
    }
    pub(crate) fn set_read(&self, handler: ReadHandler) {
        self.read.set(handler);
    }
    pub(crate) fn clear_read(&self) {
        self.read.clear();
    }
    pub(crate) fn set_write(&self, handler: WriteHandler) {
        self.write.set(handler);
    }
    pub(crate) fn clear_write(&self) {
        self.write.clear();
    }
    pub(crate) fn set_close(&self, handler: CloseHandler) {
        self.close.set(handler);
    }
    pub(crate) fn clear_close(&self) {
        self.close.clear();
    }
    pub(crate) fn clear_all(&self) {
        self.clear_connect();
        self.clear_read();
        self.clear_write();
        self.clear_close();
    }

    /// Returns false when no connect handler is set.
    pub(crate) fn call_connect(&self) -> bool {
        self.connect.call_with(|handler| handler()).is_some()
    }

    /// Returns `None` when no read handler is set.
    pub(crate) fn call_read(&self) -> Option<Result<()>> {
        self.read.call_with(|handler| handler())
    }

    /// Returns `None` when no write handler is set.
    pub(crate) fn call_write(&self) -> Option<Result<()>> {
        self.write.call_with(|handler| handler())
    }

    /// Returns false when no close handler is set.
    pub(crate) fn call_close(&self, status: Status, directive: CloseDirective) -> bool {
        self.close
            .call_with(|handler| handler(status, directive))
            .is_some()
    }
}

/// A non-blocking TCP connection bound to one selector for its lifetime.
pub struct TcpConnection {
    selector: Arc<Selector>,
    handle: SelectorHandle,
    options: TcpConnectionOptions,
    self_weak: Weak<TcpConnection>,

    fd: AtomicI32,
    state: AtomicU8,
    read_closed: AtomicBool,
    write_closed: AtomicBool,

    local_address: Mutex<HostPort>,
    remote_address: Mutex<HostPort>,
    last_error: Mutex<Option<Error>>,

    // Reactor-thread confined; locked only in short, non-reentrant spans.
    inbuf: Mutex<ChunkBuffer>,
    outbuf: Mutex<ChunkBuffer>,

    handlers: HandlerSlots,

    count_bytes_read: AtomicU64,
    count_bytes_written: AtomicU64,
    last_read_nanos: AtomicI64,
    last_write_nanos: AtomicI64,

    timeouter: Timeouter,
    // Set when a close lands while a DNS resolve is in flight; honored when
    // the resolve callback arrives.
    close_on_resolve: Mutex<Option<bool>>,
}

impl TcpConnection {
    pub fn new(selector: Arc<Selector>, options: TcpConnectionOptions) -> Arc<TcpConnection> {
        Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let timeout_weak = weak.clone();
            let timeouter = Timeouter::new(selector.clone(), move |timeout_id| {
                if let Some(conn) = timeout_weak.upgrade() {
                    conn.handle_timeout_event(timeout_id);
                }
            });
            TcpConnection {
                selector,
                handle: SelectorHandle::new(),
                options,
                self_weak: weak.clone(),
                fd: AtomicI32::new(INVALID_FD),
                state: AtomicU8::new(ConnState::Disconnected as u8),
                read_closed: AtomicBool::new(false),
                write_closed: AtomicBool::new(false),
                local_address: Mutex::new(HostPort::new()),
                remote_address: Mutex::new(HostPort::new()),
                last_error: Mutex::new(None),
                inbuf: Mutex::new(ChunkBuffer::new()),
                outbuf: Mutex::new(ChunkBuffer::new()),
                handlers: HandlerSlots::new(),
                count_bytes_read: AtomicU64::new(0),
                count_bytes_written: AtomicU64::new(0),
                last_read_nanos: AtomicI64::new(0),
                last_write_nanos: AtomicI64::new(0),
                timeouter,
                close_on_resolve: Mutex::new(None),
            }
        })
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    pub fn write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().clone()
    }

    fn set_last_error(&self, error: &Error) {
        if self.options.detail_log {
            debug!("{} - updating error to: {error}", self.describe());
        }
        let mut last = self.last_error.lock().unwrap();
        if last.is_none() {
            *last = Some(error.clone());
        }
    }

    fn last_status(&self) -> Status {
        match self.last_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn count_bytes_read(&self) -> u64 {
        self.count_bytes_read.load(Ordering::Relaxed)
    }

    pub fn count_bytes_written(&self) -> u64 {
        self.count_bytes_written.load(Ordering::Relaxed)
    }

    // ── Handler slots ───────────────────────────────────────────────

    pub fn set_connect_handler(&self, handler: impl FnMut() + Send + 'static) -> &Self {
        self.handlers.set_connect(Box::new(handler));
        self
    }
    pub fn clear_connect_handler(&self) -> &Self {
        self.handlers.clear_connect();
        self
    }
    pub fn set_read_handler(
        &self,
        handler: impl FnMut() -> Result<()> + Send + 'static,
    ) -> &Self {
        self.handlers.set_read(Box::new(handler));
        self
    }
    pub fn clear_read_handler(&self) -> &Self {
        self.handlers.clear_read();
        self
    }
    pub fn set_write_handler(
        &self,
        handler: impl FnMut() -> Result<()> + Send + 'static,
    ) -> &Self {
        self.handlers.set_write(Box::new(handler));
        self
    }
    pub fn clear_write_handler(&self) -> &Self {
        self.handlers.clear_write();
        self
    }
    pub fn set_close_handler(
        &self,
        handler: impl FnMut(Status, CloseDirective) + Send + 'static,
    ) -> &Self {
        self.handlers.set_close(Box::new(handler));
        self
    }
    pub fn clear_close_handler(&self) -> &Self {
        self.handlers.clear_close();
        self
    }
    pub fn clear_all_handlers(&self) -> &Self {
        self.handlers.clear_all();
        self
    }

    fn call_connect_handler(&self) {
        if !self.handlers.call_connect() {
            warn!("connect handler not set for connection: {}", self.describe());
        }
    }

    fn call_read_handler(&self) -> Result<()> {
        self.handlers.call_read().unwrap_or_else(|| {
            Err(Error::failed_precondition(format!(
                "no read handler set for connection: {}",
                self.describe()
            )))
        })
    }

    fn call_write_handler(&self) -> Result<()> {
        self.handlers.call_write().unwrap_or_else(|| {
            Err(Error::failed_precondition(format!(
                "no write handler set for connection: {}",
                self.describe()
            )))
        })
    }

    fn call_close_handler(&self, status: Status, directive: CloseDirective) {
        // A read close implies the read flag is already up, likewise write.
        debug_assert!(
            self.read_closed()
                || (directive != CloseDirective::Read && directive != CloseDirective::ReadWrite)
        );
        debug_assert!(
            self.write_closed()
                || (directive != CloseDirective::Write && directive != CloseDirective::ReadWrite)
        );
        if !self.handlers.call_close(status, directive) {
            if self.options.detail_log {
                debug!("{} - no close handler set", self.describe());
            }
            self.flush_and_close_impl();
        }
    }

    // ── Writing ─────────────────────────────────────────────────────

    /// Appends bytes to the output buffer and requests write events.
    /// Loop-thread only, like every desire update.
    pub fn write(&self, data: &[u8]) {
        self.outbuf.lock().unwrap().append(data);
        if let Err(e) = self.request_write_events_impl(true) {
            warn!("{} - cannot enable write events: {e}", self.describe());
        }
    }

    /// Appends an owned chunk without copying.
    pub fn write_bytes(&self, data: Bytes) {
        self.outbuf.lock().unwrap().append_bytes(data);
        if let Err(e) = self.request_write_events_impl(true) {
            warn!("{} - cannot enable write events: {e}", self.describe());
        }
    }

    /// Appends a whole buffer without copying.
    pub fn write_buffer(&self, data: ChunkBuffer) {
        self.outbuf.lock().unwrap().append_buffer(data);
        if let Err(e) = self.request_write_events_impl(true) {
            warn!("{} - cannot enable write events: {e}", self.describe());
        }
    }

    /// Takes everything the peer sent so far, leaving the input buffer
    /// empty.
    pub fn take_input(&self) -> ChunkBuffer {
        self.inbuf.lock().unwrap().take_all()
    }

    pub fn input_size(&self) -> usize {
        self.inbuf.lock().unwrap().len()
    }

    pub fn output_size(&self) -> usize {
        self.outbuf.lock().unwrap().len()
    }

    /// Takes the queued output bytes; test hook for buffer-level pumps
    /// that run without a live socket.
    #[cfg(test)]
    pub(crate) fn take_output(&self) -> ChunkBuffer {
        self.outbuf.lock().unwrap().take_all()
    }

    // ── Setup paths ─────────────────────────────────────────────────

    /// Adopts an already connected fd; how acceptors finish a server-side
    /// accept. The local and peer addresses are read back from the socket.
    pub(crate) fn wrap(&self, fd: RawFd) -> Result<()> {
        if self.fd.load(Ordering::Acquire) != INVALID_FD {
            return Err(Error::failed_precondition(
                "wrap is only valid on a disconnected connection without an fd",
            ));
        }
        self.fd.store(fd, Ordering::Release);
        if let Err(e) = self.setup_wrapped_fd() {
            // The caller still owns the raw fd on failure.
            if self.handle.is_attached_to(&self.selector) {
                let _ = self.selector.unregister(self);
            }
            self.fd.store(INVALID_FD, Ordering::Release);
            return Err(e);
        }
        self.read_closed.store(false, Ordering::Release);
        self.write_closed.store(false, Ordering::Release);
        self.set_state(ConnState::Connected);
        Ok(())
    }

    fn setup_wrapped_fd(&self) -> Result<()> {
        self.set_socket_options()?;
        let me = self.upgrade()?;
        self.selector.register(me)?;
        self.initialize_local_address()?;
        self.initialize_remote_address()?;
        self.request_read_events_impl(true)?;
        Ok(())
    }

    fn upgrade(&self) -> Result<Arc<dyn Selectable>> {
        match self.self_weak.upgrade() {
            Some(me) => Ok(me),
            None => Err(Error::failed_precondition("connection is being dropped")),
        }
    }

    fn connect_impl(&self, remote: &HostPort) -> Result<()> {
        let state = self.state();
        if state != ConnState::Disconnected && state != ConnState::Resolving {
            return Err(Error::failed_precondition(format!(
                "connect in illegal state: {}",
                state.name()
            )));
        }
        if self.fd.load(Ordering::Acquire) != INVALID_FD {
            return Err(Error::failed_precondition("connection fd already created"));
        }
        match remote.port() {
            None | Some(0) => {
                return Err(Error::invalid_argument(format!(
                    "hostport for TCP connection has no port specified: {remote}"
                )));
            }
            Some(_) => {}
        }

        // Kick off DNS when the endpoint still needs resolving.
        if state == ConnState::Disconnected && !remote.is_resolved() {
            let Some(host) = remote.host() else {
                return Err(Error::invalid_argument(format!(
                    "hostport for TCP connection has no host or ip specified: {remote}"
                )));
            };
            *self.remote_address.lock().unwrap() = remote.clone();
            if self.options.detail_log {
                debug!("{} - starting DNS resolve", self.describe());
            }
            self.set_state(ConnState::Resolving);
            let weak = self.self_weak.clone();
            DnsResolver::default_resolver().resolve_async(
                host,
                Box::new(move |result| {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_dns_result(result);
                    }
                }),
            );
            return Ok(());
        }

        let (addr, addr_len) = remote
            .to_sockaddr()
            .map_err(|e| e.annotate("setting remote address for TCP connection"))?;
        let fd = unsafe {
            libc::socket(
                addr.ss_family as libc::c_int,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::last_os_error()
                .annotate(format!("socket() failed for connecting to {remote}")));
        }
        self.fd.store(fd, Ordering::Release);
        let setup = (|| -> Result<()> {
            self.set_socket_options()?;
            self.selector.register(self.upgrade()?)
        })();
        if let Err(e) = setup {
            unsafe { libc::close(fd) };
            self.fd.store(INVALID_FD, Ordering::Release);
            return Err(e);
        }

        *self.remote_address.lock().unwrap() = remote.clone();
        self.set_state(ConnState::Connecting);
        self.read_closed.store(false, Ordering::Release);
        self.write_closed.store(false, Ordering::Release);

        let ret = unsafe {
            libc::connect(fd, &addr as *const _ as *const libc::sockaddr, addr_len)
        };
        if ret < 0 {
            let errno = crate::error::last_errno();
            if errno != libc::EINPROGRESS {
                // Immediate hard failure; tear down what we just set up.
                let error = Error::from_errno(errno)
                    .annotate(format!("connect() failed for {}", self.describe()));
                self.internal_close(Err(error.clone()), false);
                return Err(error);
            }
            // EINPROGRESS: completion arrives as the first I/O event.
        }
        // Even an immediately successful connect defers the connect handler
        // to the first read/write event, so there is exactly one "connected"
        // entry point.
        self.request_write_events_impl(true)?;
        self.request_read_events_impl(true)?;
        if self.options.detail_log {
            debug!("{} - connecting", self.describe());
        }
        Ok(())
    }

    fn handle_dns_result(&self, result: Result<Arc<crate::dns::DnsHostInfo>>) {
        if !self.selector.is_in_select_thread() {
            let weak = self.self_weak.clone();
            self.selector.run_in_select_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_dns_result(result);
                }
            });
            return;
        }
        debug_assert_eq!(self.state(), ConnState::Resolving);
        if let Some(call_close_handler) = self.close_on_resolve.lock().unwrap().take() {
            if self.options.detail_log {
                debug!("{} - resolve completed, but closed meanwhile", self.describe());
            }
            // Leave Resolving so the close is not re-deferred.
            self.set_state(ConnState::Connecting);
            self.internal_close(self.last_status(), call_close_handler);
            return;
        }
        let status = (|| -> Result<()> {
            let info = result?;
            let Some(ip) = info.pick_next_address() else {
                return Err(Error::internal(format!(
                    "no valid IP address was resolved for {}",
                    self.describe()
                )));
            };
            let connect_addr = {
                let mut remote = self.remote_address.lock().unwrap();
                remote.update_ip(ip);
                remote.clone()
            };
            if self.options.detail_log {
                debug!("{} - resolve completed ok", self.describe());
            }
            self.connect_impl(&connect_addr)
        })();
        if let Err(e) = status {
            // Leave Resolving first or the close would defer itself again.
            if self.state() == ConnState::Resolving {
                self.set_state(ConnState::Connecting);
            }
            self.internal_close(Err(e), true);
        }
    }

    // ── Close paths ─────────────────────────────────────────────────

    fn flush_and_close_impl(&self) {
        if !self.selector.is_in_select_thread() {
            let weak = self.self_weak.clone();
            self.selector.run_in_select_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.flush_and_close_impl();
                }
            });
            return;
        }
        if self.options.detail_log {
            debug!("{} - flush and close", self.describe());
        }
        self.close_communication(CloseDirective::Write);
    }

    fn force_close_impl(&self) {
        if !self.selector.is_in_select_thread() {
            let weak = self.self_weak.clone();
            self.selector.run_in_select_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close_impl();
                }
            });
            return;
        }
        if self.options.detail_log {
            debug!("{} - force close", self.describe());
        }
        self.internal_close(Ok(()), true);
    }

    /// Starts closing one or both halves of a connected connection. A read
    /// close needs no action here; a write close transitions to Flushing
    /// and lets the write path drain the output buffer and shut the socket
    /// down.
    pub fn close_communication(&self, directive: CloseDirective) {
        if self.fd.load(Ordering::Acquire) == INVALID_FD {
            return;
        }
        if !self.selector.is_in_select_thread() {
            let weak = self.self_weak.clone();
            self.selector.run_in_select_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.close_communication(directive);
                }
            });
            return;
        }
        if self.options.detail_log {
            debug!(
                "{} - close communication: {}",
                self.describe(),
                directive.name()
            );
        }
        if directive == CloseDirective::Read {
            return;
        }
        // In Flushing this re-arms write events so the drain/shutdown step
        // runs even when the responder side initiated no write of its own.
        if !self.write_closed()
            && matches!(self.state(), ConnState::Connected | ConnState::Flushing)
        {
            self.set_state(ConnState::Flushing);
            if let Err(e) = self.request_write_events_impl(true) {
                warn!("{} - cannot enable write events: {e}", self.describe());
            }
        }
    }

    /// Idempotent teardown: unregister, shutdown both halves, close the fd,
    /// clear buffers and timeouts, then optionally notify the close
    /// handler. While a DNS resolve is pending the close is recorded and
    /// executed when the resolve callback lands.
    fn internal_close(&self, status: Status, call_close_handler: bool) {
        if self.state() == ConnState::Disconnected {
            debug_assert_eq!(self.fd.load(Ordering::Acquire), INVALID_FD);
            return;
        }
        if let Err(e) = &status {
            self.set_last_error(e);
        }
        if self.state() == ConnState::Resolving {
            if self.options.detail_log {
                debug!("{} - close deferred until resolve completes", self.describe());
            }
            *self.close_on_resolve.lock().unwrap() = Some(call_close_handler);
            return;
        }
        let fd = self.fd.load(Ordering::Acquire);
        if fd != INVALID_FD {
            // Unregister while get_fd() still answers with the live fd.
            if let Err(e) = self.selector.unregister(self) {
                warn!("{} - unregister failed: {e}", self.describe());
            }
            unsafe {
                if libc::shutdown(fd, libc::SHUT_RDWR) < 0 {
                    let errno = crate::error::last_errno();
                    if errno != libc::ENOTCONN {
                        warn!("{} - shutdown failed: {}", self.describe(), Error::from_errno(errno));
                    }
                }
                if libc::close(fd) < 0 {
                    warn!("{} - close failed: {}", self.describe(), Error::last_os_error());
                }
            }
            self.fd.store(INVALID_FD, Ordering::Release);
        }
        self.set_state(ConnState::Disconnected);
        self.read_closed.store(true, Ordering::Release);
        self.write_closed.store(true, Ordering::Release);
        self.timeouter.clear_all_timeouts();
        {
            let mut inbuf = self.inbuf.lock().unwrap();
            if !inbuf.is_empty() {
                warn!(
                    "{} - closed with {} input bytes unread",
                    self.describe(),
                    inbuf.len()
                );
            }
            inbuf.clear();
        }
        {
            let mut outbuf = self.outbuf.lock().unwrap();
            if !outbuf.is_empty() {
                warn!(
                    "{} - closed with {} output bytes unwritten",
                    self.describe(),
                    outbuf.len()
                );
            }
            outbuf.clear();
        }
        metrics::CONNECTIONS_CLOSED.increment();
        if call_close_handler {
            self.call_close_handler(status, CloseDirective::ReadWrite);
        }
    }

    fn handle_timeout_event(&self, timeout_id: TimeoutId) {
        if timeout_id != SHUTDOWN_TIMEOUT_ID {
            warn!("{} - unknown timeout id {timeout_id}", self.describe());
        }
        self.internal_close(Ok(()), true);
    }

    // ── Socket plumbing ─────────────────────────────────────────────

    fn set_socket_options(&self) -> Result<()> {
        let fd = self.fd.load(Ordering::Acquire);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(Error::last_os_error().annotate("fcntl F_GETFL"));
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::last_os_error().annotate("fcntl F_SETFL O_NONBLOCK"));
        }
        let one: libc::c_int = 1;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(Error::last_os_error().annotate("setsockopt TCP_NODELAY"));
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(Error::last_os_error().annotate("setsockopt SO_NOSIGPIPE"));
        }
        if let Some(size) = self.options.send_buffer_size {
            self.set_send_buffer_size_impl(size)?;
        }
        if let Some(size) = self.options.recv_buffer_size {
            self.set_recv_buffer_size_impl(size)?;
        }
        Ok(())
    }

    fn set_send_buffer_size_impl(&self, size: usize) -> Result<()> {
        let fd = self.fd.load(Ordering::Acquire);
        let value = size as libc::c_int;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(Error::last_os_error()
                .annotate(format!("setting send buffer size {size} for {}", self.describe())));
        }
        Ok(())
    }

    fn set_recv_buffer_size_impl(&self, size: usize) -> Result<()> {
        let fd = self.fd.load(Ordering::Acquire);
        let value = size as libc::c_int;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(Error::last_os_error()
                .annotate(format!("setting recv buffer size {size} for {}", self.describe())));
        }
        Ok(())
    }

    fn request_read_events_impl(&self, enable: bool) -> Result<()> {
        self.selector.enable_read_callback(self, enable)
    }

    fn request_write_events_impl(&self, enable: bool) -> Result<()> {
        self.selector.enable_write_callback(self, enable)
    }

    fn initialize_local_address(&self) -> Result<()> {
        let fd = self.fd.load(Ordering::Acquire);
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) } < 0
        {
            return Err(Error::last_os_error()
                .annotate(format!("getsockname failed for {}", self.describe())));
        }
        let local = HostPort::from_sockaddr(&addr, sockaddr_len(&addr))
            .map_err(|e| e.annotate("parsing local socket address"))?;
        self.local_address.lock().unwrap().update(&local);
        Ok(())
    }

    fn initialize_remote_address(&self) -> Result<()> {
        let fd = self.fd.load(Ordering::Acquire);
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if unsafe { libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) } < 0
        {
            return Err(Error::last_os_error()
                .annotate(format!("getpeername failed for {}", self.describe())));
        }
        let remote = HostPort::from_sockaddr(&addr, sockaddr_len(&addr))
            .map_err(|e| e.annotate("parsing remote socket address"))?;
        self.remote_address.lock().unwrap().update(&remote);
        Ok(())
    }

    // ── Event processing ────────────────────────────────────────────

    /// Promotes Connecting to Connected on the first I/O event and calls
    /// the application connect handler. The handler may leave the state at
    /// Connected or move it to Disconnected or Flushing.
    fn perform_connect_on_first_operation(&self) -> bool {
        self.set_state(ConnState::Connected);
        if let Err(e) = self.initialize_local_address() {
            warn!("{} - cannot read local address: {e}", self.describe());
        }
        metrics::CONNECTIONS_CONNECTED.increment();
        self.call_connect_handler();
        let state = self.state();
        debug_assert!(
            matches!(
                state,
                ConnState::Connected | ConnState::Disconnected | ConnState::Flushing
            ),
            "connect handler left an invalid state: {}",
            state.name()
        );
        if self.options.detail_log {
            debug!("{} - connected", self.describe());
        }
        state == ConnState::Connected
    }

    /// Reads whatever the socket holds (clamped by the read limit) into the
    /// input buffer. Returns the number of bytes read.
    fn perform_read(&self) -> Result<usize> {
        let fd = self.fd.load(Ordering::Acquire);
        let mut count: libc::c_int = 0;
        if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) } < 0 {
            return Err(Error::last_os_error()
                .annotate(format!("ioctl FIONREAD for {}", self.describe())));
        }
        if count <= 0 {
            return Ok(0);
        }
        let mut len = count as usize;
        if let Some(limit) = self.options.read_limit {
            len = len.min(limit);
        }
        let cb = {
            let mut inbuf = self.inbuf.lock().unwrap();
            selectable::read_to_buffer(fd, &mut inbuf, len)
                .map_err(|e| e.annotate(format!("reading input for {}", self.describe())))?
        };
        self.count_bytes_read.fetch_add(cb as u64, Ordering::Relaxed);
        self.last_read_nanos
            .store(self.selector.now_nanos(), Ordering::Relaxed);
        metrics::BYTES_READ.add(cb as u64);
        Ok(cb)
    }
}

impl Connection for TcpConnection {
    fn connect(&self, remote: &HostPort) -> Result<()> {
        self.connect_impl(remote)
    }

    fn flush_and_close(&self) {
        self.flush_and_close_impl();
    }

    fn force_close(&self) {
        self.force_close_impl();
    }

    fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        self.set_send_buffer_size_impl(size)
    }

    fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        self.set_recv_buffer_size_impl(size)
    }

    fn request_read_events(&self, enable: bool) -> Result<()> {
        self.request_read_events_impl(enable)
    }

    fn request_write_events(&self, enable: bool) -> Result<()> {
        self.request_write_events_impl(enable)
    }

    fn local_address(&self) -> HostPort {
        self.local_address.lock().unwrap().clone()
    }

    fn remote_address(&self) -> HostPort {
        self.remote_address.lock().unwrap().clone()
    }

    fn state(&self) -> ConnState {
        TcpConnection::state(self)
    }

    fn describe(&self) -> String {
        format!(
            "TcpConnection [ {} => {} (fd: {}, state: {}) ]",
            self.local_address.lock().unwrap(),
            self.remote_address.lock().unwrap(),
            self.fd.load(Ordering::Acquire),
            self.state_name()
        )
    }
}

impl Selectable for TcpConnection {
    fn selector_handle(&self) -> &SelectorHandle {
        &self.handle
    }

    fn handle_read_event(&self, _event: SelectorEventData) -> bool {
        let state = self.state();
        if state == ConnState::Disconnected {
            return false;
        }
        if state == ConnState::Connecting {
            return self.perform_connect_on_first_operation();
        }
        let cb = match self.perform_read() {
            Ok(cb) => cb,
            Err(e) => {
                self.internal_close(Err(e), true);
                return false;
            }
        };
        if cb > 0 {
            if let Err(e) = self.call_read_handler() {
                self.internal_close(Err(e), true);
                return false;
            }
        }
        // The read half is done when the peer finished sending or the
        // socket carries a hard (non-retryable) error.
        let socket_errno = extract_socket_errno(self.fd.load(Ordering::Acquire));
        if self.write_closed()
            || self.state() == ConnState::Flushing
            || (socket_errno != 0 && !is_retryable_errno(socket_errno))
        {
            self.read_closed.store(true, Ordering::Release);
        }
        if self.read_closed() {
            self.call_close_handler(Ok(()), CloseDirective::Read);
            if self.fd.load(Ordering::Acquire) != INVALID_FD {
                // Without this (E)POLLIN fires continuously on the dead half.
                if let Err(e) = self.request_read_events_impl(false) {
                    self.internal_close(Err(e), true);
                    return false;
                }
            }
        }
        true
    }

    fn handle_write_event(&self, _event: SelectorEventData) -> bool {
        let state = self.state();
        if state == ConnState::Disconnected {
            return false;
        }
        if state == ConnState::Connecting {
            return self.perform_connect_on_first_operation();
        }
        let fd = self.fd.load(Ordering::Acquire);
        let write_result = {
            let outbuf = self.outbuf.lock().unwrap();
            selectable::write_buffer_iovec(fd, &outbuf, self.options.write_limit)
        };
        let cb = match write_result {
            Ok(cb) => cb,
            Err(e) => {
                self.internal_close(Err(e), true);
                return false;
            }
        };
        self.outbuf.lock().unwrap().remove_prefix(cb);
        self.count_bytes_written.fetch_add(cb as u64, Ordering::Relaxed);
        self.last_write_nanos
            .store(self.selector.now_nanos(), Ordering::Relaxed);
        metrics::BYTES_WRITTEN.add(cb as u64);

        if self.state() != ConnState::Flushing {
            if let Err(e) = self.call_write_handler() {
                self.internal_close(Err(e), true);
                return false;
            }
        }
        if !self.outbuf.lock().unwrap().is_empty() {
            return true; // more to write; keep write events on
        }
        if let Err(e) = self.request_write_events_impl(false) {
            self.internal_close(Err(e), true);
            return false;
        }
        if self.state() != ConnState::Flushing {
            return true;
        }
        // Flushing and fully drained: close the write half and wait for the
        // peer to hang up, bounded by the linger alarm.
        if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
            self.internal_close(
                Err(Error::last_os_error()
                    .annotate(format!("shutdown after flush failed for {}", self.describe()))),
                true,
            );
            return false;
        }
        self.write_closed.store(true, Ordering::Release);
        self.timeouter
            .set_timeout(SHUTDOWN_TIMEOUT_ID, self.options.shutdown_linger_timeout);
        true
    }

    fn handle_error_event(&self, event: SelectorEventData) -> bool {
        let state = self.state();
        if state == ConnState::Disconnected {
            return false;
        }
        let raw = event.raw;
        if self.selector.is_error_event(raw) {
            let errno = extract_socket_errno(self.fd.load(Ordering::Acquire));
            self.internal_close(
                Err(Error::from_errno(errno)
                    .annotate(format!("error detected on socket for {}", self.describe()))),
                true,
            );
            return false;
        }
        if self.selector.is_hang_up_event(raw) {
            // The peer fully closed its endpoint.
            self.write_closed.store(true, Ordering::Release);
            if state != ConnState::Connecting && self.selector.is_input_event(raw) {
                // Let the next read event drain pending data; HUP keeps
                // firing until then.
                if self.options.detail_log {
                    debug!("{} - HUP with pending input, draining", self.describe());
                }
                return true;
            }
            self.internal_close(Ok(()), true);
            return false;
        }
        if self.selector.is_remote_hang_up_event(raw) {
            // The peer shut down its write half.
            self.set_state(ConnState::Flushing);
            if state != ConnState::Connecting && self.selector.is_input_event(raw) {
                if self.options.detail_log {
                    debug!("{} - remote HUP with pending input, draining", self.describe());
                }
                return true;
            }
            self.internal_close(Ok(()), true);
            return false;
        }
        true
    }

    fn get_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.options.detail_log {
            debug!("{} - external close requested", self.describe());
        }
        self.internal_close(Ok(()), true);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let fd = self.fd.swap(INVALID_FD, Ordering::AcqRel);
        if fd != INVALID_FD {
            warn!("TcpConnection dropped while still open (fd {fd}); closing the fd");
            unsafe { libc::close(fd) };
        }
    }
}
