//! TCP accept loop: bind, listen, accept, and hand accepted sockets to a
//! pool of client selectors round-robin.

use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::address::{sockaddr_len, HostPort};
use crate::config::TcpAcceptorOptions;
use crate::connection::{extract_socket_errno, Connection, HandlerSlot, TcpConnection};
use crate::error::{Error, Result, Status};
use crate::metrics;
use crate::poller::SelectorEventData;
use crate::selectable::{Selectable, SelectorHandle, INVALID_FD};
use crate::selector::{Selector, SelectorThread};

/// Acceptor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcceptorState {
    Disconnected = 0,
    Listening = 1,
}

impl AcceptorState {
    pub fn name(self) -> &'static str {
        match self {
            AcceptorState::Disconnected => "DISCONNECTED",
            AcceptorState::Listening => "LISTENING",
        }
    }
}

/// Vets an incoming peer before the connection is set up; returning false
/// rejects it.
pub type FilterHandler = Box<dyn FnMut(&HostPort) -> bool + Send>;
/// Receives each fully initialized accepted connection. Runs on the
/// selector the connection was assigned to.
pub type TcpAcceptHandler = Box<dyn FnMut(Arc<TcpConnection>) + Send>;
/// Notified when the accepting socket closes, with the closing status.
pub type AcceptorCloseHandler = Box<dyn FnMut(Status) + Send>;

/// Round-robin pool of selector threads accepted connections are
/// dispatched to. An empty pool keeps connections on the acceptor's own
/// selector.
#[derive(Default)]
pub struct AcceptorPool {
    next: AtomicUsize,
    threads: Vec<Arc<SelectorThread>>,
}

impl AcceptorPool {
    pub fn new(threads: Vec<Arc<SelectorThread>>) -> AcceptorPool {
        AcceptorPool {
            next: AtomicUsize::new(0),
            threads,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// The next selector in round-robin order, or none for an empty pool.
    pub fn next_selector(&self) -> Option<Arc<Selector>> {
        if self.threads.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        Some(self.threads[index].selector().clone())
    }
}

impl Clone for AcceptorPool {
    fn clone(&self) -> AcceptorPool {
        AcceptorPool {
            next: AtomicUsize::new(self.next.load(Ordering::Relaxed)),
            threads: self.threads.clone(),
        }
    }
}

/// Counters kept by a [`TcpAcceptor`]; readable from any thread.
#[derive(Default)]
pub struct AcceptorStats {
    hang_ups_handled: AtomicU64,
    errors_handled: AtomicU64,
    peer_parse_errors: AtomicU64,
    filtered_connections: AtomicU64,
    connections_accept_scheduled: AtomicU64,
    connections_accepted: AtomicU64,
    connection_wrap_errors: AtomicU64,
    connections_initialized: AtomicU64,
}

impl AcceptorStats {
    pub fn hang_ups_handled(&self) -> u64 {
        self.hang_ups_handled.load(Ordering::Relaxed)
    }
    pub fn errors_handled(&self) -> u64 {
        self.errors_handled.load(Ordering::Relaxed)
    }
    pub fn peer_parse_errors(&self) -> u64 {
        self.peer_parse_errors.load(Ordering::Relaxed)
    }
    pub fn filtered_connections(&self) -> u64 {
        self.filtered_connections.load(Ordering::Relaxed)
    }
    pub fn connections_accept_scheduled(&self) -> u64 {
        self.connections_accept_scheduled.load(Ordering::Relaxed)
    }
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }
    pub fn connection_wrap_errors(&self) -> u64 {
        self.connection_wrap_errors.load(Ordering::Relaxed)
    }
    pub fn connections_initialized(&self) -> u64 {
        self.connections_initialized.load(Ordering::Relaxed)
    }
}

/// Common acceptor surface.
pub trait Acceptor: Send + Sync {
    /// Binds and starts listening on the local address.
    fn listen(&self, local_addr: &HostPort) -> Result<()>;
    /// Closes the accepting socket; self-hops when called off-thread.
    fn close(&self);
    /// One-line description for logging.
    fn describe(&self) -> String;
}

/// A listening TCP socket driven by a selector; accepted fds become
/// [`TcpConnection`]s on the next pool selector.
pub struct TcpAcceptor {
    selector: Arc<Selector>,
    handle: SelectorHandle,
    options: TcpAcceptorOptions,
    self_weak: Weak<TcpAcceptor>,

    fd: AtomicI32,
    state: AtomicU8,
    local_address: Mutex<HostPort>,
    last_error: Mutex<Option<Error>>,

    filter_handler: HandlerSlot<FilterHandler>,
    accept_handler: HandlerSlot<TcpAcceptHandler>,
    close_handler: HandlerSlot<AcceptorCloseHandler>,

    stats: AcceptorStats,
}

impl TcpAcceptor {
    pub fn new(selector: Arc<Selector>, options: TcpAcceptorOptions) -> Arc<TcpAcceptor> {
        Arc::new_cyclic(|weak| TcpAcceptor {
            selector,
            handle: SelectorHandle::new(),
            options,
            self_weak: weak.clone(),
            fd: AtomicI32::new(INVALID_FD),
            state: AtomicU8::new(AcceptorState::Disconnected as u8),
            local_address: Mutex::new(HostPort::new()),
            last_error: Mutex::new(None),
            filter_handler: HandlerSlot::new(),
            accept_handler: HandlerSlot::new(),
            close_handler: HandlerSlot::new(),
            stats: AcceptorStats::default(),
        })
    }

    pub fn state(&self) -> AcceptorState {
        match self.state.load(Ordering::Acquire) {
            1 => AcceptorState::Listening,
            _ => AcceptorState::Disconnected,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    fn set_state(&self, state: AcceptorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The bound address; after listening on port 0 this carries the port
    /// the system chose.
    pub fn local_address(&self) -> HostPort {
        self.local_address.lock().unwrap().clone()
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

    pub fn stats(&self) -> &AcceptorStats {
        &self.stats
    }

    // ── Handler slots ───────────────────────────────────────────────

    pub fn set_filter_handler(
        &self,
        handler: impl FnMut(&HostPort) -> bool + Send + 'static,
    ) -> &Self {
        self.filter_handler.set(Box::new(handler));
        self
    }
    pub fn clear_filter_handler(&self) -> &Self {
        self.filter_handler.clear();
        self
    }
    pub fn set_accept_handler(
        &self,
        handler: impl FnMut(Arc<TcpConnection>) + Send + 'static,
    ) -> &Self {
        self.accept_handler.set(Box::new(handler));
        self
    }
    pub fn clear_accept_handler(&self) -> &Self {
        self.accept_handler.clear();
        self
    }
    pub fn set_close_handler(
        &self,
        handler: impl FnMut(Status) + Send + 'static,
    ) -> &Self {
        self.close_handler.set(Box::new(handler));
        self
    }
    pub fn clear_close_handler(&self) -> &Self {
        self.close_handler.clear();
        self
    }

    fn call_filter_handler(&self, peer: &HostPort) -> bool {
        self.filter_handler
            .call_with(|handler| handler(peer))
            .unwrap_or(true)
    }

    fn call_accept_handler(&self, connection: Arc<TcpConnection>) {
        let connection_for_handler = connection.clone();
        let called = self
            .accept_handler
            .call_with(move |handler| handler(connection_for_handler));
        if called.is_none() {
            warn!(
                "{} - no accept handler; dropping connection {}",
                self.describe(),
                connection.describe()
            );
            connection.force_close();
        }
    }

    fn call_close_handler(&self, status: Status) {
        self.close_handler.call_with(|handler| handler(status));
    }

    // ── Listen / close ──────────────────────────────────────────────

    fn listen_impl(&self, local_addr: &HostPort) -> Result<()> {
        if self.fd.load(Ordering::Acquire) != INVALID_FD {
            return Err(Error::failed_precondition(format!(
                "already listening with a valid socket: {}",
                self.describe()
            )));
        }
        if self.state() != AcceptorState::Disconnected {
            return Err(Error::failed_precondition(format!(
                "listen on a non-disconnected acceptor: {}",
                self.describe()
            )));
        }
        let (addr, addr_len) = local_addr
            .to_sockaddr()
            .map_err(|e| e.annotate("setting listening address for TCP acceptor"))?;

        let fd = unsafe {
            libc::socket(
                addr.ss_family as libc::c_int,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::last_os_error()
                .annotate(format!("socket() failed for {}", self.describe())));
        }
        self.fd.store(fd, Ordering::Release);

        let setup = (|| -> Result<()> {
            self.set_socket_options()?;
            if unsafe {
                libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len)
            } < 0
            {
                return Err(Error::last_os_error()
                    .annotate(format!("bind failed for {}", self.describe())));
            }
            if unsafe { libc::listen(fd, self.options.max_backlog as libc::c_int) } < 0 {
                return Err(Error::last_os_error()
                    .annotate(format!("listen failed for {}", self.describe())));
            }
            let me = self
                .self_weak
                .upgrade()
                .ok_or_else(|| Error::failed_precondition("acceptor is being dropped"))?;
            self.selector
                .register(me)
                .map_err(|e| e.annotate("registering acceptor with selector"))?;
            // A requested port of zero resolves to the system-chosen port.
            self.initialize_local_address()?;
            Ok(())
        })();
        if let Err(e) = setup {
            if self.handle.is_attached_to(&self.selector) {
                let _ = self.selector.unregister(self);
            }
            unsafe { libc::close(fd) };
            self.fd.store(INVALID_FD, Ordering::Release);
            return Err(e);
        }
        if self.options.detail_log {
            debug!("{} - bound and listening", self.describe());
        }
        self.set_state(AcceptorState::Listening);
        // Read events are enabled by default.
        Ok(())
    }

    /// Closes the accepting socket; self-hops when called off-thread.
    /// Shadows the identical trait methods so callers need no trait import.
    pub fn close(&self) {
        self.close_impl();
    }

    fn close_impl(&self) {
        if !self.selector.is_in_select_thread() {
            let weak = self.self_weak.clone();
            self.selector.run_in_select_loop(move || {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.close_impl();
                }
            });
            return;
        }
        if self.options.detail_log {
            debug!("{} - closing acceptor", self.describe());
        }
        self.internal_close(Ok(()));
    }

    fn internal_close(&self, status: Status) {
        if let Err(e) = &status {
            self.set_last_error(e);
        }
        let fd = self.fd.load(Ordering::Acquire);
        if fd == INVALID_FD {
            return;
        }
        // Unregister while get_fd() still answers with the live fd.
        if let Err(e) = self.selector.unregister(self) {
            warn!("{} - unregister failed: {e}", self.describe());
        }
        if unsafe { libc::close(fd) } < 0 {
            warn!("{} - close failed: {}", self.describe(), Error::last_os_error());
        }
        self.fd.store(INVALID_FD, Ordering::Release);
        self.set_state(AcceptorState::Disconnected);
        self.call_close_handler(status);
    }

    fn set_socket_options(&self) -> Result<()> {
        let fd = self.fd.load(Ordering::Acquire);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(Error::last_os_error().annotate("fcntl F_GETFL"));
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::last_os_error().annotate("fcntl F_SETFL O_NONBLOCK"));
        }
        // Without SO_REUSEADDR a closed listener parks the port in
        // TIME_WAIT and rebinding fails with EADDRINUSE for about a minute.
        let one: libc::c_int = 1;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(Error::last_os_error().annotate("setsockopt SO_REUSEADDR"));
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
        Ok(())
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

    /// Finishes an accepted fd on its assigned selector: wrap it in a
    /// connection and hand the connection to the application.
    fn initialize_accepted_connection(&self, selector: &Arc<Selector>, client_fd: RawFd) {
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        let client = TcpConnection::new(selector.clone(), self.options.connection.clone());
        if let Err(e) = client.wrap(client_fd) {
            self.stats.connection_wrap_errors.fetch_add(1, Ordering::Relaxed);
            warn!("failed to wrap incoming client fd {client_fd}: {e}");
            if unsafe { libc::close(client_fd) } < 0 {
                warn!(
                    "{} - close failed on unwrapped client fd: {}",
                    self.describe(),
                    Error::last_os_error()
                );
            }
            return;
        }
        self.stats.connections_initialized.fetch_add(1, Ordering::Relaxed);
        metrics::CONNECTIONS_ACCEPTED.increment();
        debug_assert_eq!(client.state(), crate::connection::ConnState::Connected);
        if self.options.detail_log {
            debug!(
                "{} - incoming connection accepted: {}",
                self.describe(),
                client.describe()
            );
        }
        self.call_accept_handler(client);
    }
}

impl Acceptor for TcpAcceptor {
    fn listen(&self, local_addr: &HostPort) -> Result<()> {
        self.listen_impl(local_addr)
    }

    fn close(&self) {
        self.close_impl();
    }

    fn describe(&self) -> String {
        format!(
            "TcpAcceptor [ {} state: {} fd: {} ]",
            self.local_address.lock().unwrap(),
            self.state_name(),
            self.fd.load(Ordering::Acquire)
        )
    }
}

impl Selectable for TcpAcceptor {
    fn selector_handle(&self) -> &SelectorHandle {
        &self.handle
    }

    fn handle_read_event(&self, _event: SelectorEventData) -> bool {
        // A client is waiting: perform one accept.
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let client_fd = unsafe {
            libc::accept(
                self.fd.load(Ordering::Acquire),
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if client_fd < 0 {
            let errno = crate::error::last_errno();
            if crate::error::is_retryable_errno(errno) {
                // The connecting client went away just before the accept.
                return true;
            }
            warn!(
                "{} - accept failed: {}",
                self.describe(),
                Error::from_errno(errno)
            );
            return false;
        }
        let peer = match HostPort::from_sockaddr(&addr, addr_len) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("cannot parse peer address from accepted socket: {e}");
                self.stats.peer_parse_errors.fetch_add(1, Ordering::Relaxed);
                unsafe { libc::close(client_fd) };
                return true; // keep accepting
            }
        };
        if !self.call_filter_handler(&peer) {
            if self.options.detail_log {
                debug!("{} - connection filtered out: {peer}", self.describe());
            }
            self.stats.filtered_connections.fetch_add(1, Ordering::Relaxed);
            unsafe { libc::close(client_fd) };
            return true; // keep accepting
        }
        self.stats
            .connections_accept_scheduled
            .fetch_add(1, Ordering::Relaxed);
        if self.options.detail_log {
            debug!("{} - connection accepted from {peer}", self.describe());
        }
        match self.options.pool.next_selector() {
            Some(target) => {
                let weak = self.self_weak.clone();
                let target_clone = target.clone();
                target.run_in_select_loop(move || {
                    if let Some(acceptor) = weak.upgrade() {
                        acceptor.initialize_accepted_connection(&target_clone, client_fd);
                    } else {
                        unsafe { libc::close(client_fd) };
                    }
                });
            }
            None => self.initialize_accepted_connection(&self.selector, client_fd),
        }
        true
    }

    fn handle_write_event(&self, _event: SelectorEventData) -> bool {
        warn!("{} - write event on a listening socket", self.describe());
        false
    }

    fn handle_error_event(&self, event: SelectorEventData) -> bool {
        let raw = event.raw;
        if self.selector.is_any_hang_up_event(raw) {
            if self.options.detail_log {
                debug!("{} - hang up event on listening socket", self.describe());
            }
            self.stats.hang_ups_handled.fetch_add(1, Ordering::Relaxed);
            return true; // keep accepting
        }
        if self.selector.is_error_event(raw) {
            let errno = extract_socket_errno(self.fd.load(Ordering::Acquire));
            self.stats.errors_handled.fetch_add(1, Ordering::Relaxed);
            self.internal_close(Err(Error::from_errno(errno)
                .annotate(format!("error detected on accept socket for {}", self.describe()))));
            return false; // the acceptor is gone
        }
        true
    }

    fn get_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn close(&self) {
        TcpAcceptor::close_impl(self);
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        let fd = self.fd.swap(INVALID_FD, Ordering::AcqRel);
        if fd != INVALID_FD {
            warn!("TcpAcceptor dropped while still listening (fd {fd}); closing the fd");
            unsafe { libc::close(fd) };
        }
    }
}
