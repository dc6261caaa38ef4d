//! TLS connections layered over TCP with an in-memory ciphertext pump.
//!
//! [`SslConnection`] owns a client [`TcpConnection`] and an OpenSSL session
//! bound to a memory transport: inbound TCP bytes feed the transport's
//! ciphertext queue, `ssl_read`/`ssl_write` move plaintext across it, and
//! whatever ciphertext the session produces is drained back into the TCP
//! output buffer. The handshake is sequenced through the same pump, and the
//! read/write cross-blocking flags keep partial TLS records intact:
//! `ssl_write` is never retried with new data while a write is blocked on
//! reading more ciphertext.
//!
//! [`SslAcceptor`] wraps each accepted TCP connection and surfaces it to
//! the application only after its handshake completes.

use std::io::{self, Read, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{debug, warn};
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslMode, SslStream,
    SslVerifyMode,
};

use crate::acceptor::{Acceptor, TcpAcceptor};
use crate::address::HostPort;
use crate::config::{SslAcceptorOptions, SslConnectionOptions};
use crate::connection::{
    CloseDirective, Connection, ConnState, HandlerSlot, HandlerSlots, TcpConnection,
};
use crate::error::{Error, Result, Status};
use crate::selector::Selector;

/// Builds a TLS context from PEM certificate and private key files, with
/// the partial-write modes the connection relies on. The result is handed
/// to [`SslConnectionOptions::new`].
pub fn ssl_context_from_pem_files(certificate: &str, private_key: &str) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls())
        .map_err(|e| Error::internal(format!("SSL_CTX_new failed: {e}")))?;
    builder
        .set_certificate_chain_file(certificate)
        .map_err(|e| {
            Error::internal(format!("loading certificate `{certificate}` failed: {e}"))
        })?;
    builder
        .set_private_key_file(private_key, SslFiletype::PEM)
        .map_err(|e| Error::internal(format!("loading private key `{private_key}` failed: {e}")))?;
    builder
        .check_private_key()
        .map_err(|e| Error::internal(format!("private key does not match certificate: {e}")))?;
    set_context_modes(&mut builder);
    Ok(builder.build())
}

/// Applies the write modes every context used with [`SslConnection`] needs:
/// partial writes and moving write buffers, since the output buffer's
/// chunks shift between retries.
pub fn set_context_modes(builder: &mut SslContextBuilder) {
    builder.set_mode(SslMode::ENABLE_PARTIAL_WRITE | SslMode::ACCEPT_MOVING_WRITE_BUFFER);
}

// ── Memory transport ────────────────────────────────────────────────────

/// The in-memory byte pump the OpenSSL session reads and writes.
/// `incoming` holds ciphertext received from TCP; `outgoing` collects
/// ciphertext to be moved into the TCP output buffer.
struct BioBridge {
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
}

impl BioBridge {
    fn new() -> BioBridge {
        BioBridge {
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    fn push_incoming(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    fn take_outgoing(&mut self) -> Vec<u8> {
        mem::take(&mut self.outgoing)
    }
}

impl Read for BioBridge {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.incoming.len());
        buf[..n].copy_from_slice(&self.incoming[..n]);
        self.incoming.drain(..n);
        Ok(n)
    }
}

impl Write for BioBridge {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── TLS connection ──────────────────────────────────────────────────────

/// A TLS session over a TCP connection, driven entirely by the TCP
/// connection's handlers.
pub struct SslConnection {
    selector: Arc<Selector>,
    options: SslConnectionOptions,
    self_weak: Weak<SslConnection>,

    tcp: Mutex<Option<Arc<TcpConnection>>>,
    stream: Mutex<Option<SslStream<BioBridge>>>,

    state: AtomicU8,
    last_error: Mutex<Option<Error>>,
    inbuf: Mutex<crate::buffer::ChunkBuffer>,
    outbuf: Mutex<crate::buffer::ChunkBuffer>,
    handlers: HandlerSlots,

    is_server_side: AtomicBool,
    handshake_finished: AtomicBool,

    // Sequencing flags for complete TLS records across the pump.
    read_blocked: AtomicBool,
    read_blocked_on_write: AtomicBool,
    write_blocked_on_read: AtomicBool,

    ssl_in_count: AtomicU64,
    ssl_out_count: AtomicU64,

    // Raised by the per-connection verification callback; fatal for the
    // handshake.
    verification_failed: Arc<AtomicBool>,
}

impl SslConnection {
    pub fn new(selector: Arc<Selector>, options: SslConnectionOptions) -> Arc<SslConnection> {
        Arc::new_cyclic(|weak| SslConnection {
            selector,
            options,
            self_weak: weak.clone(),
            tcp: Mutex::new(None),
            stream: Mutex::new(None),
            state: AtomicU8::new(ConnState::Disconnected as u8),
            last_error: Mutex::new(None),
            inbuf: Mutex::new(crate::buffer::ChunkBuffer::new()),
            outbuf: Mutex::new(crate::buffer::ChunkBuffer::new()),
            handlers: HandlerSlots::new(),
            is_server_side: AtomicBool::new(false),
            handshake_finished: AtomicBool::new(false),
            read_blocked: AtomicBool::new(false),
            read_blocked_on_write: AtomicBool::new(false),
            write_blocked_on_read: AtomicBool::new(false),
            ssl_in_count: AtomicU64::new(0),
            ssl_out_count: AtomicU64::new(0),
            verification_failed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().clone()
    }

    fn set_last_error(&self, error: &Error) {
        if self.options.tcp.detail_log {
            debug!("{} - updating error to: {error}", self.describe());
        }
        let mut last = self.last_error.lock().unwrap();
        if last.is_none() {
            *last = Some(error.clone());
        }
    }

    pub fn is_server_side(&self) -> bool {
        self.is_server_side.load(Ordering::Acquire)
    }

    pub fn handshake_finished(&self) -> bool {
        self.handshake_finished.load(Ordering::Acquire)
    }

    /// Ciphertext bytes fed into the session from TCP.
    pub fn ssl_bytes_in(&self) -> u64 {
        self.ssl_in_count.load(Ordering::Relaxed)
    }

    /// Ciphertext bytes the session produced for TCP.
    pub fn ssl_bytes_out(&self) -> u64 {
        self.ssl_out_count.load(Ordering::Relaxed)
    }

    fn tcp(&self) -> Option<Arc<TcpConnection>> {
        self.tcp.lock().unwrap().clone()
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
        if !self.handlers.call_close(status, directive) {
            if self.options.tcp.detail_log {
                debug!("{} - no close handler set", self.describe());
            }
            self.flush_and_close_impl();
        }
    }

    // ── Buffers ─────────────────────────────────────────────────────

    /// Takes the decrypted bytes received so far.
    pub fn take_input(&self) -> crate::buffer::ChunkBuffer {
        self.inbuf.lock().unwrap().take_all()
    }

    pub fn input_size(&self) -> usize {
        self.inbuf.lock().unwrap().len()
    }

    /// Appends plaintext for encryption and requests write events on the
    /// underlying TCP connection. Loop-thread only.
    pub fn write(&self, data: &[u8]) {
        self.outbuf.lock().unwrap().append(data);
        if let Err(e) = self.request_write_events(true) {
            warn!("{} - cannot enable write events: {e}", self.describe());
        }
    }

    pub fn write_bytes(&self, data: Bytes) {
        self.outbuf.lock().unwrap().append_bytes(data);
        if let Err(e) = self.request_write_events(true) {
            warn!("{} - cannot enable write events: {e}", self.describe());
        }
    }

    // ── Setup ───────────────────────────────────────────────────────

    /// Adopts an established TCP connection (server side); how the TLS
    /// acceptor finishes an accept. Takes over all TCP handlers and starts
    /// waiting for the client hello.
    pub(crate) fn wrap(&self, tcp: Arc<TcpConnection>) {
        debug_assert!(self.tcp.lock().unwrap().is_none());
        self.set_tcp_connection_handlers(&tcp);
        *self.tcp.lock().unwrap() = Some(tcp);
        self.set_state(ConnState::Connecting);
        self.is_server_side.store(true, Ordering::Release);
        // Resume from the point where TCP is connected and the handshake
        // starts.
        self.tcp_connect_handler();
    }

    fn set_tcp_connection_handlers(&self, tcp: &Arc<TcpConnection>) {
        let weak = self.self_weak.clone();
        tcp.set_connect_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.tcp_connect_handler();
            }
        });
        let weak = self.self_weak.clone();
        tcp.set_read_handler(move || match weak.upgrade() {
            Some(conn) => conn.tcp_read_handler(),
            None => Ok(()),
        });
        let weak = self.self_weak.clone();
        tcp.set_write_handler(move || match weak.upgrade() {
            Some(conn) => conn.tcp_write_handler(),
            None => Ok(()),
        });
        let weak = self.self_weak.clone();
        tcp.set_close_handler(move |status, directive| {
            if let Some(conn) = weak.upgrade() {
                conn.tcp_close_handler(status, directive);
            }
        });
    }

    fn ssl_initialize(&self, is_server: bool) -> Result<()> {
        debug_assert!(self.stream.lock().unwrap().is_none());
        self.verification_failed.store(false, Ordering::Release);
        let mut ssl = Ssl::new(&self.options.ssl_context)
            .map_err(|e| Error::internal(format!("SSL_new failed: {e}")))?;
        let verify_mode = ssl.verify_mode();
        if verify_mode != SslVerifyMode::NONE {
            // The closure is installed per connection, so the verification
            // outcome can be latched directly on this connection's flag.
            let flag = self.verification_failed.clone();
            ssl.set_verify_callback(verify_mode, move |preverified, _store_ctx| {
                if !preverified {
                    flag.store(true, Ordering::Release);
                }
                preverified
            });
        }
        if is_server {
            ssl.set_accept_state();
        } else {
            ssl.set_connect_state();
        }
        let stream = SslStream::new(ssl, BioBridge::new())
            .map_err(|e| Error::internal(format!("creating SSL stream failed: {e}")))?;
        *self.stream.lock().unwrap() = Some(stream);
        Ok(())
    }

    fn ssl_clear(&self) {
        // Dropping the stream frees the session and both transport queues.
        // The context belongs to the application and stays untouched.
        *self.stream.lock().unwrap() = None;
    }

    // ── TCP-side handlers ───────────────────────────────────────────

    fn tcp_connect_handler(&self) {
        if let Err(e) = self.ssl_initialize(self.is_server_side()) {
            self.set_last_error(&e);
            self.force_close_impl();
            return;
        }
        // Still Connecting; the next TCP write event steps the handshake.
    }

    fn tcp_read_handler(&self) -> Result<()> {
        let Some(tcp) = self.tcp() else {
            return Ok(());
        };
        // TCP ciphertext feeds the session's inbound queue.
        let data = tcp.take_input();
        if !data.is_empty() {
            let mut guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_mut() else {
                return Ok(());
            };
            for chunk in data.chunks() {
                stream.get_mut().push_incoming(chunk);
            }
            self.ssl_in_count.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        if self.state() == ConnState::Connecting {
            return self.ssl_handshake();
        }
        if self.write_blocked_on_read.load(Ordering::Acquire) {
            // The stalled write path can resume now that ciphertext arrived.
            return self.request_write_events(true);
        }

        // Decrypt everything available into the plaintext input buffer.
        let mut scratch = vec![0u8; self.options.tcp.block_size];
        loop {
            let result = {
                let mut guard = self.stream.lock().unwrap();
                let Some(stream) = guard.as_mut() else { break };
                stream.ssl_read(&mut scratch)
            };
            self.read_blocked.store(false, Ordering::Release);
            self.read_blocked_on_write.store(false, Ordering::Release);
            match result {
                Ok(0) => break,
                Ok(n) => {
                    self.inbuf.lock().unwrap().append(&scratch[..n]);
                }
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ => {
                        self.read_blocked.store(true, Ordering::Release);
                        break;
                    }
                    ErrorCode::WANT_WRITE => {
                        self.read_blocked_on_write.store(true, Ordering::Release);
                        self.request_write_events(true)?;
                        break;
                    }
                    ErrorCode::ZERO_RETURN => {
                        // Peer sent close_notify; wind down gracefully.
                        self.flush_and_close_impl();
                        return Ok(());
                    }
                    _ => {
                        return Err(Error::internal(format!(
                            "SSL_read fatal for {}: {e}",
                            self.describe()
                        )));
                    }
                },
            }
        }
        // Reads can produce ciphertext (session tickets, key updates);
        // get it moving toward the peer.
        let pending_out = {
            let guard = self.stream.lock().unwrap();
            guard.as_ref().map_or(0, |s| s.get_ref().outgoing.len())
        };
        if pending_out > 0 {
            self.request_write_events(true)?;
        }
        if self.read_blocked.load(Ordering::Acquire) && !self.outbuf.lock().unwrap().is_empty() {
            // Writing stopped while a read was blocked; resume it.
            self.request_write_events(true)?;
        }
        if self.state() == ConnState::Flushing {
            // Discard input while waiting to shut down.
            self.inbuf.lock().unwrap().clear();
        }
        if !self.inbuf.lock().unwrap().is_empty() {
            return self
                .call_read_handler()
                .map_err(|e| e.annotate("TLS connection read handler"));
        }
        Ok(())
    }

    fn tcp_write_handler(&self) -> Result<()> {
        if self.state() == ConnState::Connecting {
            self.ssl_handshake()
                .map_err(|e| e.annotate("stepping TLS handshake on write"))?;
        } else if !self.read_blocked.load(Ordering::Acquire)
            && !self.read_blocked_on_write.load(Ordering::Acquire)
        {
            // Let the application refill the plaintext buffer, then push it
            // through the session. Skipped entirely while a partial
            // ssl_read is in progress; the read path re-enables writing.
            if self.state() == ConnState::Connected {
                self.call_write_handler()
                    .map_err(|e| e.annotate("TLS connection write handler"))?;
            }
            let mut out = self.outbuf.lock().unwrap().take_all();
            let mut fatal: Option<Error> = None;
            while !out.is_empty() {
                let result = {
                    let mut guard = self.stream.lock().unwrap();
                    let Some(stream) = guard.as_mut() else { break };
                    let Some(chunk) = out.first_chunk() else { break };
                    stream.ssl_write(chunk)
                };
                self.write_blocked_on_read.store(false, Ordering::Release);
                match result {
                    Ok(n) => out.remove_prefix(n),
                    Err(e) => match e.code() {
                        ErrorCode::WANT_READ => {
                            // A partial record needs more inbound ciphertext.
                            // Keep the unwritten plaintext; never feed new
                            // data until the read path unblocks us.
                            self.write_blocked_on_read.store(true, Ordering::Release);
                            break;
                        }
                        ErrorCode::WANT_WRITE => {
                            // The memory transport accepts everything; seen
                            // only transiently.
                            break;
                        }
                        _ => {
                            fatal = Some(Error::internal(format!(
                                "SSL_write fatal for {}: {e}",
                                self.describe()
                            )));
                            break;
                        }
                    },
                }
            }
            if !out.is_empty() {
                // Put the remainder back in front of anything the
                // application appended meanwhile.
                let mut outbuf = self.outbuf.lock().unwrap();
                let appended = outbuf.take_all();
                out.append_buffer(appended);
                *outbuf = out;
            }
            if let Some(e) = fatal {
                // Move any alert bytes toward the peer before failing.
                self.flush_outgoing_to_tcp();
                return Err(e);
            }
        }

        // Ciphertext produced by any of the above moves to the TCP buffer.
        self.flush_outgoing_to_tcp();

        if self.state() == ConnState::Flushing && self.outbuf.lock().unwrap().is_empty() {
            // Everything is out; send close_notify and flush the TCP side.
            self.ssl_shutdown();
            if let Some(tcp) = self.tcp() {
                self.selector.run_in_select_loop(move || tcp.flush_and_close());
            }
        }
        Ok(())
    }

    fn tcp_close_handler(&self, status: Status, directive: CloseDirective) {
        if let Err(e) = &status {
            self.set_last_error(e);
        }
        if directive != CloseDirective::ReadWrite {
            // A half close; answer with our close_notify and keep draining.
            self.ssl_shutdown();
            return;
        }
        self.set_state(ConnState::Disconnected);
        self.call_close_handler(status, directive);
    }

    // ── Handshake and shutdown ──────────────────────────────────────

    fn ssl_handshake(&self) -> Result<()> {
        if self.handshake_finished() {
            return Ok(());
        }
        let init_finished = {
            let guard = self.stream.lock().unwrap();
            match guard.as_ref() {
                Some(stream) => stream.ssl().is_init_finished(),
                None => return Ok(()),
            }
        };
        if init_finished {
            // Our endpoint is done, but the final flight may still sit in
            // the outbound queue; surface the connect only once it drained.
            let pending = {
                let guard = self.stream.lock().unwrap();
                guard.as_ref().map_or(0, |s| s.get_ref().outgoing.len())
            };
            if pending > 0 {
                return self.request_write_events(true);
            }
            self.handshake_finished.store(true, Ordering::Release);
            self.set_state(ConnState::Connected);
            if self.options.tcp.detail_log {
                debug!("{} - TLS handshake completed", self.describe());
            }
            let weak = self.self_weak.clone();
            self.selector.run_in_select_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.call_connect_handler();
                }
            });
            return Ok(());
        }
        let result = {
            let mut guard = self.stream.lock().unwrap();
            match guard.as_mut() {
                Some(stream) => stream.do_handshake(),
                None => return Ok(()),
            }
        };
        if self.verification_failed.load(Ordering::Acquire) {
            return Err(Error::internal(format!(
                "certificate verification failed for {}",
                self.describe()
            )));
        }
        match result {
            // Completed here; the write path drains the final flight and
            // re-enters the finished branch above.
            Ok(()) => self.request_write_events(true),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                    // In progress; keep the outbound queue draining.
                    self.request_write_events(true)
                }
                _ => Err(Error::internal(format!(
                    "SSL_do_handshake failed for {}: {e}",
                    self.describe()
                ))),
            },
        }
    }

    fn ssl_shutdown(&self) {
        {
            let mut guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_mut() else { return };
            match stream.shutdown() {
                Ok(_) => {}
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {}
                    _ => warn!("{} - SSL_shutdown error: {e}", self.describe()),
                },
            }
        }
        // The close_notify record rides the normal TCP flush path.
        self.flush_outgoing_to_tcp();
    }

    /// Moves ciphertext produced by the session into the TCP output buffer
    /// and requests TCP write events.
    fn flush_outgoing_to_tcp(&self) {
        let out = {
            let mut guard = self.stream.lock().unwrap();
            match guard.as_mut() {
                Some(stream) => stream.get_mut().take_outgoing(),
                None => return,
            }
        };
        if out.is_empty() {
            return;
        }
        self.ssl_out_count.fetch_add(out.len() as u64, Ordering::Relaxed);
        if let Some(tcp) = self.tcp() {
            tcp.write_bytes(Bytes::from(out));
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
        self.set_state(ConnState::Flushing);
        if let Err(e) = self.request_write_events(true) {
            warn!("{} - cannot enable write events: {e}", self.describe());
        }
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
        self.ssl_clear();
        if let Some(tcp) = self.tcp() {
            tcp.force_close();
        }
    }
}

impl Connection for SslConnection {
    fn connect(&self, remote: &HostPort) -> Result<()> {
        if self.tcp.lock().unwrap().is_some() {
            return Err(Error::failed_precondition(
                "TLS connection already has a TCP connection",
            ));
        }
        let tcp = TcpConnection::new(self.selector.clone(), self.options.tcp.clone());
        self.set_tcp_connection_handlers(&tcp);
        *self.tcp.lock().unwrap() = Some(tcp.clone());
        self.set_state(ConnState::Connecting);
        self.is_server_side.store(false, Ordering::Release);
        if let Err(e) = tcp.connect(remote) {
            *self.tcp.lock().unwrap() = None;
            self.set_state(ConnState::Disconnected);
            return Err(e.annotate("for underlying TCP connection of TLS connection"));
        }
        Ok(())
    }

    fn flush_and_close(&self) {
        self.flush_and_close_impl();
    }

    fn force_close(&self) {
        self.force_close_impl();
    }

    fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        match self.tcp() {
            Some(tcp) => tcp.set_send_buffer_size(size),
            None => Ok(()),
        }
    }

    fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        match self.tcp() {
            Some(tcp) => tcp.set_recv_buffer_size(size),
            None => Ok(()),
        }
    }

    fn request_read_events(&self, enable: bool) -> Result<()> {
        match self.tcp() {
            Some(tcp) => tcp.request_read_events(enable),
            None => Ok(()),
        }
    }

    fn request_write_events(&self, enable: bool) -> Result<()> {
        match self.tcp() {
            Some(tcp) => tcp.request_write_events(enable),
            None => Ok(()),
        }
    }

    fn local_address(&self) -> HostPort {
        self.tcp().map(|tcp| tcp.local_address()).unwrap_or_default()
    }

    fn remote_address(&self) -> HostPort {
        self.tcp().map(|tcp| tcp.remote_address()).unwrap_or_default()
    }

    fn state(&self) -> ConnState {
        SslConnection::state(self)
    }

    fn describe(&self) -> String {
        let prefix = format!(
            "SslConnection [ state: {} server_side: {} handshaked: {}",
            self.state().name(),
            self.is_server_side(),
            self.handshake_finished()
        );
        match self.tcp() {
            Some(tcp) => format!("{prefix} - {} ]", tcp.describe()),
            None => format!("{prefix} - no tcp connection ]"),
        }
    }
}

// ── TLS acceptor ────────────────────────────────────────────────────────

/// Handler receiving each accepted TLS connection once its handshake
/// completed.
pub type SslAcceptHandler = Box<dyn FnMut(Arc<SslConnection>) + Send>;

/// A TLS server socket: a [`TcpAcceptor`] whose accepted connections are
/// wrapped in [`SslConnection`]s and surfaced only after the handshake.
pub struct SslAcceptor {
    options: SslAcceptorOptions,
    tcp_acceptor: Arc<TcpAcceptor>,
    self_weak: Weak<SslAcceptor>,

    filter_handler: HandlerSlot<Box<dyn FnMut(&HostPort) -> bool + Send>>,
    accept_handler: HandlerSlot<SslAcceptHandler>,
}

impl SslAcceptor {
    pub fn new(selector: Arc<Selector>, options: SslAcceptorOptions) -> Arc<SslAcceptor> {
        let acceptor = Arc::new_cyclic(|weak: &Weak<SslAcceptor>| SslAcceptor {
            tcp_acceptor: TcpAcceptor::new(selector, options.tcp_acceptor.clone()),
            options,
            self_weak: weak.clone(),
            filter_handler: HandlerSlot::new(),
            accept_handler: HandlerSlot::new(),
        });
        let weak = acceptor.self_weak.clone();
        acceptor.tcp_acceptor.set_filter_handler(move |peer| {
            weak.upgrade().is_some_and(|a| a.tcp_filter_handler(peer))
        });
        let weak = acceptor.self_weak.clone();
        acceptor.tcp_acceptor.set_accept_handler(move |connection| {
            if let Some(a) = weak.upgrade() {
                a.tcp_accept_handler(connection);
            } else {
                connection.force_close();
            }
        });
        acceptor
    }

    pub fn local_address(&self) -> HostPort {
        self.tcp_acceptor.local_address()
    }

    pub fn stats(&self) -> &crate::acceptor::AcceptorStats {
        self.tcp_acceptor.stats()
    }

    pub fn set_filter_handler(
        &self,
        handler: impl FnMut(&HostPort) -> bool + Send + 'static,
    ) -> &Self {
        self.filter_handler.set(Box::new(handler));
        self
    }

    pub fn set_accept_handler(
        &self,
        handler: impl FnMut(Arc<SslConnection>) + Send + 'static,
    ) -> &Self {
        self.accept_handler.set(Box::new(handler));
        self
    }

    pub fn set_close_handler(&self, handler: impl FnMut(Status) + Send + 'static) -> &Self {
        self.tcp_acceptor.set_close_handler(handler);
        self
    }

    /// Closes the accepting socket.
    pub fn close(&self) {
        self.tcp_acceptor.close();
    }

    fn ssl_check_context(&self) -> Result<()> {
        let ctx = &self.options.ssl.ssl_context;
        if ctx.certificate().is_none() || ctx.private_key().is_none() {
            if !self.options.ssl.allow_unchecked_private_key {
                return Err(Error::failed_precondition(
                    "TLS acceptor context has no certificate / private key pair",
                ));
            }
            warn!("no certificate set for the TLS acceptor context");
        }
        Ok(())
    }

    fn tcp_filter_handler(&self, peer: &HostPort) -> bool {
        self.filter_handler
            .call_with(|handler| handler(peer))
            .unwrap_or(true)
    }

    /// Wraps an accepted TCP connection in a TLS connection with temporary
    /// handlers; the application sees it only once the handshake completes.
    fn tcp_accept_handler(&self, connection: Arc<TcpConnection>) {
        let ssl_connection =
            SslConnection::new(connection.selector().clone(), self.options.ssl.clone());
        ssl_connection.wrap(connection);
        let acceptor = self.self_weak.clone();
        let conn = ssl_connection.clone();
        ssl_connection.set_connect_handler(move || {
            if let Some(a) = acceptor.upgrade() {
                a.ssl_connection_connect_handler(&conn);
            }
        });
        let acceptor = self.self_weak.clone();
        let conn = ssl_connection.clone();
        ssl_connection.set_close_handler(move |status, directive| {
            if let Some(a) = acceptor.upgrade() {
                a.ssl_connection_close_handler(&conn, status, directive);
            }
        });
        // The temporary handlers keep the connection alive until the
        // handshake settles one way or the other.
    }

    fn ssl_connection_connect_handler(&self, ssl_connection: &Arc<SslConnection>) {
        // Handshake done: detach our temporary handlers so the application
        // can install its own, and hand the connection over.
        ssl_connection.clear_all_handlers();
        let conn = ssl_connection.clone();
        let called = self.accept_handler.call_with(move |handler| handler(conn));
        if called.is_none() {
            warn!(
                "{} - no accept handler; dropping TLS connection",
                self.describe()
            );
            ssl_connection.force_close();
        }
    }

    fn ssl_connection_close_handler(
        &self,
        ssl_connection: &Arc<SslConnection>,
        status: Status,
        directive: CloseDirective,
    ) {
        if directive != CloseDirective::ReadWrite {
            return; // partial close; the connection is still winding down
        }
        warn!(
            "TLS connection closed in acceptor before its handshake completed: {:?}",
            status.err()
        );
        // Dropping the handlers releases the connection; nothing else owns
        // it yet.
        ssl_connection.clear_all_handlers();
    }
}

impl Acceptor for SslAcceptor {
    fn listen(&self, local_addr: &HostPort) -> Result<()> {
        self.ssl_check_context()?;
        self.tcp_acceptor.listen(local_addr)
    }

    fn close(&self) {
        SslAcceptor::close(self);
    }

    fn describe(&self) -> String {
        format!("[SSL] {}", self.tcp_acceptor.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    use crate::config::{SelectorOptions, TcpConnectionOptions};

    #[test]
    fn bio_bridge_pumps_bytes() {
        let mut bridge = BioBridge::new();
        let mut buf = [0u8; 4];
        // Empty inbound queue reads as would-block.
        assert_eq!(
            bridge.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        bridge.push_incoming(b"abcdef");
        assert_eq!(bridge.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(bridge.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");

        assert_eq!(bridge.write(b"xyz").unwrap(), 3);
        assert_eq!(bridge.take_outgoing(), b"xyz");
        assert!(bridge.take_outgoing().is_empty());
    }

    fn test_server_context() -> SslContext {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = {
            let mut bn = BigNum::new().unwrap();
            bn.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
            bn.to_asn1_integer().unwrap()
        };
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let certificate = builder.build();

        let mut ctx = SslContextBuilder::new(SslMethod::tls()).unwrap();
        ctx.set_certificate(&certificate).unwrap();
        ctx.set_private_key(&key).unwrap();
        set_context_modes(&mut ctx);
        ctx.build()
    }

    fn test_client_context() -> SslContext {
        let mut ctx = SslContextBuilder::new(SslMethod::tls()).unwrap();
        ctx.set_verify(SslVerifyMode::NONE);
        set_context_modes(&mut ctx);
        ctx.build()
    }

    /// Drives the plaintext pump into a write-blocked-on-read stall: the
    /// session still needs inbound ciphertext before it can encrypt, so
    /// the queued chunk stays put and plaintext arriving meanwhile queues
    /// behind it — `SSL_write` sees no new data until the read side
    /// delivers what the stall waits on.
    #[test]
    fn ssl_write_never_takes_new_data_while_blocked_on_read() {
        let selector = Selector::create(SelectorOptions::default()).unwrap();
        let conn = SslConnection::new(
            selector.clone(),
            SslConnectionOptions::new(test_client_context()),
        );
        // A detached TCP connection collects the ciphertext the pump
        // flushes.
        let tcp = TcpConnection::new(selector, TcpConnectionOptions::default());
        *conn.tcp.lock().unwrap() = Some(tcp.clone());
        conn.ssl_initialize(false).unwrap();
        // Force the application pump to run while the session has not
        // handshaken; its first ssl_write must come back wanting to read.
        conn.set_state(ConnState::Connected);
        conn.set_write_handler(|| Ok(()));
        conn.outbuf.lock().unwrap().append(b"first");

        conn.tcp_write_handler().unwrap();
        assert!(conn.write_blocked_on_read.load(Ordering::SeqCst));
        assert_eq!(conn.outbuf.lock().unwrap().to_vec(), b"first");
        // The stall emitted the client hello and nothing else.
        let client_hello = tcp.take_output().to_vec();
        assert!(!client_hello.is_empty());

        // New application data while blocked: re-running the pump keeps it
        // queued behind the retained chunk, nothing is consumed, and no
        // new records appear.
        conn.outbuf.lock().unwrap().append(b"second");
        conn.tcp_write_handler().unwrap();
        assert!(conn.write_blocked_on_read.load(Ordering::SeqCst));
        assert_eq!(conn.outbuf.lock().unwrap().to_vec(), b"firstsecond");
        assert!(
            tcp.take_output().is_empty(),
            "no plaintext may reach SSL_write while blocked on read"
        );

        // A server session supplies the ciphertext the write path waits
        // on; once it lands, the pump drains in order and the flag clears.
        let mut server = {
            let mut ssl = Ssl::new(&test_server_context()).unwrap();
            ssl.set_accept_state();
            SslStream::new(ssl, BioBridge::new()).unwrap()
        };
        server.get_mut().push_incoming(&client_hello);

        let mut rounds = 0;
        while conn.write_blocked_on_read.load(Ordering::SeqCst) {
            rounds += 1;
            assert!(rounds < 10, "handshake did not unblock the writer");
            match server.do_handshake() {
                Ok(()) => {}
                Err(e) if matches!(e.code(), ErrorCode::WANT_READ | ErrorCode::WANT_WRITE) => {}
                Err(e) => panic!("server handshake failed: {e}"),
            }
            let to_client = server.get_mut().take_outgoing();
            if !to_client.is_empty() {
                let mut guard = conn.stream.lock().unwrap();
                guard.as_mut().unwrap().get_mut().push_incoming(&to_client);
            }
            conn.tcp_write_handler().unwrap();
            let to_server = tcp.take_output().to_vec();
            if !to_server.is_empty() {
                server.get_mut().push_incoming(&to_server);
            }
        }
        assert!(conn.outbuf.lock().unwrap().is_empty());

        // The retained chunk went out before the one queued while blocked.
        let mut plaintext = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match server.ssl_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => plaintext.extend_from_slice(&buf[..n]),
                Err(e) if e.code() == ErrorCode::WANT_READ => break,
                Err(e) => panic!("server read failed: {e}"),
            }
        }
        assert_eq!(plaintext, b"firstsecond");
    }
}
