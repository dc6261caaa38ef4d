//! wireline — a reactor-based TCP/TLS networking runtime for POSIX.
//!
//! wireline drives non-blocking sockets from a single-threaded selector
//! loop: readiness events, cross-thread callbacks, and cancelable alarms
//! feed a set of protocol state machines (TCP acceptor, TCP connection,
//! TLS connection) with well-defined half-close and flush semantics. A
//! worker-thread DNS resolver turns host names, including
//! internationalized ones, into address sets with round-robin picking.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use wireline::{
//!     Acceptor, HostPort, SelectorOptions, SelectorThread, TcpAcceptor,
//!     TcpAcceptorOptions,
//! };
//!
//! fn main() -> wireline::Result<()> {
//!     let server = SelectorThread::create(SelectorOptions::default())?;
//!     let acceptor = TcpAcceptor::new(server.selector().clone(), TcpAcceptorOptions::new());
//!     acceptor.set_accept_handler(|conn| {
//!         // Echo whatever arrives back to the peer.
//!         let peer = conn.clone();
//!         conn.set_read_handler(move || {
//!             let data = peer.take_input().to_vec();
//!             peer.write(&data);
//!             Ok(())
//!         });
//!         conn.set_close_handler(|_status, _directive| {});
//!     });
//!     acceptor.listen(&"127.0.0.1:7878".parse::<HostPort>()?)?;
//!     server.start();
//!     loop {
//!         std::thread::park();
//!     }
//! }
//! ```
//!
//! # Threading model
//!
//! Every connection and acceptor is pinned to one selector for its
//! lifetime; all of its event handlers and state transitions run on that
//! selector's loop thread. `run_in_select_loop`, the alarm calls,
//! `make_loop_exit`, and the DNS `resolve_async` are the cross-thread
//! entry points; the connection close calls hop to the loop thread on
//! their own.

// ── Modules ─────────────────────────────────────────────────────────────
pub mod acceptor;
pub mod address;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod poller;
pub mod selectable;
pub mod selector;
pub mod timeouter;
pub mod tls;

// ── Re-exports: addresses ───────────────────────────────────────────────

/// Host/ip/port/scope endpoint.
pub use address::HostPort;
/// 16-byte network-order IP address (IPv4 as v4-mapped).
pub use address::IpAddress;

// ── Re-exports: errors ──────────────────────────────────────────────────

/// Runtime error with a canonical kind.
pub use error::Error;
/// Canonical error kinds.
pub use error::ErrorKind;
/// Crate-wide result alias.
pub use error::Result;
/// Status delivered to close handlers.
pub use error::Status;

// ── Re-exports: reactor ─────────────────────────────────────────────────

/// Alarm identifier returned by `register_alarm`.
pub use selector::AlarmId;
/// The reactor event loop.
pub use selector::Selector;
/// A selector driven by an owned thread.
pub use selector::SelectorThread;
/// Readiness event payload handed to selectables.
pub use poller::SelectorEventData;
/// Contract implemented by every fd-owning object.
pub use selectable::Selectable;
/// Back pointer slot embedded in each selectable.
pub use selectable::SelectorHandle;
/// Per-owner named timeouts over selector alarms.
pub use timeouter::Timeouter;

// ── Re-exports: buffers ─────────────────────────────────────────────────

/// Chunked byte buffer used for socket I/O.
pub use buffer::ChunkBuffer;

// ── Re-exports: connections ─────────────────────────────────────────────

/// Which half of a connection a close notification concerns.
pub use connection::CloseDirective;
/// Connection lifecycle states.
pub use connection::ConnState;
/// Shared surface of TCP and TLS connections.
pub use connection::Connection;
/// Non-blocking TCP connection state machine.
pub use connection::TcpConnection;

// ── Re-exports: acceptors ───────────────────────────────────────────────

/// Common acceptor surface.
pub use acceptor::Acceptor;
/// Round-robin pool of selector threads for accepted connections.
pub use acceptor::AcceptorPool;
/// Acceptor lifecycle states.
pub use acceptor::AcceptorState;
/// Listening TCP socket dispatching accepted fds.
pub use acceptor::TcpAcceptor;

// ── Re-exports: TLS ─────────────────────────────────────────────────────

/// TLS acceptor surfacing connections after their handshake.
pub use tls::SslAcceptor;
/// TLS session over a TCP connection.
pub use tls::SslConnection;
/// Builds a TLS context from PEM files.
pub use tls::ssl_context_from_pem_files;

// ── Re-exports: DNS ─────────────────────────────────────────────────────

/// Resolved addresses for one host with round-robin pickers.
pub use dns::DnsHostInfo;
/// Worker-thread DNS resolver.
pub use dns::DnsResolver;
/// IDNA-aware derivation of the name sent to DNS.
pub use dns::get_dns_resolve_name;

// ── Re-exports: configuration ───────────────────────────────────────────

/// DNS resolver pool parameters.
pub use config::DnsResolverOptions;
/// Readiness backend choice.
pub use config::LoopType;
/// Selector loop parameters.
pub use config::SelectorOptions;
/// TLS acceptor parameters.
pub use config::SslAcceptorOptions;
/// TLS connection parameters.
pub use config::SslConnectionOptions;
/// TCP acceptor parameters.
pub use config::TcpAcceptorOptions;
/// TCP connection parameters.
pub use config::TcpConnectionOptions;
