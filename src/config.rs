//! Tunable parameters for every runtime component.
//!
//! Each options struct carries sane defaults and chainable setters; pass it
//! at construction time. None of the values can be changed after the owning
//! object is created.

use std::time::Duration;

use openssl::ssl::SslContext;

use crate::acceptor::AcceptorPool;
use crate::error::{Error, Result};

/// Which readiness backend a selector uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopType {
    /// Linux epoll; the default.
    #[default]
    Epoll,
    /// Portable poll, capped at [`crate::poller::MAX_POLL_FDS`] fds.
    Poll,
}

/// Parameters for a [`crate::Selector`].
#[derive(Debug, Clone)]
pub struct SelectorOptions {
    /// Maximum readiness events accepted per loop step.
    pub max_events_per_step: usize,
    /// Maximum scheduled callbacks run per loop step.
    pub max_num_callbacks_per_event: usize,
    /// Wall-time cap on one round of scheduled callbacks.
    pub callbacks_timeout_per_event: Duration,
    /// Upper bound on a quiescent wait in the backend.
    pub default_loop_timeout: Duration,
    /// Readiness backend to use.
    pub loop_type: LoopType,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        SelectorOptions {
            max_events_per_step: 128,
            max_num_callbacks_per_event: 64,
            callbacks_timeout_per_event: Duration::from_secs(1),
            default_loop_timeout: Duration::from_secs(1),
            loop_type: LoopType::default(),
        }
    }
}

impl SelectorOptions {
    pub fn set_max_events_per_step(mut self, value: usize) -> Self {
        self.max_events_per_step = value;
        self
    }
    pub fn set_max_num_callbacks_per_event(mut self, value: usize) -> Self {
        self.max_num_callbacks_per_event = value;
        self
    }
    pub fn set_callbacks_timeout_per_event(mut self, value: Duration) -> Self {
        self.callbacks_timeout_per_event = value;
        self
    }
    pub fn set_default_loop_timeout(mut self, value: Duration) -> Self {
        self.default_loop_timeout = value;
        self
    }
    pub fn set_loop_type(mut self, value: LoopType) -> Self {
        self.loop_type = value;
        self
    }
}

/// Parameters for a [`crate::TcpConnection`].
#[derive(Debug, Clone)]
pub struct TcpConnectionOptions {
    /// SO_SNDBUF for the socket, if set.
    pub send_buffer_size: Option<usize>,
    /// SO_RCVBUF for the socket, if set.
    pub recv_buffer_size: Option<usize>,
    /// Per-operation cap on buffered reads.
    pub read_limit: Option<usize>,
    /// Per-operation cap on buffered writes.
    pub write_limit: Option<usize>,
    /// Chunk size for buffered reads and TLS record pumping.
    pub block_size: usize,
    /// How long to linger after shutdown(WR) waiting for the peer to close.
    pub shutdown_linger_timeout: Duration,
    /// Emit per-connection debug logs.
    pub detail_log: bool,
}

impl Default for TcpConnectionOptions {
    fn default() -> Self {
        TcpConnectionOptions {
            send_buffer_size: None,
            recv_buffer_size: None,
            read_limit: None,
            write_limit: None,
            block_size: 16384,
            shutdown_linger_timeout: Duration::from_secs(5),
            detail_log: false,
        }
    }
}

impl TcpConnectionOptions {
    pub fn set_send_buffer_size(mut self, value: usize) -> Self {
        self.send_buffer_size = Some(value);
        self
    }
    pub fn set_recv_buffer_size(mut self, value: usize) -> Self {
        self.recv_buffer_size = Some(value);
        self
    }
    pub fn set_read_limit(mut self, value: usize) -> Self {
        self.read_limit = Some(value);
        self
    }
    pub fn set_write_limit(mut self, value: usize) -> Self {
        self.write_limit = Some(value);
        self
    }
    pub fn set_block_size(mut self, value: usize) -> Self {
        self.block_size = value;
        self
    }
    pub fn set_shutdown_linger_timeout(mut self, value: Duration) -> Self {
        self.shutdown_linger_timeout = value;
        self
    }
    pub fn set_detail_log(mut self, value: bool) -> Self {
        self.detail_log = value;
        self
    }
}

/// Parameters for a [`crate::TcpAcceptor`].
#[derive(Clone)]
pub struct TcpAcceptorOptions {
    /// Selector threads accepted connections are distributed to,
    /// round-robin. Empty: connections stay on the acceptor's selector.
    pub pool: AcceptorPool,
    /// Parameters applied to each accepted connection.
    pub connection: TcpConnectionOptions,
    /// Listen backlog.
    pub max_backlog: usize,
    /// Emit per-acceptor debug logs.
    pub detail_log: bool,
}

impl Default for TcpAcceptorOptions {
    fn default() -> Self {
        TcpAcceptorOptions::new()
    }
}

impl TcpAcceptorOptions {
    pub fn new() -> Self {
        TcpAcceptorOptions {
            pool: AcceptorPool::default(),
            connection: TcpConnectionOptions::default(),
            max_backlog: 100,
            detail_log: false,
        }
    }

    pub fn set_pool(mut self, value: AcceptorPool) -> Self {
        self.pool = value;
        self
    }
    pub fn set_connection(mut self, value: TcpConnectionOptions) -> Self {
        self.connection = value;
        self
    }
    pub fn set_max_backlog(mut self, value: usize) -> Self {
        self.max_backlog = value;
        self
    }
    pub fn set_detail_log(mut self, value: bool) -> Self {
        self.detail_log = value;
        self
    }
}

/// Parameters for the DNS resolver worker pool.
#[derive(Debug, Clone)]
pub struct DnsResolverOptions {
    /// Number of resolver worker threads.
    pub num_threads: usize,
    /// Bounded request queue size per worker.
    pub queue_size: usize,
    /// How long a submitter waits for a queue slot before the request is
    /// failed with an internal error.
    pub put_timeout: Duration,
}

impl Default for DnsResolverOptions {
    fn default() -> Self {
        DnsResolverOptions {
            num_threads: 4,
            queue_size: 100,
            put_timeout: Duration::from_millis(1),
        }
    }
}

impl DnsResolverOptions {
    pub fn set_num_threads(mut self, value: usize) -> Self {
        self.num_threads = value;
        self
    }
    pub fn set_queue_size(mut self, value: usize) -> Self {
        self.queue_size = value;
        self
    }
    pub fn set_put_timeout(mut self, value: Duration) -> Self {
        self.put_timeout = value;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::invalid_argument("dns resolver needs at least one thread"));
        }
        if self.queue_size == 0 {
            return Err(Error::invalid_argument(
                "dns resolver queue size must be at least one",
            ));
        }
        Ok(())
    }
}

/// Parameters for a [`crate::SslConnection`].
#[derive(Clone)]
pub struct SslConnectionOptions {
    /// The TLS context prepared by the application. The connection holds a
    /// reference and never tears the context down.
    pub ssl_context: SslContext,
    /// Accept a context without a matching certificate / private key pair.
    /// Testing only.
    pub allow_unchecked_private_key: bool,
    /// Parameters for the underlying TCP connection.
    pub tcp: TcpConnectionOptions,
}

impl SslConnectionOptions {
    pub fn new(ssl_context: SslContext) -> Self {
        SslConnectionOptions {
            ssl_context,
            allow_unchecked_private_key: false,
            tcp: TcpConnectionOptions::default(),
        }
    }

    pub fn set_allow_unchecked_private_key(mut self, value: bool) -> Self {
        self.allow_unchecked_private_key = value;
        self
    }
    pub fn set_tcp(mut self, value: TcpConnectionOptions) -> Self {
        self.tcp = value;
        self
    }
}

/// Parameters for a [`crate::SslAcceptor`].
#[derive(Clone)]
pub struct SslAcceptorOptions {
    /// Parameters for the underlying TCP acceptor.
    pub tcp_acceptor: TcpAcceptorOptions,
    /// Parameters for the accepted TLS connections.
    pub ssl: SslConnectionOptions,
}

impl SslAcceptorOptions {
    pub fn new(ssl: SslConnectionOptions) -> Self {
        SslAcceptorOptions {
            tcp_acceptor: TcpAcceptorOptions::new(),
            ssl,
        }
    }

    pub fn set_tcp_acceptor(mut self, value: TcpAcceptorOptions) -> Self {
        self.tcp_acceptor = value;
        self
    }
}
