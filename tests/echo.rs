//! Integration tests: TCP acceptor and connection over real loopback
//! sockets.
//!
//! Each test runs a server selector thread and a client selector thread,
//! drives traffic between them, and verifies payload bytes, byte counters,
//! and the ordering of close directives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wireline::{
    Acceptor, CloseDirective, Connection, HostPort, SelectorOptions, SelectorThread, TcpAcceptor,
    TcpAcceptorOptions, TcpConnection, TcpConnectionOptions,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn selector_thread() -> Arc<SelectorThread> {
    SelectorThread::create(
        SelectorOptions::default().set_default_loop_timeout(Duration::from_millis(50)),
    )
    .expect("creating selector thread")
}

fn conn_options() -> TcpConnectionOptions {
    TcpConnectionOptions::default().set_shutdown_linger_timeout(Duration::from_millis(500))
}

/// 127.0.0.1 with a system-chosen port.
fn loopback_any_port() -> HostPort {
    HostPort::new()
        .set_ip(wireline::IpAddress::IPV4_LOCALHOST)
        .set_port(0)
}

/// Builds a client connection wired to the given channels: received bytes
/// go to `data_tx`, close notifications to `close_tx`, and `on_connect`
/// runs on the loop thread once connected. With `flush_on_read_close` the
/// connection answers a read-half close by closing its own write half.
fn client_connection(
    thread: &SelectorThread,
    data_tx: mpsc::Sender<Vec<u8>>,
    close_tx: mpsc::Sender<(bool, CloseDirective)>,
    flush_on_read_close: bool,
    on_connect: impl FnMut(&TcpConnection) + Send + 'static,
) -> Arc<TcpConnection> {
    let conn = TcpConnection::new(thread.selector().clone(), conn_options());
    let weak = Arc::downgrade(&conn);
    let mut on_connect = on_connect;
    conn.set_connect_handler(move || {
        if let Some(conn) = weak.upgrade() {
            on_connect(&conn);
        }
    });
    let weak = Arc::downgrade(&conn);
    conn.set_read_handler(move || {
        if let Some(conn) = weak.upgrade() {
            let data = conn.take_input().to_vec();
            if !data.is_empty() {
                let _ = data_tx.send(data);
            }
        }
        Ok(())
    });
    conn.set_write_handler(|| Ok(()));
    let weak = Arc::downgrade(&conn);
    conn.set_close_handler(move |status, directive| {
        let _ = close_tx.send((status.is_ok(), directive));
        if flush_on_read_close && directive == CloseDirective::Read {
            if let Some(conn) = weak.upgrade() {
                conn.flush_and_close();
            }
        }
    });
    conn
}

#[test]
fn bind_accept_echo_and_close_directives() {
    init_logging();
    let server = selector_thread();
    let client = selector_thread();

    let acceptor = TcpAcceptor::new(
        server.selector().clone(),
        TcpAcceptorOptions::new().set_connection(conn_options()),
    );

    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>();
    let (srv_close_tx, srv_close_rx) = mpsc::channel::<(bool, CloseDirective)>();
    let server_conn: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));

    {
        let server_conn = server_conn.clone();
        acceptor.set_accept_handler(move |conn| {
            let data_tx = data_tx.clone();
            let srv_close_tx = srv_close_tx.clone();
            let reader = Arc::downgrade(&conn);
            conn.set_read_handler(move || {
                if let Some(conn) = reader.upgrade() {
                    let data = conn.take_input().to_vec();
                    if !data.is_empty() {
                        let _ = data_tx.send(data);
                    }
                }
                Ok(())
            });
            conn.set_write_handler(|| Ok(()));
            let closer = Arc::downgrade(&conn);
            conn.set_close_handler(move |status, directive| {
                let _ = srv_close_tx.send((status.is_ok(), directive));
                // The peer finished sending; answer by closing our write
                // half as well.
                if directive == CloseDirective::Read {
                    if let Some(conn) = closer.upgrade() {
                        conn.flush_and_close();
                    }
                }
            });
            *server_conn.lock().unwrap() = Some(conn);
        });
    }

    acceptor
        .listen(&loopback_any_port())
        .unwrap();
    let port = acceptor.local_address().port().unwrap();
    assert_ne!(port, 0, "listening on port 0 learns the chosen port");
    server.start();

    let (cli_data_tx, _cli_data_rx) = mpsc::channel();
    let (cli_close_tx, cli_close_rx) = mpsc::channel();
    let conn = client_connection(&client, cli_data_tx, cli_close_tx, false, |conn| {
        conn.write(b"hello");
    });
    let target: HostPort = format!("127.0.0.1:{port}").parse().unwrap();
    conn.connect(&target).unwrap();
    client.start();

    let received = data_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(received, b"hello");

    conn.flush_and_close();

    // The server observes the client's write close, then the full close.
    let (ok, directive) = srv_close_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(ok);
    assert_eq!(directive, CloseDirective::Read);
    let (ok, directive) = srv_close_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(ok);
    assert_eq!(directive, CloseDirective::ReadWrite);

    // The client side winds down too.
    let mut last = None;
    while let Ok(event) = cli_close_rx.recv_timeout(RECV_TIMEOUT) {
        assert!(event.0);
        let done = event.1 == CloseDirective::ReadWrite;
        last = Some(event.1);
        if done {
            break;
        }
    }
    assert_eq!(last, Some(CloseDirective::ReadWrite));

    client.stop();
    server.stop();
    assert_eq!(
        acceptor.state(),
        wireline::AcceptorState::Disconnected,
        "loop exit closes everything registered"
    );
    assert!(server.loop_status().is_ok());
    assert!(client.loop_status().is_ok());
}

#[test]
fn graceful_shutdown_counts_bytes() {
    init_logging();
    let server = selector_thread();
    let client = selector_thread();

    let acceptor = TcpAcceptor::new(
        server.selector().clone(),
        TcpAcceptorOptions::new().set_connection(conn_options()),
    );

    let written = Arc::new(AtomicU64::new(0));
    let (srv_close_tx, srv_close_rx) = mpsc::channel::<(bool, CloseDirective)>();
    {
        let written = written.clone();
        acceptor.set_accept_handler(move |conn| {
            conn.set_read_handler(|| Ok(()));
            conn.set_write_handler(|| Ok(()));
            let counter = written.clone();
            let weak = Arc::downgrade(&conn);
            let srv_close_tx = srv_close_tx.clone();
            conn.set_close_handler(move |status, directive| {
                if let Some(conn) = weak.upgrade() {
                    counter.store(conn.count_bytes_written(), Ordering::SeqCst);
                }
                let _ = srv_close_tx.send((status.is_ok(), directive));
            });
            // Send and immediately start the graceful close.
            conn.write(b"abc");
            conn.flush_and_close();
        });
    }

    acceptor
        .listen(&loopback_any_port())
        .unwrap();
    let port = acceptor.local_address().port().unwrap();
    server.start();

    let (cli_data_tx, cli_data_rx) = mpsc::channel();
    let (cli_close_tx, cli_close_rx) = mpsc::channel();
    let conn = client_connection(&client, cli_data_tx, cli_close_tx, true, |_conn| {});

    let target: HostPort = format!("127.0.0.1:{port}").parse().unwrap();
    conn.connect(&target).unwrap();
    client.start();

    let received = cli_data_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(received, b"abc");

    // Client sees its read half close first, then the full close.
    let (ok, directive) = cli_close_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(ok);
    assert_eq!(directive, CloseDirective::Read);
    let (ok, directive) = cli_close_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(ok);
    assert_eq!(directive, CloseDirective::ReadWrite);

    // The server side completed with everything flushed.
    let mut server_done = false;
    while let Ok((ok, directive)) = srv_close_rx.recv_timeout(RECV_TIMEOUT) {
        assert!(ok);
        if directive == CloseDirective::ReadWrite {
            server_done = true;
            break;
        }
    }
    assert!(server_done);

    assert_eq!(written.load(Ordering::SeqCst), 3);
    assert_eq!(conn.count_bytes_read(), 3);

    client.stop();
    server.stop();
}

#[test]
fn shutdown_linger_closes_unresponsive_peer() {
    init_logging();
    let server = selector_thread();
    let client = selector_thread();

    let linger = Duration::from_secs(1);
    let acceptor = TcpAcceptor::new(
        server.selector().clone(),
        TcpAcceptorOptions::new().set_connection(
            TcpConnectionOptions::default().set_shutdown_linger_timeout(linger),
        ),
    );

    let (srv_close_tx, srv_close_rx) = mpsc::channel::<(bool, CloseDirective)>();
    acceptor.set_accept_handler(move |conn| {
        conn.set_read_handler(|| Ok(()));
        conn.set_write_handler(|| Ok(()));
        let srv_close_tx = srv_close_tx.clone();
        conn.set_close_handler(move |status, directive| {
            let _ = srv_close_tx.send((status.is_ok(), directive));
        });
        conn.write(b"x");
        conn.flush_and_close();
    });

    acceptor
        .listen(&loopback_any_port())
        .unwrap();
    let port = acceptor.local_address().port().unwrap();
    server.start();

    let (cli_data_tx, cli_data_rx) = mpsc::channel();
    let (cli_close_tx, _cli_close_rx) = mpsc::channel();
    // This client never answers the close; the server's linger alarm must
    // finish the job.
    let conn = client_connection(&client, cli_data_tx, cli_close_tx, false, |_conn| {});
    let target: HostPort = format!("127.0.0.1:{port}").parse().unwrap();
    conn.connect(&target).unwrap();
    client.start();

    assert_eq!(cli_data_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"x");

    let start = Instant::now();
    let (ok, directive) = srv_close_rx
        .recv_timeout(linger + Duration::from_millis(500))
        .unwrap();
    assert!(ok, "linger close reports an ok status");
    assert_eq!(directive, CloseDirective::ReadWrite);
    assert!(start.elapsed() <= linger + Duration::from_millis(500));

    client.stop();
    server.stop();
}

#[test]
fn connect_to_refused_port_reports_error() {
    init_logging();
    let client = selector_thread();

    // Find a port with nothing listening by binding and dropping.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let (close_tx, close_rx) = mpsc::channel::<bool>();
    let conn = TcpConnection::new(client.selector().clone(), conn_options());
    conn.set_connect_handler(|| {});
    conn.set_read_handler(|| Ok(()));
    conn.set_write_handler(|| Ok(()));
    conn.set_close_handler(move |status, _directive| {
        let _ = close_tx.send(status.is_err());
    });
    let target: HostPort = format!("127.0.0.1:{port}").parse().unwrap();
    match conn.connect(&target) {
        // Loopback may refuse synchronously; the connect call itself fails
        // and the connection returns to Disconnected.
        Err(_) => assert_eq!(conn.state(), wireline::ConnState::Disconnected),
        Ok(()) => {
            client.start();
            assert!(
                close_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
                "refused connect surfaces a non-ok close status"
            );
        }
    }
    client.stop();
}

#[test]
fn connect_requires_a_port() {
    init_logging();
    let client = selector_thread();
    let conn = TcpConnection::new(client.selector().clone(), conn_options());
    let no_port: HostPort = HostPort::new().set_host("localhost");
    let err = conn.connect(&no_port).unwrap_err();
    assert_eq!(err.kind(), wireline::ErrorKind::InvalidArgument);
    assert_eq!(conn.state(), wireline::ConnState::Disconnected);
}

#[test]
fn acceptor_pool_distributes_connections() {
    init_logging();
    let server = selector_thread();
    let workers = vec![selector_thread(), selector_thread()];
    for worker in &workers {
        worker.start();
    }

    let pool = wireline::AcceptorPool::new(workers.clone());
    let acceptor = TcpAcceptor::new(
        server.selector().clone(),
        TcpAcceptorOptions::new()
            .set_pool(pool)
            .set_connection(conn_options()),
    );

    let (tx, rx) = mpsc::channel::<Arc<TcpConnection>>();
    acceptor.set_accept_handler(move |conn| {
        conn.set_read_handler(|| Ok(()));
        conn.set_write_handler(|| Ok(()));
        conn.set_close_handler(|_status, _directive| {});
        let _ = tx.send(conn);
    });
    acceptor
        .listen(&loopback_any_port())
        .unwrap();
    let port = acceptor.local_address().port().unwrap();
    server.start();

    // Two plain TCP clients are enough to exercise the round-robin.
    let addr = format!("127.0.0.1:{port}");
    let _c1 = std::net::TcpStream::connect(&addr).unwrap();
    let _c2 = std::net::TcpStream::connect(&addr).unwrap();

    let first = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let second = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    // Each accepted connection landed on a different pool selector.
    assert!(!Arc::ptr_eq(first.selector(), second.selector()));
    assert_eq!(acceptor.stats().connections_initialized(), 2);

    drop(first);
    drop(second);
    for worker in &workers {
        worker.clean_and_close_all();
        worker.stop();
    }
    server.stop();
}
