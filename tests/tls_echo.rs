//! Integration tests: TLS loopback with a generated self-signed
//! certificate.
//!
//! A TLS acceptor and a TLS client run on separate selector threads; the
//! handshake completes through the in-memory ciphertext pump, bytes flow
//! both ways, and a graceful close from one side delivers ordered close
//! notifications on both.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use wireline::{
    Acceptor, CloseDirective, Connection, HostPort, SelectorOptions, SelectorThread, SslAcceptor,
    SslAcceptorOptions, SslConnection, SslConnectionOptions,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn selector_thread() -> Arc<SelectorThread> {
    SelectorThread::create(
        SelectorOptions::default().set_default_loop_timeout(Duration::from_millis(50)),
    )
    .expect("creating selector thread")
}

/// 127.0.0.1 with a system-chosen port.
fn loopback_any_port() -> HostPort {
    HostPort::new()
        .set_ip(wireline::IpAddress::IPV4_LOCALHOST)
        .set_port(0)
}

fn self_signed_certificate() -> (X509, PKey<Private>) {
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
        .set_not_after(&Asn1Time::days_from_now(7).unwrap())
        .unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

fn server_context() -> SslContext {
    let (certificate, key) = self_signed_certificate();
    let mut builder = SslContextBuilder::new(SslMethod::tls()).unwrap();
    builder.set_certificate(&certificate).unwrap();
    builder.set_private_key(&key).unwrap();
    builder.check_private_key().unwrap();
    wireline::tls::set_context_modes(&mut builder);
    builder.build()
}

fn client_context(verify: SslVerifyMode) -> SslContext {
    let mut builder = SslContextBuilder::new(SslMethod::tls()).unwrap();
    builder.set_verify(verify);
    wireline::tls::set_context_modes(&mut builder);
    builder.build()
}

/// Wires data / close channels plus an on-connect action to a TLS
/// connection.
fn wire_handlers(
    conn: &Arc<SslConnection>,
    data_tx: mpsc::Sender<Vec<u8>>,
    close_tx: mpsc::Sender<(bool, CloseDirective)>,
    mut on_connect: impl FnMut(&SslConnection) + Send + 'static,
) {
    let weak = Arc::downgrade(conn);
    conn.set_connect_handler(move || {
        if let Some(conn) = weak.upgrade() {
            on_connect(&conn);
        }
    });
    let weak = Arc::downgrade(conn);
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
    conn.set_close_handler(move |status, directive| {
        let _ = close_tx.send((status.is_ok(), directive));
    });
}

#[test]
fn tls_loopback_ping_pong_and_graceful_close() {
    init_logging();
    let server = selector_thread();
    let client = selector_thread();

    let acceptor = SslAcceptor::new(
        server.selector().clone(),
        SslAcceptorOptions::new(SslConnectionOptions::new(server_context())),
    );

    let (srv_data_tx, srv_data_rx) = mpsc::channel::<Vec<u8>>();
    let (srv_close_tx, srv_close_rx) = mpsc::channel::<(bool, CloseDirective)>();
    let (srv_conn_tx, srv_conn_rx) = mpsc::channel::<Arc<SslConnection>>();
    {
        acceptor.set_accept_handler(move |conn| {
            assert!(conn.handshake_finished());
            assert!(conn.is_server_side());
            let srv_data_tx = srv_data_tx.clone();
            let srv_close_tx = srv_close_tx.clone();
            let weak = Arc::downgrade(&conn);
            conn.set_read_handler(move || {
                if let Some(conn) = weak.upgrade() {
                    let data = conn.take_input().to_vec();
                    if !data.is_empty() {
                        // Answer the ping in kind.
                        conn.write(b"pong");
                        let _ = srv_data_tx.send(data);
                    }
                }
                Ok(())
            });
            conn.set_write_handler(|| Ok(()));
            conn.set_close_handler(move |status, directive| {
                let _ = srv_close_tx.send((status.is_ok(), directive));
            });
            let _ = srv_conn_tx.send(conn);
        });
    }

    acceptor
        .listen(&loopback_any_port())
        .unwrap();
    let port = acceptor.local_address().port().unwrap();
    assert_ne!(port, 0);
    server.start();

    let ssl_client = SslConnection::new(
        client.selector().clone(),
        SslConnectionOptions::new(client_context(SslVerifyMode::NONE)),
    );
    let (cli_data_tx, cli_data_rx) = mpsc::channel();
    let (cli_close_tx, cli_close_rx) = mpsc::channel();
    wire_handlers(&ssl_client, cli_data_tx, cli_close_tx, |conn| {
        conn.write(b"ping");
    });
    let target: HostPort = format!("127.0.0.1:{port}").parse().unwrap();
    ssl_client.connect(&target).unwrap();
    client.start();

    // Payloads cross in both directions after both handshakes complete.
    assert_eq!(srv_data_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"ping");
    assert_eq!(cli_data_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"pong");
    let server_conn = srv_conn_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(!ssl_client.is_server_side());

    // Client-initiated graceful close: both sides end with an ok full
    // close.
    ssl_client.flush_and_close();

    let mut client_done = false;
    while let Ok((ok, directive)) = cli_close_rx.recv_timeout(RECV_TIMEOUT) {
        assert!(ok, "client close status stays ok");
        if directive == CloseDirective::ReadWrite {
            client_done = true;
            break;
        }
    }
    assert!(client_done);

    let mut server_done = false;
    while let Ok((ok, directive)) = srv_close_rx.recv_timeout(RECV_TIMEOUT) {
        assert!(ok, "server close status stays ok");
        if directive == CloseDirective::ReadWrite {
            server_done = true;
            break;
        }
    }
    assert!(server_done);

    drop(server_conn);
    client.stop();
    server.stop();
    assert!(server.loop_status().is_ok());
    assert!(client.loop_status().is_ok());
}

#[test]
fn tls_client_verification_failure_closes_connection() {
    init_logging();
    let server = selector_thread();
    let client = selector_thread();

    let acceptor = SslAcceptor::new(
        server.selector().clone(),
        SslAcceptorOptions::new(SslConnectionOptions::new(server_context())),
    );
    acceptor.set_accept_handler(|_conn| {
        panic!("handshake must not complete against an untrusted certificate");
    });
    acceptor
        .listen(&loopback_any_port())
        .unwrap();
    let port = acceptor.local_address().port().unwrap();
    server.start();

    // The client demands verification but trusts no roots, so the
    // self-signed server certificate must be rejected.
    let ssl_client = SslConnection::new(
        client.selector().clone(),
        SslConnectionOptions::new(client_context(SslVerifyMode::PEER)),
    );
    let (cli_data_tx, _cli_data_rx) = mpsc::channel();
    let (cli_close_tx, cli_close_rx) = mpsc::channel();
    wire_handlers(&ssl_client, cli_data_tx, cli_close_tx, |_conn| {});
    let target: HostPort = format!("127.0.0.1:{port}").parse().unwrap();
    ssl_client.connect(&target).unwrap();
    client.start();

    // The failed handshake tears the connection down with an error status.
    let mut saw_error = false;
    while let Ok((ok, directive)) = cli_close_rx.recv_timeout(RECV_TIMEOUT) {
        if !ok {
            saw_error = true;
        }
        if directive == CloseDirective::ReadWrite {
            break;
        }
    }
    assert!(saw_error, "verification failure surfaces a non-ok status");
    assert!(ssl_client.last_error().is_some());

    client.stop();
    server.stop();
}

#[test]
fn tls_acceptor_requires_certificate() {
    init_logging();
    let server = selector_thread();
    // A context without a certificate is rejected at listen time.
    let bare_context = client_context(SslVerifyMode::NONE);
    let acceptor = SslAcceptor::new(
        server.selector().clone(),
        SslAcceptorOptions::new(SslConnectionOptions::new(bare_context)),
    );
    let err = acceptor
        .listen(&loopback_any_port())
        .unwrap_err();
    assert_eq!(err.kind(), wireline::ErrorKind::FailedPrecondition);

    // The testing escape hatch downgrades the check to a warning.
    let bare_context = client_context(SslVerifyMode::NONE);
    let acceptor = SslAcceptor::new(
        server.selector().clone(),
        SslAcceptorOptions::new(
            SslConnectionOptions::new(bare_context).set_allow_unchecked_private_key(true),
        ),
    );
    acceptor
        .listen(&loopback_any_port())
        .unwrap();
    acceptor.close();
    server.start();
    server.stop();
}
