//! Process-wide runtime counters.
//!
//! Registered with `metriken` so embedding applications can scrape them
//! alongside their own metrics.

use metriken::{metric, Counter};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "wireline/connections/accepted",
    description = "Total connections accepted across all acceptors"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/connected",
    description = "Total outbound connections that completed the connect"
)]
pub static CONNECTIONS_CONNECTED: Counter = Counter::new();

#[metric(
    name = "wireline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "wireline/bytes/read", description = "Total bytes read")]
pub static BYTES_READ: Counter = Counter::new();

#[metric(name = "wireline/bytes/written", description = "Total bytes written")]
pub static BYTES_WRITTEN: Counter = Counter::new();

// ── Selector ─────────────────────────────────────────────────────

#[metric(name = "wireline/alarms/fired", description = "Total alarms fired")]
pub static ALARMS_FIRED: Counter = Counter::new();

// ── DNS ──────────────────────────────────────────────────────────

#[metric(
    name = "wireline/dns/resolutions",
    description = "Successful DNS resolutions"
)]
pub static DNS_RESOLUTIONS: Counter = Counter::new();

#[metric(name = "wireline/dns/failures", description = "Failed DNS resolutions")]
pub static DNS_FAILURES: Counter = Counter::new();
