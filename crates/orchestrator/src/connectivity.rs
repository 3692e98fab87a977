//! Classification of worker transport failures.

use std::error::Error as StdError;
use std::io;

use crate::error::ConnectivityKind;

const DNS_NEEDLES: &[&str] = &[
    "no such host",
    "dns error",
    "failed to lookup address",
    "temporary failure in name resolution",
    "name or service not known",
    "nodename nor servname provided",
];

const TIMEOUT_NEEDLES: &[&str] = &["i/o timeout", "timed out", "tls handshake timeout"];

const REFUSED_NEEDLES: &[&str] = &["connection refused"];

const UNREACHABLE_NEEDLES: &[&str] = &[
    "network is unreachable",
    "no route to host",
    "host is unreachable",
];

// A reset or abort after the request was written is not listed: the worker may
// already have acted on it.
const OTHER_NEEDLES: &[&str] = &["proxyconnect", "tls handshake"];

/// Returns the connectivity class of a failed worker request, or `None` when
/// the failure is not about reaching the worker.
pub(crate) fn classify_reqwest(err: &reqwest::Error) -> Option<ConnectivityKind> {
    if let Some(kind) = classify_chain(err) {
        return Some(kind);
    }
    if err.is_timeout() {
        return Some(ConnectivityKind::Timeout);
    }
    if err.is_connect() {
        return Some(ConnectivityKind::Other);
    }
    None
}

/// Walks the error source chain looking for a known network failure.
pub(crate) fn classify_chain(err: &(dyn StdError + 'static)) -> Option<ConnectivityKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(error) = current {
        if let Some(io_err) = error.downcast_ref::<io::Error>() {
            if let Some(kind) = classify_io_kind(io_err.kind()) {
                return Some(kind);
            }
        }
        if let Some(kind) = classify_message(&error.to_string()) {
            return Some(kind);
        }
        current = error.source();
    }
    None
}

fn classify_io_kind(kind: io::ErrorKind) -> Option<ConnectivityKind> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some(ConnectivityKind::Refused),
        io::ErrorKind::TimedOut => Some(ConnectivityKind::Timeout),
        _ => None,
    }
}

fn classify_message(message: &str) -> Option<ConnectivityKind> {
    let lower = message.to_ascii_lowercase();
    let matches = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if matches(DNS_NEEDLES) {
        Some(ConnectivityKind::Dns)
    } else if matches(TIMEOUT_NEEDLES) {
        Some(ConnectivityKind::Timeout)
    } else if matches(REFUSED_NEEDLES) {
        Some(ConnectivityKind::Refused)
    } else if matches(UNREACHABLE_NEEDLES) {
        Some(ConnectivityKind::Unreachable)
    } else if matches(OTHER_NEEDLES) {
        Some(ConnectivityKind::Other)
    } else {
        None
    }
}
