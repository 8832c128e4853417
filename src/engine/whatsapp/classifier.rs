// WhatsApp Connection Manager — Disconnect Classifier
// classify: (status code, message, nested code) → remediation decision.
//
// Priority, first match wins:
//   1. Logged out by the remote side          → GIVE_UP
//   2. Pairing / stream / session / restart   → RETRY_DIFFERENT_APPROACH
//   3. Transient network loss or close        → RETRY_SIMPLE
//   4. Anything else                          → RETRY_SIMPLE
// The retry ceiling is not applied here; the scheduler turns any decision
// into GIVE_UP once the bot has used up its retries.

use crate::atoms::constants::*;
use crate::atoms::types::{DisconnectCause, RemediationDecision};
use regex::Regex;
use std::sync::LazyLock;

static LOGGED_OUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)logged[\s_-]?out|session (was )?(logged out|invalidated)").expect("static regex")
});

static NEEDS_NEW_IDENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)",
        r"couldn'?t link device|device (link|pairing)|pairing (failed|error)",
        r"|stream errored|stream error|xml-not-well-formed|protocol error",
        r"|bad ?mac|corrupt|invalid session|bad session",
        r"|restart required",
    ))
    .expect("static regex")
});

static TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)",
        r"connection (closed|lost|terminated|reset)|timed? ?out",
        r"|econnreset|econnrefused|enotfound|etimedout|socket hang up|network",
    ))
    .expect("static regex")
});

/// Pure: the same cause always yields the same decision.
pub fn classify(cause: &DisconnectCause) -> RemediationDecision {
    classify_parts(cause.status_code, &cause.message, cause.nested_code.as_deref())
}

pub fn classify_parts(status_code: Option<u16>, message: &str, nested_code: Option<&str>) -> RemediationDecision {
    let nested_status = nested_code.and_then(|c| c.trim().parse::<u16>().ok());

    // 1. Remote side invalidated the session or refuses the account
    let final_codes = [STATUS_LOGGED_OUT, STATUS_FORBIDDEN];
    if status_code.is_some_and(|c| final_codes.contains(&c))
        || nested_status.is_some_and(|c| final_codes.contains(&c))
        || LOGGED_OUT.is_match(message)
    {
        return RemediationDecision::GiveUp;
    }

    // 2. Rejected at the protocol / fingerprint level
    let identity_codes = [STATUS_RESTART_REQUIRED, STATUS_BAD_SESSION, STATUS_MULTIDEVICE_MISMATCH];
    if status_code.is_some_and(|c| identity_codes.contains(&c))
        || nested_status.is_some_and(|c| identity_codes.contains(&c))
        || nested_code.is_some_and(|c| c.eq_ignore_ascii_case("device_removed") || c.eq_ignore_ascii_case("bad-mac"))
        || NEEDS_NEW_IDENTITY.is_match(message)
    {
        return RemediationDecision::RetryDifferentApproach;
    }

    // 3. Transient network trouble
    let transient_codes = [STATUS_CONNECTION_LOST, STATUS_CONNECTION_CLOSED, STATUS_UNAVAILABLE_SERVICE];
    if status_code.is_some_and(|c| transient_codes.contains(&c)) || TRANSIENT.is_match(message) {
        return RemediationDecision::RetrySimple;
    }

    // 4. Unclassified. A replaced connection (another client took over) lands
    // here too: one plain retry reclaims it, and the ceiling stops a tug-of-war.
    if status_code == Some(STATUS_CONNECTION_REPLACED) {
        return RemediationDecision::RetrySimple;
    }
    RemediationDecision::RetrySimple
}
