//! Maps directory exchanges onto the client's result taxonomy.
//!
//! Every operation that talks to a directory hands the exchange to one of the functions below
//! and acts on the returned [`Verdict`]. New result kinds are added here and nowhere else.

use log::debug;

use crate::codec;
use crate::error::SvcDirError;
use crate::transport::{HttpResponse, TransportError, TransportErrorKind};
use crate::types::{Candidate, ServiceVersionConfig};

/// What the failover loop does with one exchange.
#[derive(Debug)]
pub enum Verdict<T> {
    /// Final, successful answer.
    Accept(T),
    /// Final answer: the directory understood the request and refused it.
    Reject(SvcDirError),
    /// This directory is unusable; continue with the next address.
    TryNext(String),
    /// Continue with the next address, but surface this error if none of them does better.
    Fallback(SvcDirError),
}

/// Statuses the directory uses to say the entity does not exist or is not alive.
fn is_not_found(status: u16) -> bool {
    status == 404 || status == 410
}

/// Maps a non-2xx response onto an error.
pub fn status_error(response: &HttpResponse) -> SvcDirError {
    let message = codec::decode_status_message(response);
    if is_not_found(response.status) {
        SvcDirError::NotFound(message)
    } else {
        SvcDirError::ServerError(format!("{} {}", response.status, message))
    }
}

/// An exchange that never produced a response.
pub fn transport_failure<T>(error: &TransportError) -> Verdict<T> {
    let reason = match error.kind {
        TransportErrorKind::Timeout => format!("timed out: {}", error.url),
        TransportErrorKind::Connect => format!("connection failed: {}", error.url),
        TransportErrorKind::Other => error.to_string(),
    };
    Verdict::TryNext(reason)
}

/// Announce: the body of a 2xx names the directory instance that took the announcement.
pub fn announce(response: &HttpResponse) -> Verdict<String> {
    if !response.is_success() {
        return Verdict::Reject(status_error(response));
    }
    match codec::decode_announce_ack(&response.body) {
        Some(served_by) => Verdict::Accept(served_by),
        None => Verdict::Reject(SvcDirError::ServerError(format!(
            "malformed announce acknowledgement: {:?}",
            response.body.trim()
        ))),
    }
}

pub fn deannounce(response: &HttpResponse) -> Verdict<()> {
    if response.is_success() {
        Verdict::Accept(())
    } else {
        Verdict::Reject(status_error(response))
    }
}

/// Member list: every failure moves on. A 404/410 is remembered so that a service no
/// directory knows reports not-found instead of an outage.
pub fn member_list(response: &HttpResponse) -> Verdict<Vec<Candidate>> {
    if is_not_found(response.status) {
        return Verdict::Fallback(status_error(response));
    }
    if !response.is_success() {
        return Verdict::TryNext(format!(
            "{} {}",
            response.status,
            codec::decode_status_message(response)
        ));
    }
    match codec::decode_member_list(&response.body) {
        Ok(list) => {
            if list.skipped > 0 {
                debug!("Skipped {} unparsable member records", list.skipped);
            }
            Verdict::Accept(list.candidates)
        }
        Err(e) => Verdict::TryNext(e.to_string()),
    }
}

/// Reading the default version: a missing `currentVersion` is a valid answer.
pub fn version_read(response: &HttpResponse) -> Verdict<ServiceVersionConfig> {
    if !response.is_success() {
        return Verdict::Reject(status_error(response));
    }
    match codec::decode_version_config(&response.body) {
        Ok(config) => Verdict::Accept(config),
        Err(e) => Verdict::Reject(e),
    }
}

/// Setting the default version: the answer must confirm the requested version.
pub fn version_write(response: &HttpResponse, requested: &str) -> Verdict<ServiceVersionConfig> {
    let config = match version_read(response) {
        Verdict::Accept(config) => config,
        other => return other,
    };
    match config.current_version.as_deref() {
        Some(current) if current == requested => Verdict::Accept(config),
        Some(current) => Verdict::Reject(SvcDirError::ProtocolError(format!(
            "directory confirmed version '{}' instead of '{}'",
            current, requested
        ))),
        None => Verdict::Reject(SvcDirError::ProtocolError(format!(
            "directory did not confirm version '{}'",
            requested
        ))),
    }
}

pub fn version_delete(response: &HttpResponse) -> Verdict<()> {
    deannounce(response)
}
