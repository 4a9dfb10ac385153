//! Encoding of directory requests and decoding of directory responses.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use log::debug;
use url::Url;
use url::form_urlencoded::Serializer;

use crate::error::{Result, SvcDirError};
use crate::transport::{HttpRequest, HttpResponse, Method};
use crate::types::{Candidate, DirectoryAddress, ServiceVersionConfig};

/// Header carrying the merged routing override.
pub const ROUTE_HEADER: &str = "X-Directory-Route";

/// Parameter names the announce request uses itself; metadata cannot reuse them.
pub const RESERVED_PARAMS: [&str; 5] = ["service", "version", "ip", "port", "check"];

fn base_url(directory: &DirectoryAddress) -> Result<Url> {
    Ok(Url::parse(&format!("http://{}/", directory.address))?)
}

fn url_with_path(directory: &DirectoryAddress, segments: &[&str]) -> Result<Url> {
    let mut url = base_url(directory)?;
    url.path_segments_mut()
        .map_err(|_| {
            SvcDirError::ConfigError(format!("{} cannot carry a path", directory.address))
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `POST /v1/announce`.
pub fn encode_announce(
    directory: &DirectoryAddress,
    service: &str,
    version: &str,
    ip: &str,
    port: u16,
    check: &str,
    metadata: &BTreeMap<String, String>,
) -> Result<HttpRequest> {
    let url = url_with_path(directory, &["v1", "announce"])?;
    let mut form = Serializer::new(String::new());
    form.append_pair("service", service)
        .append_pair("version", version)
        .append_pair("ip", ip)
        .append_pair("port", &port.to_string())
        .append_pair("check", check);
    for (key, value) in metadata {
        if RESERVED_PARAMS.contains(&key.as_str()) {
            return Err(SvcDirError::InvalidArgs(format!(
                "metadata key '{}' is reserved",
                key
            )));
        }
        form.append_pair(key, value);
    }
    Ok(HttpRequest::new(Method::Post, url.as_str()).with_body(form.finish()))
}

/// `POST /v1/deannounce`.
pub fn encode_deannounce(
    directory: &DirectoryAddress,
    service: &str,
    version: &str,
    ip: &str,
    port: u16,
) -> Result<HttpRequest> {
    let url = url_with_path(directory, &["v1", "deannounce"])?;
    let body = Serializer::new(String::new())
        .append_pair("service", service)
        .append_pair("version", version)
        .append_pair("ip", ip)
        .append_pair("port", &port.to_string())
        .finish();
    Ok(HttpRequest::new(Method::Post, url.as_str()).with_body(body))
}

/// `GET /v1/members/<service>`.
pub fn encode_member_list(directory: &DirectoryAddress, service: &str) -> Result<HttpRequest> {
    let url = url_with_path(directory, &["v1", "members", service])?;
    Ok(HttpRequest::new(Method::Get, url.as_str()))
}

/// `GET /v1/config/version?service=<service>`.
pub fn encode_version_get(directory: &DirectoryAddress, service: &str) -> Result<HttpRequest> {
    let mut url = url_with_path(directory, &["v1", "config", "version"])?;
    url.query_pairs_mut().append_pair("service", service);
    Ok(HttpRequest::new(Method::Get, url.as_str()))
}

/// `POST /v1/config/version`.
pub fn encode_version_set(
    directory: &DirectoryAddress,
    service: &str,
    version: &str,
) -> Result<HttpRequest> {
    let url = url_with_path(directory, &["v1", "config", "version"])?;
    let body = Serializer::new(String::new())
        .append_pair("service", service)
        .append_pair("version", version)
        .finish();
    Ok(HttpRequest::new(Method::Post, url.as_str()).with_body(body))
}

/// `DELETE /v1/config/version?service=<service>`.
pub fn encode_version_delete(directory: &DirectoryAddress, service: &str) -> Result<HttpRequest> {
    let mut url = url_with_path(directory, &["v1", "config", "version"])?;
    url.query_pairs_mut().append_pair("service", service);
    Ok(HttpRequest::new(Method::Delete, url.as_str()))
}

/// Candidates decoded from a member list, plus how many record lines were unusable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberList {
    pub candidates: Vec<Candidate>,
    pub skipped: usize,
}

/// Decodes a line-oriented member list.
///
/// Each record is `<type> <host:port> [aux...]`. Blank lines and `#` comments are ignored,
/// garbled records are skipped. A body made only of garbled records is a protocol error;
/// an empty body is an empty list.
pub fn decode_member_list(body: &str) -> Result<MemberList> {
    let mut list = MemberList::default();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let _kind = tokens.next();
        match tokens.next().and_then(parse_host_port) {
            Some(candidate) => list.candidates.push(candidate),
            None => {
                debug!("Skipping unparsable member record: {:?}", line);
                list.skipped += 1;
            }
        }
    }

    if list.candidates.is_empty() && list.skipped > 0 {
        return Err(SvcDirError::ProtocolError(format!(
            "member list has {} records and none is valid",
            list.skipped
        )));
    }
    Ok(list)
}

/// Parses `host:port` or `[v6]:port`. Port zero is rejected.
pub fn parse_host_port(token: &str) -> Option<Candidate> {
    let (host, port) = if let Some(rest) = token.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        host.parse::<Ipv6Addr>().ok()?;
        (host, port)
    } else {
        let (host, port) = token.rsplit_once(':')?;
        let valid_host = !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
        if !valid_host {
            return None;
        }
        (host, port)
    };
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    Some(Candidate::new(host, port))
}

/// Extracts the `host:port` of the directory instance that served an announce.
pub fn decode_announce_ack(body: &str) -> Option<String> {
    let first = body.lines().map(str::trim).find(|l| !l.is_empty())?;
    let token = first.split_whitespace().next()?;
    parse_host_port(token).map(|c| c.to_string())
}

/// Decodes `<service name=".." currentVersion=".." previousVersion=".."/>`.
pub fn decode_version_config(body: &str) -> Result<ServiceVersionConfig> {
    let (_, attrs) = parse_fragment(body).ok_or_else(|| {
        SvcDirError::ProtocolError(format!("malformed configuration fragment: {:?}", body))
    })?;
    let name = attrs
        .get("name")
        .filter(|n| !n.is_empty())
        .cloned()
        .ok_or_else(|| {
            SvcDirError::ProtocolError("configuration fragment has no name".into())
        })?;
    let non_empty = |key: &str| attrs.get(key).filter(|v| !v.is_empty()).cloned();

    Ok(ServiceVersionConfig {
        name,
        current_version: non_empty("currentVersion"),
        previous_version: non_empty("previousVersion"),
    })
}

/// Human-readable message from an error response.
pub fn decode_status_message(response: &HttpResponse) -> String {
    if response.body.contains("<status") {
        if let Some((_, attrs)) = parse_fragment(&response.body) {
            if let Some(message) = attrs.get("message").filter(|m| !m.is_empty()) {
                return message.clone();
            }
        }
    }
    if let Some(line) = response.body.lines().map(str::trim).find(|l| !l.is_empty()) {
        return line.to_string();
    }
    if !response.message.is_empty() {
        return response.message.clone();
    }
    format!("HTTP {}", response.status)
}

/// Parses the first `<tag attr="value" .../>` element of a fragment.
fn parse_fragment(body: &str) -> Option<(String, BTreeMap<String, String>)> {
    let start = body.find('<')?;
    let end = start + body[start..].find('>')?;
    let inner = body[start + 1..end].trim().trim_end_matches('/').trim_end();

    let tag_end = inner
        .find(|c: char| c.is_whitespace())
        .unwrap_or(inner.len());
    let tag = &inner[..tag_end];
    if tag.is_empty() || tag.starts_with('?') || tag.starts_with('!') {
        return None;
    }

    let mut attrs = BTreeMap::new();
    let mut rest = inner[tag_end..].trim_start();
    while !rest.is_empty() {
        let (name, after) = rest.split_once('=')?;
        let name = name.trim();
        let after = after.trim_start();
        let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let value_end = after[1..].find(quote)?;
        let value = &after[1..1 + value_end];
        if name.is_empty() || name.contains(char::is_whitespace) {
            return None;
        }
        attrs.insert(name.to_string(), unescape(value));
        rest = after[value_end + 2..].trim_start();
    }
    Some((tag.to_string(), attrs))
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Merges routing overrides. Request-scoped values come first, then caller-supplied, then
/// configured; each may be a comma-separated list and repeated entries keep their first
/// position.
pub fn merge_route_overrides(
    request: Option<&str>,
    caller: Option<&str>,
    configured: Option<&str>,
) -> Option<String> {
    let mut merged: Vec<&str> = Vec::new();
    for entry in [request, caller, configured]
        .into_iter()
        .flatten()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
    {
        if !merged.contains(&entry) {
            merged.push(entry);
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged.join(","))
    }
}
