//! Session-affinity hashing and cookie generation
//!
//! A [`HashPolicy`] turns a request into the 64-bit hash the consistent
//! hashing structures consume. The cookie-based policy keeps a client
//! pinned to one upstream host: it hashes the affinity cookie when the
//! request carries one, and otherwise synthesizes a cookie from the
//! connection addresses, installs a `Set-Cookie` response modifier on the
//! context, and hashes the fresh value.
//!
//! The synthesized cookie value is the lowercase hex encoding of the
//! xxHash64 of `remote_address` concatenated with `local_address`; the
//! response header takes the form
//! `<name>=<hex>; Path=<path>; Max-Age=<ttl>; HttpOnly[; attrs]`.

use std::time::Duration;

use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use xxhash_rust::xxh64::xxh64;

use super::thread_aware::LoadBalancerContext;

/// Strategy producing the request hash for consistent hashing
pub trait HashPolicy: Send + Sync {
    /// Compute the hash for one request, or `None` when the request
    /// carries nothing to hash on
    fn generate_hash(&self, context: &mut dyn LoadBalancerContext) -> Option<u64>;
}

/// Extra cookie attribute appended to the `Set-Cookie` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieAttribute {
    /// Attribute name, e.g. `"SameSite"`
    pub name: String,
    /// Attribute value; empty renders the bare attribute name
    pub value: String,
}

/// Render a `Set-Cookie` header value
#[must_use]
pub fn make_set_cookie_value(
    name: &str,
    value: &str,
    path: &str,
    ttl: Duration,
    attributes: &[CookieAttribute],
) -> String {
    let mut cookie = format!("{name}={value}");
    if !path.is_empty() {
        cookie.push_str(&format!("; Path={path}"));
    }
    cookie.push_str(&format!("; Max-Age={}", ttl.as_secs()));
    cookie.push_str("; HttpOnly");
    for attribute in attributes {
        if attribute.value.is_empty() {
            cookie.push_str(&format!("; {}", attribute.name));
        } else {
            cookie.push_str(&format!("; {}={}", attribute.name, attribute.value));
        }
    }
    cookie
}

/// Extract a cookie value from the request's `Cookie` headers
#[must_use]
pub fn parse_cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(header) = header.to_str() else {
            continue;
        };
        for pair in header.split(';') {
            let pair = pair.trim();
            if let Some((key, value)) = pair.split_once('=') {
                if key == name {
                    return Some(value.trim_matches('"').to_string());
                }
            }
        }
    }
    None
}

/// Synthesize an affinity cookie for the connection behind `context`
///
/// Returns the cookie value (lowercase hex) and installs a response-headers
/// modifier appending the matching `Set-Cookie` header. Yields `None` when
/// the context has no stream info to derive the value from.
pub fn generate_cookie(
    context: &mut dyn LoadBalancerContext,
    name: &str,
    path: &str,
    ttl: Duration,
    attributes: &[CookieAttribute],
) -> Option<String> {
    let info = context.stream_info()?;
    let source = format!(
        "{}{}",
        info.downstream_remote_address, info.downstream_local_address
    );
    let cookie_value = format!("{:016x}", xxh64(source.as_bytes(), 0));

    let header_value = make_set_cookie_value(name, &cookie_value, path, ttl, attributes);
    context.set_headers_modifier(Box::new(move |headers: &mut HeaderMap| {
        if let Ok(value) = HeaderValue::from_str(&header_value) {
            headers.append(SET_COOKIE, value);
        }
    }));

    Some(cookie_value)
}

/// Cookie-based session-affinity hash policy
#[derive(Debug, Clone)]
pub struct CookieHashPolicy {
    name: String,
    path: String,
    ttl: Duration,
    attributes: Vec<CookieAttribute>,
}

impl CookieHashPolicy {
    /// Create a policy for the cookie `name` scoped to `path`
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ttl,
            attributes: Vec::new(),
        }
    }

    /// Append extra cookie attributes
    #[must_use]
    pub fn with_attributes(mut self, attributes: Vec<CookieAttribute>) -> Self {
        self.attributes = attributes;
        self
    }
}

impl HashPolicy for CookieHashPolicy {
    fn generate_hash(&self, context: &mut dyn LoadBalancerContext) -> Option<u64> {
        if let Some(headers) = context.downstream_headers() {
            if let Some(value) = parse_cookie_value(headers, &self.name) {
                return Some(xxh64(value.as_bytes(), 0));
            }
        }
        let value = generate_cookie(context, &self.name, &self.path, self.ttl, &self.attributes)?;
        Some(xxh64(value.as_bytes(), 0))
    }
}
