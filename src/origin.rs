//! Origin checks applied before a request is upgraded.
//!
//! Browsers always send an `Origin` header with WebSocket upgrades, which makes it the
//! only defence against cross-site WebSocket hijacking. [`OriginPolicy::SameOrigin`]
//! is the default.
use std::{fmt, sync::Arc};

use hyper::header;
use url::Url;

use crate::RequestView;

/// A caller-supplied origin predicate.
pub type OriginCheck = Arc<dyn Fn(&RequestView<'_>) -> bool + Send + Sync>;

/// Decides whether the `Origin` of an upgrade request is acceptable.
#[derive(Clone, Default)]
pub enum OriginPolicy {
    /// The origin's authority, as written, must equal the `Host` header, compared ASCII
    /// case-insensitively. Ports are not normalized: `https://h:443` matches `Host: h:443`
    /// but not `Host: h`. Requests without an `Origin` are refused.
    #[default]
    SameOrigin,
    /// The origin must match an entry exactly. An entry `"*"` matches anything and an
    /// entry `"*.example.com"` matches any subdomain of `example.com`.
    AllowList(Vec<String>),
    /// Every request is accepted.
    Any,
    /// The predicate decides.
    Custom(OriginCheck),
}

impl OriginPolicy {
    /// Creates an allow-list policy.
    pub fn allow_list<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllowList(origins.into_iter().map(Into::into).collect())
    }

    /// Creates a policy from a predicate.
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&RequestView<'_>) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(check))
    }

    /// Returns `true` if `request` passes the policy.
    pub fn check(&self, request: &RequestView<'_>) -> bool {
        match self {
            OriginPolicy::SameOrigin => same_origin(request),
            OriginPolicy::AllowList(allowed) => request
                .header(header::ORIGIN)
                .is_some_and(|origin| allowed.iter().any(|entry| origin_matches(entry, origin))),
            OriginPolicy::Any => true,
            OriginPolicy::Custom(check) => check(request),
        }
    }
}

impl fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginPolicy::SameOrigin => f.write_str("SameOrigin"),
            OriginPolicy::AllowList(allowed) => f.debug_tuple("AllowList").field(allowed).finish(),
            OriginPolicy::Any => f.write_str("Any"),
            OriginPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn same_origin(request: &RequestView<'_>) -> bool {
    let (Some(origin), Some(host)) = (request.header(header::ORIGIN), request.host()) else {
        return false;
    };
    origin_authority(origin).is_some_and(|authority| authority.eq_ignore_ascii_case(host))
}

/// The authority of an origin URL exactly as the client wrote it.
fn origin_authority(origin: &str) -> Option<&str> {
    Url::parse(origin).ok()?.host_str()?;
    let (_, rest) = origin.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&rest[..end])
}

fn origin_matches(entry: &str, origin: &str) -> bool {
    if entry == "*" || entry == origin {
        return true;
    }
    if !entry.starts_with("*.") {
        return false;
    }
    // keeps the dot: "*.example.com" matches "https://api.example.com" but not
    // "https://example.com" or "https://evilexample.com"
    let suffix = &entry[1..];
    match Url::parse(origin) {
        Ok(url) => url.host_str().is_some_and(|host| {
            host.len() > suffix.len()
                && host
                    .get(host.len() - suffix.len()..)
                    .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
        }),
        Err(_) => false,
    }
}
