//! Derivation of follow-up requests for redirect responses.

use std::collections::HashSet;

use http::{
    header::{self, HeaderMap, HeaderName},
    Method, StatusCode, Uri,
};
use url::Url;

use crate::{
    client::{RedirectError, RedirectPolicy},
    entity::Body,
    request::RequestHead,
};

/// Headers never carried over to a redirect target.
const STRIPPED: &[HeaderName] = &[
    header::PROXY_AUTHORIZATION,
    header::PROXY_AUTHENTICATE,
    header::HOST,
    header::FORWARDED,
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
    header::IF_RANGE,
    header::AUTHORIZATION,
    header::REFERER,
    header::COOKIE,
];

pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Builds the request for the next hop.
///
/// `replay` is a copy of the previous request body, `None` when that body could only be sent
/// once. The target is recorded in `visited`.
pub(crate) fn next_request(
    status: StatusCode,
    headers: &HeaderMap,
    prev: &RequestHead,
    replay: Option<Body>,
    visited: &mut HashSet<Uri>,
    policy: &RedirectPolicy,
) -> Result<(RequestHead, Body), RedirectError> {
    let location = headers
        .get(header::LOCATION)
        .ok_or(RedirectError::MissingLocation(status))?;
    let location = location.to_str().map_err(|_| {
        RedirectError::InvalidLocation(String::from_utf8_lossy(location.as_bytes()).into_owned())
    })?;
    if location.trim().is_empty() {
        return Err(RedirectError::MissingLocation(status));
    }

    let uri = resolve(&prev.uri, location)?;

    if !visited.insert(uri.clone()) {
        return Err(RedirectError::LoopDetected(uri));
    }
    if visited.len() > policy.max_redirects {
        return Err(RedirectError::LimitExceeded(policy.max_redirects));
    }

    let method = match status {
        StatusCode::SEE_OTHER if prev.method != Method::HEAD => Method::GET,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
            if prev.method == Method::POST && !policy.preserve_method =>
        {
            Method::GET
        }
        _ => prev.method.clone(),
    };
    let drop_body = method != prev.method;

    let mut head = RequestHead::new(method, uri);
    head.version = prev.version;
    head.headers = prev.headers.clone();

    for name in STRIPPED {
        head.headers.remove(name);
    }

    let body = if drop_body {
        let content: Vec<HeaderName> = head
            .headers
            .keys()
            .filter(|name| name.as_str().starts_with("content-"))
            .cloned()
            .collect();
        for name in content {
            head.headers.remove(name);
        }
        head.headers.remove(header::TRANSFER_ENCODING);
        Body::None
    } else {
        replay.ok_or_else(|| RedirectError::NonReplayableBody(head.uri.clone()))?
    };

    log::debug!(
        "following {} redirect: {} {} -> {} {}",
        status,
        prev.method,
        prev.uri,
        head.method,
        head.uri
    );
    Ok((head, body))
}

/// Resolves `location` against `base`, dropping any fragment.
fn resolve(base: &Uri, location: &str) -> Result<Uri, RedirectError> {
    let invalid = || RedirectError::InvalidLocation(location.to_owned());

    let base = Url::parse(&base.to_string()).map_err(|_| invalid())?;
    let mut target = base.join(location).map_err(|_| invalid())?;
    target.set_fragment(None);

    if !matches!(target.scheme(), "http" | "https") {
        return Err(invalid());
    }

    target.as_str().parse::<Uri>().map_err(|_| invalid())
}
