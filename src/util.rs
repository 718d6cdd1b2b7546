use http::{header::HeaderName, HeaderMap, HeaderValue, Method};

/// Replaces entries in `dst` with entries from `src`, preserving multi-value
/// insertion order for repeated names in `src`.
pub(crate) fn replace_headers(dst: &mut HeaderMap, src: HeaderMap) {
    // The first time a name is yielded, `remove` clears any defaults so the
    // appended values fully replace them.
    let mut prev_name: Option<HeaderName> = None;
    for (key, value) in src {
        match key {
            Some(name) => {
                dst.remove(&name);
                dst.append(name.clone(), value);
                prev_name = Some(name);
            }
            None => match prev_name {
                Some(ref name) => {
                    dst.append(name.clone(), value);
                }
                None => unreachable!("HeaderMap::into_iter yields a name before values"),
            },
        }
    }
}

/// Whether a method is safe to replay without an explicit override.
///
/// PUT is included per RFC 7231 section 4.2.2; callers can override either
/// way on the request.
pub(crate) fn method_is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE | Method::PUT | Method::TRACE
    )
}
