use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Burrow's config carries bare port numbers, which become the shorthand
/// `":PORT"` meaning "bind on all interfaces". Rust's `SocketAddr` parsing and
/// Tokio bind APIs do not accept `":PORT"`, so normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}
