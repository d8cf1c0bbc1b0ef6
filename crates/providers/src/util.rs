use od_domain::Error;

/// Map a reqwest error into the shared error type, preserving the
/// timeout/transport distinction the retry policy keys on.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}
