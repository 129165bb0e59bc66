use axum::http::HeaderMap;

/// Header carrying the session id on every session-scoped request
pub const SESSION_HEADER: &str = "x-session-id";

/// Extract the session id from the `X-Session-ID` header
///
/// Returns the trimmed id if present and non-empty.
pub fn extract_session_id(headers: &HeaderMap) -> Result<String, SessionHeaderError> {
    let value = headers
        .get(SESSION_HEADER)
        .ok_or(SessionHeaderError::Missing)?
        .to_str()
        .map_err(|_| SessionHeaderError::InvalidFormat)?;

    let session_id = value.trim();
    if session_id.is_empty() {
        return Err(SessionHeaderError::Empty);
    }

    // Ids are URL-safe base64; anything else cannot name a session
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SessionHeaderError::InvalidFormat);
    }

    Ok(session_id.to_string())
}

/// Session header extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum SessionHeaderError {
    /// Header not present
    Missing,
    /// Not visible ASCII, or characters that never appear in a session id
    InvalidFormat,
    /// Header present but blank
    Empty,
}

impl std::fmt::Display for SessionHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionHeaderError::Missing => write!(f, "X-Session-ID header not provided"),
            SessionHeaderError::InvalidFormat => write!(f, "Invalid session id format"),
            SessionHeaderError::Empty => write!(f, "Session id is empty"),
        }
    }
}

impl std::error::Error for SessionHeaderError {}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_extract_valid_session_id() {
        let headers = headers_with("  AbC-123_xyz  ");
        assert_eq!(extract_session_id(&headers).unwrap(), "AbC-123_xyz");
    }

    #[test]
    fn test_header_name_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        let name: HeaderName = "X-Session-ID".parse().unwrap();
        headers.insert(name, HeaderValue::from_static("abc"));
        assert_eq!(extract_session_id(&headers).unwrap(), "abc");
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(
            extract_session_id(&HeaderMap::new()),
            Err(SessionHeaderError::Missing)
        );
    }

    #[test]
    fn test_empty_header() {
        assert_eq!(
            extract_session_id(&headers_with("   ")),
            Err(SessionHeaderError::Empty)
        );
    }

    #[test]
    fn test_invalid_characters() {
        assert_eq!(
            extract_session_id(&headers_with("abc/../def")),
            Err(SessionHeaderError::InvalidFormat)
        );
        assert_eq!(
            extract_session_id(&headers_with("abc def")),
            Err(SessionHeaderError::InvalidFormat)
        );
    }
}
