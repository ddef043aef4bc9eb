use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Why a candidate feed URL was rejected.
///
/// Covers plain parse failures as well as the SSRF policy: a feed URL may
/// come from an untrusted OPML file, so anything that would make the fetcher
/// talk to internal infrastructure is refused up front.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("invalid URL: {0}")]
    Invalid(#[from] url::ParseError),
    /// Scheme other than http or https.
    #[error("unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// Host resolves to a loopback address or the literal `localhost`.
    #[error("localhost not allowed")]
    Loopback,
    /// Host is a private, link-local, or otherwise non-routable address.
    #[error("private address not allowed: {0}")]
    PrivateAddress(String),
}

/// Validates a URL before it is stored as a subscription source.
///
/// Accepts only `http`/`https` URLs whose host is not `localhost`, a
/// loopback address, or an address in a private or link-local range.
/// Hostnames that do not parse as IP literals pass; DNS-level rebinding is
/// out of scope here.
///
/// # Examples
///
/// ```
/// use millrace::util::validate_url;
///
/// let url = validate_url("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("file:///etc/passwd").is_err());
/// assert!(validate_url("http://127.0.0.1/feed").is_err());
/// ```
pub fn validate_url(raw: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(raw)?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlValidationError::UnsupportedScheme(other.to_owned())),
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(UrlValidationError::Loopback);
        }

        // IPv6 literals arrive bracketed from the url crate
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = bare.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Loopback);
            }
            if is_non_routable(&ip) {
                return Err(UrlValidationError::PrivateAddress(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_non_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            if v6.is_unspecified() {
                return true;
            }
            let head = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            (head & 0xfe00) == 0xfc00 || (head & 0xffc0) == 0xfe80
        }
    }
}
