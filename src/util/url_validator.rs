use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Why a URL may not be fetched.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// Only http and https are fetched.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    /// Loopback, private, link-local or unspecified host.
    #[error("Local or private host not allowed: {0}")]
    PrivateHost(String),
}

/// Checks that a feed, redirect or icon URL is fetchable.
///
/// Every URL the fetcher follows passes through here, redirect targets
/// included, so a feed cannot bounce requests into the local network unless
/// `allow_private` is set.
///
/// ```
/// use feedwatch::util::validate_url;
///
/// let url = validate_url("https://example.com/feed.xml", false).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("http://localhost/feed", false).is_err());
/// assert!(validate_url("http://localhost/feed", true).is_ok());
/// assert!(validate_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_url(url_str: &str, allow_private: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlValidationError::UnsupportedScheme(url.scheme().to_owned()));
    }

    let local = match url.host() {
        None => return Err(UrlValidationError::MissingHost),
        Some(Host::Domain("")) => return Err(UrlValidationError::MissingHost),
        Some(Host::Domain(name)) => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            name == "localhost" || name.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => is_local_v4(ip),
        Some(Host::Ipv6(ip)) => is_local_v6(ip),
    };

    if local && !allow_private {
        let host = url.host_str().unwrap_or_default().to_owned();
        return Err(UrlValidationError::PrivateHost(host));
    }
    Ok(url)
}

fn is_local_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_local_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_local_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected_as_private(url: &str) -> bool {
        matches!(validate_url(url, false), Err(UrlValidationError::PrivateHost(_)))
    }

    #[test]
    fn test_public_urls_accepted() {
        assert!(validate_url("https://example.com/feed.xml", false).is_ok());
        assert!(validate_url("http://news.example.org:8080/rss", false).is_ok());
        assert!(validate_url("  https://example.com/  ", false).is_ok());
        assert!(validate_url("http://8.8.8.8/feed", false).is_ok());
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        for url in ["file:///etc/passwd", "ftp://example.com/feed", "javascript:alert(1)"] {
            assert!(
                matches!(validate_url(url, true), Err(UrlValidationError::UnsupportedScheme(_))),
                "{url}"
            );
        }
    }

    #[test]
    fn test_local_hosts_rejected() {
        for url in [
            "http://localhost/feed",
            "http://LOCALHOST./feed",
            "http://api.localhost/feed",
            "http://127.0.0.1/feed",
            "http://10.0.0.1:3000/feed",
            "http://172.16.0.1/feed",
            "http://192.168.1.1:8080/feed",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/feed",
            "http://[::1]/feed",
            "http://[fe80::1]/feed",
            "http://[fd00::1]/feed",
            "http://[::ffff:127.0.0.1]/feed",
        ] {
            assert!(rejected_as_private(url), "{url}");
        }
    }

    #[test]
    fn test_mapped_public_ipv6_accepted() {
        assert!(validate_url("http://[::ffff:8.8.8.8]/feed", false).is_ok());
        assert!(validate_url("http://[2001:db8::1]/feed", false).is_ok());
    }

    #[test]
    fn test_private_hosts_allowed_when_configured() {
        assert!(validate_url("http://127.0.0.1:8080/feed", true).is_ok());
        assert!(validate_url("http://[::1]/feed", true).is_ok());
        assert!(validate_url("http://localhost/feed", true).is_ok());
    }

    #[test]
    fn test_unparseable_url() {
        assert!(matches!(
            validate_url("not a url", false),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }
}
