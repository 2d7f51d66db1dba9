use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Reasons a URL is refused as a feed source.
///
/// These errors cover both parsing failures and policy violations designed
/// to keep the fetcher away from internal networks.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL uses a literal IP address instead of a host name.
    #[error("IP address hosts not allowed: {0}")]
    IpLiteral(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
    /// The host is a local-network name (`.local`, `.home.arpa`).
    #[error("Local network host not allowed: {0}")]
    LocalNetwork(String),
    /// The host or one of its parent domains is blocklisted.
    #[error("Host is blocklisted: {0}")]
    Blocked(String),
}

/// Hosts that may never be added as feed sources.
///
/// A blocked entry also blocks every subdomain of it.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    hosts: HashSet<String>,
}

impl Blocklist {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Parse a blocklist file: one host per line, `#` starts a comment.
    pub fn parse(content: &str) -> Self {
        Self::new(
            content
                .lines()
                .map(|line| line.split('#').next().unwrap_or("").trim()),
        )
    }

    /// Read a blocklist file from disk
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let blocklist = Self::parse(&content);
        tracing::debug!(path = %path.display(), hosts = blocklist.len(), "Loaded host blocklist");
        Ok(blocklist)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The blocklisted entry matching `host` or one of its parent domains
    pub fn matching(&self, host: &str) -> Option<&str> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut candidate = host.as_str();
        loop {
            if let Some(blocked) = self.hosts.get(candidate) {
                return Some(blocked.as_str());
            }
            match candidate.split_once('.') {
                Some((_, parent)) => candidate = parent,
                None => return None,
            }
        }
    }
}

/// Validates a URL string for use as a feed source.
///
/// Rejects:
/// - Non-HTTP(S) schemes (e.g., `file://`, `ftp://`)
/// - Localhost and local-network names (`.local`, `.home.arpa`)
/// - Private and loopback IP ranges, and IP-literal hosts in general
/// - Hosts on the blocklist, including their subdomains
///
/// # Examples
///
/// ```
/// use feedvault::util::{validate_feed_url, Blocklist};
///
/// let url = validate_feed_url("https://example.com/feed.xml", &Blocklist::default()).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_feed_url("http://localhost/feed", &Blocklist::default()).is_err());
/// assert!(validate_feed_url("http://192.168.1.1/feed", &Blocklist::default()).is_err());
/// assert!(validate_feed_url("file:///etc/passwd", &Blocklist::default()).is_err());
/// ```
pub fn validate_feed_url(url_str: &str, blocklist: &Blocklist) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    let host = host.to_ascii_lowercase();

    if host == "localhost" || host.ends_with(".localhost") {
        return Err(UrlValidationError::Localhost);
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
        return Err(UrlValidationError::IpLiteral(ip.to_string()));
    }

    let bare = host.trim_end_matches('.');
    if bare.ends_with(".local") || bare.ends_with(".home.arpa") || bare == "home.arpa" {
        return Err(UrlValidationError::LocalNetwork(host.clone()));
    }

    if let Some(blocked) = blocklist.matching(&host) {
        return Err(UrlValidationError::Blocked(blocked.to_string()));
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}
