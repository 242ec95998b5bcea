use crate::UrlError;
use url::Url;

/// Lowercased host of a URL, None for URLs without one
///
/// # Examples
///
/// ```
/// use url::Url;
/// use scrape_relay::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.COM/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Parses a URL string and returns the domain the rate limiter keys it under
///
/// A leading `www.` is dropped so `www.example.com` and `example.com` share
/// one politeness budget.
///
/// # Arguments
///
/// * `url_str` - Absolute URL of a page to fetch
///
/// # Returns
///
/// * `Ok(String)` - Lowercased host without `www.`
/// * `Err(UrlError)` - The URL does not parse or has no host
pub fn domain_of(url_str: &str) -> Result<String, UrlError> {
    let url = Url::parse(url_str).map_err(|e| UrlError::Parse(e.to_string()))?;
    let domain = extract_domain(&url).ok_or(UrlError::MissingDomain)?;
    Ok(domain
        .strip_prefix("www.")
        .map(str::to_string)
        .unwrap_or(domain))
}
