//! HTML extraction for fetched pages
//!
//! Pulls the title and, when the job asks for them, absolute link and image URLs
//! out of a fetched document.

use scraper::{Html, Selector};
use url::Url;

/// Information extracted from an HTML page
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub links: Vec<String>,
    pub images: Vec<String>,
}

/// Parses HTML and extracts the requested metadata
///
/// # Link Extraction Rules
///
/// **Include:**
/// - `<a href="...">` tags
/// - `<link rel="canonical" href="...">`
///
/// **Exclude:**
/// - `<a href="..." download>`
/// - `javascript:`, `mailto:`, `tel:` links
/// - Data URIs and fragment-only anchors
pub fn parse_page(html: &str, base_url: &Url, links: bool, images: bool) -> ParsedPage {
    let document = Html::parse_document(html);

    ParsedPage {
        title: extract_title(&document),
        links: if links {
            extract_links(&document, base_url)
        } else {
            Vec::new()
        },
        images: if images {
            extract_images(&document, base_url)
        } else {
            Vec::new()
        },
    }
}

fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let mut links = Vec::new();

    if let Ok(a_selector) = Selector::parse("a[href]") {
        for element in document.select(&a_selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(absolute_url) = element
                .value()
                .attr("href")
                .and_then(|href| resolve(href, base_url))
            {
                links.push(absolute_url);
            }
        }
    }

    if let Ok(canonical_selector) = Selector::parse("link[rel='canonical'][href]") {
        links.extend(
            document
                .select(&canonical_selector)
                .filter_map(|element| element.value().attr("href"))
                .filter_map(|href| resolve(href, base_url)),
        );
    }

    links
}

fn extract_images(document: &Html, base_url: &Url) -> Vec<String> {
    let Ok(img_selector) = Selector::parse("img[src]") else {
        return Vec::new();
    };

    document
        .select(&img_selector)
        .filter_map(|element| element.value().attr("src"))
        .filter_map(|src| resolve(src, base_url))
        .collect()
}

/// Resolves an href to an absolute HTTP(S) URL, or None if it should be skipped
fn resolve(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    let absolute_url = base_url.join(href).ok()?;
    match absolute_url.scheme() {
        "http" | "https" => Some(absolute_url.to_string()),
        _ => None,
    }
}
