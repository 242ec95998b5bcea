use crate::job::ScrapeConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Identity of a job's work: two submissions with equal keys are the same job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Computes the dedup key of a set of normalized URLs and scrape settings
///
/// The URL set is sorted and de-duplicated first, so submission order does not
/// change the key.
pub fn compute_dedup_key(urls: &[Url], config: &ScrapeConfig) -> DedupKey {
    let mut sorted: Vec<&str> = urls.iter().map(Url::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for url in sorted {
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"--\n");
    hasher.update(config.canonical().as_bytes());

    DedupKey(hex::encode(hasher.finalize()))
}
