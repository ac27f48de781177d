use sha2::{Digest, Sha256};

/// Suffix of the JSON sidecar written next to ETag-named cache entries.
pub const META_SUFFIX: &str = ".json";

/// Derive a cache filename from a URL and, when known, its ETag.
///
/// The name is `sha256(url)` optionally followed by `.sha256(etag)`, so a
/// new content version of the same URL lands in a new file. Keras-style
/// `.h5` URLs keep their extension because loaders sniff it.
#[must_use]
pub fn url_to_filename(url: &str, etag: Option<&str>) -> String {
    let mut filename = hex::encode(Sha256::digest(url.as_bytes()));
    if let Some(etag) = etag {
        filename.push('.');
        filename.push_str(&hex::encode(Sha256::digest(etag.as_bytes())));
    }
    if url.ends_with(".h5") {
        filename.push_str(".h5");
    }
    filename
}

/// Prefix shared by every cached version of `url`.
pub(crate) fn url_prefix(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}
