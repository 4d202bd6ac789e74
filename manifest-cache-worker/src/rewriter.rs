use std::borrow::Cow;
use std::sync::Arc;

use manifest_cache_common::blob::BlobStore;
use manifest_cache_common::fetch::ResourceFetcher;
use manifest_cache_common::message::Message;
use percent_encoding::percent_decode_str;
use roxmltree::{Document, ParsingOptions};
use tracing::{info, warn};
use url::Url;

use crate::error::RewriteError;

/// The optional `<doc>` field holding the manifest URL.
pub const MANIFEST_FIELD_NAME: &str = "url_iiif_manifest_stored";

/// Copies the manifest a document references into the cache bucket and points
/// the document at the cached copy.
pub struct DocumentRewriter {
    fetcher: Arc<dyn ResourceFetcher>,
    store: Arc<dyn BlobStore>,
    cache_bucket: String,
}

impl DocumentRewriter {
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        store: Arc<dyn BlobStore>,
        cache_bucket: &str,
    ) -> Self {
        Self {
            fetcher,
            store,
            cache_bucket: cache_bucket.to_owned(),
        }
    }

    /// Rewrite a single payload.
    ///
    /// Returns the payload borrowed and untouched when the document has no
    /// manifest field. On success only the first `>url<` occurrence changes,
    /// every other byte of the document is kept as is. On error the caller
    /// keeps the original payload.
    pub async fn rewrite<'a>(&self, payload: &'a [u8]) -> Result<Cow<'a, [u8]>, RewriteError> {
        let Some(manifest_url) = extract_manifest_url(payload)? else {
            return Ok(Cow::Borrowed(payload));
        };

        let url = validate_url(&manifest_url)?;
        let key = bucket_key(&url);
        if key.is_empty() {
            return Err(RewriteError::BadUrl(manifest_url));
        }

        let body = self.fetcher.fetch(&manifest_url).await?;
        let new_url = self.store.put(&self.cache_bucket, &key, body).await?;

        let rewritten = replace_first(payload, &manifest_url, &new_url);
        match rewritten {
            Cow::Owned(_) => info!("rewriting manifest URL from {manifest_url} -> {new_url}"),
            Cow::Borrowed(_) => warn!(
                "manifest {manifest_url} cached as {new_url} but not found verbatim in the document"
            ),
        }
        metrics::counter!(crate::metrics_consts::MANIFESTS_CACHED).increment(1);
        Ok(rewritten)
    }

    /// Rewrite a message payload in place.
    pub async fn cache(&self, message: &mut Message) -> Result<(), RewriteError> {
        let rewritten = match self.rewrite(&message.payload).await? {
            Cow::Borrowed(_) => None,
            Cow::Owned(payload) => Some(payload),
        };
        if let Some(payload) = rewritten {
            message.payload = payload;
        }
        Ok(())
    }
}

/// Find `//doc/field[@name='url_iiif_manifest_stored']` and return its text.
pub fn extract_manifest_url(payload: &[u8]) -> Result<Option<String>, RewriteError> {
    let text = std::str::from_utf8(payload)?;
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let document = Document::parse_with_options(text, options)?;

    let field = document.descendants().find(|node| {
        node.has_tag_name("field")
            && node.attribute("name") == Some(MANIFEST_FIELD_NAME)
            && node
                .parent_element()
                .is_some_and(|parent| parent.has_tag_name("doc"))
    });

    Ok(field.map(|field| {
        field
            .descendants()
            .filter(|node| node.is_text())
            .filter_map(|node| node.text())
            .collect()
    }))
}

/// An absolute URL with both a scheme and a host.
pub fn validate_url(value: &str) -> Result<Url, RewriteError> {
    Url::parse(value)
        .ok()
        .filter(|url| {
            !url.scheme().is_empty() && url.host_str().is_some_and(|host| !host.is_empty())
        })
        .ok_or_else(|| RewriteError::BadUrl(value.to_owned()))
}

/// The cache key for a manifest: its decoded URL path without the leading
/// separator, with separators and colons turned into hyphens.
pub fn bucket_key(url: &Url) -> String {
    let path = percent_decode_str(url.path()).decode_utf8_lossy();
    path.strip_prefix('/').unwrap_or(&*path).replace(['/', ':'], "-")
}

fn replace_first<'a>(payload: &'a [u8], from: &str, to: &str) -> Cow<'a, [u8]> {
    let needle = format!(">{from}<");
    let Some(start) = payload
        .windows(needle.len())
        .position(|window| window == needle.as_bytes())
    else {
        return Cow::Borrowed(payload);
    };

    let mut rewritten = Vec::with_capacity(payload.len() - from.len() + to.len());
    rewritten.extend_from_slice(&payload[..start]);
    rewritten.push(b'>');
    rewritten.extend_from_slice(to.as_bytes());
    rewritten.push(b'<');
    rewritten.extend_from_slice(&payload[start + needle.len()..]);
    Cow::Owned(rewritten)
}
