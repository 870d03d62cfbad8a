use crate::error::{ErrorKind, Result};
use attire_cache::{CacheEntry, ContentCache, ContentHash};
use exn::ResultExt;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

/// Verify decompressed `content` against `hash`, then move it into the cache
/// root and index it.
///
/// Nothing is left behind on failure: the temporary file, the content file
/// and its index entry are all removed.
pub(crate) async fn store(cache: &ContentCache, hash: ContentHash, content: &[u8]) -> Result<CacheEntry> {
    let actual = ContentHash::of_bytes(content);
    if actual != hash {
        tracing::warn!(%hash, %actual, "Received content doesn't match its hash");
        exn::bail!(ErrorKind::Corruption(hash));
    }

    let temp = cache.temp_path(&hash);
    let target = cache.content_path(&hash);
    let written: std::io::Result<()> = async {
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &target).await
    }
    .await;
    if let Err(err) = written {
        discard(&temp).await;
        return Err(err).or_raise(|| ErrorKind::Storage);
    }

    match cache.record(&target, hash).await {
        Ok(entry) => Ok(entry),
        Err(err) => {
            let kind = if err.is_corruption() { ErrorKind::Corruption(hash) } else { ErrorKind::Storage };
            tracing::warn!(%hash, error = ?err, "Discarding stored file");
            discard(&target).await;
            if let Some(logical) = cache.roots().logical(&target) {
                cache.remove(&hash, &logical).await;
            }
            Err(err).or_raise(|| kind)
        },
    }
}

/// Delete a partial or rejected file. Already gone is fine.
pub(crate) async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {},
        Err(err) if err.kind() == IoErrorKind::NotFound => {},
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "Could not delete file"),
    }
}
