use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{HozonError, HozonResult},
    fetch::SegmentFetcher,
};

const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF";

/// A media playlist and the url it was loaded from.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    /// Base for every relative uri inside the playlist.
    pub url: Url,
    pub text: String,
}

/// Whether the playlist text lists variant streams instead of segments.
pub fn is_master_playlist(text: &str) -> bool {
    text.contains(STREAM_INF_TAG)
}

/// The first variant uri of a master playlist.
pub fn first_variant(text: &str) -> Option<&str> {
    let mut lines = text.lines().map(str::trim);
    lines.find(|line| line.starts_with(STREAM_INF_TAG))?;
    lines.find(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Load the media playlist behind `url`.
///
/// A master playlist is dereferenced through its first variant.
pub async fn resolve_playlist(
    fetcher: &SegmentFetcher,
    url: Url,
    cancel: &CancellationToken,
) -> HozonResult<ResolvedPlaylist> {
    tracing::info!("Start fetching M3U8 file.");
    let text = fetcher.fetch_text(&url, cancel).await?;
    if !is_master_playlist(&text) {
        return Ok(ResolvedPlaylist { url, text });
    }

    let variant = first_variant(&text).ok_or(HozonError::MissingVariant)?;
    let url = url.join(variant)?;
    tracing::info!("Master playlist detected. Selected stream: {url}");

    let text = fetcher.fetch_text(&url, cancel).await?;
    Ok(ResolvedPlaylist { url, text })
}
