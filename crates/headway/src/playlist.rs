// Segment source model. The engine never fetches or validates playlists
// itself; it consumes an ordered list of resolvable segment descriptors
// supplied once per session.

use m3u8_rs::MediaPlaylist;
use url::Url;

use crate::error::PrefetchError;

/// One addressable, sequentially indexed chunk of media content.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    pub index: u64,
    pub url: Url,
}

/// Ordered segment list. Position and index coincide; descriptors are
/// numbered from zero.
#[derive(Debug, Clone, Default)]
pub struct SegmentPlaylist {
    segments: Vec<SegmentDescriptor>,
}

impl SegmentPlaylist {
    pub fn from_urls(urls: impl IntoIterator<Item = Url>) -> Self {
        let segments = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| SegmentDescriptor {
                index: i as u64,
                url,
            })
            .collect();
        Self { segments }
    }

    /// Build a playlist from a parsed media playlist, resolving each segment
    /// URI against the URL the playlist was fetched from.
    pub fn from_media_playlist(
        media: &MediaPlaylist,
        playlist_url: &Url,
    ) -> Result<Self, PrefetchError> {
        let base_url = playlist_url
            .join(".")
            .map_err(|_| PrefetchError::invalid_url(playlist_url.as_str(), "no base URL"))?;

        let mut urls = Vec::with_capacity(media.segments.len());
        for segment in &media.segments {
            urls.push(resolve_url(&segment.uri, &base_url)?);
        }
        Ok(Self::from_urls(urls))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&SegmentDescriptor> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.segments.get(i))
    }

    pub fn contains(&self, index: u64) -> bool {
        self.get(index).is_some()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.segments.last().map(|s| s.index)
    }
}

/// Resolve a segment URI against a base URL. Absolute URIs pass through.
pub fn resolve_url(uri: &str, base_url: &Url) -> Result<Url, PrefetchError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.parse::<Url>()
            .map_err(|e| PrefetchError::invalid_url(uri, e.to_string()))
    } else {
        base_url
            .join(uri)
            .map_err(|e| PrefetchError::invalid_url(uri, e.to_string()))
    }
}
