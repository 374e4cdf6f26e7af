//! The lyrics-fetching boundary.
//!
//! The queue and pool only ever see the [`LyricsFetcher`] trait; the real
//! Genius-backed client lives in [`genius`], and tests substitute
//! programmable mocks. Every failure is a typed [`FetchError`] so rate
//! limiting (with its retry-after hint) stays distinguishable from a song
//! that simply has no lyrics page.

pub mod genius;

use async_trait::async_trait;
use thiserror::Error;

use crate::queue::Song;

pub use genius::GeniusClient;

/// Errors that can occur while fetching lyrics.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The provider throttled us; carries the Retry-After hint in seconds
    /// when the provider sent one.
    #[error("rate limited by the lyrics provider")]
    RateLimited { retry_after: Option<u64> },

    /// The search turned up no match for the song.
    #[error("no match found for '{artist} - {title}'")]
    SongNotFound { title: String, artist: String },

    /// The song page exists but no lyrics could be extracted from it.
    #[error("no lyrics found at {url}")]
    LyricsNotFound { url: String },

    /// The HTTP request itself failed.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with something unexpected.
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Whether this failure was external throttling.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

/// Successfully fetched lyrics together with their source page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedLyrics {
    /// Page the lyrics were extracted from.
    pub source_url: String,
    /// The lyrics text, verse blocks separated by blank lines.
    pub lyrics: String,
}

/// Turns a song reference into lyrics text.
///
/// Implementations are shared across all workers, so any internal rate
/// limiting applies to the process as a whole rather than per worker.
#[async_trait]
pub trait LyricsFetcher: Send + Sync {
    /// Fetches lyrics for `song`, or a typed failure.
    async fn fetch_lyrics(&self, song: &Song) -> Result<FetchedLyrics, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_predicate() {
        let err = FetchError::RateLimited {
            retry_after: Some(30),
        };
        assert!(err.is_rate_limited());

        let err = FetchError::SongNotFound {
            title: "Sky".to_string(),
            artist: "Playboi Carti".to_string(),
        };
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_error_display_carries_context() {
        let err = FetchError::SongNotFound {
            title: "Sky".to_string(),
            artist: "Playboi Carti".to_string(),
        };
        assert!(err.to_string().contains("Playboi Carti - Sky"));

        let err = FetchError::LyricsNotFound {
            url: "https://genius.com/x".to_string(),
        };
        assert!(err.to_string().contains("https://genius.com/x"));
    }
}
