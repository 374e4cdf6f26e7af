//! Genius-backed lyrics fetcher.
//!
//! Fetching is a two-step flow: the Genius search API resolves a song
//! reference to a song page URL, then the page HTML is fetched and the
//! lyrics containers are extracted. A single `governor` rate limiter gates
//! every outbound request, so the configured budget holds across the whole
//! worker pool.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::queue::Song;

use super::{FetchError, FetchedLyrics, LyricsFetcher};

const GENIUS_API_URL: &str = "https://api.genius.com";
const USER_AGENT: &str = "lyricforge/0.1.0 (https://github.com/CortexLM/lyricforge)";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SearchResponse {
    response: SearchBody,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    result: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    url: String,
    #[serde(default)]
    full_title: Option<String>,
}

/// Lyrics fetcher backed by the Genius API and song pages.
pub struct GeniusClient {
    client: reqwest::Client,
    api_key: String,
    rate_limiter: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    container_re: Regex,
    br_re: Regex,
    tag_re: Regex,
}

impl GeniusClient {
    /// Creates a client allowing `requests` outbound requests per `window`.
    pub fn new(
        api_key: impl Into<String>,
        requests: u32,
        window: Duration,
    ) -> Result<Self, FetchError> {
        let burst = NonZeroU32::new(requests.max(1)).unwrap(); // max(1) keeps this non-zero
        let replenish = window.max(Duration::from_millis(1)) / requests.max(1);
        let quota = governor::Quota::with_period(replenish)
            .unwrap() // replenish is non-zero by construction
            .allow_burst(burst);
        let rate_limiter = governor::RateLimiter::direct(quota);

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            rate_limiter,
            // Each verse block of a song page sits in one of these divs.
            container_re: Regex::new(r#"(?s)<div[^>]*data-lyrics-container="true"[^>]*>(.*?)</div>"#)
                .expect("container pattern is valid"),
            br_re: Regex::new(r"(?i)<br\s*/?>").expect("br pattern is valid"),
            tag_re: Regex::new(r"<[^>]+>").expect("tag pattern is valid"),
        })
    }

    /// Resolves a song to its Genius page URL via the search API.
    async fn search_song_url(&self, song: &Song) -> Result<String, FetchError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(format!("{}/search", GENIUS_API_URL))
            .bearer_auth(&self.api_key)
            .query(&[("q", format!("{} {}", song.title, song.artist))])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                retry_after: retry_after_hint(&response),
            });
        }
        if !response.status().is_success() {
            return Err(FetchError::InvalidResponse(format!(
                "search returned status {}",
                response.status()
            )));
        }

        let search: SearchResponse = response.json().await?;
        let hit = search
            .response
            .hits
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::SongNotFound {
                title: song.title.clone(),
                artist: song.artist.clone(),
            })?;

        debug!(
            song = %song,
            matched = hit.result.full_title.as_deref().unwrap_or("<untitled>"),
            url = %hit.result.url,
            "search matched a song page"
        );
        Ok(hit.result.url)
    }

    /// Fetches a song page and extracts the lyrics text.
    async fn fetch_page_lyrics(&self, url: &str) -> Result<String, FetchError> {
        self.rate_limiter.until_ready().await;

        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                retry_after: retry_after_hint(&response),
            });
        }
        if !response.status().is_success() {
            return Err(FetchError::InvalidResponse(format!(
                "song page returned status {}",
                response.status()
            )));
        }

        let html = response.text().await?;
        self.extract_lyrics(&html)
            .ok_or_else(|| FetchError::LyricsNotFound {
                url: url.to_string(),
            })
    }

    /// Extracts lyrics from song-page HTML.
    ///
    /// Line breaks inside a container become newlines, remaining markup is
    /// stripped, and containers are joined by blank lines. Returns `None`
    /// when the page holds no non-empty lyrics container.
    fn extract_lyrics(&self, html: &str) -> Option<String> {
        let mut blocks = Vec::new();
        for captures in self.container_re.captures_iter(html) {
            let block = &captures[1];
            let block = self.br_re.replace_all(block, "\n");
            let block = self.tag_re.replace_all(&block, "");
            let block = unescape_entities(&block);
            let block = block.trim();
            if !block.is_empty() {
                blocks.push(block.to_string());
            }
        }

        if blocks.is_empty() {
            None
        } else {
            Some(blocks.join("\n\n"))
        }
    }
}

#[async_trait]
impl LyricsFetcher for GeniusClient {
    async fn fetch_lyrics(&self, song: &Song) -> Result<FetchedLyrics, FetchError> {
        let url = self.search_song_url(song).await?;
        let lyrics = self.fetch_page_lyrics(&url).await?;
        Ok(FetchedLyrics {
            source_url: url,
            lyrics,
        })
    }
}

/// Reads the Retry-After header as whole seconds, when present and numeric.
fn retry_after_hint(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Decodes the handful of HTML entities that show up in lyrics markup.
fn unescape_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GeniusClient {
        GeniusClient::new("test-key", 10, Duration::from_secs(60)).expect("client should build")
    }

    #[test]
    fn test_extract_lyrics_from_containers() {
        let html = r#"
            <html><body>
            <div data-lyrics-container="true">First line<br>Second line</div>
            <div class="ad">buy stuff</div>
            <div data-lyrics-container="true"><a href="/x">Third</a> line</div>
            </body></html>
        "#;

        let lyrics = client().extract_lyrics(html).expect("lyrics expected");
        assert_eq!(lyrics, "First line\nSecond line\n\nThird line");
    }

    #[test]
    fn test_extract_lyrics_handles_self_closing_br_and_entities() {
        let html = r#"<div data-lyrics-container="true">Can&#x27;t stop<br/>Won&amp;t stop</div>"#;
        let lyrics = client().extract_lyrics(html).expect("lyrics expected");
        assert_eq!(lyrics, "Can't stop\nWon&t stop");
    }

    #[test]
    fn test_extract_lyrics_empty_page_is_none() {
        assert!(client().extract_lyrics("<html><body>nope</body></html>").is_none());
        let empty = r#"<div data-lyrics-container="true">   </div>"#;
        assert!(client().extract_lyrics(empty).is_none());
    }

    #[test]
    fn test_unescape_entities() {
        assert_eq!(unescape_entities("a &amp; b&nbsp;c"), "a & b c");
    }

    #[tokio::test]
    #[ignore] // Requires network access and GENIUS_API_KEY - run with: cargo test -- --ignored
    async fn test_fetch_real_song() {
        let key = std::env::var("GENIUS_API_KEY").expect("GENIUS_API_KEY must be set");
        let client = GeniusClient::new(key, 10, Duration::from_secs(60)).expect("client");
        let song = Song::new("Magnolia", "Playboi Carti");

        let fetched = client.fetch_lyrics(&song).await.expect("fetch should work");
        assert!(fetched.source_url.contains("genius.com"));
        assert!(!fetched.lyrics.is_empty());
    }
}
