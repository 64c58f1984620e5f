//! Artwork and metadata resolution backed by IMDb title pages.
//!
//! IMDb has no public API; the poster and display metadata are scraped
//! from the `og:title` and `og:image` meta tags of the title page. All
//! failures degrade to "no artwork": a missing poster is never worth
//! blocking a presence update over.

use async_trait::async_trait;
use regex_lite::Regex;
use thiserror::Error;

use crate::artwork::{Artwork, ArtworkResolver};
use crate::media::MediaItem;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid scrape pattern: {0}")]
    Pattern(String),
}

/// Metadata scraped from one title page.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Metadata {
    pub title: Option<String>,
    pub year: Option<String>,
    pub rating: Option<String>,
    pub poster_url: Option<String>,
}

impl Metadata {
    /// Hover-text line, e.g. `Heat (1995) ★ 8.3`.
    #[must_use]
    pub fn caption(&self) -> Option<String> {
        let mut caption = self.title.clone()?;
        if let Some(year) = &self.year {
            caption.push_str(&format!(" ({year})"));
        }
        if let Some(rating) = &self.rating {
            caption.push_str(&format!(" ★ {rating}"));
        }
        Some(caption)
    }
}

/// Scrapes IMDb title pages for poster art and display metadata.
pub struct ImdbResolver {
    client: reqwest::Client,
    language: String,
    og_title: Regex,
    og_image: Regex,
    trailing_rating: Regex,
    year: Regex,
    junk: Regex,
    whitespace: Regex,
}

impl ImdbResolver {
    /// Served like a desktop browser; IMDb returns a reduced page to
    /// unknown agents.
    const USER_AGENT: &'static str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

    pub fn new(language: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(Self::USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            language: language.to_owned(),
            og_title: compile(r#"(?i)<meta[^>]+property="og:title"[^>]+content="([^"]+)""#)?,
            og_image: compile(r#"(?i)<meta[^>]+property="og:image"[^>]+content="([^"]+)""#)?,
            trailing_rating: compile(r"(\d\.\d|\d)$")?,
            year: compile(r"\((\d{4})\)")?,
            junk: compile(r"[^\w\s\d\-',.!].*$")?,
            whitespace: compile(r"\s+")?,
        })
    }

    /// Fetches and scrapes the title page for one external id.
    pub async fn fetch(&self, external_id: &str) -> Result<Metadata> {
        let url = format!("https://www.imdb.com/title/{external_id}/");
        let html = self
            .client
            .get(url)
            .header("Accept-Language", format!("{};q=0.9", self.language))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(self.scrape(&html))
    }

    /// Extracts metadata from the page HTML.
    #[must_use]
    pub fn scrape(&self, html: &str) -> Metadata {
        let mut metadata = Metadata::default();

        if let Some(raw) = self.og_title.captures(html).and_then(|c| c.get(1)) {
            let full = raw.as_str().replace(" - IMDb", "");
            let full = full.trim();

            // Only the part before the genre list carries title, year and
            // rating; a page without the separator has an unexpected
            // layout and is left unparsed.
            if let Some((left, _)) = full.split_once('|') {
                let mut text = left.trim().to_owned();

                let rating = self
                    .trailing_rating
                    .find(&text)
                    .map(|m| (m.start(), m.as_str().to_owned()));
                if let Some((start, rating)) = rating {
                    metadata.rating = Some(rating);
                    text.truncate(start);
                }

                let year = self
                    .year
                    .captures(&text)
                    .map(|c| (c[0].to_owned(), c[1].to_owned()));
                if let Some((parenthesized, digits)) = year {
                    metadata.year = Some(digits);
                    text = text.replace(&parenthesized, "");
                }

                let text = self.junk.replace(text.trim(), "");
                let text = self.whitespace.replace_all(text.trim(), " ");
                if !text.is_empty() {
                    metadata.title = Some(text.into_owned());
                }
            }
        }

        if let Some(image) = self.og_image.captures(html).and_then(|c| c.get(1)) {
            metadata.poster_url = Some(image.as_str().to_owned());
        }

        metadata
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Pattern(e.to_string()))
}

#[async_trait]
impl ArtworkResolver for ImdbResolver {
    async fn resolve(&self, item: &MediaItem) -> Option<Artwork> {
        let external_id = item.external_id.as_ref()?;
        match self.fetch(external_id).await {
            Ok(metadata) => metadata.poster_url.clone().map(|image| Artwork {
                image,
                caption: metadata.caption(),
                handle: None,
            }),
            Err(e) => {
                warn!("artwork lookup for {external_id} failed: {e}");
                None
            }
        }
    }
}
