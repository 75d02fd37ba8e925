use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{SourceProvider, TokenFilter};
use crate::error::ResolveError;
use crate::types::{EpisodeReference, ResolvedLink, ShowInfo, Translation};

const ALLANIME_API_URL: &str = "https://api.allanime.day/api";
const ALLANIME_BASE_URL: &str = "https://allanime.day";
const ALLANIME_REFERER: &str = "https://allmanga.to";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0 Safari/537.36";

pub struct AllAnimeClient {
    client: Client,
    api_url: String,
    base_url: String,
    filter: TokenFilter,
}

impl AllAnimeClient {
    pub fn new(timeout: Duration) -> Result<Self, ResolveError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            api_url: ALLANIME_API_URL.to_string(),
            base_url: ALLANIME_BASE_URL.to_string(),
            filter: TokenFilter::default(),
        })
    }

    pub fn with_endpoints(mut self, api_url: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self.base_url = base_url.into();
        self
    }

    pub fn with_token_filter(mut self, filter: TokenFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Single parametrized catalog query. The service rejects requests
    /// without the `Referer` and `User-Agent` headers.
    async fn query_episode_sources(
        &self,
        reference: &EpisodeReference,
    ) -> Result<Vec<String>, ResolveError> {
        let variables = serde_json::json!({
            "showId": reference.show_id,
            "translationType": reference.translation.as_str(),
            "episodeString": reference.episode_string(),
        })
        .to_string();

        let text = self
            .client
            .get(&self.api_url)
            .query(&[("query", EPISODE_SOURCES_QUERY), ("variables", variables.as_str())])
            .header("Referer", ALLANIME_REFERER)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let envelope: GraphQlEnvelope<EpisodePayload> = serde_json::from_str(&text)?;
        let payload = extract_data(&reference.show_id, envelope)?;
        let episode = payload
            .episode
            .ok_or_else(|| ResolveError::NotFound(reference.show_id.clone()))?;
        Ok(episode
            .source_urls
            .into_iter()
            .map(|source| source.source_url)
            .collect())
    }

    /// Fetches the decoded resource path and pulls every `link` out of the
    /// secondary document. Anything malformed degrades to an empty batch.
    async fn extract_links(&self, resource_path: &str) -> Vec<ResolvedLink> {
        let url = if resource_path.starts_with("http") {
            resource_path.to_string()
        } else {
            format!("{}{}", self.base_url, resource_path)
        };

        let response = self
            .client
            .get(&url)
            .header("Referer", ALLANIME_REFERER)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        let text = match response {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to read source document {url}: {err}");
                    return Vec::new();
                }
            },
            Err(err) => {
                warn!("failed to fetch source document {url}: {err}");
                return Vec::new();
            }
        };

        let payload: SourcePayload = match serde_json::from_str(&text) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("source document {url} has an unexpected shape: {err}");
                return Vec::new();
            }
        };

        payload
            .links
            .into_iter()
            .filter_map(|entry| entry.link)
            .map(|url| ResolvedLink { url })
            .collect()
    }
}

impl SourceProvider for AllAnimeClient {
    async fn search_shows(
        &self,
        query: &str,
        translation: Translation,
    ) -> Result<Vec<ShowInfo>, ResolveError> {
        let variables = serde_json::json!({
            "search": {
                "allowAdult": false,
                "allowUnknown": false,
                "query": query,
            },
            "limit": 40,
            "page": 1,
            "translationType": translation.as_str(),
            "countryOrigin": "ALL",
        })
        .to_string();

        let text = self
            .client
            .get(&self.api_url)
            .query(&[("query", SEARCH_SHOWS_QUERY), ("variables", variables.as_str())])
            .header("Referer", ALLANIME_REFERER)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let envelope: GraphQlEnvelope<SearchPayload> = serde_json::from_str(&text)?;
        let payload = extract_data(query, envelope)?;
        Ok(payload
            .shows
            .edges
            .into_iter()
            .map(|edge| {
                let available = match translation {
                    Translation::Sub => edge.available_episodes.sub,
                    Translation::Dub => edge.available_episodes.dub,
                };
                ShowInfo {
                    id: edge.id,
                    title: edge.name,
                    available_episodes: available,
                }
            })
            .collect())
    }

    async fn resolve(
        &self,
        reference: &EpisodeReference,
    ) -> Result<Vec<ResolvedLink>, ResolveError> {
        let tokens = self.query_episode_sources(reference).await?;

        let mut links = Vec::new();
        for token in tokens {
            if !self.filter.accepts(&token) {
                debug!("skipping non-provider embed token");
                continue;
            }
            // The filter guarantees a byte at index 2, so the sentinel
            // prefix splits off cleanly.
            let Some(body) = token.get(2..) else {
                continue;
            };
            let resource_path = decode_source_path(body);
            links.extend(self.extract_links(&resource_path).await);
        }
        Ok(links)
    }
}

/// Reverses the catalog's byte-pair substitution. Unmapped segments pass
/// through literally; an undecodable token just produces a path whose fetch
/// will fail, which callers treat as "no links for this source".
pub fn decode_source_path(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let mut decoded = String::with_capacity(token.len());
    for pair in chars.chunks(2) {
        if pair.len() == 2 {
            let segment: String = pair.iter().collect();
            match decode_pair(&segment) {
                Some(ch) => decoded.push(ch),
                None => decoded.push_str(&segment),
            }
        } else {
            decoded.push(pair[0]);
        }
    }
    // The secondary lookup always names a JSON resource.
    if decoded.contains("/clock") && !decoded.contains(".json") {
        decoded = decoded.replace("/clock", "/clock.json");
    }
    decoded
}

fn decode_pair(pair: &str) -> Option<char> {
    match pair {
        "01" => Some('9'),
        "08" => Some('0'),
        "05" => Some('='),
        "0a" => Some('2'),
        "0b" => Some('3'),
        "0c" => Some('4'),
        "07" => Some('?'),
        "00" => Some('8'),
        "5c" => Some('d'),
        "0f" => Some('7'),
        "5e" => Some('f'),
        "17" => Some('/'),
        "54" => Some('l'),
        "09" => Some('1'),
        "48" => Some('p'),
        "4f" => Some('w'),
        "0e" => Some('6'),
        "5b" => Some('c'),
        "5d" => Some('e'),
        "0d" => Some('5'),
        "53" => Some('k'),
        "1e" => Some('&'),
        "5a" => Some('b'),
        "59" => Some('a'),
        "4a" => Some('r'),
        "4c" => Some('t'),
        "4e" => Some('v'),
        "57" => Some('o'),
        "51" => Some('i'),
        _ => None,
    }
}

fn extract_data<T>(
    subject: &str,
    envelope: GraphQlEnvelope<T>,
) -> Result<T, ResolveError> {
    if let Some(errors) = envelope.errors {
        let joined = errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ResolveError::NotFound(format!("{subject}: {joined}")));
    }
    envelope
        .data
        .ok_or_else(|| ResolveError::NotFound(subject.to_string()))
}

// --- GraphQL structs ---

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
    shows: SearchShows,
}

#[derive(Debug, Deserialize)]
struct SearchShows {
    edges: Vec<SearchEdge>,
}

#[derive(Debug, Deserialize)]
struct SearchEdge {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    #[serde(rename = "availableEpisodes")]
    #[serde(default)]
    available_episodes: AvailabilitySnapshot,
}

#[derive(Debug, Deserialize, Default)]
struct AvailabilitySnapshot {
    #[serde(default)]
    sub: u32,
    #[serde(default)]
    dub: u32,
}

#[derive(Debug, Deserialize)]
struct EpisodePayload {
    episode: Option<EpisodeSources>,
}

#[derive(Debug, Deserialize)]
struct EpisodeSources {
    #[serde(rename = "sourceUrls")]
    #[serde(default)]
    source_urls: Vec<SourceDescriptor>,
}

#[derive(Debug, Deserialize)]
struct SourceDescriptor {
    #[serde(rename = "sourceUrl")]
    source_url: String,
}

#[derive(Debug, Deserialize)]
struct SourcePayload {
    #[serde(default)]
    links: Vec<SourceLink>,
}

#[derive(Debug, Deserialize)]
struct SourceLink {
    #[serde(default)]
    link: Option<String>,
}

// --- Queries ---

const SEARCH_SHOWS_QUERY: &str = r#"query($search: SearchInput, $limit: Int, $page: Int, $translationType: VaildTranslationTypeEnumType, $countryOrigin: VaildCountryOriginEnumType) {
  shows(search: $search, limit: $limit, page: $page, translationType: $translationType, countryOrigin: $countryOrigin) {
    edges {
      _id
      name
      availableEpisodes
    }
  }
}"#;

const EPISODE_SOURCES_QUERY: &str = r#"query($showId: String!, $translationType: VaildTranslationTypeEnumType!, $episodeString: String!) {
  episode(showId: $showId, translationType: $translationType, episodeString: $episodeString) {
    episodeString
    sourceUrls
  }
}"#;
