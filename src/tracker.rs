use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::error::TrackerError;
use crate::types::RemoteProgress;

const ANILIST_API_URL: &str = "https://graphql.anilist.co";

/// A show as the tracker's list knows it.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub progress: RemoteProgress,
    pub title: String,
}

pub struct AniListClient {
    client: Client,
    api_url: String,
    token: String,
}

impl AniListClient {
    pub fn new(token: String, timeout: Duration) -> Result<Self, TrackerError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: ANILIST_API_URL.to_string(),
            token,
        })
    }

    pub fn with_endpoint(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub async fn viewer_id(&self) -> Result<i64, TrackerError> {
        let payload: ViewerPayload = self
            .post(VIEWER_QUERY, serde_json::json!({}))
            .await?;
        Ok(payload.viewer.id)
    }

    /// Reads the viewer's list entry for one show. `NotFound` means the show
    /// is not on the list (or does not exist), not a transport problem.
    pub async fn list_entry(&self, show_id: i64) -> Result<ListEntry, TrackerError> {
        let viewer = self.viewer_id().await?;
        let payload: MediaListPayload = self
            .post(
                MEDIA_LIST_QUERY,
                serde_json::json!({ "userId": viewer, "mediaId": show_id }),
            )
            .await
            .map_err(|err| match err {
                TrackerError::NotFound(_) => TrackerError::NotFound(show_id),
                other => other,
            })?;
        let entry = payload
            .media_list
            .ok_or(TrackerError::NotFound(show_id))?;
        let title = entry
            .media
            .title
            .english
            .or(entry.media.title.romaji)
            .unwrap_or_default();
        Ok(ListEntry {
            progress: RemoteProgress {
                show_id,
                progress: entry.progress,
                total_episodes: entry.media.episodes.unwrap_or(0),
            },
            title,
        })
    }

    pub async fn update_progress(&self, show_id: i64, episode: u32) -> Result<(), TrackerError> {
        let _: SaveEntryPayload = self
            .post(
                SAVE_PROGRESS_MUTATION,
                serde_json::json!({ "mediaId": show_id, "progress": episode }),
            )
            .await?;
        Ok(())
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, TrackerError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TrackerError::Auth);
        }
        let text = response.text().await?;

        let envelope: GraphQlEnvelope<T> = serde_json::from_str(&text)?;
        if let Some(errors) = envelope.errors {
            if errors.iter().any(|e| e.status == Some(404)) {
                return Err(TrackerError::NotFound(0));
            }
            if errors
                .iter()
                .any(|e| e.message.to_lowercase().contains("invalid token"))
            {
                return Err(TrackerError::Auth);
            }
            let joined = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TrackerError::Decode(serde::de::Error::custom(joined)));
        }
        envelope
            .data
            .ok_or_else(|| TrackerError::Decode(serde::de::Error::custom("empty response")))
    }
}

/// The bearer credential lives in a plain file under the storage dir; the
/// auth flow that produces it is outside this tool.
pub fn read_token(storage_dir: &Path) -> Result<Option<String>> {
    let path = storage_dir.join("token");
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read token file {}", path.display()))?;
    let token = raw.trim().to_string();
    Ok((!token.is_empty()).then_some(token))
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
    #[serde(default)]
    status: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ViewerPayload {
    #[serde(rename = "Viewer")]
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct MediaListPayload {
    #[serde(rename = "MediaList")]
    media_list: Option<MediaListEntry>,
}

#[derive(Debug, Deserialize)]
struct MediaListEntry {
    #[serde(default)]
    progress: u32,
    media: Media,
}

#[derive(Debug, Deserialize)]
struct Media {
    episodes: Option<u32>,
    #[serde(default)]
    title: MediaTitle,
}

#[derive(Debug, Deserialize, Default)]
struct MediaTitle {
    english: Option<String>,
    romaji: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SaveEntryPayload {
    #[serde(rename = "SaveMediaListEntry")]
    #[allow(dead_code)]
    entry: SavedEntry,
}

#[derive(Debug, Deserialize)]
struct SavedEntry {
    #[allow(dead_code)]
    id: i64,
    #[serde(default)]
    #[allow(dead_code)]
    progress: u32,
}

// --- Queries ---

const VIEWER_QUERY: &str = r#"query {
  Viewer {
    id
    name
  }
}"#;

const MEDIA_LIST_QUERY: &str = r#"query($userId: Int, $mediaId: Int) {
  MediaList(userId: $userId, mediaId: $mediaId) {
    progress
    media {
      episodes
      title {
        english
        romaji
      }
    }
  }
}"#;

const SAVE_PROGRESS_MUTATION: &str = r#"mutation($mediaId: Int, $progress: Int) {
  SaveMediaListEntry(mediaId: $mediaId, progress: $progress) {
    id
    progress
  }
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_list_payload_parses() {
        let raw = r#"{
            "data": {
                "MediaList": {
                    "progress": 7,
                    "media": {
                        "episodes": 24,
                        "title": { "english": "Frieren", "romaji": "Sousou no Frieren" }
                    }
                }
            }
        }"#;
        let envelope: GraphQlEnvelope<MediaListPayload> =
            serde_json::from_str(raw).expect("parse");
        let entry = envelope
            .data
            .expect("data")
            .media_list
            .expect("entry");
        assert_eq!(entry.progress, 7);
        assert_eq!(entry.media.episodes, Some(24));
        assert_eq!(entry.media.title.english.as_deref(), Some("Frieren"));
    }

    #[test]
    fn missing_list_entry_is_a_null_not_a_parse_failure() {
        let raw = r#"{ "data": { "MediaList": null } }"#;
        let envelope: GraphQlEnvelope<MediaListPayload> =
            serde_json::from_str(raw).expect("parse");
        assert!(envelope.data.expect("data").media_list.is_none());
    }

    #[test]
    fn graphql_404_maps_to_not_found() {
        let raw = r#"{ "data": null, "errors": [ { "message": "Not Found.", "status": 404 } ] }"#;
        let envelope: GraphQlEnvelope<MediaListPayload> =
            serde_json::from_str(raw).expect("parse");
        let errors = envelope.errors.expect("errors");
        assert_eq!(errors[0].status, Some(404));
    }
}
