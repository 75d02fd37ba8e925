use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Translation {
    Sub,
    Dub,
}

impl Translation {
    pub fn as_str(self) -> &'static str {
        match self {
            Translation::Sub => "sub",
            Translation::Dub => "dub",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Translation::Sub => "Sub",
            Translation::Dub => "Dub",
        }
    }
}

/// Immutable request key for a resolution call. `show_id` is the catalog's
/// own id for the show, not the tracker id.
#[derive(Debug, Clone)]
pub struct EpisodeReference {
    pub show_id: String,
    pub episode: u32,
    pub translation: Translation,
}

impl EpisodeReference {
    pub fn episode_string(&self) -> String {
        self.episode.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLink {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ShowInfo {
    pub id: String,
    pub title: String,
    pub available_episodes: u32,
}

/// The tracker's view of a show's progress. Source of truth whenever it is
/// ahead of the local watch entry.
#[derive(Debug, Clone, Copy)]
pub struct RemoteProgress {
    pub show_id: i64,
    pub progress: u32,
    pub total_episodes: u32,
}
