use thiserror::Error;

/// Failures while turning an episode reference into playable links.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("catalog request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("catalog response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("catalog has no entry for {0}")]
    NotFound(String),

    #[error("no playable sources for episode {episode} of {show_id}")]
    NoSources { show_id: String, episode: u32 },
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("failed to launch player '{command}': {reason}")]
    Launch { command: String, reason: String },

    /// The control socket is gone. Inside a polling loop this is the
    /// expected end-of-session signal, not a fault.
    #[error("player control channel closed")]
    ChannelClosed(#[source] std::io::Error),

    #[error("unexpected player response: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("tracker response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("tracker rejected the credential")]
    Auth,

    #[error("show {0} is not on the tracked list")]
    NotFound(i64),
}
