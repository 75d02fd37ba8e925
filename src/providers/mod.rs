use crate::error::ResolveError;
use crate::types::{EpisodeReference, ResolvedLink, ShowInfo, Translation};

pub mod allanime;

pub trait SourceProvider {
    async fn search_shows(
        &self,
        query: &str,
        translation: Translation,
    ) -> Result<Vec<ShowInfo>, ResolveError>;

    /// Best-effort aggregation: one unreachable source never hides the
    /// others, and an empty result is not an error.
    async fn resolve(
        &self,
        reference: &EpisodeReference,
    ) -> Result<Vec<ResolvedLink>, ResolveError>;
}

/// Predicate separating genuine provider embeds from the other embed types
/// the catalog mixes into `sourceUrls`. The token shape is an external,
/// versioned contract, so the rule is swappable rather than baked in.
#[derive(Clone, Copy)]
pub struct TokenFilter(fn(&str) -> bool);

impl TokenFilter {
    pub fn new(accept: fn(&str) -> bool) -> Self {
        Self(accept)
    }

    pub fn accepts(&self, token: &str) -> bool {
        (self.0)(token)
    }
}

impl Default for TokenFilter {
    /// Current catalog format: real embeds look like `--32f23k31jk`, so the
    /// byte at index 2 is a decimal digit.
    fn default() -> Self {
        Self(|token| {
            token
                .as_bytes()
                .get(2)
                .is_some_and(|b| b.is_ascii_digit())
        })
    }
}

/// Direct mp4 links front the list; everything else keeps source order.
pub fn prioritize_links(links: Vec<ResolvedLink>) -> Vec<ResolvedLink> {
    let (mut direct, rest): (Vec<_>, Vec<_>) = links
        .into_iter()
        .partition(|link| link.url.split('?').next().is_some_and(|p| p.ends_with(".mp4")));
    direct.extend(rest);
    direct
}
