use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

/// One persisted record per tracked show.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEntry {
    pub show_id: i64,
    pub provider_show_id: String,
    pub episode: u32,
    pub playback_secs: u32,
    pub score: f32,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

/// Flat line-oriented watch history plus the single-line "last watched"
/// marker. One logical entry per show id; every write rewrites the file
/// through an atomic replace.
#[derive(Debug, Clone)]
pub struct WatchStore {
    history_path: PathBuf,
    last_watched_path: PathBuf,
}

impl WatchStore {
    pub fn open(storage_dir: &Path) -> Result<Self> {
        fs::create_dir_all(storage_dir)
            .with_context(|| format!("failed to create storage dir {}", storage_dir.display()))?;
        Ok(Self {
            history_path: storage_dir.join("watch_history.tsv"),
            last_watched_path: storage_dir.join("last_watched"),
        })
    }

    pub fn all(&self) -> Result<Vec<WatchEntry>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.history_path).with_context(|| {
            format!("failed to read watch history {}", self.history_path.display())
        })?;
        let mut entries = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(entry) => entries.push(entry),
                None => warn!(
                    "skipping malformed watch history line {} in {}",
                    idx + 1,
                    self.history_path.display()
                ),
            }
        }
        Ok(entries)
    }

    pub fn find(&self, show_id: i64) -> Result<Option<WatchEntry>> {
        Ok(self.all()?.into_iter().find(|e| e.show_id == show_id))
    }

    pub fn upsert(&self, entry: WatchEntry) -> Result<()> {
        let mut entries = self.all()?;
        match entries.iter_mut().find(|e| e.show_id == entry.show_id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.rewrite(&entries)
    }

    pub fn remove(&self, show_id: i64) -> Result<()> {
        let mut entries = self.all()?;
        entries.retain(|e| e.show_id != show_id);
        self.rewrite(&entries)
    }

    pub fn write_last_watched(&self, show_id: i64) -> Result<()> {
        write_atomic(&self.last_watched_path, &format!("{show_id}\n"))
    }

    pub fn read_last_watched(&self) -> Result<Option<i64>> {
        if !self.last_watched_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.last_watched_path).with_context(|| {
            format!(
                "failed to read last-watched marker {}",
                self.last_watched_path.display()
            )
        })?;
        Ok(raw.trim().parse::<i64>().ok())
    }

    fn rewrite(&self, entries: &[WatchEntry]) -> Result<()> {
        let mut body = String::new();
        for entry in entries {
            body.push_str(&format_line(entry));
            body.push('\n');
        }
        write_atomic(&self.history_path, &body)
    }
}

fn format_line(entry: &WatchEntry) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        entry.show_id,
        entry.provider_show_id,
        entry.episode,
        entry.playback_secs,
        entry.score,
        sanitize_field(&entry.title),
        entry.updated_at.to_rfc3339(),
    )
}

fn parse_line(line: &str) -> Option<WatchEntry> {
    let mut fields = line.split('\t');
    let show_id = fields.next()?.parse().ok()?;
    let provider_show_id = fields.next()?.to_string();
    let episode = fields.next()?.parse().ok()?;
    let playback_secs = fields.next()?.parse().ok()?;
    let score = fields.next()?.parse().ok()?;
    let title = fields.next()?.to_string();
    // Records written before the timestamp column was added stay readable.
    let updated_at = fields
        .next()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH);
    Some(WatchEntry {
        show_id,
        provider_show_id,
        episode,
        playback_secs,
        score,
        title,
        updated_at,
    })
}

fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
