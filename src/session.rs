use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::player::MpvHandle;
use crate::store::{WatchEntry, WatchStore};
use crate::tracker::AniListClient;
use crate::types::RemoteProgress;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const RESUME_MIN_SECS: u32 = 10;
const RESUME_REWIND_SECS: u32 = 5;
const REMOTE_PUSH_ATTEMPTS: u32 = 2;

/// Live playback state. Owned exclusively by the polling task once the
/// session is spawned; callers only see the final `SessionOutcome`.
pub struct PlaybackSession {
    pub player: MpvHandle,
    pub show_id: i64,
    pub provider_show_id: String,
    pub episode: u32,
    pub title: String,
    pub total_episodes: u32,
    pub score: f32,
    pub position_secs: u32,
    pub duration_secs: u32,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub show_id: i64,
    pub episode: u32,
    pub position_secs: u32,
    pub completed: bool,
    pub progress_pushed: bool,
}

#[derive(Clone)]
pub struct SessionStopper(watch::Sender<bool>);

impl SessionStopper {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

pub struct SessionHandle {
    stopper: SessionStopper,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn stopper(&self) -> SessionStopper {
        self.stopper.clone()
    }

    pub async fn join(self) -> Result<SessionOutcome> {
        self.task.await.context("playback session task failed")
    }
}

enum LoopEnd {
    ChannelClosed,
    Cancelled,
}

/// Polls the player once a second and turns the samples into a completion
/// decision when the control channel goes away.
pub struct SessionController {
    store: WatchStore,
    tracker: Option<AniListClient>,
    completion_threshold: u8,
    poll_interval: Duration,
}

impl SessionController {
    pub fn new(store: WatchStore, tracker: Option<AniListClient>, completion_threshold: u8) -> Self {
        Self {
            store,
            tracker,
            completion_threshold,
            poll_interval: POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn spawn(self, session: PlaybackSession) -> SessionHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(session, cancel_rx));
        SessionHandle {
            stopper: SessionStopper(cancel_tx),
            task,
        }
    }

    async fn run(
        self,
        mut session: PlaybackSession,
        mut cancel: watch::Receiver<bool>,
    ) -> SessionOutcome {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        // Phase 1: poll until the player reports a duration, then restore
        // context with at most one seek.
        let mut end = None;
        while end.is_none() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => {
                    end = Some(LoopEnd::Cancelled);
                    break;
                }
            }
            match session.player.get_property_f64("duration").await {
                Ok(Some(raw)) if raw > 0.0 => {
                    session.duration_secs = (raw + 0.5) as u32;
                    debug!("episode duration known: {}s", session.duration_secs);
                    if let Some(target) = resume_target(session.position_secs) {
                        match session.player.seek_absolute(target).await {
                            Ok(()) => info!("resumed playback at {target}s"),
                            Err(err) => warn!("resume seek failed: {err}"),
                        }
                    }
                    break;
                }
                Ok(_) => {}
                Err(PlayerError::ChannelClosed(err)) => {
                    debug!("control channel closed during duration discovery: {err}");
                    end = Some(LoopEnd::ChannelClosed);
                }
                Err(err) => warn!("duration query failed: {err}"),
            }
        }

        // Phase 2: track the position until the player goes away.
        let end = match end {
            Some(end) => end,
            None => loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.changed() => break LoopEnd::Cancelled,
                }
                match session.player.get_property_f64("time-pos").await {
                    Ok(Some(raw)) => session.position_secs = (raw + 0.5) as u32,
                    Ok(None) => {}
                    Err(PlayerError::ChannelClosed(err)) => {
                        debug!("control channel closed: {err}");
                        break LoopEnd::ChannelClosed;
                    }
                    Err(err) => warn!("position query failed: {err}"),
                }
            },
        };

        self.finalize(session, matches!(end, LoopEnd::ChannelClosed))
            .await
    }

    /// The sole completion path: evaluate the threshold, persist locally,
    /// then push to the tracker on a best-effort basis.
    async fn finalize(&self, mut session: PlaybackSession, channel_closed: bool) -> SessionOutcome {
        let completed = completion_reached(
            session.position_secs,
            session.duration_secs,
            self.completion_threshold,
        );
        if completed {
            session.episode += 1;
            session.position_secs = 0;
            info!(
                "{} watched past the threshold; progress is now episode {}",
                session.title, session.episode
            );
        }

        // Local persistence is the critical path; nothing below may block it.
        let entry = WatchEntry {
            show_id: session.show_id,
            provider_show_id: session.provider_show_id.clone(),
            episode: session.episode,
            playback_secs: session.position_secs,
            score: session.score,
            title: session.title.clone(),
            updated_at: Utc::now(),
        };
        if let Err(err) = self.store.upsert(entry) {
            warn!("failed to persist watch entry: {err:#}");
        }
        if let Err(err) = self.store.write_last_watched(session.show_id) {
            warn!("failed to record last watched show: {err:#}");
        }

        let mut progress_pushed = false;
        if completed && let Some(tracker) = &self.tracker {
            for attempt in 1..=REMOTE_PUSH_ATTEMPTS {
                match tracker
                    .update_progress(session.show_id, session.episode)
                    .await
                {
                    Ok(()) => {
                        info!("tracker progress set to episode {}", session.episode);
                        progress_pushed = true;
                        break;
                    }
                    Err(err) if attempt < REMOTE_PUSH_ATTEMPTS => {
                        warn!("tracker push attempt {attempt} failed: {err}");
                    }
                    Err(err) => warn!("giving up on tracker push: {err}"),
                }
            }
        }

        if channel_closed {
            session.player.reap().await;
        }

        SessionOutcome {
            show_id: session.show_id,
            episode: session.episode,
            position_secs: session.position_secs,
            completed,
            progress_pushed,
        }
    }
}

pub fn completion_reached(position_secs: u32, duration_secs: u32, threshold: u8) -> bool {
    if duration_secs == 0 {
        return false;
    }
    position_secs as f64 / duration_secs as f64 * 100.0 >= threshold as f64
}

/// Where to seek when picking a session back up. Short offsets are not
/// worth re-establishing; longer ones rewind a little for context.
pub fn resume_target(playback_secs: u32) -> Option<u32> {
    (playback_secs > RESUME_MIN_SECS).then(|| playback_secs.saturating_sub(RESUME_REWIND_SECS))
}

/// Remote progress wins whenever it is ahead: the episode was advanced
/// elsewhere, so the local offset is stale.
pub fn reconcile_remote(episode: u32, playback_secs: u32, remote: &RemoteProgress) -> (u32, u32) {
    if remote.progress > episode {
        (remote.progress, 0)
    } else {
        (episode, playback_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    #[test]
    fn threshold_crossed_means_completed() {
        assert!(completion_reached(1100, 1200, 90));
        assert!(!completion_reached(500, 1200, 90));
        assert!(completion_reached(1080, 1200, 90));
        assert!(!completion_reached(100, 0, 90));
    }

    #[test]
    fn resume_rewinds_by_a_fixed_margin() {
        assert_eq!(resume_target(120), Some(115));
        assert_eq!(resume_target(11), Some(6));
        assert_eq!(resume_target(10), None);
        assert_eq!(resume_target(0), None);
    }

    #[test]
    fn remote_ahead_overwrites_local_state() {
        let remote = RemoteProgress {
            show_id: 1,
            progress: 7,
            total_episodes: 24,
        };
        assert_eq!(reconcile_remote(5, 300, &remote), (7, 0));
        assert_eq!(reconcile_remote(7, 300, &remote), (7, 300));
        assert_eq!(reconcile_remote(9, 300, &remote), (9, 300));
    }

    struct TempStoreDir {
        path: PathBuf,
    }

    impl TempStoreDir {
        fn new(tag: &str) -> Self {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            let path = std::env::temp_dir().join(format!(
                "anisync-session-{tag}-{}-{ts}",
                std::process::id()
            ));
            fs::create_dir_all(&path).expect("create temp dir");
            Self { path }
        }
    }

    impl Drop for TempStoreDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn session_for(player: MpvHandle, episode: u32, playback: u32) -> PlaybackSession {
        PlaybackSession {
            player,
            show_id: 21,
            provider_show_id: String::from("ReZjKangM"),
            episode,
            title: String::from("Frieren"),
            total_episodes: 28,
            score: 0.0,
            position_secs: playback,
            duration_secs: 0,
        }
    }

    #[tokio::test]
    async fn finalize_advances_and_resets_past_threshold() {
        let dir = TempStoreDir::new("advance");
        let store = WatchStore::open(&dir.path).expect("open store");
        let controller = SessionController::new(store.clone(), None, 90);

        let mut session = session_for(MpvHandle::attach(dir.path.join("none.sock")), 3, 0);
        session.duration_secs = 1200;
        session.position_secs = 1100;

        let outcome = controller.finalize(session, false).await;
        assert!(outcome.completed);
        assert_eq!(outcome.episode, 4);
        assert_eq!(outcome.position_secs, 0);

        let entry = store.find(21).expect("find").expect("persisted");
        assert_eq!(entry.episode, 4);
        assert_eq!(entry.playback_secs, 0);
        assert_eq!(store.read_last_watched().expect("marker"), Some(21));
    }

    #[tokio::test]
    async fn finalize_below_threshold_still_persists_position() {
        let dir = TempStoreDir::new("partial");
        let store = WatchStore::open(&dir.path).expect("open store");
        let controller = SessionController::new(store.clone(), None, 90);

        let mut session = session_for(MpvHandle::attach(dir.path.join("none.sock")), 3, 0);
        session.duration_secs = 1200;
        session.position_secs = 500;

        let outcome = controller.finalize(session, false).await;
        assert!(!outcome.completed);
        assert_eq!(outcome.episode, 3);
        assert_eq!(outcome.position_secs, 500);

        let entry = store.find(21).expect("find").expect("persisted");
        assert_eq!(entry.episode, 3);
        assert_eq!(entry.playback_secs, 500);
    }

    /// One-shot HTTP stub for the tracker endpoint; records request bodies.
    fn spawn_tracker_stub(body: String) -> (String, Arc<Mutex<Vec<String>>>) {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind tracker stub");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_clone = Arc::clone(&requests);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut raw = Vec::new();
                let mut buf = [0_u8; 2048];
                let body_start = loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break None,
                        Ok(n) => {
                            raw.extend_from_slice(&buf[..n]);
                            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                                break Some(pos + 4);
                            }
                        }
                        Err(_) => break None,
                    }
                };
                let Some(body_start) = body_start else { continue };
                let head = String::from_utf8_lossy(&raw[..body_start]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| line.to_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                while raw.len() < body_start + content_length {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                        Err(_) => break,
                    }
                }
                requests_clone
                    .lock()
                    .expect("record request")
                    .push(String::from_utf8_lossy(&raw[body_start..]).to_string());
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            }
        });
        (format!("http://{addr}"), requests)
    }

    #[tokio::test]
    async fn completion_pushes_advanced_episode_to_tracker() {
        let dir = TempStoreDir::new("push");
        let store = WatchStore::open(&dir.path).expect("open store");
        let (endpoint, requests) = spawn_tracker_stub(
            r#"{"data":{"SaveMediaListEntry":{"id":1,"progress":4}}}"#.to_string(),
        );
        let tracker = AniListClient::new(String::from("test-token"), Duration::from_secs(2))
            .expect("client")
            .with_endpoint(endpoint);
        let controller = SessionController::new(store, Some(tracker), 90);

        let mut session = session_for(MpvHandle::attach(dir.path.join("none.sock")), 3, 0);
        session.duration_secs = 1200;
        session.position_secs = 1100;

        let outcome = controller.finalize(session, false).await;
        assert!(outcome.completed);
        assert!(outcome.progress_pushed);

        let seen = requests.lock().expect("requests");
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("\"progress\":4"));
        assert!(seen[0].contains("\"mediaId\":21"));
    }

    /// Answers mpv-style one-command connections from a script; when the
    /// positions run dry it drops the listener, which the client sees as a
    /// closed channel.
    fn spawn_fake_mpv(
        socket_path: PathBuf,
        duration: f64,
        positions: Vec<f64>,
        commands: Arc<Mutex<Vec<String>>>,
    ) {
        let listener = UnixListener::bind(&socket_path).expect("bind fake mpv");
        tokio::spawn(async move {
            let mut positions = positions.into_iter();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                let Ok(Some(line)) = lines.next_line().await else {
                    continue;
                };
                commands.lock().expect("record command").push(line.clone());
                let reply = if line.contains("duration") {
                    format!("{{\"data\":{duration},\"error\":\"success\"}}")
                } else if line.contains("time-pos") {
                    match positions.next() {
                        Some(pos) => format!("{{\"data\":{pos},\"error\":\"success\"}}"),
                        None => break,
                    }
                } else {
                    String::from("{\"error\":\"success\"}")
                };
                let _ = write_half.write_all(format!("{reply}\n").as_bytes()).await;
            }
            let _ = fs::remove_file(&socket_path);
        });
    }

    #[tokio::test]
    async fn closed_channel_triggers_finalize_and_persist() {
        let dir = TempStoreDir::new("loop");
        let store = WatchStore::open(&dir.path).expect("open store");
        let socket_path = dir.path.join("mpv.sock");
        let commands = Arc::new(Mutex::new(Vec::new()));
        spawn_fake_mpv(
            socket_path.clone(),
            1200.0,
            vec![600.0, 1100.2],
            Arc::clone(&commands),
        );

        let controller = SessionController::new(store.clone(), None, 90)
            .with_poll_interval(Duration::from_millis(20));
        let session = session_for(MpvHandle::attach(socket_path), 3, 0);

        let outcome = controller.spawn(session).join().await.expect("outcome");
        assert!(outcome.completed);
        assert_eq!(outcome.episode, 4);
        assert_eq!(outcome.position_secs, 0);

        let entry = store.find(21).expect("find").expect("persisted");
        assert_eq!(entry.episode, 4);
        assert_eq!(entry.playback_secs, 0);

        // No prior offset, so no resume seek was issued.
        let seen = commands.lock().expect("commands");
        assert!(!seen.iter().any(|c| c.contains("\"seek\"")));
    }

    #[tokio::test]
    async fn resume_offset_issues_exactly_one_seek() {
        let dir = TempStoreDir::new("resume");
        let store = WatchStore::open(&dir.path).expect("open store");
        let socket_path = dir.path.join("mpv.sock");
        let commands = Arc::new(Mutex::new(Vec::new()));
        spawn_fake_mpv(
            socket_path.clone(),
            1500.0,
            vec![115.0, 130.0],
            Arc::clone(&commands),
        );

        let controller = SessionController::new(store, None, 90)
            .with_poll_interval(Duration::from_millis(20));
        let session = session_for(MpvHandle::attach(socket_path), 3, 120);

        let outcome = controller.spawn(session).join().await.expect("outcome");
        assert!(!outcome.completed);

        let seen = commands.lock().expect("commands");
        let seeks: Vec<_> = seen.iter().filter(|c| c.contains("\"seek\"")).collect();
        assert_eq!(seeks.len(), 1);
        assert!(seeks[0].contains("115"));
    }

    #[tokio::test]
    async fn cancellation_finalizes_through_the_same_path() {
        let dir = TempStoreDir::new("cancel");
        let store = WatchStore::open(&dir.path).expect("open store");
        let socket_path = dir.path.join("mpv.sock");
        let commands = Arc::new(Mutex::new(Vec::new()));
        spawn_fake_mpv(
            socket_path.clone(),
            1200.0,
            vec![300.0; 1000],
            Arc::clone(&commands),
        );

        let controller = SessionController::new(store.clone(), None, 90)
            .with_poll_interval(Duration::from_millis(20));
        let handle = controller.spawn(session_for(MpvHandle::attach(socket_path), 3, 0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stopper().stop();
        let outcome = handle.join().await.expect("outcome");

        assert!(!outcome.completed);
        assert_eq!(outcome.episode, 3);
        let entry = store.find(21).expect("find").expect("persisted");
        assert_eq!(entry.episode, 3);
        assert_eq!(entry.playback_secs, 300);
    }
}
