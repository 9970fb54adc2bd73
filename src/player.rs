use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::model::user::User;
use serenity::prelude::Context;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use songbird::input::HttpRequest;
use songbird::tracks::TrackHandle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{BotError, BotResult};
use crate::sources::{self, MediaSource, SongMeta};
use crate::App;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Off,
    Playlist,
    Song,
}

impl LoopMode {
    pub fn cycle(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Playlist,
            LoopMode::Playlist => LoopMode::Song,
            LoopMode::Song => LoopMode::Off,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LoopMode::Off => "🔁 Loop off",
            LoopMode::Playlist => "🔁 Loop playlist",
            LoopMode::Song => "🔂 Loop song",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SongRecord {
    pub title: String,
    pub url: String,
    pub duration: String,
    pub thumbnail: Option<String>,
    pub requested_by: UserId,
}

impl SongRecord {
    pub fn from_meta(meta: SongMeta, requested_by: UserId) -> Self {
        SongRecord {
            title: meta.title,
            url: meta.url,
            duration: meta.duration,
            thumbnail: meta.thumbnail,
            requested_by,
        }
    }

    /// music.youtube.com links stream badly, so they are rewritten to the
    /// plain watch URL only when handed to the extractor. The stored URL
    /// keeps the form the user submitted.
    pub fn play_url(&self) -> String {
        if self.url.contains("music.youtube.com") {
            if let Some(id) = sources::extract_video_id(&self.url) {
                return sources::watch_url(&id);
            }
        }
        self.url.clone()
    }
}

/// External player status, fed back into the state machine.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Started,
    Paused,
    Idle,
    Failed(String),
}

/// What the driver should do after applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    None,
    Replay,
    Next,
}

/// Cancellable one-shot used for the inactivity disconnect. Arming always
/// replaces the previous timer, so at most one is pending.
#[derive(Default)]
pub struct InactivityTimer {
    handle: Option<JoinHandle<()>>,
}

impl InactivityTimer {
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn arm<F>(&mut self, idle: bool, timeout: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        if !idle {
            return;
        }
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_fire.await;
        }));
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Per-guild playback state. One of these lives for the process lifetime
/// once a guild has touched the panel.
pub struct GuildPlayer {
    pub guild_id: GuildId,
    pub queue: VecDeque<SongRecord>,
    pub current: Option<SongRecord>,
    pub loop_mode: LoopMode,
    pub playing: bool,
    pub paused: bool,
    track: Option<TrackHandle>,
    pub idle_timer: InactivityTimer,
}

impl GuildPlayer {
    pub fn new(guild_id: GuildId) -> Self {
        GuildPlayer {
            guild_id,
            queue: VecDeque::new(),
            current: None,
            loop_mode: LoopMode::Off,
            playing: false,
            paused: false,
            track: None,
            idle_timer: InactivityTimer::default(),
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.playing && self.current.is_none() && self.queue.is_empty()
    }

    /// Append a record; true means the caller should kick playback.
    pub fn enqueue(&mut self, song: SongRecord) -> bool {
        self.queue.push_back(song);
        !self.playing && !self.paused
    }

    /// Prepend a record. Never starts playback by itself.
    pub fn enqueue_front(&mut self, song: SongRecord) {
        self.queue.push_front(song);
    }

    /// Pick the record to play. In playlist loop the just-finished current
    /// goes back to the tail before the head is popped.
    pub fn next_song(&mut self) -> Option<SongRecord> {
        if self.loop_mode == LoopMode::Playlist {
            if let Some(finished) = self.current.take() {
                self.queue.push_back(finished);
            }
        }
        self.queue.pop_front()
    }

    pub fn apply(&mut self, event: PlayerEvent) -> Advance {
        match event {
            PlayerEvent::Started => {
                self.playing = true;
                self.paused = false;
                Advance::None
            }
            PlayerEvent::Paused => {
                self.paused = true;
                self.playing = false;
                Advance::None
            }
            PlayerEvent::Idle => {
                self.playing = false;
                self.paused = false;
                if self.loop_mode == LoopMode::Song && self.current.is_some() {
                    Advance::Replay
                } else {
                    Advance::Next
                }
            }
            PlayerEvent::Failed(reason) => {
                warn!("track failed: {reason}");
                self.playing = false;
                self.paused = false;
                Advance::Next
            }
        }
    }

    pub fn pause(&mut self) -> bool {
        if !self.playing || self.paused {
            return false;
        }
        if let Some(track) = &self.track {
            let _ = track.pause();
        }
        self.apply(PlayerEvent::Paused);
        true
    }

    pub fn resume(&mut self) -> bool {
        if !self.paused {
            return false;
        }
        if let Some(track) = &self.track {
            let _ = track.play();
        }
        self.apply(PlayerEvent::Started);
        true
    }

    /// Stop the live track; the end notifier then advances the queue.
    pub fn skip(&mut self) -> bool {
        if self.current.is_none() {
            return false;
        }
        if let Some(track) = &self.track {
            let _ = track.stop();
        }
        true
    }

    /// Drop the queue and anything playing. Used by the clear button, the
    /// inactivity disconnect and the alone-in-channel watcher.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.current = None;
        self.playing = false;
        self.paused = false;
        if let Some(track) = self.track.take() {
            let _ = track.stop();
        }
    }

    pub fn cycle_loop_mode(&mut self) -> LoopMode {
        self.loop_mode = self.loop_mode.cycle();
        self.loop_mode
    }

    pub fn set_track(&mut self, track: TrackHandle) {
        self.track = Some(track);
    }
}

/// Owns every guild's player. Built once at startup and reached through
/// the shared [`App`] context.
#[derive(Default)]
pub struct Registry {
    players: Mutex<HashMap<GuildId, Arc<Mutex<GuildPlayer>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub async fn get(&self, guild_id: GuildId) -> Option<Arc<Mutex<GuildPlayer>>> {
        self.players.lock().await.get(&guild_id).cloned()
    }

    pub async fn get_or_create(&self, guild_id: GuildId) -> Arc<Mutex<GuildPlayer>> {
        self.players
            .lock()
            .await
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildPlayer::new(guild_id))))
            .clone()
    }
}

/// Retry the stream extraction for one record: fixed backoff, bounded
/// attempts, never fatal.
pub async fn extract_with_retry(
    source: &dyn MediaSource,
    song: &SongRecord,
    attempts: u32,
    backoff: Duration,
) -> BotResult<String> {
    for attempt in 1..=attempts {
        match source.extract_audio_url(&song.play_url()).await {
            Ok(url) => return Ok(url),
            Err(e) => {
                warn!(
                    "stream extraction for \"{}\" failed (attempt {attempt}/{attempts}): {e}",
                    song.title
                );
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(BotError::Playback(format!(
        "gave up on \"{}\" after {attempts} attempts",
        song.title
    )))
}

/// Pop records until one yields a stream URL. Records that exhaust their
/// retries are abandoned, not re-queued. `None` leaves the player idle.
pub async fn acquire_next_stream(
    player: &Arc<Mutex<GuildPlayer>>,
    source: &dyn MediaSource,
    backoff: Duration,
) -> Option<(SongRecord, String)> {
    loop {
        let song = {
            let mut state = player.lock().await;
            match state.next_song() {
                Some(song) => {
                    state.current = Some(song.clone());
                    song
                }
                None => {
                    state.current = None;
                    state.playing = false;
                    state.paused = false;
                    return None;
                }
            }
        };

        match extract_with_retry(source, &song, RETRY_ATTEMPTS, backoff).await {
            Ok(stream_url) => return Some((song, stream_url)),
            Err(e) => {
                error!("{e}; moving on");
                continue;
            }
        }
    }
}

/// Fires when a songbird track ends or errors and drives the advance.
struct TrackFinishNotifier {
    ctx: Context,
    guild_id: GuildId,
    failed: bool,
}

#[async_trait]
impl VoiceEventHandler for TrackFinishNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let app = App::get(&self.ctx).await;
        let Some(player) = app.registry.get(self.guild_id).await else {
            return None;
        };

        let event = if self.failed {
            PlayerEvent::Failed("songbird reported a track error".to_string())
        } else {
            PlayerEvent::Idle
        };
        let advance = { player.lock().await.apply(event) };

        match advance {
            Advance::Replay => replay_current(&self.ctx, self.guild_id).await,
            Advance::Next => play_next(&self.ctx, self.guild_id).await,
            Advance::None => {}
        }
        None
    }
}

/// Advance the queue: resolve the next playable record and start it, or go
/// idle and arm the inactivity timer.
pub async fn play_next(ctx: &Context, guild_id: GuildId) {
    let app = App::get(ctx).await;
    let Some(player) = app.registry.get(guild_id).await else {
        return;
    };

    match acquire_next_stream(&player, app.source.as_ref(), RETRY_BACKOFF).await {
        Some((song, stream_url)) => {
            start_track(ctx, guild_id, &player, &song, stream_url).await;
        }
        None => {
            refresh_idle_timer(ctx, guild_id, &player).await;
        }
    }
    crate::panel::update_control(ctx, guild_id).await;
}

/// Loop-song path: play the current record again without touching the queue.
pub async fn replay_current(ctx: &Context, guild_id: GuildId) {
    let app = App::get(ctx).await;
    let Some(player) = app.registry.get(guild_id).await else {
        return;
    };
    let song = { player.lock().await.current.clone() };
    let Some(song) = song else {
        return play_next(ctx, guild_id).await;
    };

    match extract_with_retry(app.source.as_ref(), &song, RETRY_ATTEMPTS, RETRY_BACKOFF).await {
        Ok(stream_url) => {
            start_track(ctx, guild_id, &player, &song, stream_url).await;
            crate::panel::update_control(ctx, guild_id).await;
        }
        Err(e) => {
            error!("could not replay \"{}\": {e}", song.title);
            play_next(ctx, guild_id).await;
        }
    }
}

async fn start_track(
    ctx: &Context,
    guild_id: GuildId,
    player: &Arc<Mutex<GuildPlayer>>,
    song: &SongRecord,
    stream_url: String,
) {
    let Some(manager) = songbird::get(ctx).await else {
        return;
    };
    let Some(call) = manager.get(guild_id) else {
        warn!(
            "no voice connection in guild {guild_id}, holding \"{}\"",
            song.title
        );
        {
            let mut state = player.lock().await;
            if let Some(held) = state.current.take() {
                state.queue.push_front(held);
            }
            state.playing = false;
            state.paused = false;
        }
        refresh_idle_timer(ctx, guild_id, player).await;
        return;
    };

    let input: songbird::input::Input =
        HttpRequest::new(reqwest::Client::new(), stream_url).into();
    let handle = {
        let mut call = call.lock().await;
        call.play_input(input)
    };
    let _ = handle.add_event(
        Event::Track(TrackEvent::End),
        TrackFinishNotifier {
            ctx: ctx.clone(),
            guild_id,
            failed: false,
        },
    );
    let _ = handle.add_event(
        Event::Track(TrackEvent::Error),
        TrackFinishNotifier {
            ctx: ctx.clone(),
            guild_id,
            failed: true,
        },
    );

    let mut state = player.lock().await;
    state.apply(PlayerEvent::Started);
    state.set_track(handle);
    state.idle_timer.cancel();
    info!("now playing \"{}\" in guild {guild_id}", song.title);
}

/// Re-evaluate the inactivity supervisor: cancel any pending timer and arm
/// a fresh one only when the player is fully idle.
pub async fn refresh_idle_timer(
    ctx: &Context,
    guild_id: GuildId,
    player: &Arc<Mutex<GuildPlayer>>,
) {
    let app = App::get(ctx).await;
    let timeout = { app.db.lock().await.disconnect_timeout() };

    let mut state = player.lock().await;
    let idle = state.is_idle();
    let ctx = ctx.clone();
    let player = Arc::clone(player);
    state.idle_timer.arm(idle, timeout, async move {
        info!(
            "guild {guild_id} idle for {}s, disconnecting",
            timeout.as_secs()
        );
        disconnect(&ctx, guild_id, &player).await;
        crate::panel::update_control(&ctx, guild_id).await;
    });
}

/// Drop the voice connection and reset playback state.
pub async fn disconnect(ctx: &Context, guild_id: GuildId, player: &Arc<Mutex<GuildPlayer>>) {
    if let Some(manager) = songbird::get(ctx).await {
        if manager.get(guild_id).is_some() {
            if let Err(e) = manager.remove(guild_id).await {
                warn!("leaving voice in guild {guild_id} failed: {e}");
            }
        }
    }
    let mut state = player.lock().await;
    state.idle_timer.cancel();
    state.clear();
}

pub async fn connect(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> BotResult<()> {
    let manager = songbird::get(ctx)
        .await
        .ok_or_else(|| BotError::Playback("voice client missing at initialisation".to_string()))?;
    manager
        .join(guild_id, channel_id)
        .await
        .map_err(|e| BotError::Playback(format!("could not join voice channel: {e}")))?;
    info!("joined voice channel {channel_id} in guild {guild_id}");
    Ok(())
}

/// The voice channel the bot currently serves, if connected.
pub async fn current_call_channel(ctx: &Context, guild_id: GuildId) -> Option<ChannelId> {
    let manager = songbird::get(ctx).await?;
    let call = manager.get(guild_id)?;
    let channel = call.lock().await.current_channel()?;
    Some(ChannelId::new(channel.0.get()))
}

/// Resolve a submission and queue it at the back. Playlists are expanded
/// (one leaderboard point for the whole batch), singles also count a play.
pub async fn add_song(ctx: &Context, guild_id: GuildId, input: &str, user: &User) -> BotResult<()> {
    let app = App::get(ctx).await;
    let Some(player) = app.registry.get(guild_id).await else {
        return Err(BotError::Playback("player not initialised".to_string()));
    };

    match sources::resolve(app.source.as_ref(), input).await? {
        sources::Resolved::Playlist(metas) => {
            let count = metas.len();
            let should_play = {
                let mut state = player.lock().await;
                for meta in metas {
                    state.queue.push_back(SongRecord::from_meta(meta, user.id));
                }
                !state.playing && !state.paused && count > 0
            };
            info!("queued {count} playlist songs for {}", user.name);

            if count > 0 {
                record_stats(ctx, user, None).await;
            }
            refresh_idle_timer(ctx, guild_id, &player).await;
            if should_play {
                play_next(ctx, guild_id).await;
            }
        }
        sources::Resolved::Single(meta) => {
            let song = SongRecord::from_meta(meta, user.id);
            let should_play = { player.lock().await.enqueue(song.clone()) };
            info!("queued \"{}\" for {}", song.title, user.name);

            record_stats(ctx, user, Some(&song)).await;
            refresh_idle_timer(ctx, guild_id, &player).await;
            if should_play {
                play_next(ctx, guild_id).await;
            }
        }
    }
    crate::panel::update_control(ctx, guild_id).await;
    Ok(())
}

/// Resolve a single song and put it at the head of the queue. Does not
/// start playback on its own.
pub async fn add_song_next(
    ctx: &Context,
    guild_id: GuildId,
    input: &str,
    user: &User,
) -> BotResult<()> {
    let app = App::get(ctx).await;
    let Some(player) = app.registry.get(guild_id).await else {
        return Err(BotError::Playback("player not initialised".to_string()));
    };

    let meta = sources::resolve_single(app.source.as_ref(), input).await?;
    let song = SongRecord::from_meta(meta, user.id);
    {
        player.lock().await.enqueue_front(song.clone());
    }
    info!("queued \"{}\" next for {}", song.title, user.name);

    record_stats(ctx, user, Some(&song)).await;
    refresh_idle_timer(ctx, guild_id, &player).await;
    crate::panel::update_control(ctx, guild_id).await;
    Ok(())
}

/// One leaderboard point for the submitter, plus a play count when a
/// single song is known. Failed writes keep the in-memory state, so a
/// later save heals the file.
async fn record_stats(ctx: &Context, user: &User, song: Option<&SongRecord>) {
    let app = App::get(ctx).await;
    {
        let mut db = app.db.lock().await;
        db.record_contribution(&user.id.to_string(), &user.name);
        if let Some(song) = song {
            db.record_song_play(&song.title, Some(&song.url));
        }
        if let Err(e) = db.save().await {
            error!("could not persist leaderboard: {e}");
        }
    }
    crate::panel::update_leaderboards(ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(title: &str, url: &str) -> SongRecord {
        SongRecord {
            title: title.to_string(),
            url: url.to_string(),
            duration: "3:00".to_string(),
            thumbnail: None,
            requested_by: UserId::new(1),
        }
    }

    fn player() -> GuildPlayer {
        GuildPlayer::new(GuildId::new(1))
    }

    #[test]
    fn loop_mode_is_a_three_cycle() {
        for start in [LoopMode::Off, LoopMode::Playlist, LoopMode::Song] {
            assert_eq!(start.cycle().cycle().cycle(), start);
        }
        let mut state = player();
        assert_eq!(state.cycle_loop_mode(), LoopMode::Playlist);
        assert_eq!(state.cycle_loop_mode(), LoopMode::Song);
        assert_eq!(state.cycle_loop_mode(), LoopMode::Off);
    }

    #[test]
    fn first_enqueue_starts_later_ones_grow_queue() {
        let mut state = player();
        assert!(state.enqueue(record("a", "https://youtu.be/aaaaaaaaaaa")));

        // simulate the driver picking it up
        let song = state.next_song().unwrap();
        state.current = Some(song);
        state.apply(PlayerEvent::Started);

        assert!(!state.enqueue(record("b", "https://youtu.be/bbbbbbbbbbb")));
        assert!(!state.enqueue(record("c", "https://youtu.be/ccccccccccc")));
        assert_eq!(state.queue.len(), 2);
    }

    #[test]
    fn enqueue_front_prepends_without_starting() {
        let mut state = player();
        state.enqueue(record("a", "u1"));
        state.enqueue_front(record("b", "u2"));
        assert_eq!(state.queue.front().unwrap().title, "b");
        assert!(!state.playing);
    }

    #[test]
    fn playlist_loop_reappends_before_popping() {
        let mut state = player();
        state.loop_mode = LoopMode::Playlist;
        state.current = Some(record("a", "u1"));
        state.enqueue(record("b", "u2"));

        let next = state.next_song().unwrap();
        assert_eq!(next.title, "b");
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue.front().unwrap().title, "a");
    }

    #[test]
    fn playlist_loop_cycles_a_single_song() {
        let mut state = player();
        state.loop_mode = LoopMode::Playlist;
        state.current = Some(record("a", "u1"));
        let next = state.next_song().unwrap();
        assert_eq!(next.title, "a");
    }

    #[test]
    fn idle_event_respects_song_loop() {
        let mut state = player();
        state.current = Some(record("a", "u1"));
        state.apply(PlayerEvent::Started);

        state.loop_mode = LoopMode::Song;
        assert_eq!(state.apply(PlayerEvent::Idle), Advance::Replay);

        state.loop_mode = LoopMode::Off;
        state.apply(PlayerEvent::Started);
        assert_eq!(state.apply(PlayerEvent::Idle), Advance::Next);
        assert_eq!(state.apply(PlayerEvent::Failed("x".into())), Advance::Next);
    }

    #[test]
    fn playing_and_paused_stay_mutually_exclusive() {
        let mut state = player();
        state.current = Some(record("a", "u1"));

        state.apply(PlayerEvent::Started);
        assert!(state.playing && !state.paused);

        assert!(state.pause());
        assert!(state.paused && !state.playing);
        assert!(!state.pause());

        assert!(state.resume());
        assert!(state.playing && !state.paused);
        assert!(!state.resume());
    }

    #[test]
    fn skip_needs_a_current_record_and_clear_resets() {
        let mut state = player();
        assert!(!state.skip());

        state.current = Some(record("a", "u1"));
        state.apply(PlayerEvent::Started);
        assert!(state.skip());

        state.enqueue(record("b", "u2"));
        state.clear();
        assert!(state.queue.is_empty());
        assert!(state.current.is_none());
        assert!(!state.playing && !state.paused);
        assert!(state.is_idle());
    }

    #[test]
    fn music_urls_rewrite_only_at_play_time() {
        let song = record("a", "https://music.youtube.com/watch?v=dQw4w9WgXcQ&si=x");
        assert_eq!(
            song.play_url(),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert!(song.url.contains("music.youtube.com"));

        let plain = record("b", "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(plain.play_url(), plain.url);
    }

    /// Extraction fixture: URLs listed in `failing` always error, anything
    /// else resolves to a fake stream. Attempts are counted per call.
    struct FakeSource {
        failing: Vec<String>,
        attempts: AtomicU32,
    }

    impl FakeSource {
        fn failing(urls: &[&str]) -> Self {
            FakeSource {
                failing: urls.iter().map(|s| s.to_string()).collect(),
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaSource for FakeSource {
        async fn lookup(&self, _video_id: &str) -> BotResult<SongMeta> {
            Err(BotError::NotFound)
        }

        async fn search(&self, _query: &str) -> BotResult<SongMeta> {
            Err(BotError::NotFound)
        }

        async fn extract_audio_url(&self, url: &str) -> BotResult<String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.iter().any(|f| f == url) {
                Err(BotError::Playback("extraction refused".to_string()))
            } else {
                Ok(format!("https://stream.example/{url}"))
            }
        }

        async fn list_playlist(&self, _url: &str) -> BotResult<Vec<SongMeta>> {
            Err(BotError::NotFound)
        }

        async fn download_audio(&self, _url: &str) -> BotResult<PathBuf> {
            Err(BotError::NotFound)
        }
    }

    #[tokio::test]
    async fn failing_record_is_tried_three_times_then_abandoned() {
        let source = FakeSource::failing(&["bad"]);
        let player = Arc::new(Mutex::new(GuildPlayer::new(GuildId::new(1))));
        {
            let mut state = player.lock().await;
            state.enqueue(record("a", "bad"));
            state.enqueue(record("b", "good"));
        }

        let got = acquire_next_stream(&player, &source, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(got.0.title, "b");
        assert_eq!(got.1, "https://stream.example/good");
        // 3 failed attempts for "a", 1 success for "b"
        assert_eq!(source.attempts.load(Ordering::SeqCst), 4);

        let state = player.lock().await;
        assert_eq!(state.current.as_ref().unwrap().title, "b");
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn empty_queue_leaves_player_idle() {
        let source = FakeSource::failing(&[]);
        let player = Arc::new(Mutex::new(GuildPlayer::new(GuildId::new(1))));
        assert!(acquire_next_stream(&player, &source, Duration::ZERO)
            .await
            .is_none());
        assert!(player.lock().await.is_idle());
        assert_eq!(source.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_helper_reports_after_bounded_attempts() {
        let source = FakeSource::failing(&["bad"]);
        let song = record("a", "bad");
        let result = extract_with_retry(&source, &song, 3, Duration::ZERO).await;
        assert!(matches!(result, Err(BotError::Playback(_))));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rearming_the_timer_leaves_a_single_pending_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timer = InactivityTimer::default();

        let f1 = Arc::clone(&fired);
        timer.arm(true, Duration::from_millis(20), async move {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = Arc::clone(&fired);
        timer.arm(true, Duration::from_millis(20), async move {
            f2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timer_does_not_arm_while_busy() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timer = InactivityTimer::default();

        let f = Arc::clone(&fired);
        timer.arm(false, Duration::from_millis(10), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_aborts_a_pending_timer() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timer = InactivityTimer::default();

        let f = Arc::clone(&fired);
        timer.arm(true, Duration::from_millis(20), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
