use std::env;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serenity::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{BotError, BotResult};

/// Discord caps bot uploads at 25 MiB; bigger downloads are discarded.
pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

const PLAYLIST_FETCH_LIMIT: u32 = 50;

/// Known YouTube URL shapes with an 11-character video id.
static VIDEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:(?:youtube\.com|music\.youtube\.com)/(?:[^/]+/.+/|(?:v|e(?:mbed)?)/|.*[?&]v=)|youtu\.be/)([^"&?/\s]{11})"#,
    )
    .unwrap()
});

static ISO_DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?").unwrap());

/// Metadata for one resolvable song, before a requester is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongMeta {
    pub title: String,
    pub url: String,
    pub duration: String,
    pub thumbnail: Option<String>,
}

/// What a submission string turned out to be.
#[derive(Debug, Clone)]
pub enum Resolved {
    Single(SongMeta),
    Playlist(Vec<SongMeta>),
}

/// The lookup/search/extract/download capabilities the player depends on.
/// Production is [`MediaTools`]; tests drive the queue with a fixture.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Metadata for a known video id via the YouTube Data API.
    async fn lookup(&self, video_id: &str) -> BotResult<SongMeta>;

    /// First search result for free text.
    async fn search(&self, query: &str) -> BotResult<SongMeta>;

    /// Direct audio stream URL for a watch URL.
    async fn extract_audio_url(&self, url: &str) -> BotResult<String>;

    /// Flat listing of a playlist, capped at [`PLAYLIST_FETCH_LIMIT`].
    async fn list_playlist(&self, url: &str) -> BotResult<Vec<SongMeta>>;

    /// Download as mp3 into a temp file and return its path.
    async fn download_audio(&self, url: &str) -> BotResult<PathBuf>;
}

pub fn extract_video_id(input: &str) -> Option<String> {
    VIDEO_ID_RE
        .captures(input)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Playlist links carry a list= parameter without pointing at a single
/// video; watch URLs that merely sit inside a playlist stay single songs.
pub fn looks_like_playlist(input: &str) -> bool {
    (input.contains("playlist?list=") || input.contains("&list="))
        && !input.contains("watch?v=")
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// "PT1H2M3S" -> "1:02:03", "215" -> "3:35", "" -> "0:00"; anything the
/// upstream already formatted passes through untouched.
pub fn format_duration(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "0:00".to_string();
    }
    if raw.starts_with("PT") {
        if let Some(caps) = ISO_DURATION_RE.captures(raw) {
            let part = |i| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse::<u64>().ok())
                    .unwrap_or(0)
            };
            return format_seconds(part(1) * 3600 + part(2) * 60 + part(3));
        }
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return format_seconds(secs as u64);
    }
    raw.to_string()
}

pub fn format_seconds(total: u64) -> String {
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Resolve any submission string: playlist link, direct video link, or a
/// free-text search.
pub async fn resolve(source: &dyn MediaSource, input: &str) -> BotResult<Resolved> {
    let input = input.trim();
    if looks_like_playlist(input) {
        return Ok(Resolved::Playlist(source.list_playlist(input).await?));
    }
    resolve_single(source, input).await.map(Resolved::Single)
}

/// Like [`resolve`] but playlists are not expanded; used for priority adds.
pub async fn resolve_single(source: &dyn MediaSource, input: &str) -> BotResult<SongMeta> {
    let input = input.trim();
    match extract_video_id(input) {
        Some(id) => source.lookup(&id).await,
        None => source.search(input).await,
    }
}

// ---- YouTube Data API response shapes (videos.list) ----

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    snippet: VideoSnippet,
    #[serde(rename = "contentDetails")]
    content_details: VideoContentDetails,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    title: String,
    #[serde(default)]
    thumbnails: VideoThumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct VideoThumbnails {
    maxres: Option<VideoThumbnail>,
    high: Option<VideoThumbnail>,
    default: Option<VideoThumbnail>,
}

#[derive(Debug, Deserialize)]
struct VideoThumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: String,
}

/// Production media source: YouTube Data API for metadata, yt-dlp
/// subprocesses for search, playlists, stream extraction and downloads.
pub struct MediaTools {
    http: Client,
    api_key: Option<String>,
}

impl MediaTools {
    pub fn new(api_key: Option<String>) -> Self {
        MediaTools {
            http: Client::new(),
            api_key,
        }
    }

    async fn run_yt_dlp(&self, args: &[&str]) -> BotResult<String> {
        let output = Command::new("yt-dlp")
            .args(args)
            .output()
            .await
            .map_err(|e| BotError::Playback(format!("failed to spawn yt-dlp: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BotError::Playback(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MediaSource for MediaTools {
    async fn lookup(&self, video_id: &str) -> BotResult<SongMeta> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            BotError::Resolution("no YouTube API key configured".to_string())
        })?;

        let response: VideoListResponse = self
            .http
            .get("https://www.googleapis.com/youtube/v3/videos")
            .query(&[
                ("part", "snippet,contentDetails"),
                ("id", video_id),
                ("key", api_key),
            ])
            .send()
            .await
            .map_err(|e| BotError::Resolution(format!("videos.list request failed: {e}")))?
            .error_for_status()
            .map_err(|e| BotError::Resolution(format!("videos.list rejected: {e}")))?
            .json()
            .await
            .map_err(|e| BotError::Resolution(format!("videos.list bad response: {e}")))?;

        let item = response.items.into_iter().next().ok_or(BotError::NotFound)?;
        let thumbs = item.snippet.thumbnails;
        let thumbnail = thumbs
            .maxres
            .or(thumbs.high)
            .or(thumbs.default)
            .map(|t| t.url);

        Ok(SongMeta {
            title: item.snippet.title,
            url: watch_url(video_id),
            duration: format_duration(&item.content_details.duration),
            thumbnail,
        })
    }

    async fn search(&self, query: &str) -> BotResult<SongMeta> {
        let target = format!("ytsearch1:{query}");
        let stdout = self
            .run_yt_dlp(&["-j", "--flat-playlist", target.as_str()])
            .await?;
        let line = stdout.lines().next().ok_or(BotError::NotFound)?;
        parse_search_result(line).ok_or(BotError::NotFound)
    }

    async fn extract_audio_url(&self, url: &str) -> BotResult<String> {
        let stdout = self
            .run_yt_dlp(&[
                "--get-url",
                "--format",
                "bestaudio[ext=m4a]/bestaudio[ext=webm]/bestaudio/best",
                "--extractor-args",
                "youtube:player_client=android",
                "--user-agent",
                "com.google.android.youtube/18.50.36 (Linux; U; Android 13)",
                "--no-check-certificate",
                "--force-ipv4",
                "--no-playlist",
                url,
            ])
            .await?;
        let stream = stdout.lines().next().unwrap_or("").trim().to_string();
        if stream.is_empty() {
            return Err(BotError::Playback(format!("no stream URL for {url}")));
        }
        Ok(stream)
    }

    async fn list_playlist(&self, url: &str) -> BotResult<Vec<SongMeta>> {
        let limit = PLAYLIST_FETCH_LIMIT.to_string();
        let stdout = self
            .run_yt_dlp(&[
                "--flat-playlist",
                "--print",
                "%(title)s|||%(url)s|||%(duration)s|||%(thumbnail)s",
                "--playlist-end",
                limit.as_str(),
                url,
            ])
            .await?;
        Ok(parse_playlist_lines(&stdout))
    }

    async fn download_audio(&self, url: &str) -> BotResult<PathBuf> {
        let dir = env::temp_dir();
        let uniq = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let prefix = format!("jukeboard-{uniq}");
        let template = dir.join(format!("{prefix}_%(title)s.%(ext)s"));
        let template = template.to_string_lossy().into_owned();

        self.run_yt_dlp(&[
            "--extract-audio",
            "--audio-format",
            "mp3",
            "--audio-quality",
            "192K",
            "--output",
            template.as_str(),
            "--no-playlist",
            "--max-filesize",
            "50M",
            "--restrict-filenames",
            url,
        ])
        .await?;

        // yt-dlp substitutes the title, so discover the file by prefix
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(BotError::Persistence)?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".mp3") {
                return Ok(entry.path());
            }
        }
        Err(BotError::Playback(format!(
            "yt-dlp produced no file for {url}"
        )))
    }
}

fn parse_search_result(line: &str) -> Option<SongMeta> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let title = value
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown title")
        .to_string();
    let url = value
        .get("url")
        .or_else(|| value.get("webpage_url"))
        .and_then(|v| v.as_str())?
        .to_string();
    let duration = value
        .get("duration")
        .and_then(|v| v.as_f64())
        .map(|secs| format_seconds(secs as u64))
        .unwrap_or_else(|| "0:00".to_string());
    let thumbnail = value
        .get("thumbnails")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.last())
        .and_then(|t| t.get("url"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Some(SongMeta {
        title,
        url,
        duration,
        thumbnail,
    })
}

/// One `title|||url|||duration|||thumbnail` line per playlist entry;
/// malformed lines are dropped, missing fields get display fallbacks.
fn parse_playlist_lines(stdout: &str) -> Vec<SongMeta> {
    stdout
        .lines()
        .filter(|line| line.contains("|||"))
        .filter_map(|line| {
            let mut parts = line.split("|||");
            let title = parts.next().unwrap_or("").trim();
            let url = parts.next().unwrap_or("").trim();
            if url.is_empty() {
                return None;
            }
            let duration = parts.next().unwrap_or("").trim();
            let thumbnail = parts.next().unwrap_or("").trim();
            Some(SongMeta {
                title: if title.is_empty() || title == "NA" {
                    "Unknown title".to_string()
                } else {
                    title.to_string()
                },
                url: url.to_string(),
                duration: if duration.is_empty() || duration == "NA" {
                    "Unknown length".to_string()
                } else {
                    format_duration(duration)
                },
                thumbnail: if thumbnail.starts_with("http") {
                    Some(thumbnail.to_string())
                } else {
                    None
                },
            })
        })
        .collect()
}

/// Fetch the yt-dlp release binary into `.bin/` when it is not already
/// there and make sure the directory is on PATH.
pub async fn ensure_yt_dlp() -> BotResult<()> {
    const BIN_DIR: &str = ".bin";
    const YTDLP_BIN: &str = "yt-dlp";
    const YTDLP_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp";

    let ytdlp_path = PathBuf::from(BIN_DIR).join(YTDLP_BIN);

    if fs::metadata(&ytdlp_path).await.is_err() {
        if Command::new(YTDLP_BIN).arg("--version").output().await.is_ok() {
            info!("using yt-dlp from PATH");
            return Ok(());
        }
        warn!("yt-dlp not found, downloading release binary");
        fs::create_dir_all(BIN_DIR)
            .await
            .map_err(BotError::Persistence)?;
        let response = Client::new()
            .get(YTDLP_URL)
            .send()
            .await
            .map_err(|e| BotError::Resolution(format!("yt-dlp download failed: {e}")))?
            .error_for_status()
            .map_err(|e| BotError::Resolution(format!("yt-dlp download rejected: {e}")))?;
        let content = response
            .bytes()
            .await
            .map_err(|e| BotError::Resolution(format!("yt-dlp download failed: {e}")))?;
        fs::write(&ytdlp_path, &content)
            .await
            .map_err(BotError::Persistence)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&ytdlp_path)
                .await
                .map_err(BotError::Persistence)?
                .permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&ytdlp_path, perms)
                .await
                .map_err(BotError::Persistence)?;
        }
    }

    prepend_path(BIN_DIR);
    Ok(())
}

fn prepend_path(bin: &str) {
    let bin_path = PathBuf::from(bin);
    let mut paths: Vec<PathBuf> = env::var_os("PATH")
        .map(|p| env::split_paths(&p).collect())
        .unwrap_or_default();

    if !paths.iter().any(|p| p == &bin_path) {
        paths.insert(0, bin_path);
        if let Ok(new_path) = env::join_paths(paths) {
            unsafe {
                env::set_var("PATH", &new_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_id_from_all_url_shapes() {
        let id = "dQw4w9WgXcQ";
        assert_eq!(
            extract_video_id("https://youtu.be/dQw4w9WgXcQ").as_deref(),
            Some(id)
        );
        assert_eq!(
            extract_video_id("https://music.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some(id)
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=30").as_deref(),
            Some(id)
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ").as_deref(),
            Some(id)
        );
    }

    #[test]
    fn short_and_free_text_inputs_have_no_id() {
        assert!(extract_video_id("https://youtu.be/short").is_none());
        assert!(extract_video_id("never gonna give you up").is_none());
    }

    #[test]
    fn playlist_classification() {
        assert!(looks_like_playlist(
            "https://www.youtube.com/playlist?list=PLx"
        ));
        assert!(looks_like_playlist("https://youtube.com/feed?x=1&list=PLx"));
        // a watch URL inside a playlist is still a single song
        assert!(!looks_like_playlist(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PLx"
        ));
        assert!(!looks_like_playlist("plain search text"));
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration("PT1H2M3S"), "1:02:03");
        assert_eq!(format_duration("PT4M13S"), "4:13");
        assert_eq!(format_duration("PT59S"), "0:59");
        assert_eq!(format_duration("125"), "2:05");
        assert_eq!(format_duration(""), "0:00");
        assert_eq!(format_duration("3:45"), "3:45");
        assert_eq!(format_seconds(125), "2:05");
        assert_eq!(format_seconds(3723), "1:02:03");
    }

    #[test]
    fn playlist_lines_parse_with_fallbacks() {
        let stdout = "\
Song One|||https://youtu.be/aaaaaaaaaaa|||215|||https://i.ytimg.com/a.jpg
NA|||https://youtu.be/bbbbbbbbbbb|||NA|||NA
garbage line without delimiters
|||https://youtu.be/ccccccccccc|||90|||not-a-url
Song Four||||||";
        let songs = parse_playlist_lines(stdout);
        assert_eq!(songs.len(), 3);
        assert_eq!(songs[0].title, "Song One");
        assert_eq!(songs[0].duration, "3:35");
        assert_eq!(songs[0].thumbnail.as_deref(), Some("https://i.ytimg.com/a.jpg"));
        assert_eq!(songs[1].title, "Unknown title");
        assert_eq!(songs[1].duration, "Unknown length");
        assert!(songs[1].thumbnail.is_none());
        assert_eq!(songs[2].duration, "1:30");
        assert!(songs[2].thumbnail.is_none());
    }

    #[test]
    fn search_result_line_parses() {
        let line = r#"{"title":"A Song","url":"https://www.youtube.com/watch?v=aaaaaaaaaaa","duration":215.0,"thumbnails":[{"url":"https://i.ytimg.com/low.jpg"},{"url":"https://i.ytimg.com/hi.jpg"}]}"#;
        let meta = parse_search_result(line).unwrap();
        assert_eq!(meta.title, "A Song");
        assert_eq!(meta.duration, "3:35");
        assert_eq!(meta.thumbnail.as_deref(), Some("https://i.ytimg.com/hi.jpg"));
    }
}
