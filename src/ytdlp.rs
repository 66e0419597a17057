use std::time::Duration;

use serde::Deserialize;
use serenity::model::id::UserId;
use tokio::process::Command;
use tracing::{info, warn};

use crate::backend::is_url;
use crate::error::{PlayerError, PlayerResult};
use crate::models::{Resolution, Track, UNKNOWN_TRACK_TITLE};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// One line of `yt-dlp -j` output, either a full video or a flat playlist
/// entry.
#[derive(Deserialize)]
struct YtDlpEntry {
    title: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    duration: Option<f64>,
    playlist_title: Option<String>,
}

pub fn is_playlist(query: &str) -> bool {
    is_url(query) && (query.contains("?list=") || query.contains("&list="))
}

/// Looks `query` up with yt-dlp. URLs are used as is (playlists expanded
/// flat), anything else becomes a search for the best match.
pub async fn lookup(query: &str, requester: UserId) -> PlayerResult<Resolution> {
    let mut command = Command::new("yt-dlp");
    command.arg("-j").kill_on_drop(true);

    if is_playlist(query) {
        info!("Detected playlist in {query}");
        command.arg("--flat-playlist").arg(query);
    } else if is_url(query) {
        command.arg("--no-playlist").arg(query);
    } else {
        command.arg("--no-playlist").arg(format!("ytsearch1:{query}"));
    }

    let output = tokio::time::timeout(LOOKUP_TIMEOUT, command.output())
        .await
        .map_err(|_| PlayerError::Backend("yt-dlp timed out".to_string()))?
        .map_err(|why| PlayerError::Backend(format!("yt-dlp failed to start: {why}")))?;

    if !output.status.success() {
        warn!(
            "yt-dlp exited with {} for {query}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let resolution = parse_entries(&String::from_utf8_lossy(&output.stdout), requester, is_playlist(query));

    if resolution.tracks.is_empty() {
        Err(PlayerError::ResolutionFailed)
    } else {
        Ok(resolution)
    }
}

fn parse_entries(output: &str, requester: UserId, playlist: bool) -> Resolution {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();
    let mut playlist_title = None;

    let tracks: Vec<Track> = lines
        .iter()
        .filter_map(|line| {
            let entry: YtDlpEntry = serde_json::from_str(line).ok()?;
            let uri = entry.webpage_url.or(entry.url)?;

            if playlist_title.is_none() {
                playlist_title = entry.playlist_title;
            }

            Some(Track {
                title: entry.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
                source: uri.clone(),
                uri,
                requester,
                duration: entry
                    .duration
                    .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
                    .map(Duration::from_secs_f64),
            })
        })
        .collect();

    if tracks.len() < lines.len() {
        warn!("Skipped {} yt-dlp entries that could not be parsed", lines.len() - tracks.len());
    }

    Resolution {
        playlist: if playlist {
            Some(playlist_title.unwrap_or_else(|| "Playlist".to_string()))
        } else {
            None
        },
        tracks,
    }
}
