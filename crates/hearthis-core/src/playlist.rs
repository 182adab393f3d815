//! Playlist files: the two-column `title<TAB>locator` text form and M3U.

use anyhow::Context;
use std::path::Path;
use tracing::{info, warn};

use crate::error::CodecError;
use crate::model::TrackDescriptor;

/// Outcome of decoding a playlist; bad lines are collected, not fatal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPlaylist {
    pub tracks: Vec<TrackDescriptor>,
    pub skipped: Vec<CodecError>,
}

/// Tabs and line breaks in titles become single spaces.
fn clean_title(title: &str) -> String {
    title.replace(['\t', '\r', '\n'], " ")
}

pub fn encode(tracks: &[TrackDescriptor]) -> String {
    let mut out = String::new();
    for t in tracks {
        out.push_str(&clean_title(&t.title));
        out.push('\t');
        out.push_str(&t.stream_locator);
        out.push('\n');
    }
    out
}

pub fn decode(text: &str) -> DecodedPlaylist {
    let mut decoded = DecodedPlaylist::default();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(line) {
            Some(track) => decoded.tracks.push(track),
            None => {
                warn!("playlist line {} skipped: expected title<TAB>locator", line_no);
                decoded.skipped.push(CodecError::LineMalformed(line_no));
            }
        }
    }
    decoded
}

fn decode_line(line: &str) -> Option<TrackDescriptor> {
    let (title, locator) = line.split_once('\t')?;
    let locator = locator.trim();
    if title.is_empty() || locator.is_empty() || locator.contains('\t') {
        return None;
    }
    Some(TrackDescriptor::new(title, locator))
}

pub fn encode_m3u(tracks: &[TrackDescriptor]) -> String {
    let mut out = String::from("#EXTM3U\n");
    for t in tracks {
        out.push_str(&format!(
            "#EXTINF:{},{}\n{}\n",
            m3u_seconds(t.duration_ms),
            clean_title(&t.title).trim(),
            t.stream_locator
        ));
    }
    out
}

fn m3u_seconds(duration_ms: u64) -> i64 {
    if duration_ms == 0 {
        -1
    } else {
        (duration_ms / 1000) as i64
    }
}

/// Entries without an `#EXTINF` title use the locator as their title.
pub fn decode_m3u(text: &str) -> DecodedPlaylist {
    let mut decoded = DecodedPlaylist::default();
    let mut pending: Option<(String, u64)> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some((secs, title)) = rest.split_once(',') {
                let duration_ms = secs
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .filter(|s| *s > 0)
                    .map(|s| s as u64 * 1000)
                    .unwrap_or(0);
                pending = Some((title.trim().to_string(), duration_ms));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let (title, duration_ms) = pending
            .take()
            .filter(|(t, _)| !t.is_empty())
            .unwrap_or_else(|| (line.to_string(), 0));
        let mut track = TrackDescriptor::new(title, line);
        track.duration_ms = duration_ms;
        decoded.tracks.push(track);
    }
    decoded
}

fn is_m3u(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("m3u") || e.eq_ignore_ascii_case("m3u8"))
        .unwrap_or(false)
}

/// Write `tracks` to `path`; `.m3u`/`.m3u8` get M3U, anything else the
/// tab format.
pub async fn save_playlist(path: &Path, tracks: &[TrackDescriptor]) -> anyhow::Result<()> {
    let body = if is_m3u(path) {
        encode_m3u(tracks)
    } else {
        encode(tracks)
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("failed to write playlist {}", path.display()))?;
    info!("saved {} tracks to {}", tracks.len(), path.display());
    Ok(())
}

pub async fn load_playlist(path: &Path) -> anyhow::Result<DecodedPlaylist> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read playlist {}", path.display()))?;
    let decoded = if is_m3u(path) {
        decode_m3u(&text)
    } else {
        decode(&text)
    };
    info!(
        "loaded {} tracks from {} ({} lines skipped)",
        decoded.tracks.len(),
        path.display(),
        decoded.skipped.len()
    );
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_in_title_normalized() {
        let t = TrackDescriptor::new("a\tb", "https://x/1");
        assert_eq!(encode(&[t]), "a b\thttps://x/1\n");
    }

    #[test]
    fn test_bad_lines_skipped_with_line_numbers() {
        let text = "Good\thttps://x/1\nno tab here\n\n\thttps://x/empty-title\nAlso good\thttps://x/2\nextra\ta\tb\n";
        let decoded = decode(text);
        let titles: Vec<_> = decoded.tracks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Good", "Also good"]);
        assert_eq!(
            decoded.skipped,
            vec![
                CodecError::LineMalformed(2),
                CodecError::LineMalformed(4),
                CodecError::LineMalformed(6)
            ]
        );
    }

    #[test]
    fn test_crlf_input() {
        let decoded = decode("One\thttps://x/1\r\nTwo\thttps://x/2\r\n");
        assert_eq!(decoded.tracks.len(), 2);
        assert_eq!(decoded.tracks[1].stream_locator, "https://x/2");
    }

    #[test]
    fn test_m3u_roundtrip_keeps_titles_and_duration() {
        let mut a = TrackDescriptor::new("Night Drive", "https://x/a.mp3");
        a.duration_ms = 185_000;
        let b = TrackDescriptor::new("Untimed", "https://x/b.mp3");
        let text = encode_m3u(&[a.clone(), b.clone()]);
        assert!(text.starts_with("#EXTM3U\n#EXTINF:185,Night Drive\n"));
        assert!(text.contains("#EXTINF:-1,Untimed\n"));

        let decoded = decode_m3u(&text);
        assert_eq!(decoded.tracks, vec![a, b]);
    }

    #[test]
    fn test_m3u_without_extinf_uses_locator() {
        let decoded = decode_m3u("https://x/plain.mp3\n");
        assert_eq!(decoded.tracks[0].title, "https://x/plain.mp3");
    }

    #[tokio::test]
    async fn test_save_and_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let tracks = vec![
            TrackDescriptor::new("One", "https://x/1"),
            TrackDescriptor::new("Two", "https://x/2"),
        ];

        let txt = dir.path().join("list.txt");
        save_playlist(&txt, &tracks).await.unwrap();
        assert!(std::fs::read_to_string(&txt).unwrap().starts_with("One\t"));
        assert_eq!(load_playlist(&txt).await.unwrap().tracks, tracks);

        let m3u = dir.path().join("list.m3u");
        save_playlist(&m3u, &tracks).await.unwrap();
        assert!(std::fs::read_to_string(&m3u).unwrap().starts_with("#EXTM3U"));
        assert_eq!(load_playlist(&m3u).await.unwrap().tracks, tracks);
    }
}
