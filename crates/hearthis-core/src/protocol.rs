use serde::{Deserialize, Serialize};

use crate::model::{Scope, TrackDescriptor, TrackType};
use crate::queue::{RepeatMode, TransportState};
use crate::source::ArtistInfo;

/// Which list the transport commands walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueSource {
    #[default]
    Catalog,
    Selected,
}

/// Commands accepted on the daemon's input, one per line. Either a JSON
/// object tagged by `cmd` or the plain text form (`artist djfoo likes`,
/// `play 3`, ...). Indices are view positions, starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Artist {
        username: String,
        #[serde(default)]
        track_type: TrackType,
    },
    Genre {
        id: String,
    },
    Search {
        text: String,
    },
    /// Fetch one more page of the active scope.
    More,
    Genres,
    Info {
        username: String,
    },
    List,
    Play {
        index: usize,
    },
    Toggle,
    Stop,
    Next,
    Prev,
    Repeat,
    Shuffle,
    Filter {
        #[serde(default)]
        text: Option<String>,
    },
    Add {
        index: usize,
    },
    /// Index into the selected list, not the visible queue.
    Remove {
        index: usize,
    },
    Selected,
    Source {
        source: QueueSource,
    },
    Volume {
        value: u8,
    },
    Mute,
    Seek {
        seconds: f64,
    },
    Save {
        path: String,
    },
    Load {
        path: String,
    },
    Quit,
}

impl Command {
    pub fn parse_line(line: &str) -> Result<Command, String> {
        let line = line.trim();
        if line.starts_with('{') {
            return serde_json::from_str(line).map_err(|e| format!("bad command json: {}", e));
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };

        let need = |what: &str| -> Result<String, String> {
            if rest.is_empty() {
                Err(format!("'{}' needs {}", word, what))
            } else {
                Ok(rest.to_string())
            }
        };
        let index = || -> Result<usize, String> {
            rest.parse::<usize>()
                .map_err(|_| format!("'{}' needs a track number", word))
        };

        let cmd = match word.to_ascii_lowercase().as_str() {
            "artist" => {
                let mut parts = rest.split_whitespace();
                let username = parts
                    .next()
                    .ok_or_else(|| "'artist' needs a username".to_string())?
                    .to_string();
                let track_type = match parts.next() {
                    Some(t) => t.parse::<TrackType>()?,
                    None => TrackType::Tracks,
                };
                Command::Artist {
                    username,
                    track_type,
                }
            }
            "genre" => Command::Genre {
                id: need("a genre id")?,
            },
            "search" => Command::Search {
                text: need("search text")?,
            },
            "more" => Command::More,
            "genres" => Command::Genres,
            "info" => Command::Info {
                username: need("a username")?,
            },
            "list" | "ls" => Command::List,
            "play" => Command::Play { index: index()? },
            "toggle" | "pause" => Command::Toggle,
            "stop" => Command::Stop,
            "next" => Command::Next,
            "prev" => Command::Prev,
            "repeat" => Command::Repeat,
            "shuffle" => Command::Shuffle,
            "filter" => Command::Filter {
                text: (!rest.is_empty()).then(|| rest.to_string()),
            },
            "add" => Command::Add { index: index()? },
            "remove" | "rm" => Command::Remove { index: index()? },
            "selected" => Command::Selected,
            "source" => Command::Source {
                source: match rest {
                    "catalog" => QueueSource::Catalog,
                    "selected" => QueueSource::Selected,
                    _ => return Err("'source' takes catalog or selected".to_string()),
                },
            },
            "volume" | "vol" => Command::Volume {
                value: rest
                    .parse::<u8>()
                    .map_err(|_| "'volume' takes 0-100".to_string())?,
            },
            "mute" => Command::Mute,
            "seek" => Command::Seek {
                seconds: rest
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .ok_or_else(|| "'seek' takes seconds".to_string())?,
            },
            "save" => Command::Save {
                path: need("a path")?,
            },
            "load" => Command::Load {
                path: need("a path")?,
            },
            "quit" | "exit" => Command::Quit,
            "" => return Err("empty command".to_string()),
            other => return Err(format!("unknown command '{}'", other)),
        };
        Ok(cmd)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedTrack {
    pub index: usize,
    pub title: String,
    pub stream_locator: String,
    pub duration_ms: u64,
    pub current: bool,
}

impl ListedTrack {
    pub fn new(index: usize, track: &TrackDescriptor, current: bool) -> Self {
        Self {
            index,
            title: track.display(),
            stream_locator: track.stream_locator.clone(),
            duration_ms: track.duration_ms,
            current,
        }
    }
}

/// Lines the daemon writes to stdout, one JSON object each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notice {
    ScopeLoading {
        scope: Scope,
    },
    PageMerged {
        scope: Scope,
        page: u32,
        added: usize,
        total: usize,
    },
    ScopeExhausted {
        scope: Scope,
    },
    ScopeFailed {
        scope: Scope,
        error: String,
    },
    Track {
        index: Option<usize>,
        title: String,
        stream_locator: String,
    },
    State {
        state: TransportState,
        repeat: RepeatMode,
        shuffle: bool,
        volume: u8,
        muted: bool,
        timeline: String,
    },
    List {
        source: QueueSource,
        tracks: Vec<ListedTrack>,
    },
    Genres {
        ids: Vec<String>,
    },
    Artist {
        info: ArtistInfo,
    },
    Info {
        message: String,
    },
    Error {
        message: String,
    },
}
