use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which list of an artist's profile to paginate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    #[default]
    Tracks,
    Likes,
    Reshares,
}

impl TrackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Tracks => "tracks",
            TrackType::Likes => "likes",
            TrackType::Reshares => "reshares",
        }
    }
}

impl FromStr for TrackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tracks" => Ok(TrackType::Tracks),
            "likes" => Ok(TrackType::Likes),
            "reshares" => Ok(TrackType::Reshares),
            other => Err(format!("unknown track type '{}'", other)),
        }
    }
}

/// The browsing context a catalog is paginated against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    Artist {
        username: String,
        #[serde(default)]
        track_type: TrackType,
    },
    Genre {
        genre_id: String,
    },
    Search {
        query: String,
    },
}

impl Scope {
    pub fn artist(username: impl Into<String>, track_type: TrackType) -> Self {
        Scope::Artist {
            username: username.into(),
            track_type,
        }
    }

    pub fn genre(genre_id: impl Into<String>) -> Self {
        Scope::Genre {
            genre_id: genre_id.into(),
        }
    }

    pub fn search(query: impl Into<String>) -> Self {
        Scope::Search {
            query: query.into(),
        }
    }

    /// Short tag used in cache keys and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Artist { .. } => "artist",
            Scope::Genre { .. } => "genre",
            Scope::Search { .. } => "search",
        }
    }

    /// Scope parameters flattened into one string. Artist scopes include the
    /// track type so likes and uploads of one user never share cache entries.
    pub fn id(&self) -> String {
        match self {
            Scope::Artist {
                username,
                track_type,
            } => format!("{}.{}", username, track_type.as_str()),
            Scope::Genre { genre_id } => genre_id.clone(),
            Scope::Search { query } => query.clone(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Artist {
                username,
                track_type,
            } => write!(f, "artist '{}' ({})", username, track_type.as_str()),
            Scope::Genre { genre_id } => write!(f, "genre '{}'", genre_id),
            Scope::Search { query } => write!(f, "search '{}'", query),
        }
    }
}

/// Identity used for intra-scope deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackKey {
    Id(String),
    Locator { title: String, stream_locator: String },
}

/// One playable entry. Never mutated after construction; copies are cheap
/// enough to hand out by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub stream_locator: String,
    /// 0 when unknown.
    #[serde(default)]
    pub duration_ms: u64,
    /// Uploader display name, when the source provides one.
    #[serde(default)]
    pub artist: Option<String>,
    /// `None` for tracks that came from a playlist file.
    #[serde(default)]
    pub source_scope: Option<Scope>,
}

impl TrackDescriptor {
    pub fn new(title: impl Into<String>, stream_locator: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            stream_locator: stream_locator.into(),
            duration_ms: 0,
            artist: None,
            source_scope: None,
        }
    }

    pub fn key(&self) -> TrackKey {
        match &self.id {
            Some(id) => TrackKey::Id(id.clone()),
            None => TrackKey::Locator {
                title: self.title.clone(),
                stream_locator: self.stream_locator.clone(),
            },
        }
    }

    /// Title prefixed by the uploader when known.
    pub fn display(&self) -> String {
        match &self.artist {
            Some(a) if !a.is_empty() => format!("{} \u{2013} {}", a, self.title),
            _ => self.title.clone(),
        }
    }
}

/// Result of fetching one (scope, page) pair.
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub scope: Scope,
    pub number: u32,
    /// Records that passed validation, in source order.
    pub tracks: Vec<TrackDescriptor>,
    /// Records in the raw response before validation. Zero means the source
    /// has nothing more for this scope.
    pub raw_records: usize,
    /// The page body as received; this is what the page cache stores.
    pub raw: serde_json::Value,
}

impl CatalogPage {
    pub fn is_empty(&self) -> bool {
        self.raw_records == 0
    }

    pub fn skipped(&self) -> usize {
        self.raw_records.saturating_sub(self.tracks.len())
    }
}
