//! Catalog pagination, page cache and playback queue for the hearthis.at
//! player daemon.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod pagination;
pub mod platform;
pub mod playlist;
pub mod protocol;
pub mod queue;
pub mod source;
pub mod state;

pub use cache::PageCache;
pub use config::Config;
pub use error::{CacheError, CodecError, FetchError, PlaybackError};
pub use fetcher::{CatalogFetcher, RetryPolicy};
pub use model::{CatalogPage, Scope, TrackDescriptor, TrackKey, TrackType};
pub use pagination::{CatalogEvent, LoadRejected, PaginationController, PaginationSettings, ScopeState};
pub use queue::{
    Direction, PlaybackQueue, Player, QueueEvent, RepeatMode, SelectedSet, TransportState,
};
pub use source::{CatalogSource, HearThisSource};
