//! Remote catalog providers.

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::FetchError;
use crate::model::Scope;

/// Anything that can hand out one raw page of a scope.
///
/// Implementations perform a single round trip; retry, timeout and
/// cancellation are layered on top by `CatalogFetcher`.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self, scope: &Scope, page: u32, count: u32) -> Result<Value, FetchError>;
}

/// Profile details shown next to an artist's track list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistInfo {
    pub username: String,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
}

/// The hearthis.at v2 REST API.
pub struct HearThisSource {
    client: Client,
    base: Url,
}

impl HearThisSource {
    pub fn new(cfg: &ApiConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid api base_url: {}", cfg.base_url))?;
        if base.cannot_be_a_base() {
            bail!("api base_url cannot carry a path: {}", cfg.base_url);
        }
        let client = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, base })
    }

    /// `{base}/seg1/seg2/` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
            path.push("");
        }
        url
    }

    fn scope_request(&self, scope: &Scope, page: u32, count: u32) -> (Url, Vec<(&'static str, String)>) {
        let paging = [("page", page.to_string()), ("count", count.to_string())];
        match scope {
            Scope::Artist {
                username,
                track_type,
            } => {
                let mut query = vec![("type", track_type.as_str().to_string())];
                query.extend(paging);
                (self.endpoint(&[username.as_str()]), query)
            }
            Scope::Genre { genre_id } => (
                self.endpoint(&["categories", genre_id.as_str()]),
                paging.to_vec(),
            ),
            Scope::Search { query } => {
                let mut q = vec![("t", query.clone())];
                q.extend(paging);
                (self.endpoint(&["search"]), q)
            }
        }
    }

    async fn get_json(&self, url: Url, query: &[(&str, String)]) -> Result<Value, FetchError> {
        debug!("GET {} {:?}", url, query);
        let resp = self
            .client
            .get(url)
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        resp.json::<Value>().await.map_err(map_reqwest_error)
    }

    /// All genre ids offered by `/categories/`.
    pub async fn fetch_genres(&self) -> Result<Vec<String>, FetchError> {
        let raw = self.get_json(self.endpoint(&["categories"]), &[]).await?;
        let records = match &raw {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("data") {
                Some(Value::Array(items)) => items,
                _ => return Err(FetchError::MalformedPayload("genre list without data".into())),
            },
            _ => return Err(FetchError::MalformedPayload("genre list is not an array".into())),
        };
        Ok(records
            .iter()
            .filter_map(|g| match &g["id"] {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect())
    }

    pub async fn fetch_artist_info(&self, username: &str) -> Result<ArtistInfo, FetchError> {
        let raw = self.get_json(self.endpoint(&[username]), &[]).await?;
        if !raw.is_object() {
            return Err(FetchError::MalformedPayload("artist profile is not an object".into()));
        }
        let text = |key: &str| {
            raw[key]
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        Ok(ArtistInfo {
            username: text("username").unwrap_or_else(|| username.to_string()),
            avatar_url: text("avatar_url"),
            description: text("description"),
        })
    }
}

#[async_trait]
impl CatalogSource for HearThisSource {
    async fn fetch(&self, scope: &Scope, page: u32, count: u32) -> Result<Value, FetchError> {
        let (url, query) = self.scope_request(scope, page, count);
        self.get_json(url, &query).await
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_decode() {
        FetchError::MalformedPayload(e.to_string())
    } else if let Some(status) = e.status() {
        FetchError::HttpStatus(status.as_u16())
    } else {
        FetchError::ConnectionFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TrackType;

    fn source() -> HearThisSource {
        HearThisSource::new(&ApiConfig::default()).unwrap()
    }

    fn full_url(src: &HearThisSource, scope: &Scope) -> String {
        let (mut url, query) = src.scope_request(scope, 2, 20);
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        url.to_string()
    }

    #[test]
    fn test_artist_endpoint() {
        let src = source();
        let url = full_url(&src, &Scope::artist("djfoo", TrackType::Likes));
        assert_eq!(
            url,
            "https://api-v2.hearthis.at/djfoo/?type=likes&page=2&count=20"
        );
    }

    #[test]
    fn test_genre_endpoint() {
        let src = source();
        let url = full_url(&src, &Scope::genre("techno"));
        assert_eq!(
            url,
            "https://api-v2.hearthis.at/categories/techno/?page=2&count=20"
        );
    }

    #[test]
    fn test_search_endpoint_encodes_text() {
        let src = source();
        let url = full_url(&src, &Scope::search("deep house"));
        assert_eq!(
            url,
            "https://api-v2.hearthis.at/search/?t=deep+house&page=2&count=20"
        );
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let cfg = ApiConfig {
            base_url: "not a url".into(),
            ..ApiConfig::default()
        };
        assert!(HearThisSource::new(&cfg).is_err());
    }
}
