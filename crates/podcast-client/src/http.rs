//! HTTP client for the episode service.

use podcast_proto::config::ApiConfig;
use podcast_proto::episode::{CreateEpisode, Episode};
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::{EpisodeError, Result};
use crate::query::QueryParams;
use crate::service::EpisodeService;

/// FastAPI error body: `{"detail": "..."}`.  Validation errors carry a list.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct HttpEpisodeService {
    client: reqwest::Client,
    base_url: String,
    base: Url,
}

impl HttpEpisodeService {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)
            .map_err(|e| EpisodeError::Validation(format!("base url {:?}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(EpisodeError::Validation(format!(
                "base url {:?} cannot carry a path",
                base_url
            )));
        }
        Ok(Self {
            client,
            base_url,
            base,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `/episodes/{id}[/{action}]` with the id percent-encoded as one segment.
    fn episode_url(&self, id: &str, action: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("episodes").push(id);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        url
    }

    /// `GET /health`.  Ok when the service answers 2xx.
    pub async fn health(&self) -> Result<()> {
        let resp = self.client.get(self.url("/health")).send().await?;
        check(resp, None).await?;
        Ok(())
    }
}

impl EpisodeService for HttpEpisodeService {
    async fn list_episodes(&self, params: &QueryParams) -> Result<Vec<Episode>> {
        let pairs = params.to_query_pairs();
        debug!("[http] GET /episodes {:?}", pairs);
        let resp = self
            .client
            .get(self.url("/episodes"))
            .query(&pairs)
            .header("Accept", "application/json")
            .send()
            .await?;
        decode(check(resp, None).await?).await
    }

    async fn get_episode(&self, id: &str) -> Result<Episode> {
        debug!("[http] GET /episodes/{}", id);
        let resp = self
            .client
            .get(self.episode_url(id, None))
            .header("Accept", "application/json")
            .send()
            .await?;
        decode(check(resp, Some(id)).await?).await
    }

    async fn create_episode(&self, request: &CreateEpisode) -> Result<Episode> {
        debug!("[http] POST /episodes topic={:?}", request.topic());
        let resp = self
            .client
            .post(self.url("/episodes"))
            .json(request)
            .send()
            .await?;
        decode(check(resp, None).await?).await
    }

    async fn regenerate_episode(&self, id: &str) -> Result<()> {
        debug!("[http] POST /episodes/{}/regenerate", id);
        let resp = self
            .client
            .post(self.episode_url(id, Some("regenerate")))
            .send()
            .await?;
        check(resp, Some(id)).await?;
        Ok(())
    }
}

/// Map a non-success response to an error.  `id` is the episode the route
/// addresses, if any.
async fn check(resp: Response, id: Option<&str>) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    debug!("[http] {} body={}", status, body.trim());
    Err(match (status, id) {
        (StatusCode::NOT_FOUND, Some(id)) => EpisodeError::NotFound(id.to_string()),
        (StatusCode::BAD_REQUEST, Some(id)) => EpisodeError::InvalidId(id.to_string()),
        _ => EpisodeError::Api {
            status: status.as_u16(),
            detail: error_detail(&body),
        },
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(s),
        }) => s,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_prefers_fastapi_body() {
        assert_eq!(
            error_detail(r#"{"detail":"Episode not found"}"#),
            "Episode not found"
        );
        assert_eq!(error_detail("Bad Gateway\n"), "Bad Gateway");
        let list = error_detail(r#"{"detail":[{"msg":"too short"}]}"#);
        assert!(list.contains("too short"));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let config = ApiConfig {
            base_url: "http://localhost:8000/api/".to_string(),
            ..ApiConfig::default()
        };
        let svc = HttpEpisodeService::new(&config).unwrap();
        assert_eq!(svc.base_url(), "http://localhost:8000/api");
        assert_eq!(svc.url("/episodes"), "http://localhost:8000/api/episodes");
    }

    #[test]
    fn test_episode_id_is_one_escaped_segment() {
        let config = ApiConfig {
            base_url: "http://localhost:8000/api/".to_string(),
            ..ApiConfig::default()
        };
        let svc = HttpEpisodeService::new(&config).unwrap();
        assert_eq!(
            svc.episode_url("../health?x#y", Some("regenerate")).as_str(),
            "http://localhost:8000/api/episodes/..%2Fhealth%3Fx%23y/regenerate"
        );

        let bare = HttpEpisodeService::new(&ApiConfig {
            base_url: "http://localhost:8000".to_string(),
            ..ApiConfig::default()
        })
        .unwrap();
        assert_eq!(
            bare.episode_url("ep1", None).as_str(),
            "http://localhost:8000/episodes/ep1"
        );
    }

    #[test]
    fn test_bad_base_url_is_rejected() {
        let config = ApiConfig {
            base_url: "not a url".to_string(),
            ..ApiConfig::default()
        };
        assert!(matches!(
            HttpEpisodeService::new(&config),
            Err(EpisodeError::Validation(_))
        ));
    }
}
