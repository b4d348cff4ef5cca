//! The wire transport (spec §6): four endpoints against the sync server,
//! all bearer-authenticated and all carrying `app_id` as a query parameter.
//! Grounded on `sync15::client::Sync15StorageClient`'s shape (one client
//! struct, one method per endpoint) but built on `reqwest` rather than the
//! teacher's internal `viaduct` transport, since this is a standalone
//! engine with no Firefox-specific HTTP stack to share.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

use crate::config::GetAuthToken;
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct LatestLtsResponse {
    lts: i64,
}

#[derive(Deserialize)]
struct DataResponse {
    data: Option<Vec<JsonValue>>,
}

#[derive(Serialize)]
struct PushBody<'a> {
    name: &'a str,
    /// Deliberately a JSON-encoded *string*, not an inline array — the
    /// server contract requires the nested-string form (spec §6's note).
    data: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PushResult {
    pub id: String,
    pub status: String,
    pub lts: Option<i64>,
    #[allow(dead_code)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
struct PushResponse {
    results: Vec<PushResult>,
}

pub struct SyncHttpClient {
    client: Client,
    base_url: Url,
    app_id: String,
    get_auth_token: GetAuthToken,
}

impl SyncHttpClient {
    pub fn new(client: Client, base_url: Url, app_id: String, get_auth_token: GetAuthToken) -> Self {
        Self {
            client,
            base_url,
            app_id,
            get_auth_token,
        }
    }

    async fn bearer(&self) -> Result<String> {
        let token = (self.get_auth_token)()
            .await
            .map_err(|e| Error::Authentication(e.to_string()))?;
        Ok(format!("Bearer {token}"))
    }

    /// `GET /latest-lts?name=<entity>`. `200` yields the server's current
    /// high-water mark; `403`/`404` means the entity isn't known to the
    /// server yet, which the registrar treats as baseline zero.
    pub async fn latest_lts(&self, entity: &str) -> Result<Option<i64>> {
        let mut url = self.base_url.join("latest-lts")?;
        url.query_pairs_mut()
            .append_pair("name", entity)
            .append_pair("app_id", &self.app_id);
        let auth = self.bearer().await?;
        let resp = self
            .client
            .get(url.clone())
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let body: LatestLtsResponse = resp.json().await?;
                Ok(Some(body.lts))
            }
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    /// `GET /data?name=<entity>&pageSize=<P>&lts=<watermark?>`. Returns the
    /// page's rows as raw JSON objects; an absent or empty `data` field both
    /// mean "no more pages" (spec §9's open question resolved explicitly).
    pub async fn fetch_page(
        &self,
        entity: &str,
        lts: Option<i64>,
        page_size: u32,
    ) -> Result<Vec<JsonValue>> {
        let mut url = self.base_url.join("data")?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("name", entity);
            qp.append_pair("pageSize", &page_size.to_string());
            if let Some(lts) = lts {
                qp.append_pair("lts", &lts.to_string());
            }
            qp.append_pair("app_id", &self.app_id);
        }
        let auth = self.bearer().await?;
        let resp = self
            .client
            .get(url.clone())
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        let body: DataResponse = resp.json().await?;
        Ok(body.data.unwrap_or_default())
    }

    /// `POST /data?app_id=<A>` with `{name, data: "<json-array-string>"}`.
    pub async fn push_batch(&self, entity: &str, rows: &[JsonValue]) -> Result<Vec<PushResult>> {
        let mut url = self.base_url.join("data")?;
        url.query_pairs_mut().append_pair("app_id", &self.app_id);
        let inner = serde_json::to_string(rows)?;
        let body = PushBody { name: entity, data: inner };
        let auth = self.bearer().await?;
        let resp = self
            .client
            .post(url.clone())
            .header(reqwest::header::AUTHORIZATION, auth)
            .json(&body)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        let body: PushResponse = resp.json().await?;
        Ok(body.results)
    }

    /// `GET /events?app_id=<A>`, returning the live response for the caller
    /// to consume as a byte stream line by line.
    pub async fn open_event_stream(&self) -> Result<reqwest::Response> {
        let mut url = self.base_url.join("events")?;
        url.query_pairs_mut().append_pair("app_id", &self.app_id);
        let auth = self.bearer().await?;
        let resp = self
            .client
            .get(url.clone())
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn client_for(server_url: &str) -> SyncHttpClient {
        SyncHttpClient::new(
            Client::new(),
            Url::parse(server_url).unwrap(),
            "my-app".to_string(),
            Arc::new(|| Box::pin(async { Ok("test-token".to_string()) })),
        )
    }

    #[tokio::test]
    async fn test_latest_lts_ok() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/latest-lts")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"lts": 42}"#)
            .create_async()
            .await;
        let client = client_for(&server.url());
        let lts = client.latest_lts("items").await.unwrap();
        assert_eq!(lts, Some(42));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_latest_lts_unknown_entity_baselines_to_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/latest-lts")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        let client = client_for(&server.url());
        assert_eq!(client.latest_lts("items").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_page_empty_data_means_no_more_pages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/data")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data": []}"#)
            .create_async()
            .await;
        let client = client_for(&server.url());
        let rows = client.fetch_page("items", Some(10), 1000).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_page_null_data_also_means_no_more_pages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/data")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data": null}"#)
            .create_async()
            .await;
        let client = client_for(&server.url());
        let rows = client.fetch_page("items", None, 1000).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_push_batch_double_encodes_data() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/data")
            .match_query(mockito::Matcher::Any)
            .match_body(mockito::Matcher::Regex(
                r#""data":"\[\{.*\}\]""#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"results": [{"id": "a", "status": "accepted", "lts": 5}]}"#)
            .create_async()
            .await;
        let client = client_for(&server.url());
        let row = serde_json::json!({"id": "a", "name": "x"});
        let results = client.push_batch("items", &[row]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "accepted");
        assert_eq!(results[0].lts, Some(5));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_200_is_unexpected_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/data")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        let client = client_for(&server.url());
        let err = client.fetch_page("items", None, 1000).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedStatus { status: 500, .. }));
    }
}
