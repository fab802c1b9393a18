//! Dataset management.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::limit::Category;
use crate::transport::{HttpTransport, TransportRequest};

const DATASETS_PATH: &str = "/v1/datasets";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Who created the dataset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDataset {
    pub name: String,
    pub description: String,
}

impl CreateDataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateDataset {
    pub description: String,
}

/// CRUD calls for datasets. Holds no state of its own; rate limits are
/// tracked by the shared transport.
#[derive(Clone)]
pub struct DatasetsService {
    transport: Arc<HttpTransport>,
}

impl DatasetsService {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }

    pub async fn list(&self) -> Result<Vec<Dataset>> {
        let datasets = self
            .transport
            .send::<Vec<Dataset>>(&TransportRequest::get(DATASETS_PATH))
            .await?
            .unwrap_or_default();
        debug!(count = datasets.len(), "Listed datasets");
        Ok(datasets)
    }

    pub async fn get(&self, id: &str) -> Result<Dataset> {
        let request = TransportRequest::get(dataset_path(id));
        self.expect_dataset(&request).await
    }

    pub async fn create(&self, dataset: &CreateDataset) -> Result<Dataset> {
        let request =
            TransportRequest::new(Method::POST, DATASETS_PATH, Category::Api).json_body(dataset)?;
        self.expect_dataset(&request).await
    }

    pub async fn update(&self, id: &str, update: &UpdateDataset) -> Result<Dataset> {
        let request =
            TransportRequest::new(Method::PUT, dataset_path(id), Category::Api).json_body(update)?;
        self.expect_dataset(&request).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let request = TransportRequest::new(Method::DELETE, dataset_path(id), Category::Api);
        self.transport
            .send::<serde_json::Value>(&request)
            .await
            .map(|_| ())
    }

    async fn expect_dataset(&self, request: &TransportRequest) -> Result<Dataset> {
        self.transport
            .send::<Dataset>(request)
            .await?
            .ok_or_else(|| ClientError::Parse("empty response body".to_string()))
    }
}

fn dataset_path(id: &str) -> String {
    format!("{}/{}", DATASETS_PATH, urlencoding::encode(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use reqwest::StatusCode;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn service(server: &MockServer) -> DatasetsService {
        let config = Config::new("test-token")
            .with_url(server.uri())
            .with_max_attempts(1);
        DatasetsService::new(Arc::new(HttpTransport::new(&config).unwrap()))
    }

    #[tokio::test]
    async fn test_list_datasets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datasets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "logs", "name": "logs", "description": "app logs"},
                {"id": "traces", "name": "traces", "created": "2024-05-01T12:00:00Z"}
            ])))
            .mount(&server)
            .await;

        let datasets = service(&server).await.list().await.unwrap();

        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].description, "app logs");
        assert!(datasets[0].created.is_none());
        assert!(datasets[1].created.is_some());
    }

    #[tokio::test]
    async fn test_create_dataset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets"))
            .and(body_json(json!({"name": "metrics", "description": "host metrics"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "metrics", "name": "metrics", "description": "host metrics"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let created = service(&server)
            .await
            .create(&CreateDataset::new("metrics").description("host metrics"))
            .await
            .unwrap();

        assert_eq!(created.id, "metrics");
    }

    #[tokio::test]
    async fn test_update_dataset() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/datasets/logs"))
            .and(body_json(json!({"description": "renamed"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "logs", "name": "logs", "description": "renamed"})),
            )
            .mount(&server)
            .await;

        let updated = service(&server)
            .await
            .update(
                "logs",
                &UpdateDataset {
                    description: "renamed".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.description, "renamed");
    }

    #[tokio::test]
    async fn test_delete_dataset() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/datasets/logs"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        service(&server).await.delete("logs").await.unwrap();
    }

    #[tokio::test]
    async fn test_dataset_id_is_escaped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datasets/a%2Fb%3Fc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "a/b?c", "name": "a/b?c"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dataset = service(&server).await.get("a/b?c").await.unwrap();
        assert_eq!(dataset.id, "a/b?c");
    }

    #[tokio::test]
    async fn test_get_missing_dataset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datasets/nope"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"message": "dataset not found"})),
            )
            .mount(&server)
            .await;

        let err = service(&server).await.get("nope").await.unwrap_err();

        match err {
            ClientError::Status { code, message } => {
                assert_eq!(code, StatusCode::NOT_FOUND);
                assert_eq!(message, "dataset not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_requests_are_tracked_under_api_category() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .insert_header("x-ratelimit-limit", "100")
                    .insert_header("x-ratelimit-remaining", "99")
                    .insert_header("x-ratelimit-scope", "organization"),
            )
            .mount(&server)
            .await;

        let service = service(&server).await;
        service.list().await.unwrap();

        let limits = service.transport.rate_limits().snapshot();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].key(), "api:organization");
        assert_eq!(limits[0].remaining, Some(99));
    }
}
