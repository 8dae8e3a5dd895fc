//! MLflow REST client
//!
//! Speaks the `/api/2.0/mlflow` tracking and model registry endpoints plus the
//! `mlflow-artifacts` proxy for artifact upload and download. Connection
//! failures, timeouts and 5xx answers map to [`RegistryError::Unavailable`] so
//! callers can fall back instead of failing hard.

use super::{ModelRegistry, RegisteredModelVersion, RegistryError, RunInfo, RunStatus};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

const API_PREFIX: &str = "api/2.0/mlflow/";
const ARTIFACTS_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts/";
const PROXIED_ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";
const SEARCH_PAGE_SIZE: u32 = 200;

/// Client for an MLflow-compatible tracking server
pub struct MlflowRegistry {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentEnvelope {
    experiment: Experiment,
}

#[derive(Debug, Deserialize)]
struct Experiment {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct Run {
    info: WireRunInfo,
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    experiment_id: String,
    #[serde(default)]
    run_name: String,
    #[serde(default)]
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct ModelVersionEnvelope {
    model_version: WireModelVersion,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    model_versions: Vec<WireModelVersion>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireModelVersion {
    name: String,
    /// MLflow sends version numbers as strings
    version: String,
    #[serde(default)]
    run_id: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    creation_timestamp: Option<i64>,
    #[serde(default)]
    tags: Vec<WireTag>,
}

#[derive(Debug, Deserialize)]
struct WireTag {
    key: String,
    value: String,
}

impl WireModelVersion {
    fn into_version(self) -> Result<RegisteredModelVersion, RegistryError> {
        let version = self.version.parse::<u64>().map_err(|_| RegistryError::Rejected {
            status: 200,
            message: format!("non-numeric model version '{}'", self.version),
        })?;

        let run_prefix = format!("runs:/{}/", self.run_id);
        let artifact_path = match self.source.strip_prefix(&run_prefix) {
            Some(path) => path.to_string(),
            None => self
                .source
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        };

        let created_at = self
            .creation_timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(RegisteredModelVersion {
            name: self.name,
            version,
            run_id: self.run_id,
            artifact_path,
            tags: self.tags.into_iter().map(|t| (t.key, t.value)).collect::<BTreeMap<_, _>>(),
            created_at,
        })
    }
}

impl MlflowRegistry {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RegistryError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        // Trailing slash so relative joins keep any path prefix
        let normalized = format!("{}/", endpoint.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|_| RegistryError::InvalidEndpoint(endpoint.to_string()))?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url, RegistryError> {
        self.base_url
            .join(path)
            .map_err(|_| RegistryError::InvalidEndpoint(format!("{}{}", self.base_url, path)))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RegistryError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RegistryError::Unavailable(format!("request timed out: {}", e))
            } else {
                RegistryError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T, RegistryError> {
        let url = self.url(&format!("{}{}", API_PREFIX, endpoint))?;
        debug!(method = %method, url = %url, "MLflow request");

        let mut request = self.client.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = self.send(request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("failed to read response: {}", e)))?;
        if bytes.is_empty() {
            return Ok(serde_json::from_value(json!({}))?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Artifact proxy path for `<artifact_path>/<file_name>` inside a run
    async fn artifact_url(&self, run_id: &str, artifact_path: &str, file_name: &str) -> Result<Url, RegistryError> {
        let run: RunEnvelope = self
            .call(Method::GET, "runs/get", &[("run_id", run_id.to_string())], None)
            .await?;

        let root = run
            .run
            .info
            .artifact_uri
            .strip_prefix(PROXIED_ARTIFACT_SCHEME)
            .map(|p| p.trim_matches('/').to_string())
            .ok_or_else(|| RegistryError::Rejected {
                status: 400,
                message: format!(
                    "run {} stores artifacts at '{}', which is not served through the artifact proxy",
                    run_id, run.run.info.artifact_uri
                ),
            })?;

        self.url(&format!(
            "{}{}/{}/{}",
            ARTIFACTS_PREFIX,
            root,
            artifact_path.trim_matches('/'),
            file_name
        ))
    }
}

/// Map a non-success answer onto the registry error taxonomy
fn classify(status: StatusCode, body: &str) -> RegistryError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let (code, message) = match parsed {
        Some(e) => (e.error_code, e.message),
        None => (String::new(), body.to_string()),
    };

    if status.is_server_error() {
        RegistryError::Unavailable(format!("{}: {}", status, message))
    } else if status == StatusCode::NOT_FOUND || code == "RESOURCE_DOES_NOT_EXIST" {
        RegistryError::NotFound(message)
    } else {
        RegistryError::Rejected {
            status: status.as_u16(),
            message: if code.is_empty() { message } else { format!("{}: {}", code, message) },
        }
    }
}

#[async_trait]
impl ModelRegistry for MlflowRegistry {
    async fn ensure_experiment(&self, name: &str) -> Result<String, RegistryError> {
        let existing: Result<ExperimentEnvelope, _> = self
            .call(
                Method::GET,
                "experiments/get-by-name",
                &[("experiment_name", name.to_string())],
                None,
            )
            .await;

        match existing {
            Ok(envelope) => Ok(envelope.experiment.experiment_id),
            Err(RegistryError::NotFound(_)) => {
                let created: CreateExperimentResponse = self
                    .call(Method::POST, "experiments/create", &[], Some(json!({ "name": name })))
                    .await?;
                Ok(created.experiment_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo, RegistryError> {
        let envelope: RunEnvelope = self
            .call(
                Method::POST,
                "runs/create",
                &[],
                Some(json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": Utc::now().timestamp_millis(),
                })),
            )
            .await?;

        let info = envelope.run.info;
        Ok(RunInfo {
            run_id: info.run_id,
            experiment_id: info.experiment_id,
            run_name: if info.run_name.is_empty() { run_name.to_string() } else { info.run_name },
        })
    }

    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<(), RegistryError> {
        let params: Vec<Value> = params
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        let _: Value = self
            .call(
                Method::POST,
                "runs/log-batch",
                &[],
                Some(json!({ "run_id": run_id, "params": params })),
            )
            .await?;
        Ok(())
    }

    async fn log_metrics(&self, run_id: &str, metrics: &[(String, f64)]) -> Result<(), RegistryError> {
        let timestamp = Utc::now().timestamp_millis();
        let metrics: Vec<Value> = metrics
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value, "timestamp": timestamp, "step": 0 }))
            .collect();
        let _: Value = self
            .call(
                Method::POST,
                "runs/log-batch",
                &[],
                Some(json!({ "run_id": run_id, "metrics": metrics })),
            )
            .await?;
        Ok(())
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(), RegistryError> {
        let url = self.artifact_url(run_id, artifact_path, file_name).await?;
        debug!(url = %url, size = bytes.len(), "Uploading artifact");
        self.send(self.client.put(url).body(bytes.to_vec())).await?;
        Ok(())
    }

    async fn download_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        file_name: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = self.artifact_url(run_id, artifact_path, file_name).await?;
        let response = self.send(self.client.get(url)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("failed to read artifact: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<(), RegistryError> {
        let _: Value = self
            .call(
                Method::POST,
                "runs/update",
                &[],
                Some(json!({
                    "run_id": run_id,
                    "status": status.as_str(),
                    "end_time": Utc::now().timestamp_millis(),
                })),
            )
            .await?;
        Ok(())
    }

    async fn register_version(
        &self,
        name: &str,
        run_id: &str,
        artifact_path: &str,
    ) -> Result<RegisteredModelVersion, RegistryError> {
        let created: Result<Value, _> = self
            .call(Method::POST, "registered-models/create", &[], Some(json!({ "name": name })))
            .await;
        match created {
            Ok(_) => debug!(name = %name, "Created registered model"),
            Err(RegistryError::Rejected { ref message, .. }) if message.starts_with("RESOURCE_ALREADY_EXISTS") => {}
            Err(e) => return Err(e),
        }

        let envelope: ModelVersionEnvelope = self
            .call(
                Method::POST,
                "model-versions/create",
                &[],
                Some(json!({
                    "name": name,
                    "source": format!("runs:/{}/{}", run_id, artifact_path),
                    "run_id": run_id,
                })),
            )
            .await?;
        envelope.model_version.into_version()
    }

    async fn set_version_tag(&self, name: &str, version: u64, key: &str, value: &str) -> Result<(), RegistryError> {
        let _: Value = self
            .call(
                Method::POST,
                "model-versions/set-tag",
                &[],
                Some(json!({
                    "name": name,
                    "version": version.to_string(),
                    "key": key,
                    "value": value,
                })),
            )
            .await?;
        Ok(())
    }

    async fn delete_version(&self, name: &str, version: u64) -> Result<(), RegistryError> {
        let _: Value = self
            .call(
                Method::DELETE,
                "model-versions/delete",
                &[],
                Some(json!({ "name": name, "version": version.to_string() })),
            )
            .await?;
        Ok(())
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<RegisteredModelVersion>, RegistryError> {
        let mut versions = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("filter", format!("name='{}'", name.replace('\'', "\\'"))),
                ("max_results", SEARCH_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }

            let page: SearchResponse = self.call(Method::GET, "model-versions/search", &query, None).await?;
            for wire in page.model_versions {
                versions.push(wire.into_version()?);
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn registry(server: &mockito::ServerGuard) -> MlflowRegistry {
        MlflowRegistry::new(&server.url(), 5).unwrap()
    }

    #[tokio::test]
    async fn test_existing_experiment_is_reused() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/2.0/mlflow/experiments/get-by-name")
            .match_query(Matcher::UrlEncoded("experiment_name".into(), "iris_classification".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"experiment":{"experiment_id":"7","name":"iris_classification"}}"#)
            .create_async()
            .await;

        let id = registry(&server).ensure_experiment("iris_classification").await.unwrap();
        assert_eq!(id, "7");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_experiment_is_created() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/2.0/mlflow/experiments/get-by-name")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error_code":"RESOURCE_DOES_NOT_EXIST","message":"no such experiment"}"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/api/2.0/mlflow/experiments/create")
            .match_body(Matcher::PartialJson(json!({ "name": "iris_classification" })))
            .with_status(200)
            .with_body(r#"{"experiment_id":"12"}"#)
            .create_async()
            .await;

        let id = registry(&server).ensure_experiment("iris_classification").await.unwrap();
        assert_eq!(id, "12");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_version_tolerates_existing_model() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/2.0/mlflow/registered-models/create")
            .with_status(400)
            .with_body(r#"{"error_code":"RESOURCE_ALREADY_EXISTS","message":"exists"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/2.0/mlflow/model-versions/create")
            .match_body(Matcher::PartialJson(json!({
                "name": "IrisBestModel",
                "source": "runs:/abc/model",
                "run_id": "abc",
            })))
            .with_status(200)
            .with_body(
                r#"{"model_version":{"name":"IrisBestModel","version":"3","run_id":"abc",
                "source":"runs:/abc/model","creation_timestamp":1700000000000}}"#,
            )
            .create_async()
            .await;

        let version = registry(&server)
            .register_version("IrisBestModel", "abc", "model")
            .await
            .unwrap();
        assert_eq!(version.version, 3);
        assert_eq!(version.artifact_path, "model");
        assert!(version.tags.is_empty());
    }

    #[tokio::test]
    async fn test_search_by_tag_follows_pages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/2.0/mlflow/model-versions/search")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("filter".into(), "name='IrisBestModel'".into()),
                // First page carries no page token
                Matcher::Regex("max_results=200$".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"model_versions":[
                    {"name":"IrisBestModel","version":"1","run_id":"r1","source":"runs:/r1/model",
                     "tags":[{"key":"stage","value":"Archived"}]}
                ],"next_page_token":"p2"}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/api/2.0/mlflow/model-versions/search")
            .match_query(Matcher::UrlEncoded("page_token".into(), "p2".into()))
            .with_status(200)
            .with_body(
                r#"{"model_versions":[
                    {"name":"IrisBestModel","version":"2","run_id":"r2","source":"runs:/r2/model",
                     "tags":[{"key":"stage","value":"Production"}]}
                ]}"#,
            )
            .create_async()
            .await;

        let registry = registry(&server);
        assert_eq!(registry.list_versions("IrisBestModel").await.unwrap().len(), 2);

        let tagged = registry
            .search_versions_by_tag("IrisBestModel", "stage", "Production")
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].version, 2);
        assert_eq!(tagged[0].run_id, "r2");
    }

    #[tokio::test]
    async fn test_artifact_download_through_proxy() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/2.0/mlflow/runs/get")
            .match_query(Matcher::UrlEncoded("run_id".into(), "r2".into()))
            .with_status(200)
            .with_body(
                r#"{"run":{"info":{"run_id":"r2","experiment_id":"1",
                "artifact_uri":"mlflow-artifacts:/1/r2/artifacts"}}}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/api/2.0/mlflow-artifacts/artifacts/1/r2/artifacts/model/model.json")
            .with_status(200)
            .with_body("{\"ok\":true}")
            .create_async()
            .await;

        let bytes = registry(&server).download_artifact("r2", "model", "model.json").await.unwrap();
        assert_eq!(bytes, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/2.0/mlflow/model-versions/search")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let result = registry(&server).list_versions("IrisBestModel").await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let registry = MlflowRegistry::new("http://127.0.0.1:1", 2).unwrap();
        let result = registry.list_versions("IrisBestModel").await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));
    }

    #[test]
    fn test_classify_client_errors() {
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, r#"{"error_code":"RESOURCE_DOES_NOT_EXIST","message":"x"}"#),
            RegistryError::NotFound(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, "plain text"),
            RegistryError::Rejected { status: 400, .. }
        ));
    }
}
