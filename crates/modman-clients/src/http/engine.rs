use super::HttpClient;
use crate::engine::*;
use crate::error::{cancellable, ClientError, ClientResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct NameResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    job_id: String,
}

/// Container engine client
///
/// Stop and remove are asynchronous on the engine side: the request returns
/// a job id that is polled until the job finishes.
pub struct HttpContainerEngine {
    http: HttpClient,
    poll_interval: Duration,
}

impl HttpContainerEngine {
    pub fn new(base_url: &str, timeout: Duration, poll_interval: Duration) -> ClientResult<Self> {
        Ok(Self {
            http: HttpClient::new(base_url, timeout)?,
            poll_interval,
        })
    }

    /// Poll a remote job until it finishes; on cancellation ask the engine
    /// to cancel it first.
    async fn await_job(&self, job_id: &str, cancel: &CancellationToken) -> ClientResult<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Err(e) = self
                        .http
                        .patch_empty(&format!("/jobs/{}/cancel", job_id))
                        .await
                    {
                        warn!(job_id = %job_id, error = %e, "Failed to cancel remote job");
                    }
                    return Err(ClientError::Canceled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let job: EngineJob = self.http.get(&format!("/jobs/{}", job_id)).await?;
            if job.canceled.is_some() {
                return Err(ClientError::JobFailed {
                    id: job.id,
                    message: "canceled by engine".to_string(),
                });
            }
            if job.completed.is_some() {
                return match job.error {
                    Some(message) => Err(ClientError::JobFailed { id: job.id, message }),
                    None => Ok(()),
                };
            }
            debug!(job_id = %job_id, "Remote job still running");
        }
    }
}

#[async_trait]
impl ContainerEngine for HttpContainerEngine {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> ClientResult<String> {
        let res: IdResponse = cancellable(cancel, self.http.post("/containers", spec)).await?;
        Ok(res.id)
    }

    async fn start_container(&self, id: &str, cancel: &CancellationToken) -> ClientResult<()> {
        cancellable(
            cancel,
            self.http.patch_empty(&format!("/containers/{}/start", id)),
        )
        .await
    }

    async fn stop_container(&self, id: &str, cancel: &CancellationToken) -> ClientResult<()> {
        let res: JobResponse = cancellable(
            cancel,
            self.http.patch(&format!("/containers/{}/stop", id)),
        )
        .await?;
        self.await_job(&res.job_id, cancel).await
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        let query = [("force", force.to_string())];
        let res: JobResponse = cancellable(
            cancel,
            self.http.delete(&format!("/containers/{}", id), &query),
        )
        .await?;
        self.await_job(&res.job_id, cancel).await
    }

    async fn get_container(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<ContainerInfo> {
        cancellable(cancel, self.http.get(&format!("/containers/{}", id))).await
    }

    async fn create_volume(
        &self,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> ClientResult<String> {
        let res: NameResponse = cancellable(cancel, self.http.post("/volumes", spec)).await?;
        Ok(res.name)
    }

    async fn list_volumes(
        &self,
        filter: &VolumeFilter,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<VolumeInfo>> {
        let query: Vec<(&str, String)> = filter
            .labels
            .iter()
            .map(|(k, v)| ("label", format!("{}={}", k, v)))
            .collect();
        cancellable(cancel, self.http.get_query("/volumes", &query)).await
    }

    async fn remove_volume(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        let query = [("force", force.to_string())];
        cancellable(
            cancel,
            self.http.delete_empty(&format!("/volumes/{}", name), &query),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine(server: &MockServer) -> HttpContainerEngine {
        HttpContainerEngine::new(
            &server.uri(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_stop_polls_job_until_completed() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/containers/c1/stop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "job_id": "j1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/j1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "j1",
                "completed": "2026-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        engine(&server)
            .stop_container("c1", &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remote_job_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/containers/c1"))
            .and(query_param("force", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "job_id": "j2" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/j2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "j2",
                "completed": "2026-01-01T00:00:00Z",
                "error": "device busy"
            })))
            .mount(&server)
            .await;

        let err = engine(&server)
            .remove_container("c1", true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::JobFailed { ref message, .. } if message == "device busy"));
    }

    #[tokio::test]
    async fn test_cancellation_cancels_remote_job() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/containers/c1/stop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "job_id": "j3" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/j3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "j3" })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/jobs/j3/cancel"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(&server);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = engine.stop_container("c1", &cancel).await.unwrap_err();
        assert!(matches!(err, ClientError::Canceled));
    }

    #[tokio::test]
    async fn test_not_found_maps_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = engine(&server)
            .get_container("missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }
}
