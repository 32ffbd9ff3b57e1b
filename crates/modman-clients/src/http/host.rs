use super::HttpClient;
use crate::error::{cancellable, ClientResult};
use crate::host::{HostResource, HostResources};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host resource service client
pub struct HttpHostResources {
    http: HttpClient,
}

impl HttpHostResources {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        Ok(Self {
            http: HttpClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl HostResources for HttpHostResources {
    async fn get_host_resource(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<HostResource> {
        cancellable(cancel, self.http.get(&format!("/host-resources/{}", id))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_host_resource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/host-resources/tty0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "tty0",
                "name": "serial",
                "path": "/dev/ttyUSB0"
            })))
            .mount(&server)
            .await;

        let client = HttpHostResources::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let res = client
            .get_host_resource("tty0", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res.path, "/dev/ttyUSB0");
        assert!(res.resource_type.is_none());
    }
}
