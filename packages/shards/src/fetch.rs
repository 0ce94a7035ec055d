//! Network access for manifests and blobs.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::error::{Result, ShardError};
use crate::loader::LoaderConfig;

/// Downloads artifacts.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>>;
}

/// An [`ArtifactFetcher`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ShardError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await?;
        debug!(url = %url, bytes = bytes.len(), "fetched artifact");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1_u8, 2, 3]))
            .mount(&server)
            .await;

        let fetcher = ReqwestFetcher::new(&LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/blob.bin", server.uri())).unwrap();
        assert_eq!(fetcher.fetch(&url).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn error_statuses_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = ReqwestFetcher::new(&LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing.bin", server.uri())).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(err, ShardError::Status { status: 404, .. }));
    }
}
