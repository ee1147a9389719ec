//! Bundled fetcher for HTTP(S) resources.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{header, Client, Response, StatusCode, Url};

use crate::config::FetchTimeouts;
use crate::error::FetchError;

use super::{retry, FetchRequest, ProgressSink, ResourceFetcher, USER_AGENT};

/// Fetcher implementation for HTTP(S) sources, backed by [`reqwest`].
///
/// The cookie-handling and insecure-transport flags select between
/// preconfigured clients. Priority and background-continuation are scheduling
/// hints with no HTTP meaning and are ignored here.
#[derive(Debug)]
pub struct HttpFetcher {
    // |    client     | handles cookies | accepts invalid SSL certs |
    // | ------------- | --------------- | ------------------------- |
    // |    plain      |       no        |            no             |
    // |    cookies    |       yes       |            no             |
    // |    no_ssl     |       no        |            yes            |
    // | no_ssl_cookies|       yes       |            yes            |
    plain: Client,
    cookies: Client,
    no_ssl: Client,
    no_ssl_cookies: Client,
    timeouts: FetchTimeouts,
}

impl HttpFetcher {
    pub fn new(timeouts: FetchTimeouts) -> Self {
        Self {
            plain: create_client(&timeouts, false, false),
            cookies: create_client(&timeouts, true, false),
            no_ssl: create_client(&timeouts, false, true),
            no_ssl_cookies: create_client(&timeouts, true, true),
            timeouts,
        }
    }

    fn client_for(&self, request: &FetchRequest) -> &Client {
        match (request.handle_cookies, request.allow_insecure) {
            (false, false) => &self.plain,
            (true, false) => &self.cookies,
            (false, true) => &self.no_ssl,
            (true, true) => &self.no_ssl_cookies,
        }
    }
}

fn map_transport_error(error: reqwest::Error, timeout: std::time::Duration) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        error.into()
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
    ) -> Result<Bytes, FetchError> {
        let url = Url::parse(request.resource.as_str())
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let client = self.client_for(&request);

        tracing::debug!("Fetching resource from `{}`", url);

        // Establishing the transfer is retried; the body stream is not, so
        // reported progress stays monotonic.
        let response = retry(|| async {
            let builder = client
                .get(url.clone())
                .header(header::USER_AGENT, USER_AGENT);

            let send = tokio::time::timeout(self.timeouts.head, builder.send())
                .await
                .map_err(|_| FetchError::Timeout(self.timeouts.head))?;
            let response = send.map_err(|e| map_transport_error(e, self.timeouts.connect))?;

            check_status(response)
        })
        .await?;

        let total = response.content_length();
        let mut body = BytesMut::new();
        let mut stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| map_transport_error(e, self.timeouts.max_fetch)));

        while let Some(chunk) = stream.next().await.transpose()? {
            body.extend_from_slice(&chunk);
            progress.report(crate::types::ProgressUpdate {
                received: body.len() as u64,
                total,
                chunk,
            });
        }

        tracing::debug!("Resource `{}` fetched successfully", url);

        Ok(body.freeze())
    }
}

fn check_status(response: Response) -> Result<Response, FetchError> {
    match response.status() {
        StatusCode::NOT_FOUND => Err(FetchError::NotFound),
        status @ (StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) => {
            Err(FetchError::PermissionDenied(status.to_string()))
        }
        status if !status.is_success() => {
            Err(FetchError::Network(format!("request failed with {status}")))
        }
        _ => Ok(response),
    }
}

fn create_client(
    timeouts: &FetchTimeouts,
    handle_cookies: bool,
    accept_invalid_certs: bool,
) -> Client {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_fetch)
        .pool_idle_timeout(std::time::Duration::from_secs(30))
        .cookie_store(handle_cookies)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .unwrap()
}
