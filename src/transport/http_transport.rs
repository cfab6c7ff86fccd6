use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::{classify_upstream_error, GatewayError};

use super::retry_policy::{
    should_retry_transport_error, CONNECT_RETRY_BACKOFF, CONNECT_RETRY_MAX_ATTEMPTS,
};

static RUSTLS_PROVIDER_INIT: Once = Once::new();

/// Raw upstream response body of a streaming request.
pub type UpstreamBody = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

/// Path appended to the configured base URL.
const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

fn build_reqwest_client(
    server: &ServerConfig,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, GatewayError> {
    let pool_idle_timeout = if server.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(server.http_pool_idle_timeout_secs))
    };

    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(server.http_pool_max_idle_per_host.max(1))
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(server.connect_timeout))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = proxy_url.filter(|url| !url.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| GatewayError::Internal(format!("Invalid proxy URL: {err}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|err| GatewayError::Internal(format!("Failed to build HTTP client: {err}")))
}

/// Build `{base_url}/chat/completions`, tolerating a trailing slash.
///
/// # Errors
///
/// Returns [`GatewayError::Internal`] when the result is not a valid URL.
pub fn chat_completions_url(base_url: &str) -> Result<url::Url, GatewayError> {
    let joined = format!("{}/{CHAT_COMPLETIONS_PATH}", base_url.trim_end_matches('/'));
    url::Url::parse(&joined)
        .map_err(|e| GatewayError::Internal(format!("Invalid upstream URL: {e}")))
}

/// HTTP client for the single configured OpenAI-compatible upstream.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    chat_url: url::Url,
    headers: HeaderMap,
    inactivity_timeout: Duration,
}

impl HttpTransport {
    /// Create a pooled transport for `upstream`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] when the URL, credential header, or
    /// proxy settings cannot be used.
    pub fn new(server: &ServerConfig, upstream: &UpstreamConfig) -> Result<Self, GatewayError> {
        RUSTLS_PROVIDER_INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });

        let client = build_reqwest_client(server, upstream.proxy.as_deref())?;
        let chat_url = chat_completions_url(&upstream.base_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", upstream.api_key))
            .map_err(|_| GatewayError::Internal("API key is not a valid header value".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        Ok(Self {
            client,
            chat_url,
            headers,
            inactivity_timeout: Duration::from_secs(server.timeout),
        })
    }

    #[must_use]
    pub fn chat_url(&self) -> &url::Url {
        &self.chat_url
    }

    /// Send a non-streaming chat request and read the whole reply body.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamUnreachable`] on transport failure or
    /// inactivity, and the classified upstream error on a non-2xx status.
    pub async fn send_unary(&self, body: Bytes) -> Result<Bytes, GatewayError> {
        let response = self.execute(body, false).await?;
        self.read_body(response).await
    }

    /// Send a streaming chat request. The returned body stream yields bytes as
    /// they arrive and fails if the upstream stays silent longer than the
    /// configured timeout.
    ///
    /// # Errors
    ///
    /// Same as [`HttpTransport::send_unary`], for failures before the first byte.
    pub async fn send_stream(&self, body: Bytes) -> Result<UpstreamBody, GatewayError> {
        let response = self.execute(body, true).await?;
        Ok(Box::pin(inactivity_limited(
            response.bytes_stream(),
            self.inactivity_timeout,
        )))
    }

    async fn execute(
        &self,
        body: Bytes,
        streaming: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut attempt = 0;
        let response = loop {
            let mut request = reqwest::Request::new(http::Method::POST, self.chat_url.clone());
            *request.headers_mut() = self.headers.clone();
            if streaming {
                request
                    .headers_mut()
                    .insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            }
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));

            let sent =
                tokio::time::timeout(self.inactivity_timeout, self.client.execute(request)).await;
            match sent {
                Ok(Ok(response)) => break response,
                Ok(Err(err)) => {
                    if attempt >= CONNECT_RETRY_MAX_ATTEMPTS
                        || !should_retry_transport_error(&err)
                    {
                        return Err(GatewayError::UpstreamUnreachable(err.to_string()));
                    }
                    tracing::debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = CONNECT_RETRY_BACKOFF.as_millis(),
                        error = %err,
                        "retrying upstream request after connect failure"
                    );
                    tokio::time::sleep(CONNECT_RETRY_BACKOFF).await;
                    attempt += 1;
                }
                Err(_) => return Err(self.inactivity_error()),
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = self.read_body(response).await.unwrap_or_default();
        Err(classify_upstream_error(status.as_u16(), &body))
    }

    async fn read_body(&self, response: reqwest::Response) -> Result<Bytes, GatewayError> {
        match tokio::time::timeout(self.inactivity_timeout, response.bytes()).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(GatewayError::UpstreamUnreachable(format!(
                "failed to read upstream body: {err}"
            ))),
            Err(_) => Err(self.inactivity_error()),
        }
    }

    fn inactivity_error(&self) -> GatewayError {
        inactivity_error(self.inactivity_timeout)
    }
}

fn inactivity_error(timeout: Duration) -> GatewayError {
    GatewayError::UpstreamUnreachable(format!(
        "upstream inactive for more than {}s",
        timeout.as_secs()
    ))
}

/// Wrap a body stream so that each read must complete within `timeout`.
/// The stream ends after the first error.
pub(crate) fn inactivity_limited<S>(
    body: S,
    timeout: Duration,
) -> impl Stream<Item = Result<Bytes, GatewayError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    futures_util::stream::unfold(Some(Box::pin(body)), move |state| async move {
        let mut body = state?;
        match tokio::time::timeout(timeout, body.next()).await {
            Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(body))),
            Ok(Some(Err(err))) => Some((
                Err(GatewayError::UpstreamUnreachable(format!(
                    "upstream stream interrupted: {err}"
                ))),
                None,
            )),
            Ok(None) => None,
            Err(_) => Some((Err(inactivity_error(timeout)), None)),
        }
    })
}
