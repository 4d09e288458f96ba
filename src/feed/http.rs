use crate::feed::FeedSource;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// What an HTTP poll saw, handed to the success predicate and transform
#[derive(Clone, Debug)]
pub struct HttpPollResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

type UriFn = Box<dyn Fn() -> Option<String> + Send + Sync>;
type CheckFn = Box<dyn Fn(&HttpPollResponse) -> bool + Send + Sync>;
type TransformFn = Box<dyn Fn(&HttpPollResponse) -> Value + Send + Sync>;

/// Polls an HTTP endpoint with GET.
///
/// The target URI is re-evaluated on every poll, so it can follow a sensor
/// that changes between polls. A missing URI, a transport error or a
/// response rejected by the success predicate all yield the failure value.
pub struct HttpPollSource {
    client: reqwest::Client,
    uri: UriFn,
    check_success: CheckFn,
    on_success: TransformFn,
    on_failure: Value,
    timeout: Duration,
}

impl HttpPollSource {
    /// Defaults: 2xx is success, the body text is published, failures publish null.
    pub fn new<F>(uri: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self {
            client: reqwest::Client::new(),
            uri: Box::new(uri),
            check_success: Box::new(|r| (200..300).contains(&r.status)),
            on_success: Box::new(|r| Value::String(r.body.clone())),
            on_failure: Value::Null,
            timeout: Duration::from_secs(5),
        }
    }

    /// Boolean "is anything answering" probe: any HTTP response is `true`,
    /// any transport failure is `false`.
    pub fn answering<F>(uri: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self::new(uri)
            .check_success(|_| true)
            .on_success(|_| Value::Bool(true))
            .on_failure(Value::Bool(false))
    }

    pub fn check_success<F>(mut self, check: F) -> Self
    where
        F: Fn(&HttpPollResponse) -> bool + Send + Sync + 'static,
    {
        self.check_success = Box::new(check);
        self
    }

    pub fn on_success<F>(mut self, transform: F) -> Self
    where
        F: Fn(&HttpPollResponse) -> Value + Send + Sync + 'static,
    {
        self.on_success = Box::new(transform);
        self
    }

    pub fn on_failure(mut self, value: Value) -> Self {
        self.on_failure = value;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch(&self, uri: &str) -> Result<HttpPollResponse, reqwest::Error> {
        let response = self.client.get(uri).timeout(self.timeout).send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(HttpPollResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl FeedSource for HttpPollSource {
    async fn poll(&self) -> Value {
        let Some(uri) = (self.uri)() else {
            debug!("No URI to poll yet");
            return self.on_failure.clone();
        };

        match self.fetch(&uri).await {
            Ok(response) if (self.check_success)(&response) => (self.on_success)(&response),
            Ok(response) => {
                debug!(uri = %uri, status = response.status, "Poll response rejected");
                self.on_failure.clone()
            }
            Err(e) => {
                debug!(uri = %uri, error = %e, "Poll failed");
                self.on_failure.clone()
            }
        }
    }

    fn fallback(&self) -> Value {
        self.on_failure.clone()
    }
}
