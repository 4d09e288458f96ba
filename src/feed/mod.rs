//! Scheduled pollers that publish their results as sensor values.
//!
//! A feed is owned by one entity and keyed by a tag. Each tick polls a
//! [`FeedSource`] and writes the outcome to the entity's sensor. A poll that
//! fails or times out publishes the source's fallback value so that missing
//! data is visible to subscribers.

mod http;
mod runner;

pub use http::{HttpPollResponse, HttpPollSource};
pub use runner::FeedRunner;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

/// Something a feed can poll
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Poll once. Implementations map their own failures to [`FeedSource::fallback`].
    async fn poll(&self) -> Value;

    /// Value published when a poll fails or exceeds the runner's timeout
    fn fallback(&self) -> Value;
}

type PollFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// In-process feed source backed by an async closure
pub struct FnPollSource {
    poll: PollFn,
    fallback: Value,
}

impl FnPollSource {
    pub fn new<F>(fallback: Value, poll: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        Self {
            poll: Box::new(poll),
            fallback,
        }
    }
}

#[async_trait]
impl FeedSource for FnPollSource {
    async fn poll(&self) -> Value {
        match (self.poll)().await {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Poll failed, publishing fallback");
                self.fallback.clone()
            }
        }
    }

    fn fallback(&self) -> Value {
        self.fallback.clone()
    }
}
