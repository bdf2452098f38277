use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{AsyncBufReadExt, Stream, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;

pub type LogLineStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// External upstream log source: a follow-style, newline-terminated byte
/// stream that may close at any time with an error. The log stream's
/// leader reconnects on every error; this trait only has to produce one
/// attempt.
#[async_trait]
pub trait UpstreamLogSource: Send + Sync {
    async fn follow(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        since_time: Option<DateTime<Utc>>,
        tail_lines: Option<i64>,
    ) -> anyhow::Result<LogLineStream>;
}

/// [`UpstreamLogSource`] backed by `kube::Api::log_stream`. Grounded on
/// `kubescope-logs::stream::LogStreamManager::spawn_pod_stream`'s use of the
/// same API with `follow: true, timestamps: true`.
pub struct KubeLogSource {
    client: kube::Client,
}

impl KubeLogSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpstreamLogSource for KubeLogSource {
    async fn follow(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        since_time: Option<DateTime<Utc>>,
        tail_lines: Option<i64>,
    ) -> anyhow::Result<LogLineStream> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let since_seconds = since_time.map(|t| (Utc::now() - t).num_seconds().max(0));
        let params = LogParams {
            follow: true,
            container: container.map(|c| c.to_string()),
            timestamps: true,
            tail_lines: if since_seconds.is_some() { None } else { tail_lines },
            since_seconds,
            ..Default::default()
        };

        let raw = api.log_stream(pod, &params).await?;
        let lines = raw.lines().map_err(anyhow::Error::from);
        Ok(Box::pin(lines))
    }
}
