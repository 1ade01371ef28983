use std::time::Duration;

use anyhow::Context;
use dbvisor_instance::{PortAssignments, PortRole};
use futures_util::future::BoxFuture;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers whether both engines of an instance respond to a trivial request.
pub trait HealthProbe: Send + Sync {
    fn is_healthy<'a>(&'a self, ports: &'a PortAssignments) -> BoxFuture<'a, bool>;
}

/// HTTP probe: a `CALL dbms.components()` transaction against the graph
/// engine and a `SHOW DATABASES` query against the time-series engine.
pub struct HttpHealthProbe {
    host: String,
    client: reqwest::Client,
}

const GRAPH_HEALTH_STATEMENT: &str = "CALL dbms.components()";

struct HealthUrls {
    graph_commit: String,
    timeseries_query: String,
}

impl HttpHealthProbe {
    pub fn new(host: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("build health probe client")?;
        Ok(Self {
            host: host.into(),
            client,
        })
    }

    fn urls(&self, ports: &PortAssignments) -> Option<HealthUrls> {
        let graph = ports.get(PortRole::GraphHttp)?;
        let ts = ports.get(PortRole::TimeseriesHttp)?;
        Some(HealthUrls {
            graph_commit: format!("http://{}:{graph}/db/data/transaction/commit", self.host),
            timeseries_query: format!("http://{}:{ts}/query?q=SHOW%20DATABASES", self.host),
        })
    }

    async fn graph_answers(&self, url: &str) -> bool {
        let body = serde_json::json!({
            "statements": [{ "statement": GRAPH_HEALTH_STATEMENT }]
        });
        let resp = match self.client.post(url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(url, error = %e, "graph health query: request failed");
                return false;
            }
        };
        if !resp.status().is_success() {
            tracing::debug!(url, status = %resp.status(), "graph health query: unexpected status");
            return false;
        }
        match resp.json::<serde_json::Value>().await {
            Ok(reply) => transaction_succeeded(&reply),
            Err(e) => {
                tracing::debug!(url, error = %e, "graph health query: unreadable reply");
                false
            }
        }
    }

    async fn timeseries_answers(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if !ok {
                    tracing::debug!(url, status = %resp.status(), "timeseries health query: unexpected status");
                }
                ok
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "timeseries health query: request failed");
                false
            }
        }
    }
}

/// A transactional reply counts only when it carries results and no errors.
fn transaction_succeeded(reply: &serde_json::Value) -> bool {
    let errors_empty = reply
        .get("errors")
        .and_then(|e| e.as_array())
        .is_some_and(|e| e.is_empty());
    let has_results = reply
        .get("results")
        .and_then(|r| r.as_array())
        .is_some_and(|r| !r.is_empty());
    if !errors_empty {
        tracing::debug!(errors = %reply.get("errors").unwrap_or(&serde_json::Value::Null), "graph health query returned errors");
    }
    errors_empty && has_results
}

impl HealthProbe for HttpHealthProbe {
    fn is_healthy<'a>(&'a self, ports: &'a PortAssignments) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Some(urls) = self.urls(ports) else {
                return false;
            };
            let (g, t) = tokio::join!(
                self.graph_answers(&urls.graph_commit),
                self.timeseries_answers(&urls.timeseries_query)
            );
            g && t
        })
    }
}
