use async_trait::async_trait;

/// CloudWatch namespace all queue metrics are published under.
pub const METRIC_NAMESPACE: &str = "DeepStyleQueue";

/// Somewhere queue metrics can be published to.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Publish one metric value, timestamped now.
    async fn publish(&self, name: &str, value: f64) -> anyhow::Result<()>;
}

/// Publishes metrics to AWS CloudWatch, the feed the autoscaler's
/// alarms are built on.
pub struct CloudWatchSink {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudWatchSink {
    /// Build a sink for the given region. Credentials come from the
    /// usual AWS environment (env vars, profile, instance role).
    pub async fn new(region: String) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .load()
            .await;
        Self {
            client: aws_sdk_cloudwatch::Client::new(&config),
        }
    }
}

#[async_trait]
impl MetricSink for CloudWatchSink {
    async fn publish(&self, name: &str, value: f64) -> anyhow::Result<()> {
        let datum = aws_sdk_cloudwatch::types::MetricDatum::builder()
            .metric_name(name)
            .value(value)
            .timestamp(aws_sdk_cloudwatch::primitives::DateTime::from(
                std::time::SystemTime::now(),
            ))
            .build();
        self.client
            .put_metric_data()
            .namespace(METRIC_NAMESPACE)
            .metric_data(datum)
            .send()
            .await
            .map_err(|err| anyhow::anyhow!("cloudwatch put_metric_data: {err}"))?;
        Ok(())
    }
}

/// Records published metrics in memory, for tests.
#[cfg(test)]
pub(crate) struct RecordingSink {
    published: tokio::sync::Mutex<Vec<(String, f64)>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self {
            published: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn published(&self) -> Vec<(String, f64)> {
        self.published.lock().await.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl MetricSink for RecordingSink {
    async fn publish(&self, name: &str, value: f64) -> anyhow::Result<()> {
        self.published.lock().await.push((name.to_string(), value));
        Ok(())
    }
}
