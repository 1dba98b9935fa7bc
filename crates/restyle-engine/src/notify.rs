use std::time::Duration;

use reqwest::Url;

use restyle_core::{JobDocument, JobState};

const SERVICE_NAME: &str = "restyle";
const PUSH_SERVICE_TYPE: &str = "apns";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the uniqush push gateway.
///
/// Delivery is fire-and-forget: failures are logged and never surface
/// to the follower.
pub struct UniqushClient {
    http: reqwest::Client,
    base: Url,
}

impl UniqushClient {
    /// Build a client for the gateway at `base`.
    pub fn new(mut base: Url) -> Result<Self, reqwest::Error> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { http, base })
    }

    /// The push copy for a job in the given state; `None` while the
    /// job is still in flight.
    pub fn message_for(state: JobState) -> Option<&'static str> {
        match state {
            JobState::ProcessingSuccessful => Some("Your restyled work of art is ready!"),
            JobState::ProcessingFailed => {
                Some("Oops, something went wrong restyling your work of art!")
            }
            _ => None,
        }
    }

    /// Notify the job's owner if the job has finished. Errors are
    /// logged, not returned.
    pub async fn notify_job_done(&self, job: &JobDocument) {
        let Some(message) = Self::message_for(job.state) else {
            return;
        };
        if job.owner.is_empty() || job.owner_device_token.is_empty() {
            tracing::debug!(job = %job.id, "job has no notification address, skipping push");
            return;
        }

        match self.push(&job.owner, &job.owner_device_token, message).await {
            Ok(()) => {
                tracing::info!(job = %job.id, owner = %job.owner, "sent push notification")
            }
            Err(err) => {
                tracing::warn!(job = %job.id, error = format!("{err:#}"), "push notification failed")
            }
        }
    }

    async fn push(&self, owner: &str, device_token: &str, message: &str) -> anyhow::Result<()> {
        // Subscribing is idempotent on the gateway side, so it is done
        // before every push rather than tracked locally.
        self.call(
            "subscribe",
            &[
                ("service", SERVICE_NAME),
                ("subscriber", owner),
                ("pushservicetype", PUSH_SERVICE_TYPE),
                ("devtoken", device_token),
            ],
        )
        .await?;
        self.call(
            "push",
            &[
                ("service", SERVICE_NAME),
                ("subscriber", owner),
                ("msg", message),
            ],
        )
        .await?;
        Ok(())
    }

    async fn call(&self, endpoint: &str, form: &[(&str, &str)]) -> anyhow::Result<()> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|err| anyhow::anyhow!("building uniqush url for {endpoint}: {err}"))?;
        let res = self.http.post(url).form(form).send().await?;
        if !res.status().is_success() {
            anyhow::bail!(
                "uniqush {endpoint} returned {}: {}",
                res.status(),
                res.text().await.unwrap_or_default()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminal_states_produce_a_message() {
        assert!(UniqushClient::message_for(JobState::ProcessingSuccessful).is_some());
        assert!(UniqushClient::message_for(JobState::ProcessingFailed).is_some());
        assert!(UniqushClient::message_for(JobState::NotReadyToProcess).is_none());
        assert!(UniqushClient::message_for(JobState::ReadyToProcess).is_none());
        assert!(UniqushClient::message_for(JobState::BeingProcessed).is_none());
    }

    #[test]
    fn success_and_failure_use_distinct_copy() {
        let success = UniqushClient::message_for(JobState::ProcessingSuccessful).expect("copy");
        let failure = UniqushClient::message_for(JobState::ProcessingFailed).expect("copy");
        assert_ne!(success, failure);
    }
}
