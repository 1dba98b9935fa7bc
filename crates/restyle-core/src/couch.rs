use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// How much longer than the longest expected long-poll the HTTP client
/// waits before giving up on a request.
const HTTP_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// Longest change-feed long-poll the client will ask the store to hold.
pub const MAX_CHANGES_POLL: Duration = Duration::from_secs(60);

/// Errors surfaced by [`DocumentStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The store rejected a write because the supplied revision is stale.
    #[error("document update conflict")]
    Conflict,
    /// An optimistic update gave up after too many conflicting writers.
    #[error("conflict retries exhausted after {attempts} attempts")]
    ConflictExhausted {
        /// Number of write attempts made before giving up.
        attempts: u32,
    },
    /// The document, attachment, or view does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The store answered with a status the client has no mapping for.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, as far as it could be read.
        body: String,
    },
    /// HTTP or socket failure talking to the store.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The store answered 2xx but the payload did not parse.
    #[error("malformed response: {0}")]
    Protocol(#[from] serde_json::Error),
    /// A request URL could not be built from the configured base.
    #[error("invalid url: {0}")]
    BadUrl(String),
}

/// One batch of the `_changes` feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangesBatch {
    /// Change records, in feed order.
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    /// Cursor to resume from once this batch is handled.
    #[serde(deserialize_with = "sequence")]
    pub last_seq: String,
}

/// A single record of the `_changes` feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRow {
    /// Document id the revision belongs to.
    pub id: String,
    /// Whether the revision is a deletion.
    #[serde(default)]
    pub deleted: bool,
}

/// A view query result before per-row decoding.
///
/// Rows are kept as raw JSON so a single malformed row can be skipped
/// instead of failing the whole query.
#[derive(Debug, Clone, Deserialize)]
pub struct RawViewResult {
    /// Total number of rows the view holds.
    #[serde(default)]
    pub total_rows: u64,
    /// Undecoded row objects.
    #[serde(default)]
    pub rows: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    rev: String,
}

/// The document-store operations the worker relies on.
///
/// Implemented by [`SyncGateway`] for production and by the in-memory
/// store in `memory` for tests.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document as raw JSON, `_id` and `_rev` included.
    async fn get_raw(&self, id: &str) -> Result<Value, DbError>;

    /// Write a document; the body must carry the current `_rev`.
    ///
    /// Returns the new revision, or [`DbError::Conflict`] when the
    /// revision in the body is stale.
    async fn put_raw(&self, id: &str, body: &Value) -> Result<String, DbError>;

    /// Download an attachment's bytes.
    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, DbError>;

    /// Upload an attachment against a specific revision; returns the new
    /// revision.
    async fn put_attachment(
        &self,
        id: &str,
        rev: &str,
        name: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<String, DbError>;

    /// Query a view with `stale=false`.
    async fn query_view(&self, design: &str, view: &str) -> Result<RawViewResult, DbError>;

    /// Install (or overwrite) a design document.
    async fn put_design(&self, design: &str, body: &Value) -> Result<(), DbError>;

    /// Long-poll the changes feed. Blocks until the store produces a
    /// batch or the given timeout elapses; a timeout yields an empty
    /// batch, not an error.
    async fn changes(
        &self,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<ChangesBatch, DbError>;

    /// The store's current tail sequence.
    async fn last_seq(&self) -> Result<String, DbError>;
}

/// HTTP client for one Sync Gateway database.
pub struct SyncGateway {
    http: reqwest::Client,
    base: Url,
}

impl SyncGateway {
    /// Build a client for the database at `base` (e.g.
    /// `http://localhost:4984/restyle`).
    pub fn new(mut base: Url) -> Result<Self, DbError> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(MAX_CHANGES_POLL + HTTP_TIMEOUT_MARGIN)
            .build()?;
        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> Result<Url, DbError> {
        self.base
            .join(path)
            .map_err(|err| DbError::BadUrl(format!("{}{path}: {err}", self.base)))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        res: reqwest::Response,
    ) -> Result<T, DbError> {
        let text = res.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn unexpected(res: reqwest::Response) -> DbError {
        DbError::UnexpectedStatus {
            status: res.status().as_u16(),
            body: res.text().await.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl DocumentStore for SyncGateway {
    async fn get_raw(&self, id: &str) -> Result<Value, DbError> {
        let res = self.http.get(self.url(id)?).send().await?;
        match res.status() {
            s if s.is_success() => Self::decode(res).await,
            StatusCode::NOT_FOUND => Err(DbError::NotFound(id.to_string())),
            _ => Err(Self::unexpected(res).await),
        }
    }

    async fn put_raw(&self, id: &str, body: &Value) -> Result<String, DbError> {
        let res = self.http.put(self.url(id)?).json(body).send().await?;
        match res.status() {
            s if s.is_success() => {
                let ok: PutResponse = Self::decode(res).await?;
                Ok(ok.rev)
            }
            StatusCode::CONFLICT => Err(DbError::Conflict),
            StatusCode::NOT_FOUND => Err(DbError::NotFound(id.to_string())),
            _ => Err(Self::unexpected(res).await),
        }
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>, DbError> {
        let res = self
            .http
            .get(self.url(&format!("{id}/{name}"))?)
            .send()
            .await?;
        match res.status() {
            s if s.is_success() => Ok(res.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(DbError::NotFound(format!("{id}/{name}"))),
            _ => Err(Self::unexpected(res).await),
        }
    }

    async fn put_attachment(
        &self,
        id: &str,
        rev: &str,
        name: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<String, DbError> {
        let mut url = self.url(&format!("{id}/{name}"))?;
        url.query_pairs_mut().append_pair("rev", rev);
        let res = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        match res.status() {
            s if s.is_success() => {
                let ok: PutResponse = Self::decode(res).await?;
                Ok(ok.rev)
            }
            StatusCode::CONFLICT => Err(DbError::Conflict),
            StatusCode::NOT_FOUND => Err(DbError::NotFound(format!("{id}/{name}"))),
            _ => Err(Self::unexpected(res).await),
        }
    }

    async fn query_view(&self, design: &str, view: &str) -> Result<RawViewResult, DbError> {
        let mut url = self.url(&format!("_design/{design}/_view/{view}"))?;
        url.query_pairs_mut().append_pair("stale", "false");
        let res = self.http.get(url).send().await?;
        match res.status() {
            s if s.is_success() => Self::decode(res).await,
            StatusCode::NOT_FOUND => {
                Err(DbError::NotFound(format!("_design/{design}/_view/{view}")))
            }
            _ => Err(Self::unexpected(res).await),
        }
    }

    async fn put_design(&self, design: &str, body: &Value) -> Result<(), DbError> {
        let res = self
            .http
            .put(self.url(&format!("_design/{design}"))?)
            .json(body)
            .send()
            .await?;
        match res.status() {
            // Overwriting an existing design doc can conflict; the named
            // doc already holds the same definition, so that is a success.
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Ok(()),
            _ => Err(Self::unexpected(res).await),
        }
    }

    async fn changes(
        &self,
        since: Option<&str>,
        timeout: Duration,
    ) -> Result<ChangesBatch, DbError> {
        let timeout = timeout.min(MAX_CHANGES_POLL);
        let mut url = self.url("_changes")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("feed", "longpoll");
            query.append_pair("timeout", &timeout.as_millis().to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }
        let res = self.http.get(url).send().await?;
        match res.status() {
            s if s.is_success() => Self::decode(res).await,
            _ => Err(Self::unexpected(res).await),
        }
    }

    async fn last_seq(&self) -> Result<String, DbError> {
        let res = self.http.get(self.base.clone()).send().await?;
        if !res.status().is_success() {
            return Err(Self::unexpected(res).await);
        }
        let info: Value = Self::decode(res).await?;
        sequence_from_value(info.get("update_seq").unwrap_or(&Value::Null)).ok_or_else(|| {
            DbError::UnexpectedStatus {
                status: 200,
                body: "database info has no usable update_seq".to_string(),
            }
        })
    }
}

/// Normalize a feed sequence, which the store emits as either a JSON
/// string or a number, to its string form.
pub fn sequence_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn sequence<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    sequence_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom("sequence must be a string or a number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_accepts_strings_and_numbers() {
        assert_eq!(sequence_from_value(&json!("7")), Some("7".to_string()));
        assert_eq!(sequence_from_value(&json!(42)), Some("42".to_string()));
        assert_eq!(sequence_from_value(&json!(["nope"])), None);
        assert_eq!(sequence_from_value(&Value::Null), None);
    }

    #[test]
    fn changes_batch_decodes_numeric_last_seq() {
        let raw = r#"{"results":[{"id":"j1","changes":[{"rev":"2-a"}]},{"id":"j2","deleted":true}],"last_seq":7}"#;
        let batch: ChangesBatch = serde_json::from_str(raw).expect("decode");
        assert_eq!(batch.last_seq, "7");
        assert_eq!(batch.results.len(), 2);
        assert!(!batch.results[0].deleted);
        assert!(batch.results[1].deleted);
    }

    #[test]
    fn empty_longpoll_timeout_batch_decodes() {
        let raw = r#"{"results":[],"last_seq":"3"}"#;
        let batch: ChangesBatch = serde_json::from_str(raw).expect("decode");
        assert!(batch.results.is_empty());
        assert_eq!(batch.last_seq, "3");
    }

    #[test]
    fn base_url_gets_a_trailing_slash() {
        let gw = SyncGateway::new("http://localhost:4984/restyle".parse().expect("url"))
            .expect("client");
        assert_eq!(gw.base.as_str(), "http://localhost:4984/restyle/");
        let doc = gw.url("j1").expect("join");
        assert_eq!(doc.as_str(), "http://localhost:4984/restyle/j1");
        let view = gw.url("_design/unprocessed_jobs").expect("join");
        assert_eq!(
            view.as_str(),
            "http://localhost:4984/restyle/_design/unprocessed_jobs"
        );
    }
}
