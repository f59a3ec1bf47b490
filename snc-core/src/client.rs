use std::time::Duration;

use reqwest::{Client, StatusCode, redirect};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::record::{Record, RecordList};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SncError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}{}: {body}", hint_suffix(.hint))]
    Api {
        status: StatusCode,
        hint: Option<&'static str>,
        body: String,
    },
    #[error("server reported an error: {0}")]
    Remote(String),
    #[error("response is missing the \"records\" key; check the server logs")]
    MissingRecords,
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub accept_invalid_certs: bool,
    pub timeout: Duration,
}

impl ClientOptions {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            user: user.into(),
            password: password.into(),
            accept_invalid_certs: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Talks to the `<table>.do?JSONv2` record endpoints of one instance.
#[derive(Clone)]
pub struct RecordClient {
    http: Client,
    base_url: Url,
    user: String,
    password: String,
}

#[derive(Clone, Copy)]
enum Action<'a> {
    GetRecords { query: &'a str, rows: u32 },
    Get { sys_id: &'a str },
    Update { query: &'a str },
}

impl Action<'_> {
    fn name(&self) -> &'static str {
        match self {
            Action::GetRecords { .. } => "getRecords",
            Action::Get { .. } => "get",
            Action::Update { .. } => "update",
        }
    }
}

impl RecordClient {
    pub fn new(options: ClientOptions) -> Result<Self, SncError> {
        if options.accept_invalid_certs {
            warn!(base_url = %options.base_url, "using an insecure TLS connection");
        }
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(&options.base_url)?,
            user: options.user,
            password: options.password,
        })
    }

    pub fn with_base_url(
        base_url: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, SncError> {
        Self::new(ClientOptions::new(base_url, user, password))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetches at most one record matching an encoded query such as `name=JSUtil`.
    pub async fn get_records(&self, table: &str, query: &str) -> Result<RecordList, SncError> {
        self.get_records_with_limit(table, query, 1).await
    }

    pub async fn get_records_with_limit(
        &self,
        table: &str,
        query: &str,
        rows: u32,
    ) -> Result<RecordList, SncError> {
        self.send(table, Action::GetRecords { query, rows }, None)
            .await
    }

    pub async fn get_record(&self, table: &str, sys_id: &str) -> Result<RecordList, SncError> {
        self.send(table, Action::Get { sys_id }, None).await
    }

    /// Updates every record matched by `query` with the fields in `body`.
    pub async fn update_records(
        &self,
        table: &str,
        query: &str,
        body: &serde_json::Map<String, Value>,
    ) -> Result<RecordList, SncError> {
        self.send(table, Action::Update { query }, Some(body)).await
    }

    /// Convenience wrapper for the single-field update the sync engine performs.
    pub async fn update_field(
        &self,
        table: &str,
        query: &str,
        field: &str,
        content: &str,
    ) -> Result<RecordList, SncError> {
        let mut body = serde_json::Map::new();
        body.insert(field.to_string(), Value::String(content.to_string()));
        self.update_records(table, query, &body).await
    }

    fn endpoint(&self, table: &str, action: Action<'_>) -> Result<Url, SncError> {
        let mut url = self.base_url.join(&format!("/{table}.do"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("JSONv2", "");
            let rows = match action {
                Action::GetRecords { rows, .. } => rows.max(1),
                _ => 1,
            };
            query.append_pair("sysparm_record_count", &rows.to_string());
            query.append_pair("sysparm_action", action.name());
            match action {
                Action::GetRecords { query: q, .. } | Action::Update { query: q } => {
                    query.append_pair("sysparm_query", q);
                }
                Action::Get { sys_id } => {
                    query.append_pair("sysparm_sys_id", sys_id);
                }
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        table: &str,
        action: Action<'_>,
        body: Option<&serde_json::Map<String, Value>>,
    ) -> Result<RecordList, SncError> {
        let url = self.endpoint(table, action)?;
        let method = if body.is_some() { "POST" } else { "GET" };
        debug!(method, %url, ?body, "record service request");
        let request = match body {
            Some(body) => self.http.post(url).json(body),
            None => self.http.get(url),
        };
        let response = request
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response(response: reqwest::Response) -> Result<RecordList, SncError> {
        let status = response.status();
        let body = response.text().await?;
        debug!(%status, %body, "record service response");
        if !status.is_success() {
            return Err(SncError::Api {
                status,
                hint: status_hint(status),
                body,
            });
        }

        let payload: RecordResponse = serde_json::from_str(&body)?;
        if let Some(error) = payload.error {
            let message = match error {
                Value::String(message) => message,
                other => other.to_string(),
            };
            return Err(SncError::Remote(message));
        }
        payload
            .records
            .map(|records| RecordList { records })
            .ok_or(SncError::MissingRecords)
    }
}

impl SncError {
    /// Transport failures, malformed responses and overloaded servers; worth retrying
    /// on a later event. Everything else will be refused the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            SncError::Request(_) | SncError::MissingRecords | SncError::Decode(_) => true,
            SncError::Api { status, .. } => {
                status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
                    )
            }
            SncError::Url(_) | SncError::Remote(_) => false,
        }
    }
}

fn status_hint(status: StatusCode) -> Option<&'static str> {
    match status {
        StatusCode::UNAUTHORIZED => Some("check credentials"),
        StatusCode::FOUND => Some("verify the JSON web service plugin is activated"),
        _ => None,
    }
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    hint.map(|hint| format!(" ({hint})")).unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    #[serde(default)]
    records: Option<Vec<Record>>,
    #[serde(default)]
    error: Option<Value>,
}
