use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use weft_common::auth::API_KEY_HEADER;
use weft_common::{ExecuteEnvelope, HttpMethod, Result, SessionId, WeftError};

const DEFAULT_ADMIN_PREFIX: &str = "/_api";

/// One entry of the server's route table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteSummary {
    pub method: HttpMethod,
    pub pattern: String,
    pub kind: String,
}

/// Client for the administrative API of a Weft server.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct WeftClient {
    base_url: String,
    admin_prefix: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl WeftClient {
    /// Creates a client for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// `WeftError::InvalidRequest` unless the URL starts with `http://` or
    /// `https://`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(WeftError::InvalidRequest(format!(
                "'{}' must start with http:// or https://",
                base_url
            )));
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_prefix: DEFAULT_ADMIN_PREFIX.to_string(),
            api_key: None,
            http: reqwest::Client::new(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_admin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.admin_prefix = prefix.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.admin_prefix, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.endpoint(path));
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    /// Runs a script and waits for its envelope.
    ///
    /// Script errors and server-side timeouts come back as an envelope with
    /// `success: false`, not as `Err`.
    pub async fn execute(&self, source: impl Into<String>) -> Result<ExecuteEnvelope> {
        let response = send(
            self.request(reqwest::Method::POST, "/execute")
                .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(source.into()),
        )
        .await?;

        match response.status() {
            StatusCode::OK | StatusCode::INTERNAL_SERVER_ERROR | StatusCode::REQUEST_TIMEOUT => {
                read_json(response).await
            }
            _ => Err(error_from(response).await),
        }
    }

    /// Submits a script without waiting; returns the session to poll.
    pub async fn execute_detached(&self, source: impl Into<String>) -> Result<SessionId> {
        let response = send(
            self.request(reqwest::Method::POST, "/execute?async=true")
                .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(source.into()),
        )
        .await?;
        let envelope: ExecuteEnvelope = expect_json(response, StatusCode::ACCEPTED).await?;
        Ok(envelope.session_id)
    }

    /// Fetches a session's envelope; `pending` is set while it still runs.
    pub async fn session(&self, session: SessionId) -> Result<ExecuteEnvelope> {
        let path = format!("/executions/{}", session);
        let response = send(self.request(reqwest::Method::GET, &path)).await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => read_json(response).await,
            _ => Err(error_from(response).await),
        }
    }

    pub async fn state(&self) -> Result<Value> {
        let response = send(self.request(reqwest::Method::GET, "/state")).await?;
        expect_json(response, StatusCode::OK).await
    }

    /// Replaces the whole global state.
    pub async fn replace_state(&self, state: &Value) -> Result<()> {
        let response = send(self.request(reqwest::Method::PUT, "/state").json(state)).await?;
        let _: Value = expect_json(response, StatusCode::OK).await?;
        Ok(())
    }

    pub async fn routes(&self) -> Result<Vec<RouteSummary>> {
        let response = send(self.request(reqwest::Method::GET, "/routes")).await?;
        expect_json(response, StatusCode::OK).await
    }

    /// Clears the route table; returns how many entries were removed.
    pub async fn reset_routes(&self) -> Result<usize> {
        let response = send(self.request(reqwest::Method::POST, "/routes/reset")).await?;
        let body: Value = expect_json(response, StatusCode::OK).await?;
        Ok(body["removed"].as_u64().unwrap_or_default() as usize)
    }

    pub async fn health(&self) -> Result<Value> {
        let response = send(self.request(reqwest::Method::GET, "/health")).await?;
        expect_json(response, StatusCode::OK).await
    }
}

async fn send(builder: reqwest::RequestBuilder) -> Result<Response> {
    builder
        .send()
        .await
        .map_err(|e| WeftError::Transport(format!("Request failed: {}", e)))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| WeftError::Transport(format!("Invalid response body: {}", e)))
}

async fn expect_json<T: DeserializeOwned>(response: Response, expected: StatusCode) -> Result<T> {
    if response.status() == expected {
        read_json(response).await
    } else {
        Err(error_from(response).await)
    }
}

/// Turns a non-success response into the matching error variant.
async fn error_from(response: Response) -> WeftError {
    let status = response.status();
    let message = match response.json::<Value>().await {
        Ok(body) => body["error"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => status.to_string(),
    };
    tracing::debug!("Server answered {}: {}", status, message);

    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
            WeftError::InvalidRequest(message)
        }
        StatusCode::UNAUTHORIZED => WeftError::InvalidRequest(format!("Unauthorized: {}", message)),
        StatusCode::NOT_FOUND => WeftError::NotFound(message),
        StatusCode::SERVICE_UNAVAILABLE => WeftError::DispatcherUnavailable(message),
        _ => WeftError::Transport(format!("{}: {}", status, message)),
    }
}
