use std::time::SystemTime;

use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.projmirror.dev";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

/// Client for the project document endpoints of the remote store.
#[derive(Clone)]
pub struct ProjectClient {
    http: Client,
    base_url: Url,
    session_key: String,
}

impl ProjectClient {
    pub fn new(session_key: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, session_key)
    }

    pub fn with_base_url(base_url: &str, session_key: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            session_key: session_key.into(),
        })
    }

    pub async fn list_projects(&self, organization_id: &str) -> Result<Vec<Project>, ApiError> {
        let url = self.endpoint(&format!("/api/organizations/{organization_id}/projects"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_project_files(
        &self,
        organization_id: &str,
        project_id: &str,
    ) -> Result<Vec<RemoteFile>, ApiError> {
        let url = self.docs_endpoint(organization_id, project_id)?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn upload_file(
        &self,
        organization_id: &str,
        project_id: &str,
        file_name: &str,
        content: &str,
    ) -> Result<RemoteFile, ApiError> {
        let url = self.docs_endpoint(organization_id, project_id)?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&UploadRequest { file_name, content })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_file(
        &self,
        organization_id: &str,
        project_id: &str,
        file_id: &str,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&format!(
            "/api/organizations/{organization_id}/projects/{project_id}/docs/{file_id}"
        ))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    fn docs_endpoint(&self, organization_id: &str, project_id: &str) -> Result<Url, ApiError> {
        self.endpoint(&format!(
            "/api/organizations/{organization_id}/projects/{project_id}/docs"
        ))
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.session_key)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        ApiError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::NotFound))
    }

    /// Transport failures count as retryable alongside throttling and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(err) => err.is_timeout() || err.is_connect(),
            ApiError::Url(_) => false,
            ApiError::Api { .. } => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Project {
    pub uuid: String,
    pub name: String,
}

/// A document stored in a project. `file_name` holds the canonical name.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteFile {
    pub uuid: String,
    pub file_name: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    file_name: &'a str,
    content: &'a str,
}
