mod client;

pub use client::{ApiError, ApiErrorClass, DEFAULT_BASE_URL, Project, ProjectClient, RemoteFile};
pub use reqwest::StatusCode;
