//! Climb-data collaborator.
//!
//! Rooms ask it for angle-dependent climb stats when a session's angle
//! changes. Every call is fallible on its own; the room keeps the old item
//! when a lookup fails.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use queue_core::ClimbRef;

/// Errors from a climb-data lookup.
#[derive(Debug, Error)]
pub enum ClimbDataError {
    /// The configured base URL is invalid.
    #[error("invalid climb data URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed (connection, timeout, etc.).
    #[error("climb data request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The climb is unknown at this board and angle.
    #[error("climb {0} not found")]
    NotFound(String),
    /// The service answered with an unexpected status.
    #[error("climb data service returned {0}")]
    Status(u16),
}

impl ClimbDataError {
    /// Returns true for transient failures worth retrying later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status(code) => *code >= 500,
            Self::InvalidUrl(_) | Self::NotFound(_) => false,
        }
    }
}

/// Board a session climbs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardParams {
    /// Path such as `/kilter/1/12/1,2,3/40`.
    pub board_path: String,
}

impl BoardParams {
    /// Wrap a board path.
    #[must_use]
    pub fn new(board_path: impl Into<String>) -> Self {
        Self {
            board_path: board_path.into(),
        }
    }

    /// Board name, the first path segment.
    #[must_use]
    pub fn board_name(&self) -> Option<&str> {
        self.board_path.split('/').find(|s| !s.is_empty())
    }
}

/// Source of angle-dependent climb stats.
#[async_trait]
pub trait ClimbDataSource: Send + Sync {
    /// Look up `climb_uuid` on `board` at `angle`.
    async fn climb_stats_at(
        &self,
        climb_uuid: &str,
        board: &BoardParams,
        angle: u16,
    ) -> Result<ClimbRef, ClimbDataError>;
}

/// HTTP climb-data client: `GET {base}/climbs/{uuid}?board_path=..&angle=..`.
#[derive(Clone)]
pub struct HttpClimbData {
    http: Client,
    base: Url,
}

impl HttpClimbData {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClimbDataError::InvalidUrl`] if the URL is malformed.
    /// Returns [`ClimbDataError::Http`] if the HTTP client fails to build.
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, ClimbDataError> {
        let mut base =
            Url::parse(base_url.as_ref()).map_err(|e| ClimbDataError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ClimbDataError::InvalidUrl(base.to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(concat!("climb-queue/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self { http, base })
    }

    fn climb_url(&self, climb_uuid: &str, board: &BoardParams, angle: u16) -> Result<Url, ClimbDataError> {
        let mut url = self
            .base
            .join("climbs/")
            .and_then(|u| u.join(climb_uuid))
            .map_err(|e| ClimbDataError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("board_path", &board.board_path)
            .append_pair("angle", &angle.to_string());
        Ok(url)
    }
}

#[async_trait]
impl ClimbDataSource for HttpClimbData {
    async fn climb_stats_at(
        &self,
        climb_uuid: &str,
        board: &BoardParams,
        angle: u16,
    ) -> Result<ClimbRef, ClimbDataError> {
        let url = self.climb_url(climb_uuid, board, angle)?;
        tracing::debug!(climb_uuid = %climb_uuid, angle, "Fetching climb stats");

        let response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ClimbDataError::NotFound(climb_uuid.to_string())),
            status if status.is_success() => Ok(response.json::<ClimbRef>().await?),
            status => Err(ClimbDataError::Status(status.as_u16())),
        }
    }
}

impl std::fmt::Debug for HttpClimbData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClimbData")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}
