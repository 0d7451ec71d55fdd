// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error taxonomy for the relay API and the session/router/stop planes.
///
/// Kinds, not type names — each corresponds to a terminal condition or
/// rejection the relay can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayError {
    Unauthorized,
    Forbidden,
    BadRequest,
    NoProvider,
    NoActiveEndpoint,
    PendingTimeout,
    UpstreamDial,
    UpstreamHeader,
    UpstreamRead,
    OversizedStream,
    SessionNotFound,
    AlreadyCompleted,
    AlreadyStopped,
    NotFound,
    Internal,
}

impl RelayError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::BadRequest | Self::NoProvider | Self::NoActiveEndpoint => 400,
            Self::UpstreamDial | Self::UpstreamHeader | Self::UpstreamRead => 502,
            Self::PendingTimeout => 504,
            Self::OversizedStream => 413,
            Self::SessionNotFound | Self::NotFound => 404,
            Self::AlreadyCompleted | Self::AlreadyStopped => 409,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::BadRequest => "BAD_REQUEST",
            Self::NoProvider => "NO_PROVIDER",
            Self::NoActiveEndpoint => "NO_ACTIVE_ENDPOINT",
            Self::PendingTimeout => "PENDING_TIMEOUT",
            Self::UpstreamDial => "UPSTREAM_DIAL",
            Self::UpstreamHeader => "UPSTREAM_HEADER",
            Self::UpstreamRead => "UPSTREAM_READ",
            Self::OversizedStream => "OVERSIZED_STREAM",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::AlreadyCompleted => "ALREADY_COMPLETED",
            Self::AlreadyStopped => "ALREADY_STOPPED",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
