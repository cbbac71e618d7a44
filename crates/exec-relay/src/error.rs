use http::StatusCode;
use thiserror::Error;

use crate::relay::{CloseFrame, INTERNAL_ERROR};

/// Why an exec upgrade did not become a relay session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Missing `allocId` or `task`.
    #[error("allocId and task are required")]
    ClientInput,
    /// Bad, expired or missing ticket, or no credential cookie. One answer
    /// for every cause.
    #[error("unauthorized")]
    Authentication,
    #[error("upstream exec connection failed: {0}")]
    UpstreamConnect(String),
}

impl ExecError {
    /// Status used when rejecting before the upgrade completes.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ClientInput => StatusCode::BAD_REQUEST,
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::ClientInput => "invalid_request",
            Self::Authentication => "unauthorized",
            Self::UpstreamConnect(_) => "upstream_unavailable",
        }
    }

    /// Message safe to show the browser.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::ClientInput => "allocId and task are required",
            Self::Authentication => "unauthorized",
            Self::UpstreamConnect(_) => "upstream exec endpoint unavailable",
        }
    }

    /// Close frame sent when the failure happens after the client socket is
    /// already upgraded.
    pub fn close_frame(&self) -> CloseFrame {
        CloseFrame::new(INTERNAL_ERROR, self.public_message())
    }
}
