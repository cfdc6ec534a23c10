use core::error::Error;

use error_stack::Report;
use tonic::Status;

/// Authorization failures, surfaced verbatim by every management method.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AuthError {
    #[display("{reason}")]
    Unauthenticated { reason: String },
    #[display("{reason}")]
    PermissionDenied { reason: String },
}

impl Error for AuthError {}

impl AuthError {
    pub fn unauthenticated(reason: impl Into<String>) -> Report<Self> {
        Report::new(Self::Unauthenticated {
            reason: reason.into(),
        })
    }

    pub fn permission_denied(reason: impl Into<String>) -> Report<Self> {
        Report::new(Self::PermissionDenied {
            reason: reason.into(),
        })
    }

    pub fn to_status(&self) -> Status {
        match self {
            Self::Unauthenticated { reason } => Status::unauthenticated(reason.clone()),
            Self::PermissionDenied { reason } => Status::permission_denied(reason.clone()),
        }
    }
}

/// gRPC status for `report`, carrying only the top level reason.
pub fn auth_status(report: &Report<AuthError>) -> Status {
    report.current_context().to_status()
}
