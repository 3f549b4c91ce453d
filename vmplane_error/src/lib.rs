mod reason;

pub use reason::{Reason, Rejection};

use bon::bon;
use miette::{Diagnostic, Report};
pub use pipelight_error::{CastError, TomlError};

use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmplaneError {
    ////////////////////////////////
    // Caller facing rejections
    /// Client-correctable request (400).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(Rejection),

    /// Blocked by a live reference or a name collision (400).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Conflict(Rejection),

    #[error(transparent)]
    #[diagnostic(transparent)]
    NotFound(Rejection),

    /// Mutation of a derived read-only collection (405).
    #[error(transparent)]
    #[diagnostic(transparent)]
    MethodNotAllowed(Rejection),

    #[error(transparent)]
    #[diagnostic(transparent)]
    PayloadTooLarge(Rejection),

    ////////////////////////////////
    // Lib native errors
    #[error(transparent)]
    #[diagnostic(transparent)]
    WrapError(#[from] WrapError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    LibError(#[from] LibError),

    ////////////////////////////////
    // Type convertion
    #[error(transparent)]
    #[diagnostic(code(parse::error))]
    ParseError(#[from] url::ParseError),

    #[error(transparent)]
    #[diagnostic(code(serde::error))]
    SerdeError(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code(vmplane::strum::error))]
    StrumError(#[from] strum::ParseError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    CastError(#[from] CastError),

    #[error(transparent)]
    #[diagnostic(code(vmplane::io::error))]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(vmplane::io::error))]
    UuidError(#[from] uuid::Error),

    // Database
    #[error(transparent)]
    #[diagnostic(code(sea_orm::error))]
    SeaOrmError(#[from] sea_orm::DbErr),
}

impl VmplaneError {
    pub fn invalid(reason: Reason, message: &str) -> Self {
        Self::Validation(Rejection::new(reason, message, None))
    }
    pub fn conflict(reason: Reason, message: &str) -> Self {
        Self::Conflict(Rejection::new(reason, message, None))
    }
    pub fn not_found(reason: Reason, message: &str) -> Self {
        Self::NotFound(Rejection::new(reason, message, None))
    }
    pub fn not_allowed(reason: Reason, message: &str) -> Self {
        Self::MethodNotAllowed(Rejection::new(reason, message, None))
    }
    pub fn too_large(message: &str, help: &str) -> Self {
        Self::PayloadTooLarge(Rejection::new(
            Reason::PayloadTooLarge,
            message,
            Some(help),
        ))
    }
    /*
     * Status code as exposed to api callers.
     */
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Conflict(_) => 400,
            Self::NotFound(_) => 404,
            Self::MethodNotAllowed(_) => 405,
            Self::PayloadTooLarge(_) => 413,
            _ => 500,
        }
    }
    /// The stable reason code, if the error is a caller facing rejection.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Self::Validation(e)
            | Self::Conflict(e)
            | Self::NotFound(e)
            | Self::MethodNotAllowed(e)
            | Self::PayloadTooLarge(e) => Some(e.reason),
            _ => None,
        }
    }
}

/**
A config error with help higher origin
Can be recursively chained.
*/
#[derive(Debug, Error, Diagnostic)]
#[error("{}", message)]
#[diagnostic(code(vmplane::wrap::error))]
pub struct WrapError {
    pub message: String,
    #[diagnostic_source]
    pub origin: Report,
    #[help]
    pub help: String,
}

#[bon]
impl WrapError {
    #[builder]
    pub fn new(msg: &str, help: &str, origin: Report) -> Self {
        Self {
            message: msg.to_owned(),
            help: help.to_owned(),
            origin,
        }
    }
}

/**
A root cause error with no inner origin
*/
#[derive(Debug, Error, Diagnostic)]
#[error("{}", message)]
#[diagnostic(code(vmplane::lib::error))]
pub struct LibError {
    pub message: String,
    #[help]
    pub help: String,
}

#[bon]
impl LibError {
    #[builder]
    pub fn new(msg: &str, help: &str) -> Self {
        Self {
            message: msg.to_owned(),
            help: help.to_owned(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use miette::Result;
    use pretty_assertions::assert_eq;

    #[test]
    fn map_rejections_to_status() -> Result<()> {
        let err = VmplaneError::invalid(Reason::ParamsInvalid, "unknown field");
        assert_eq!(err.status(), 400);
        assert_eq!(err.reason(), Some(Reason::ParamsInvalid));

        let err = VmplaneError::not_allowed(Reason::ReadOnlyCollection, "isos");
        assert_eq!(err.status(), 405);

        let err = VmplaneError::too_large("body too large", "max is 4MiB");
        assert_eq!(err.status(), 413);
        assert_eq!(err.reason(), Some(Reason::PayloadTooLarge));

        let err: VmplaneError = LibError::builder().msg("boom").help("").build().into();
        assert_eq!(err.status(), 500);
        assert_eq!(err.reason(), None);
        Ok(())
    }

    #[test]
    fn reason_is_diagnostic_code() -> Result<()> {
        let err = VmplaneError::conflict(Reason::PoolInUseByTemplate, "pool is used");
        let code = err.code().map(|e| e.to_string());
        assert_eq!(code, Some("POOL_IN_USE_BY_TEMPLATE".to_owned()));
        Ok(())
    }
}
