/// Represent errors in the service shell
///
/// Engine failures stay `NfcError`s and are reported to the host, only
/// transport and bus problems end up here.
#[derive(Debug)]
pub enum ServiceError {
    BadRequest(&'static str, String),

    InternalError(&'static str, String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Helper for `ServiceError` result
pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<std::io::Error> for ServiceError {
    fn from(error: std::io::Error) -> Self {
        ServiceError::InternalError("IO error", format!("{error}"))
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(error: serde_json::Error) -> Self {
        ServiceError::BadRequest("Serialization error", format!("{error}"))
    }
}

impl From<std::num::ParseIntError> for ServiceError {
    fn from(error: std::num::ParseIntError) -> Self {
        ServiceError::BadRequest("Number parse error", format!("{error}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServiceError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        ServiceError::InternalError("Websocket error", format!("{error}"))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ServiceError {
    fn from(error: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ServiceError::InternalError("Internal communication error", format!("{error}"))
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(error: tokio::task::JoinError) -> Self {
        ServiceError::InternalError("Tokio join error", format!("{error}"))
    }
}

impl From<crate::nfc_module::nfc::NfcError> for ServiceError {
    fn from(error: crate::nfc_module::nfc::NfcError) -> Self {
        ServiceError::InternalError("NFC error", format!("{error:?}"))
    }
}
