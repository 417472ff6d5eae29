use thiserror::Error;

/// Failures surfaced by the compositor, the store and the workflow around them.
///
/// Absent ids are not errors: `delete_by_id`, `get` and `update_remarks`
/// report absence through their return values instead.
#[derive(Debug, Error)]
pub enum EndorseError {
    /// The source document or the overlay image could not be parsed.
    #[error("decode failed: {0}")]
    DecodeFailure(String),
    /// The endorsed output could not be serialized.
    #[error("encode failed: {0}")]
    EncodeFailure(String),
    /// The store could not be opened or a statement failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid directive: {0}")]
    InvalidDirective(String),
    #[error("unsupported file: {0}")]
    UnsupportedFile(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EndorseError {
    /// Stable snake_case code reported across the bridge.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DecodeFailure(_) => "decode_failed",
            Self::EncodeFailure(_) => "encode_failed",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::InvalidDirective(_) => "invalid_directive",
            Self::UnsupportedFile(_) => "unsupported_file",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Io(_) => "io_failed",
        }
    }

    /// `code:detail` string, matching how the bridge reports errors.
    pub fn to_bridge_string(&self) -> String {
        match self {
            Self::DecodeFailure(d)
            | Self::EncodeFailure(d)
            | Self::StoreUnavailable(d)
            | Self::InvalidDirective(d)
            | Self::UnsupportedFile(d) => format!("{}:{d}", self.code()),
            Self::InvalidCredentials => self.code().to_string(),
            Self::Io(e) => format!("{}:{e}", self.code()),
        }
    }
}

impl From<sqlite::Error> for EndorseError {
    fn from(err: sqlite::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<lopdf::Error> for EndorseError {
    fn from(err: lopdf::Error) -> Self {
        Self::DecodeFailure(format!("pdf:{err}"))
    }
}

pub type Result<T> = std::result::Result<T, EndorseError>;
