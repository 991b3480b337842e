use crate::types::QueueStatus;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 錯誤種類，方便呼叫端用 match 判斷
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    ImageTooLarge,
    NotAnImage,
    InvalidFormat,
    HttpRequestFailed,
    RetryableQuery,
    NoMatchFound,
    InvalidResponseStructure,
    UserCancelled,
}

/// 取消的來源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// 透過 `CancelHandle::cancel` 取消
    Requested,
    /// Ctrl+C
    Interrupted,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cancelled::Requested => write!(f, "收到取消請求"),
            Cancelled::Interrupted => write!(f, "收到中斷訊號"),
        }
    }
}

impl std::error::Error for Cancelled {}

#[derive(Error, Debug)]
pub enum IqdbError {
    #[error("參數無效: {message}")]
    InvalidArgument {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("圖片過大: {message}")]
    ImageTooLarge {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("不是圖片: {message}")]
    NotAnImage {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("不支援的圖片格式: {message}")]
    InvalidFormat {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("HTTP 請求失敗: {message}")]
    HttpRequestFailed {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// 伺服器暫時無法回應結果，可重試
    #[error("暫時性錯誤，可重試: {message}")]
    RetryableQuery {
        message: String,
        queue: Option<QueueStatus>,
    },

    #[error("找不到任何相符結果")]
    NoMatchFound,

    #[error("回應結構無法解析: {message}")]
    InvalidResponseStructure {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("使用者取消了操作")]
    UserCancelled {
        #[source]
        source: Cancelled,
    },
}

pub type Result<T> = std::result::Result<T, IqdbError>;

impl IqdbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IqdbError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            IqdbError::ImageTooLarge { .. } => ErrorKind::ImageTooLarge,
            IqdbError::NotAnImage { .. } => ErrorKind::NotAnImage,
            IqdbError::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            IqdbError::HttpRequestFailed { .. } => ErrorKind::HttpRequestFailed,
            IqdbError::RetryableQuery { .. } => ErrorKind::RetryableQuery,
            IqdbError::NoMatchFound => ErrorKind::NoMatchFound,
            IqdbError::InvalidResponseStructure { .. } => ErrorKind::InvalidResponseStructure,
            IqdbError::UserCancelled { .. } => ErrorKind::UserCancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::RetryableQuery
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        IqdbError::InvalidArgument { message: message.into(), source: None }
    }

    pub fn image_too_large(message: impl Into<String>) -> Self {
        IqdbError::ImageTooLarge { message: message.into(), source: None }
    }

    pub fn not_an_image(message: impl Into<String>) -> Self {
        IqdbError::NotAnImage { message: message.into(), source: None }
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        IqdbError::InvalidFormat { message: message.into(), source: None }
    }

    pub fn http(message: impl Into<String>) -> Self {
        IqdbError::HttpRequestFailed { message: message.into(), source: None }
    }

    pub fn structure(message: impl Into<String>) -> Self {
        IqdbError::InvalidResponseStructure { message: message.into(), source: None }
    }

    /// 附上底層錯誤作為 cause（沒有 source 欄位的種類則原樣回傳）
    pub fn caused_by(mut self, cause: impl Into<BoxError>) -> Self {
        match &mut self {
            IqdbError::InvalidArgument { source, .. }
            | IqdbError::ImageTooLarge { source, .. }
            | IqdbError::NotAnImage { source, .. }
            | IqdbError::InvalidFormat { source, .. }
            | IqdbError::HttpRequestFailed { source, .. }
            | IqdbError::InvalidResponseStructure { source, .. } => {
                *source = Some(cause.into());
            }
            IqdbError::RetryableQuery { .. }
            | IqdbError::NoMatchFound
            | IqdbError::UserCancelled { .. } => {}
        }
        self
    }
}
