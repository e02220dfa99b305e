use thiserror::Error;

/// 统一错误类型
///
/// 覆盖内容库读取、导入触发、本地数据库与配置加载
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),
    #[error("服务返回错误状态 {status}: {url}")]
    Status { status: u16, url: String },
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("数据解析失败: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("配置错误: {0}")]
    Config(String),
    #[error("找不到记录: {0}")]
    NotFound(String),
    #[error("锁定失败: {0}")]
    LockPoisoned(String),
}

impl From<toml::de::Error> for ReaderError {
    fn from(e: toml::de::Error) -> Self {
        ReaderError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_message() {
        let err = ReaderError::Status {
            status: 503,
            url: "https://example.test/rest/v1/books".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("503"));
        assert!(msg.contains("/rest/v1/books"));
    }

    #[test]
    fn test_toml_error_becomes_config_error() {
        let parsed: std::result::Result<toml::Value, _> = toml::from_str("polling = [");
        let err: ReaderError = parsed.unwrap_err().into();
        assert!(matches!(err, ReaderError::Config(_)));
    }
}
