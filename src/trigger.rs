use async_trait::async_trait;
use reqwest::{Client, Url};

use crate::error::{ReaderError, Result};
use crate::models::IngestionRequest;

/// 默认导入触发地址
pub const DEFAULT_TRIGGER_URL: &str = "https://auto-production.up.railway.app/store";

/// 默认摘要生成地址
pub const DEFAULT_SUMMARY_URL: &str = "https://thebookapp-production-eb6d.up.railway.app/summary";

/// 导入触发 trait
///
/// 只负责通知外部服务开始生成章节，不等待完成。
/// 同一本书重复触发由生产方保证幂等。
#[async_trait]
pub trait IngestionTrigger: Send + Sync {
    async fn trigger(&self, book_id: &str, request: &IngestionRequest) -> Result<()>;
}

/// 摘要生成触发 trait
///
/// 请求外部服务为章节生成摘要，完成后写回 `chapter_contents.metadata`
#[async_trait]
pub trait SummaryTrigger: Send + Sync {
    async fn request_summary(&self, chapter_id: &str) -> Result<()>;
}

fn parse_endpoint(raw: &str, what: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| ReaderError::Config(format!("无效的{}地址 {}: {}", what, raw, e)))
}

/// 发送 GET，任何 2xx 视为成功，响应体忽略
async fn fire(client: &Client, url: Url) -> Result<()> {
    let response = client.get(url.clone()).send().await?;
    if !response.status().is_success() {
        return Err(ReaderError::Status {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }
    Ok(())
}

/// HTTP 导入触发器
pub struct HttpIngestionTrigger {
    client: Client,
    base_url: Url,
}

impl HttpIngestionTrigger {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            base_url: parse_endpoint(base_url, "导入触发")?,
        })
    }
}

/// HTTP 摘要触发器
pub struct HttpSummaryTrigger {
    client: Client,
    base_url: Url,
}

impl HttpSummaryTrigger {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            base_url: parse_endpoint(base_url, "摘要服务")?,
        })
    }
}

/// 拼接摘要地址：`?key=<chapter_id>`
pub fn build_summary_url(base: &Url, chapter_id: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().clear().append_pair("key", chapter_id);
    url
}

#[async_trait]
impl SummaryTrigger for HttpSummaryTrigger {
    async fn request_summary(&self, chapter_id: &str) -> Result<()> {
        tracing::info!(chapter_id, "请求生成章节摘要");
        fire(&self.client, build_summary_url(&self.base_url, chapter_id)).await
    }
}

/// 拼接触发地址
///
/// 参数：`key=true`、`url`、`title`、`author`（缺省 "Unknown Author"）、`id`，全部编码
pub fn build_trigger_url(base: &Url, book_id: &str, request: &IngestionRequest) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("key", "true")
        .append_pair("url", &request.source_url)
        .append_pair("title", &request.title)
        .append_pair("author", request.author_or_default())
        .append_pair("id", book_id);
    url
}

#[async_trait]
impl IngestionTrigger for HttpIngestionTrigger {
    async fn trigger(&self, book_id: &str, request: &IngestionRequest) -> Result<()> {
        tracing::info!(book_id, title = %request.title, "触发书籍导入");
        fire(&self.client, build_trigger_url(&self.base_url, book_id, request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_trigger_url_params() {
        let base = Url::parse(DEFAULT_TRIGGER_URL).unwrap();
        let req = IngestionRequest::new(
            "Thinking, Fast & Slow",
            Some("Daniel Kahneman".to_string()),
            "https://mirror.example.test/get?md5=abc&x=1",
        );
        let url = build_trigger_url(&base, "B 1", &req);

        assert_eq!(url.host_str(), Some("auto-production.up.railway.app"));
        assert_eq!(url.path(), "/store");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("key".to_string(), "true".to_string()),
                ("url".to_string(), "https://mirror.example.test/get?md5=abc&x=1".to_string()),
                ("title".to_string(), "Thinking, Fast & Slow".to_string()),
                ("author".to_string(), "Daniel Kahneman".to_string()),
                ("id".to_string(), "B 1".to_string()),
            ]
        );

        // 原始查询串中不能出现未编码的分隔符
        let raw = url.query().unwrap();
        assert!(!raw.contains("md5=abc&x=1"));
        assert!(raw.contains("Fast+%26+Slow"));
    }

    #[test]
    fn test_trigger_url_author_default() {
        let base = Url::parse(DEFAULT_TRIGGER_URL).unwrap();
        let req = IngestionRequest::new("Range", None, "https://example.test/range.pdf");
        let url = build_trigger_url(&base, "7", &req);
        let author = url
            .query_pairs()
            .find(|(k, _)| k == "author")
            .map(|(_, v)| v.into_owned());
        assert_eq!(author.as_deref(), Some("Unknown Author"));
    }

    #[tokio::test]
    async fn test_trigger_network_failure() {
        let trigger = HttpIngestionTrigger::new("http://127.0.0.1:1/store").unwrap();
        let req = IngestionRequest::new("Range", None, "https://example.test/range.pdf");
        assert!(trigger.trigger("7", &req).await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_over_http() {
        let server = MockServer::start_async().await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/store")
                    .query_param("key", "true")
                    .query_param("title", "Range")
                    .query_param("author", "Unknown Author")
                    .query_param("id", "7");
                then.status(202).body("queued");
            })
            .await;
        let failing = server
            .mock_async(|when, then| {
                when.method(GET).path("/store").query_param("id", "8");
                then.status(500);
            })
            .await;

        let trigger = HttpIngestionTrigger::new(&server.url("/store")).unwrap();
        let req = IngestionRequest::new("Range", None, "https://example.test/range.pdf");
        trigger.trigger("7", &req).await.unwrap();
        accepted.assert_async().await;

        assert!(matches!(
            trigger.trigger("8", &req).await,
            Err(ReaderError::Status { status: 500, .. })
        ));
        failing.assert_async().await;
    }

    #[test]
    fn test_summary_url() {
        let base = Url::parse(DEFAULT_SUMMARY_URL).unwrap();
        let url = build_summary_url(&base, "c 1");
        assert_eq!(url.path(), "/summary");
        assert_eq!(url.query(), Some("key=c+1"));
    }

    #[tokio::test]
    async fn test_summary_trigger_over_http() {
        let server = MockServer::start_async().await;
        let ok = server
            .mock_async(|when, then| {
                when.method(GET).path("/summary").query_param("key", "c1");
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/summary").query_param("key", "c2");
                then.status(404);
            })
            .await;

        let trigger = HttpSummaryTrigger::new(&server.url("/summary")).unwrap();
        trigger.request_summary("c1").await.unwrap();
        ok.assert_async().await;
        assert!(matches!(
            trigger.request_summary("c2").await,
            Err(ReaderError::Status { status: 404, .. })
        ));
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(matches!(HttpSummaryTrigger::new("::"), Err(ReaderError::Config(_))));
    }
}
