use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{ContentStore, LibraryStore, ProgressStore};
use crate::error::{ReaderError, Result};
use crate::models::{
    Book, BookStatus, Card, Chapter, ChapterSummary, ProgressRow, ReadingProgress, StatusRow,
};

const BOOKS_TABLE: &str = "books";
const BOOK_ID_COLUMN: &str = "Id";
const CHAPTERS_TABLE: &str = "chapter_contents";
const PROGRESS_TABLE: &str = "user_progress";
const CARDS_TABLE: &str = "cards";
const CHAPTER_COLUMNS: &str = "id,book_id,chapter_title,created_at";
const CARD_COLUMNS: &str = "id,chapter_id,card_heading,card_content";

/// 托管内容库（PostgREST 风格接口）
pub struct RestContentStore {
    client: Client,
    base_url: Url,
    api_key: String,
}

#[derive(Deserialize)]
struct ContentRow {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct MetadataRow {
    #[serde(default)]
    metadata: serde_json::Value,
}

impl RestContentStore {
    /// 创建客户端
    ///
    /// # 参数
    /// - `base_url`: 项目地址，例如 `https://xyz.supabase.co`
    /// - `api_key`: 匿名访问密钥
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        Self::with_client(Client::new(), base_url, api_key)
    }

    pub fn with_client(client: Client, base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ReaderError::Config(format!("无效的内容库地址 {}: {}", base_url, e)))?;
        // 以 / 结尾，join 时才不会丢掉最后一段路径
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// 拼接表地址和查询参数
    fn table_url(&self, table: &str, params: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("rest/v1/{}", table))
            .map_err(|e| ReaderError::Config(format!("无效的表地址 {}: {}", table, e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn status_url(&self, book_id: &str) -> Result<Url> {
        self.table_url(
            BOOKS_TABLE,
            &[
                (BOOK_ID_COLUMN, format!("eq.{}", book_id)),
                ("select", "status".to_string()),
            ],
        )
    }

    fn chapters_url(&self, book_id: &str) -> Result<Url> {
        self.table_url(
            CHAPTERS_TABLE,
            &[
                ("book_id", format!("eq.{}", book_id)),
                ("select", CHAPTER_COLUMNS.to_string()),
                ("order", "created_at.asc".to_string()),
            ],
        )
    }

    fn content_url(&self, chapter_id: &str) -> Result<Url> {
        self.table_url(
            CHAPTERS_TABLE,
            &[
                ("id", format!("eq.{}", chapter_id)),
                ("select", "content".to_string()),
            ],
        )
    }

    fn summary_url(&self, chapter_id: &str) -> Result<Url> {
        self.table_url(
            CHAPTERS_TABLE,
            &[
                ("id", format!("eq.{}", chapter_id)),
                ("select", "metadata".to_string()),
            ],
        )
    }

    fn cards_url(&self, chapter_id: &str) -> Result<Url> {
        self.table_url(
            CARDS_TABLE,
            &[
                ("chapter_id", format!("eq.{}", chapter_id)),
                ("select", CARD_COLUMNS.to_string()),
                ("order", "id.asc".to_string()),
            ],
        )
    }

    fn books_url(&self, column: &str, value: &str) -> Result<Url> {
        self.table_url(
            BOOKS_TABLE,
            &[
                (column, format!("eq.{}", value)),
                ("select", "*".to_string()),
            ],
        )
    }

    fn progress_rows_url(&self, user_id: &str) -> Result<Url> {
        self.table_url(
            PROGRESS_TABLE,
            &[
                ("user_id", format!("eq.{}", user_id)),
                ("select", "book_id,last_read_at".to_string()),
                ("order", "last_read_at.desc".to_string()),
            ],
        )
    }

    fn progress_upsert_url(&self) -> Result<Url> {
        self.table_url(
            PROGRESS_TABLE,
            &[("on_conflict", "user_id,chapter_id".to_string())],
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn get_rows<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
        tracing::debug!(url = %url, "内容库查询");
        let response = self.authorized(self.client.get(url.clone())).send().await?;
        if !response.status().is_success() {
            return Err(ReaderError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json::<Vec<T>>().await?)
    }
}

#[async_trait]
impl ContentStore for RestContentStore {
    async fn fetch_book_status(&self, book_id: &str) -> Result<Option<BookStatus>> {
        let rows: Vec<StatusRow> = self.get_rows(self.status_url(book_id)?).await?;
        Ok(rows.into_iter().next().map(|row| row.status))
    }

    async fn fetch_chapters(&self, book_id: &str) -> Result<Vec<Chapter>> {
        self.get_rows(self.chapters_url(book_id)?).await
    }

    async fn fetch_chapter_content(&self, chapter_id: &str) -> Result<Option<String>> {
        let rows: Vec<ContentRow> = self.get_rows(self.content_url(chapter_id)?).await?;
        Ok(rows.into_iter().next().and_then(|row| row.content))
    }
}

#[async_trait]
impl LibraryStore for RestContentStore {
    async fn books_by_category(&self, category_id: &str) -> Result<Vec<Book>> {
        self.get_rows(self.books_url("category_id", category_id)?).await
    }

    async fn books_by_profession(&self, profession_id: &str) -> Result<Vec<Book>> {
        self.get_rows(self.books_url("profession_id", profession_id)?).await
    }

    async fn fetch_chapter_summary(&self, chapter_id: &str) -> Result<Option<ChapterSummary>> {
        let rows: Vec<MetadataRow> = self.get_rows(self.summary_url(chapter_id)?).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(ChapterSummary::from_metadata(row.metadata)?),
            None => Ok(None),
        }
    }

    async fn fetch_cards(&self, chapter_id: &str) -> Result<Vec<Card>> {
        self.get_rows(self.cards_url(chapter_id)?).await
    }
}

#[async_trait]
impl ProgressStore for RestContentStore {
    async fn save_progress(&self, progress: &ReadingProgress) -> Result<()> {
        let url = self.progress_upsert_url()?;
        let response = self
            .authorized(self.client.post(url.clone()))
            .header("Prefer", "resolution=merge-duplicates")
            .json(progress)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ReaderError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        tracing::info!(user_id = %progress.user_id, chapter_id = %progress.chapter_id, "阅读进度已保存");
        Ok(())
    }

    async fn fetch_progress_rows(&self, user_id: &str) -> Result<Vec<ProgressRow>> {
        self.get_rows(self.progress_rows_url(user_id)?).await
    }
}
