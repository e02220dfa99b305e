use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Book, BookStatus, Card, Chapter, ChapterSummary, ProgressRow, ReadingProgress};

// 子模块声明
pub mod rest;
pub mod sqlite;

pub use rest::RestContentStore;
pub use sqlite::SqliteContentStore;

/// 最近阅读默认返回的书籍数量
pub const RECENT_BOOKS_LIMIT: usize = 5;

/// 内容库 trait
///
/// 所有内容库后端必须实现此 trait。客户端只读，写入由外部导入任务完成。
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// 读取书籍状态
    ///
    /// # 返回
    /// - Ok(Some(status)): 书籍行存在
    /// - Ok(None): 书籍行尚不存在
    async fn fetch_book_status(&self, book_id: &str) -> Result<Option<BookStatus>>;

    /// 读取书籍的全部章节，按创建时间升序
    async fn fetch_chapters(&self, book_id: &str) -> Result<Vec<Chapter>>;

    /// 读取章节正文
    async fn fetch_chapter_content(&self, chapter_id: &str) -> Result<Option<String>>;
}

/// 书目与阅读资料 trait
///
/// 摘要和卡片由外部服务生成，这里只读取
#[async_trait]
pub trait LibraryStore: Send + Sync {
    /// 按分类列出书籍
    async fn books_by_category(&self, category_id: &str) -> Result<Vec<Book>>;

    /// 按职业列出书籍
    async fn books_by_profession(&self, profession_id: &str) -> Result<Vec<Book>>;

    /// 读取章节摘要
    ///
    /// # 返回
    /// - Ok(None): 章节不存在，或摘要尚未生成
    async fn fetch_chapter_summary(&self, chapter_id: &str) -> Result<Option<ChapterSummary>>;

    /// 读取章节卡片，按写入顺序
    async fn fetch_cards(&self, chapter_id: &str) -> Result<Vec<Card>>;
}

/// 阅读进度存储 trait
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// 保存阅读进度（按 user_id + chapter_id 覆盖）
    async fn save_progress(&self, progress: &ReadingProgress) -> Result<()>;

    /// 读取用户的进度行，按最后阅读时间降序
    async fn fetch_progress_rows(&self, user_id: &str) -> Result<Vec<ProgressRow>>;

    /// 最近阅读的书籍 ID（去重，保持时间降序）
    async fn recent_book_ids(&self, user_id: &str, limit: usize) -> Result<Vec<String>> {
        let rows = self.fetch_progress_rows(user_id).await?;
        Ok(unique_recent_books(&rows, limit))
    }
}

/// 从按时间降序排列的进度行中提取去重后的书籍 ID
///
/// 保留每本书第一次出现的位置，最多返回 `limit` 个
pub fn unique_recent_books(rows: &[ProgressRow], limit: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .filter(|row| seen.insert(row.book_id.as_str()))
        .take(limit)
        .map(|row| row.book_id.clone())
        .collect()
}
