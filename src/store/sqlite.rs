use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{ContentStore, LibraryStore, ProgressStore};
use crate::error::{ReaderError, Result};
use crate::models::{Book, BookStatus, Card, Chapter, ChapterSummary, ProgressRow, ReadingProgress};

/// 本地 SQLite 内容库
///
/// 与托管库保持相同的表结构，用于离线镜像、演示和测试。
/// 写入方法模拟外部导入任务。
pub struct SqliteContentStore {
    conn: Mutex<Connection>,
}

/// 初始化数据库表结构
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("PRAGMA encoding = 'UTF-8'", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS books (
            Id TEXT PRIMARY KEY,
            Title TEXT NOT NULL,
            Author TEXT,
            source_url TEXT,
            status TEXT,
            category_id TEXT,
            profession_id TEXT,
            added_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS chapter_contents (
            id TEXT PRIMARY KEY,
            book_id TEXT NOT NULL,
            chapter_title TEXT NOT NULL,
            content TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cards (
            id TEXT PRIMARY KEY,
            chapter_id TEXT NOT NULL,
            card_heading TEXT,
            card_content TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_chapter_contents_book
         ON chapter_contents (book_id, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_progress (
            user_id TEXT NOT NULL,
            book_id TEXT NOT NULL,
            chapter_id TEXT NOT NULL,
            card_id TEXT,
            card_number INTEGER,
            total_cards INTEGER,
            last_read_at TEXT NOT NULL,
            PRIMARY KEY (user_id, chapter_id)
        )",
        [],
    )?;

    Ok(())
}

/// 时间统一存为定宽 RFC3339（UTC，微秒），保证按文本排序即按时间排序
fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const BOOK_COLUMNS: &str = "Id, Title, Author, source_url, status, category_id, profession_id";

fn book_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
    let status: Option<String> = row.get(4)?;
    Ok(Book {
        id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        source_url: row.get(3)?,
        status: BookStatus::from_db(status.as_deref()),
        category_id: row.get(5)?,
        profession_id: row.get(6)?,
    })
}

fn decode_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl SqliteContentStore {
    /// 打开（或创建）数据库文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 内存数据库
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ReaderError::LockPoisoned(format!("锁定数据库连接失败: {}", e)))
    }

    // ==================== Book 操作 ====================

    /// 写入书籍（已存在则覆盖）
    pub fn insert_book(&self, book: &Book) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO books
                (Id, Title, Author, source_url, status, category_id, profession_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                book.id,
                book.title,
                book.author,
                book.source_url,
                book.status.as_str(),
                book.category_id,
                book.profession_id
            ],
        )?;
        Ok(())
    }

    /// 更新书籍状态
    pub fn set_book_status(&self, book_id: &str, status: BookStatus) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE books SET status = ?1 WHERE Id = ?2",
            rusqlite::params![status.as_str(), book_id],
        )?;
        if updated == 0 {
            return Err(ReaderError::NotFound(format!("书籍 {}", book_id)));
        }
        Ok(())
    }

    /// 获取单本书籍
    pub fn get_book(&self, book_id: &str) -> Result<Option<Book>> {
        let conn = self.lock()?;
        let book = conn
            .query_row(
                &format!("SELECT {} FROM books WHERE Id = ?1", BOOK_COLUMNS),
                [book_id],
                book_from_row,
            )
            .optional()?;
        Ok(book)
    }

    fn query_books(&self, sql: &str, key: &str) -> Result<Vec<Book>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let books = stmt
            .query_map([key], book_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(books)
    }

    // ==================== Chapter 操作 ====================

    /// 写入章节
    pub fn insert_chapter(&self, chapter: &Chapter, content: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chapter_contents (id, book_id, chapter_title, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                chapter.id,
                chapter.book_id,
                chapter.title,
                content,
                encode_time(&chapter.created_at)
            ],
        )?;
        Ok(())
    }

    /// 写入章节摘要（模拟外部摘要服务）
    pub fn set_chapter_metadata(&self, chapter_id: &str, metadata: &serde_json::Value) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE chapter_contents SET metadata = ?1 WHERE id = ?2",
            rusqlite::params![metadata.to_string(), chapter_id],
        )?;
        if updated == 0 {
            return Err(ReaderError::NotFound(format!("章节 {}", chapter_id)));
        }
        Ok(())
    }

    /// 写入卡片
    pub fn insert_card(&self, card: &Card) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cards (id, chapter_id, card_heading, card_content) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![card.id, card.chapter_id, card.heading, card.content],
        )?;
        Ok(())
    }

    fn query_summary(&self, chapter_id: &str) -> Result<Option<ChapterSummary>> {
        let conn = self.lock()?;
        let metadata: Option<Option<String>> = conn
            .query_row(
                "SELECT metadata FROM chapter_contents WHERE id = ?1",
                [chapter_id],
                |row| row.get(0),
            )
            .optional()?;
        match metadata.flatten() {
            Some(raw) => Ok(ChapterSummary::from_metadata(serde_json::Value::String(raw))?),
            None => Ok(None),
        }
    }

    fn query_cards(&self, chapter_id: &str) -> Result<Vec<Card>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, chapter_id, card_heading, card_content
             FROM cards WHERE chapter_id = ?1 ORDER BY rowid ASC",
        )?;
        let cards = stmt
            .query_map([chapter_id], |row| {
                let heading: Option<String> = row.get(2)?;
                let content: Option<String> = row.get(3)?;
                Ok(Card {
                    id: row.get(0)?,
                    chapter_id: row.get(1)?,
                    heading: heading.unwrap_or_default(),
                    content: content.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cards)
    }

    fn query_status(&self, book_id: &str) -> Result<Option<BookStatus>> {
        let conn = self.lock()?;
        let status: Option<Option<String>> = conn
            .query_row("SELECT status FROM books WHERE Id = ?1", [book_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(status.map(|s| BookStatus::from_db(s.as_deref())))
    }

    fn query_chapters(&self, book_id: &str) -> Result<Vec<Chapter>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, book_id, chapter_title, created_at
             FROM chapter_contents WHERE book_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;

        let chapters = stmt
            .query_map([book_id], |row| {
                Ok(Chapter {
                    id: row.get(0)?,
                    book_id: row.get(1)?,
                    title: row.get(2)?,
                    created_at: decode_time(3, row.get(3)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(chapters)
    }

    fn query_content(&self, chapter_id: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let content: Option<Option<String>> = conn
            .query_row(
                "SELECT content FROM chapter_contents WHERE id = ?1",
                [chapter_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content.flatten())
    }

    // ==================== Progress 操作 ====================

    fn upsert_progress(&self, p: &ReadingProgress) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO user_progress
                (user_id, book_id, chapter_id, card_id, card_number, total_cards, last_read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, chapter_id) DO UPDATE SET
                book_id = excluded.book_id,
                card_id = excluded.card_id,
                card_number = excluded.card_number,
                total_cards = excluded.total_cards,
                last_read_at = excluded.last_read_at",
            rusqlite::params![
                p.user_id,
                p.book_id,
                p.chapter_id,
                p.card_id,
                p.card_number,
                p.total_cards,
                encode_time(&p.last_read_at)
            ],
        )?;
        Ok(())
    }

    fn query_progress(&self, user_id: &str) -> Result<Vec<ProgressRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT book_id, last_read_at FROM user_progress
             WHERE user_id = ?1 ORDER BY last_read_at DESC",
        )?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok(ProgressRow {
                    book_id: row.get(0)?,
                    last_read_at: decode_time(1, row.get(1)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// 读取单条进度
    pub fn get_progress(&self, user_id: &str, chapter_id: &str) -> Result<Option<ReadingProgress>> {
        let conn = self.lock()?;
        let progress = conn
            .query_row(
                "SELECT user_id, book_id, chapter_id, card_id, card_number, total_cards, last_read_at
                 FROM user_progress WHERE user_id = ?1 AND chapter_id = ?2",
                [user_id, chapter_id],
                |row| {
                    Ok(ReadingProgress {
                        user_id: row.get(0)?,
                        book_id: row.get(1)?,
                        chapter_id: row.get(2)?,
                        card_id: row.get(3)?,
                        card_number: row.get(4)?,
                        total_cards: row.get(5)?,
                        last_read_at: decode_time(6, row.get(6)?)?,
                    })
                },
            )
            .optional()?;
        Ok(progress)
    }
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    async fn fetch_book_status(&self, book_id: &str) -> Result<Option<BookStatus>> {
        self.query_status(book_id)
    }

    async fn fetch_chapters(&self, book_id: &str) -> Result<Vec<Chapter>> {
        self.query_chapters(book_id)
    }

    async fn fetch_chapter_content(&self, chapter_id: &str) -> Result<Option<String>> {
        self.query_content(chapter_id)
    }
}

#[async_trait]
impl LibraryStore for SqliteContentStore {
    async fn books_by_category(&self, category_id: &str) -> Result<Vec<Book>> {
        self.query_books(
            &format!("SELECT {} FROM books WHERE category_id = ?1 ORDER BY rowid", BOOK_COLUMNS),
            category_id,
        )
    }

    async fn books_by_profession(&self, profession_id: &str) -> Result<Vec<Book>> {
        self.query_books(
            &format!("SELECT {} FROM books WHERE profession_id = ?1 ORDER BY rowid", BOOK_COLUMNS),
            profession_id,
        )
    }

    async fn fetch_chapter_summary(&self, chapter_id: &str) -> Result<Option<ChapterSummary>> {
        self.query_summary(chapter_id)
    }

    async fn fetch_cards(&self, chapter_id: &str) -> Result<Vec<Card>> {
        self.query_cards(chapter_id)
    }
}

#[async_trait]
impl ProgressStore for SqliteContentStore {
    async fn save_progress(&self, progress: &ReadingProgress) -> Result<()> {
        self.upsert_progress(progress)
    }

    async fn fetch_progress_rows(&self, user_id: &str) -> Result<Vec<ProgressRow>> {
        self.query_progress(user_id)
    }
}
