use std::fs;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chapter_order::{adjacent_card, adjacent_chapter, compute_chapter_ordinals, Direction};
use crate::config::{ReaderConfig, StoreConfig};
use crate::error::{ReaderError, Result};
use crate::models::{
    Book, Card, ChapterSummary, IngestionRequest, OrderedChapter, ReadingProgress,
};
use crate::reconciler::{
    BookAvailabilityReconciler, OpenOutcome, PollPolicy, ReconcileEvent, SessionSnapshot,
};
use crate::store::{
    ContentStore, LibraryStore, ProgressStore, RestContentStore, SqliteContentStore,
};
use crate::trigger::{HttpIngestionTrigger, HttpSummaryTrigger, IngestionTrigger, SummaryTrigger};

/// 运行上下文：内容库、书目、进度存储、触发器与轮询策略
#[derive(Clone)]
pub struct ReaderContext {
    pub store: Arc<dyn ContentStore>,
    pub library: Arc<dyn LibraryStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub trigger: Arc<dyn IngestionTrigger>,
    pub summaries: Arc<dyn SummaryTrigger>,
    pub policy: PollPolicy,
}

impl ReaderContext {
    /// 根据配置构建上下文
    pub fn from_config(config: &ReaderConfig) -> Result<Self> {
        let trigger: Arc<dyn IngestionTrigger> =
            Arc::new(HttpIngestionTrigger::new(&config.ingestion.trigger_url)?);
        let summaries: Arc<dyn SummaryTrigger> =
            Arc::new(HttpSummaryTrigger::new(&config.ingestion.summary_url)?);
        let policy = config.polling.to_policy();

        match &config.store {
            StoreConfig::Rest { url, api_key } => {
                let store = Arc::new(RestContentStore::new(url, api_key.clone())?);
                Ok(Self {
                    store: store.clone(),
                    library: store.clone(),
                    progress: store,
                    trigger,
                    summaries,
                    policy,
                })
            }
            StoreConfig::Sqlite { path } => {
                // 确保目录存在
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let store = Arc::new(SqliteContentStore::open(path)?);
                Ok(Self {
                    store: store.clone(),
                    library: store.clone(),
                    progress: store,
                    trigger,
                    summaries,
                    policy,
                })
            }
        }
    }

    pub fn reconciler(
        &self,
        book_id: &str,
    ) -> (BookAvailabilityReconciler, mpsc::UnboundedReceiver<ReconcileEvent>) {
        BookAvailabilityReconciler::new(
            book_id,
            Arc::clone(&self.store),
            Arc::clone(&self.trigger),
            self.policy.clone(),
        )
    }
}

/// 监视书籍直到处理完成、超时或收到中断
///
/// # 参数
/// - `book_id`: 书籍 ID
/// - `request`: 书籍尚未导入时用于触发导入；为 None 时未导入的书籍返回错误
/// - `shutdown`: 完成时中断监视
/// - `on_event`: 每个协调事件的回调
///
/// # 返回
/// 结束时的会话快照
pub async fn watch_book<S, F>(
    ctx: &ReaderContext,
    book_id: &str,
    request: Option<&IngestionRequest>,
    shutdown: S,
    mut on_event: F,
) -> Result<SessionSnapshot>
where
    S: Future<Output = ()>,
    F: FnMut(&ReconcileEvent),
{
    let (reconciler, mut events) = ctx.reconciler(book_id);

    match reconciler.open().await? {
        OpenOutcome::Available(chapters) => {
            tracing::info!(book_id, chapters = chapters.len(), "书籍已可用");
            return Ok(reconciler.snapshot());
        }
        OpenOutcome::Processing(chapters) => {
            tracing::info!(book_id, chapters = chapters.len(), "书籍处理中，开始监视");
        }
        OpenOutcome::NotRequested => match request {
            Some(request) => reconciler.request_ingestion(request).await,
            None => {
                return Err(ReaderError::NotFound(format!(
                    "书籍 {} 尚未导入，请先请求导入",
                    book_id
                )))
            }
        },
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(book_id, "监视被中断");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                on_event(&event);
                if matches!(
                    event,
                    ReconcileEvent::ProcessingComplete { .. } | ReconcileEvent::TimedOut { .. }
                ) {
                    break;
                }
            }
        }
    }

    reconciler.stop_polling();
    Ok(reconciler.snapshot())
}

/// 读取书籍章节目录（带序号）
pub async fn list_chapters(ctx: &ReaderContext, book_id: &str) -> Result<Vec<OrderedChapter>> {
    let rows = ctx.store.fetch_chapters(book_id).await?;
    Ok(compute_chapter_ordinals(&rows))
}

/// 读取章节正文
pub async fn read_chapter(ctx: &ReaderContext, chapter_id: &str) -> Result<String> {
    ctx.store
        .fetch_chapter_content(chapter_id)
        .await?
        .ok_or_else(|| ReaderError::NotFound(format!("章节 {} 没有正文", chapter_id)))
}

/// 相邻章节
pub async fn neighbor_chapter(
    ctx: &ReaderContext,
    book_id: &str,
    chapter_id: &str,
    direction: Direction,
) -> Result<Option<OrderedChapter>> {
    let chapters = list_chapters(ctx, book_id).await?;
    Ok(adjacent_chapter(&chapters, chapter_id, direction).cloned())
}

/// 书目筛选
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookFilter {
    Category(String),
    Profession(String),
}

/// 按分类或职业浏览书籍
pub async fn browse_books(ctx: &ReaderContext, filter: &BookFilter) -> Result<Vec<Book>> {
    match filter {
        BookFilter::Category(id) => ctx.library.books_by_category(id).await,
        BookFilter::Profession(id) => ctx.library.books_by_profession(id).await,
    }
}

/// 读取章节摘要
///
/// # 参数
/// - `generate`: 摘要尚未生成时是否请求外部服务生成，请求后重新读取一次
///
/// # 返回
/// 摘要；仍未生成时返回 None
pub async fn chapter_summary(
    ctx: &ReaderContext,
    chapter_id: &str,
    generate: bool,
) -> Result<Option<ChapterSummary>> {
    if let Some(summary) = ctx.library.fetch_chapter_summary(chapter_id).await? {
        return Ok(Some(summary));
    }
    if !generate {
        return Ok(None);
    }

    // 生成失败不影响重新读取：可能已由其他请求生成
    if let Err(e) = ctx.summaries.request_summary(chapter_id).await {
        tracing::warn!(chapter_id, error = %e, "摘要生成请求失败");
    }
    ctx.library.fetch_chapter_summary(chapter_id).await
}

/// 卡片视图：当前卡片及前后位置
#[derive(Debug, Clone, PartialEq)]
pub struct CardView {
    pub card: Card,
    /// 0 起
    pub index: usize,
    pub total: usize,
    pub previous: Option<usize>,
    pub next: Option<usize>,
}

/// 读取章节的全部卡片
pub async fn chapter_cards(ctx: &ReaderContext, chapter_id: &str) -> Result<Vec<Card>> {
    ctx.library.fetch_cards(chapter_id).await
}

/// 打开第 `index` 张卡片（0 起）
pub async fn open_card(ctx: &ReaderContext, chapter_id: &str, index: usize) -> Result<CardView> {
    let mut cards = chapter_cards(ctx, chapter_id).await?;
    let total = cards.len();
    if index >= total {
        return Err(ReaderError::NotFound(format!(
            "章节 {} 没有第 {} 张卡片（共 {} 张）",
            chapter_id,
            index + 1,
            total
        )));
    }
    Ok(CardView {
        card: cards.swap_remove(index),
        index,
        total,
        previous: adjacent_card(total, index, Direction::Previous),
        next: adjacent_card(total, index, Direction::Next),
    })
}

pub async fn save_progress(ctx: &ReaderContext, progress: &ReadingProgress) -> Result<()> {
    ctx.progress.save_progress(progress).await
}

/// 最近阅读的书籍
pub async fn recent_books(ctx: &ReaderContext, user_id: &str, limit: usize) -> Result<Vec<String>> {
    ctx.progress.recent_book_ids(user_id, limit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookStatus, Chapter};
    use crate::reconciler::SessionState;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockTrigger {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl IngestionTrigger for MockTrigger {
        async fn trigger(&self, book_id: &str, request: &IngestionRequest) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((book_id.to_string(), request.author_or_default().to_string()));
            Ok(())
        }
    }

    // 请求摘要时写回 metadata，模拟外部摘要服务
    #[derive(Default)]
    struct MockSummaries {
        store: Option<Arc<SqliteContentStore>>,
        fail: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SummaryTrigger for MockSummaries {
        async fn request_summary(&self, chapter_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(chapter_id.to_string());
            if self.fail {
                return Err(ReaderError::Status {
                    status: 502,
                    url: "test://summary".to_string(),
                });
            }
            if let Some(store) = &self.store {
                store.set_chapter_metadata(
                    chapter_id,
                    &serde_json::json!({ "Key_Themes": "Generated" }),
                )?;
            }
            Ok(())
        }
    }

    fn context(store: Arc<SqliteContentStore>, trigger: Arc<MockTrigger>) -> ReaderContext {
        context_with_summaries(store, trigger, Arc::default())
    }

    fn context_with_summaries(
        store: Arc<SqliteContentStore>,
        trigger: Arc<MockTrigger>,
        summaries: Arc<MockSummaries>,
    ) -> ReaderContext {
        ReaderContext {
            store: store.clone(),
            library: store.clone(),
            progress: store,
            trigger,
            summaries,
            policy: PollPolicy::default(),
        }
    }

    fn book(id: &str, status: BookStatus) -> Book {
        Book {
            id: id.to_string(),
            title: "The Psychology of Money".to_string(),
            author: None,
            source_url: Some("https://example.test/money.epub".to_string()),
            status,
            category_id: None,
            profession_id: None,
        }
    }

    fn chapter(id: &str, book_id: &str, secs: i64) -> Chapter {
        Chapter {
            id: id.to_string(),
            book_id: book_id.to_string(),
            title: format!("Chapter {}", id),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_requests_and_follows_ingestion() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        let trigger = Arc::new(MockTrigger::default());
        let ctx = context(store.clone(), trigger.clone());

        // 模拟外部导入任务
        let producer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                store.insert_book(&book("B1", BookStatus::Processing)).unwrap();
                tokio::time::sleep(Duration::from_secs(4)).await;
                store.insert_chapter(&chapter("c1", "B1", 1), Some("one")).unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
                store.insert_chapter(&chapter("c2", "B1", 2), Some("two")).unwrap();
                store.set_book_status("B1", BookStatus::Done).unwrap();
            })
        };

        let request = IngestionRequest::new("The Psychology of Money", None, "https://example.test/money.epub");
        let mut seen = Vec::new();
        let snapshot = watch_book(&ctx, "B1", Some(&request), std::future::pending(), |e| {
            seen.push(e.clone())
        })
        .await
        .unwrap();
        producer.await.unwrap();

        assert_eq!(
            *trigger.calls.lock().unwrap(),
            vec![("B1".to_string(), "Unknown Author".to_string())]
        );
        assert_eq!(snapshot.state, SessionState::Done);
        assert!(!snapshot.polling);
        assert_eq!(snapshot.chapters.len(), 2);
        assert!(matches!(
            seen.last(),
            Some(ReconcileEvent::ProcessingComplete { chapters, .. }) if chapters.len() == 2
        ));
    }

    #[tokio::test]
    async fn test_watch_available_book_returns_immediately() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        store.insert_book(&book("B1", BookStatus::Done)).unwrap();
        store.insert_chapter(&chapter("c1", "B1", 1), None).unwrap();
        let ctx = context(store, Arc::default());

        let snapshot = watch_book(&ctx, "B1", None, std::future::pending(), |_| {})
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.chapters.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_unknown_book_without_request() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        let ctx = context(store, Arc::default());
        let result = watch_book(&ctx, "B404", None, std::future::pending(), |_| {}).await;
        assert!(matches!(result, Err(ReaderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_watch_interrupted_stops_polling() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        store.insert_book(&book("B1", BookStatus::Processing)).unwrap();
        let ctx = context(store, Arc::default());

        let snapshot = watch_book(&ctx, "B1", None, std::future::ready(()), |_| {})
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::Processing);
        assert!(!snapshot.polling);
    }

    #[tokio::test]
    async fn test_reading_commands() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        store.insert_book(&book("B1", BookStatus::Done)).unwrap();
        store.insert_chapter(&chapter("c2", "B1", 2), Some("second")).unwrap();
        store.insert_chapter(&chapter("c1", "B1", 1), Some("first")).unwrap();
        let ctx = context(store, Arc::default());

        let chapters = list_chapters(&ctx, "B1").await.unwrap();
        assert_eq!(chapters[0].chapter.id, "c1");
        assert_eq!(chapters[1].ordinal, 2);

        assert_eq!(read_chapter(&ctx, "c2").await.unwrap(), "second");
        assert!(read_chapter(&ctx, "missing").await.is_err());

        let next = neighbor_chapter(&ctx, "B1", "c1", Direction::Next).await.unwrap();
        assert_eq!(next.map(|c| c.chapter.id), Some("c2".to_string()));
        assert!(neighbor_chapter(&ctx, "B1", "c1", Direction::Previous)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_progress_commands() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        let ctx = context(store, Arc::default());

        for (i, (book_id, chapter_id)) in [("b1", "c1"), ("b2", "c5"), ("b1", "c2")].iter().enumerate() {
            let progress = ReadingProgress {
                user_id: "u1".to_string(),
                book_id: book_id.to_string(),
                chapter_id: chapter_id.to_string(),
                card_id: Some("card-1".to_string()),
                card_number: Some(1),
                total_cards: Some(4),
                last_read_at: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
            };
            save_progress(&ctx, &progress).await.unwrap();
        }

        assert_eq!(recent_books(&ctx, "u1", 5).await.unwrap(), vec!["b1", "b2"]);
        assert_eq!(recent_books(&ctx, "u1", 1).await.unwrap(), vec!["b1"]);
    }

    #[tokio::test]
    async fn test_browse_books() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        let mut b1 = book("B1", BookStatus::Done);
        b1.category_id = Some("finance".to_string());
        store.insert_book(&b1).unwrap();
        let mut b2 = book("B2", BookStatus::Done);
        b2.profession_id = Some("pm".to_string());
        store.insert_book(&b2).unwrap();
        let ctx = context(store, Arc::default());

        let finance = browse_books(&ctx, &BookFilter::Category("finance".to_string())).await.unwrap();
        assert_eq!(finance.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(), vec!["B1"]);
        let pm = browse_books(&ctx, &BookFilter::Profession("pm".to_string())).await.unwrap();
        assert_eq!(pm.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(), vec!["B2"]);
    }

    #[tokio::test]
    async fn test_summary_generated_on_demand() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        store.insert_chapter(&chapter("c1", "B1", 1), Some("text")).unwrap();
        let summaries = Arc::new(MockSummaries {
            store: Some(store.clone()),
            ..MockSummaries::default()
        });
        let ctx = context_with_summaries(store, Arc::default(), summaries.clone());

        assert_eq!(chapter_summary(&ctx, "c1", false).await.unwrap(), None);
        assert!(summaries.calls.lock().unwrap().is_empty());

        let summary = chapter_summary(&ctx, "c1", true).await.unwrap().unwrap();
        assert_eq!(summary.key_themes.as_deref(), Some("Generated"));
        assert_eq!(*summaries.calls.lock().unwrap(), vec!["c1".to_string()]);

        // 已有摘要时不再请求
        chapter_summary(&ctx, "c1", true).await.unwrap();
        assert_eq!(summaries.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_summary_request_failure_still_rereads() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        store.insert_chapter(&chapter("c1", "B1", 1), None).unwrap();
        let summaries = Arc::new(MockSummaries {
            fail: true,
            ..MockSummaries::default()
        });
        let ctx = context_with_summaries(store, Arc::default(), summaries.clone());

        assert_eq!(chapter_summary(&ctx, "c1", true).await.unwrap(), None);
        assert_eq!(summaries.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_card_navigation() {
        let store = Arc::new(SqliteContentStore::open_in_memory().unwrap());
        for (i, heading) in ["One", "Two", "Three"].iter().enumerate() {
            store
                .insert_card(&Card {
                    id: format!("k{}", i),
                    chapter_id: "c1".to_string(),
                    heading: heading.to_string(),
                    content: format!("body {}", i),
                })
                .unwrap();
        }
        let ctx = context(store, Arc::default());

        let first = open_card(&ctx, "c1", 0).await.unwrap();
        assert_eq!(first.card.heading, "One");
        assert_eq!((first.total, first.previous, first.next), (3, None, Some(1)));

        let last = open_card(&ctx, "c1", 2).await.unwrap();
        assert_eq!(last.card.heading, "Three");
        assert_eq!((last.previous, last.next), (Some(1), None));

        assert!(matches!(open_card(&ctx, "c1", 3).await, Err(ReaderError::NotFound(_))));
        assert!(matches!(open_card(&ctx, "empty", 0).await, Err(ReaderError::NotFound(_))));
    }

    #[test]
    fn test_context_from_sqlite_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReaderConfig {
            store: StoreConfig::Sqlite {
                path: dir.path().join("nested").join("library.db"),
            },
            ..ReaderConfig::default()
        };
        assert!(ReaderContext::from_config(&config).is_ok());
        assert!(dir.path().join("nested").join("library.db").exists());
    }
}
