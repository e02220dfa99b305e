//! 书籍可用性协调模块
//!
//! 外部导入任务异步生成章节期间，定时读取内容库并与本地已知状态对账：
//! 逐步呈现新章节，在状态变为 done 时恰好停止一次。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chapter_order::compute_chapter_ordinals;
use crate::error::Result;
use crate::models::{BookStatus, Chapter, IngestionRequest, OrderedChapter};
use crate::store::ContentStore;
use crate::trigger::IngestionTrigger;

/// 会话状态
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 无需轮询（未请求，或首次读取时已完成）
    Idle,
    /// 已触发导入，等待书籍行出现
    Requested,
    /// 轮询中
    Processing,
    /// 终态：处理完成
    Done,
    /// 终态：超过最长轮询时间
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::TimedOut)
    }
}

/// 轮询策略
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// 基础间隔
    pub interval: Duration,
    /// 最长轮询时间，None 表示不限
    pub max_duration: Option<Duration>,
    /// 连续失败时的退避倍数，1.0 表示固定间隔
    pub backoff_multiplier: f64,
    /// 退避上限
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_duration: Some(Duration::from_secs(30 * 60)),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl PollPolicy {
    /// 计算下一次等待时间
    ///
    /// 成功的 tick 重置为基础间隔；失败的 tick 按倍数退避，不超过上限
    pub fn next_delay(&self, current: Duration, tick_failed: bool) -> Duration {
        if !tick_failed {
            return self.interval;
        }
        let ceiling = self.max_interval.max(self.interval);
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            return ceiling;
        };
        Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
            .unwrap_or(ceiling)
            .min(ceiling)
    }
}

/// 协调事件
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileEvent {
    StateChanged {
        book_id: String,
        from: SessionState,
        to: SessionState,
    },
    /// `added` 只包含本次新出现的章节，`chapters` 是完整列表
    NewChapters {
        book_id: String,
        added: Vec<OrderedChapter>,
        chapters: Vec<OrderedChapter>,
    },
    ProcessingComplete {
        book_id: String,
        chapters: Vec<OrderedChapter>,
    },
    TimedOut {
        book_id: String,
        elapsed_secs: u64,
    },
}

/// 单次 tick 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// 会话已停止/已终结，或已有 tick 在执行
    Skipped,
    /// 内容库读取失败，状态未变
    Failed,
    /// 书籍行尚不存在
    Waiting,
    Unchanged,
    NewChapters(usize),
    Completed,
    TimedOut,
}

impl TickOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TickOutcome::Completed | TickOutcome::TimedOut)
    }
}

/// 打开书籍时的首次读取结果
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// 已完成，直接返回最终章节列表，不轮询
    Available(Vec<OrderedChapter>),
    /// 正在处理，已开始轮询；附带当前已有章节
    Processing(Vec<OrderedChapter>),
    /// 书籍不存在或尚未请求
    NotRequested,
}

/// 会话快照
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub book_id: String,
    pub state: SessionState,
    pub polling: bool,
    pub chapters: Vec<OrderedChapter>,
}

/// 对账会话
///
/// 纯状态，不做 IO。已知章节集合只由 tick 修改。
#[derive(Debug)]
pub struct ReconciliationSession {
    book_id: String,
    state: SessionState,
    known_ids: HashSet<String>,
    chapters: Vec<Chapter>,
    stopped: bool,
}

impl ReconciliationSession {
    pub fn new(book_id: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            state: SessionState::Idle,
            known_ids: HashSet::new(),
            chapters: Vec::new(),
            stopped: false,
        }
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn known_ids(&self) -> &HashSet<String> {
        &self.known_ids
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// 已停止或已到终态
    pub fn is_closed(&self) -> bool {
        self.stopped || self.state.is_terminal()
    }

    pub fn ordered_chapters(&self) -> Vec<OrderedChapter> {
        compute_chapter_ordinals(&self.chapters)
    }

    fn transition(&mut self, to: SessionState, events: &mut Vec<ReconcileEvent>) {
        if self.state == to {
            return;
        }
        tracing::info!(book_id = %self.book_id, from = ?self.state, to = ?to, "会话状态变更");
        events.push(ReconcileEvent::StateChanged {
            book_id: self.book_id.clone(),
            from: self.state,
            to,
        });
        self.state = to;
    }

    pub fn mark_requested(&mut self) -> Vec<ReconcileEvent> {
        let mut events = Vec::new();
        self.transition(SessionState::Requested, &mut events);
        events
    }

    pub fn mark_processing(&mut self) -> Vec<ReconcileEvent> {
        let mut events = Vec::new();
        self.transition(SessionState::Processing, &mut events);
        events
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// 合并章节行
    ///
    /// 按 id 做集合差，返回新出现的章节（带序号）。
    /// 已知章节即使本次未返回也保留，客户端视图只增不减。
    pub fn merge_chapters(&mut self, rows: Vec<Chapter>) -> Vec<OrderedChapter> {
        let incoming: HashSet<&str> = rows.iter().map(|c| c.id.as_str()).collect();
        let missing = self
            .known_ids
            .iter()
            .filter(|id| !incoming.contains(id.as_str()))
            .count();
        if missing > 0 {
            tracing::warn!(book_id = %self.book_id, missing, "内容库返回的章节少于已知章节，保留已知章节");
        }

        let mut added_ids = HashSet::new();
        for row in rows {
            if self.known_ids.insert(row.id.clone()) {
                added_ids.insert(row.id.clone());
                self.chapters.push(row);
            }
        }

        if added_ids.is_empty() {
            return Vec::new();
        }
        self.ordered_chapters()
            .into_iter()
            .filter(|c| added_ids.contains(&c.chapter.id))
            .collect()
    }

    /// 应用一次成功的读取（状态 + 章节）
    pub fn observe(&mut self, status: BookStatus, rows: Vec<Chapter>) -> (TickOutcome, Vec<ReconcileEvent>) {
        let mut events = Vec::new();

        // 行已出现即说明任务已受理，不论状态值
        if matches!(self.state, SessionState::Idle | SessionState::Requested) {
            self.transition(SessionState::Processing, &mut events);
        }

        let added = self.merge_chapters(rows);
        let added_count = added.len();
        if added_count > 0 {
            events.push(ReconcileEvent::NewChapters {
                book_id: self.book_id.clone(),
                added,
                chapters: self.ordered_chapters(),
            });
        }

        if status.is_done() {
            self.transition(SessionState::Done, &mut events);
            events.push(ReconcileEvent::ProcessingComplete {
                book_id: self.book_id.clone(),
                chapters: self.ordered_chapters(),
            });
            return (TickOutcome::Completed, events);
        }

        let outcome = if added_count > 0 {
            TickOutcome::NewChapters(added_count)
        } else {
            TickOutcome::Unchanged
        };
        (outcome, events)
    }

    pub fn time_out(&mut self, elapsed: Duration) -> Vec<ReconcileEvent> {
        let mut events = Vec::new();
        self.transition(SessionState::TimedOut, &mut events);
        events.push(ReconcileEvent::TimedOut {
            book_id: self.book_id.clone(),
            elapsed_secs: elapsed.as_secs(),
        });
        events
    }
}

#[derive(Default)]
struct PollHandle {
    task: Option<JoinHandle<()>>,
    since: Option<Instant>,
}

/// tick 执行标记，析构时复位（tick future 被取消时也能复位）
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    book_id: String,
    store: Arc<dyn ContentStore>,
    trigger: Arc<dyn IngestionTrigger>,
    policy: PollPolicy,
    // 锁顺序：session 先于 poll
    session: Mutex<ReconciliationSession>,
    poll: Mutex<PollHandle>,
    events: mpsc::UnboundedSender<ReconcileEvent>,
    cancel: CancellationToken,
    tick_in_flight: AtomicBool,
}

/// 书籍可用性协调器
///
/// 由展示书籍的视图持有；析构时自动停止轮询。
/// 事件通过 `new` 返回的接收端送出。
pub struct BookAvailabilityReconciler {
    inner: Arc<Inner>,
}

impl BookAvailabilityReconciler {
    /// 创建协调器
    ///
    /// # 参数
    /// - `book_id`: 书籍 ID，会话期间不变
    /// - `store`: 内容库
    /// - `trigger`: 导入触发器
    /// - `policy`: 轮询策略
    ///
    /// # 返回
    /// 协调器与事件接收端
    pub fn new(
        book_id: impl Into<String>,
        store: Arc<dyn ContentStore>,
        trigger: Arc<dyn IngestionTrigger>,
        policy: PollPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ReconcileEvent>) {
        let book_id = book_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            session: Mutex::new(ReconciliationSession::new(book_id.clone())),
            book_id,
            store,
            trigger,
            policy,
            poll: Mutex::new(PollHandle::default()),
            events: tx,
            cancel: CancellationToken::new(),
            tick_in_flight: AtomicBool::new(false),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn book_id(&self) -> &str {
        &self.inner.book_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_session().state()
    }

    pub fn is_polling(&self) -> bool {
        let session = self.inner.lock_session();
        if session.is_closed() {
            return false;
        }
        let poll = self.inner.lock_poll();
        poll.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let polling = self.is_polling();
        let session = self.inner.lock_session();
        SessionSnapshot {
            book_id: session.book_id().to_string(),
            state: session.state(),
            polling,
            chapters: session.ordered_chapters(),
        }
    }

    /// 打开书籍：首次直接读取
    ///
    /// done 直接返回最终章节；processing 开始轮询并立即对账一次；
    /// 其余情况返回 NotRequested，由调用方决定是否请求导入。
    /// 这里的读取错误直接返回给调用方。
    pub async fn open(&self) -> Result<OpenOutcome> {
        let inner = &self.inner;
        match inner.store.fetch_book_status(&inner.book_id).await? {
            Some(BookStatus::Done) => {
                let rows = inner.store.fetch_chapters(&inner.book_id).await?;
                let mut session = inner.lock_session();
                session.merge_chapters(rows);
                Ok(OpenOutcome::Available(session.ordered_chapters()))
            }
            Some(BookStatus::Processing) => {
                self.start_polling();
                self.tick().await;
                Ok(OpenOutcome::Processing(
                    inner.lock_session().ordered_chapters(),
                ))
            }
            Some(BookStatus::NotRequested) | None => Ok(OpenOutcome::NotRequested),
        }
    }

    /// 请求导入
    ///
    /// 每次调用触发一次外部导入，不等待完成。触发失败只记录日志，轮询照常开始：
    /// 进度的唯一依据是内容库。
    pub async fn request_ingestion(&self, request: &IngestionRequest) {
        let inner = &self.inner;
        {
            let mut session = inner.lock_session();
            if session.is_closed() || session.state() == SessionState::Processing {
                tracing::info!(book_id = %inner.book_id, state = ?session.state(), "会话已在处理或已结束，忽略导入请求");
                return;
            }
            let events = session.mark_requested();
            inner.emit(events);
        }

        if let Err(e) = inner.trigger.trigger(&inner.book_id, request).await {
            tracing::warn!(book_id = %inner.book_id, error = %e, "导入触发失败，仍开始轮询");
        }

        self.start_polling();
    }

    /// 开始轮询
    ///
    /// 已在轮询时无操作；会话已停止或已终结时无操作。
    /// 从 idle 调用表示调用方已知任务在进行，直接进入 processing。
    /// 必须在 tokio 运行时内调用。
    pub fn start_polling(&self) {
        let inner = &self.inner;
        let mut session = inner.lock_session();
        if session.is_closed() {
            tracing::debug!(book_id = %inner.book_id, "会话已关闭，不再轮询");
            return;
        }
        let mut poll = inner.lock_poll();
        if poll.task.is_some() {
            return;
        }

        if session.state() == SessionState::Idle {
            let events = session.mark_processing();
            inner.emit(events);
        }

        poll.since = Some(Instant::now());
        poll.task = Some(tokio::spawn(Arc::clone(inner).poll_loop()));
        tracing::info!(book_id = %inner.book_id, interval_ms = inner.policy.interval.as_millis() as u64, "开始轮询");
    }

    /// 停止轮询
    ///
    /// 可重复调用，任何状态下都安全。返回后不会再有 tick 修改状态或发出事件。
    pub fn stop_polling(&self) {
        self.inner.stop();
    }

    /// 手动执行一次对账
    ///
    /// 界面发起的刷新也走这里，避免出现第二份章节状态
    pub async fn tick(&self) -> TickOutcome {
        self.inner.tick().await
    }
}

impl Drop for BookAvailabilityReconciler {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, ReconciliationSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_poll(&self) -> MutexGuard<'_, PollHandle> {
        self.poll.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<ReconcileEvent>) {
        for event in events {
            if self.events.send(event).is_err() {
                tracing::debug!(book_id = %self.book_id, "事件接收端已关闭");
                break;
            }
        }
    }

    fn stop(&self) {
        let mut session = self.lock_session();
        let already = session.is_stopped();
        session.stop();
        self.cancel.cancel();
        if let Some(task) = self.lock_poll().task.take() {
            task.abort();
        }
        if !already {
            tracing::info!(book_id = %self.book_id, state = ?session.state(), "停止轮询");
        }
    }

    fn deadline_exceeded(&self) -> Option<Duration> {
        let max = self.policy.max_duration?;
        let since = self.lock_poll().since?;
        let elapsed = since.elapsed();
        (elapsed >= max).then_some(elapsed)
    }

    async fn tick(&self) -> TickOutcome {
        let Some(_in_flight) = InFlight::acquire(&self.tick_in_flight) else {
            tracing::debug!(book_id = %self.book_id, "上一次 tick 尚未结束，跳过");
            return TickOutcome::Skipped;
        };

        if self.lock_session().is_closed() {
            return TickOutcome::Skipped;
        }

        if let Some(elapsed) = self.deadline_exceeded() {
            let mut session = self.lock_session();
            if session.is_closed() {
                return TickOutcome::Skipped;
            }
            tracing::warn!(book_id = %self.book_id, elapsed_secs = elapsed.as_secs(), "超过最长轮询时间");
            let events = session.time_out(elapsed);
            self.cancel.cancel();
            self.emit(events);
            return TickOutcome::TimedOut;
        }

        let status = match self.store.fetch_book_status(&self.book_id).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::debug!(book_id = %self.book_id, "书籍行尚未出现");
                return TickOutcome::Waiting;
            }
            Err(e) => {
                tracing::warn!(book_id = %self.book_id, error = %e, "读取书籍状态失败，跳过本次 tick");
                return TickOutcome::Failed;
            }
        };

        // done 之后的这次读取即最终章节列表
        let rows = match self.store.fetch_chapters(&self.book_id).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(book_id = %self.book_id, error = %e, "读取章节失败，跳过本次 tick");
                return TickOutcome::Failed;
            }
        };

        let mut session = self.lock_session();
        if session.is_closed() {
            return TickOutcome::Skipped;
        }
        let (outcome, events) = session.observe(status, rows);
        tracing::debug!(book_id = %self.book_id, ?outcome, known = session.known_ids().len(), "tick 完成");
        if outcome.is_terminal() {
            self.cancel.cancel();
        }
        self.emit(events);
        outcome
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut delay = self.policy.interval;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = self.tick().await;
            if outcome.is_terminal() || self.cancel.is_cancelled() {
                break;
            }
            delay = self.policy.next_delay(delay, outcome == TickOutcome::Failed);
        }
        tracing::debug!(book_id = %self.book_id, "轮询任务退出");
    }
}
