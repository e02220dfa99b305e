use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// 作者缺省值
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

/// 书籍处理状态
///
/// 状态只由外部导入任务修改，客户端只读
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    /// 尚未请求导入
    NotRequested,
    /// 导入任务进行中，章节陆续写入
    Processing,
    /// 终态，章节集合已封闭
    Done,
}

impl BookStatus {
    /// 从数据库中的原始字符串解析状态
    ///
    /// 空值视为未请求；无法识别的非空值视为进行中（行已存在，任务大概率在跑）
    pub fn from_db(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => BookStatus::NotRequested,
            Some(s) if s.eq_ignore_ascii_case("not_requested") => BookStatus::NotRequested,
            Some(s) if s.eq_ignore_ascii_case("done") => BookStatus::Done,
            Some(s) if s.eq_ignore_ascii_case("processing") => BookStatus::Processing,
            Some(other) => {
                tracing::warn!(status = other, "未知的书籍状态，按 processing 处理");
                BookStatus::Processing
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::NotRequested => "not_requested",
            BookStatus::Processing => "processing",
            BookStatus::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, BookStatus::Done)
    }
}

/// 书籍
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Book {
    #[serde(rename = "Id", deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Author", default)]
    pub author: Option<String>,
    #[serde(default, alias = "Mirror_2")]
    pub source_url: Option<String>,
    #[serde(default, deserialize_with = "status_from_any")]
    pub status: BookStatus,
    #[serde(default, deserialize_with = "opt_id_from_any")]
    pub category_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id_from_any")]
    pub profession_id: Option<String>,
}

impl Default for BookStatus {
    fn default() -> Self {
        BookStatus::NotRequested
    }
}

/// 章节行
///
/// `chapter_number` 等客户端计数一律不参与排序，顺序只看 `created_at`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Chapter {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(deserialize_with = "id_from_any")]
    pub book_id: String,
    #[serde(rename = "chapter_title", default, deserialize_with = "string_or_empty")]
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// 带序号的章节（序号从 1 开始）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OrderedChapter {
    pub ordinal: usize,
    #[serde(flatten)]
    pub chapter: Chapter,
}

/// 导入请求
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IngestionRequest {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    pub source_url: String,
}

impl IngestionRequest {
    pub fn new(title: impl Into<String>, author: Option<String>, source_url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author,
            source_url: source_url.into(),
        }
    }

    /// 作者为空或缺失时返回 "Unknown Author"
    pub fn author_or_default(&self) -> &str {
        match self.author.as_deref().map(str::trim) {
            Some(a) if !a.is_empty() => a,
            _ => UNKNOWN_AUTHOR,
        }
    }
}

/// 阅读进度
///
/// 每个 (user_id, chapter_id) 只保留一条记录
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReadingProgress {
    pub user_id: String,
    pub book_id: String,
    pub chapter_id: String,
    #[serde(default)]
    pub card_id: Option<String>,
    #[serde(default)]
    pub card_number: Option<i64>,
    #[serde(default)]
    pub total_cards: Option<i64>,
    pub last_read_at: DateTime<Utc>,
}

/// 进度行（只取最近阅读查询需要的字段）
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ProgressRow {
    #[serde(deserialize_with = "id_from_any")]
    pub book_id: String,
    pub last_read_at: DateTime<Utc>,
}

/// 标识符既可能是数字也可能是字符串，统一成字符串
pub fn id_from_any<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("无效的标识符: {}", other))),
    }
}

pub fn opt_id_from_any<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!("无效的标识符: {}", other))),
    }
}

/// null 视为空字符串
fn string_or_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn status_from_any<'de, D>(deserializer: D) -> std::result::Result<BookStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(BookStatus::from_db(raw.as_deref()))
}

/// 仅包含状态字段的行（`select=status`）
#[derive(Deserialize, Debug, Clone)]
pub struct StatusRow {
    #[serde(default, deserialize_with = "status_from_any")]
    pub status: BookStatus,
}

/// 章节卡片（`cards` 表）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Card {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(deserialize_with = "id_from_any")]
    pub chapter_id: String,
    #[serde(rename = "card_heading", default, deserialize_with = "string_or_empty")]
    pub heading: String,
    #[serde(rename = "card_content", default, deserialize_with = "string_or_empty")]
    pub content: String,
}

/// 问答对
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct QaPair {
    pub index: String,
    pub question: String,
    pub answer: String,
}

/// 章节摘要
///
/// 由外部服务写入 `chapter_contents.metadata`，客户端只解析
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct ChapterSummary {
    pub key_themes: Option<String>,
    pub case_studies: Option<String>,
    pub questions: Vec<QaPair>,
    pub deeper_questions: Vec<QaPair>,
}

#[derive(Deserialize)]
struct RawSummary {
    #[serde(rename = "Key_Themes", default)]
    key_themes: Option<serde_json::Value>,
    #[serde(rename = "Case_Studies", default)]
    case_studies: Option<serde_json::Value>,
    #[serde(rename = "QUADs", default)]
    quads: Option<serde_json::Value>,
    #[serde(rename = "Deeper_QUADs", default)]
    deeper_quads: Option<serde_json::Value>,
}

fn text_of(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// 从 `Question_N` / `Answer_N` 键中配对，缺少答案的问题丢弃，按 N 排序
fn qa_pairs(value: Option<serde_json::Value>) -> Vec<QaPair> {
    let Some(serde_json::Value::Object(map)) = value else {
        return Vec::new();
    };

    let mut pairs: Vec<QaPair> = map
        .iter()
        .filter_map(|(key, question)| {
            let index = key.strip_prefix("Question_")?;
            let answer = text_of(map.get(&format!("Answer_{}", index)).cloned())?;
            let question = text_of(Some(question.clone()))?;
            Some(QaPair {
                index: index.to_string(),
                question,
                answer,
            })
        })
        .collect();

    pairs.sort_by(|a, b| {
        let key = |p: &QaPair| (p.index.parse::<u32>().unwrap_or(u32::MAX), p.index.clone());
        key(a).cmp(&key(b))
    });
    pairs
}

impl ChapterSummary {
    /// 解析 metadata 列
    ///
    /// 列值可能是 JSON 对象，也可能是 JSON 字符串；null 或空串表示摘要尚未生成
    pub fn from_metadata(value: serde_json::Value) -> serde_json::Result<Option<Self>> {
        let value = match value {
            serde_json::Value::Null => return Ok(None),
            serde_json::Value::String(raw) if raw.trim().is_empty() => return Ok(None),
            serde_json::Value::String(raw) => serde_json::from_str(&raw)?,
            other => other,
        };
        let raw: RawSummary = serde_json::from_value(value)?;
        Ok(Some(Self {
            key_themes: text_of(raw.key_themes),
            case_studies: text_of(raw.case_studies),
            questions: qa_pairs(raw.quads),
            deeper_questions: qa_pairs(raw.deeper_quads),
        }))
    }
}
