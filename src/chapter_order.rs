// 章节排序与导航
// 序号只由创建时间决定，不信任任何客户端计数

use crate::models::{Chapter, OrderedChapter};
use serde::{Deserialize, Serialize};

/// 翻页方向
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Next,
    Previous,
}

/// 计算章节序号
///
/// 按 `created_at` 升序排列，时间相同时按 id 排序，序号从 1 开始。
/// 上游按写入顺序分配时间戳，因此对增长中的前缀重复调用不会改变已分配的序号。
pub fn compute_chapter_ordinals(chapters: &[Chapter]) -> Vec<OrderedChapter> {
    let mut sorted: Vec<&Chapter> = chapters.iter().collect();
    sorted.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    sorted
        .into_iter()
        .enumerate()
        .map(|(i, chapter)| OrderedChapter {
            ordinal: i + 1,
            chapter: chapter.clone(),
        })
        .collect()
}

/// 查找相邻章节
///
/// # 参数
/// - `chapters`: 已排序的章节列表
/// - `current_id`: 当前章节 ID
/// - `direction`: 翻页方向
///
/// # 返回
/// 相邻章节；当前章节不存在或已到首/尾时返回 None
pub fn adjacent_chapter<'a>(
    chapters: &'a [OrderedChapter],
    current_id: &str,
    direction: Direction,
) -> Option<&'a OrderedChapter> {
    let current = chapters.iter().find(|c| c.chapter.id == current_id)?;
    let target = match direction {
        Direction::Next => current.ordinal + 1,
        Direction::Previous => current.ordinal.checked_sub(1)?,
    };
    chapters.iter().find(|c| c.ordinal == target)
}

/// 卡片翻页
///
/// `current` 为 0 起的卡片下标，越界或已到首/尾时返回 None
pub fn adjacent_card(total: usize, current: usize, direction: Direction) -> Option<usize> {
    if current >= total {
        return None;
    }
    match direction {
        Direction::Next => (current + 1 < total).then_some(current + 1),
        Direction::Previous => current.checked_sub(1),
    }
}
