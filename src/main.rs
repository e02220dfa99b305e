use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use summary_reader_lib::chapter_order::Direction;
use summary_reader_lib::commands::{self, BookFilter, ReaderContext};
use summary_reader_lib::models::ChapterSummary;
use summary_reader_lib::store::RECENT_BOOKS_LIMIT;
use summary_reader_lib::{
    logging, IngestionRequest, ReaderConfig, ReaderError, ReadingProgress, Result,
};

#[derive(Parser, Debug)]
#[command(name = "summary-reader", version, about = "书籍导入监视与阅读进度工具")]
struct Cli {
    /// 配置文件（TOML）
    #[arg(short, long, env = "READER_CONFIG")]
    config: Option<PathBuf>,

    /// 输出调试日志
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 监视处理中的书籍，直到完成或超时
    Watch { book_id: String },
    /// 请求导入书籍并监视
    Request {
        #[arg(long)]
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        url: String,
    },
    /// 列出章节
    Chapters { book_id: String },
    /// 输出章节正文
    Read { chapter_id: String },
    /// 相邻章节
    Next {
        book_id: String,
        chapter_id: String,
        #[arg(long)]
        previous: bool,
    },
    /// 按分类或职业浏览书籍
    #[command(group(ArgGroup::new("filter").required(true).multiple(false).args(["category", "profession"])))]
    Books {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        profession: Option<String>,
    },
    /// 章节摘要，尚未生成时请求生成
    Summary {
        chapter_id: String,
        /// 只读取，不请求生成
        #[arg(long)]
        no_generate: bool,
    },
    /// 章节卡片
    Cards {
        chapter_id: String,
        /// 只显示第 N 张（1 起）
        #[arg(long)]
        card: Option<usize>,
    },
    /// 保存阅读进度
    Progress {
        #[arg(long)]
        user: String,
        #[arg(long)]
        book: String,
        #[arg(long)]
        chapter: String,
        #[arg(long)]
        card: Option<String>,
        #[arg(long)]
        card_number: Option<i64>,
        #[arg(long)]
        total_cards: Option<i64>,
    },
    /// 最近阅读的书籍
    Recent {
        user: String,
        #[arg(long, default_value_t = RECENT_BOOKS_LIMIT)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "命令执行失败");
            eprintln!("错误: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ReaderConfig::load(cli.config.as_deref())?;
    let ctx = ReaderContext::from_config(&config)?;

    match cli.command {
        Command::Watch { book_id } => watch(&ctx, &book_id, None).await,
        Command::Request {
            id,
            title,
            author,
            url,
        } => {
            let request = IngestionRequest::new(title, author, url);
            watch(&ctx, &id, Some(&request)).await
        }
        Command::Chapters { book_id } => {
            for c in commands::list_chapters(&ctx, &book_id).await? {
                println!("{:>3}  {}  {}", c.ordinal, c.chapter.id, c.chapter.title);
            }
            Ok(())
        }
        Command::Read { chapter_id } => {
            println!("{}", commands::read_chapter(&ctx, &chapter_id).await?);
            Ok(())
        }
        Command::Next {
            book_id,
            chapter_id,
            previous,
        } => {
            let direction = if previous {
                Direction::Previous
            } else {
                Direction::Next
            };
            match commands::neighbor_chapter(&ctx, &book_id, &chapter_id, direction).await? {
                Some(c) => println!("{}  {}  {}", c.ordinal, c.chapter.id, c.chapter.title),
                None => println!("没有更多章节"),
            }
            Ok(())
        }
        Command::Books {
            category,
            profession,
        } => {
            let filter = match (category, profession) {
                (Some(id), _) => BookFilter::Category(id),
                (None, Some(id)) => BookFilter::Profession(id),
                (None, None) => {
                    return Err(ReaderError::Config("需要 --category 或 --profession".to_string()))
                }
            };
            for book in commands::browse_books(&ctx, &filter).await? {
                println!(
                    "{}  {}  {}  [{}]",
                    book.id,
                    book.title,
                    book.author.as_deref().unwrap_or("-"),
                    book.status.as_str()
                );
            }
            Ok(())
        }
        Command::Summary {
            chapter_id,
            no_generate,
        } => {
            match commands::chapter_summary(&ctx, &chapter_id, !no_generate).await? {
                Some(summary) => print_summary(&summary),
                None => println!("摘要尚未生成"),
            }
            Ok(())
        }
        Command::Cards { chapter_id, card } => match card {
            Some(n) => {
                let view = commands::open_card(&ctx, &chapter_id, n.saturating_sub(1)).await?;
                println!("卡片 {} / {}", view.index + 1, view.total);
                println!("{}\n{}", view.card.heading, view.card.content);
                Ok(())
            }
            None => {
                let cards = commands::chapter_cards(&ctx, &chapter_id).await?;
                for (i, c) in cards.iter().enumerate() {
                    println!("{:>3}  {}  {}", i + 1, c.id, c.heading);
                }
                Ok(())
            }
        },
        Command::Progress {
            user,
            book,
            chapter,
            card,
            card_number,
            total_cards,
        } => {
            let progress = ReadingProgress {
                user_id: user,
                book_id: book,
                chapter_id: chapter,
                card_id: card,
                card_number,
                total_cards,
                last_read_at: Utc::now(),
            };
            commands::save_progress(&ctx, &progress).await
        }
        Command::Recent { user, limit } => {
            for book_id in commands::recent_books(&ctx, &user, limit).await? {
                println!("{}", book_id);
            }
            Ok(())
        }
    }
}

fn print_summary(summary: &ChapterSummary) {
    if let Some(themes) = &summary.key_themes {
        println!("关键主题\n{}\n", themes);
    }
    if let Some(cases) = &summary.case_studies {
        println!("案例\n{}\n", cases);
    }
    for (title, pairs) in [("关键问答", &summary.questions), ("深入分析", &summary.deeper_questions)] {
        if pairs.is_empty() {
            continue;
        }
        println!("{}", title);
        for qa in pairs {
            println!("Q{}: {}\nA: {}", qa.index, qa.question, qa.answer);
        }
        println!();
    }
}

/// 事件以 JSON 行输出
async fn watch(ctx: &ReaderContext, book_id: &str, request: Option<&IngestionRequest>) -> Result<()> {
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "无法监听中断信号");
            std::future::pending::<()>().await;
        }
    };

    let snapshot = commands::watch_book(ctx, book_id, request, shutdown, |event| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "事件序列化失败"),
        }
    })
    .await?;

    println!("{}", serde_json::to_string(&snapshot)?);
    Ok(())
}
