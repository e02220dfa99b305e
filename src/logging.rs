use tracing_subscriber::EnvFilter;

/// 默认日志级别，可用 RUST_LOG 覆盖
pub const DEFAULT_FILTER: &str = "summary_reader=info,summary_reader_lib=info";

/// 初始化日志
///
/// 只应在二进制入口调用一次；重复调用会被忽略
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "summary_reader=debug,summary_reader_lib=debug"
    } else {
        DEFAULT_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
