use std::io::{self, IsTerminal};
use tracing_subscriber::EnvFilter;

/// tracingサブスクライバーを初期化
///
/// `RUST_LOG` が設定されていればそれを優先し、なければ
/// `-v` の有無で info / debug を切り替える。出力先は標準エラー
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // 二重初期化（テストなど）は無視する
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .try_init();
}
