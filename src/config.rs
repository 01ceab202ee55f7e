use std::env;
use std::path::{Path, PathBuf};

/// Ghidraのインストール先を指す環境変数（子プロセスにも引き継ぐ）
pub const GHIDRA_INSTALL_DIR_ENV: &str = "GHIDRA_INSTALL_DIR";

pub const DEFAULT_GHIDRA_INSTALL_DIR: &str = "/opt/ghidra";

/// Ghidraのインストール先を決定
///
/// 優先順位: `-G` > `$GHIDRA_INSTALL_DIR` > `/opt/ghidra`
pub fn ghidra_install_dir(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| {
            env::var_os(GHIDRA_INSTALL_DIR_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_GHIDRA_INSTALL_DIR))
}

/// キックスタート1回分の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickOptions {
    pub targets: Vec<String>,
    pub project_name: String,
    pub project_dir: Option<PathBuf>,
    pub sysroot: PathBuf,
    pub ghidra_install_dir: Option<PathBuf>,
    pub verbose: bool,

    // プロジェクト
    pub copy_to_project: bool,
    pub force_remove: bool,
    pub force_import: bool,
    pub remove_existing_binaries: bool,
    pub start_ghidra: bool,
    pub zip_project: bool,

    // 解析
    pub skip_dependency_import: bool,
    pub skip_target_analysis: bool,
    pub do_dependency_analysis: bool,
    pub do_target_decompilation: bool,
    /// 関数ごとのデコンパイルタイムアウト（秒、0は無制限）
    pub decompile_timeout: u32,

    // パス
    pub ignore_missing: bool,
}

impl KickOptions {
    /// 既定値（フラグはすべてオフ、sysrootは `/`）で作成
    pub fn new<S: Into<String>>(
        project_name: impl Into<String>,
        targets: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            project_name: project_name.into(),
            project_dir: None,
            sysroot: PathBuf::from(std::path::MAIN_SEPARATOR_STR),
            ghidra_install_dir: None,
            verbose: false,
            copy_to_project: false,
            force_remove: false,
            force_import: false,
            remove_existing_binaries: false,
            start_ghidra: false,
            zip_project: false,
            skip_dependency_import: false,
            skip_target_analysis: false,
            do_dependency_analysis: false,
            do_target_decompilation: false,
            decompile_timeout: 0,
            ignore_missing: false,
        }
    }
}
