use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use crate::config::GHIDRA_INSTALL_DIR_ENV;
use crate::error::KickError;

/// インポート後に実行するGhidraスクリプト
pub const EXPORT_SCRIPT_NAME: &str = "DragonkickExport.java";
const EXPORT_SCRIPT: &str = include_str!("../ghidra_scripts/DragonkickExport.java");

const PROGRAM_TAG: &str = "DRAGONKICK_PROGRAM ";
const FUNCTION_TAG: &str = "DRAGONKICK_FUNCTION ";

/// 失敗時にログへ残す出力の行数
const OUTPUT_TAIL_LINES: usize = 20;

/// インポート済みプログラムの情報
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProgramRecord {
    pub name: String,
    pub language_id: String,
    #[serde(default)]
    pub compiler_spec: String,
    #[serde(default)]
    pub creation_date: String,
    #[serde(default)]
    pub function_count: usize,
}

/// デコンパイルされた関数1つ分
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DecompiledFunction {
    /// エントリポイント（Ghidraのアドレス表記）
    #[serde(default)]
    pub entry: String,
    pub name: String,
    #[serde(default)]
    pub thunk: bool,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedProgram {
    pub program: ProgramRecord,
    pub functions: Vec<DecompiledFunction>,
}

/// 1バイナリ分のインポート要求
#[derive(Debug, Clone)]
pub struct ImportRequest<'a> {
    pub binary: &'a Path,
    /// `.gpr` を置くディレクトリ
    pub project_location: &'a Path,
    pub project_name: &'a str,
    pub analyze: bool,
    /// `Some(timeout)` ならデコンパイルも行う
    pub decompile: Option<u32>,
}

/// 解析エンジンとの境界
///
/// 実装は [`GhidraHeadless`]（analyzeHeadless をサブプロセスで呼ぶ）
pub trait GhidraBridge {
    fn version(&self) -> &str;

    fn import(&self, request: &ImportRequest<'_>) -> Result<ImportedProgram>;

    fn launch_gui(&self, gpr: &Path) -> Result<()>;
}

impl<T: GhidraBridge + ?Sized> GhidraBridge for &T {
    fn version(&self) -> &str {
        (**self).version()
    }

    fn import(&self, request: &ImportRequest<'_>) -> Result<ImportedProgram> {
        (**self).import(request)
    }

    fn launch_gui(&self, gpr: &Path) -> Result<()> {
        (**self).launch_gui(gpr)
    }
}

/// Ghidra Headless連携
///
/// Ghidraの analyzeHeadless をサブプロセスで呼び出し、
/// ポストスクリプトの出力からプログラム情報とデコンパイル結果を取り出す
pub struct GhidraHeadless {
    install_dir: PathBuf,
    analyze_headless: PathBuf,
    version: String,
    script_dir: TempDir,
}

fn support_script(install_dir: &Path, name: &str) -> PathBuf {
    if cfg!(windows) {
        install_dir.join(format!("{}.bat", name))
    } else {
        install_dir.join(name)
    }
}

/// `Ghidra/application.properties` から `application.version` を読む
pub fn read_application_version(install_dir: &Path) -> Option<String> {
    let properties = install_dir.join("Ghidra").join("application.properties");
    let content = fs::read_to_string(properties).ok()?;
    content.lines().find_map(|line| {
        line.trim()
            .strip_prefix("application.version")
            .map(|rest| rest.trim_start().trim_start_matches('=').trim().to_string())
            .filter(|version| !version.is_empty())
    })
}

impl GhidraHeadless {
    /// 新しいGhidraHeadlessインスタンスを作成
    ///
    /// # Arguments
    /// * `install_dir` - Ghidraのインストールディレクトリ（例: /opt/ghidra）
    pub fn new(install_dir: impl AsRef<Path>) -> crate::error::Result<Self> {
        let install_dir = install_dir.as_ref().to_path_buf();

        if !install_dir.is_dir() {
            return Err(KickError::GhidraUnavailable(format!(
                "Ghidra not found at: {}. Please install Ghidra or set the correct path",
                install_dir.display()
            )));
        }

        let analyze_headless = support_script(&install_dir.join("support"), "analyzeHeadless");
        if !analyze_headless.is_file() {
            return Err(KickError::GhidraUnavailable(format!(
                "analyzeHeadless not found. Expected at: {}",
                analyze_headless.display()
            )));
        }

        let version =
            read_application_version(&install_dir).unwrap_or_else(|| "unknown".to_string());

        // ポストスクリプトは一時ディレクトリに展開する
        let script_dir = tempfile::Builder::new()
            .prefix("dragonkick-scripts")
            .tempdir()
            .map_err(|e| KickError::cannot_create(std::env::temp_dir(), e))?;
        let script_path = script_dir.path().join(EXPORT_SCRIPT_NAME);
        fs::write(&script_path, EXPORT_SCRIPT).map_err(|e| KickError::io(&script_path, e))?;

        Ok(Self {
            install_dir,
            analyze_headless,
            version,
            script_dir,
        })
    }

    fn command(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        command.env(GHIDRA_INSTALL_DIR_ENV, &self.install_dir);
        command
    }
}

/// analyzeHeadless の引数を組み立てる
pub fn headless_args(request: &ImportRequest<'_>, script_dir: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        request.project_location.into(),
        request.project_name.into(),
        "-import".into(),
        request.binary.into(),
        "-overwrite".into(),
    ];
    if !request.analyze {
        args.push("-noanalysis".into());
    }
    args.push("-scriptPath".into());
    args.push(script_dir.into());
    args.push("-postScript".into());
    args.push(EXPORT_SCRIPT_NAME.into());
    if let Some(timeout) = request.decompile {
        args.push("decompile".into());
        args.push(timeout.to_string().into());
    }
    args
}

/// タグ付きの行からJSONを1つ取り出す（後ろに続くログ装飾は無視）
fn parse_tagged<T: DeserializeOwned>(line: &str, tag: &str) -> Option<Result<T>> {
    let start = line.find(tag)? + tag.len();
    let mut stream = serde_json::Deserializer::from_str(&line[start..]).into_iter::<T>();
    Some(
        stream
            .next()
            .unwrap_or_else(|| Err(serde::de::Error::custom("empty record")))
            .with_context(|| format!("Malformed {}record", tag)),
    )
}

/// ポストスクリプトの標準出力を解析
pub fn parse_script_output(stdout: &str) -> Result<ImportedProgram> {
    let mut program = None;
    let mut functions = Vec::new();

    for line in stdout.lines() {
        if let Some(record) = parse_tagged::<ProgramRecord>(line, PROGRAM_TAG) {
            program = Some(record?);
        } else if let Some(record) = parse_tagged::<DecompiledFunction>(line, FUNCTION_TAG) {
            functions.push(record?);
        }
    }

    let program = program.ok_or_else(|| anyhow!("Ghidra did not report the imported program"))?;
    Ok(ImportedProgram { program, functions })
}

fn output_tail(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

impl GhidraBridge for GhidraHeadless {
    fn version(&self) -> &str {
        &self.version
    }

    fn import(&self, request: &ImportRequest<'_>) -> Result<ImportedProgram> {
        let args = headless_args(request, self.script_dir.path());
        tracing::debug!("Running {} {:?}", self.analyze_headless.display(), args);

        let output = self
            .command(&self.analyze_headless)
            .args(&args)
            .output()
            .context("Failed to execute Ghidra analyzeHeadless")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        tracing::debug!("Ghidra stdout: {}", stdout);
        if !stderr.trim().is_empty() {
            tracing::warn!("Ghidra stderr: {}", stderr.trim_end());
        }

        if !output.status.success() {
            bail!(
                "analyzeHeadless exited with {} importing {}\n{}",
                output.status,
                request.binary.display(),
                output_tail(&stdout, &stderr)
            );
        }

        parse_script_output(&stdout).with_context(|| {
            format!(
                "Import of {} failed\n{}",
                request.binary.display(),
                output_tail(&stdout, &stderr)
            )
        })
    }

    fn launch_gui(&self, gpr: &Path) -> Result<()> {
        let ghidra_run = support_script(&self.install_dir, "ghidraRun");
        tracing::info!("Starting Ghidra with {}", gpr.display());

        let status = self
            .command(&ghidra_run)
            .arg(gpr)
            .status()
            .with_context(|| format!("Failed to execute {}", ghidra_run.display()))?;
        if !status.success() {
            bail!("{} exited with {}", ghidra_run.display(), status);
        }
        Ok(())
    }
}
