use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// ユーザーのgit設定に名前/メールがないときに使うコミット者
const FALLBACK_NAME: &str = "dragonkick";
const FALLBACK_EMAIL: &str = "dragonkick@localhost";

pub fn run_git(repo_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .context("Failed to execute git")?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// デコンパイル結果を管理するターゲットごとのgitリポジトリ
#[derive(Debug, Clone)]
pub struct SourceRepo {
    root: PathBuf,
}

impl SourceRepo {
    /// `git init`（既存リポジトリなら再初期化のみ）
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        run_git(&root, &["init", "--quiet"])?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn has_identity(&self) -> bool {
        ["user.name", "user.email"].iter().all(|key| {
            run_git(&self.root, &["config", key])
                .map(|value| !value.is_empty())
                .unwrap_or(false)
        })
    }

    /// 作業ツリーをすべてステージしてコミット
    pub fn commit_all(&self, message: &str) -> Result<()> {
        run_git(&self.root, &["add", "--all"])?;

        let name = format!("user.name={}", FALLBACK_NAME);
        let email = format!("user.email={}", FALLBACK_EMAIL);
        let mut args: Vec<&str> = Vec::new();
        if !self.has_identity() {
            args.extend(["-c", name.as_str(), "-c", email.as_str()]);
        }
        args.extend(["commit", "--quiet", "--allow-empty", "-m", message]);

        run_git(&self.root, &args)?;
        tracing::debug!("Committed decompiled sources in {}", self.root.display());
        Ok(())
    }
}
