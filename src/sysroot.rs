use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

use indexmap::IndexSet;

use crate::error::{KickError, Result};

/// 循環シンボリックリンク検出のための上限
pub const MAX_SYMLINK_HOPS: usize = 100;

/// ファイルシステムに触れずにパスを正規化する（`.` / `..` / 重複セパレータ）
///
/// 絶対パスではルートより上の `..` は捨て、相対パスでは先頭の `..` を残す
pub fn normalize(path: &Path) -> PathBuf {
    let mut head = PathBuf::new();
    let mut parts: Vec<&OsStr> = Vec::new();
    let mut absolute = false;

    for component in path.components() {
        match component {
            Component::Prefix(p) => head.push(p.as_os_str()),
            Component::RootDir => {
                head.push(Component::RootDir.as_os_str());
                absolute = true;
            }
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(last) if *last != OsStr::new("..") => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(OsStr::new("..")),
            },
            Component::Normal(name) => parts.push(name),
        }
    }

    head.extend(parts);
    if head.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        head
    }
}

/// `rel` を `root` の下に連結する。`..` は `root` で止まる（chroot と同じ解釈）
fn join_clamped(root: &Path, rel: &Path) -> PathBuf {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => parts.push(name),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }

    let mut joined = root.to_path_buf();
    joined.extend(parts);
    joined
}

/// 代替ルート `root` を基準にシンボリックリンクを辿る
///
/// 絶対リンクは `root` 配下に付け替え、相対リンクはリンク自身の親ディレクトリ基準で解決する。
/// [`MAX_SYMLINK_HOPS`] 回を超えたら循環とみなす
pub fn resolve_with_root(path: &Path, root: &Path) -> Result<PathBuf> {
    let mut current = path.to_path_buf();

    for _ in 0..MAX_SYMLINK_HOPS {
        let is_symlink = fs::symlink_metadata(&current)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            return Ok(current);
        }

        let destination = fs::read_link(&current).map_err(|e| KickError::io(&current, e))?;
        let parent = current.parent().unwrap_or_else(|| Path::new(""));

        current = if destination.is_absolute() {
            join_clamped(root, &destination)
        } else if let Ok(rel_parent) = parent.strip_prefix(root) {
            join_clamped(root, &rel_parent.join(&destination))
        } else {
            normalize(&parent.join(&destination))
        };
    }

    Err(KickError::SymlinkLoop(path.to_path_buf()))
}

fn has_glob_magic(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// 実在するディレクトリ `prefix` をエスケープし、`rel` はパターンのまま連結する
pub(crate) fn glob_pattern(prefix: &Path, rel: &Path) -> String {
    let mut pattern = glob::Pattern::escape(&prefix.to_string_lossy());
    if !rel.as_os_str().is_empty() {
        if !pattern.is_empty() && !pattern.ends_with(std::path::MAIN_SEPARATOR) {
            pattern.push(std::path::MAIN_SEPARATOR);
        }
        pattern.push_str(&rel.to_string_lossy());
    }
    pattern
}

/// ターゲットと依存関係を探索するファイルシステムのルート
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysroot {
    root: PathBuf,
}

impl Sysroot {
    /// sysrootを開く（正規化 + 実在確認）
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let normalized = normalize(dir.as_ref());
        let root = fs::canonicalize(&normalized)
            .map_err(|_| KickError::MissingSysroot(normalized.clone()))?;
        if !root.is_dir() {
            return Err(KickError::MissingSysroot(root));
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// ホストのルート `/` そのものか
    pub fn is_host(&self) -> bool {
        self.root.parent().is_none() && self.root.has_root()
    }

    /// コマンドラインで与えられたターゲットをsysroot配下の絶対パスに変換
    pub fn rooted(&self, target: &Path) -> Result<PathBuf> {
        if self.is_host() {
            let absolute = if target.is_absolute() {
                target.to_path_buf()
            } else {
                std::env::current_dir()
                    .map_err(|e| KickError::io(".", e))?
                    .join(target)
            };
            return Ok(normalize(&absolute));
        }

        Ok(join_clamped(&self.root, &normalize(target)))
    }

    /// `rooted()` 済みのターゲットをglobパターンにする
    ///
    /// sysroot（ホストではカレントディレクトリ）側の `[` や `*` は文字どおりに扱う
    fn target_pattern(&self, target: &Path, rooted: &Path) -> Result<String> {
        let base = if self.is_host() && !target.is_absolute() {
            std::env::current_dir().map_err(|e| KickError::io(".", e))?
        } else {
            self.root.clone()
        };
        let prefix = base
            .ancestors()
            .find(|ancestor| rooted.starts_with(ancestor))
            .unwrap_or_else(|| Path::new(""));
        let rel = rooted.strip_prefix(prefix).unwrap_or(rooted);
        Ok(glob_pattern(prefix, rel))
    }

    /// sysroot内の絶対パスをホスト上のパスに付け替える
    pub fn reroot(&self, path: &Path) -> PathBuf {
        join_clamped(&self.root, path)
    }

    /// sysroot基準でシンボリックリンクを解決
    ///
    /// ホストルートの場合は途中のディレクトリリンクも含めて正規化する
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let resolved = resolve_with_root(path, &self.root)?;
        if self.is_host() {
            return Ok(fs::canonicalize(&resolved).unwrap_or(resolved));
        }
        Ok(resolved)
    }
}

/// ターゲット指定（globパターン可）を実在するファイルの集合に展開
///
/// 見つからないターゲットは `ignore_missing` なら警告してスキップ、そうでなければエラー
pub fn expand_targets<S: AsRef<str>>(
    patterns: &[S],
    sysroot: &Sysroot,
    ignore_missing: bool,
) -> Result<IndexSet<PathBuf>> {
    let mut targets = IndexSet::new();

    for pattern in patterns {
        let pattern = pattern.as_ref();
        let rooted = sysroot.rooted(Path::new(pattern))?;

        let matches: Vec<PathBuf> = if has_glob_magic(pattern) {
            let glob_str = sysroot.target_pattern(Path::new(pattern), &rooted)?;
            glob::glob(&glob_str)
                .map_err(|e| KickError::BadPattern {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                })?
                .filter_map(|entry| entry.ok())
                .collect()
        } else if fs::symlink_metadata(&rooted).is_ok() {
            vec![rooted.clone()]
        } else {
            Vec::new()
        };

        if matches.is_empty() {
            if ignore_missing {
                tracing::warn!("Target {} does not exist, skipping", rooted.display());
                continue;
            }
            return Err(KickError::MissingTarget(rooted));
        }

        for candidate in matches {
            let resolved = sysroot.resolve(&candidate)?;
            if !resolved.is_file() {
                if ignore_missing {
                    tracing::warn!("Target {} does not exist, skipping", resolved.display());
                    continue;
                }
                return Err(KickError::MissingTarget(resolved));
            }
            targets.insert(resolved);
        }
    }

    Ok(targets)
}
