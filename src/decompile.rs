use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{KickError, Result};
use crate::ghidra_headless::DecompiledFunction;
use crate::source_repo::SourceRepo;

pub const COMMIT_MESSAGE: &str = "Decompiled source refresh";

/// ファイル名の拡張子を除いた部分の上限（NAME_MAX は255バイト）
const MAX_STEM_BYTES: usize = 200;

/// ソース書き出しの集計
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceExport {
    pub written: usize,
    pub thunks: usize,
    pub failed: usize,
}

/// ファイル名に使えない文字を置き換える
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect()
}

/// 文字境界を保ったまま `max` バイト以内に切り詰める
fn truncate_to(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// `<entry>.c` と `<entry>::<name>.c` のファイル名
///
/// C++のテンプレート名などで長すぎる名前は切り詰める
pub fn source_file_names(function: &DecompiledFunction) -> (String, String) {
    let entry = sanitize(&function.entry);
    let stem = format!("{}::{}", entry, sanitize(&function.name));
    (
        format!("{}.c", truncate_to(&entry, MAX_STEM_BYTES)),
        format!("{}.c", truncate_to(&stem, MAX_STEM_BYTES)),
    )
}

/// 前回の書き出しで作った名前付きリンクを消す
fn remove_stale_links(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(|e| KickError::io(dir, e))? {
        let path = entry.map_err(|e| KickError::io(dir, e))?.path();
        let is_symlink = fs::symlink_metadata(&path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink {
            fs::remove_file(&path).map_err(|e| KickError::io(&path, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn link_source(file_name: &str, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(file_name, link)
}

#[cfg(not(unix))]
fn link_source(file_name: &str, link: &Path) -> std::io::Result<()> {
    let target = link.with_file_name(file_name);
    fs::copy(target, link).map(|_| ())
}

/// デコンパイル結果を `dir` に1関数1ファイルで書き出す
///
/// サンクとデコンパイルに失敗した関数は書き出さない
pub fn export_sources(dir: &Path, functions: &[DecompiledFunction]) -> Result<SourceExport> {
    fs::create_dir_all(dir).map_err(|e| KickError::cannot_create(dir, e))?;
    remove_stale_links(dir)?;

    let mut export = SourceExport::default();

    for function in functions {
        if function.entry.is_empty() {
            return Err(KickError::Data(format!(
                "function {} has no entry address",
                function.name
            )));
        }
        if function.thunk {
            tracing::debug!("Skipping thunk {}", function.name);
            export.thunks += 1;
            continue;
        }

        let (Some(_), Some(code)) = (&function.signature, &function.code) else {
            tracing::debug!(
                "Failed to decompile {} at {}: {}",
                function.name,
                function.entry,
                function.error.as_deref().unwrap_or("no output")
            );
            export.failed += 1;
            continue;
        };

        let (file_name, link_name) = source_file_names(function);
        let source = dir.join(&file_name);
        fs::write(&source, code).map_err(|e| KickError::io(&source, e))?;

        let link = dir.join(&link_name);
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link).map_err(|e| KickError::io(&link, e))?;
        }
        link_source(&file_name, &link).map_err(|e| KickError::io(&link, e))?;

        tracing::debug!("Decompiled {}", function.name);
        export.written += 1;
    }

    Ok(export)
}

/// 書き出したソースをターゲットのリポジトリにコミット
///
/// gitが使えない場合は警告のみ
pub fn commit_sources(dir: &Path) -> Option<PathBuf> {
    let result = SourceRepo::init(dir).and_then(|repo| {
        repo.commit_all(COMMIT_MESSAGE)?;
        Ok(repo.root().to_path_buf())
    });

    match result {
        Ok(root) => Some(root),
        Err(e) => {
            tracing::warn!("Could not commit sources in {}: {:#}", dir.display(), e);
            None
        }
    }
}
