use anyhow::{bail, Context};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{KickError, Result};
use crate::sysroot::normalize;

/// プロジェクトツリーにコピーするバイナリの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    /// `bin/` に置く解析対象
    Target,
    /// `lib/` に置く共有ライブラリ
    Dependency,
}

/// プロジェクトディレクトリのレイアウト
///
/// ```text
/// <dir>/
///   bin/            コピーしたターゲット
///   lib/            コピーした依存ライブラリ
///   src/<target>/   デコンパイル結果（gitリポジトリ）
///   <name>/<name>.gpr
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub name: String,
    pub dir: PathBuf,
    pub bin_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub src_dir: PathBuf,
    /// Ghidraに渡すプロジェクトの格納先（`<dir>/<name>`）
    pub location: PathBuf,
    pub gpr: PathBuf,
}

impl ProjectLayout {
    pub fn new(project_dir: Option<&Path>, name: &str) -> Self {
        let dir = match project_dir {
            Some(dir) => normalize(dir),
            None => PathBuf::from(name),
        };
        let location = dir.join(name);

        Self {
            name: name.to_string(),
            bin_dir: dir.join("bin"),
            lib_dir: dir.join("lib"),
            src_dir: dir.join("src"),
            gpr: location.join(format!("{}.gpr", name)),
            location,
            dir,
        }
    }

    /// 表示用の絶対パス（存在しなければそのまま）
    pub fn display_dir(&self) -> PathBuf {
        fs::canonicalize(&self.dir).unwrap_or_else(|_| self.dir.clone())
    }

    /// 既存のプロジェクトディレクトリを丸ごと削除
    pub fn force_remove(&self) -> Result<bool> {
        if !self.dir.is_dir() {
            return Ok(false);
        }
        tracing::info!("Removing existing project {}", self.display_dir().display());
        fs::remove_dir_all(&self.dir).map_err(|e| KickError::io(&self.dir, e))?;
        Ok(true)
    }

    /// 以前コピーしたバイナリ（`lib/` と `bin/` 直下のファイル）を削除
    pub fn remove_existing_binaries(&self) -> Result<usize> {
        tracing::info!("Removing existing binaries from project");

        let mut removed = 0;
        for (dir, label) in [(&self.lib_dir, "dependency"), (&self.bin_dir, "target")] {
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(dir).map_err(|e| KickError::io(dir, e))? {
                let path = entry.map_err(|e| KickError::io(dir, e))?.path();
                if path.is_file() {
                    fs::remove_file(&path).map_err(|e| KickError::io(&path, e))?;
                    removed += 1;
                    tracing::debug!(
                        "Removed previous {} {}",
                        label,
                        path.file_name().unwrap_or_default().to_string_lossy()
                    );
                }
            }
        }

        Ok(removed)
    }

    /// 既存の `.gpr` がある場合は `-f` が必要
    pub fn ensure_importable(&self, force_import: bool) -> Result<()> {
        if self.gpr.is_file() && !force_import {
            return Err(KickError::ProjectExists(
                fs::canonicalize(&self.gpr).unwrap_or_else(|_| self.gpr.clone()),
            ));
        }
        Ok(())
    }

    /// ディレクトリツリーを作成（既存なら何もしない）
    pub fn create_tree(&self) -> Result<()> {
        for dir in [
            &self.dir,
            &self.bin_dir,
            &self.lib_dir,
            &self.src_dir,
            &self.location,
        ] {
            fs::create_dir_all(dir).map_err(|e| KickError::cannot_create(dir, e))?;
        }
        Ok(())
    }

    /// バイナリを `bin/` または `lib/` にコピー（パーミッション保持）
    pub fn copy_binary(&self, source: &Path, kind: BinaryKind) -> Result<PathBuf> {
        let dir = match kind {
            BinaryKind::Target => &self.bin_dir,
            BinaryKind::Dependency => &self.lib_dir,
        };
        let file_name = source
            .file_name()
            .ok_or_else(|| KickError::MissingTarget(source.to_path_buf()))?;
        let destination = dir.join(file_name);

        fs::copy(source, &destination).map_err(|e| KickError::io(&destination, e))?;
        Ok(destination)
    }

    /// ターゲットごとのデコンパイル結果ディレクトリ
    pub fn target_src_dir(&self, target_name: &str) -> PathBuf {
        self.src_dir.join(target_name)
    }

    /// インポート後に `.gpr` ができているか
    pub fn is_ready(&self) -> bool {
        self.gpr.is_file()
    }

    /// プロジェクトツリーを `<dir>/../<name>.zip` にまとめる
    pub fn zip(&self) -> anyhow::Result<PathBuf> {
        if !self.dir.is_dir() {
            bail!("'{}' is not a valid project directory", self.dir.display());
        }

        let parent = self.dir.parent().unwrap_or_else(|| Path::new(""));
        let archive_path = parent.join(format!("{}.zip", self.name));

        let mut entries = Vec::new();
        collect_entries(&self.dir, &mut entries)
            .with_context(|| format!("Failed to walk {}", self.dir.display()))?;

        let file = File::create(&archive_path)
            .with_context(|| format!("Failed to create {}", archive_path.display()))?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for path in &entries {
            let name = archive_name(&self.dir, path)?;
            let meta = fs::symlink_metadata(path)?;

            if meta.file_type().is_symlink() {
                let target = fs::read_link(path)?;
                writer.add_symlink(name.clone(), target.to_string_lossy().into_owned(), options)?;
            } else if meta.is_dir() {
                writer.add_directory(format!("{}/", name), options)?;
            } else {
                #[cfg(unix)]
                let file_options = {
                    use std::os::unix::fs::PermissionsExt;
                    options.unix_permissions(meta.permissions().mode())
                };
                #[cfg(not(unix))]
                let file_options = options;

                writer.start_file(name.clone(), file_options)?;
                let mut input = File::open(path)?;
                io::copy(&mut input, &mut writer)?;
            }
            tracing::debug!("Added {} to {}", name, archive_path.display());
        }

        writer.finish()?;
        tracing::info!("Zipped {} entries", entries.len());

        Ok(fs::canonicalize(&archive_path).unwrap_or(archive_path))
    }
}

/// ディレクトリ配下のエントリを再帰的に集める（シンボリックリンクは辿らない）
fn collect_entries(dir: &Path, entries: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    children.sort();

    for child in children {
        let is_dir = fs::symlink_metadata(&child)?.is_dir();
        entries.push(child.clone());
        if is_dir {
            collect_entries(&child, entries)?;
        }
    }
    Ok(())
}

/// アーカイブ内のエントリ名（`/` 区切りの相対パス）
fn archive_name(root: &Path, path: &Path) -> anyhow::Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ProjectLayout::new(
            Some(Path::new("/tmp/test_project/../test_project")),
            "my_project",
        );
        assert_eq!(layout.dir, PathBuf::from("/tmp/test_project"));
        assert_eq!(layout.bin_dir, PathBuf::from("/tmp/test_project/bin"));
        assert_eq!(layout.location, PathBuf::from("/tmp/test_project/my_project"));
        assert_eq!(
            layout.gpr,
            PathBuf::from("/tmp/test_project/my_project/my_project.gpr")
        );

        let default = ProjectLayout::new(None, "my_project");
        assert_eq!(default.dir, PathBuf::from("my_project"));
        assert_eq!(default.src_dir, PathBuf::from("my_project/src"));
    }

    #[test]
    fn test_existing_project_requires_force() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(Some(tmp.path().join("proj").as_path()), "my_project");
        layout.create_tree().unwrap();
        assert!(layout.ensure_importable(false).is_ok());

        fs::write(&layout.gpr, b"").unwrap();
        let err = layout.ensure_importable(false).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EX_CANTCREAT);
        assert!(layout.ensure_importable(true).is_ok());
    }

    #[test]
    fn test_remove_existing_binaries_keeps_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(Some(tmp.path().join("proj").as_path()), "p");
        layout.create_tree().unwrap();
        fs::write(layout.bin_dir.join("ls"), b"ls").unwrap();
        fs::write(layout.lib_dir.join("libc.so.6"), b"libc").unwrap();
        fs::create_dir(layout.lib_dir.join("nested")).unwrap();

        assert_eq!(layout.remove_existing_binaries().unwrap(), 2);
        assert!(layout.lib_dir.join("nested").is_dir());
        assert_eq!(fs::read_dir(&layout.bin_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_force_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(Some(tmp.path().join("proj").as_path()), "p");
        assert!(!layout.force_remove().unwrap());
        layout.create_tree().unwrap();
        assert!(layout.force_remove().unwrap());
        assert!(!layout.dir.exists());
    }

    #[test]
    fn test_copy_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(Some(tmp.path().join("proj").as_path()), "p");
        layout.create_tree().unwrap();
        let source = tmp.path().join("libfoo.so.1");
        fs::write(&source, b"foo").unwrap();

        let copied = layout.copy_binary(&source, BinaryKind::Dependency).unwrap();
        assert_eq!(copied, layout.lib_dir.join("libfoo.so.1"));
        assert_eq!(fs::read(copied).unwrap(), b"foo");
    }

    #[test]
    fn test_zip_project() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(Some(tmp.path().join("proj").as_path()), "my_project");
        layout.create_tree().unwrap();
        fs::write(layout.bin_dir.join("ls"), b"ls").unwrap();
        let src = layout.target_src_dir("ls");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("00101000.c"), b"int main(void) { return 0; }").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("00101000.c", src.join("00101000::main.c")).unwrap();

        let archive = layout.zip().unwrap();
        assert_eq!(archive.file_name().unwrap(), "my_project.zip");
        assert_eq!(archive.parent().unwrap(), fs::canonicalize(tmp.path()).unwrap());

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let names: Vec<String> = zip.file_names().map(str::to_string).collect();
        assert!(names.contains(&"bin/ls".to_string()));
        assert!(names.contains(&"src/ls/00101000.c".to_string()));
        assert!(names.iter().any(|n| n.starts_with("my_project")));

        // シンボリックリンクはリンクのまま格納される
        #[cfg(unix)]
        {
            const S_IFMT: u32 = 0o170000;
            const S_IFLNK: u32 = 0o120000;
            let mut link = zip.by_name("src/ls/00101000::main.c").unwrap();
            assert_eq!(link.unix_mode().unwrap() & S_IFMT, S_IFLNK);
            let mut target = String::new();
            io::Read::read_to_string(&mut link, &mut target).unwrap();
            assert_eq!(target, "00101000.c");
        }

        let mut source = zip.by_name("src/ls/00101000.c").unwrap();
        let mut code = String::new();
        io::Read::read_to_string(&mut source, &mut code).unwrap();
        assert!(code.contains("main"));
    }

    #[test]
    fn test_zip_requires_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(Some(tmp.path().join("missing").as_path()), "p");
        assert!(layout.zip().is_err());
    }
}
