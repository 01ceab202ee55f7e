use anyhow::{anyhow, Context, Result};
use goblin::elf::header::ET_DYN;
use goblin::elf::program_header::{PF_X, PT_GNU_STACK};
use goblin::mach::Mach;
use goblin::Object;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::sysroot::{glob_pattern, Sysroot};

/// ld.so.conf の include ネスト上限
const MAX_CONF_DEPTH: usize = 8;

/// sysroot配下で常に探索するディレクトリ
const DEFAULT_LIBRARY_DIRS: &[&str] = &["lib", "lib64", "usr/lib", "usr/lib64", "usr/local/lib"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Elf,
    Pe,
    MachO,
}

impl fmt::Display for BinaryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinaryFormat::Elf => "ELF",
            BinaryFormat::Pe => "PE",
            BinaryFormat::MachO => "Mach-O",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linking {
    Static,
    Dynamic,
}

impl fmt::Display for Linking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Linking::Static => f.write_str("static"),
            Linking::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// 依存関係解決に必要なバイナリのメタデータ
#[derive(Debug, Clone)]
pub struct BinaryInfo {
    pub path: PathBuf,
    pub format: BinaryFormat,
    pub architecture: String,
    /// ELFの `e_machine`（ELF以外は0）
    pub machine: u16,
    pub is_64: bool,
    pub linking: Linking,
    pub pic: bool,
    pub execstack: bool,
    pub needed: Vec<String>,
    pub rpaths: Vec<String>,
    pub runpaths: Vec<String>,
    pub interpreter: Option<String>,
}

fn elf_architecture(machine: u16) -> &'static str {
    match machine {
        0x03 => "x86",
        0x3E => "x86-64",
        0x28 => "ARM",
        0xB7 => "ARM64",
        0x08 => "MIPS",
        0x14 => "PowerPC",
        0x15 => "PowerPC64",
        0xF3 => "RISC-V",
        _ => "Unknown",
    }
}

/// Debian系のマルチアーキテクチャ用ディレクトリ名
fn multiarch_triple(machine: u16, is_64: bool) -> Option<&'static str> {
    match (machine, is_64) {
        (0x3E, true) => Some("x86_64-linux-gnu"),
        (0x03, false) => Some("i386-linux-gnu"),
        (0xB7, true) => Some("aarch64-linux-gnu"),
        (0x28, false) => Some("arm-linux-gnueabihf"),
        (0x08, false) => Some("mips-linux-gnu"),
        (0x15, true) => Some("powerpc64le-linux-gnu"),
        (0xF3, true) => Some("riscv64-linux-gnu"),
        _ => None,
    }
}

/// `$PLATFORM` の展開値
fn platform_name(machine: u16) -> &'static str {
    match machine {
        0x3E => "x86_64",
        0x03 => "i686",
        0xB7 => "aarch64",
        0x28 => "v7l",
        _ => "",
    }
}

impl BinaryInfo {
    /// バイナリを読み込んでメタデータを抽出
    pub fn inspect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buffer = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let object = Object::parse(&buffer)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        match object {
            Object::Elf(elf) => {
                let execstack = elf
                    .program_headers
                    .iter()
                    .find(|ph| ph.p_type == PT_GNU_STACK)
                    .map(|ph| ph.p_flags & PF_X != 0)
                    .unwrap_or(true);
                let linking = if elf.interpreter.is_some() || elf.dynamic.is_some() {
                    Linking::Dynamic
                } else {
                    Linking::Static
                };

                Ok(Self {
                    path: path.to_path_buf(),
                    format: BinaryFormat::Elf,
                    architecture: elf_architecture(elf.header.e_machine).to_string(),
                    machine: elf.header.e_machine,
                    is_64: elf.is_64,
                    linking,
                    pic: elf.header.e_type == ET_DYN,
                    execstack,
                    needed: elf.libraries.iter().map(|s| s.to_string()).collect(),
                    rpaths: elf.rpaths.iter().map(|s| s.to_string()).collect(),
                    runpaths: elf.runpaths.iter().map(|s| s.to_string()).collect(),
                    interpreter: elf.interpreter.map(|s| s.to_string()),
                })
            }
            Object::PE(pe) => {
                let architecture = match pe.header.coff_header.machine {
                    0x14C => "x86",
                    0x8664 => "x86-64",
                    0x1C0 | 0x1C4 => "ARM",
                    0xAA64 => "ARM64",
                    _ => "Unknown",
                };
                // IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE
                let pic = pe
                    .header
                    .optional_header
                    .map(|oh| oh.windows_fields.dll_characteristics & 0x40 != 0)
                    .unwrap_or(false);

                Ok(Self {
                    path: path.to_path_buf(),
                    format: BinaryFormat::Pe,
                    architecture: architecture.to_string(),
                    machine: 0,
                    is_64: pe.is_64,
                    linking: if pe.libraries.is_empty() {
                        Linking::Static
                    } else {
                        Linking::Dynamic
                    },
                    pic,
                    execstack: false,
                    needed: pe.libraries.iter().map(|s| s.to_string()).collect(),
                    rpaths: Vec::new(),
                    runpaths: Vec::new(),
                    interpreter: None,
                })
            }
            Object::Mach(mach) => {
                let (architecture, is_64, needed) = match mach {
                    Mach::Binary(macho) => {
                        let arch = match macho.header.cputype {
                            7 => "x86",
                            0x0100_0007 => "x86-64",
                            12 => "ARM",
                            0x0100_000C => "ARM64",
                            _ => "Unknown",
                        };
                        let needed: Vec<String> = macho
                            .libs
                            .iter()
                            .filter(|lib| **lib != "self")
                            .map(|lib| lib.to_string())
                            .collect();
                        (arch, macho.is_64, needed)
                    }
                    Mach::Fat(_) => ("universal", true, Vec::new()),
                };

                Ok(Self {
                    path: path.to_path_buf(),
                    format: BinaryFormat::MachO,
                    architecture: architecture.to_string(),
                    machine: 0,
                    is_64,
                    linking: if needed.is_empty() {
                        Linking::Static
                    } else {
                        Linking::Dynamic
                    },
                    pic: true,
                    execstack: false,
                    needed,
                    rpaths: Vec::new(),
                    runpaths: Vec::new(),
                    interpreter: None,
                })
            }
            _ => Err(anyhow!(
                "{} is not a supported executable format",
                path.display()
            )),
        }
    }

    /// 同じローダーで一緒にマップできるか（ELFのクラスとマシンが一致）
    pub fn is_compatible_with(&self, other: &BinaryInfo) -> bool {
        self.format == BinaryFormat::Elf
            && other.format == BinaryFormat::Elf
            && self.machine == other.machine
            && self.is_64 == other.is_64
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// ターゲット1つ分の依存関係解決結果
#[derive(Debug, Clone, Default)]
pub struct DependencySet {
    /// DT_NEEDED名 → 解決されたパス（発見順）
    pub resolved: IndexMap<String, PathBuf>,
    /// 見つからなかったライブラリ名
    pub missing: Vec<String>,
}

/// sysroot配下の共有ライブラリ探索器
///
/// ld.so と同じ優先順位（DT_RPATH → DT_RUNPATH → ld.so.conf → 既定ディレクトリ）で探す
pub struct LibrarySearch<'a> {
    sysroot: &'a Sysroot,
    config_dirs: IndexSet<PathBuf>,
}

impl<'a> LibrarySearch<'a> {
    pub fn new(sysroot: &'a Sysroot) -> Self {
        let mut config_dirs = IndexSet::new();
        let conf = sysroot.reroot(Path::new("/etc/ld.so.conf"));
        parse_ld_so_conf(sysroot, &conf, 0, &mut config_dirs);
        tracing::debug!(
            "Loaded {} library directories from {}",
            config_dirs.len(),
            conf.display()
        );

        Self {
            sysroot,
            config_dirs,
        }
    }

    /// `requester` の依存を探すディレクトリ一覧（優先順）
    pub fn search_dirs(&self, requester: &BinaryInfo) -> Vec<PathBuf> {
        let mut dirs: IndexSet<PathBuf> = IndexSet::new();

        // DT_RUNPATH があると DT_RPATH は無視される
        if requester.runpaths.is_empty() {
            for entry in requester.rpaths.iter().flat_map(|rp| rp.split(':')) {
                if let Some(dir) = self.expand_rpath(entry, requester) {
                    dirs.insert(dir);
                }
            }
        }
        for entry in requester.runpaths.iter().flat_map(|rp| rp.split(':')) {
            if let Some(dir) = self.expand_rpath(entry, requester) {
                dirs.insert(dir);
            }
        }

        dirs.extend(self.config_dirs.iter().cloned());

        if !self.sysroot.is_host() {
            dirs.insert(self.sysroot.path().to_path_buf());
        }

        for dir in DEFAULT_LIBRARY_DIRS {
            dirs.insert(self.sysroot.path().join(dir));
        }
        if let Some(triple) = multiarch_triple(requester.machine, requester.is_64) {
            dirs.insert(self.sysroot.path().join("lib").join(triple));
            dirs.insert(self.sysroot.path().join("usr/lib").join(triple));
        }

        dirs.into_iter().collect()
    }

    /// rpath要素1つを展開（$ORIGIN / $LIB / $PLATFORM）
    fn expand_rpath(&self, entry: &str, requester: &BinaryInfo) -> Option<PathBuf> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }

        let origin = requester
            .path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let lib = if requester.is_64 { "lib64" } else { "lib" };
        let platform = platform_name(requester.machine);

        let expanded = entry
            .replace("${ORIGIN}", &origin)
            .replace("$ORIGIN", &origin)
            .replace("${LIB}", lib)
            .replace("$LIB", lib)
            .replace("${PLATFORM}", platform)
            .replace("$PLATFORM", platform);
        let expanded = Path::new(&expanded);

        if entry.contains("ORIGIN") {
            // $ORIGIN はすでにホスト上のパス
            Some(crate::sysroot::normalize(expanded))
        } else if expanded.is_absolute() {
            Some(self.sysroot.reroot(expanded))
        } else {
            requester.path.parent().map(|dir| crate::sysroot::normalize(&dir.join(expanded)))
        }
    }

    /// ライブラリ名を探索して互換性のあるものを返す
    pub fn find(&self, name: &str, requester: &BinaryInfo) -> Option<BinaryInfo> {
        let candidates: Vec<PathBuf> = if name.contains('/') {
            let path = Path::new(name);
            if path.is_absolute() {
                vec![self.sysroot.reroot(path)]
            } else {
                requester
                    .path
                    .parent()
                    .map(|dir| vec![dir.join(path)])
                    .unwrap_or_default()
            }
        } else {
            self.search_dirs(requester)
                .into_iter()
                .map(|dir| dir.join(name))
                .collect()
        };

        for candidate in candidates {
            if fs::symlink_metadata(&candidate).is_err() {
                continue;
            }
            let resolved = match self.sysroot.resolve(&candidate) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => continue,
            };
            match BinaryInfo::inspect(&resolved) {
                Ok(info) if info.is_compatible_with(requester) => return Some(info),
                Ok(_) => {
                    tracing::trace!("Skipping incompatible {}", resolved.display());
                }
                Err(e) => {
                    tracing::trace!("Skipping {}: {:#}", resolved.display(), e);
                }
            }
        }

        None
    }

    /// ターゲットの推移的な依存関係を幅優先で解決
    pub fn resolve_dependencies(&self, target: &BinaryInfo) -> DependencySet {
        let mut set = DependencySet::default();
        if target.format != BinaryFormat::Elf {
            return set;
        }

        let mut seen_names: HashSet<String> = HashSet::new();
        let mut seen_paths: HashSet<PathBuf> = HashSet::new();
        seen_paths.insert(target.path.clone());

        let mut queue = VecDeque::new();
        queue.push_back(target.clone());

        while let Some(object) = queue.pop_front() {
            for name in &object.needed {
                if !seen_names.insert(name.clone()) {
                    continue;
                }
                match self.find(name, &object) {
                    Some(library) => {
                        if seen_paths.insert(library.path.clone()) {
                            set.resolved.insert(name.clone(), library.path.clone());
                            queue.push_back(library);
                        }
                    }
                    None => set.missing.push(name.clone()),
                }
            }
        }

        set
    }
}

/// ld.so.conf を読んでライブラリディレクトリを集める（include は再帰）
fn parse_ld_so_conf(sysroot: &Sysroot, file: &Path, depth: usize, dirs: &mut IndexSet<PathBuf>) {
    if depth > MAX_CONF_DEPTH {
        return;
    }
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(_) => return,
    };
    let conf_dir = file.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();

    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with("hwcap") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("include") {
            for pattern in rest.split_whitespace() {
                let pattern = Path::new(pattern);
                let glob_str = if pattern.is_absolute() {
                    let rooted = sysroot.reroot(pattern);
                    let rel = rooted.strip_prefix(sysroot.path()).unwrap_or(rooted.as_path());
                    glob_pattern(sysroot.path(), rel)
                } else {
                    glob_pattern(&conf_dir, pattern)
                };
                let mut included: Vec<PathBuf> = match glob::glob(&glob_str) {
                    Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
                    Err(_) => continue,
                };
                included.sort();
                for conf in included {
                    parse_ld_so_conf(sysroot, &conf, depth + 1, dirs);
                }
            }
            continue;
        }

        for dir in line.split(|c: char| c.is_whitespace() || c == ':' || c == ',') {
            if dir.starts_with('/') {
                dirs.insert(sysroot.reroot(Path::new(dir)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_elf(path: PathBuf, rpaths: &[&str], runpaths: &[&str]) -> BinaryInfo {
        BinaryInfo {
            path,
            format: BinaryFormat::Elf,
            architecture: "x86-64".to_string(),
            machine: 0x3E,
            is_64: true,
            linking: Linking::Dynamic,
            pic: true,
            execstack: false,
            needed: Vec::new(),
            rpaths: rpaths.iter().map(|s| s.to_string()).collect(),
            runpaths: runpaths.iter().map(|s| s.to_string()).collect(),
            interpreter: None,
        }
    }

    #[test]
    fn test_ld_so_conf_with_includes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Sysroot::open(tmp.path()).unwrap();
        let etc = root.path().join("etc");
        fs::create_dir_all(etc.join("ld.so.conf.d")).unwrap();
        fs::write(
            etc.join("ld.so.conf"),
            "# system libraries\ninclude /etc/ld.so.conf.d/*.conf\n/opt/vendor/lib\n",
        )
        .unwrap();
        fs::write(
            etc.join("ld.so.conf.d/x86_64.conf"),
            "/usr/lib/x86_64-linux-gnu  # multiarch\n",
        )
        .unwrap();

        let search = LibrarySearch::new(&root);
        let dirs: Vec<_> = search.config_dirs.iter().cloned().collect();
        assert_eq!(
            dirs,
            vec![
                root.path().join("usr/lib/x86_64-linux-gnu"),
                root.path().join("opt/vendor/lib"),
            ]
        );
    }

    #[test]
    fn test_ld_so_conf_include_under_bracketed_sysroot() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("fw[1]");
        fs::create_dir_all(dir.join("etc/ld.so.conf.d")).unwrap();
        fs::write(dir.join("etc/ld.so.conf"), "include ld.so.conf.d/*.conf\n").unwrap();
        fs::write(dir.join("etc/ld.so.conf.d/vendor.conf"), "/opt/vendor/lib\n").unwrap();
        fs::write(dir.join("etc/ld.so.conf.d/local.conf"), "/usr/local/lib64\n").unwrap();

        let root = Sysroot::open(&dir).unwrap();
        let search = LibrarySearch::new(&root);
        let dirs: Vec<_> = search.config_dirs.iter().cloned().collect();
        assert_eq!(
            dirs,
            vec![
                root.path().join("usr/local/lib64"),
                root.path().join("opt/vendor/lib"),
            ]
        );
    }

    #[test]
    fn test_rpath_is_ignored_when_runpath_present() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Sysroot::open(tmp.path()).unwrap();
        let search = LibrarySearch::new(&root);

        let bin = root.path().join("opt/app/bin/app");
        let with_both = fake_elf(bin.clone(), &["/opt/rpath"], &["$ORIGIN/../lib"]);
        let dirs = search.search_dirs(&with_both);
        assert_eq!(dirs[0], root.path().join("opt/app/lib"));
        assert!(!dirs.contains(&root.path().join("opt/rpath")));

        let rpath_only = fake_elf(bin, &["/opt/rpath:$LIB/extra"], &[]);
        let dirs = search.search_dirs(&rpath_only);
        assert_eq!(dirs[0], root.path().join("opt/rpath"));
        assert_eq!(dirs[1], root.path().join("opt/app/bin/lib64/extra"));
    }

    #[test]
    fn test_default_dirs_include_sysroot_and_multiarch() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Sysroot::open(tmp.path()).unwrap();
        let search = LibrarySearch::new(&root);

        let dirs = search.search_dirs(&fake_elf(root.path().join("bin/ls"), &[], &[]));
        assert!(dirs.contains(&root.path().to_path_buf()));
        assert!(dirs.contains(&root.path().join("usr/lib64")));
        assert!(dirs.contains(&root.path().join("lib/x86_64-linux-gnu")));
    }

    #[test]
    fn test_inspect_rejects_unknown_formats() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        fs::write(&path, b"definitely not an executable").unwrap();
        assert!(BinaryInfo::inspect(&path).is_err());
    }
}
