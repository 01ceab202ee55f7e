#![allow(dead_code)]

use anyhow::{bail, Result};
use dragonkick::ghidra_headless::{
    DecompiledFunction, GhidraBridge, ImportRequest, ImportedProgram, ProgramRecord,
};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

pub const EM_X86_64: u16 = 0x3E;
pub const EM_AARCH64: u16 = 0xB7;

fn push_phdr(out: &mut Vec<u8>, p_type: u32, flags: u32, offset: u64, size: u64, align: u64) {
    out.extend_from_slice(&p_type.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes()); // p_offset
    out.extend_from_slice(&offset.to_le_bytes()); // p_vaddr
    out.extend_from_slice(&offset.to_le_bytes()); // p_paddr
    out.extend_from_slice(&size.to_le_bytes()); // p_filesz
    out.extend_from_slice(&size.to_le_bytes()); // p_memsz
    out.extend_from_slice(&align.to_le_bytes());
}

/// DT_NEEDED / DT_RUNPATH だけを持つ最小のELF64（リトルエンディアン）
///
/// PT_LOAD がファイル全体を仮想アドレス=オフセットでマップするので
/// DT_STRTAB はファイルオフセットをそのまま指す
pub fn elf64(machine: u16, needed: &[&str], runpath: Option<&str>) -> Vec<u8> {
    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;
    const PHNUM: usize = 2;
    let strtab_off = EHDR_SIZE + PHDR_SIZE * PHNUM;

    let mut strtab = vec![0u8];
    let mut needed_offsets = Vec::new();
    for name in needed {
        needed_offsets.push(strtab.len() as u64);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    let runpath_offset = runpath.map(|rp| {
        let offset = strtab.len() as u64;
        strtab.extend_from_slice(rp.as_bytes());
        strtab.push(0);
        offset
    });

    let mut dynamic: Vec<(i64, u64)> = needed_offsets.iter().map(|&off| (1, off)).collect();
    if let Some(off) = runpath_offset {
        dynamic.push((29, off)); // DT_RUNPATH
    }
    dynamic.push((5, strtab_off as u64)); // DT_STRTAB
    dynamic.push((10, strtab.len() as u64)); // DT_STRSZ
    dynamic.push((0, 0)); // DT_NULL

    let dyn_off = (strtab_off + strtab.len() + 7) & !7;
    let dyn_size = dynamic.len() * 16;
    let total = dyn_off + dyn_size;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
    out.extend_from_slice(&machine.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHNUM as u16).to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(out.len(), EHDR_SIZE);

    push_phdr(&mut out, 1, 5, 0, total as u64, 0x1000); // PT_LOAD
    push_phdr(&mut out, 2, 6, dyn_off as u64, dyn_size as u64, 8); // PT_DYNAMIC
    assert_eq!(out.len(), strtab_off);

    out.extend_from_slice(&strtab);
    out.resize(dyn_off, 0);
    for (tag, value) in dynamic {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    assert_eq!(out.len(), total);
    out
}

pub fn write_elf(path: &Path, machine: u16, needed: &[&str], runpath: Option<&str>) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, elf64(machine, needed, runpath)).unwrap();
}

#[cfg(unix)]
pub fn symlink(target: &str, link: &Path) {
    fs::create_dir_all(link.parent().unwrap()).unwrap();
    std::os::unix::fs::symlink(target, link).unwrap();
}

/// x86-64 の小さなsysroot
///
/// ```text
/// bin/ls    -> libfoo.so.1, libc.so.6
/// bin/cp    -> libc.so.6, libbar.so
/// lib/libc.so.6 -> libc-2.31.so (-> ld-linux-x86-64.so.2)
/// lib64/ld-linux-x86-64.so.2
/// usr/lib/libfoo.so.1 (-> libc.so.6)
/// lib/libbar.so                       (aarch64、互換性なし)
/// usr/lib/x86_64-linux-gnu/libbar.so
/// ```
#[cfg(unix)]
pub fn make_sysroot(root: &Path) {
    write_elf(&root.join("bin/ls"), EM_X86_64, &["libfoo.so.1", "libc.so.6"], None);
    write_elf(&root.join("bin/cp"), EM_X86_64, &["libc.so.6", "libbar.so"], None);
    write_elf(&root.join("lib/libc-2.31.so"), EM_X86_64, &["ld-linux-x86-64.so.2"], None);
    symlink("libc-2.31.so", &root.join("lib/libc.so.6"));
    write_elf(&root.join("lib64/ld-linux-x86-64.so.2"), EM_X86_64, &[], None);
    write_elf(&root.join("usr/lib/libfoo.so.1"), EM_X86_64, &["libc.so.6"], None);
    write_elf(&root.join("lib/libbar.so"), EM_AARCH64, &[], None);
    write_elf(
        &root.join("usr/lib/x86_64-linux-gnu/libbar.so"),
        EM_X86_64,
        &[],
        None,
    );
}

pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedImport {
    pub binary: PathBuf,
    pub analyze: bool,
    pub decompile: Option<u32>,
}

/// analyzeHeadless の代わりに `.gpr` を作って記録だけするブリッジ
#[derive(Default)]
pub struct FakeBridge {
    pub imports: RefCell<Vec<RecordedImport>>,
    pub launched: RefCell<Vec<PathBuf>>,
    /// インポートに失敗させるファイル名
    pub failing: Vec<String>,
    /// `.gpr` を作らない（壊れたインストールの再現）
    pub skip_project_file: bool,
    /// デコンパイル時に返す関数（`None` なら main と puts）
    pub decompiled: Option<Vec<DecompiledFunction>>,
}

impl FakeBridge {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn decompiling(functions: Vec<DecompiledFunction>) -> Self {
        Self {
            decompiled: Some(functions),
            ..Self::default()
        }
    }

    pub fn imported_names(&self) -> Vec<String> {
        self.imports
            .borrow()
            .iter()
            .map(|i| i.binary.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }
}

impl GhidraBridge for FakeBridge {
    fn version(&self) -> &str {
        "11.2.1"
    }

    fn import(&self, request: &ImportRequest<'_>) -> Result<ImportedProgram> {
        let name = request
            .binary
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        self.imports.borrow_mut().push(RecordedImport {
            binary: request.binary.to_path_buf(),
            analyze: request.analyze,
            decompile: request.decompile,
        });

        if self.failing.contains(&name) {
            bail!("Import failed for file: {}", request.binary.display());
        }
        if !self.skip_project_file {
            fs::create_dir_all(request.project_location)?;
            fs::write(
                request
                    .project_location
                    .join(format!("{}.gpr", request.project_name)),
                b"",
            )?;
        }

        let functions = if let (Some(_), Some(functions)) = (request.decompile, &self.decompiled) {
            functions.clone()
        } else if request.decompile.is_some() {
            vec![
                DecompiledFunction {
                    entry: "00101000".to_string(),
                    name: "main".to_string(),
                    thunk: false,
                    signature: Some("int main(void)".to_string()),
                    code: Some("\nint main(void)\n{\n  return 0;\n}\n".to_string()),
                    error: None,
                },
                DecompiledFunction {
                    entry: "00101100".to_string(),
                    name: "puts".to_string(),
                    thunk: true,
                    signature: None,
                    code: None,
                    error: None,
                },
            ]
        } else {
            Vec::new()
        };

        Ok(ImportedProgram {
            program: ProgramRecord {
                name,
                language_id: "x86:LE:64:default".to_string(),
                compiler_spec: "gcc".to_string(),
                creation_date: "Mon Jan 06 12:00:00 UTC 2025".to_string(),
                function_count: functions.len(),
            },
            functions,
        })
    }

    fn launch_gui(&self, gpr: &Path) -> Result<()> {
        self.launched.borrow_mut().push(gpr.to_path_buf());
        Ok(())
    }
}
