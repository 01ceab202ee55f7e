use indexmap::IndexSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::{self, KickOptions};
use crate::decompile::{commit_sources, export_sources, SourceExport};
use crate::deps::{BinaryFormat, BinaryInfo, LibrarySearch};
use crate::error::{KickError, Result};
use crate::ghidra_headless::{GhidraBridge, GhidraHeadless, ImportRequest, ImportedProgram};
use crate::progress::Progress;
use crate::project::{BinaryKind, ProjectLayout};
use crate::sysroot::{expand_targets, Sysroot};

/// キックスタート1回分の結果
#[derive(Debug, Clone, Default)]
pub struct KickReport {
    pub gpr: PathBuf,
    /// 読み込みに成功したターゲット
    pub targets: Vec<PathBuf>,
    pub dependencies: Vec<PathBuf>,
    pub imported_targets: usize,
    pub imported_dependencies: usize,
    pub failed_imports: Vec<PathBuf>,
    /// ターゲット名ごとのデコンパイル結果
    pub decompiled: Vec<(String, SourceExport)>,
    pub zip: Option<PathBuf>,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn describe(name: &str, imported: &ImportedProgram) -> String {
    format!(
        "Imported {}, creation_date={}, language_id={}",
        name, imported.program.creation_date, imported.program.language_id
    )
}

/// Ghidraプロジェクトのキックスタート
pub struct Kickstart {
    options: KickOptions,
}

impl Kickstart {
    pub fn new(options: KickOptions) -> Self {
        Self { options }
    }

    /// インストール済みのGhidra（analyzeHeadless）で実行
    pub fn run(&self) -> Result<KickReport> {
        let install_dir = config::ghidra_install_dir(self.options.ghidra_install_dir.as_deref());
        self.execute(|| {
            info!("🐉 Starting Ghidra from {} 🐉", install_dir.display());
            GhidraHeadless::new(&install_dir).inspect_err(|_| {
                error!("Starting Ghidra from {}", install_dir.display());
            })
        })
    }

    /// 任意の解析ブリッジで実行
    ///
    /// `connect` はsysroot・ターゲット・既存プロジェクトの検証が終わってから呼ばれる
    pub fn execute<B, F>(&self, connect: F) -> Result<KickReport>
    where
        B: GhidraBridge,
        F: FnOnce() -> Result<B>,
    {
        let options = &self.options;

        let sysroot = Sysroot::open(&options.sysroot)?;
        let targets = expand_targets(&options.targets, &sysroot, options.ignore_missing)?;

        let layout = ProjectLayout::new(options.project_dir.as_deref(), &options.project_name);
        if options.force_remove && layout.dir.is_dir() {
            layout.force_remove()?;
        } else if options.remove_existing_binaries {
            layout.remove_existing_binaries()?;
        }
        layout.ensure_importable(options.force_import)?;

        let bridge = connect()?;
        info!("Using Ghidra {}", bridge.version());

        info!(
            "Setting up project '{}' in {}",
            layout.name,
            layout.display_dir().display()
        );
        layout.create_tree()?;
        info!("Using sysroot {}", sysroot.path().display());

        let mut report = KickReport {
            gpr: layout.gpr.clone(),
            ..KickReport::default()
        };

        let (loaded, dependencies) = self.collect_binaries(&sysroot, &targets, &layout)?;
        report.targets = loaded.iter().cloned().collect();
        report.dependencies = dependencies.iter().cloned().collect();

        if !options.skip_dependency_import {
            info!("Importing {} shared object dependencies", dependencies.len());
        }
        info!("Importing {} targets", loaded.len());
        if options.skip_target_analysis {
            info!("Skipping target analysis");
        }

        if loaded.is_empty() {
            return Err(KickError::NoTargets);
        }

        if !options.skip_dependency_import && !dependencies.is_empty() {
            self.import_dependencies(&bridge, &layout, &dependencies, &mut report);
        }
        self.import_targets(&bridge, &layout, &loaded, &mut report);

        if options.zip_project {
            match layout.zip() {
                Ok(archive) => {
                    info!("Project zip saved {}", archive.display());
                    report.zip = Some(archive);
                }
                Err(e) => {
                    error!("Failed to zip {}", layout.dir.display());
                    error!("{:#}", e);
                }
            }
        }

        if !layout.is_ready() {
            return Err(KickError::ProjectNotFound(layout.gpr.clone()));
        }
        let gpr = fs::canonicalize(&layout.gpr).unwrap_or_else(|_| layout.gpr.clone());
        info!("The project is ready to be opened with Ghidra {}", gpr.display());
        report.gpr = gpr;

        if options.start_ghidra {
            if let Err(e) = bridge.launch_gui(&report.gpr) {
                error!("{:#}", e);
            }
        }

        Ok(report)
    }

    /// ターゲットを読み込み、依存ライブラリを解決（必要ならコピー）
    ///
    /// 読み込めないターゲットは捨てて続行する
    fn collect_binaries(
        &self,
        sysroot: &Sysroot,
        targets: &IndexSet<PathBuf>,
        layout: &ProjectLayout,
    ) -> Result<(IndexSet<PathBuf>, IndexSet<PathBuf>)> {
        let options = &self.options;

        if options.copy_to_project {
            info!("Saving binaries under project tree");
        }
        if options.skip_dependency_import {
            info!("Skipping target dependency import");
        } else {
            info!("Resolving dependencies for targets {:?}", options.targets);
        }

        let search = LibrarySearch::new(sysroot);
        let mut loaded = IndexSet::new();
        let mut dependencies = IndexSet::new();

        for target in targets {
            let info = match BinaryInfo::inspect(target) {
                Ok(info) => info,
                Err(e) => {
                    error!("{:#}", e);
                    continue;
                }
            };
            debug!(
                "Target {}: {} {}, {}, pic={}, execstack={}, interpreter={}",
                target.display(),
                info.format,
                info.architecture,
                info.linking,
                info.pic,
                info.execstack,
                info.interpreter.as_deref().unwrap_or("none")
            );

            if options.copy_to_project {
                layout.copy_binary(target, BinaryKind::Target)?;
            }

            if !options.skip_dependency_import {
                if info.format != BinaryFormat::Elf && !info.needed.is_empty() {
                    warn!(
                        "Dependency discovery is not supported for {} targets, {} needs {:?}",
                        info.format,
                        info.file_name(),
                        info.needed
                    );
                }

                let set = search.resolve_dependencies(&info);
                for name in &set.missing {
                    warn!("Could not resolve {} needed by {}", name, info.file_name());
                }
                for (name, path) in &set.resolved {
                    debug!("Resolved {} to {}", name, path.display());
                    if dependencies.insert(path.clone()) && options.copy_to_project {
                        layout.copy_binary(path, BinaryKind::Dependency)?;
                    }
                }
            }

            loaded.insert(target.clone());
        }

        Ok((loaded, dependencies))
    }

    fn import_dependencies<B: GhidraBridge>(
        &self,
        bridge: &B,
        layout: &ProjectLayout,
        dependencies: &IndexSet<PathBuf>,
        report: &mut KickReport,
    ) {
        let analyze = self.options.do_dependency_analysis;
        let mut progress = Progress::start("Importing dependencies...", dependencies.len());

        for dependency in dependencies {
            let name = file_name(dependency);
            if analyze {
                progress.status(format!("🐉 Analyzing {} 🐉", name));
            } else {
                progress.status(format!("Importing {}", name));
            }

            let request = ImportRequest {
                binary: dependency,
                project_location: &layout.location,
                project_name: &layout.name,
                analyze,
                decompile: None,
            };
            match bridge.import(&request) {
                Ok(imported) => {
                    report.imported_dependencies += 1;
                    if analyze {
                        progress.advance(format!("🐉 Analysis of {} complete 🐉", name));
                    } else {
                        progress.advance(describe(&name, &imported));
                    }
                }
                Err(e) => {
                    error!("Failed to import {}: {:#}", name, e);
                    report.failed_imports.push(dependency.clone());
                    progress.advance(format!("Skipped {}", name));
                }
            }
        }

        progress.finish("Dependencies import complete");
    }

    fn import_targets<B: GhidraBridge>(
        &self,
        bridge: &B,
        layout: &ProjectLayout,
        targets: &IndexSet<PathBuf>,
        report: &mut KickReport,
    ) {
        let options = &self.options;
        let analyze = !options.skip_target_analysis;
        let decompile = options
            .do_target_decompilation
            .then_some(options.decompile_timeout);
        let mut progress = Progress::start("Importing targets...", targets.len());

        for target in targets {
            let name = file_name(target);
            if analyze {
                progress.status(format!("🐉 Analyzing {} 🐉", name));
            } else {
                progress.status(format!("Importing {}", name));
            }

            let request = ImportRequest {
                binary: target,
                project_location: &layout.location,
                project_name: &layout.name,
                analyze,
                decompile,
            };
            let imported = match bridge.import(&request) {
                Ok(imported) => imported,
                Err(e) => {
                    error!("Failed to import {}: {:#}", name, e);
                    report.failed_imports.push(target.clone());
                    progress.advance(format!("Skipped {}", name));
                    continue;
                }
            };

            report.imported_targets += 1;
            if analyze {
                progress.advance(format!("🐉 Analysis of {} complete 🐉", name));
            } else {
                progress.advance(describe(&name, &imported));
            }

            if decompile.is_some() {
                let src_dir = layout.target_src_dir(&name);
                match export_sources(&src_dir, &imported.functions) {
                    Ok(export) => {
                        info!(
                            "Decompiled {} functions of {} into {} ({} thunks skipped, {} failed)",
                            export.written,
                            name,
                            src_dir.display(),
                            export.thunks,
                            export.failed
                        );
                        commit_sources(&src_dir);
                        report.decompiled.push((name, export));
                    }
                    Err(e) => {
                        // 書き出しに失敗しても残りのターゲットは続行
                        error!("Failed to export sources of {}: {}", name, e);
                        report.failed_imports.push(target.clone());
                    }
                }
            }
        }

        progress.finish("Targets import complete");
    }
}
