use clap::Parser;
use std::path::PathBuf;

use crate::config::KickOptions;

/// A simple colorful tool to kickstart Ghidra projects from the command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "dragonkick", version, about, long_about = None)]
pub struct Cli {
    /// Print verbose information messages
    #[arg(short, long)]
    pub verbose: bool,

    /// Target binaries (glob patterns are expanded under the sysroot)
    #[arg(required = true, value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Copy original targets/dependencies into the project tree
    #[arg(short = 'c', long, help_heading = "Project options")]
    pub copy_to_project: bool,

    /// Remove the existing project before proceeding
    #[arg(short = 'F', long, help_heading = "Project options")]
    pub force_remove: bool,

    /// Force re-import when the project already exists
    #[arg(short = 'f', long, help_heading = "Project options")]
    pub force_import: bool,

    /// Ghidra project name
    #[arg(short = 'n', long, value_name = "NAME", help_heading = "Project options")]
    pub project_name: String,

    /// Project output directory [default: ./NAME]
    #[arg(short = 'o', long, value_name = "DIR", help_heading = "Project options")]
    pub project_dir: Option<PathBuf>,

    /// Remove the previously copied targets/dependencies from the project tree
    #[arg(short = 'r', long, help_heading = "Project options")]
    pub remove_existing_binaries: bool,

    /// Open the project in Ghidra after kickstart
    #[arg(short = 's', long, help_heading = "Project options")]
    pub start_ghidra: bool,

    /// Create a zip archive of the project tree
    #[arg(short = 'z', long, help_heading = "Project options")]
    pub zip_project: bool,

    /// Skip importing shared object dependencies into the project
    #[arg(long, help_heading = "Analysis options")]
    pub skip_dependency_import: bool,

    /// Skip auto-analyzing the targets
    #[arg(long, help_heading = "Analysis options")]
    pub skip_target_analysis: bool,

    /// Perform shared object dependencies analysis
    #[arg(short = 'a', long, help_heading = "Analysis options")]
    pub do_dependency_analysis: bool,

    /// Decompile and export functions code under the project tree
    #[arg(short = 'd', long, help_heading = "Analysis options")]
    pub do_target_decompilation: bool,

    /// Per-function decompiler timeout in seconds (0 = no limit)
    #[arg(long, value_name = "SECS", default_value_t = 0, help_heading = "Analysis options")]
    pub decompile_timeout: u32,

    /// Ignore missing target files
    #[arg(short = 'I', long, help_heading = "Path options")]
    pub ignore_missing: bool,

    /// Search for all targets/dependencies under SYSROOT
    #[arg(
        short = 'R',
        long,
        value_name = "SYSROOT",
        default_value = std::path::MAIN_SEPARATOR_STR,
        help_heading = "Path options"
    )]
    pub sysroot: PathBuf,

    /// Ghidra installation directory [env: GHIDRA_INSTALL_DIR, default: /opt/ghidra]
    #[arg(short = 'G', long, value_name = "DIR", help_heading = "Path options")]
    pub ghidra_install_dir: Option<PathBuf>,
}

impl From<Cli> for KickOptions {
    fn from(cli: Cli) -> Self {
        KickOptions {
            targets: cli.targets,
            project_name: cli.project_name,
            project_dir: cli.project_dir,
            sysroot: cli.sysroot,
            ghidra_install_dir: cli.ghidra_install_dir,
            verbose: cli.verbose,
            copy_to_project: cli.copy_to_project,
            force_remove: cli.force_remove,
            force_import: cli.force_import,
            remove_existing_binaries: cli.remove_existing_binaries,
            start_ghidra: cli.start_ghidra,
            zip_project: cli.zip_project,
            skip_dependency_import: cli.skip_dependency_import,
            skip_target_analysis: cli.skip_target_analysis,
            do_dependency_analysis: cli.do_dependency_analysis,
            do_target_decompilation: cli.do_target_decompilation,
            decompile_timeout: cli.decompile_timeout,
            ignore_missing: cli.ignore_missing,
        }
    }
}
