use std::path::PathBuf;
use thiserror::Error;

/// BSD sysexits互換の終了コード
pub const EX_OK: u8 = 0;
pub const EX_DATAERR: u8 = 65;
pub const EX_NOINPUT: u8 = 66;
pub const EX_UNAVAILABLE: u8 = 69;
pub const EX_SOFTWARE: u8 = 70;
pub const EX_CANTCREAT: u8 = 73;
pub const EX_IOERR: u8 = 74;

/// キックスタート全体のエラー
///
/// 各バリアントはプロセスの終了コードに1対1で対応する
#[derive(Debug, Error)]
pub enum KickError {
    #[error("Sysroot {} does not exist", .0.display())]
    MissingSysroot(PathBuf),

    #[error("Target {} does not exist", .0.display())]
    MissingTarget(PathBuf),

    #[error("Invalid target pattern '{pattern}': {message}")]
    BadPattern { pattern: String, message: String },

    #[error("No target to import")]
    NoTargets,

    #[error("Too many symlink levels resolving {}; circular symlink suspected", .0.display())]
    SymlinkLoop(PathBuf),

    #[error("Ghidra project {} already exists, use '-f' to force re-importing binaries", .0.display())]
    ProjectExists(PathBuf),

    #[error("Cannot create {}: {source}", path.display())]
    CannotCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ghidra is unavailable: {0}")]
    GhidraUnavailable(String),

    #[error("Ghidra project {} not found", .0.display())]
    ProjectNotFound(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed analysis output: {0}")]
    Data(String),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl KickError {
    /// 対応する終了コード
    pub fn exit_code(&self) -> u8 {
        match self {
            KickError::MissingSysroot(_)
            | KickError::MissingTarget(_)
            | KickError::BadPattern { .. }
            | KickError::NoTargets
            | KickError::SymlinkLoop(_) => EX_NOINPUT,
            KickError::ProjectExists(_) | KickError::CannotCreate { .. } => EX_CANTCREAT,
            KickError::GhidraUnavailable(_) | KickError::ProjectNotFound(_) => EX_UNAVAILABLE,
            KickError::Io { .. } => EX_IOERR,
            KickError::Data(_) => EX_DATAERR,
            KickError::Internal(_) => EX_SOFTWARE,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KickError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn cannot_create(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KickError::CannotCreate {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, KickError>;
