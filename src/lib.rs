//! dragonkick ライブラリ
//!
//! Ghidraプロジェクトの立ち上げ（依存解決・インポート・解析・デコンパイル）を自動化する

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;

// パス解決と依存ライブラリ探索
pub mod sysroot;
pub mod deps;

// Ghidra Headless連携
pub mod ghidra_headless;

// プロジェクトツリーとデコンパイル結果
pub mod project;
pub mod decompile;
pub mod source_repo;

pub mod progress;
pub mod kickstart;

pub use error::{KickError, Result};
pub use kickstart::{KickReport, Kickstart};
