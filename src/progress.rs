use std::fmt::Display;
use std::time::{Duration, Instant};

/// 経過時間を `H:MM:SS` 形式にする
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// 件数ベースの進捗レポーター（`[m/n]` + 経過時間をログに出す）
#[derive(Debug)]
pub struct Progress {
    task: String,
    total: usize,
    completed: usize,
    started: Instant,
}

impl Progress {
    pub fn start(task: impl Into<String>, total: usize) -> Self {
        let task = task.into();
        tracing::info!("{} [0/{}]", task, total);
        Self {
            task,
            total,
            completed: 0,
            started: Instant::now(),
        }
    }

    /// 1件進めて状況をログ出力
    pub fn advance(&mut self, message: impl Display) {
        self.completed = (self.completed + 1).min(self.total);
        tracing::info!(
            "[{}/{}] {} ({})",
            self.completed,
            self.total,
            message,
            format_elapsed(self.started.elapsed())
        );
    }

    /// 進めずに状況だけ報告
    pub fn status(&self, message: impl Display) {
        tracing::info!("[{}/{}] {}", self.completed, self.total, message);
    }

    pub fn finish(self, message: impl Display) {
        tracing::info!(
            "{} [{}/{}] in {}",
            message,
            self.completed,
            self.total,
            format_elapsed(self.started.elapsed())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(83)), "0:01:23");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 5)), "3:00:05");
    }

    #[test]
    fn test_progress_never_exceeds_total() {
        let mut progress = Progress::start("Importing", 1);
        progress.advance("one");
        progress.advance("extra");
        assert_eq!(progress.completed, 1);
    }
}
