//! Architectural Enforcement Integration Tests
//!
//! This package contains tests that enforce architectural principles of the
//! orchestration core:
//! - No thread sleeps on the async runtime
//! - No blocking file or network I/O outside the configuration loader
//! - No `unwrap()`/`expect()` on production paths
//! - No terminal output from the library
//! - Time is read through `tokio::time` so paused-clock tests stay valid
//!
//! Each check scans the non-test portion of every source file of the core
//! crate (everything before its `#[cfg(test)]` module).

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Source directory of the core crate
#[must_use]
pub fn core_src_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../conductor/core/src")
        .components()
        .collect()
}

/// A line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File, relative to the core `src` directory
    pub file: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text, trimmed
    pub text: String,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.number, self.text)
    }
}

/// Production (non-test, non-comment) lines of every `.rs` file under `root`
#[must_use]
pub fn production_lines(root: &Path) -> Vec<SourceLine> {
    let mut lines = Vec::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
    {
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let file = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();

        for (idx, raw) in content.lines().enumerate() {
            let text = raw.trim();
            if text.starts_with("#[cfg(test)]") {
                break;
            }
            if text.starts_with("//") || text.is_empty() {
                continue;
            }
            lines.push(SourceLine {
                file: file.clone(),
                number: idx + 1,
                text: text.to_string(),
            });
        }
    }
    lines
}

/// Production lines containing any of `patterns`, excluding `allowed` files
#[must_use]
pub fn violations(patterns: &[&str], allowed: &[&str]) -> Vec<SourceLine> {
    production_lines(&core_src_dir())
        .into_iter()
        .filter(|line| !allowed.iter().any(|a| line.file == Path::new(a)))
        .filter(|line| patterns.iter().any(|p| line.text.contains(p)))
        .collect()
}

fn report(rule: &str, found: &[SourceLine]) -> String {
    let mut msg = format!("{rule}: {} violation(s)\n", found.len());
    for line in found {
        msg.push_str(&format!("  {line}\n"));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_found() {
        let lines = production_lines(&core_src_dir());
        assert!(
            lines.iter().any(|l| l.file == Path::new("orchestrator.rs")),
            "core sources not found under {}",
            core_src_dir().display()
        );
    }

    #[test]
    fn no_thread_sleep() {
        let found = violations(&["thread::sleep"], &[]);
        assert!(found.is_empty(), "{}", report("std::thread::sleep blocks a runtime thread", &found));
    }

    #[test]
    fn no_blocking_io_outside_config() {
        let found = violations(
            &["std::fs::", "std::net::", "std::io::stdin"],
            &["config/mod.rs"],
        );
        assert!(found.is_empty(), "{}", report("blocking I/O in async code", &found));
    }

    #[test]
    fn no_unwrap_or_expect() {
        let found = violations(&[".unwrap()", ".expect("], &[]);
        assert!(found.is_empty(), "{}", report("unwrap/expect on a production path", &found));
    }

    #[test]
    fn no_terminal_output() {
        let found = violations(&["println!", "eprintln!", "dbg!("], &[]);
        assert!(found.is_empty(), "{}", report("library writes to the terminal", &found));
    }

    #[test]
    fn time_comes_from_tokio() {
        let found = violations(&["std::time::Instant", "SystemTime::now"], &[]);
        assert!(found.is_empty(), "{}", report("wall clock bypasses tokio::time", &found));
    }
}
