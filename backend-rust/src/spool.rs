//! Bounded append-only on-disk FIFO used to absorb publisher outages.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct Spool {
    path: PathBuf,
    max_entries: usize,
    append_counter: u32,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path, max_entries, append_counter: 0 })
    }

    pub fn append(&mut self, line: &str) -> io::Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
        self.append_counter += 1;
        if self.append_counter >= 100 {
            self.append_counter = 0;
            self.trim()?;
        }
        Ok(())
    }

    fn read_lines(&self) -> io::Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(content.lines().map(|l| l.to_string()).collect())
    }

    /// Returns up to `max_lines` non-empty lines from the head, without
    /// removing them.
    pub fn peek(&self, max_lines: usize) -> io::Result<Vec<String>> {
        if max_lines == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .read_lines()?
            .into_iter()
            .filter(|l| !l.trim().is_empty())
            .take(max_lines)
            .collect())
    }

    pub fn drop_first(&self, count: usize) -> io::Result<()> {
        if count == 0 || !self.path.exists() {
            return Ok(());
        }
        let lines = self.read_lines()?;
        if count >= lines.len() {
            fs::remove_file(&self.path)?;
            return Ok(());
        }
        self.rewrite(&lines[count..])
    }

    pub fn depth(&self) -> io::Result<usize> {
        Ok(self.read_lines()?.len())
    }

    pub fn trim(&self) -> io::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let lines = self.read_lines()?;
        if lines.len() <= self.max_entries {
            return Ok(());
        }
        let kept = &lines[lines.len() - self.max_entries..];
        self.rewrite(kept)
    }

    fn rewrite(&self, lines: &[String]) -> io::Result<()> {
        let mut content = lines.join("\n");
        if !lines.is_empty() {
            content.push('\n');
        }
        fs::write(&self.path, content)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_spool(max_entries: usize) -> Spool {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("subaru_spool_test_{id}.jsonl"));
        let _ = fs::remove_file(&path);
        Spool::new(path, max_entries).unwrap()
    }

    #[test]
    fn test_append_then_drop_first_leaves_tail_in_order() {
        let mut spool = temp_spool(1000);
        for i in 0..10 {
            spool.append(&format!("{{\"seq\":{i}}}")).unwrap();
        }
        spool.drop_first(4).unwrap();
        assert_eq!(spool.depth().unwrap(), 6);
        let remaining = spool.peek(10).unwrap();
        assert_eq!(remaining.len(), 6);
        assert!(remaining[0].contains("\"seq\":4"));
        assert!(remaining[5].contains("\"seq\":9"));
    }

    #[test]
    fn test_drop_first_beyond_depth_empties_spool() {
        let mut spool = temp_spool(1000);
        for i in 0..3 {
            spool.append(&format!("{i}")).unwrap();
        }
        spool.drop_first(100).unwrap();
        assert_eq!(spool.depth().unwrap(), 0);
    }

    #[test]
    fn test_trim_keeps_newest_entries_over_max() {
        let mut spool = temp_spool(5);
        for i in 0..12 {
            spool.append(&format!("{i}")).unwrap();
        }
        spool.trim().unwrap();
        assert_eq!(spool.depth().unwrap(), 5);
        let remaining = spool.peek(5).unwrap();
        assert_eq!(remaining, vec!["7", "8", "9", "10", "11"]);
    }

    #[test]
    fn test_append_triggers_automatic_trim_every_hundred() {
        let mut spool = temp_spool(10);
        for i in 0..150 {
            spool.append(&format!("{i}")).unwrap();
        }
        assert!(spool.depth().unwrap() <= 10);
    }
}
