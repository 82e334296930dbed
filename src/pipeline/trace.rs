use std::path::{Path, PathBuf};

use anyhow::Context;

/// Writes per-attempt prompt and response dumps for offline inspection.
pub struct TraceWriter {
    dir: PathBuf,
    enabled: bool,
}

impl TraceWriter {
    pub fn new(dir: PathBuf, enabled: bool) -> anyhow::Result<Self> {
        if enabled {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create trace dir: {}", dir.display()))?;
        }
        Ok(Self { dir, enabled })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn write_named_text(&self, name: &str, text: &str) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.dir.join(sanitize_filename(name));
        std::fs::write(&path, text).with_context(|| format!("write trace: {}", path.display()))?;
        Ok(())
    }

    /// `<task>.<attempt>.<kind>.txt`, e.g. `menu.file.2.response.txt`.
    pub fn write_attempt(
        &self,
        task_id: &str,
        attempt: usize,
        kind: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let name = format!("{task_id}.{attempt}.{kind}.txt");
        self.write_named_text(&name, text)
    }
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            c if c.is_control() => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_land_in_sanitized_files() {
        let dir = tempfile::tempdir().unwrap();
        let trace = TraceWriter::new(dir.path().join("_trace"), true).unwrap();
        trace.write_attempt("menu/file:open", 2, "response", "Datei").unwrap();
        let path = trace.dir().join("menu_file_open.2.response.txt");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "Datei");
    }

    #[test]
    fn disabled_writer_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let trace_dir = dir.path().join("_trace");
        let trace = TraceWriter::new(trace_dir.clone(), false).unwrap();
        trace.write_attempt("a", 1, "system", "x").unwrap();
        assert!(!trace_dir.exists());
    }
}
