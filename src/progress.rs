use std::io::{self, Write};
use std::time::Instant;

use crate::pipeline::{DispatchEvent, LogLevel};
use crate::textutil::clip_for_log;

/// Batch progress on stderr for the CLI.
pub struct ConsoleProgress {
    enabled: bool,
    t0: Instant,
}

impl ConsoleProgress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            t0: Instant::now(),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] {}", msg.as_ref());
    }

    pub fn progress(&self, label: &str, current: usize, total: usize) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] {}", progress_line(label, current, total));
    }

    /// Prints the lines a user cares about; streamed fragments are skipped.
    pub fn report(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::BatchStarted { total } => self.info(format!("batch started: {total} item(s)")),
            DispatchEvent::BatchProgress { completed, total } => {
                self.progress("translated", *completed, *total)
            }
            DispatchEvent::ItemResult(outcome) => {
                if let Some(err) = outcome.error.as_deref() {
                    self.info(format!("FAILED {}: {}", outcome.id, clip_for_log(err, 160)));
                } else if !outcome.issues.is_empty() {
                    self.info(format!(
                        "{}: {} open issue(s) after {} attempt(s)",
                        outcome.id,
                        outcome.issues.len(),
                        outcome.attempts
                    ));
                }
            }
            DispatchEvent::WorkerLog { message, level } if *level != LogLevel::Info => {
                self.info(format!("{level}: {}", clip_for_log(message, 240)))
            }
            DispatchEvent::BatchFinished {
                results,
                completed,
                total,
            } => {
                let failed = results.iter().filter(|r| !r.is_ok()).count();
                self.info(format!("batch finished: {completed}/{total} done, {failed} failed"));
            }
            _ => {}
        }
    }
}

fn progress_line(label: &str, current: usize, total: usize) -> String {
    let total = total.max(1);
    let current = current.min(total);
    let pct = (current as f64 / total as f64) * 100.0;
    format!("{label} {current}/{total} ({pct:5.1}%)")
}

fn fmt_elapsed(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
