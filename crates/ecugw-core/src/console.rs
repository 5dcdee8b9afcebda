//! Diagnostic console collaborator

use parking_lot::Mutex;

/// Line-oriented diagnostic output
pub trait Console: Send + Sync {
    fn print_line(&self, line: &str);
}

/// Console that forwards lines to the `console` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsole;

impl Console for TracingConsole {
    fn print_line(&self, line: &str) {
        tracing::info!(target: "console", "{}", line);
    }
}

/// Console that buffers lines in memory
#[derive(Debug, Default)]
pub struct MemoryConsole {
    lines: Mutex<Vec<String>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl Console for MemoryConsole {
    fn print_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}
