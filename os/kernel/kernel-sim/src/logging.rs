use log::{LevelFilter, Log, Metadata, Record};
use std::cell::RefCell;
use std::sync::Once;

thread_local! {
    static LINES: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

struct CaptureLogger;

static LOGGER: CaptureLogger = CaptureLogger;
static INSTALL: Once = Once::new();

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        LINES.with_borrow_mut(|lines| {
            if let Some(lines) = lines {
                let mut line = String::new();
                if kernel_qemu::format_record(&mut line, record).is_ok() {
                    lines.push(line.trim_end().to_owned());
                }
            }
        });
    }

    fn flush(&self) {}
}

/// Records every log line emitted on the current thread while alive.
///
/// Tests run on separate threads, so captures never see each other's output.
pub struct LogCapture {
    _private: (),
}

impl LogCapture {
    /// Installs the process-wide capturing logger (once) and starts recording
    /// on this thread.
    #[must_use]
    pub fn start() -> Self {
        INSTALL.call_once(|| {
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(LevelFilter::Trace);
            }
        });
        LINES.with_borrow_mut(|lines| *lines = Some(Vec::new()));
        Self { _private: () }
    }

    /// Everything recorded so far, in `[LEVEL] target: message` form.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        LINES.with_borrow(|lines| lines.clone().unwrap_or_default())
    }

    /// Whether some line at `level` contains `needle`.
    #[must_use]
    pub fn contains(&self, level: log::Level, needle: &str) -> bool {
        let prefix = format!("[{level}]");
        self.lines()
            .iter()
            .any(|line| line.starts_with(&prefix) && line.contains(needle))
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        LINES.with_borrow_mut(|lines| *lines = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_only_while_alive() {
        log::info!("before");
        let capture = LogCapture::start();
        log::warn!(target: "frames", "double free of frame {:#x}", 0x5000);
        assert!(capture.contains(log::Level::Warn, "double free of frame 0x5000"));
        assert_eq!(capture.lines(), ["[WARN] frames: double free of frame 0x5000"]);
        drop(capture);

        let capture = LogCapture::start();
        assert!(capture.lines().is_empty());
    }
}
