//! Progress reporting contract (§4.N). Grounded in `original_source/progress.py`.
//!
//! The trait boundary exists so the core and pipeline never depend on a
//! concrete rendering backend; the terminal implementation here uses
//! `tracing` the way the rest of the ambient stack logs, rather than
//! pulling in a dedicated progress-bar crate the teacher doesn't carry.

pub trait DownloadProgress {
    fn update(&mut self, bytes_downloaded: u64);
    fn close(&mut self);
}

pub trait ProgressReporter {
    fn update_status(&self, message: &str);
    fn create_download_bar(&self, total_bytes: u64, description: &str) -> Box<dyn DownloadProgress>;
    fn step(&self, step_name: &str, current: usize, total: usize);
}

/// No-op reporter, used under `--json` and in tests.
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn update_status(&self, _message: &str) {}
    fn create_download_bar(&self, _total_bytes: u64, _description: &str) -> Box<dyn DownloadProgress> {
        Box::new(NullDownloadProgress)
    }
    fn step(&self, _step_name: &str, _current: usize, _total: usize) {}
}

pub struct NullDownloadProgress;

impl DownloadProgress for NullDownloadProgress {
    fn update(&mut self, _bytes_downloaded: u64) {}
    fn close(&mut self) {}
}

/// Terminal reporter for interactive use: routes to `tracing::info!` rather
/// than rendering a bar in place, since the rest of the CLI already logs
/// through `tracing`.
pub struct TerminalProgressReporter;

impl ProgressReporter for TerminalProgressReporter {
    fn update_status(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn create_download_bar(&self, total_bytes: u64, description: &str) -> Box<dyn DownloadProgress> {
        tracing::info!(total_bytes, "{description}");
        Box::new(TerminalDownloadProgress { downloaded: 0, total_bytes })
    }

    fn step(&self, step_name: &str, current: usize, total: usize) {
        tracing::info!("[{current}/{total}] {step_name}");
    }
}

pub struct TerminalDownloadProgress {
    downloaded: u64,
    total_bytes: u64,
}

impl DownloadProgress for TerminalDownloadProgress {
    fn update(&mut self, bytes_downloaded: u64) {
        self.downloaded += bytes_downloaded;
        tracing::debug!(downloaded = self.downloaded, total = self.total_bytes, "download progress");
    }

    fn close(&mut self) {
        tracing::debug!(downloaded = self.downloaded, "download complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reporter_is_silent_and_harmless() {
        let reporter = NullProgressReporter;
        reporter.update_status("ignored");
        let mut bar = reporter.create_download_bar(100, "ignored");
        bar.update(50);
        bar.close();
        reporter.step("ignored", 1, 2);
    }
}
