use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

const BAR_SCALE: u64 = 1000;

/// Receives human-readable log lines and progress fractions from the pipeline.
/// Stages never touch presentation state themselves.
pub trait Observer: Send + Sync {
    fn log_line(&self, line: &str);

    /// `fraction` is clamped to `[0, 1]` by implementations.
    fn progress(&self, fraction: f64);
}

/// Terminal observer: log lines go through `tracing`, progress drives a bar.
pub struct ConsoleObserver {
    pb: ProgressBar,
}

impl ConsoleObserver {
    pub fn new() -> anyhow::Result<Self> {
        let pb = ProgressBar::new(BAR_SCALE);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}%")?
                .progress_chars("=> "),
        );
        Ok(Self { pb })
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl Observer for ConsoleObserver {
    fn log_line(&self, line: &str) {
        self.pb.suspend(|| info!("{}", line));
    }

    fn progress(&self, fraction: f64) {
        let clamped = fraction.clamp(0.0, 1.0);
        self.pb.set_position((clamped * BAR_SCALE as f64).round() as u64);
    }
}

/// Progress fraction for `done` out of `total`, treating an empty total as done.
pub fn fraction(done: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}
