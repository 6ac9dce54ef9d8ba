//! Live progress rendering during the run phase.

use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use sqlstress_engine::Progress;

/// Creates a spinner on stderr and returns the callback feeding it.
///
/// The bar stays alive as long as the returned closure does; the engine
/// drops it when the run ends, which clears the spinner.
pub fn renderer() -> Result<impl FnMut(Progress) + Send + 'static> {
    let bar = ProgressBar::new_spinner()
        .with_style(ProgressStyle::with_template("{spinner} {msg}")?)
        .with_message("starting agents...");
    bar.enable_steady_tick(Duration::from_millis(100));

    Ok(move |progress: Progress| bar.set_message(format_progress(&progress)))
}

fn format_progress(progress: &Progress) -> String {
    let elapsed = progress.elapsed.as_secs();
    format!(
        "{:02}:{:02} | {} agents / run {} queries ({:.0} qps)",
        elapsed / 60,
        elapsed % 60,
        progress.running_agents,
        progress.executed,
        progress.current_qps,
    )
}
