//! Progress bar for transfer runs.

use std::io::{self, IsTerminal};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use onedrive_core::transfer::ProgressFn;

const BAR_TEMPLATE: &str =
    "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Whether to draw a bar: stderr is a terminal and output is not quieted.
pub(crate) fn should_show_progress(stderr_is_terminal: bool, quiet: bool) -> bool {
    stderr_is_terminal && !quiet
}

/// Progress bar wrapper; hidden when progress output is disabled.
pub(crate) struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub(crate) fn new(label: &str, quiet: bool) -> Self {
        let bar = if should_show_progress(io::stderr().is_terminal(), quiet) {
            let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
            bar.set_style(
                ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Callback for the transfer runner.
    pub(crate) fn callback(&self) -> ProgressFn {
        let bar = self.bar.clone();
        Arc::new(move |offset, total| {
            bar.set_length(total);
            bar.set_position(offset);
        })
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
