use std::{
    io::{self, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use udfu::{DfuEvent, DfuObserver, Phase};

const BAR_WIDTH: usize = 60;

/// Renders session events on the terminal.
#[derive(Default)]
pub(crate) struct ConsoleObserver {
    // a progress line is being redrawn with '\r'
    in_progress: AtomicBool,
}

impl ConsoleObserver {
    /// Terminate a pending progress line.
    pub(crate) fn finish(&self) {
        if self.in_progress.swap(false, Ordering::Relaxed) {
            println!();
        }
    }

    fn progress(&self, phase: Phase, done: usize, total: usize) {
        match phase {
            Phase::Erase => {
                print!("\r  Erasing page {done:2} of {total:2}")
            }
            Phase::Download | Phase::Upload => {
                let label = if phase == Phase::Download {
                    "Flashing"
                } else {
                    "Reading"
                };
                if total == 0 || total == usize::MAX {
                    print!("\r  {label} {done} bytes");
                } else {
                    let percentage = (100 * done) / total;
                    let filled = (BAR_WIDTH * done) / total;
                    print!(
                        "\r  {} {:3}% [{}]",
                        label,
                        percentage,
                        "#".repeat(filled) + &" ".repeat(BAR_WIDTH - filled)
                    );
                }
            }
        }
        let _ = io::stdout().flush();
        self.in_progress.store(done < total, Ordering::Relaxed);
        if done >= total {
            println!();
        }
    }
}

impl DfuObserver for ConsoleObserver {
    fn on_event(&self, event: &DfuEvent) {
        if let DfuEvent::Progress { phase, done, total } = event {
            self.progress(*phase, *done, *total);
            return;
        }
        self.finish();
        match event {
            DfuEvent::Info(msg) => println!("{msg}"),
            DfuEvent::Warning(msg) => println!("Warning: {msg}"),
            DfuEvent::Error(msg) => eprintln!("{msg}"),
            DfuEvent::Retry {
                attempt,
                max_attempts,
            } => println!("Retry attempt {attempt}/{max_attempts}"),
            DfuEvent::Progress { .. } => {}
        }
    }
}
