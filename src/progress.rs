//! Progress-bar helpers: thin `indicatif` wrappers shared by every
//! long-running batch operation (ingest, purge, geo aggregation).

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub static PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}";
pub static SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {spinner:2.cyan/blue} {msg}";
pub static SPINNER_TOTALS_TEMPLATE: &str = "{spinner:2.cyan/blue} {msg}: {human_pos}";
pub static BYTES_PROGRESS_TEMPLATE: &str =
    "[{elapsed_precise}] {bar:40.cyan/blue} {decimal_bytes:>7}/{decimal_total_bytes:7} @ {decimal_bytes_per_sec} [eta: {eta}] {msg}";

pub fn new_spinner(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TEMPLATE).expect("invalid spinner template");
    ProgressBar::new_spinner().with_message(message.to_string()).with_style(style)
}

pub fn new_progress_bar(total: usize, message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE).expect("invalid progress bar template");
    ProgressBar::new(total as u64).with_message(message.to_string()).with_style(style)
}

pub fn new_progress_bar_bytes(total: usize, message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(BYTES_PROGRESS_TEMPLATE).expect("invalid progress bar template");
    ProgressBar::new(total as u64).with_message(message.to_string()).with_style(style)
}

pub fn new_spinner_totals(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TOTALS_TEMPLATE).expect("invalid spinner template");
    ProgressBar::new_spinner().with_message(message.to_string()).with_style(style)
}

/// Bars for one ingest pass: bytes read, rows parsed, rows accepted.
#[derive(Clone)]
pub struct IngestBars {
    _bars: MultiProgress,
    pub bytes: ProgressBar,
    pub rows_read: ProgressBar,
    pub rows_accepted: ProgressBar,
}

impl IngestBars {
    pub fn new(total_bytes: usize, message: &str) -> IngestBars {
        let bars = MultiProgress::new();
        let bytes = new_progress_bar_bytes(total_bytes, message);
        let rows_read = new_spinner_totals("Rows read");
        let rows_accepted = new_spinner_totals("Rows accepted");
        bars.add(bytes.clone());
        bars.add(rows_read.clone());
        bars.add(rows_accepted.clone());

        bytes.enable_steady_tick(Duration::from_millis(200));
        rows_read.enable_steady_tick(Duration::from_millis(200));
        rows_accepted.enable_steady_tick(Duration::from_millis(200));

        IngestBars { _bars: bars, bytes, rows_read, rows_accepted }
    }

    pub fn finish(&self) {
        self.bytes.finish();
        self.rows_read.finish();
        self.rows_accepted.finish();
    }
}

/// Bars for one curation pass: one bar per stage (harmonise, purge, geo,
/// classify), added to the same `MultiProgress` so they render together.
#[derive(Clone)]
pub struct CurateBars {
    bars: MultiProgress,
    pub stage: ProgressBar,
    others: Vec<ProgressBar>,
}

impl CurateBars {
    pub fn new(total: usize) -> CurateBars {
        let bars = MultiProgress::new();
        let stage = new_progress_bar(total, "Curating");
        bars.add(stage.clone());
        CurateBars { bars, stage, others: vec![] }
    }

    pub fn add_progress_bar(&mut self, total: usize, message: &str) -> ProgressBar {
        let bar = new_progress_bar(total, message);
        self.bars.add(bar.clone());
        self.others.push(bar.clone());
        bar
    }

    pub fn finish(&self) {
        self.stage.finish();
        for bar in &self.others {
            bar.finish();
        }
    }
}
