//! 📊 Progress: how many segments have made it downstream, and how fast.
//!
//! 🚀 Counts emitted segments against the selection total, sums their bytes,
//! and keeps a 5-second sliding window of samples for rates. Renders a
//! borderless comfy-table as the message of an indicatif bar.
//!
//! Hidden unless `runtime.show_progress` is set. A hidden bar still counts,
//! it just keeps its opinions to itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 📦 Bytes, scaled to whatever unit keeps the number short.
fn format_bytes(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// 🔢 `1234567` → `"1,234,567"`.
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS once it has been a while.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

struct Rates {
    segments_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Emission progress for one pipeline run.
pub(crate) struct ProgressMetrics {
    label: String,
    total_segments: u64,
    emitted_segments: u64,
    emitted_bytes: u64,
    progress_bar: ProgressBar,
    // 🔄 (when, bytes so far, segments so far)
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMetrics")
            .field("label", &self.label)
            .field("total_segments", &self.total_segments)
            .field("emitted_segments", &self.emitted_segments)
            .field("emitted_bytes", &self.emitted_bytes)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 `visible = false` draws nothing but still keeps count.
    pub(crate) fn new(label: String, total_segments: u64, visible: bool) -> Self {
        let progress_bar = if visible {
            let bar = ProgressBar::new(total_segments);
            let style = ProgressStyle::default_bar()
                .template("{msg}\n| [{bar:40.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-");
            bar.set_style(style);
            bar
        } else {
            ProgressBar::hidden()
        };

        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64, 0u64));

        Self {
            label,
            total_segments,
            emitted_segments: 0,
            emitted_bytes: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 Record segments that just went downstream.
    pub(crate) fn update(&mut self, bytes: u64, segments: u64) {
        self.emitted_bytes += bytes;
        self.emitted_segments += segments;

        let rates = self.calculate_rates();
        if !self.progress_bar.is_hidden() {
            self.render(rates);
        }
        self.progress_bar.set_position(self.emitted_segments);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    #[cfg(test)]
    pub(crate) fn emitted(&self) -> (u64, u64) {
        (self.emitted_segments, self.emitted_bytes)
    }

    fn calculate_rates(&mut self) -> Rates {
        let now = Instant::now();
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples
            .push_back((now, self.emitted_bytes, self.emitted_segments));

        if let Some(&(oldest_time, oldest_bytes, oldest_segments)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest_time).as_secs_f64();
            if elapsed > 0.0 {
                let bytes_delta = self.emitted_bytes.saturating_sub(oldest_bytes);
                let segments_delta = self.emitted_segments.saturating_sub(oldest_segments);
                return Rates {
                    segments_per_sec: segments_delta as f64 / elapsed,
                    mib_per_sec: (bytes_delta as f64 / elapsed) / MIB as f64,
                };
            }
        }

        Rates {
            segments_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    fn percent(&self) -> f64 {
        if self.total_segments > 0 {
            (self.emitted_segments as f64 / self.total_segments as f64) * 100.0
        } else {
            0.0
        }
    }

    /// 🎨 Three rows, two right-aligned columns, no borders:
    /// ```text
    ///   <segments/s>   <emitted / total>
    ///   <MiB/s>        <bytes>  <%>
    ///   <elapsed>      <remaining>
    /// ```
    fn render(&self, rates: Rates) {
        let percent = self.percent();
        let elapsed = self.start_time.elapsed();
        let remaining = if percent > 0.0 {
            // 🔮 linear extrapolation, as optimistic as ever
            let total_estimated = elapsed.as_secs_f64() / (percent / 100.0);
            let remaining_secs = total_estimated - elapsed.as_secs_f64();
            if remaining_secs > 0.0 {
                format_duration(Duration::from_secs_f64(remaining_secs))
            } else {
                "--:--".to_string()
            }
        } else {
            "--:--".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{:.1} Segments/s", rates.segments_per_sec))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!(
                "{} / {} Segments",
                format_number(self.emitted_segments),
                format_number(self.total_segments)
            ))
            .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", rates.mib_per_sec))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{}  {:.2}%", format_bytes(self.emitted_bytes), percent))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} remaining", remaining)).set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("segments: {}\n{}", self.label, table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_bytes_pick_their_own_unit() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * MIB / 2), "1.50 MiB");
    }

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn the_one_where_long_runs_grow_an_hour_column() {
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn the_one_where_a_hidden_bar_still_counts() {
        let mut metrics = ProgressMetrics::new("pid/".to_string(), 4, false);
        metrics.update(10, 1);
        metrics.update(22, 1);
        assert_eq!(metrics.emitted(), (2, 32));
        assert_eq!(metrics.percent(), 50.0);
        metrics.finish();
    }
}
