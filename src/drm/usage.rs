// src/drm/usage.rs

//! Resource usage records and unit normalisation.
//!
//! Every backend reports memory and durations in its own spelling. Values
//! are normalised here to kilobytes and seconds.

use serde::{Deserialize, Serialize};

/// Resource usage of one finished attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub exit_status: Option<i32>,
    pub term_signal: Option<i32>,
    /// Seconds.
    pub wall_time: Option<f64>,
    /// Seconds (user + system).
    pub cpu_time: Option<f64>,
    pub user_time: Option<f64>,
    pub system_time: Option<f64>,
    /// Kilobytes.
    pub max_rss_kb: Option<u64>,
    pub avg_rss_kb: Option<u64>,
    /// `cpu_time / wall_time`.
    pub percent_cpu: Option<f64>,
    /// Backend-specific terminal state or a note about how the record was
    /// obtained.
    pub status_reason: Option<String>,
}

impl ResourceUsage {
    pub fn with_exit_status(code: i32) -> Self {
        Self {
            exit_status: Some(code),
            ..Self::default()
        }
    }

    /// Usage for an attempt that never produced an exit status (submission
    /// failure, lost job).
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            exit_status: None,
            status_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Fill in derived fields.
    pub fn finalize(mut self) -> Self {
        if self.cpu_time.is_none() {
            if let (Some(u), Some(s)) = (self.user_time, self.system_time) {
                self.cpu_time = Some(u + s);
            }
        }
        if self.percent_cpu.is_none() {
            if let (Some(cpu), Some(wall)) = (self.cpu_time, self.wall_time) {
                self.percent_cpu = Some(cpu_ratio(cpu, wall));
            }
        }
        self
    }

    /// Overlay every field that `other` knows about.
    pub fn overlay(mut self, other: &ResourceUsage) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field.clone(); })*
            };
        }
        take!(
            exit_status,
            term_signal,
            wall_time,
            cpu_time,
            user_time,
            system_time,
            max_rss_kb,
            avg_rss_kb,
            percent_cpu,
            status_reason
        );
        self
    }
}

/// `cpu / wall`, defined as 1.0 when no wall time elapsed.
pub fn cpu_ratio(cpu_time: f64, wall_time: f64) -> f64 {
    if wall_time <= 0.0 {
        1.0
    } else {
        cpu_time / wall_time
    }
}

/// Parse a memory amount into kilobytes.
///
/// Accepts `K`/`M`/`G`/`T` with an optional trailing `B`, case-insensitive,
/// with or without a space (`"1.5G"`, `"512 MB"`, `"300k"`). A trailing `B`
/// alone or a bare number is taken as bytes.
pub fn parse_mem_kb(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num.parse().ok()?;
    let unit = unit.trim().to_ascii_uppercase();
    let unit = unit.strip_suffix("IB").or_else(|| unit.strip_suffix('B')).map_or(unit.as_str(), |u| u);

    let factor_kb = match unit {
        "" => 1.0 / 1024.0,
        "K" => 1.0,
        "M" => 1024.0,
        "G" => 1024.0 * 1024.0,
        "T" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * factor_kb).round() as u64)
}

/// Parse `[DD-][HH:]MM:SS[.fff]` or plain seconds into seconds.
pub fn parse_duration_secs(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<f64>().ok()?, rest),
        None => (0.0, s),
    };

    let mut total = 0.0;
    for part in rest.split(':') {
        let v: f64 = part.parse().ok()?;
        total = total * 60.0 + v;
    }
    Some(days * 86_400.0 + total)
}
