use std::fmt::Write as _;

use overflow::{EventRegistry, SampleReport};
use time::macros::format_description;
use time::OffsetDateTime;

/// Wall clock time of a report; local time is unknowable once threads run, so UTC then
pub fn format_time() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let format = format_description!("[hour]:[minute]:[second].[subsecond digits:3]");
    now.format(&format)
        .unwrap_or_else(|_| "00:00:00.000".to_string())
}

/// One line per event with the id its values are tagged with
pub fn format_ids(registry: &EventRegistry) -> String {
    let mut out = String::new();
    for event in registry.iter() {
        let _ = writeln!(out, "{}  {}", event.unique_id(), event.name());
    }
    out
}

/// Header line plus one indented line per member
pub fn format_sample(report: &SampleReport) -> String {
    let mut out = format!(
        "Notification {}: ip={:#x} ena={} run={}\n",
        report.notification, report.ip, report.time_enabled, report.time_running
    );
    for member in &report.members {
        let _ = writeln!(
            out,
            "\t{} {} ({}{})",
            member.value,
            member.name,
            member.unique_id,
            if report.scaled { ", scaled" } else { "" }
        );
    }
    out
}
