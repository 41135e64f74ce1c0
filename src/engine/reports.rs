use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// One status-history entry tagged with the key it is grouped under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistorySample {
    pub key: Ulid,
    pub entry: StatusHistoryEntry,
}

/// Closed entries with `status` whose whole interval lies in `[from, to]`.
fn in_window(entry: &StatusHistoryEntry, from: Ms, to: Ms, status: AppointmentStatus) -> bool {
    entry.status == status
        && entry.start >= from
        && entry.end.is_some_and(|end| end <= to)
}

/// Average minutes spent in `status`, per grouping key. Open entries are not
/// measured; keys without a closed entry are absent from the result.
pub fn average_durations(
    samples: impl IntoIterator<Item = HistorySample>,
    from: Ms,
    to: Ms,
    status: AppointmentStatus,
) -> HashMap<Ulid, f64> {
    let mut totals: HashMap<Ulid, (Ms, u32)> = HashMap::new();
    for s in samples {
        if !in_window(&s.entry, from, to, status) {
            continue;
        }
        let Some(end) = s.entry.end else { continue };
        let t = totals.entry(s.key).or_insert((0, 0));
        t.0 += end - s.entry.start;
        t.1 += 1;
    }
    totals
        .into_iter()
        .filter(|(_, (_, n))| *n > 0)
        .map(|(k, (total, n))| (k, total as f64 / n as f64 / MINUTE_MS as f64))
        .collect()
}

/// Number of closed entries with `status` inside `[from, to]`.
pub fn history_count<'a>(
    entries: impl IntoIterator<Item = &'a StatusHistoryEntry>,
    from: Ms,
    to: Ms,
    status: AppointmentStatus,
) -> usize {
    entries
        .into_iter()
        .filter(|e| in_window(e, from, to, status))
        .count()
}
