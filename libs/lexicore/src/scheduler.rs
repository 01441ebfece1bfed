//! SuperMemo-2 derived spaced repetition scheduler.
//!
//! One deliberate departure from vanilla SM-2: a failing grade resets the
//! interval to 0 rather than 1, so the item repeats within the same session
//! until it passes.

use crate::types::{Card, Grade};

/// Minimum easiness factor.
pub const MIN_EFACTOR: f64 = 1.3;

const SECS_PER_DAY: i64 = 86_400;

/// Compute the post-revision state of a card.
///
/// Pure and total: the caller supplies the clock (`now_secs`, unix seconds)
/// and persists the returned card as a patch. `failure_wait_secs` is how
/// long a failed card waits before it is due again.
pub fn practice(card: &Card, grade: Grade, failure_wait_secs: i64, now_secs: i64) -> Card {
    let mut next = card.clone();
    let quality = quality(grade);

    if grade.is_success() {
        next.interval = match card.repetition {
            0 => 1,
            1 => 6,
            _ => (card.interval as f64 * card.efactor).round() as i64,
        };
        next.repetition = card.repetition + 1;
    } else {
        next.interval = 0;
        next.repetition = 0;
    }

    let q = (5 - quality) as f64;
    next.efactor = (card.efactor + (0.1 - q * (0.08 + q * 0.02))).max(MIN_EFACTOR);

    next.due_date = if next.interval > 0 {
        now_secs + next.interval * SECS_PER_DAY
    } else {
        now_secs + failure_wait_secs
    };

    next.known = grade == Grade::Known;
    if card.first_revision_date == 0 {
        next.first_revision_date = now_secs;
    }
    next.last_revision_date = now_secs;
    if card.first_success_date == 0 && grade.is_success() {
        next.first_success_date = now_secs;
    }

    next
}

/// Grades run 2-5 but sit one step below the SM-2 quality scale: a Good
/// revision earns the full +0.1 ease bonus, a Hard one leaves the efactor
/// unchanged.
fn quality(grade: Grade) -> i64 {
    (grade.to_value() + 1).min(5)
}
