//! Action Classifier.
//!
//! A deterministic, rule-based mapping from a [`StateChangeDiff`] to the
//! [`InferredAction`] that most plausibly produced it. Rules are tried in
//! order and the first match wins:
//!
//! 1. degraded diff → `Unknown` (0)
//! 2. app switched → `AppSwitch`
//! 3. one modified element whose text was appended to → `TypeText`
//! 4. one added + one removed element of the same role → `Swipe`
//! 5. one element gaining (or, alone, losing) focus without a text change → `Tap`
//! 6. anything else → `Unknown` (0)
//!
//! # Confidence
//!
//! ```text
//! confidence = base / (1 + NOISE_PENALTY × noise)
//! ```
//!
//! where `noise` counts element changes the matched rule does not explain.
//! An app switch explains all element churn, so its noise is always zero.

use pbrain_types::{ActionKind, FocusChange, InferredAction, StateChangeDiff};
use tracing::debug;

const APP_SWITCH_BASE: f32 = 1.0;
const TYPE_TEXT_BASE: f32 = 0.9;
const TAP_BASE: f32 = 0.8;
const SWIPE_BASE: f32 = 0.7;
const NOISE_PENALTY: f32 = 0.25;

/// Infer the action behind `diff`.
pub fn classify(diff: &StateChangeDiff) -> InferredAction {
    if diff.degraded {
        return InferredAction::unknown();
    }

    if diff.app_switched {
        return InferredAction::new(
            ActionKind::AppSwitch {
                from_app: diff.from_app.clone(),
                to_app: diff.to_app.clone(),
            },
            score(APP_SWITCH_BASE, 0),
        );
    }

    if let [change] = diff.modified.as_slice()
        && change.after.len() > change.before.len()
        && change.after.starts_with(&change.before)
    {
        let noise = diff.added.len()
            + diff.removed.len()
            + diff
                .focus_changes
                .iter()
                .filter(|f| f.stable_id != change.stable_id)
                .count();
        return InferredAction::new(
            ActionKind::TypeText {
                element_id: change.stable_id.clone(),
                text: change.after.clone(),
            },
            score(TYPE_TEXT_BASE, noise),
        );
    }

    if let ([added], [removed]) = (diff.added.as_slice(), diff.removed.as_slice())
        && added.role == removed.role
    {
        let noise = diff.modified.len() + diff.focus_changes.len();
        return InferredAction::new(
            ActionKind::Swipe {
                from: removed.stable_id.clone(),
                to: added.stable_id.clone(),
            },
            score(SWIPE_BASE, noise),
        );
    }

    if let Some(target) = tap_target(&diff.focus_changes)
        && !diff.modified.iter().any(|m| m.stable_id == target.stable_id)
    {
        let noise = diff.added.len() + diff.removed.len() + diff.modified.len();
        return InferredAction::new(
            ActionKind::Tap {
                element_id: target.stable_id.clone(),
            },
            score(TAP_BASE, noise),
        );
    }

    debug!(
        change_kind = diff.change_kind.as_str(),
        size = diff.size(),
        "classification ambiguous; resolving to Unknown"
    );
    InferredAction::unknown()
}

/// The single element a focus transition points at: the one element that
/// gained focus (another may have lost it), or the one element that lost it.
fn tap_target(changes: &[FocusChange]) -> Option<&FocusChange> {
    let gained: Vec<&FocusChange> = changes.iter().filter(|f| f.after).collect();
    let lost = changes.len() - gained.len();
    match (gained.as_slice(), lost) {
        ([target], 0 | 1) => Some(target),
        ([], 1) => changes.first(),
        _ => None,
    }
}

fn score(base: f32, noise: usize) -> f32 {
    (base / (1.0 + NOISE_PENALTY * noise as f32)).clamp(0.0, 1.0)
}
