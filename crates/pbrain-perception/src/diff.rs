//! State Differ.
//!
//! [`diff`] compares two [`CanonicalState`]s by stable id. A removed and an
//! added element that occupy the same position (same `position_id` and
//! role) are one element whose label changed in place, and are reported as
//! modified. [`StateWindow`] owns the two-state window the driver diffs
//! against: pushing a new state retires the oldest, so no diff ever spans
//! more than two states.

use std::collections::HashMap;

use pbrain_types::{
    CanonicalElement, CanonicalState, ChangeKind, FocusChange, StateChangeDiff, TextChange,
};

/// Added + removed element count above which a layout change is major.
const MAJOR_LAYOUT_THRESHOLD: usize = 20;
/// Added + removed element count above which a layout change is minor.
const MINOR_LAYOUT_THRESHOLD: usize = 5;

// ─────────────────────────────────────────────────────────────────────────────
// diff
// ─────────────────────────────────────────────────────────────────────────────

/// Compute the structured diff from `previous` to `current`.
///
/// Elements only in `previous` are removed, elements only in `current` are
/// added (each in their state's element order), unless the two share a
/// position and role, in which case the change is a modification. If either state is the
/// sentinel the result is an empty diff with `degraded` set.
pub fn diff(previous: &CanonicalState, current: &CanonicalState) -> StateChangeDiff {
    if previous.is_sentinel() || current.is_sentinel() {
        return StateChangeDiff::degraded(&previous.app_id, &current.app_id);
    }

    let before: HashMap<&str, &CanonicalElement> = previous
        .elements
        .iter()
        .map(|e| (e.stable_id.as_str(), e))
        .collect();
    let after: HashMap<&str, &CanonicalElement> = current
        .elements
        .iter()
        .map(|e| (e.stable_id.as_str(), e))
        .collect();

    // Unmatched previous elements, by position, until paired or removed.
    let mut unmatched: HashMap<(&str, &str), &CanonicalElement> = previous
        .elements
        .iter()
        .filter(|e| !e.position_id.is_empty() && !after.contains_key(e.stable_id.as_str()))
        .map(|e| ((e.position_id.as_str(), e.role.as_str()), e))
        .collect();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut focus_changes = Vec::new();
    for element in &current.elements {
        let old = match before.get(element.stable_id.as_str()) {
            Some(old) => *old,
            None => match paired_by_position(&mut unmatched, element) {
                Some(old) => old,
                None => {
                    added.push(element.clone());
                    continue;
                }
            },
        };
        if old.text != element.text {
            modified.push(TextChange {
                stable_id: element.stable_id.clone(),
                role: element.role.clone(),
                before: old.text.clone(),
                after: element.text.clone(),
            });
        }
        if old.is_focused != element.is_focused {
            focus_changes.push(FocusChange {
                stable_id: element.stable_id.clone(),
                before: old.is_focused,
                after: element.is_focused,
            });
        }
    }

    let removed: Vec<CanonicalElement> = previous
        .elements
        .iter()
        .filter(|e| {
            !after.contains_key(e.stable_id.as_str())
                && (e.position_id.is_empty()
                    || unmatched.contains_key(&(e.position_id.as_str(), e.role.as_str())))
        })
        .cloned()
        .collect();

    let app_switched = previous.app_id != current.app_id;
    let screen_changed = !app_switched && previous.screen_signature != current.screen_signature;

    let mut result = StateChangeDiff {
        from_app: previous.app_id.clone(),
        to_app: current.app_id.clone(),
        added,
        removed,
        modified,
        focus_changes,
        app_switched,
        screen_changed,
        degraded: false,
        change_kind: ChangeKind::NoChange,
    };
    result.change_kind = change_kind(&result);
    result
}

fn paired_by_position<'a>(
    unmatched: &mut HashMap<(&'a str, &'a str), &'a CanonicalElement>,
    element: &'a CanonicalElement,
) -> Option<&'a CanonicalElement> {
    if element.position_id.is_empty() {
        return None;
    }
    unmatched.remove(&(element.position_id.as_str(), element.role.as_str()))
}

fn change_kind(d: &StateChangeDiff) -> ChangeKind {
    if d.degraded {
        return ChangeKind::Unknown;
    }
    if d.app_switched {
        return ChangeKind::AppSwitch;
    }
    if d.screen_changed {
        return ChangeKind::ScreenChange;
    }
    if d.is_empty() {
        return ChangeKind::NoChange;
    }
    let churn = d.added.len() + d.removed.len();
    if churn == 0 {
        return if d.modified.is_empty() {
            ChangeKind::FocusChange
        } else {
            ChangeKind::TextInput
        };
    }
    if churn > MAJOR_LAYOUT_THRESHOLD {
        ChangeKind::MajorLayoutChange
    } else if churn > MINOR_LAYOUT_THRESHOLD {
        ChangeKind::MinorLayoutChange
    } else {
        ChangeKind::ScrollOrAnimation
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StateWindow
// ─────────────────────────────────────────────────────────────────────────────

/// Holds the most recent canonical state of one device.
#[derive(Debug, Default)]
pub struct StateWindow {
    previous: Option<CanonicalState>,
}

impl StateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `current` and return its diff against the previous state.
    ///
    /// Returns `None` for the very first state.
    pub fn advance(&mut self, current: CanonicalState) -> Option<StateChangeDiff> {
        let result = self.previous.as_ref().map(|prev| diff(prev, &current));
        self.previous = Some(current);
        result
    }

    /// The state the next [`advance`][Self::advance] will diff against.
    pub fn latest(&self) -> Option<&CanonicalState> {
        self.previous.as_ref()
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn e(id: &str, role: &str, text: &str, focused: bool) -> CanonicalElement {
        CanonicalElement {
            stable_id: id.to_string(),
            position_id: format!("p{id}"),
            role: role.to_string(),
            text: text.to_string(),
            is_focused: focused,
        }
    }

    fn state(app: &str, sig: u64, elements: Vec<CanonicalElement>) -> CanonicalState {
        CanonicalState {
            app_id: app.to_string(),
            activity: None,
            screen_signature: sig,
            elements,
            captured_at: Utc::now(),
            sentinel: false,
        }
    }

    fn sample_states() -> Vec<CanonicalState> {
        vec![
            state("a", 1, vec![e("1", "TextView", "x", false), e("2", "EditText", "He", true)]),
            state("a", 1, vec![e("2", "EditText", "Hello", true), e("3", "TextView", "y", false)]),
            state("b", 2, vec![e("9", "Button", "ok", false)]),
            state("a", 3, vec![]),
        ]
    }

    #[test]
    fn diff_against_self_is_empty() {
        for s in sample_states() {
            let d = diff(&s, &s);
            assert!(d.is_empty(), "diff(S, S) must be empty for {s:?}");
            assert_eq!(d.change_kind, ChangeKind::NoChange);
        }
    }

    #[test]
    fn diff_is_symmetric() {
        let states = sample_states();
        for a in &states {
            for b in &states {
                let ab = diff(a, b);
                let ba = diff(b, a);
                assert_eq!(ab.added, ba.removed);
                assert_eq!(ab.removed, ba.added);
            }
        }
    }

    #[test]
    fn matching_by_stable_id() {
        let states = sample_states();
        let d = diff(&states[0], &states[1]);
        assert_eq!(d.removed.len(), 1);
        assert_eq!(d.removed[0].stable_id, "1");
        assert_eq!(d.added.len(), 1);
        assert_eq!(d.added[0].stable_id, "3");
        assert_eq!(d.modified.len(), 1);
        assert_eq!(d.modified[0].before, "He");
        assert_eq!(d.modified[0].after, "Hello");
        assert!(!d.app_switched);
        assert!(!d.screen_changed);
    }

    #[test]
    fn relabelled_element_in_same_position_is_modified() {
        let mut play = e("t:Play", "Button", "Play", false);
        let mut pause = e("t:Pause", "Button", "Pause", false);
        play.position_id = "slot".into();
        pause.position_id = "slot".into();
        let a = state("a", 1, vec![play]);
        let b = state("a", 1, vec![pause]);

        let d = diff(&a, &b);
        assert!(d.added.is_empty() && d.removed.is_empty());
        assert_eq!(d.modified.len(), 1);
        assert_eq!(d.modified[0].stable_id, "t:Pause");
        assert_eq!((d.modified[0].before.as_str(), d.modified[0].after.as_str()), ("Play", "Pause"));
        assert_eq!(d.change_kind, ChangeKind::TextInput);

        let back = diff(&b, &a);
        assert_eq!(back.modified.len(), 1);
        assert!(back.added.is_empty() && back.removed.is_empty());
    }

    #[test]
    fn app_switch_only_differs_in_app() {
        let a = state("messaging", 7, vec![]);
        let b = state("home", 7, vec![]);
        let d = diff(&a, &b);
        assert!(d.app_switched);
        assert!(!d.screen_changed);
        assert_eq!(d.change_kind, ChangeKind::AppSwitch);
        assert_eq!(d.from_app, "messaging");
        assert_eq!(d.to_app, "home");
    }

    #[test]
    fn screen_change_requires_same_app() {
        let a = state("a", 1, vec![]);
        let b = state("a", 2, vec![]);
        let d = diff(&a, &b);
        assert!(d.screen_changed);
        assert_eq!(d.change_kind, ChangeKind::ScreenChange);

        let c = state("b", 2, vec![]);
        assert!(!diff(&a, &c).screen_changed);
    }

    #[test]
    fn focus_transition_recorded() {
        let a = state("a", 1, vec![e("1", "Button", "ok", false)]);
        let b = state("a", 1, vec![e("1", "Button", "ok", true)]);
        let d = diff(&a, &b);
        assert_eq!(d.focus_changes.len(), 1);
        assert!(d.modified.is_empty());
        assert_eq!(d.change_kind, ChangeKind::FocusChange);
    }

    #[test]
    fn sentinel_input_yields_degraded_empty_diff() {
        let good = state("a", 1, vec![e("1", "TextView", "x", false)]);
        let unknown = CanonicalState::unknown(Utc::now());
        for d in [diff(&good, &unknown), diff(&unknown, &good)] {
            assert!(d.degraded);
            assert!(d.is_empty());
            assert_eq!(d.change_kind, ChangeKind::Unknown);
        }
    }

    #[test]
    fn layout_change_kinds_scale_with_churn() {
        let many: Vec<_> = (0..25).map(|i| e(&i.to_string(), "TextView", "t", false)).collect();
        let some: Vec<_> = (0..7).map(|i| e(&i.to_string(), "TextView", "t", false)).collect();
        let empty = state("a", 1, vec![]);
        assert_eq!(
            diff(&empty, &state("a", 1, many)).change_kind,
            ChangeKind::MajorLayoutChange
        );
        assert_eq!(
            diff(&empty, &state("a", 1, some)).change_kind,
            ChangeKind::MinorLayoutChange
        );
    }

    #[test]
    fn window_diffs_only_latest_two() {
        let states = sample_states();
        let mut window = StateWindow::new();
        assert!(window.advance(states[0].clone()).is_none());
        let d1 = window.advance(states[1].clone()).unwrap();
        assert_eq!(d1, diff(&states[0], &states[1]));
        let d2 = window.advance(states[2].clone()).unwrap();
        assert_eq!(d2, diff(&states[1], &states[2]));
        assert_eq!(window.latest(), Some(&states[2]));
        window.reset();
        assert!(window.latest().is_none());
    }
}
