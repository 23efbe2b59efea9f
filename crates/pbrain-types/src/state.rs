//! UI state as seen by the pipeline: raw device snapshots, their canonical
//! form, and the structured diff between two canonical states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// App identifier used by the sentinel state.
pub const UNKNOWN_APP: &str = "unknown";

// ─────────────────────────────────────────────────────────────────────────────
// Raw snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Pixel bounding box reported by the accessibility tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// A single node of the device's UI tree, exactly as reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawElement {
    /// Widget class or accessibility role (e.g. `"Button"`, `"EditText"`).
    pub role: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub bounds: Bounds,
    /// Index assigned by the device for this snapshot only.
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub editable: bool,
    /// Ephemeral animation flag; never survives canonicalization.
    #[serde(default)]
    pub animating: bool,
    #[serde(default)]
    pub children: Vec<RawElement>,
}

/// Opaque UI tree pulled from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    /// Foreground package (e.g. `"com.whatsapp"`).
    #[serde(default)]
    pub app_id: Option<String>,
    /// Foreground activity within the app, when the device reports it.
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub root: Option<RawElement>,
    pub captured_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Canonical state
// ─────────────────────────────────────────────────────────────────────────────

/// A UI element after canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalElement {
    pub stable_id: String,
    /// Parent position, role and ordinal among same-role siblings. Unlike
    /// `stable_id` it ignores text.
    #[serde(default)]
    pub position_id: String,
    pub role: String,
    /// Human-readable text; empty when the element carries none.
    pub text: String,
    pub is_focused: bool,
}

/// Normalized, comparable snapshot of UI state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalState {
    pub app_id: String,
    pub activity: Option<String>,
    /// Structural hash of the screen, stable across text and focus changes.
    pub screen_signature: u64,
    pub elements: Vec<CanonicalElement>,
    pub captured_at: DateTime<Utc>,
    /// `true` for the placeholder substituted when a snapshot was unusable.
    #[serde(default)]
    pub sentinel: bool,
}

impl CanonicalState {
    /// The "unknown" state substituted for a malformed snapshot.
    pub fn unknown(captured_at: DateTime<Utc>) -> Self {
        Self {
            app_id: UNKNOWN_APP.to_string(),
            activity: None,
            screen_signature: 0,
            elements: Vec::new(),
            captured_at,
            sentinel: true,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    pub fn element(&self, stable_id: &str) -> Option<&CanonicalElement> {
        self.elements.iter().find(|e| e.stable_id == stable_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Diff
// ─────────────────────────────────────────────────────────────────────────────

/// Text change on an element present in both states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub stable_id: String,
    pub role: String,
    pub before: String,
    pub after: String,
}

/// Focus transition on an element present in both states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusChange {
    pub stable_id: String,
    pub before: bool,
    pub after: bool,
}

/// Coarse classification of a diff, used for history filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    NoChange,
    AppSwitch,
    ScreenChange,
    TextInput,
    /// Only focus moved between elements.
    FocusChange,
    MajorLayoutChange,
    MinorLayoutChange,
    ScrollOrAnimation,
    /// At least one side of the diff was the sentinel state.
    Unknown,
}

impl ChangeKind {
    /// App switches, screen changes and major layout changes.
    pub fn is_notable(self) -> bool {
        matches!(
            self,
            ChangeKind::AppSwitch | ChangeKind::ScreenChange | ChangeKind::MajorLayoutChange
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::NoChange => "no_change",
            ChangeKind::AppSwitch => "app_switch",
            ChangeKind::ScreenChange => "screen_change",
            ChangeKind::TextInput => "text_input",
            ChangeKind::FocusChange => "focus_change",
            ChangeKind::MajorLayoutChange => "major_layout_change",
            ChangeKind::MinorLayoutChange => "minor_layout_change",
            ChangeKind::ScrollOrAnimation => "scroll_or_animation",
            ChangeKind::Unknown => "unknown",
        }
    }
}

/// Structured difference between two consecutive canonical states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeDiff {
    pub from_app: String,
    pub to_app: String,
    pub added: Vec<CanonicalElement>,
    pub removed: Vec<CanonicalElement>,
    pub modified: Vec<TextChange>,
    pub focus_changes: Vec<FocusChange>,
    pub app_switched: bool,
    pub screen_changed: bool,
    /// Set instead of failing when either input was the sentinel state.
    pub degraded: bool,
    pub change_kind: ChangeKind,
}

impl StateChangeDiff {
    /// A diff with no changes, scoped to `app_id`.
    pub fn empty(app_id: &str) -> Self {
        Self {
            from_app: app_id.to_string(),
            to_app: app_id.to_string(),
            added: Vec::new(),
            removed: Vec::new(),
            modified: Vec::new(),
            focus_changes: Vec::new(),
            app_switched: false,
            screen_changed: false,
            degraded: false,
            change_kind: ChangeKind::NoChange,
        }
    }

    /// An empty diff flagged as degraded.
    pub fn degraded(from_app: &str, to_app: &str) -> Self {
        Self {
            from_app: from_app.to_string(),
            to_app: to_app.to_string(),
            degraded: true,
            change_kind: ChangeKind::Unknown,
            ..Self::empty(to_app)
        }
    }

    /// `true` when no element, app or screen change was recorded.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.focus_changes.is_empty()
            && !self.app_switched
            && !self.screen_changed
    }

    /// Total number of element-level changes.
    pub fn size(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len() + self.focus_changes.len()
    }
}
