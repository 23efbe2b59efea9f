//! State Canonicalizer.
//!
//! Turns a [`RawSnapshot`] into a [`CanonicalState`]: transient fields
//! (bounds, device-local indices, animation flags) are dropped,
//! resource-identifier noise is stripped from text, and every element gets a
//! stable id derived from its position and role rather than its on-screen
//! index.
//!
//! # Stable ids
//!
//! An element's id hashes its parent's id, its role and a disambiguator:
//!
//! | element | disambiguator |
//! |---|---|
//! | static, text-bearing | its text and occurrence count among siblings with the same role and text |
//! | editable or text-less | its ordinal among same-role siblings of that kind |
//!
//! Input fields therefore keep their id while the user types into them, and a
//! list row keeps its id when the list scrolls and the row shifts position.
//!
//! Every element also carries a `position_id` built from its parent's
//! position, its role and its ordinal among same-role siblings, ignoring
//! text. The differ uses it to recognise a label that changed in place.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use pbrain_perception::canonicalize::canonicalize;
//! use pbrain_types::{RawElement, RawSnapshot};
//!
//! let snapshot = RawSnapshot {
//!     app_id: Some("com.whatsapp".into()),
//!     activity: None,
//!     root: Some(RawElement { role: "FrameLayout".into(), ..Default::default() }),
//!     captured_at: Utc::now(),
//! };
//! let state = canonicalize(&snapshot).unwrap();
//! assert_eq!(state.elements.len(), 1);
//! ```

use std::collections::HashMap;

use pbrain_types::{
    CanonicalElement, CanonicalState, PipelineError, RawElement, RawSnapshot, StableHasher,
};
use tracing::warn;

/// Text prefixes that mark resource identifiers rather than readable text.
const RESOURCE_ID_PREFIXES: [&str; 4] = ["com.", "android.", "androidx.", "org."];

/// Role fragments that identify editable widgets.
const EDITABLE_ROLES: [&str; 3] = ["EditText", "TextField", "Input"];

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Canonicalize `snapshot`.
///
/// # Errors
///
/// [`PipelineError::MalformedSnapshot`] when the snapshot has no root node
/// or no app identifier.
pub fn canonicalize(snapshot: &RawSnapshot) -> Result<CanonicalState, PipelineError> {
    let app_id = snapshot
        .app_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::MalformedSnapshot("missing app identifier".to_string()))?;
    let root = snapshot
        .root
        .as_ref()
        .ok_or_else(|| PipelineError::MalformedSnapshot("missing root node".to_string()))?;

    let mut walker = Walker::default();
    walker.visit(root, 0, Parent::default(), "o:0".to_string(), 0);

    let activity = snapshot.activity.clone();
    let mut hasher = StableHasher::new();
    hasher
        .write_str(app_id)
        .write_opt_str(activity.as_deref())
        .write_u64(walker.structure.len() as u64);
    for (depth, role) in &walker.structure {
        hasher.write_u64(u64::from(*depth)).write_str(role);
    }

    Ok(CanonicalState {
        app_id: app_id.to_string(),
        activity,
        screen_signature: hasher.finish(),
        elements: walker.elements,
        captured_at: snapshot.captured_at,
        sentinel: false,
    })
}

/// Canonicalize `snapshot`, substituting the sentinel state when it is
/// malformed. The error is returned alongside so callers can record it.
pub fn canonicalize_or_sentinel(snapshot: &RawSnapshot) -> (CanonicalState, Option<PipelineError>) {
    match canonicalize(snapshot) {
        Ok(state) => (state, None),
        Err(err) => {
            warn!(error = %err, "substituting unknown state for malformed snapshot");
            (CanonicalState::unknown(snapshot.captured_at), Some(err))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Hashes of the parent's content-keyed and positional ids.
#[derive(Default, Clone, Copy)]
struct Parent {
    id: u64,
    position: u64,
}

#[derive(Default)]
struct Walker {
    elements: Vec<CanonicalElement>,
    /// Pre-order `(depth, role)` pairs feeding the screen signature.
    structure: Vec<(u16, String)>,
}

impl Walker {
    fn visit(&mut self, element: &RawElement, depth: u16, parent: Parent, disambiguator: String, ordinal: usize) {
        let own = Parent {
            id: StableHasher::new()
                .write_u64(parent.id)
                .write_str(&element.role)
                .write_str(&disambiguator)
                .finish(),
            position: StableHasher::new()
                .write_u64(parent.position)
                .write_str(&element.role)
                .write_u64(ordinal as u64)
                .finish(),
        };

        self.structure.push((depth, element.role.clone()));
        self.elements.push(CanonicalElement {
            stable_id: format!("{:016x}", own.id),
            position_id: format!("{:016x}", own.position),
            role: element.role.clone(),
            text: readable_text(element.text.as_deref()),
            is_focused: element.focused,
        });

        let mut counters: HashMap<(String, String), usize> = HashMap::new();
        let mut ordinals: HashMap<(String, String), usize> = HashMap::new();
        for child in &element.children {
            let text = readable_text(child.text.as_deref());
            let key = if is_editable(child) || text.is_empty() {
                let n = bump(&mut counters, (child.role.clone(), String::new()));
                format!("o:{n}")
            } else {
                let n = bump(&mut counters, (child.role.clone(), text.clone()));
                format!("t:{text}#{n}")
            };
            let ordinal = bump(&mut ordinals, (child.role.clone(), String::new()));
            self.visit(child, depth.saturating_add(1), own, key, ordinal);
        }
    }
}

fn bump(counters: &mut HashMap<(String, String), usize>, key: (String, String)) -> usize {
    let slot = counters.entry(key).or_insert(0);
    let n = *slot;
    *slot += 1;
    n
}

fn is_editable(element: &RawElement) -> bool {
    element.editable || EDITABLE_ROLES.iter().any(|r| element.role.contains(r))
}

/// Trimmed text, or empty when absent or a resource identifier.
fn readable_text(text: Option<&str>) -> String {
    let text = text.map(str::trim).unwrap_or_default();
    if RESOURCE_ID_PREFIXES.iter().any(|p| text.starts_with(p)) {
        String::new()
    } else {
        text.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
