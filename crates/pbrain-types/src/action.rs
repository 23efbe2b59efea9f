//! Actions: what the user (or an agent on their behalf) did to produce a
//! state change.

use serde::{Deserialize, Serialize};

/// The closed set of actions the pipeline can attribute to a diff.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum ActionKind {
    Tap {
        element_id: String,
    },
    TypeText {
        element_id: String,
        text: String,
    },
    /// A scroll: `from` left the screen, `to` entered it.
    Swipe {
        from: String,
        to: String,
    },
    AppSwitch {
        from_app: String,
        to_app: String,
    },
    Unknown,
}

impl ActionKind {
    /// Stable label used in fingerprints and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Tap { .. } => "tap",
            ActionKind::TypeText { .. } => "type_text",
            ActionKind::Swipe { .. } => "swipe",
            ActionKind::AppSwitch { .. } => "app_switch",
            ActionKind::Unknown => "unknown",
        }
    }

    /// Element (or app) identifiers the action operated on.
    ///
    /// An app switch targets its destination only, so switching into the
    /// same app from different places counts as the same behaviour.
    pub fn targets(&self) -> Vec<String> {
        match self {
            ActionKind::Tap { element_id } | ActionKind::TypeText { element_id, .. } => {
                vec![element_id.clone()]
            }
            ActionKind::Swipe { from, to } => vec![from.clone(), to.clone()],
            ActionKind::AppSwitch { to_app, .. } => vec![to_app.clone()],
            ActionKind::Unknown => Vec::new(),
        }
    }
}

/// An action inferred from a diff, with the classifier's certainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredAction {
    pub kind: ActionKind,
    confidence: f32,
}

impl InferredAction {
    /// `confidence` is clamped to `[0, 1]`; NaN becomes `0`.
    pub fn new(kind: ActionKind, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        Self { kind, confidence }
    }

    pub fn unknown() -> Self {
        Self::new(ActionKind::Unknown, 0.0)
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// An action executed on the user's behalf by the automation client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandedAction {
    /// The command text as it was issued (e.g. `"Open Slack"`).
    pub command: String,
    pub kind: ActionKind,
    pub success: bool,
    #[serde(default)]
    pub steps: u32,
}

/// Either provenance, behind one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provenance", rename_all = "snake_case")]
pub enum ObservedAction {
    Inferred(InferredAction),
    Commanded(CommandedAction),
}

impl ObservedAction {
    pub fn kind(&self) -> &ActionKind {
        match self {
            ObservedAction::Inferred(a) => &a.kind,
            ObservedAction::Commanded(c) => &c.kind,
        }
    }

    /// Successful commands are certain; failed ones are still recorded at
    /// half weight since the device may have partially applied them.
    pub fn confidence(&self) -> f32 {
        match self {
            ObservedAction::Inferred(a) => a.confidence(),
            ObservedAction::Commanded(c) if c.success => 1.0,
            ObservedAction::Commanded(_) => 0.5,
        }
    }

    pub fn is_commanded(&self) -> bool {
        matches!(self, ObservedAction::Commanded(_))
    }
}

impl From<InferredAction> for ObservedAction {
    fn from(a: InferredAction) -> Self {
        ObservedAction::Inferred(a)
    }
}

impl From<CommandedAction> for ObservedAction {
    fn from(c: CommandedAction) -> Self {
        ObservedAction::Commanded(c)
    }
}
