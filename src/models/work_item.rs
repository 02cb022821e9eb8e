use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Scheduling priority declared by the capture side.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, AsRefStr, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Coarse financial value of a card. High-value tiers always get a second opinion.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, AsRefStr, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValueTier {
    #[default]
    Common,
    Rare,
    Holo,
    Vintage,
}

impl ValueTier {
    pub fn is_high_value(self) -> bool {
        matches!(self, ValueTier::Holo | ValueTier::Vintage)
    }
}

/// Where a work item currently sits in the per-card flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, AsRefStr, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Submitted,
    PrimaryInflight,
    Routed,
    VerifyInflight,
    Merged,
    Persisted,
    Failed,
}

/// Opaque handle to an image owned by the capture collaborator.
///
/// The orchestrator never interprets it; it is forwarded verbatim to the
/// inference node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional identification hint (set code and collector number).
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct CardHint {
    #[garde(length(min = 1, max = 64))]
    pub set: Option<String>,

    #[garde(length(min = 1, max = 32))]
    pub number: Option<String>,
}

/// Options supplied alongside an image submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SubmitOptions {
    #[serde(default)]
    #[garde(skip)]
    pub priority: Priority,

    #[serde(default)]
    #[garde(skip)]
    pub value_tier: ValueTier,

    #[serde(default)]
    #[garde(dive)]
    pub hint: Option<CardHint>,
}

/// A submission as received from the capture side, validated before a
/// [`WorkItem`] is created.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CardSubmission {
    #[garde(length(min = 1, max = 1024), custom(printable_handle))]
    pub image_ref: String,

    #[serde(flatten)]
    #[garde(dive)]
    pub options: SubmitOptions,
}

fn printable_handle(value: &str, _ctx: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("image reference is blank"));
    }
    if value.chars().any(char::is_control) {
        return Err(garde::Error::new("image reference contains control characters"));
    }
    Ok(())
}

/// One card moving through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub image_ref: ImageRef,
    pub priority: Priority,
    pub value_tier: ValueTier,
    pub hint: Option<CardHint>,
    pub submitted_at: DateTime<Utc>,
    pub stage: Stage,
}

impl WorkItem {
    pub fn new(image_ref: ImageRef, options: SubmitOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_ref,
            priority: options.priority,
            value_tier: options.value_tier,
            hint: options.hint,
            submitted_at: Utc::now(),
            stage: Stage::Submitted,
        }
    }
}
