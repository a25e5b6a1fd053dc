//! Widget binding: typed widget configuration and topic extraction.
//!
//! DESIGN
//! ======
//! A widget row stores its `kind` tag next to an opaque config blob. Decoding
//! is a single match over the kind; each kind owns its config struct. The
//! rest of the service works with `WidgetConfig` and never inspects raw JSON.
//!
//! ERROR HANDLING
//! ==============
//! Decoding failures are per widget. Subscription planning and data assembly
//! skip the broken widget and keep going; the management API surfaces the
//! error to the caller instead.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::store::WidgetRow;

// =============================================================================
// KIND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WidgetKind {
    #[serde(rename = "TEXT")]
    Text,
    #[serde(rename = "BUTTON")]
    Button,
    #[serde(rename = "INDICATOR")]
    Indicator,
    #[serde(rename = "TIMESERIES-LINE-CHART")]
    TimeseriesLineChart,
}

impl WidgetKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Button => "BUTTON",
            Self::Indicator => "INDICATOR",
            Self::TimeseriesLineChart => "TIMESERIES-LINE-CHART",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "TEXT" => Some(Self::Text),
            "BUTTON" => Some(Self::Button),
            "INDICATOR" => Some(Self::Indicator),
            "TIMESERIES-LINE-CHART" | "TIMESERIES_LINE_CHART" => Some(Self::TimeseriesLineChart),
            _ => None,
        }
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CONFIG SHAPES
// =============================================================================
// PascalCase aliases accept rows written by the earlier dashboard, which
// serialized field names verbatim.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextConfig {
    #[serde(default, alias = "Topic")]
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonConfig {
    #[serde(default, alias = "Topic")]
    pub topic: String,
    #[serde(default, alias = "Message")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default, alias = "Topic")]
    pub topic: String,
    #[serde(default, alias = "OnCondition")]
    pub on_condition: String,
    #[serde(default = "default_indicator_color", alias = "Color")]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeseriesConfig {
    #[serde(default, alias = "Topic")]
    pub topic: String,
    #[serde(default, alias = "Label")]
    pub label: String,
    #[serde(default = "default_max_length", alias = "MaxLength")]
    pub max_length: usize,
}

pub const DEFAULT_INDICATOR_COLOR: &str = "blue";
pub const DEFAULT_TIMESERIES_MAX_LENGTH: usize = 8;

fn default_indicator_color() -> String {
    DEFAULT_INDICATOR_COLOR.to_owned()
}

fn default_max_length() -> usize {
    DEFAULT_TIMESERIES_MAX_LENGTH
}

/// Decoded widget configuration, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetConfig {
    Text(TextConfig),
    Button(ButtonConfig),
    Indicator(IndicatorConfig),
    TimeseriesLineChart(TimeseriesConfig),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigDecodeError {
    #[error("unknown widget kind: {0}")]
    UnknownKind(String),
    #[error("missing configuration for {0} widget")]
    Missing(WidgetKind),
    #[error("malformed {kind} configuration: {source}")]
    Malformed {
        kind: WidgetKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a raw config blob for the given kind.
///
/// # Errors
///
/// Returns [`ConfigDecodeError::Missing`] for an absent or empty blob and
/// [`ConfigDecodeError::Malformed`] when the JSON does not fit the kind.
pub fn decode(kind: WidgetKind, raw: Option<&[u8]>) -> Result<WidgetConfig, ConfigDecodeError> {
    let bytes = match raw {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Err(ConfigDecodeError::Missing(kind)),
    };
    let malformed = |source| ConfigDecodeError::Malformed { kind, source };

    Ok(match kind {
        WidgetKind::Text => WidgetConfig::Text(serde_json::from_slice(bytes).map_err(malformed)?),
        WidgetKind::Button => WidgetConfig::Button(serde_json::from_slice(bytes).map_err(malformed)?),
        WidgetKind::Indicator => WidgetConfig::Indicator(serde_json::from_slice(bytes).map_err(malformed)?),
        WidgetKind::TimeseriesLineChart => {
            WidgetConfig::TimeseriesLineChart(serde_json::from_slice(bytes).map_err(malformed)?)
        }
    })
}

/// Decode a stored widget row, resolving its kind tag first.
///
/// # Errors
///
/// See [`decode`]; additionally fails with [`ConfigDecodeError::UnknownKind`].
pub fn resolve(row: &WidgetRow) -> Result<WidgetConfig, ConfigDecodeError> {
    let kind = WidgetKind::parse(&row.kind).ok_or_else(|| ConfigDecodeError::UnknownKind(row.kind.clone()))?;
    decode(kind, row.config.as_deref())
}

impl WidgetConfig {
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            Self::Text(c) => &c.topic,
            Self::Button(c) => &c.topic,
            Self::Indicator(c) => &c.topic,
            Self::TimeseriesLineChart(c) => &c.topic,
        }
    }

    /// Topics this widget needs a subscription for. Buttons only publish, and
    /// an empty topic subscribes to nothing.
    #[must_use]
    pub fn subscription_topics(&self) -> Vec<&str> {
        match self {
            Self::Button(_) => Vec::new(),
            other if other.topic().is_empty() => Vec::new(),
            other => vec![other.topic()],
        }
    }

    /// Whether messages on this widget's topic must also go to the data log.
    #[must_use]
    pub fn records_history(&self) -> bool {
        matches!(self, Self::TimeseriesLineChart(c) if !c.topic.is_empty())
    }

    /// Serialize back to the stored blob format.
    ///
    /// # Errors
    ///
    /// Returns an error only if serde fails on these plain structs.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Text(c) => serde_json::to_vec(c),
            Self::Button(c) => serde_json::to_vec(c),
            Self::Indicator(c) => serde_json::to_vec(c),
            Self::TimeseriesLineChart(c) => serde_json::to_vec(c),
        }
    }

    /// JSON view used by the management API.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            Self::Text(c) => serde_json::to_value(c),
            Self::Button(c) => serde_json::to_value(c),
            Self::Indicator(c) => serde_json::to_value(c),
            Self::TimeseriesLineChart(c) => serde_json::to_value(c),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// SUBSCRIPTION PLANNING
// =============================================================================

/// Topics a session should subscribe to, derived from a widget set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicPlan {
    /// Deduplicated subscription topics.
    pub subscriptions: BTreeSet<String>,
    /// Topics whose messages are appended to the data log.
    pub recorded: BTreeSet<String>,
    /// Widgets whose configuration could not be decoded.
    pub skipped: Vec<Uuid>,
}

/// Build the subscription plan for a set of widget rows. Widgets that fail to
/// decode are logged and skipped without affecting their siblings.
pub fn plan_topics<'a, I>(widgets: I) -> TopicPlan
where
    I: IntoIterator<Item = &'a WidgetRow>,
{
    let mut plan = TopicPlan::default();
    for row in widgets {
        match resolve(row) {
            Ok(config) => {
                for topic in config.subscription_topics() {
                    plan.subscriptions.insert(topic.to_owned());
                }
                if config.records_history() {
                    plan.recorded.insert(config.topic().to_owned());
                }
            }
            Err(e) => {
                warn!(widget_id = %row.id, kind = %row.kind, error = %e, "skipping widget with undecodable config");
                plan.skipped.push(row.id);
            }
        }
    }
    plan
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
