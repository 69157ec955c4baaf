//! The datafile value object: the unit of cache the Controller owns.
//!
//! A `Datafile` is a flat mapping from flag key to opaque `FlagDefinition`
//! plus a handful of top-level fields. Definitions and segments are never
//! interpreted by the Controller — only the evaluation function (an
//! external collaborator) reads them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An opaque flag definition. The Controller never inspects the contents;
/// it is handed verbatim to the evaluator.
pub type FlagDefinition = serde_json::Value;

/// An opaque segment definition, keyed by segment id in `Datafile::segments`.
pub type SegmentDefinition = serde_json::Value;

/// The full set of flag definitions and segments for one environment.
///
/// `config_updated_at` is the ordering key used by [`is_newer`]: once a
/// datafile with a given timestamp has been admitted to the cache, no
/// datafile with a strictly older timestamp may replace it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datafile {
    /// Optional originating project identifier.
    #[serde(rename = "projectId", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Environment name, e.g. `"production"`.
    pub environment: String,

    /// Flag key → opaque definition.
    #[serde(default)]
    pub definitions: HashMap<String, FlagDefinition>,

    /// Segment id → opaque segment definition.
    #[serde(default)]
    pub segments: HashMap<String, SegmentDefinition>,

    /// Monotonic arrival timestamp. Accepted as either a JSON number or a
    /// numeric string (`ConfigUpdatedAt` normalizes both on the way in).
    #[serde(rename = "configUpdatedAt", skip_serializing_if = "Option::is_none")]
    pub config_updated_at: Option<ConfigUpdatedAt>,
}

impl Datafile {
    /// An empty datafile for the given environment, used as a seed when no
    /// data has been admitted yet.
    pub fn empty(environment: impl Into<String>) -> Self {
        Self {
            project_id: None,
            environment: environment.into(),
            definitions: HashMap::new(),
            segments: HashMap::new(),
            config_updated_at: None,
        }
    }

    /// The flag definition for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&FlagDefinition> {
        self.definitions.get(key)
    }
}

/// A `configUpdatedAt` value, accepted from the wire as either a JSON
/// number or a numeric string.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(untagged)]
pub enum ConfigUpdatedAt {
    /// A plain numeric timestamp.
    Number(f64),
}

impl ConfigUpdatedAt {
    /// The underlying numeric value.
    pub fn value(&self) -> f64 {
        match self {
            Self::Number(n) => *n,
        }
    }
}

impl<'de> Deserialize<'de> for ConfigUpdatedAt {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            String(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(ConfigUpdatedAt::Number(n)),
            Repr::String(s) => s
                .parse::<f64>()
                .map(ConfigUpdatedAt::Number)
                .map_err(|_| serde::de::Error::custom("configUpdatedAt is not numeric")),
        }
    }
}

/// Where a [`Datafile`] came from, before it is mapped to the public
/// [`Source`] the caller sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Delivered over the long-lived stream connection.
    Stream,
    /// Delivered by a polling GET.
    Poll,
    /// Loaded from the build-time-embedded snapshot.
    Bundled,
    /// Supplied directly by the caller via `ControllerOptions::datafile`.
    Provided,
    /// Obtained via a one-shot authenticated fetch.
    Fetched,
}

impl Origin {
    /// Map the internal origin to the public-facing source classification.
    pub fn as_source(&self) -> Source {
        match self {
            Self::Stream | Self::Poll | Self::Provided => Source::InMemory,
            Self::Fetched => Source::Remote,
            Self::Bundled => Source::Embedded,
        }
    }
}

/// Public classification of where a served datafile lives, reported in
/// [`crate::core::metrics::Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Served from an in-memory cache populated by stream/poll/provided.
    InMemory,
    /// Served via a one-shot remote fetch.
    Remote,
    /// Served from the embedded build-time snapshot.
    Embedded,
}

/// A [`Datafile`] tagged with the [`Origin`] it was admitted from. This is
/// the type actually stored in the Controller's single cache slot.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedDatafile {
    /// The datafile payload.
    pub datafile: Datafile,
    /// Where it came from.
    pub origin: Origin,
}

impl TaggedDatafile {
    /// Tag a datafile with its origin.
    pub fn new(datafile: Datafile, origin: Origin) -> Self {
        Self { datafile, origin }
    }
}

/// Compare two optional `configUpdatedAt` values and decide whether
/// `incoming` may replace `current`.
///
/// Returns `true` (accept) when:
/// - there is no current value to compare against, or
/// - either timestamp is unparseable/absent (cannot compare safely), or
/// - `incoming >= current` (ties from the same server tick are permitted;
///   see `DESIGN.md` Open Question 1 for why `>=` was chosen over `>`).
pub fn is_newer(current: Option<ConfigUpdatedAt>, incoming: Option<ConfigUpdatedAt>) -> bool {
    match (current, incoming) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(cur), Some(inc)) => inc.value() >= cur.value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: f64) -> Option<ConfigUpdatedAt> {
        Some(ConfigUpdatedAt::Number(n))
    }

    #[test]
    fn accepts_first_datafile_unconditionally() {
        assert!(is_newer(None, ts(1.0)));
    }

    #[test]
    fn rejects_strictly_older_timestamp() {
        assert!(!is_newer(ts(2.0), ts(1.0)));
    }

    #[test]
    fn accepts_equal_timestamp_same_tick() {
        assert!(is_newer(ts(2.0), ts(2.0)));
    }

    #[test]
    fn accepts_when_incoming_unparseable() {
        assert!(is_newer(ts(5.0), None));
    }

    #[test]
    fn accepts_when_current_unparseable() {
        assert!(is_newer(None, ts(5.0)));
    }

    #[test]
    fn origin_maps_to_expected_source() {
        assert_eq!(Origin::Stream.as_source(), Source::InMemory);
        assert_eq!(Origin::Poll.as_source(), Source::InMemory);
        assert_eq!(Origin::Provided.as_source(), Source::InMemory);
        assert_eq!(Origin::Fetched.as_source(), Source::Remote);
        assert_eq!(Origin::Bundled.as_source(), Source::Embedded);
    }

    #[test]
    fn deserializes_numeric_string_config_updated_at() {
        let json = r#"{"environment":"production","configUpdatedAt":"42"}"#;
        let df: Datafile = serde_json::from_str(json).unwrap();
        assert_eq!(df.config_updated_at.unwrap().value(), 42.0);
    }
}
