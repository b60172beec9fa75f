//! Simulator metadata: the `init` reply, validated and expanded.
//!
//! Simulators describe themselves once, at `init`: which protocol
//! version they speak, whether they are stepped by time or by events,
//! and which models with which attributes they provide. The raw wire
//! shape ([`RawMeta`]) is permissive; [`SimMeta::validate`] turns it
//! into the expanded form the scheduler relies on, filling in the
//! per-kind defaults for trigger and persistent attributes.

use crate::error::ConfigError;
use crate::id::SimId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Major version of the simulator protocol this orchestrator speaks.
pub const API_MAJOR: u32 = 3;
/// Minor version of the simulator protocol this orchestrator speaks.
pub const API_MINOR: u32 = 0;

/// Method names every simulator provides; models and extra methods must
/// not shadow them.
pub const RESERVED_METHODS: [&str; 6] = ["init", "create", "setup_done", "step", "get_data", "stop"];

/// How a simulator advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulatorKind {
    /// Steps itself on a fixed or self-chosen cadence; outputs persist.
    #[serde(rename = "time-based")]
    TimeBased,
    /// Steps only when triggered; outputs are transient events.
    #[serde(rename = "event-based")]
    EventBased,
    /// Mixes both; attribute partitions are explicit.
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl fmt::Display for SimulatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimulatorKind::TimeBased => "time-based",
            SimulatorKind::EventBased => "event-based",
            SimulatorKind::Hybrid => "hybrid",
        };
        write!(f, "{s}")
    }
}

/// `[attr, ...]` or `true` (meaning: all attributes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrSelection {
    /// All of the model's attributes (`true`) or none (`false`).
    All(bool),
    /// An explicit list.
    List(Vec<String>),
}

impl AttrSelection {
    fn resolve(&self, attrs: &BTreeSet<String>) -> BTreeSet<String> {
        match self {
            AttrSelection::All(true) => attrs.clone(),
            AttrSelection::All(false) => BTreeSet::new(),
            AttrSelection::List(list) => list.iter().cloned().collect(),
        }
    }
}

/// A model definition as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawModelMeta {
    /// Whether scenario code may instantiate the model directly.
    pub public: bool,
    /// Names of the creation parameters.
    #[serde(default)]
    pub params: Vec<String>,
    /// Names of the exchangeable attributes.
    #[serde(default)]
    pub attrs: Vec<String>,
    /// Attributes whose arrival triggers a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<AttrSelection>,
    /// Complement declaration of `trigger`.
    #[serde(default, rename = "non-trigger", skip_serializing_if = "Option::is_none")]
    pub non_trigger: Option<AttrSelection>,
    /// Attributes whose last value stays readable until overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<AttrSelection>,
    /// Complement declaration of `persistent`.
    #[serde(
        default,
        rename = "non-persistent",
        skip_serializing_if = "Option::is_none"
    )]
    pub non_persistent: Option<AttrSelection>,
    /// Accept inputs for attributes not listed in `attrs`.
    #[serde(default)]
    pub any_inputs: bool,
}

/// The `init` reply as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeta {
    /// `"MAJOR.MINOR"` or `"MAJOR.MINOR.PATCH"`.
    pub api_version: String,
    /// Missing on simulators predating the kind field; defaulted to
    /// time-based with a deprecation warning.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<SimulatorKind>,
    /// The models this simulator provides.
    pub models: BTreeMap<String, RawModelMeta>,
    /// Additional methods callable through the proxy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_methods: Vec<String>,
}

/// A parsed protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Optional patch component.
    pub patch: Option<u32>,
}

impl ApiVersion {
    /// Parse `"MAJOR.MINOR"` / `"MAJOR.MINOR.PATCH"`. Returns a short
    /// reason on failure.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(format!(
                "version must be \"major.minor\" or \"major.minor.patch\", got \"{s}\""
            ));
        }
        let mut nums = Vec::with_capacity(parts.len());
        for p in &parts {
            nums.push(
                p.parse::<u32>()
                    .map_err(|_| format!("version parts of \"{s}\" must be integers"))?,
            );
        }
        Ok(ApiVersion {
            major: nums[0],
            minor: nums[1],
            patch: nums.get(2).copied(),
        })
    }

    /// True for versions older than the given `major.minor`.
    pub fn is_before(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) < (major, minor)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(p) = self.patch {
            write!(f, ".{p}")?;
        }
        Ok(())
    }
}

/// A model definition after validation: partitions resolved into sets.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMeta {
    /// Whether scenario code may instantiate the model directly.
    pub public: bool,
    /// Names of the creation parameters.
    pub params: Vec<String>,
    /// Names of the exchangeable attributes.
    pub attrs: BTreeSet<String>,
    /// Attributes whose arrival triggers a step of the owner.
    pub trigger: BTreeSet<String>,
    /// Attributes whose last value stays readable until overwritten.
    pub persistent: BTreeSet<String>,
    /// Accept inputs for attributes not listed in `attrs`.
    pub any_inputs: bool,
}

impl ModelMeta {
    /// Whether `attr` may be delivered to entities of this model.
    pub fn accepts(&self, attr: &str) -> bool {
        self.any_inputs || self.attrs.contains(attr)
    }
}

/// Validated simulator metadata.
#[derive(Debug, Clone)]
pub struct SimMeta {
    /// The protocol version the simulator reported.
    pub api_version: ApiVersion,
    /// How the simulator advances.
    pub kind: SimulatorKind,
    /// True when the kind was missing and defaulted.
    pub kind_defaulted: bool,
    /// The models, with partitions resolved.
    pub models: BTreeMap<String, ModelMeta>,
    /// Additional methods callable through the proxy.
    pub extra_methods: Vec<String>,
}

impl SimMeta {
    /// Validate and expand a raw `init` reply.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnsupportedVersion`] for versions this
    /// orchestrator cannot speak (newer than [`API_MAJOR`].[`API_MINOR`]),
    /// [`ConfigError::IllegalModelNames`] /
    /// [`ConfigError::IllegalExtraMethods`] for name collisions, and
    /// [`ConfigError::AttrPartition`] for inconsistent trigger or
    /// persistent declarations.
    pub fn validate(raw: RawMeta, sid: &SimId) -> Result<Self, ConfigError> {
        let api_version = ApiVersion::parse(&raw.api_version).map_err(|reason| {
            ConfigError::UnsupportedVersion {
                sid: sid.clone(),
                version: raw.api_version.clone(),
                reason,
            }
        })?;
        if (api_version.major, api_version.minor) > (API_MAJOR, API_MINOR) {
            return Err(ConfigError::UnsupportedVersion {
                sid: sid.clone(),
                version: raw.api_version.clone(),
                reason: format!("newer than the supported {API_MAJOR}.{API_MINOR}"),
            });
        }

        check_names(sid, &raw)?;

        let kind_defaulted = raw.kind.is_none();
        let kind = raw.kind.unwrap_or(SimulatorKind::TimeBased);

        let mut models = BTreeMap::new();
        for (name, model) in raw.models {
            let expanded = expand_model(sid, &name, kind, model)?;
            models.insert(name, expanded);
        }

        Ok(SimMeta {
            api_version,
            kind,
            kind_defaulted,
            models,
            extra_methods: raw.extra_methods,
        })
    }

    /// Look up a model, or fail with the attribute-level error callers
    /// want to surface.
    pub fn model(&self, name: &str) -> Option<&ModelMeta> {
        self.models.get(name)
    }
}

fn check_names(sid: &SimId, raw: &RawMeta) -> Result<(), ConfigError> {
    let reserved: BTreeSet<&str> = RESERVED_METHODS.into_iter().collect();
    let illegal_models: Vec<String> = raw
        .models
        .keys()
        .filter(|m| reserved.contains(m.as_str()))
        .cloned()
        .collect();
    if !illegal_models.is_empty() {
        return Err(ConfigError::IllegalModelNames {
            sid: sid.clone(),
            names: illegal_models,
        });
    }
    let illegal_extra: Vec<String> = raw
        .extra_methods
        .iter()
        .filter(|m| reserved.contains(m.as_str()) || raw.models.contains_key(*m))
        .cloned()
        .collect();
    if !illegal_extra.is_empty() {
        return Err(ConfigError::IllegalExtraMethods {
            sid: sid.clone(),
            names: illegal_extra,
        });
    }
    Ok(())
}

fn expand_model(
    sid: &SimId,
    name: &str,
    kind: SimulatorKind,
    raw: RawModelMeta,
) -> Result<ModelMeta, ConfigError> {
    let partition_err = |reason: String| ConfigError::AttrPartition {
        sid: sid.clone(),
        model: name.to_owned(),
        reason,
    };

    let attrs: BTreeSet<String> = raw.attrs.iter().cloned().collect();

    let trigger = resolve_partition(
        &attrs,
        raw.trigger.as_ref(),
        raw.non_trigger.as_ref(),
        kind == SimulatorKind::EventBased,
        "trigger",
        "non-trigger",
    )
    .map_err(&partition_err)?;

    let persistent = resolve_partition(
        &attrs,
        raw.persistent.as_ref(),
        raw.non_persistent.as_ref(),
        matches!(kind, SimulatorKind::TimeBased | SimulatorKind::Hybrid),
        "persistent",
        "non-persistent",
    )
    .map_err(&partition_err)?;

    Ok(ModelMeta {
        public: raw.public,
        params: raw.params,
        attrs,
        trigger,
        persistent,
        any_inputs: raw.any_inputs,
    })
}

/// Resolve a positive/negative attribute-partition pair into the
/// positive set. `default_all` decides what an entirely absent
/// declaration means for the simulator's kind.
fn resolve_partition(
    attrs: &BTreeSet<String>,
    positive: Option<&AttrSelection>,
    negative: Option<&AttrSelection>,
    default_all: bool,
    pos_name: &str,
    neg_name: &str,
) -> Result<BTreeSet<String>, String> {
    let pos = positive.map(|s| s.resolve(attrs));
    let neg = negative.map(|s| s.resolve(attrs));
    match (pos, neg) {
        (Some(pos), Some(neg)) => {
            let overlap: Vec<&String> = pos.intersection(&neg).collect();
            if !overlap.is_empty() {
                return Err(format!(
                    "{pos_name} and {neg_name} overlap: {}",
                    overlap
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            if pos.union(&neg).cloned().collect::<BTreeSet<_>>() != *attrs {
                return Err(format!(
                    "{pos_name} and {neg_name} must be a disjoint split of attrs"
                ));
            }
            Ok(pos)
        }
        (Some(pos), None) => {
            if !pos.is_subset(attrs) {
                return Err(format!("{pos_name} attributes must be a subset of attrs"));
            }
            Ok(pos)
        }
        (None, Some(neg)) => {
            if !neg.is_subset(attrs) {
                return Err(format!("{neg_name} attributes must be a subset of attrs"));
            }
            Ok(attrs.difference(&neg).cloned().collect())
        }
        (None, None) => {
            if default_all {
                Ok(attrs.clone())
            } else {
                Ok(BTreeSet::new())
            }
        }
    }
}
