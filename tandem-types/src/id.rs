//! Simulator and entity identifiers.
//!
//! The dot is the reserved separator of this addressing scheme: a
//! [`FullId`] joins a simulator ID and an entity ID as `sid.eid` and
//! splits the combined form at its *first* dot. Simulator IDs are
//! therefore kept dot-free (the orchestrator assigns them as
//! `name-index`), while entity IDs may contain dots freely — child
//! entities commonly extend their parent's ID that way.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a simulator, stable for the lifetime of a run.
///
/// Assigned by the orchestrator as `name-index` when the simulator is
/// started. Dots are replaced on construction so that every entity of
/// the simulator stays addressable (see the module docs).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SimId(String);

impl SimId {
    /// Create a simulator ID. Any dot in `id` becomes a dash.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.contains('.') {
            Self(id.replace('.', "-"))
        } else {
            Self(id)
        }
    }

    /// Borrow the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address an entity of this simulator.
    pub fn entity(&self, eid: impl Into<EntityId>) -> FullId {
        FullId {
            sid: self.clone(),
            eid: eid.into(),
        }
    }
}

impl fmt::Display for SimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SimId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SimId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Identifier of an entity, unique within its owning simulator.
///
/// Chosen by the simulator that creates the entity; the orchestrator
/// treats it as opaque. Dots are allowed — a child entity typically
/// extends its parent's ID (`grid_0`, `grid_0.bus_3`, ...).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Create an entity ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Fully qualified entity address: `sid.eid`.
///
/// Entities are only unique within their owning simulator; whenever
/// data crosses a simulator boundary it is keyed by the full address.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct FullId {
    /// The owning simulator.
    pub sid: SimId,
    /// The entity within that simulator.
    pub eid: EntityId,
}

impl FullId {
    /// Create a full address from its parts.
    pub fn new(sid: impl Into<SimId>, eid: impl Into<EntityId>) -> Self {
        Self {
            sid: sid.into(),
            eid: eid.into(),
        }
    }

    /// Parse a `sid.eid` string. The first dot separates the parts;
    /// simulator IDs are dot-free, entity IDs may contain dots.
    pub fn parse(s: &str) -> Option<Self> {
        let (sid, eid) = s.split_once('.')?;
        Some(Self::new(sid, eid))
    }
}

impl fmt::Display for FullId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sid, self.eid)
    }
}

impl Serialize for FullId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FullId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FullId::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("expected `sid.eid`, got `{s}`")))
    }
}
