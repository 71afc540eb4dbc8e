//! Proportional version allocation.
//!
//! Given the desired traffic ratio of every version and the number of other
//! healthy nodes running each one, decide which version the local node should
//! run next. Every version keeps at least `min_nodes` nodes while capacity
//! allows; the remaining slots follow the ratios.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::common::{Error, Result};

/// Desired traffic ratio per version, in the order the author wrote them.
/// Order matters: when slots run out, earlier versions are served first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationSpec {
    entries: Vec<(String, f64)>,
}

impl AllocationSpec {
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let spec = Self {
            entries: entries.into_iter().map(|(v, r)| (v.into(), r)).collect(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Parse the JSON object stored under `<service>/spec`.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let spec: AllocationSpec = serde_json::from_slice(raw)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(v, _)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ratio(&self, version: &str) -> Option<f64> {
        self.entries.iter().find(|(v, _)| v == version).map(|(_, r)| *r)
    }

    fn validate(&self) -> Result<()> {
        for (i, (version, ratio)) in self.entries.iter().enumerate() {
            if version.is_empty() {
                return Err(Error::InvalidSpec("empty version label".into()));
            }
            if !ratio.is_finite() || *ratio < 0.0 {
                return Err(Error::InvalidSpec(format!("ratio of {} must be a non-negative number, got {}", version, ratio)));
            }
            if self.entries[..i].iter().any(|(v, _)| v == version) {
                return Err(Error::InvalidSpec(format!("version {} listed twice", version)));
            }
        }

        let sum: f64 = self.entries.iter().map(|(_, r)| r).sum();
        if !self.entries.is_empty() && (sum - 1.0).abs() > 1e-6 {
            tracing::warn!(sum, "Allocation ratios do not sum to 1");
        }
        Ok(())
    }
}

impl Serialize for AllocationSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (version, ratio) in &self.entries {
            map.serialize_entry(version, ratio)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AllocationSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SpecVisitor;

        impl<'de> Visitor<'de> for SpecVisitor {
            type Value = AllocationSpec;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping version to traffic ratio")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((version, ratio)) = access.next_entry::<String, f64>()? {
                    entries.push((version, ratio));
                }
                Ok(AllocationSpec { entries })
            }
        }

        deserializer.deserialize_map(SpecVisitor)
    }
}

/// Result of one allocation cycle. Recomputed every cycle, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Healthy nodes per version, excluding the local node
    pub actual: BTreeMap<String, usize>,
    /// Target node count per version
    pub desired: BTreeMap<String, usize>,
    /// Version the local node should run
    pub target: String,
    /// False when capacity cannot give every version its floor
    pub feasible: bool,
}

impl Allocation {
    /// `actual - desired` for `version`; negative means under-provisioned.
    pub fn surplus(&self, version: &str) -> i64 {
        let actual = self.actual.get(version).copied().unwrap_or(0) as i64;
        let desired = self.desired.get(version).copied().unwrap_or(0) as i64;
        actual - desired
    }
}

/// Compute the target version for the local node.
///
/// `actual` counts other passing nodes per version; versions missing from it
/// count as zero and versions absent from `spec` are ignored. Capacity short
/// of `min_nodes` per version still yields a target, with `feasible` unset.
pub fn allocate(spec: &AllocationSpec, actual: &BTreeMap<String, usize>, min_nodes: usize) -> Result<Allocation> {
    if spec.is_empty() {
        return Err(Error::AllocationInfeasible("allocation spec lists no versions".into()));
    }

    let actual: BTreeMap<String, usize> = spec
        .versions()
        .map(|v| (v.to_string(), actual.get(v).copied().unwrap_or(0)))
        .collect();

    // The local node will end up running one of the versions too.
    let total = actual.values().sum::<usize>() + 1;
    let floors = min_nodes * spec.len();

    let mut desired: BTreeMap<String, usize> = spec.versions().map(|v| (v.to_string(), min_nodes)).collect();
    let mut pool = total.saturating_sub(floors).max(1);

    for (version, ratio) in spec.entries() {
        let share = (ratio * total as f64).round() as i64;
        let extra = share - min_nodes as i64;
        if extra <= 0 {
            continue;
        }
        let taken = (extra as usize).min(pool);
        pool -= taken;
        if let Some(n) = desired.get_mut(version) {
            *n += taken;
        }
    }

    let mut allocation = Allocation {
        actual,
        desired,
        target: String::new(),
        feasible: total >= floors,
    };

    // Most under-provisioned first; ties go to the earliest version.
    let mut best: Option<(&str, i64)> = None;
    for version in spec.versions() {
        let surplus = allocation.surplus(version);
        if best.map_or(true, |(_, b)| surplus < b) {
            best = Some((version, surplus));
        }
    }
    if let Some((target, _)) = best {
        allocation.target = target.to_string();
    }

    Ok(allocation)
}
