use std::fmt::Display;

use serde::Serialize;

use super::Revision;

/// Where a version request came from. The variant order is the precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Pulled in as a transitive dependency by introspection.
    Inherited,
    /// Explicit in a specification file.
    Declared,
    /// Fixed by the base (standard release) policy.
    Locked,
}

impl Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Inherited => f.write_str("inherited"),
            Origin::Declared => f.write_str("declared"),
            Origin::Locked => f.write_str("locked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionConstraint {
    pub version: Revision,
    pub origin: Origin,
}

impl VersionConstraint {
    pub fn new(version: Revision, origin: Origin) -> Self {
        Self { version, origin }
    }

    pub fn declared(version: impl Into<Revision>) -> Self {
        Self::new(version.into(), Origin::Declared)
    }

    pub fn inherited(version: impl Into<Revision>) -> Self {
        Self::new(version.into(), Origin::Inherited)
    }

    pub fn locked(version: impl Into<Revision>) -> Self {
        Self::new(version.into(), Origin::Locked)
    }

    pub fn is_locked(&self) -> bool {
        self.origin == Origin::Locked
    }
}

impl Display for VersionConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.version, self.origin)
    }
}

/// Two constraints on the same module that cannot be reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub existing: VersionConstraint,
    pub incoming: VersionConstraint,
}

/// Reconciles two constraints on one module.
///
/// A locked side always wins; two locked sides must agree. Otherwise `declared` beats
/// `inherited`, and two constraints of the same origin must agree. An arbitrary revision agrees
/// with everything and takes the pinned revision of the other side.
pub fn merge(
    existing: &VersionConstraint,
    incoming: &VersionConstraint,
) -> Result<VersionConstraint, Conflict> {
    if existing.origin == incoming.origin {
        return if existing.version.is_compatible_with(&incoming.version) {
            let version = if existing.version.is_arbitrary() {
                incoming.version.clone()
            } else {
                existing.version.clone()
            };
            Ok(VersionConstraint::new(version, existing.origin))
        } else {
            Err(Conflict {
                existing: existing.clone(),
                incoming: incoming.clone(),
            })
        };
    }

    let (winner, loser) = if existing.origin > incoming.origin {
        (existing, incoming)
    } else {
        (incoming, existing)
    };
    let version = if winner.version.is_arbitrary() {
        loser.version.clone()
    } else {
        winner.version.clone()
    };
    Ok(VersionConstraint::new(version, winner.origin))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn locked_wins_over_declared() {
        let merged = merge(
            &VersionConstraint::locked("R1"),
            &VersionConstraint::declared("R2"),
        )
        .unwrap();
        assert_eq!(merged, VersionConstraint::locked("R1"));

        let merged = merge(
            &VersionConstraint::inherited("R2"),
            &VersionConstraint::locked("R1"),
        )
        .unwrap();
        assert_eq!(merged, VersionConstraint::locked("R1"));
    }

    #[test]
    fn locked_mismatch_is_a_conflict() {
        let conflict = merge(
            &VersionConstraint::locked("R1"),
            &VersionConstraint::locked("R2"),
        )
        .unwrap_err();
        assert_eq!(conflict.existing, VersionConstraint::locked("R1"));
        assert_eq!(conflict.incoming, VersionConstraint::locked("R2"));
    }

    #[test]
    fn declared_wins_over_inherited() {
        let merged = merge(
            &VersionConstraint::inherited("R1"),
            &VersionConstraint::declared("R2"),
        )
        .unwrap();
        assert_eq!(merged, VersionConstraint::declared("R2"));
    }

    #[test]
    fn declared_mismatch_is_a_conflict_unless_identical() {
        assert!(merge(
            &VersionConstraint::declared("R2"),
            &VersionConstraint::declared("R3"),
        )
        .is_err());
        assert_eq!(
            merge(
                &VersionConstraint::declared("R2"),
                &VersionConstraint::declared("R2"),
            )
            .unwrap(),
            VersionConstraint::declared("R2")
        );
    }

    #[test]
    fn arbitrary_takes_pinned_revision() {
        let merged = merge(
            &VersionConstraint::locked(Revision::Arbitrary),
            &VersionConstraint::declared("R2"),
        )
        .unwrap();
        assert_eq!(merged, VersionConstraint::locked("R2"));

        let merged = merge(
            &VersionConstraint::declared(Revision::Arbitrary),
            &VersionConstraint::declared("R2"),
        )
        .unwrap();
        assert_eq!(merged, VersionConstraint::declared("R2"));
    }
}
