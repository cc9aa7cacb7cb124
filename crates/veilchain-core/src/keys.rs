use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// A public key admitted to sign blocks, with its authorization interval.
///
/// Authorization is evaluated at a block's timestamp: the key must have
/// existed then and not yet have been revoked. Revocation is soft — it
/// never invalidates blocks signed while the key was live.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizedKey {
    /// PEM (SPKI) encoding; unique across the key table.
    pub public_key: String,
    pub owner_name: String,
    pub created_at: Timestamp,
    pub revoked_at: Option<Timestamp>,
}

impl AuthorizedKey {
    pub fn new(public_key: String, owner_name: String, created_at: Timestamp) -> Self {
        Self {
            public_key,
            owner_name,
            created_at,
            revoked_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    /// True iff the key was authorized at `ts`:
    /// `created_at <= ts` and not revoked strictly before `ts`.
    pub fn was_authorized_at(&self, ts: &Timestamp) -> bool {
        if self.created_at > *ts {
            return false;
        }
        match self.revoked_at {
            Some(revoked) => *ts < revoked,
            None => true,
        }
    }
}

/// Tombstone left behind by a hard key deletion. A tombstoned public key
/// can never be re-admitted; the record keeps the audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeletedKeyRecord {
    pub public_key: String,
    pub owner_name: String,
    pub deleted_at: Timestamp,
    /// Operator-supplied justification; required for forced deletions.
    pub reason: String,
    /// Blocks orphaned by this deletion.
    pub affected_blocks: u64,
}

/// Impact analysis for a candidate hard deletion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDeletionImpact {
    /// Historical blocks signed by the key.
    pub affected_blocks: u64,
    /// Deleting would orphan signed blocks.
    pub severe: bool,
}

impl KeyDeletionImpact {
    pub fn new(affected_blocks: u64) -> Self {
        Self {
            affected_blocks,
            severe: affected_blocks > 0,
        }
    }

    /// Safe to delete without `force`.
    pub fn is_safe(&self) -> bool {
        !self.severe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn authorization_window() {
        let t0 = Utc::now();
        let mut key = AuthorizedKey::new("pem".into(), "alice".into(), t0);

        assert!(!key.was_authorized_at(&(t0 - Duration::seconds(1))));
        assert!(key.was_authorized_at(&t0));
        assert!(key.was_authorized_at(&(t0 + Duration::days(365))));

        key.revoked_at = Some(t0 + Duration::seconds(10));
        assert!(key.was_authorized_at(&(t0 + Duration::seconds(9))));
        // Revocation boundary is exclusive.
        assert!(!key.was_authorized_at(&(t0 + Duration::seconds(10))));
        assert!(!key.was_authorized_at(&(t0 + Duration::seconds(11))));
    }

    #[test]
    fn deletion_impact_severity() {
        assert!(KeyDeletionImpact::new(0).is_safe());
        let impact = KeyDeletionImpact::new(3);
        assert!(impact.severe);
        assert!(!impact.is_safe());
    }
}
