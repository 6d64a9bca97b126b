//! Single-active-daemon lease.
//!
//! Two daemons scheduling the same sensors could both claim-check a run key
//! before either writes it. The daemon therefore holds a time-bounded lease
//! row and renews it on a heartbeat; a lease that is not renewed expires and
//! can be taken over.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::{init_db, parse_ts, ts};
use crate::error::{Result, SensorError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The caller now holds the lease until `expires_at`.
    Acquired { expires_at: DateTime<Utc> },
    /// Someone else holds an unexpired lease.
    HeldBy {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl LeaseOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired { .. })
    }
}

/// SQLite-backed named leases.
pub struct LeaseStore {
    db: Mutex<Connection>,
}

impl LeaseStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take or extend lease `name` for `holder`. Succeeds when the lease is
    /// free, expired, or already held by `holder`.
    pub fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseOutcome> {
        let expires_at = now + ttl;
        let db = self.conn();
        let changed = db.execute(
            "INSERT INTO daemon_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE
             SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE daemon_leases.holder = excluded.holder OR daemon_leases.expires_at <= ?4",
            params![name, holder, ts(expires_at), ts(now)],
        )?;
        if changed == 1 {
            debug!(lease = name, holder, "lease held");
            return Ok(LeaseOutcome::Acquired { expires_at });
        }
        let current = db
            .query_row(
                "SELECT holder, expires_at FROM daemon_leases WHERE name = ?1",
                [name],
                |row| Ok((row.get::<_, String>(0)?, parse_ts(&row.get::<_, String>(1)?)?)),
            )
            .optional()?;
        match current {
            Some((holder, expires_at)) => Ok(LeaseOutcome::HeldBy { holder, expires_at }),
            // Deleted between the two statements; next attempt will take it.
            None => Ok(LeaseOutcome::HeldBy {
                holder: String::new(),
                expires_at: now,
            }),
        }
    }

    /// Extend a lease the caller already holds. Fails with `LeaseHeld` if it
    /// expired and was taken over.
    pub fn renew(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        match self.try_acquire(name, holder, ttl, now)? {
            LeaseOutcome::Acquired { expires_at } => Ok(expires_at),
            LeaseOutcome::HeldBy { holder: other, .. } => Err(SensorError::LeaseHeld {
                name: name.to_string(),
                holder: other,
            }),
        }
    }

    /// Give the lease up so another daemon can start without waiting for expiry.
    pub fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let n = self.conn().execute(
            "DELETE FROM daemon_leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        if n == 1 {
            info!(lease = name, holder, "lease released");
        }
        Ok(n == 1)
    }
}
