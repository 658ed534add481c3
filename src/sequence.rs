//! Transactional sequence allocation.
//!
//! One counter row per counted kind holds the last issued value. `acquire`
//! inserts the row if absent and reads it inside the caller's transaction;
//! the insert is a write statement, so under WAL the transaction becomes the
//! single writer and every other allocator of any kind queues behind it
//! until commit. Values are handed out in memory with [`SequenceAllocation::next`]
//! and written back exactly once by [`SequenceAllocation::persist`], so a
//! batch that issues many ids pays for one read and one update. If the
//! transaction rolls back, the counter row is untouched and nothing was
//! issued, which is what keeps the sequence gapless.

use sqlx::{Sqlite, Transaction};

/// Independently counted entity kinds. Counters of different kinds never
/// share a row, so unrelated aggregates do not contend on each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SequenceKind {
    StreamOut,
    User,
    Game,
}

impl SequenceKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::StreamOut => "stream_out",
            Self::User => "user",
            Self::Game => "game",
        }
    }
}

/// In-memory handle over an acquired counter row. Lives at most as long as
/// the enclosing transaction; dropping it without [`persist`](Self::persist)
/// issues nothing.
#[derive(Debug)]
pub(crate) struct SequenceAllocation {
    kind: SequenceKind,
    value: i64,
}

impl SequenceAllocation {
    pub(crate) async fn acquire(
        sql_tx: &mut Transaction<'_, Sqlite>,
        kind: SequenceKind,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query("INSERT OR IGNORE INTO sequence_counters (kind, value) VALUES (?1, 0)")
            .bind(kind.as_str())
            .execute(sql_tx.as_mut())
            .await?;

        let value: i64 = sqlx::query_scalar("SELECT value FROM sequence_counters WHERE kind = ?1")
            .bind(kind.as_str())
            .fetch_one(sql_tx.as_mut())
            .await?;

        Ok(Self { kind, value })
    }

    /// Issues the next value. In-memory only until [`persist`](Self::persist).
    pub(crate) fn next(&mut self) -> i64 {
        self.value += 1;
        self.value
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> i64 {
        self.value
    }

    /// Writes the final value back. Call once, at the end of the enclosing
    /// transaction.
    pub(crate) async fn persist(
        self,
        sql_tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE sequence_counters SET value = ?1 WHERE kind = ?2")
            .bind(self.value)
            .bind(self.kind.as_str())
            .execute(sql_tx.as_mut())
            .await?;

        Ok(())
    }
}
