//! SQLite-backed analytics store.
//!
//! One connection behind a mutex; SQLite performs best with a single
//! writer and the batchers commit at most once per flush anyway.
//!
//! ```text
//! images_analytics (image_id PK, views_count, likes_count)
//! images_to_views  (image_id, user_id NULL, UNIQUE(image_id, user_id))
//! images_to_likes  (image_id, user_id, PK(image_id, user_id))
//! ```
//!
//! `NULL` user ids never collide under a `UNIQUE` constraint, so anonymous
//! views are always inserted.

use super::items::{
    tally, CounterDelta, GroupDelta, ImageCounters, ImageId, ImageStates, LikeItem, UserId,
    ViewItem,
};
use super::store::{AnalyticsStore, AnalyticsTx, StoreError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS images_analytics (
    image_id    INTEGER PRIMARY KEY,
    views_count INTEGER NOT NULL DEFAULT 0,
    likes_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS images_to_views (
    image_id INTEGER NOT NULL,
    user_id  INTEGER,
    UNIQUE (image_id, user_id)
);
CREATE TABLE IF NOT EXISTS images_to_likes (
    image_id INTEGER NOT NULL,
    user_id  INTEGER NOT NULL,
    PRIMARY KEY (image_id, user_id)
);
";

pub struct SqliteAnalyticsStore {
    conn: Mutex<Connection>,
    commit_timeout: Duration,
}

impl SqliteAnalyticsStore {
    /// Open (or create) the database at `path`.
    ///
    /// `commit_timeout` bounds both the wait for SQLite's write lock and the
    /// duration of a transaction body; a slower transaction is rolled back.
    pub fn open(path: impl AsRef<Path>, commit_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        Self::init(conn, commit_timeout)
    }

    /// Private in-memory database
    pub fn open_in_memory(commit_timeout: Duration) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, commit_timeout)
    }

    fn init(conn: Connection, commit_timeout: Duration) -> Result<Self, StoreError> {
        conn.busy_timeout(commit_timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteAnalyticsStore {
            conn: Mutex::new(conn),
            commit_timeout,
        })
    }

    pub fn commit_timeout(&self) -> Duration {
        self.commit_timeout
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl AnalyticsTx for SqliteTx<'_> {
    fn insert_views(&mut self, views: &[ViewItem]) -> Result<Vec<GroupDelta>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO images_to_views (image_id, user_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
        )?;
        let mut inserted = Vec::with_capacity(views.len());
        for view in views {
            let changed = stmt.execute(params![view.image_id.0, view.user_id.map(|u| u.0)])?;
            if changed > 0 {
                inserted.push(view.image_id);
            }
        }
        Ok(tally(inserted))
    }

    fn insert_likes(&mut self, likes: &[LikeItem]) -> Result<Vec<GroupDelta>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO images_to_likes (image_id, user_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
        )?;
        let mut inserted = Vec::with_capacity(likes.len());
        for like in likes {
            if stmt.execute(params![like.image_id.0, like.user_id.0])? > 0 {
                inserted.push(like.image_id);
            }
        }
        Ok(tally(inserted))
    }

    fn delete_likes(&mut self, likes: &[LikeItem]) -> Result<Vec<GroupDelta>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM images_to_likes WHERE image_id = ?1 AND user_id = ?2")?;
        let mut removed = Vec::with_capacity(likes.len());
        for like in likes {
            if stmt.execute(params![like.image_id.0, like.user_id.0])? > 0 {
                removed.push(like.image_id);
            }
        }
        Ok(tally(removed))
    }

    fn apply_counter_deltas(&mut self, deltas: &[CounterDelta]) -> Result<usize, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE images_analytics
             SET views_count = views_count + ?2, likes_count = likes_count + ?3
             WHERE image_id = ?1",
        )?;
        let mut updated = 0;
        for delta in deltas {
            updated += stmt.execute(params![delta.image_id.0, delta.views, delta.likes])?;
        }
        Ok(updated)
    }
}

impl AnalyticsStore for SqliteAnalyticsStore {
    fn register_image(&self, image_id: ImageId) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO images_analytics (image_id) VALUES (?1) ON CONFLICT DO NOTHING",
            params![image_id.0],
        )?;
        Ok(())
    }

    fn image_counters(&self, image_id: ImageId) -> Result<Option<ImageCounters>, StoreError> {
        let counters = self
            .conn
            .lock()
            .query_row(
                "SELECT views_count, likes_count FROM images_analytics WHERE image_id = ?1",
                params![image_id.0],
                |row| {
                    Ok(ImageCounters {
                        views: row.get(0)?,
                        likes: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(counters)
    }

    fn viewer_state(&self, image_id: ImageId, user_id: UserId) -> Result<ImageStates, StoreError> {
        let states = self.conn.lock().query_row(
            "SELECT
                EXISTS (SELECT 1 FROM images_to_views WHERE image_id = ?1 AND user_id = ?2),
                EXISTS (SELECT 1 FROM images_to_likes WHERE image_id = ?1 AND user_id = ?2)",
            params![image_id.0, user_id.0],
            |row| {
                Ok(ImageStates {
                    viewed: row.get(0)?,
                    liked: row.get(1)?,
                })
            },
        )?;
        Ok(states)
    }

    fn has_like(&self, image_id: ImageId, user_id: UserId) -> Result<bool, StoreError> {
        let liked = self.conn.lock().query_row(
            "SELECT EXISTS (SELECT 1 FROM images_to_likes WHERE image_id = ?1 AND user_id = ?2)",
            params![image_id.0, user_id.0],
            |row| row.get(0),
        )?;
        Ok(liked)
    }

    fn transaction<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn AnalyticsTx) -> Result<R, StoreError>,
    {
        let mut conn = self.conn.lock();
        let start = Instant::now();
        let tx = conn.transaction()?;

        // Dropping `tx` without commit rolls back.
        let result = f(&mut SqliteTx { conn: &tx })?;

        let elapsed = start.elapsed();
        if elapsed > self.commit_timeout {
            return Err(StoreError::Timeout {
                elapsed,
                limit: self.commit_timeout,
            });
        }
        tx.commit()?;
        debug!(elapsed_us = start.elapsed().as_micros() as u64, "sqlite transaction committed");
        Ok(result)
    }
}
