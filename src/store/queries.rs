//! Query surface of the metadata store.

use anyhow::{Context, Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};

use crate::types::{Entry, State, StatRow, mode_is_file};
use crate::utils::config::PrefetchConsts;

use super::Store;

/// Stat column list in the order expected by [`stat_from_row`].
const ST_COLS: &str =
    "st_mode, st_ino, st_dev, st_nlink, st_uid, st_gid, st_size, st_atime, st_ctime, st_mtime";

/// Build a [`StatRow`] from `row` starting at column `base`.
fn stat_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<StatRow> {
    Ok(StatRow {
        mode: row.get::<_, i64>(base)? as u32,
        ino: row.get::<_, i64>(base + 1)? as u64,
        dev: row.get::<_, i64>(base + 2)? as u64,
        nlink: row.get::<_, i64>(base + 3)? as u64,
        uid: row.get::<_, i64>(base + 4)? as u32,
        gid: row.get::<_, i64>(base + 5)? as u32,
        size: row.get::<_, i64>(base + 6)?.max(0) as u64,
        atime: row.get(base + 7)?,
        ctime: row.get(base + 8)?,
        mtime: row.get(base + 9)?,
    })
}

fn parse_state(raw: i64) -> Result<State> {
    State::from_raw(raw).ok_or_else(|| anyhow!("unknown state {raw} in store"))
}

impl Store {
    /// Stored stat group for `path`, or none.
    pub fn get_attr(&self, path: &str) -> Result<Option<StatRow>> {
        let conn = self.conn.lock().unwrap();
        let query = format!("SELECT {ST_COLS} FROM filesystem WHERE path = ?1");
        conn.query_row(&query, params![path], |row| stat_from_row(row, 0))
            .optional()
            .with_context(|| format!("get attr of '{path}'"))
    }

    /// Stored stat group for `id`, or none.
    pub fn get_attr_by_id(&self, id: i64) -> Result<Option<StatRow>> {
        let conn = self.conn.lock().unwrap();
        let query = format!("SELECT {ST_COLS} FROM filesystem WHERE id = ?1");
        conn.query_row(&query, params![id], |row| stat_from_row(row, 0))
            .optional()
            .with_context(|| format!("get attr of id {id}"))
    }

    /// Id and stat group of the child of `parent_id` named `name`, or none.
    pub fn get_child_attr(&self, parent_id: i64, name: &str) -> Result<Option<(i64, StatRow)>> {
        let conn = self.conn.lock().unwrap();
        let query =
            format!("SELECT id, {ST_COLS} FROM filesystem WHERE parent_id = ?1 AND name = ?2");
        conn.query_row(&query, params![parent_id, name], |row| {
            Ok((row.get::<_, i64>(0)?, stat_from_row(row, 1)?))
        })
        .optional()
        .with_context(|| format!("get child '{name}' of id {parent_id}"))
    }

    pub fn get_id(&self, path: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id FROM filesystem WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("get id of '{path}'"))
    }

    /// Parent id of `id`, or none. The root reports the -1 sentinel.
    pub fn get_parent_id(&self, id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT parent_id FROM filesystem WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("get parent of id {id}"))
    }

    /// Virtual path of `id`, or none.
    pub fn get_path(&self, id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT path FROM filesystem WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("get path of id {id}"))
    }

    pub fn get_id_state_size(&self, path: &str) -> Result<Option<(i64, State, u64)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, state, st_size FROM filesystem WHERE path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("get id/state/size of '{path}'"))?;
        match row {
            None => Ok(None),
            Some((id, raw, size)) => Ok(Some((id, parse_state(raw)?, size.max(0) as u64))),
        }
    }

    pub fn get_state_size(&self, id: i64) -> Result<Option<(State, u64)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT state, st_size FROM filesystem WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .with_context(|| format!("get state/size of id {id}"))?;
        match row {
            None => Ok(None),
            Some((raw, size)) => Ok(Some((parse_state(raw)?, size.max(0) as u64))),
        }
    }

    pub fn get_children_names(&self, parent_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM filesystem WHERE parent_id = ?1")
            .context("prepare children names query")?;
        let rows = stmt
            .query_map(params![parent_id], |row| row.get(0))
            .context("query children names")?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.context("read child name")?);
        }
        Ok(names)
    }

    pub fn get_children_ids(&self, parent_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id FROM filesystem WHERE parent_id = ?1")
            .context("prepare children ids query")?;
        let rows = stmt
            .query_map(params![parent_id], |row| row.get(0))
            .context("query children ids")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("read child id")?);
        }
        Ok(ids)
    }

    /// Children of `parent_id` as (id, name, st_mode), sorted by name.
    pub fn get_children_dirents(&self, parent_id: i64) -> Result<Vec<(i64, String, u32)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, name, st_mode FROM filesystem WHERE parent_id = ?1 ORDER BY name")
            .context("prepare dirents query")?;
        let rows = stmt
            .query_map(params![parent_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u32,
                ))
            })
            .context("query dirents")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read dirent")?);
        }
        Ok(out)
    }

    /// First regular-file entry whose path sorts strictly after `path`,
    /// scanning at most a handful of candidates.
    pub fn get_next_file_path_state(&self, path: &str) -> Result<Option<(String, State)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT path, state, st_mode FROM filesystem \
                 WHERE path > ?1 ORDER BY path LIMIT ?2",
            )
            .context("prepare next file query")?;
        let rows = stmt
            .query_map(
                params![path, PrefetchConsts::NEXT_FILE_SCAN as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)? as u32,
                    ))
                },
            )
            .context("query next file")?;
        for row in rows {
            let (path, raw, mode) = row.context("read next file row")?;
            if mode_is_file(mode) {
                return Ok(Some((path, parse_state(raw)?)));
            }
        }
        Ok(None)
    }

    /// Un-cached entries to prefetch starting at `path`, in playlist
    /// (lexicographic) order. Accumulates media duration over the scanned
    /// rows and stops once it exceeds `max_duration_sec`.
    pub fn get_next_files_to_cache(
        &self,
        path: &str,
        max_duration_sec: i64,
    ) -> Result<Vec<(i64, String, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, path, state, duration, st_size FROM filesystem \
                 WHERE path >= ?1 ORDER BY path LIMIT ?2",
            )
            .context("prepare files to cache query")?;
        let rows = stmt
            .query_map(params![path, PrefetchConsts::SCAN_LIMIT as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("query files to cache")?;

        let mut res = Vec::new();
        let mut acc_duration = 0_i64;
        for row in rows {
            let (id, path, raw, duration, size) = row.context("read file to cache row")?;
            if let Some(duration) = duration {
                if parse_state(raw)? == State::NoCached {
                    res.push((id, path, size.max(0) as u64));
                }
                acc_duration += duration;
                if acc_duration > max_duration_sec {
                    break;
                }
            }
        }
        Ok(res)
    }

    /// Compare-and-swap state transition. Advisory: a non-matching old
    /// state updates nothing and is not an error.
    pub fn set_state(&self, id: i64, old: State, new: State) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("begin transaction")?;
        tx.execute(
            "UPDATE filesystem SET state = ?1 WHERE id = ?2 AND state = ?3",
            params![new.as_i64(), id, old.as_i64()],
        )
        .with_context(|| format!("set state of id {id}"))?;
        tx.commit().context("commit transaction")
    }

    /// Bulk state swap. Used at startup to recover orphan in-progress rows.
    pub fn set_states(&self, old: State, new: State) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("begin transaction")?;
        tx.execute(
            "UPDATE filesystem SET state = ?1 WHERE state = ?2",
            params![new.as_i64(), old.as_i64()],
        )
        .context("swap states")?;
        tx.commit().context("commit transaction")
    }

    pub fn set_last_access_ts(&self, id: i64, ts: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("begin transaction")?;
        tx.execute(
            "UPDATE filesystem SET last_access_ts = ?1 WHERE id = ?2",
            params![ts, id],
        )
        .with_context(|| format!("set last access of id {id}"))?;
        tx.commit().context("commit transaction")
    }

    /// Sum of stored sizes over all cached entries.
    pub fn get_cached_bytes(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let sum: Option<i64> = conn
            .query_row(
                "SELECT sum(st_size) FROM filesystem WHERE state = ?1",
                params![State::Cached.as_i64()],
                |row| row.get(0),
            )
            .context("sum cached bytes")?;
        Ok(sum.unwrap_or(0).max(0) as u64)
    }

    /// Oldest cached entries by last access, one page at a time.
    /// Returns `(has_more, rows)`; `has_more` means a full page came back.
    pub fn get_oldest_cached_files(&self, limit: usize) -> Result<(bool, Vec<(i64, u64)>)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, st_size FROM filesystem WHERE state = ?1 \
                 ORDER BY last_access_ts LIMIT ?2",
            )
            .context("prepare oldest cached query")?;
        let rows = stmt
            .query_map(params![State::Cached.as_i64(), limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .context("query oldest cached")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, size) = row.context("read oldest cached row")?;
            out.push((id, size.max(0) as u64));
        }
        Ok((out.len() == limit, out))
    }

    pub fn get_cached_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id FROM filesystem WHERE state = ?1")
            .context("prepare cached ids query")?;
        let rows = stmt
            .query_map(params![State::Cached.as_i64()], |row| row.get(0))
            .context("query cached ids")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("read cached id")?);
        }
        Ok(ids)
    }

    /// Upsert a batch of entries in a single transaction.
    pub fn replace_entries(&self, entries: &[Entry]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("begin transaction")?;
        {
            let mut stmt = tx
                .prepare(super::REPLACE_ENTRY_SQL)
                .context("prepare replace")?;
            for e in entries {
                stmt.execute(params![
                    e.id,
                    e.parent_id,
                    e.path,
                    e.name,
                    e.state.as_i64(),
                    e.last_access_ts,
                    e.duration,
                    e.stat.mode as i64,
                    e.stat.ino as i64,
                    e.stat.dev as i64,
                    e.stat.nlink as i64,
                    e.stat.uid as i64,
                    e.stat.gid as i64,
                    e.stat.size as i64,
                    e.stat.atime,
                    e.stat.ctime,
                    e.stat.mtime,
                ])
                .with_context(|| format!("replace entry '{}'", e.path))?;
            }
        }
        tx.commit().context("commit transaction")
    }

    pub fn remove_entry(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("begin transaction")?;
        tx.execute("DELETE FROM filesystem WHERE id = ?1", params![id])
            .with_context(|| format!("remove entry {id}"))?;
        tx.commit().context("commit transaction")
    }

    /// Largest assigned id, or 0 for an empty store.
    pub fn get_largest_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn
            .query_row("SELECT max(id) FROM filesystem", [], |row| row.get(0))
            .context("query largest id")?;
        Ok(max.unwrap_or(0).max(0))
    }

    /// Drop and recreate the table and all indexes.
    pub fn purge(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("DROP TABLE IF EXISTS filesystem")
            .context("drop filesystem table")?;
        conn.execute_batch("VACUUM").context("vacuum database")?;
        conn.execute_batch(super::SCHEMA)
            .context("recreate schema")?;
        Ok(())
    }
}
