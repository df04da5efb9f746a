//! Pooled SQLite sessions.
//!
//! The pool is constructed explicitly by [`crate::LayerDb`] and handed down;
//! there is no process-wide connection state.

use parking_lot::{Condvar, Mutex};
use rusqlite::config::DbConfig;
use rusqlite::{Connection, OpenFlags};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::DatabaseSettings;
use crate::error::{GeoLayerError, Result};
use crate::ogc_sql::initialize_store;
use crate::sql_functions::register_spatial_functions;

struct PoolState {
    idle: Vec<Connection>,
    closed: bool,
}

/// A fixed set of connections to one database.
pub struct SessionPool {
    state: Mutex<PoolState>,
    available: Condvar,
    size: usize,
    acquire_timeout: Duration,
}

impl SessionPool {
    /// Open every connection up front and initialize the catalog tables.
    pub fn open(settings: &DatabaseSettings) -> Result<Self> {
        let size = if settings.is_in_memory() {
            1
        } else {
            settings.pool_size.max(1)
        };

        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(open_connection(settings)?);
        }
        if let Some(conn) = idle.first() {
            initialize_store(conn)?;
        }
        debug!(path = %settings.path.display(), size, "opened session pool");

        Ok(Self {
            state: Mutex::new(PoolState {
                idle,
                closed: false,
            }),
            available: Condvar::new(),
            size,
            acquire_timeout: settings.acquire_timeout(),
        })
    }

    /// Wait for an idle connection.
    ///
    /// Fails with [`GeoLayerError::Unavailable`] once the acquire timeout
    /// passes or after the pool has been closed.
    pub fn acquire(&self) -> Result<Session<'_>> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(GeoLayerError::Unavailable {
                    waited: started.elapsed(),
                });
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(Session {
                    pool: self,
                    conn: Some(conn),
                });
            }
            if self.available.wait_until(&mut state, deadline).timed_out() && state.idle.is_empty()
            {
                return Err(GeoLayerError::Unavailable {
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Close idle connections and refuse further sessions. Sessions still
    /// checked out close their connection when dropped.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.idle.clear();
        self.available.notify_all();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Connections currently waiting in the pool.
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        if !state.closed {
            state.idle.push(conn);
            self.available.notify_one();
        }
    }
}

fn open_connection(settings: &DatabaseSettings) -> Result<Connection> {
    let conn = if settings.is_in_memory() {
        Connection::open_in_memory()?
    } else {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Connection::open_with_flags(&settings.path, flags)?
    };

    conn.busy_timeout(settings.busy_timeout())?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Double-quoted names must never fall back to string literals.
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DML, false)?;
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DDL, false)?;
    if !settings.is_in_memory() {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(%mode, "journal mode");
    }
    register_spatial_functions(&conn)?;
    Ok(conn)
}

/// A connection checked out of a [`SessionPool`]. Returned on drop.
pub struct Session<'p> {
    pool: &'p SessionPool,
    // Always `Some` until `drop` hands the connection back.
    conn: Option<Connection>,
}

impl Deref for Session<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("session connection is present until drop")
    }
}

impl DerefMut for Session<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("session connection is present until drop")
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
