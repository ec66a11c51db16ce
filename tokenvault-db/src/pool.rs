//! Bounded FIFO connection pool.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::warn;

use super::connection::Connection;
use super::error::{DbError, DbResult};

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// A bounded pool of backend connections.
///
/// Connections are created eagerly by the supplied factory and handed out in
/// FIFO order. [`acquire`](Pool::acquire) blocks until a connection frees or
/// the acquire timeout elapses.
pub struct Pool {
    idle: Mutex<VecDeque<Box<dyn Connection>>>,
    available: Condvar,
    acquire_timeout: Duration,
}

impl Pool {
    /// Creates a pool of `size` connections from `factory`.
    ///
    /// # Errors
    ///
    /// Returns the first factory error encountered.
    pub fn new<F>(size: usize, factory: F) -> DbResult<Self>
    where
        F: Fn() -> DbResult<Box<dyn Connection>>,
    {
        Self::with_timeout(size, DEFAULT_ACQUIRE_TIMEOUT, factory)
    }

    /// Creates a pool with an explicit acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns the first factory error encountered.
    pub fn with_timeout<F>(size: usize, acquire_timeout: Duration, factory: F) -> DbResult<Self>
    where
        F: Fn() -> DbResult<Box<dyn Connection>>,
    {
        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size {
            idle.push_back(factory()?);
        }
        Ok(Self {
            idle: Mutex::new(idle),
            available: Condvar::new(),
            acquire_timeout,
        })
    }

    /// Checks a connection out of the pool, blocking until one is free.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::PoolTimeout`] when no connection frees before the
    /// pool's acquire timeout.
    pub fn acquire(&self) -> DbResult<PooledConnection<'_>> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut idle = self.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        loop {
            if let Some(conn) = idle.pop_front() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                    committed: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DbError::PoolTimeout);
            }

            let (guard, result) = self
                .available
                .wait_timeout(idle, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            idle = guard;

            if result.timed_out() && idle.is_empty() {
                return Err(DbError::PoolTimeout);
            }
        }
    }

    fn release(&self, conn: Box<dyn Connection>) {
        let mut idle = self.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        idle.push_back(conn);
        drop(idle);
        self.available.notify_one();
    }
}

/// A checked-out connection that returns to its pool on drop.
///
/// A guard dropped without [`commit`](PooledConnection::commit) rolls back
/// whatever transaction the connection left open.
pub struct PooledConnection<'pool> {
    pool: &'pool Pool,
    conn: Option<Box<dyn Connection>>,
    committed: bool,
}

impl PooledConnection<'_> {
    fn conn_mut(&mut self) -> &mut dyn Connection {
        self.conn.as_mut().expect("connection present until drop").as_mut()
    }
}

impl Connection for PooledConnection<'_> {
    fn execute(&mut self, sql: &str, params: &[super::Value]) -> DbResult<usize> {
        self.committed = false;
        self.conn_mut().execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[super::Value]) -> DbResult<Vec<super::Row>> {
        self.conn_mut().query(sql, params)
    }

    /// Commits the open transaction and marks the guard clean.
    fn commit(&mut self) -> DbResult<()> {
        self.conn_mut().commit()?;
        self.committed = true;
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.committed = false;
        self.conn_mut().rollback()
    }

    fn test(&mut self) -> bool {
        self.conn_mut().test()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if !self.committed {
                if let Err(err) = conn.rollback() {
                    warn!("rollback on release failed: {err}");
                }
            }
            self.pool.release(conn);
        }
    }
}
