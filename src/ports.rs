//! Bounded pool of loopback UDP ports.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::Rng;

use crate::error::{Error, Result};

/// Thread-safe pool over a closed port interval.
///
/// A specific free port can be requested; otherwise a uniformly random
/// free port is handed out. Releasing a port the pool never handed out is
/// a no-op, so release is safe to call from failure paths.
#[derive(Debug)]
pub struct PortPool {
    inner: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    min: u16,
    max: u16,
    allocated: HashSet<u16>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> PortPool {
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        PortPool {
            inner: Mutex::new(PoolState {
                min,
                max,
                allocated: HashSet::new(),
            }),
        }
    }

    /// Number of ports in the interval.
    pub fn capacity(&self) -> usize {
        let state = self.inner.lock().unwrap();
        (state.max - state.min) as usize + 1
    }

    /// Number of ports currently handed out.
    pub fn allocated(&self) -> usize {
        self.inner.lock().unwrap().allocated.len()
    }

    /// Hands out `requested` when it is free and inside the interval;
    /// otherwise a uniformly random free port. Fails when every port of
    /// the interval is taken.
    pub fn acquire(&self, requested: Option<u16>) -> Result<u16> {
        let mut state = self.inner.lock().unwrap();
        let capacity = (state.max - state.min) as usize + 1;
        if state.allocated.len() >= capacity {
            return Err(Error::PortsExhausted);
        }

        if let Some(port) = requested {
            if port >= state.min && port <= state.max && !state.allocated.contains(&port) {
                state.allocated.insert(port);
                return Ok(port);
            }
        }

        let free: Vec<u16> = (state.min..=state.max)
            .filter(|p| !state.allocated.contains(p))
            .collect();
        let port = free[rand::thread_rng().gen_range(0..free.len())];
        state.allocated.insert(port);
        Ok(port)
    }

    /// Returns a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        self.inner.lock().unwrap().allocated.remove(&port);
    }
}
