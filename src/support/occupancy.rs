//-
// Copyright (c) 2024, Mailgather contributors
//
// This file is part of Mailgather.
//
// Mailgather is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailgather is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailgather. If not, see <http://www.gnu.org/licenses/>.

//! Admission control bounding the total size of concurrent fetches.
//!
//! Every IMAP request reserves the number of bytes it expects to receive
//! before it is sent, and releases the reservation once the response has been
//! read. Requests whose reservation would push the total over the cap wait
//! until enough other requests finish.
//!
//! A reservation larger than the cap can never fit, so it is instead admitted
//! once nothing else is in flight. While it is in flight, everything else
//! waits. Consequently, at any moment either the total is within the cap or
//! exactly one reservation is active.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct OccupancyLimiter {
    max_size: Option<u64>,
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct State {
    total: u64,
    count: usize,
}

/// A reservation held against an `OccupancyLimiter`.
///
/// The reservation is released when this is dropped.
#[derive(Debug)]
pub struct Occupancy<'a> {
    limiter: &'a OccupancyLimiter,
    size: u64,
}

impl OccupancyLimiter {
    /// Create a limiter capping the total at `max_size` bytes, or which
    /// admits everything if `max_size` is `None`.
    pub fn new(max_size: Option<u64>) -> Self {
        OccupancyLimiter {
            max_size,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    /// Reserve `size` bytes, blocking until the reservation is admissible.
    pub fn acquire(&self, size: u64) -> Occupancy<'_> {
        let state = self.lock();
        let mut state = self
            .cond
            .wait_while(state, |state| !self.admits(state, size))
            .unwrap_or_else(PoisonError::into_inner);

        state.count += 1;
        state.total += size;

        Occupancy {
            limiter: self,
            size,
        }
    }

    fn admits(&self, state: &State, size: u64) -> bool {
        match self.max_size {
            None => true,
            Some(max) if size <= max => state.total + size <= max,
            Some(_) => 0 == state.count,
        }
    }

    fn release(&self, size: u64) {
        let mut state = self.lock();
        state.count -= 1;
        state.total -= size;
        drop(state);
        self.cond.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state is only modified by infallible arithmetic, so it is
        // consistent even if another holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn snapshot(&self) -> State {
        *self.lock()
    }
}

impl Drop for Occupancy<'_> {
    fn drop(&mut self) {
        self.limiter.release(self.size);
    }
}
