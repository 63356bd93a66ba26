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

//! The fixed-size worker pool driving both the IMAP and the crawler stages.
//!
//! The calling thread acts as the distributor. It keeps the tasks not yet
//! handed out in a backlog, feeding them into a bounded queue as the workers
//! drain it, and collects the workers' outcomes from a second bounded queue.
//! A task that failed in a retryable way and still has attempts left goes
//! back onto the backlog; every other outcome is terminal and is handed to
//! the caller. Once every seed has produced exactly one terminal outcome, the
//! task queue is closed and the pool is torn down.
//!
//! The distributor never blocks sending, so a worker blocked on a full
//! result queue can always make progress.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, TrySendError};

use super::cancel::CancelToken;
use crate::pipeline::task::{
    ErrorKind, Failure, Found, Level, Outcome, Task, TaskError,
};

/// How often the distributor checks for cancellation while waiting.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The capacity of the task and result queues, per worker.
const QUEUE_DEPTH: usize = 2;

/// The per-thread state of one pool member.
pub trait Worker<P, R> {
    /// Make one attempt at `task`.
    ///
    /// `task.retries` has already been incremented for this attempt.
    fn process(&mut self, task: &Task<P>) -> Result<R, Failure>;

    /// Discard any reusable state, such as an open session, after a failure
    /// which leaves it suspect.
    fn reset(&mut self) {}

    /// Called once before the worker thread exits.
    fn shutdown(&mut self) {}
}

#[derive(Clone, Copy, Debug)]
pub struct Pool {
    /// The number of worker threads.
    pub workers: usize,
    /// The number of attempts after which a retryable failure becomes
    /// terminal.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl Pool {
    /// Run every task in `seeds` to completion.
    ///
    /// Each worker thread constructs its own `Worker` by calling
    /// `make_worker` with its index. Tasks are started in the order given,
    /// with retries going to the back. `emit` is called on the calling
    /// thread exactly once per seed (unless cancelled), in no particular
    /// order.
    ///
    /// Once this call returns, all worker threads have exited.
    pub fn run<P, R, W>(
        self,
        seeds: Vec<Task<P>>,
        cancel: &CancelToken,
        make_worker: impl Fn(usize) -> W + Sync,
        mut emit: impl FnMut(Outcome<P, R>),
    ) -> Result<(), Cancelled>
    where
        P: Send,
        R: Send,
        W: Worker<P, R>,
    {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let expected = seeds.len();
        if 0 == expected {
            return Ok(());
        }

        let workers = self.workers.max(1);
        let (work_send, work_recv) =
            channel::bounded::<Task<P>>(workers * QUEUE_DEPTH);
        let (result_send, result_recv) =
            channel::bounded::<(Task<P>, Result<R, Failure>)>(
                workers * QUEUE_DEPTH,
            );
        let mut backlog = VecDeque::from(seeds);

        let result = crossbeam::scope(|s| {
            for ix in 0..workers {
                let work_recv = work_recv.clone();
                let result_send = result_send.clone();
                let make_worker = &make_worker;
                s.spawn(move |_| {
                    let mut worker = make_worker(ix);
                    for mut task in work_recv.iter() {
                        if cancel.is_cancelled() {
                            continue;
                        }

                        task.retries += 1;
                        let result = attempt(&mut worker, &task);
                        if let Err(ref failure) = result {
                            if failure.kind.is_retryable()
                                || ErrorKind::Unknown == failure.kind
                            {
                                worker.reset();
                            }
                        }

                        if result_send.send((task, result)).is_err() {
                            break;
                        }
                    }
                    worker.shutdown();
                });
            }
            // Only the workers may keep the queues open
            drop(work_recv);
            drop(result_send);

            let mut terminal = 0;
            let outcome = loop {
                if terminal == expected {
                    break Ok(());
                }

                if cancel.is_cancelled() {
                    break Err(Cancelled);
                }

                while let Some(task) = backlog.pop_front() {
                    match work_send.try_send(task) {
                        Ok(()) => (),
                        Err(TrySendError::Full(task))
                        | Err(TrySendError::Disconnected(task)) => {
                            backlog.push_front(task);
                            break;
                        }
                    }
                }

                let (task, result) =
                    match result_recv.recv_timeout(CANCEL_POLL_INTERVAL) {
                        Ok(r) => r,
                        Err(RecvTimeoutError::Timeout) => continue,
                        // All workers died, which only happens if they
                        // panicked outside of a task.
                        Err(RecvTimeoutError::Disconnected) => {
                            break Err(Cancelled)
                        }
                    };

                // Outcomes finishing after cancellation are not reported
                if cancel.is_cancelled() {
                    break Err(Cancelled);
                }

                match result {
                    Ok(value) => {
                        terminal += 1;
                        emit(Ok(Found { task, value }));
                    }
                    Err(failure)
                        if failure.kind.is_retryable()
                            && task.retries < self.max_retries =>
                    {
                        log::debug!(
                            "Retrying task for {} {} (attempt {}): {}",
                            task.account.address(),
                            task.mailbox,
                            task.retries,
                            failure.kind
                        );
                        backlog.push_back(task);
                    }
                    Err(failure) => {
                        terminal += 1;
                        emit(Err(TaskError { task, failure }));
                    }
                }
            };

            // Workers drain whatever is still queued (skipping it if
            // cancelled) and exit once the queue is closed and empty. Any
            // still holding a result find the result queue closed.
            drop(work_send);
            drop(result_recv);

            outcome
        });

        match result {
            Ok(outcome) => outcome,
            Err(e) => panic::resume_unwind(e),
        }
    }
}

fn attempt<P, R, W: Worker<P, R>>(
    worker: &mut W,
    task: &Task<P>,
) -> Result<R, Failure> {
    panic::catch_unwind(AssertUnwindSafe(|| worker.process(task)))
        .unwrap_or_else(|panic| {
            let message = panic_message(&panic);
            log::error!("Task handler panicked: {}", message);
            Err(Failure::new(ErrorKind::Unknown, Level::Error)
                .detail("Error", message))
        })
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_owned()
    }
}
