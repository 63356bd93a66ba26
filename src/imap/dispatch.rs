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

//! Drives IMAP sessions over a worker pool.
//!
//! Each worker owns at most one session at a time. Tasks are sorted by
//! account and mailbox before being queued so that consecutive tasks on one
//! worker usually reuse its session and selected mailbox.

use std::sync::Arc;

use super::client::{Command, Connector, Response, Session, Status};
use crate::pipeline::details::error_details;
use crate::pipeline::task::{Account, ErrorKind, Failure, Level, Outcome, Task};
use crate::pipeline::Context;
use crate::support::log_prefix::LogPrefix;
use crate::support::occupancy::OccupancyLimiter;
use crate::support::threading::{Cancelled, Pool, Worker};

/// Client name sent with `ID`.
pub const CLIENT_NAME: &str = "mailgather";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-task logic run against a logged-in session with the task's mailbox
/// selected.
pub type Handler<'a, P, R> =
    dyn Fn(&mut Imap<'_>, &Task<P>) -> Result<R, Failure> + Sync + 'a;

/// A session as seen by a handler.
pub struct Imap<'a> {
    session: &'a mut dyn Session,
    occupancy: &'a OccupancyLimiter,
    log_prefix: &'a LogPrefix,
}

impl Imap<'_> {
    pub fn log_prefix(&self) -> &LogPrefix {
        self.log_prefix
    }

    /// Issue `command` while holding `size` bytes of occupancy.
    ///
    /// Transport failures are `CONNECTION_FAILED`. A `NO` or `BAD`
    /// completion is `REQUEST_ERROR` unless `min_data` is given and the
    /// server still sent at least that many untagged lines.
    pub fn request(
        &mut self,
        command: &Command<'_>,
        min_data: Option<usize>,
        size: u64,
    ) -> Result<Response, Failure> {
        let result = {
            let _occupancy = self.occupancy.acquire(size);
            self.session.command(command)
        };

        let response = result.map_err(|e| {
            log::warn!(
                "{} {} failed: {}",
                self.log_prefix,
                command.name(),
                e
            );
            Failure::new(ErrorKind::ConnectionFailed, Level::Error)
                .details(error_details(&e))
        })?;

        if Status::Ok != response.status
            && min_data.map_or(true, |min| response.data.len() < min)
        {
            log::warn!(
                "{} {} rejected: {}",
                self.log_prefix,
                command.name(),
                response.text
            );
            return Err(Failure::new(ErrorKind::RequestError, Level::Error)
                .detail("Command", command.name())
                .detail("Response", response.text.clone())
                .response(response.to_wire_string()));
        }

        Ok(response)
    }
}

struct SessionWorker<'a, P, R> {
    ctx: &'a Context,
    connector: &'a dyn Connector,
    handler: &'a Handler<'a, P, R>,
    log_prefix: LogPrefix,
    session: Option<Box<dyn Session>>,
    account: Option<Arc<Account>>,
    mailbox: Option<String>,
}

impl<'a, P, R> SessionWorker<'a, P, R> {
    fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            log::debug!("{} Logging out", self.log_prefix);
            // Best effort; the connection is discarded either way
            let _ = session.command(&Command::Logout);
        }
        self.forget();
    }

    fn forget(&mut self) {
        self.session = None;
        self.account = None;
        self.mailbox = None;
        self.log_prefix.set_account(None);
    }

    fn connect(&mut self, account: &Arc<Account>) -> Result<(), Failure> {
        self.logout();
        self.log_prefix.set_account(Some(account.address()));

        let session = self
            .connector
            .connect(account, &self.log_prefix, &self.ctx.cancel)
            .map_err(|e| {
                log::warn!("{} Connection failed: {}", self.log_prefix, e);
                Failure::new(ErrorKind::ConnectionFailed, Level::Error)
                    .details(error_details(&e))
            })?;
        let session = self.session.get_or_insert(session);

        let mut imap = Imap {
            session: session.as_mut(),
            occupancy: &self.ctx.occupancy,
            log_prefix: &self.log_prefix,
        };
        let username = account.address();
        imap.request(
            &Command::Login {
                username: &username,
                password: &account.password,
            },
            None,
            0,
        )?;
        imap.request(
            &Command::Id {
                name: CLIENT_NAME,
                version: CLIENT_VERSION,
            },
            None,
            0,
        )?;

        log::info!("{} Logged in", self.log_prefix);
        self.account = Some(Arc::clone(account));
        Ok(())
    }
}

impl<'a, P, R> Worker<P, R> for SessionWorker<'a, P, R> {
    fn process(&mut self, task: &Task<P>) -> Result<R, Failure> {
        if self.account.as_ref() != Some(&task.account) {
            self.connect(&task.account)?;
        }

        let session = match self.session {
            Some(ref mut session) => session.as_mut(),
            None => {
                return Err(Failure::new(ErrorKind::Unknown, Level::Error)
                    .detail("Error", "No session"))
            }
        };
        let mut imap = Imap {
            session,
            occupancy: &self.ctx.occupancy,
            log_prefix: &self.log_prefix,
        };

        if self.mailbox.as_deref() != Some(&task.mailbox as &str) {
            self.mailbox = None;
            imap.request(&Command::Select(&task.mailbox), None, 0)?;
            self.log_prefix.set_mailbox(Some(task.mailbox.clone()));
            self.mailbox = Some(task.mailbox.clone());
        }

        (self.handler)(&mut imap, task)
    }

    fn reset(&mut self) {
        // The session is suspect, so don't try to log out cleanly
        self.forget();
    }

    fn shutdown(&mut self) {
        self.logout();
    }
}

/// Run `handler` over every task in `seeds`, calling `emit` with each
/// terminal outcome.
pub fn dispatch<P: Send, R: Send>(
    ctx: &Context,
    connector: &dyn Connector,
    mut seeds: Vec<Task<P>>,
    handler: &Handler<'_, P, R>,
    emit: impl FnMut(Outcome<P, R>),
) -> Result<(), Cancelled> {
    seeds.sort_by(|a, b| {
        (&a.account, &a.mailbox).cmp(&(&b.account, &b.mailbox))
    });

    let pool = Pool {
        workers: ctx.config.max_imap_connection_count,
        max_retries: ctx.config.max_retries,
    };
    pool.run(
        seeds,
        &ctx.cancel,
        |ix| SessionWorker {
            ctx,
            connector,
            handler,
            log_prefix: LogPrefix::new(format!("imap#{}", ix)),
            session: None,
            account: None,
            mailbox: None,
        },
        emit,
    )
}

#[cfg(test)]
mod test {
    use std::collections::{HashMap, HashSet};

    use super::*;
    use crate::imap::fake::{FakeMessage, FakeServer};
    use crate::imap::handlers;
    use crate::support::config::SearchSettings;
    use crate::pipeline::{test_config, Context};
    use crate::support::cancel::CancelToken;

    fn context(mailboxes: &[&str], max_retries: u32) -> Context {
        crate::init_test_log();
        let mut config = test_config(mailboxes);
        config.max_retries = max_retries;
        config.max_imap_connection_count = 1;
        Context::new(config, CancelToken::new())
    }

    fn seeds(ctx: &Context) -> Vec<Task<()>> {
        ctx.config
            .mailboxes
            .iter()
            .map(|(a, m)| Task::new(Arc::clone(a), m.clone(), ()))
            .collect()
    }

    fn server(mailboxes: &[&str]) -> FakeServer {
        let server = FakeServer::new();
        for &mailbox in mailboxes {
            server.add_mailbox(
                "alice@example.com",
                mailbox,
                vec![FakeMessage::new("<a@x>", "(\"text\" \"plain\" NIL NIL \
                                       NIL \"7bit\" 1 1)")],
            );
        }
        server
    }

    fn echo(
        _imap: &mut Imap<'_>,
        task: &Task<()>,
    ) -> Result<String, Failure> {
        Ok(task.mailbox.clone())
    }

    #[test]
    fn session_is_reused_across_tasks() {
        let ctx = context(&["INBOX", "Archive", "INBOX"], 3);
        let server = server(&["INBOX", "Archive"]);

        let mut outcomes = Vec::new();
        dispatch(&ctx, &server, seeds(&ctx), &echo, |o| outcomes.push(o))
            .unwrap();

        assert_eq!(3, outcomes.len());
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(1, server.connections());

        let log = server.log();
        assert_eq!(
            1,
            log.iter().filter(|c| c.starts_with("LOGIN")).count()
        );
        // Sorted by mailbox, so INBOX is only selected once
        assert_eq!(
            vec!["SELECT Archive", "SELECT INBOX"],
            log.iter()
                .filter(|c| c.starts_with("SELECT"))
                .map(String::as_str)
                .collect::<Vec<_>>()
        );
        assert!(log.iter().any(|c| c.starts_with("ID (\"name\" \"mailgather\"")));
        assert_eq!(Some("LOGOUT"), log.last().map(String::as_str));
    }

    #[test]
    fn connection_failure_is_retried() {
        let ctx = context(&["INBOX"], 3);
        let server = server(&["INBOX"]);
        server.fail_connects(2);

        let mut outcomes = Vec::new();
        dispatch(&ctx, &server, seeds(&ctx), &echo, |o| outcomes.push(o))
            .unwrap();

        let found = outcomes.pop().unwrap().unwrap();
        assert_eq!(3, found.task.retries);
        assert_eq!("INBOX", found.value);
    }

    #[test]
    fn retries_are_bounded() {
        let ctx = context(&["INBOX"], 2);
        let server = server(&["INBOX"]);
        server.fail_connects(5);

        let mut outcomes = Vec::new();
        dispatch(&ctx, &server, seeds(&ctx), &echo, |o| outcomes.push(o))
            .unwrap();

        let error = outcomes.pop().unwrap().unwrap_err();
        assert_eq!(ErrorKind::ConnectionFailed, error.failure.kind);
        assert_eq!(2, error.task.retries);
        assert!(error.failure.details.iter().any(|(k, _)| k == "Error"));
    }

    #[test]
    fn select_failure_reconnects() {
        let ctx = context(&["INBOX"], 2);
        let server = server(&["INBOX"]);
        server.fail_selects("INBOX", 1);

        let mut outcomes = Vec::new();
        dispatch(&ctx, &server, seeds(&ctx), &echo, |o| outcomes.push(o))
            .unwrap();

        let found = outcomes.pop().unwrap().unwrap();
        assert_eq!(2, found.task.retries);
        assert_eq!(2, server.connections());
    }

    #[test]
    fn rejected_select_is_request_error() {
        let ctx = context(&["Nonexistent"], 3);
        let server = server(&["INBOX"]);

        let mut outcomes = Vec::new();
        dispatch(&ctx, &server, seeds(&ctx), &echo, |o| outcomes.push(o))
            .unwrap();

        let error = outcomes.pop().unwrap().unwrap_err();
        assert_eq!(ErrorKind::RequestError, error.failure.kind);
        assert_eq!(1, error.task.retries);
        assert!(error
            .failure
            .response
            .as_ref()
            .unwrap()
            .contains("NONEXISTENT"));
    }

    #[test]
    fn rejected_login_is_request_error() {
        let mut ctx = context(&["INBOX"], 3);
        let mut account = (*ctx.config.mailboxes[0].0).clone();
        account.password = "wrong".to_owned();
        ctx.config.mailboxes[0].0 = Arc::new(account);
        let server = server(&["INBOX"]);

        let mut outcomes = Vec::new();
        dispatch(&ctx, &server, seeds(&ctx), &echo, |o| outcomes.push(o))
            .unwrap();

        let error = outcomes.pop().unwrap().unwrap_err();
        assert_eq!(ErrorKind::RequestError, error.failure.kind);
        assert!(!server.log().iter().any(|c| c.starts_with("SELECT")));
    }

    #[test]
    fn handler_panic_is_unknown() {
        let ctx = context(&["INBOX", "Archive"], 3);
        let server = server(&["INBOX", "Archive"]);

        let mut outcomes = Vec::new();
        dispatch(
            &ctx,
            &server,
            seeds(&ctx),
            &|_: &mut Imap<'_>, task: &Task<()>| -> Result<(), Failure> {
                if "Archive" == task.mailbox {
                    panic!("handler exploded");
                }
                Ok(())
            },
            |o| outcomes.push(o),
        )
        .unwrap();

        assert_eq!(2, outcomes.len());
        let error = outcomes
            .iter()
            .find_map(|o| o.as_ref().err())
            .unwrap();
        assert_eq!(ErrorKind::Unknown, error.failure.kind);
        assert_eq!("Archive", error.task.mailbox);
        assert!(outcomes
            .iter()
            .any(|o| o.as_ref().map_or(false, |f| "INBOX" == f.task.mailbox)));
        // The session was discarded after the panic
        assert_eq!(2, server.connections());
    }

    #[test]
    fn concurrent_sessions_keep_their_own_state() {
        crate::init_test_log();
        let mut config = test_config(&[]);
        config.max_imap_connection_count = 3;
        let alice = Arc::clone(&config.accounts[0]);
        let bob = Arc::new(Account {
            username: "bob".to_owned(),
            ..(*alice).clone()
        });
        let ctx = Context::new(config, CancelToken::new());

        // Each mailbox holds a distinct number of messages, so the SEARCH
        // result identifies the account and mailbox the session was in.
        let server = FakeServer::new();
        let mut expected = HashMap::new();
        for (account, mailbox, count) in &[
            (&alice, "INBOX", 1),
            (&alice, "Archive", 2),
            (&bob, "INBOX", 3),
            (&bob, "Archive", 4),
        ] {
            let messages = (0..*count)
                .map(|n| {
                    FakeMessage::new(
                        &format!("<{}@x>", n),
                        "(\"text\" \"plain\" NIL NIL NIL \"7bit\" 1 1)",
                    )
                })
                .collect();
            server.add_mailbox(&account.address(), mailbox, messages);
            expected.insert((account.address(), mailbox.to_string()), *count);
        }

        let pairs = [
            (&alice, "INBOX"),
            (&bob, "Archive"),
            (&alice, "Archive"),
            (&bob, "INBOX"),
        ];
        let seeds = (0..24u32)
            .map(|ix| {
                let (account, mailbox) = pairs[ix as usize % pairs.len()];
                Task::new(Arc::clone(account), mailbox.to_owned(), ix)
            })
            .collect::<Vec<_>>();

        let mut outcomes = Vec::new();
        dispatch(
            &ctx,
            &server,
            seeds,
            &|imap: &mut Imap<'_>,
              _: &Task<u32>|
             -> Result<Vec<u32>, Failure> {
                handlers::search_messages(imap, &SearchSettings::default())
            },
            |o| outcomes.push(o),
        )
        .unwrap();

        assert_eq!(24, outcomes.len());
        let mut seen = HashSet::new();
        for outcome in outcomes {
            let found = outcome.unwrap();
            assert!(seen.insert(found.task.payload));
            let count = expected[&(
                found.task.account.address(),
                found.task.mailbox.clone(),
            )];
            assert_eq!(
                (1..=count).collect::<Vec<u32>>(),
                found.value,
                "task {} ran in the wrong session",
                found.task.payload
            );
        }
        assert_eq!(24, seen.len());
        assert!(server.connections() <= 3 * 2);
    }

    #[test]
    fn cancelled_before_start() {
        let ctx = context(&["INBOX"], 3);
        ctx.cancel.cancel();
        let server = server(&["INBOX"]);

        let mut outcomes = Vec::new();
        let result =
            dispatch(&ctx, &server, seeds(&ctx), &echo, |o| outcomes.push(o));
        assert_eq!(Err(Cancelled), result);
        assert!(outcomes.is_empty());
        assert_eq!(0, server.connections());
    }
}
