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

//! Sequencing of the four search phases.
//!
//! Each phase runs to completion before the next starts, and its seeds are
//! derived from everything the previous phases found. All accumulated state
//! lives in `Search` and is only modified from the calling thread, as each
//! outcome arrives from a dispatcher.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::task::{
    Account, Attachments, ErrorKind, Failure, HtmlPartTarget, Level,
    LinkTarget, Outcome, Task,
};
use super::Context;
use crate::crawler::{self, HttpClient};
use crate::imap::client::Connector;
use crate::imap::dispatch::dispatch;
use crate::imap::handlers;
use crate::support::threading::Cancelled;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    SearchingMessages,
    SearchingNormalAttachments,
    SearchingUrls,
    SearchingLargeAttachments,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Phase::SearchingMessages => "Searching messages",
            Phase::SearchingNormalAttachments => "Searching attachments",
            Phase::SearchingUrls => "Searching links",
            Phase::SearchingLargeAttachments => "Resolving large attachments",
            Phase::Done => "Done",
        })
    }
}

/// Running totals, updated as each outcome arrives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub mailboxes: usize,
    pub analysed_mailboxes: usize,
    pub messages: usize,
    pub analysed_messages: usize,
    pub normal_attachments: usize,
    pub html_parts: usize,
    pub analysed_html_parts: usize,
    pub urls: usize,
    pub analysed_urls: usize,
    pub large_attachments: usize,
    pub issues: usize,
}

impl Counters {
    /// Overall completion as a percentage, weighting the phases 10, 30, 30
    /// and 30.
    pub fn progress(&self, phase: Phase) -> f64 {
        fn fraction(done: usize, total: usize) -> f64 {
            if 0 == total {
                1.0
            } else {
                done as f64 / total as f64
            }
        }

        match phase {
            Phase::SearchingMessages => {
                10.0 * fraction(self.analysed_mailboxes, self.mailboxes)
            }
            Phase::SearchingNormalAttachments => {
                10.0 + 30.0 * fraction(self.analysed_messages, self.messages)
            }
            Phase::SearchingUrls => {
                40.0 + 30.0
                    * fraction(self.analysed_html_parts, self.html_parts)
            }
            Phase::SearchingLargeAttachments => {
                70.0 + 30.0 * fraction(self.analysed_urls, self.urls)
            }
            Phase::Done => 100.0,
        }
    }
}

/// Identifies a message within one run.
///
/// Sequence numbers are only stable while the mailbox is unchanged, which is
/// why later phases re-check the Message-ID.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageKey {
    pub account: Arc<Account>,
    pub mailbox: String,
    pub msg_num: u32,
}

/// The task an event concerns.
#[derive(Clone, Debug)]
pub struct Origin {
    pub phase: Phase,
    pub account: Arc<Account>,
    pub mailbox: String,
    /// Absent for the mailbox searches of the first phase.
    pub msg_num: Option<u32>,
    /// Attempts made, including the final one.
    pub retries: u32,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.account.address(), self.mailbox)?;
        if let Some(msg_num) = self.msg_num {
            write!(f, " #{}", msg_num)?;
        }
        Ok(())
    }
}

/// Receives progress from a `Search`.
///
/// Every method is called on the thread running the search, with `counters`
/// already reflecting the event.
pub trait Observer {
    fn phase_started(&mut self, _phase: Phase, _counters: &Counters) {}

    fn succeeded(&mut self, _origin: &Origin, _counters: &Counters) {}

    /// A task failed terminally. `IGNORE` failures are not reported.
    fn issue(
        &mut self,
        _origin: &Origin,
        _failure: &Failure,
        _counters: &Counters,
    ) {
    }
}

impl Observer for () {}

/// Everything found by a completed search.
#[derive(Debug)]
pub struct Summary {
    pub counters: Counters,
    /// Every distinct message which could be analysed, in key order.
    pub messages: Vec<(MessageKey, Attachments)>,
}

pub struct Search<'a> {
    ctx: &'a Context,
    imap: &'a dyn Connector,
    http: &'a dyn HttpClient,
    counters: Counters,
    /// `None` until the message has been analysed, or if it never could be
    /// or turned out to be a duplicate.
    messages: BTreeMap<MessageKey, Option<Attachments>>,
    message_ids: HashSet<String>,
}

impl<'a> Search<'a> {
    pub fn new(
        ctx: &'a Context,
        imap: &'a dyn Connector,
        http: &'a dyn HttpClient,
    ) -> Self {
        Search {
            ctx,
            imap,
            http,
            counters: Counters::default(),
            messages: BTreeMap::new(),
            message_ids: HashSet::new(),
        }
    }

    /// Run all four phases in order.
    pub fn run(
        mut self,
        observer: &mut dyn Observer,
    ) -> Result<Summary, Cancelled> {
        self.search_messages(observer)?;
        self.search_normal_attachments(observer)?;
        self.search_urls(observer)?;
        self.search_large_attachments(observer)?;
        observer.phase_started(Phase::Done, &self.counters);

        Ok(Summary {
            counters: self.counters,
            messages: self
                .messages
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect(),
        })
    }

    fn search_messages(
        &mut self,
        observer: &mut dyn Observer,
    ) -> Result<(), Cancelled> {
        let (ctx, connector) = (self.ctx, self.imap);
        let seeds = ctx
            .config
            .mailboxes
            .iter()
            .map(|(account, mailbox)| {
                Task::new(Arc::clone(account), mailbox.clone(), ())
            })
            .collect::<Vec<_>>();
        self.counters.mailboxes = seeds.len();
        observer.phase_started(Phase::SearchingMessages, &self.counters);

        let search = ctx.config.search;
        dispatch(
            ctx,
            connector,
            seeds,
            &|imap, _| handlers::search_messages(imap, &search),
            |outcome| {
                self.counters.analysed_mailboxes += 1;
                match outcome {
                    Ok(found) => {
                        self.counters.messages += found.value.len();
                        for &msg_num in &found.value {
                            self.messages.insert(
                                MessageKey {
                                    account: Arc::clone(&found.task.account),
                                    mailbox: found.task.mailbox.clone(),
                                    msg_num,
                                },
                                None,
                            );
                        }
                        let origin = origin(
                            Phase::SearchingMessages,
                            &found.task,
                            None,
                        );
                        observer.succeeded(&origin, &self.counters);
                    }
                    Err(e) => {
                        let origin =
                            origin(Phase::SearchingMessages, &e.task, None);
                        self.fail(&origin, e.failure, observer);
                    }
                }
            },
        )
    }

    fn search_normal_attachments(
        &mut self,
        observer: &mut dyn Observer,
    ) -> Result<(), Cancelled> {
        let (ctx, connector) = (self.ctx, self.imap);
        let seeds = self
            .messages
            .keys()
            .map(|k| {
                Task::new(Arc::clone(&k.account), k.mailbox.clone(), k.msg_num)
            })
            .collect::<Vec<_>>();
        observer
            .phase_started(Phase::SearchingNormalAttachments, &self.counters);

        dispatch(
            ctx,
            connector,
            seeds,
            &handlers::search_normal_attachments,
            |outcome| {
                self.counters.analysed_messages += 1;
                match outcome {
                    Ok(found) => {
                        let origin = origin(
                            Phase::SearchingNormalAttachments,
                            &found.task,
                            Some(found.task.payload),
                        );
                        let attachments = found.value;
                        // Presence was checked by the handler
                        let message_id = attachments
                            .envelope
                            .message_id
                            .clone()
                            .unwrap_or_default();
                        if self.message_ids.insert(message_id) {
                            self.counters.normal_attachments +=
                                attachments.normal_attachments.len();
                            self.counters.html_parts +=
                                attachments.html_parts.len();
                            self.messages.insert(
                                key(&found.task, found.task.payload),
                                Some(attachments),
                            );
                        } else {
                            log::debug!("{} Duplicate message", origin);
                        }
                        observer.succeeded(&origin, &self.counters);
                    }
                    Err(e) => {
                        let origin = origin(
                            Phase::SearchingNormalAttachments,
                            &e.task,
                            Some(e.task.payload),
                        );
                        self.fail(&origin, e.failure, observer);
                    }
                }
            },
        )
    }

    fn search_urls(
        &mut self,
        observer: &mut dyn Observer,
    ) -> Result<(), Cancelled> {
        let (ctx, connector) = (self.ctx, self.imap);
        let mut seeds = Vec::new();
        for (k, attachments) in &self.messages {
            let attachments = match *attachments {
                Some(ref a) => a,
                None => continue,
            };

            for part in &attachments.html_parts {
                seeds.push(Task::new(
                    Arc::clone(&k.account),
                    k.mailbox.clone(),
                    HtmlPartTarget {
                        msg_num: k.msg_num,
                        envelope: Arc::clone(&attachments.envelope),
                        html_part: part.clone(),
                    },
                ));
            }
        }
        observer.phase_started(Phase::SearchingUrls, &self.counters);

        dispatch(ctx, connector, seeds, &handlers::search_urls, |outcome| {
            self.counters.analysed_html_parts += 1;
            match outcome {
                Ok(found) => {
                    let msg_num = found.task.payload.msg_num;
                    let origin = origin(
                        Phase::SearchingUrls,
                        &found.task,
                        Some(msg_num),
                    );
                    if let Some(attachments) =
                        self.attachments(&key(&found.task, msg_num))
                    {
                        // Count links found by several parts only once
                        let before = attachments.urls.len();
                        attachments.urls.extend(found.value);
                        let added = attachments.urls.len() - before;
                        self.counters.urls += added;
                    }
                    observer.succeeded(&origin, &self.counters);
                }
                Err(e) => {
                    let msg_num = e.task.payload.msg_num;
                    let origin =
                        origin(Phase::SearchingUrls, &e.task, Some(msg_num));
                    self.fail(&origin, e.failure, observer);
                }
            }
        })
    }

    fn search_large_attachments(
        &mut self,
        observer: &mut dyn Observer,
    ) -> Result<(), Cancelled> {
        let (ctx, http) = (self.ctx, self.http);
        let mut seeds = Vec::new();
        for (k, attachments) in &self.messages {
            let attachments = match *attachments {
                Some(ref a) if !a.error_occurred => a,
                _ => continue,
            };

            for url in &attachments.urls {
                seeds.push(Task::new(
                    Arc::clone(&k.account),
                    k.mailbox.clone(),
                    LinkTarget {
                        msg_num: k.msg_num,
                        envelope: Arc::clone(&attachments.envelope),
                        url: url.clone(),
                    },
                ));
            }
        }
        observer
            .phase_started(Phase::SearchingLargeAttachments, &self.counters);

        crawler::search_large_attachments(ctx, http, seeds, |outcome| {
            self.record_large_attachment(outcome, observer)
        })
    }

    fn record_large_attachment(
        &mut self,
        outcome: Outcome<LinkTarget, (crawler::Method, String)>,
        observer: &mut dyn Observer,
    ) {
        self.counters.analysed_urls += 1;
        match outcome {
            Ok(found) => {
                let msg_num = found.task.payload.msg_num;
                let origin = origin(
                    Phase::SearchingLargeAttachments,
                    &found.task,
                    Some(msg_num),
                );
                if let Some(attachments) =
                    self.attachments(&key(&found.task, msg_num))
                {
                    attachments.large_attachments.push(found.value);
                    self.counters.large_attachments += 1;
                }
                observer.succeeded(&origin, &self.counters);
            }
            Err(e) => {
                let msg_num = e.task.payload.msg_num;
                let origin = origin(
                    Phase::SearchingLargeAttachments,
                    &e.task,
                    Some(msg_num),
                );
                self.fail(&origin, e.failure, observer);
            }
        }
    }

    fn attachments(&mut self, key: &MessageKey) -> Option<&mut Attachments> {
        self.messages.get_mut(key).and_then(Option::as_mut)
    }

    fn fail(
        &mut self,
        origin: &Origin,
        failure: Failure,
        observer: &mut dyn Observer,
    ) {
        if ErrorKind::Ignore == failure.kind {
            return;
        }

        self.counters.issues += 1;
        log::log!(
            match failure.level {
                Level::Error => log::Level::Warn,
                Level::Warning | Level::Info => log::Level::Info,
            },
            "{} {}: {} after {} attempt(s)",
            origin.phase,
            origin,
            failure.kind,
            origin.retries
        );

        let in_link_phase = Phase::SearchingUrls == origin.phase
            || Phase::SearchingLargeAttachments == origin.phase;
        if in_link_phase && Level::Error == failure.level {
            if let Some(msg_num) = origin.msg_num {
                let key = MessageKey {
                    account: Arc::clone(&origin.account),
                    mailbox: origin.mailbox.clone(),
                    msg_num,
                };
                if let Some(attachments) = self.attachments(&key) {
                    attachments.error_occurred = true;
                }
            }
        }

        observer.issue(origin, &failure, &self.counters);
    }
}

fn origin<P>(phase: Phase, task: &Task<P>, msg_num: Option<u32>) -> Origin {
    Origin {
        phase,
        account: Arc::clone(&task.account),
        mailbox: task.mailbox.clone(),
        msg_num,
        retries: task.retries,
    }
}

fn key<P>(task: &Task<P>, msg_num: u32) -> MessageKey {
    MessageKey {
        account: Arc::clone(&task.account),
        mailbox: task.mailbox.clone(),
        msg_num,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crawler::fake::FakeHttp;
    use crate::crawler::Method;
    use crate::imap::fake::{FakeMessage, FakeServer};
    use crate::pipeline::test_config;
    use crate::support::cancel::CancelToken;

    const LOGIN: &str = "alice@example.com";

    const PLAIN: &str = "(\"text\" \"plain\" (\"charset\" \"us-ascii\") \
                         NIL NIL \"7bit\" 10 1 NIL NIL NIL NIL)";

    const WITH_PDF: &str = "((\"text\" \"plain\" NIL NIL NIL \"7bit\" 10 1) \
        (\"application\" \"pdf\" NIL NIL NIL \"base64\" 4000 NIL \
         (\"attachment\" (\"filename\" \"a.pdf\")) NIL NIL) \
        \"mixed\" (\"boundary\" \"b\") NIL NIL NIL)";

    const HTML: &str = "(\"text\" \"html\" (\"charset\" \"utf-8\") \
                        NIL NIL \"7bit\" 200 3 NIL NIL NIL NIL)";

    const TWO_HTML: &str = "(\
        (\"text\" \"html\" NIL NIL NIL \"7bit\" 200 3) \
        (\"text\" \"html\" NIL NIL NIL \"x-unknown\" 200 3) \
        \"mixed\" (\"boundary\" \"b\") NIL NIL NIL)";

    const QQ_LINK: &str = "https://mail.qq.com/cgi-bin/ftnExs_download?k=1";
    const QQ_DOWNLOAD: &str = "https://njc-download.ftn.qq.com/f/a.zip";

    fn qq_body() -> Vec<u8> {
        format!(
            "<html><body><a href=\"{}\">a.zip</a> \
             <a href=\"https://example.com/\">home</a></body></html>",
            QQ_LINK
        )
        .into_bytes()
    }

    #[derive(Default)]
    struct Recorder {
        phases: Vec<Phase>,
        succeeded: Vec<Origin>,
        issues: Vec<(Origin, Failure)>,
        progress: Vec<f64>,
    }

    impl Observer for Recorder {
        fn phase_started(&mut self, phase: Phase, counters: &Counters) {
            self.phases.push(phase);
            self.progress.push(counters.progress(phase));
        }

        fn succeeded(&mut self, origin: &Origin, counters: &Counters) {
            self.succeeded.push(origin.clone());
            self.progress.push(counters.progress(origin.phase));
        }

        fn issue(
            &mut self,
            origin: &Origin,
            failure: &Failure,
            counters: &Counters,
        ) {
            self.issues.push((origin.clone(), failure.clone()));
            self.progress.push(counters.progress(origin.phase));
        }
    }

    fn run(
        server: &FakeServer,
        http: &FakeHttp,
        mailboxes: &[&str],
        max_retries: u32,
    ) -> (Result<Summary, Cancelled>, Recorder) {
        crate::init_test_log();
        let mut config = test_config(mailboxes);
        config.max_retries = max_retries;
        let ctx = Context::new(config, CancelToken::new());

        let mut recorder = Recorder::default();
        let result = Search::new(&ctx, server, http).run(&mut recorder);
        (result, recorder)
    }

    #[test]
    fn counts_messages_and_attachments() {
        let server = FakeServer::new();
        server.add_mailbox(
            LOGIN,
            "INBOX",
            vec![
                FakeMessage::new("<1@x>", WITH_PDF),
                FakeMessage::new("<2@x>", PLAIN),
            ],
        );
        server.add_mailbox(
            LOGIN,
            "Archive",
            vec![FakeMessage::new("<3@x>", PLAIN)],
        );
        let http = FakeHttp::new();

        let (result, recorder) = run(&server, &http, &["INBOX", "Archive"], 3);
        let summary = result.unwrap();

        assert_eq!(
            Counters {
                mailboxes: 2,
                analysed_mailboxes: 2,
                messages: 3,
                analysed_messages: 3,
                normal_attachments: 1,
                ..Counters::default()
            },
            summary.counters
        );
        assert_eq!(3, summary.messages.len());
        let with_pdf = summary
            .messages
            .iter()
            .find(|(k, _)| "INBOX" == k.mailbox && 1 == k.msg_num)
            .unwrap();
        assert_eq!(
            Some("a.pdf"),
            with_pdf.1.normal_attachments[0].filename()
        );

        assert_eq!(
            vec![
                Phase::SearchingMessages,
                Phase::SearchingNormalAttachments,
                Phase::SearchingUrls,
                Phase::SearchingLargeAttachments,
                Phase::Done,
            ],
            recorder.phases
        );
        assert!(recorder.issues.is_empty());
        assert_eq!(Some(&100.0), recorder.progress.last());
        assert!(recorder.progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(http.log().is_empty());
    }

    #[test]
    fn duplicate_messages_count_once() {
        let server = FakeServer::new();
        server.add_mailbox(
            LOGIN,
            "INBOX",
            vec![FakeMessage::new("<1@x>", WITH_PDF)],
        );
        server.add_mailbox(
            LOGIN,
            "Archive",
            vec![FakeMessage::new("<1@x>", WITH_PDF)],
        );

        let (result, recorder) =
            run(&server, &FakeHttp::new(), &["INBOX", "Archive"], 3);
        let summary = result.unwrap();
        assert_eq!(2, summary.counters.messages);
        assert_eq!(2, summary.counters.analysed_messages);
        assert_eq!(1, summary.counters.normal_attachments);
        assert_eq!(1, summary.messages.len());
        assert_eq!(0, summary.counters.issues);
        assert!(recorder.issues.is_empty());
    }

    #[test]
    fn resolves_large_attachments() {
        let server = FakeServer::new();
        server.add_mailbox(
            LOGIN,
            "INBOX",
            vec![FakeMessage::new("<1@x>", HTML).with_section("1", &qq_body())],
        );
        let http = FakeHttp::new();
        http.route(
            Method::Get,
            QQ_LINK,
            200,
            &format!("<a href=\"{}\">Download</a>", QQ_DOWNLOAD),
        );

        let (result, recorder) = run(&server, &http, &["INBOX"], 3);
        let summary = result.unwrap();
        assert_eq!(1, summary.counters.html_parts);
        assert_eq!(1, summary.counters.analysed_html_parts);
        assert_eq!(1, summary.counters.urls);
        assert_eq!(1, summary.counters.analysed_urls);
        assert_eq!(1, summary.counters.large_attachments);
        assert!(recorder.issues.is_empty());

        let attachments = &summary.messages[0].1;
        assert_eq!(
            vec![QQ_LINK],
            attachments.urls.iter().map(String::as_str).collect::<Vec<_>>()
        );
        assert_eq!(
            vec![(Method::Get, QQ_DOWNLOAD.to_owned())],
            attachments.large_attachments
        );
    }

    #[test]
    fn link_phase_error_skips_message() {
        let server = FakeServer::new();
        server.add_mailbox(
            LOGIN,
            "INBOX",
            vec![FakeMessage::new("<1@x>", TWO_HTML)
                .with_section("1", &qq_body())
                .with_section("2", b"??")],
        );
        let http = FakeHttp::new();

        let (result, recorder) = run(&server, &http, &["INBOX"], 3);
        let summary = result.unwrap();
        assert_eq!(2, summary.counters.html_parts);
        assert_eq!(2, summary.counters.analysed_html_parts);
        assert_eq!(1, summary.counters.urls);
        assert_eq!(0, summary.counters.analysed_urls);
        assert_eq!(1, summary.counters.issues);
        assert!(summary.messages[0].1.error_occurred);

        assert_eq!(1, recorder.issues.len());
        let (ref origin, ref failure) = recorder.issues[0];
        assert_eq!(Phase::SearchingUrls, origin.phase);
        assert_eq!(Some(1), origin.msg_num);
        assert_eq!(ErrorKind::DecodeError, failure.kind);
        assert!(http.log().is_empty());
    }

    #[test]
    fn select_timeout_is_retried() {
        let server = FakeServer::new();
        server.add_mailbox(
            LOGIN,
            "INBOX",
            vec![FakeMessage::new("<1@x>", PLAIN)],
        );
        server.fail_selects("INBOX", 1);

        let (result, recorder) = run(&server, &FakeHttp::new(), &["INBOX"], 2);
        assert_eq!(0, result.unwrap().counters.issues);

        let search = recorder
            .succeeded
            .iter()
            .find(|o| Phase::SearchingMessages == o.phase)
            .unwrap();
        assert_eq!(2, search.retries);
    }

    #[test]
    fn expired_qq_link_is_informational() {
        let server = FakeServer::new();
        server.add_mailbox(
            LOGIN,
            "INBOX",
            vec![FakeMessage::new("<1@x>", HTML).with_section("1", &qq_body())],
        );
        let http = FakeHttp::new();
        http.route(
            Method::Get,
            QQ_LINK,
            200,
            "<a href=\"https://mail.qq.com/\">The file has expired</a>",
        );

        let (result, recorder) = run(&server, &http, &["INBOX"], 3);
        let summary = result.unwrap();
        assert_eq!(1, summary.counters.issues);
        assert_eq!(0, summary.counters.large_attachments);
        assert!(!summary.messages[0].1.error_occurred);

        let (ref origin, ref failure) = recorder.issues[0];
        assert_eq!(Phase::SearchingLargeAttachments, origin.phase);
        assert_eq!(ErrorKind::LinkSearchingError, failure.kind);
        assert_eq!(Level::Info, failure.level);
        assert_eq!(1, origin.retries);
        assert_eq!(1, http.log().len());
    }

    #[test]
    fn cancelled_search_stops() {
        crate::init_test_log();
        let server = FakeServer::new();
        server.add_mailbox(
            LOGIN,
            "INBOX",
            vec![FakeMessage::new("<1@x>", PLAIN)],
        );
        let http = FakeHttp::new();
        let ctx = Context::new(test_config(&["INBOX"]), CancelToken::new());
        ctx.cancel.cancel();

        let mut recorder = Recorder::default();
        let result = Search::new(&ctx, &server, &http).run(&mut recorder);
        assert_eq!(Cancelled, result.unwrap_err());
        assert_eq!(0, server.connections());
        assert_eq!(vec![Phase::SearchingMessages], recorder.phases);
    }

    #[test]
    fn progress_is_weighted() {
        let counters = Counters {
            mailboxes: 4,
            analysed_mailboxes: 2,
            messages: 10,
            analysed_messages: 5,
            html_parts: 0,
            urls: 4,
            analysed_urls: 1,
            ..Counters::default()
        };
        assert_eq!(5.0, counters.progress(Phase::SearchingMessages));
        assert_eq!(25.0, counters.progress(Phase::SearchingNormalAttachments));
        assert_eq!(70.0, counters.progress(Phase::SearchingUrls));
        assert_eq!(77.5, counters.progress(Phase::SearchingLargeAttachments));
        assert_eq!(100.0, counters.progress(Phase::Done));
    }
}
