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

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use super::main::SearchSubcommand;
use crate::crawler::ReqwestClient;
use crate::imap::client::TlsConnector;
use crate::pipeline::orchestrator::{
    Counters, Observer, Origin, Phase, Search, Summary,
};
use crate::pipeline::task::Failure;
use crate::pipeline::Context;
use crate::support::cancel::CancelToken;
use crate::support::config::Config;
use crate::support::sysexits::*;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Cancel `cancel` when the process receives SIGINT.
///
/// The signal handler only sets a flag; a watcher thread turns that into a
/// cancellation, since cancelling takes locks.
fn cancel_on_interrupt(cancel: &CancelToken) -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGINT, &action)?;
    }

    let cancel = cancel.clone();
    thread::spawn(move || {
        while !INTERRUPTED.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
        }
        eprintln!("Interrupted; stopping");
        cancel.cancel();
    });
    Ok(())
}

pub(super) fn search(mut config: Config, cmd: SearchSubcommand) {
    if cmd.since.is_some() {
        config.search.since = cmd.since;
    }
    if cmd.before.is_some() {
        config.search.before = cmd.before;
    }
    if let Some(message_type) = cmd.message_type {
        config.search.message_type = message_type;
    }

    let cancel = CancelToken::new();
    if let Err(e) = cancel_on_interrupt(&cancel) {
        log::warn!("Unable to handle SIGINT: {}", e);
    }

    let http = match ReqwestClient::new(config.timeout) {
        Ok(http) => http,
        Err(e) => {
            eprintln!("Unable to set up HTTP client: {}", e);
            EX_SOFTWARE.exit()
        }
    };
    let connector = TlsConnector {
        timeout: config.timeout,
    };
    let ctx = Context::new(config, cancel);

    let mut printer = Printer::default();
    let summary = match Search::new(&ctx, &connector, &http).run(&mut printer)
    {
        Ok(summary) => summary,
        Err(_) => {
            eprintln!("Search cancelled");
            EX_TEMPFAIL.exit()
        }
    };

    print_summary(&summary);

    if let Some(ref dir) = cmd.download_dir {
        if let Err(e) =
            super::download::download_all(&http, &ctx.cancel, dir, &summary)
        {
            eprintln!("Download failed: {}", e);
            Sysexit::from(&e).exit();
        }
    }
}

/// Reports progress on standard output.
#[derive(Default)]
struct Printer {
    last_percent: Option<u32>,
}

impl Printer {
    fn progress(&mut self, phase: Phase, counters: &Counters) {
        let percent = counters.progress(phase) as u32;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            println!(
                "[{:3}%] {} messages, {} attachments, {} large attachments, \
                 {} issues",
                percent,
                counters.messages,
                counters.normal_attachments,
                counters.large_attachments,
                counters.issues
            );
        }
    }
}

impl Observer for Printer {
    fn phase_started(&mut self, phase: Phase, counters: &Counters) {
        println!("{}", phase);
        self.progress(phase, counters);
    }

    fn succeeded(&mut self, origin: &Origin, counters: &Counters) {
        self.progress(origin.phase, counters);
    }

    fn issue(
        &mut self,
        origin: &Origin,
        failure: &Failure,
        counters: &Counters,
    ) {
        println!(
            "{} [{}] {}: {}",
            failure.level, origin.phase, origin, failure.kind
        );
        for (key, value) in &failure.details {
            match *value {
                Some(ref value) => println!("    {}: {}", key, value),
                None => println!("    {}", key),
            }
        }
        self.progress(origin.phase, counters);
    }
}

fn print_summary(summary: &Summary) {
    let counters = &summary.counters;
    println!(
        "\nFound {} messages in {} mailboxes, with {} attachments and {} \
         large attachments; {} issues",
        counters.messages,
        counters.mailboxes,
        counters.normal_attachments,
        counters.large_attachments,
        counters.issues
    );

    for (key, attachments) in &summary.messages {
        if attachments.normal_attachments.is_empty()
            && attachments.large_attachments.is_empty()
        {
            continue;
        }

        println!(
            "\n{} {} #{}: {}",
            key.account.address(),
            key.mailbox,
            key.msg_num,
            attachments
                .envelope
                .subject
                .as_deref()
                .map(crate::mime::encoded_word::decode_header)
                .unwrap_or_default()
        );
        for part in &attachments.normal_attachments {
            println!(
                "    [{}] {}",
                part.section,
                part.filename()
                    .map(crate::mime::encoded_word::decode_header)
                    .unwrap_or_default()
            );
        }
        for (method, url) in &attachments.large_attachments {
            println!("    {} {}", method, url);
        }
    }
}
