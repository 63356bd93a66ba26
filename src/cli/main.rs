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

use std::path::PathBuf;

use chrono::NaiveDate;
use log::LevelFilter;
use structopt::StructOpt;

use crate::support::config::{self, check_date_range, Config, MessageType};
use crate::support::logging;
use crate::support::sysexits::*;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    Search(SearchSubcommand),
    /// Validate a configuration file and list the mailboxes it selects.
    Check(CommonOptions),
}

impl Command {
    fn common(&self) -> &CommonOptions {
        match *self {
            Command::Search(ref c) => &c.common,
            Command::Check(ref c) => c,
        }
    }
}

#[derive(StructOpt)]
pub(super) struct CommonOptions {
    /// The configuration file.
    #[structopt(
        short,
        long,
        parse(from_os_str),
        default_value = "mailgather.toml"
    )]
    pub(super) config: PathBuf,

    /// Log at debug level.
    #[structopt(short, long)]
    pub(super) verbose: bool,

    /// A log4rs configuration file to use instead of logging to standard
    /// error. Overrides --verbose.
    #[structopt(long, parse(from_os_str))]
    pub(super) log_config: Option<PathBuf>,
}

/// Search the configured mailboxes for attachments.
///
/// Every message in every configured mailbox matching the search criteria is
/// examined. Ordinary attachments are listed. Links to large attachments
/// hosted by QQ, NetEase (163) or Sina Mail are followed and resolved to
/// direct downloads, which are fetched into --download-dir if given.
///
/// The search options below override the [search] section of the
/// configuration file.
///
/// Interrupting the search (e.g. with Ctrl+C) stops it cleanly.
#[derive(StructOpt)]
pub(super) struct SearchSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Only consider messages on or after this date (YYYY-MM-DD).
    #[structopt(long, parse(try_from_str = parse_date))]
    pub(super) since: Option<NaiveDate>,

    /// Only consider messages before this date (YYYY-MM-DD).
    #[structopt(long, parse(try_from_str = parse_date))]
    pub(super) before: Option<NaiveDate>,

    /// Which messages to consider: all, unseen, or seen.
    #[structopt(long)]
    pub(super) message_type: Option<MessageType>,

    /// Download resolved large attachments into this directory.
    #[structopt(long, parse(from_os_str))]
    pub(super) download_dir: Option<PathBuf>,
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| format!("'{}': {}", s, e))?;
    check_date_range("date", date).map_err(|e| e.to_string())?;
    Ok(date)
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let common = cmd.common();
    let level = if common.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = logging::init(common.log_config.as_deref(), level) {
        eprintln!("{}", e);
        Sysexit::from(&e).exit();
    }

    let config = match config::load(&common.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Error in config file '{}': {}",
                common.config.display(),
                e
            );
            Sysexit::from(&e).exit()
        }
    };

    match cmd {
        Command::Search(cmd) => super::search::search(config, cmd),
        Command::Check(_) => check(&config),
    }
}

fn check(config: &Config) {
    for (account, mailbox) in &config.mailboxes {
        println!(
            "{} ({}:{}) {}",
            account.address(),
            account.host,
            account.port,
            mailbox
        );
    }

    let search = &config.search;
    println!(
        "Searching {} messages{}{}",
        search.message_type.search_key().to_lowercase(),
        search
            .since
            .map(|d| format!(" since {}", d))
            .unwrap_or_default(),
        search
            .before
            .map(|d| format!(" before {}", d))
            .unwrap_or_default()
    );
}
