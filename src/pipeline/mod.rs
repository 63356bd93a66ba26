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

//! The attachment search pipeline.

pub mod details;
pub mod orchestrator;
pub mod task;

use crate::support::cancel::CancelToken;
use crate::support::config::Config;
use crate::support::occupancy::OccupancyLimiter;

/// State shared by every stage of one run.
pub struct Context {
    pub config: Config,
    pub occupancy: OccupancyLimiter,
    pub cancel: CancelToken,
}

impl Context {
    pub fn new(config: Config, cancel: CancelToken) -> Self {
        Context {
            occupancy: OccupancyLimiter::new(config.max_occupancy_size),
            config,
            cancel,
        }
    }
}

/// A configuration searching `mailboxes` of `alice@example.com`, with small
/// limits suitable for tests.
#[cfg(test)]
pub fn test_config(mailboxes: &[&str]) -> Config {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::support::config::SearchSettings;
    use task::Account;

    let account = Arc::new(Account {
        host: "imap.example.com".to_owned(),
        port: 993,
        username: "alice".to_owned(),
        domain: "example.com".to_owned(),
        password: "hunter2".to_owned(),
    });
    Config {
        accounts: vec![Arc::clone(&account)],
        mailboxes: mailboxes
            .iter()
            .map(|&m| (Arc::clone(&account), m.to_owned()))
            .collect(),
        search: SearchSettings::default(),
        timeout: Duration::from_secs(5),
        max_imap_connection_count: 2,
        max_crawler_connection_count: 2,
        max_retries: 3,
        max_occupancy_size: Some(1024 * 1024),
    }
}
