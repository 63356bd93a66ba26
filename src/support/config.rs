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

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::Error;
use crate::pipeline::task::Account;

/// The configuration file, as written by the user.
///
/// This is a TOML file, normally named `mailgather.toml`. It is converted
/// into a `Config` by `resolve()`, which is also where all validation
/// happens.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RawConfig {
    /// The accounts to search and which mailboxes to search in each.
    pub mail: MailConfig,

    /// Criteria restricting which messages are considered.
    #[serde(default)]
    pub search: SearchConfig,

    /// Network behaviour.
    ///
    /// The defaults are reasonable for most providers.
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MailConfig {
    pub accounts: Vec<AccountConfig>,
    /// One list of mailbox names per entry in `accounts`, in the same order.
    pub mailboxes: Vec<Vec<String>>,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// The IMAP server to connect to. TLS is always used.
    pub host: String,
    #[serde(default = "default_imaps_port")]
    pub port: u16,
    /// The full email address, which is also the login name.
    pub address: String,
    /// The password or, for most Chinese providers, the client
    /// authorisation code.
    pub password: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("address", &self.address)
            .finish()
    }
}

fn default_imaps_port() -> u16 {
    993
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchConfig {
    /// If set, only messages on or after this date, as `[year, month, day]`.
    pub begin_search_date: Option<(i32, u32, u32)>,
    /// If set, only messages before this date, as `[year, month, day]`.
    pub end_search_date: Option<(i32, u32, u32)>,
    pub message_type: MessageType,
}

/// Which messages a mailbox search matches, by their `\Seen` flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    All,
    Unseen,
    Seen,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::All
    }
}

impl MessageType {
    /// The IMAP `SEARCH` key for this type.
    pub fn search_key(self) -> &'static str {
        match self {
            MessageType::All => "ALL",
            MessageType::Unseen => "UNSEEN",
            MessageType::Seen => "SEEN",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(MessageType::All),
            "unseen" => Ok(MessageType::Unseen),
            "seen" => Ok(MessageType::Seen),
            _ => Err(format!(
                "Unknown message type '{}'; expected all, unseen, or seen",
                s
            )),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Timeout, in seconds, for connecting and for each read or write on
    /// IMAP connections, and for whole HTTP requests.
    pub timeout: u64,
    /// The number of IMAP sessions to run concurrently.
    ///
    /// Sessions are shared across accounts, so this is a global limit.
    pub max_imap_connection_count: usize,
    /// The number of concurrent HTTP requests made while resolving
    /// large-attachment links.
    pub max_crawler_connection_count: usize,
    /// The number of times a task is attempted before a connection failure is
    /// reported as an issue.
    pub max_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            timeout: 30,
            max_imap_connection_count: 4,
            max_crawler_connection_count: 8,
            max_retries: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// The maximum total size, in MiB, of message data being fetched at any
    /// one time.
    ///
    /// A single part larger than this is still fetched, but only while
    /// nothing else is.
    pub max_occupancy_size: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            max_occupancy_size: 64,
        }
    }
}

/// A configuration value failed validation.
///
/// `path` is the dotted location of the value in the configuration file,
/// e.g. `mail.accounts.0.address`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct ConfigError {
    pub path: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// The validated configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub accounts: Vec<Arc<Account>>,
    /// Every `(account, mailbox)` pair to search, in configuration order.
    pub mailboxes: Vec<(Arc<Account>, String)>,
    pub search: SearchSettings,
    pub timeout: Duration,
    pub max_imap_connection_count: usize,
    pub max_crawler_connection_count: usize,
    pub max_retries: u32,
    /// Occupancy cap in bytes.
    pub max_occupancy_size: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchSettings {
    pub since: Option<NaiveDate>,
    pub before: Option<NaiveDate>,
    pub message_type: MessageType,
}

const MIB: u64 = 1024 * 1024;

impl RawConfig {
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let mut accounts = Vec::with_capacity(self.mail.accounts.len());
        for (ix, account) in self.mail.accounts.into_iter().enumerate() {
            let at = match account.address.find('@') {
                Some(at) if at > 0 && at + 1 < account.address.len() => at,
                _ => {
                    return Err(ConfigError::new(
                        format!("mail.accounts.{}.address", ix),
                        format!(
                            "'{}' is not an email address",
                            account.address
                        ),
                    ))
                }
            };

            if account.host.is_empty() {
                return Err(ConfigError::new(
                    format!("mail.accounts.{}.host", ix),
                    "must not be empty",
                ));
            }

            accounts.push(Arc::new(Account {
                host: account.host,
                port: account.port,
                username: account.address[..at].to_owned(),
                domain: account.address[at + 1..].to_owned(),
                password: account.password,
            }));
        }

        if self.mail.mailboxes.len() != accounts.len() {
            return Err(ConfigError::new(
                "mail.mailboxes",
                format!(
                    "expected {} mailbox lists (one per account), got {}",
                    accounts.len(),
                    self.mail.mailboxes.len()
                ),
            ));
        }

        let mut mailboxes = Vec::new();
        for (ix, (account, names)) in accounts
            .iter()
            .zip(self.mail.mailboxes.into_iter())
            .enumerate()
        {
            for (jx, name) in names.into_iter().enumerate() {
                if name.is_empty() {
                    return Err(ConfigError::new(
                        format!("mail.mailboxes.{}.{}", ix, jx),
                        "mailbox name must not be empty",
                    ));
                }
                mailboxes.push((Arc::clone(account), name));
            }
        }

        let search = SearchSettings {
            since: resolve_date(
                "search.begin_search_date",
                self.search.begin_search_date,
            )?,
            before: resolve_date(
                "search.end_search_date",
                self.search.end_search_date,
            )?,
            message_type: self.search.message_type,
        };

        let connection = self.connection;
        if 0 == connection.timeout {
            return Err(ConfigError::new(
                "connection.timeout",
                "must be positive",
            ));
        }
        if 0 == connection.max_imap_connection_count {
            return Err(ConfigError::new(
                "connection.max_imap_connection_count",
                "must be at least 1",
            ));
        }
        if 0 == connection.max_crawler_connection_count {
            return Err(ConfigError::new(
                "connection.max_crawler_connection_count",
                "must be at least 1",
            ));
        }
        if 0 == connection.max_retries {
            return Err(ConfigError::new(
                "connection.max_retries",
                "must be at least 1",
            ));
        }
        if 0 == self.download.max_occupancy_size {
            return Err(ConfigError::new(
                "download.max_occupancy_size",
                "must be positive",
            ));
        }

        Ok(Config {
            accounts,
            mailboxes,
            search,
            timeout: Duration::from_secs(connection.timeout),
            max_imap_connection_count: connection.max_imap_connection_count,
            max_crawler_connection_count: connection
                .max_crawler_connection_count,
            max_retries: connection.max_retries,
            max_occupancy_size: Some(
                self.download.max_occupancy_size.saturating_mul(MIB),
            ),
        })
    }
}

fn resolve_date(
    path: &str,
    date: Option<(i32, u32, u32)>,
) -> Result<Option<NaiveDate>, ConfigError> {
    let (y, m, d) = match date {
        None => return Ok(None),
        Some(date) => date,
    };

    let date = NaiveDate::from_ymd_opt(y, m, d).ok_or_else(|| {
        ConfigError::new(path, format!("{}-{}-{} is not a valid date", y, m, d))
    })?;
    check_date_range(path, date)?;
    Ok(Some(date))
}

/// Check that `date` lies within the range accepted for search dates.
pub fn check_date_range(path: &str, date: NaiveDate) -> Result<(), ConfigError> {
    if date < NaiveDate::from_ymd(1970, 1, 1)
        || date > NaiveDate::from_ymd(2099, 12, 31)
    {
        Err(ConfigError::new(
            path,
            format!("{} is outside 1970-01-01 to 2099-12-31", date),
        ))
    } else {
        Ok(())
    }
}

/// Load and validate the configuration file at `path`.
pub fn load(path: &Path) -> Result<Config, Error> {
    let data = fs::read(path)?;
    let raw: RawConfig = toml::from_slice(&data)?;
    Ok(raw.resolve()?)
}
