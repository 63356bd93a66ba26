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
use std::sync::{Arc, Mutex};

/// Tracks text that should be included in at the start of every log statement
/// a worker makes.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    worker: String,
    account: Option<String>,
    mailbox: Option<String>,
}

impl LogPrefix {
    pub fn new(worker: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                worker,
                account: None,
                mailbox: None,
            })),
        }
    }

    pub fn set_account(&self, account: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.account = account.map(sanitise);
        inner.mailbox = None;
    }

    pub fn set_mailbox(&self, mailbox: Option<String>) {
        self.inner.lock().unwrap().mailbox = mailbox.map(sanitise);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.worker)?;
        if let Some(ref account) = inner.account {
            write!(f, "[{}", account)?;
            if let Some(ref mailbox) = inner.mailbox {
                write!(f, " {}", mailbox)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
