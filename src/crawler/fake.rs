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

//! A canned `HttpClient` for tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Mutex;

use super::{HttpClient, HttpError, HttpResponse, Method};
use crate::support::cancel::CancelToken;

#[derive(Default)]
pub struct FakeHttp {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    routes: HashMap<(Method, String), (u16, String)>,
    failures: HashMap<String, u32>,
    hangs: HashSet<String>,
    log: Vec<(Method, String, Option<serde_json::Value>)>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `method url` with `status` and `body`. Unrouted requests get
    /// a 404.
    pub fn route(&self, method: Method, url: &str, status: u16, body: &str) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert((method, url.to_owned()), (status, body.to_owned()));
    }

    /// Make the next `n` requests to `url` time out.
    pub fn fail(&self, url: &str, n: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(url.to_owned(), n);
    }

    /// Make requests to `url` never complete, except by cancellation.
    pub fn hang(&self, url: &str) {
        self.state.lock().unwrap().hangs.insert(url.to_owned());
    }

    /// Every request made, in order.
    pub fn log(&self) -> Vec<(Method, String, Option<serde_json::Value>)> {
        self.state.lock().unwrap().log.clone()
    }
}

impl HttpClient for FakeHttp {
    fn request(
        &self,
        method: Method,
        url: &str,
        json: Option<&serde_json::Value>,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, HttpError> {
        if cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }

        let mut state = self.state.lock().unwrap();
        state.log.push((method, url.to_owned(), json.cloned()));

        if state.hangs.contains(url) {
            drop(state);
            // Only ever returns by disconnection
            let _ = cancel.notified().recv();
            return Err(HttpError::Cancelled);
        }

        if let Some(n) = state.failures.get_mut(url) {
            if *n > 0 {
                *n -= 1;
                return Err(HttpError::Transport(Box::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "operation timed out",
                ))));
            }
        }

        let (status, body) = state
            .routes
            .get(&(method, url.to_owned()))
            .cloned()
            .unwrap_or_else(|| (404, "not found".to_owned()));
        Ok(HttpResponse {
            status,
            url: url.to_owned(),
            body,
        })
    }
}
