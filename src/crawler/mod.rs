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

//! Resolution of large-attachment links over HTTP.
//!
//! Each link is handed to the provider registered for its host and path (see
//! `providers`). Providers talk to the outside world only through an
//! `HttpClient`, so the pool driving them is the same `threading::Pool` used
//! for IMAP, just without sessions to keep.

pub mod providers;

#[cfg(test)]
pub mod fake;

use std::error::Error as StdError;
use std::fmt;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use thiserror::Error;

use crate::pipeline::details::{envelope_details, error_details};
use crate::pipeline::task::{
    Details, ErrorKind, Failure, LargeAttachmentTask, Level, LinkTarget,
    Outcome,
};
use crate::pipeline::Context;
use crate::support::cancel::CancelToken;
use crate::support::log_prefix::LogPrefix;
use crate::support::threading::{Cancelled, Pool, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Method::Get => "GET",
            Method::Post => "POST",
        })
    }
}

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("HTTP request failed")]
    Transport(#[source] Box<dyn StdError + Send + Sync + 'static>),
    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("HTTP request abandoned")]
    Cancelled,
}

/// A completed HTTP exchange, whatever its status.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    /// The final URL, after redirects.
    pub url: String,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpClient: Sync {
    /// Issue one request, following redirects.
    ///
    /// `json`, if given, is sent as the request body. Only transport failures
    /// are errors; any status is returned as a response.
    ///
    /// If `cancel` fires before the exchange completes, the request is
    /// abandoned and `HttpError::Cancelled` returned.
    fn request(
        &self,
        method: Method,
        url: &str,
        json: Option<&serde_json::Value>,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, HttpError>;
}

/// The real `HttpClient`.
///
/// Cookies persist for the life of the client, which some providers need to
/// carry state from one request to the next.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;
        Ok(ReqwestClient { client })
    }

    /// Start a request and return the response without reading the body.
    ///
    /// Non-2xx statuses are errors. Only the wait for the response headers
    /// is abandoned on cancellation.
    pub fn open(
        &self,
        method: Method,
        url: &str,
        cancel: &CancelToken,
    ) -> Result<reqwest::blocking::Response, HttpError> {
        let builder = self.builder(method, url);
        let response =
            abandonable(cancel, move || builder.send().map_err(transport))?;
        if !response.status().is_success() {
            return Err(HttpError::Status {
                status: response.status().as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }

    fn builder(
        &self,
        method: Method,
        url: &str,
    ) -> reqwest::blocking::RequestBuilder {
        match method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        }
    }
}

impl HttpClient for ReqwestClient {
    fn request(
        &self,
        method: Method,
        url: &str,
        json: Option<&serde_json::Value>,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, HttpError> {
        let mut builder = self.builder(method, url);
        if let Some(json) = json {
            builder = builder.json(json);
        }

        abandonable(cancel, move || {
            let response = builder.send().map_err(transport)?;
            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let body = response.text().map_err(transport)?;

            Ok(HttpResponse {
                status,
                url: final_url,
                body,
            })
        })
    }
}

fn transport(e: reqwest::Error) -> HttpError {
    HttpError::Transport(Box::new(e))
}

/// Run `exchange` on a thread of its own and wait for it, or for `cancel`.
///
/// The blocking client cannot be interrupted, so a cancelled exchange is
/// left to finish or time out in the background and its result discarded.
fn abandonable<T: Send + 'static>(
    cancel: &CancelToken,
    exchange: impl FnOnce() -> Result<T, HttpError> + Send + 'static,
) -> Result<T, HttpError> {
    if cancel.is_cancelled() {
        return Err(HttpError::Cancelled);
    }

    let (send, recv) = channel::bounded(1);
    thread::spawn(move || {
        let _ = send.send(exchange());
    });

    channel::select! {
        recv(recv) -> result => result.unwrap_or_else(|_| {
            Err(HttpError::Transport("HTTP client thread panicked".into()))
        }),
        recv(cancel.notified()) -> _ => Err(HttpError::Cancelled),
    }
}

/// What a provider sees of the crawler.
pub struct Crawl<'a> {
    client: &'a dyn HttpClient,
    cancel: &'a CancelToken,
    log_prefix: &'a LogPrefix,
}

impl<'a> Crawl<'a> {
    pub fn new(
        client: &'a dyn HttpClient,
        cancel: &'a CancelToken,
        log_prefix: &'a LogPrefix,
    ) -> Self {
        Crawl {
            client,
            cancel,
            log_prefix,
        }
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        self.log_prefix
    }

    /// Issue a request on behalf of `task`.
    ///
    /// Transport failures are `CONNECTION_FAILED`; a non-2xx status is
    /// `REQUEST_ERROR`. Either way the failure carries the link details of
    /// `task`. An abandoned request is `IGNORE`.
    pub fn request(
        &self,
        task: &LargeAttachmentTask,
        method: Method,
        url: &str,
        json: Option<&serde_json::Value>,
    ) -> Result<HttpResponse, Failure> {
        log::debug!("{} {} {}", self.log_prefix, method, url);
        let response = self
            .client
            .request(method, url, json, self.cancel)
            .map_err(|e| {
                if let HttpError::Cancelled = e {
                    log::debug!(
                        "{} {} {} abandoned",
                        self.log_prefix,
                        method,
                        url
                    );
                    return Failure::new(ErrorKind::Ignore, Level::Info);
                }

                log::warn!(
                    "{} {} {} failed: {}",
                    self.log_prefix,
                    method,
                    url,
                    e
                );
                Failure::new(ErrorKind::ConnectionFailed, Level::Error)
                    .details(error_details(&e))
                    .details(link_details(&task.payload))
            })?;

        if !response.is_success() {
            log::warn!(
                "{} {} {} returned {}",
                self.log_prefix,
                method,
                url,
                response.status
            );
            let err = HttpError::Status {
                status: response.status,
                url: response.url.clone(),
            };
            return Err(Failure::new(ErrorKind::RequestError, Level::Error)
                .details(error_details(&err))
                .details(link_details(&task.payload))
                .response(response.body));
        }

        Ok(response)
    }
}

/// The envelope summary of the message a link came from, plus the link.
pub fn link_details(target: &LinkTarget) -> Details {
    let mut details = envelope_details(&target.envelope);
    details.push(("Link".to_owned(), Some(target.url.clone())));
    details
}

struct CrawlWorker<'a> {
    client: &'a dyn HttpClient,
    cancel: &'a CancelToken,
    log_prefix: LogPrefix,
}

impl Worker<LinkTarget, (Method, String)> for CrawlWorker<'_> {
    fn process(
        &mut self,
        task: &LargeAttachmentTask,
    ) -> Result<(Method, String), Failure> {
        let provider =
            providers::handler_for(&task.payload.url).ok_or_else(|| {
                Failure::new(ErrorKind::HandleError, Level::Error)
                    .detail("Error", "No provider handles this link")
                    .details(link_details(&task.payload))
            })?;

        log::debug!(
            "{} Resolving {} link {}",
            self.log_prefix,
            provider.name,
            task.payload.url
        );
        let crawl = Crawl::new(self.client, self.cancel, &self.log_prefix);
        let resolved = (provider.resolve)(&crawl, task)?;
        log::info!(
            "{} Resolved {} -> {} {}",
            self.log_prefix,
            task.payload.url,
            resolved.0,
            resolved.1
        );
        Ok(resolved)
    }
}

/// Resolve every link in `seeds` to a download, calling `emit` with each
/// terminal outcome.
pub fn search_large_attachments(
    ctx: &Context,
    client: &dyn HttpClient,
    seeds: Vec<LargeAttachmentTask>,
    emit: impl FnMut(Outcome<LinkTarget, (Method, String)>),
) -> Result<(), Cancelled> {
    let pool = Pool {
        workers: ctx.config.max_crawler_connection_count,
        max_retries: ctx.config.max_retries,
    };
    pool.run(
        seeds,
        &ctx.cancel,
        |ix| CrawlWorker {
            client,
            cancel: &ctx.cancel,
            log_prefix: LogPrefix::new(format!("crawl#{}", ix)),
        },
        emit,
    )
}
