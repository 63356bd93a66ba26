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

//! The large-attachment providers.
//!
//! A provider is selected by the host and path of a link; the query and
//! fragment are not considered. Each one knows how to turn a share link into
//! a direct download.

use lazy_static::lazy_static;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use url::Url;

use super::{link_details, Crawl, Method};
use crate::mime::html::extract_links;
use crate::pipeline::details::error_details;
use crate::pipeline::task::{ErrorKind, Failure, LargeAttachmentTask, Level};

type Resolve =
    fn(&Crawl<'_>, &LargeAttachmentTask) -> Result<(Method, String), Failure>;

pub struct Provider {
    pub name: &'static str,
    pub host: &'static str,
    pub path: &'static str,
    pub resolve: Resolve,
}

pub static PROVIDERS: &[Provider] = &[
    Provider {
        name: "qq",
        host: "mail.qq.com",
        path: "/cgi-bin/ftnExs_download",
        resolve: resolve_qq_ftn,
    },
    Provider {
        name: "qq-wx",
        host: "wx.mail.qq.com",
        path: "/ftn/download",
        resolve: resolve_qq_wx,
    },
    Provider {
        name: "163-dashi",
        host: "dashi.163.com",
        path: "/html/cloud-attachment-download",
        resolve: resolve_dashi_163,
    },
    Provider {
        name: "163",
        host: "mail.163.com",
        path: "/large-attachment-download/index.html",
        resolve: resolve_mail_163,
    },
    Provider {
        name: "sina",
        host: "mail.sina.com.cn",
        path: "/filecenter/download.php",
        resolve: resolve_sina,
    },
];

/// Find the provider for `url`, if there is one.
pub fn handler_for(url: &str) -> Option<&'static Provider> {
    let url = Url::parse(url).ok()?;
    if "http" != url.scheme() && "https" != url.scheme() {
        return None;
    }

    let host = url.host_str()?;
    let path = match url.path().trim_end_matches('/') {
        "" => "/",
        path => path,
    };
    PROVIDERS
        .iter()
        .find(|p| p.host.eq_ignore_ascii_case(host) && p.path == path)
}

const DELETED_OR_EXPIRED: &str = "The file has been deleted or has expired";

/// The link is understood but leads nowhere. These are informational since
/// the usual cause is a share which has simply lapsed.
fn unavailable(
    task: &LargeAttachmentTask,
    message: &str,
    status: Option<String>,
) -> Failure {
    let mut failure =
        Failure::new(ErrorKind::LinkSearchingError, Level::Info);
    failure.details.push((message.to_owned(), None));
    if let Some(status) = status {
        failure = failure.detail("Status code", status);
    }
    failure.details(link_details(&task.payload))
}

fn handle_error(task: &LargeAttachmentTask, message: String) -> Failure {
    Failure::new(ErrorKind::HandleError, Level::Error)
        .detail("Error", message)
        .details(link_details(&task.payload))
}

fn html_parsing_error(task: &LargeAttachmentTask, message: &str) -> Failure {
    Failure::new(ErrorKind::HtmlParsingError, Level::Error)
        .detail("Error", message)
        .details(link_details(&task.payload))
}

const QQ_DOWNLOAD_HOSTS: &[&str] =
    &["gzc-dfsdown.mail.ftn.qq.com", "njc-download.ftn.qq.com"];

/// The classic QQ page lists the download itself as an ordinary anchor on a
/// dedicated download host. Should it list several, the first in document
/// order is used, so the result is stable for a given page.
fn resolve_qq_ftn(
    crawl: &Crawl<'_>,
    task: &LargeAttachmentTask,
) -> Result<(Method, String), Failure> {
    let page = crawl.request(task, Method::Get, &task.payload.url, None)?;

    let link = extract_links(&page.body).into_iter().find(|link| {
        Url::parse(link)
            .ok()
            .and_then(|u| u.host_str().map(|h| QQ_DOWNLOAD_HOSTS.contains(&h)))
            .unwrap_or(false)
    });

    match link {
        Some(link) => Ok((Method::Get, link)),
        None => Err(unavailable(
            task,
            "Could not locate the download link; \
             the file may have been deleted or expired",
            None,
        )
        .response(page.body)),
    }
}

const QQ_WX_SCRIPT_NONCE: &str = "14540bb353ac024b89bb712b2e42cb28";

lazy_static! {
    static ref QQ_WX_STATUS: Regex =
        Regex::new(r"var status\s*=\s*(\d+)").unwrap();
    static ref QQ_WX_URL: Regex = Regex::new(r#"var url\s*=\s*"(.*)""#).unwrap();
}

/// The newer QQ page embeds its state in an inline script: a status code,
/// and the download URL when the status is 1.
fn resolve_qq_wx(
    crawl: &Crawl<'_>,
    task: &LargeAttachmentTask,
) -> Result<(Method, String), Failure> {
    let page = crawl.request(task, Method::Get, &task.payload.url, None)?;

    let script = match status_script(&page.body) {
        Some(script) => script,
        None => {
            return Err(html_parsing_error(task, "No status script in page")
                .response(page.body))
        }
    };

    let status = QQ_WX_STATUS
        .captures(&script)
        .and_then(|c| c[1].parse::<u32>().ok());
    let status = match status {
        Some(status) => status,
        None => {
            return Err(html_parsing_error(task, "Unreadable page status")
                .response(page.body))
        }
    };

    if 1 != status {
        return Err(unavailable(
            task,
            DELETED_OR_EXPIRED,
            Some(status.to_string()),
        )
        .response(page.body));
    }

    match QQ_WX_URL.captures(&script) {
        Some(c) => Ok((Method::Get, c[1].to_owned())),
        None => Err(html_parsing_error(task, "No download URL in page")
            .response(page.body)),
    }
}

/// The text of the script carrying the page status.
///
/// The script is normally identified by its nonce, but any body script
/// declaring the status is accepted if the nonce changes.
fn status_script(html: &str) -> Option<String> {
    let selector = Selector::parse("body script").ok()?;
    let document = Html::parse_document(html);
    let scripts = document
        .select(&selector)
        .map(|s| {
            (
                s.value().attr("nonce").map(str::to_owned),
                s.text().collect::<String>(),
            )
        })
        .collect::<Vec<_>>();

    let by_nonce = scripts
        .iter()
        .position(|s| Some(QQ_WX_SCRIPT_NONCE) == s.0.as_deref());
    let ix = by_nonce.or_else(|| {
        scripts.iter().position(|s| QQ_WX_STATUS.is_match(&s.1))
    })?;
    scripts.into_iter().nth(ix).map(|s| s.1)
}

/// The two NetEase (163) sites share one protocol and differ only in
/// endpoints.
struct NetEase {
    /// The query parameter of the share link holding the link key.
    link_key: &'static str,
    prepare: &'static str,
    /// The member of the prepare response holding the token and URL.
    payload: &'static str,
    refresh: &'static str,
}

const DASHI_163: NetEase = NetEase {
    link_key: "key",
    prepare: "https://dashi.163.com/filehub-master/file/dl/prepare2",
    payload: "result",
    refresh: "https://dashi.163.com/filehub-master/file/dl/refresh",
};

const MAIL_163: NetEase = NetEase {
    link_key: "file",
    prepare: "https://mail.163.com/filehub/bg/dl/prepare",
    payload: "data",
    refresh: "https://mail.163.com/filehub/bg/dl/refresh",
};

fn resolve_dashi_163(
    crawl: &Crawl<'_>,
    task: &LargeAttachmentTask,
) -> Result<(Method, String), Failure> {
    resolve_netease(crawl, task, &DASHI_163)
}

fn resolve_mail_163(
    crawl: &Crawl<'_>,
    task: &LargeAttachmentTask,
) -> Result<(Method, String), Failure> {
    resolve_netease(crawl, task, &MAIL_163)
}

/// POST the link key to the prepare endpoint, which answers with a status
/// code and, on success, a token and the download URL. The token is then
/// refreshed to keep the download URL valid.
fn resolve_netease(
    crawl: &Crawl<'_>,
    task: &LargeAttachmentTask,
    site: &NetEase,
) -> Result<(Method, String), Failure> {
    let link_key = Url::parse(&task.payload.url)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == site.link_key)
                .map(|(_, v)| v.into_owned())
        })
        .ok_or_else(|| {
            handle_error(
                task,
                format!("Link has no '{}' parameter", site.link_key),
            )
        })?;

    let response = crawl.request(
        task,
        Method::Post,
        site.prepare,
        Some(&json!({ "linkKey": link_key })),
    )?;
    let data = serde_json::from_str::<Value>(&response.body).map_err(|e| {
        handle_error(task, "Malformed prepare response".to_owned())
            .details(error_details(&e))
            .response(response.body.clone())
    })?;

    let code = match data.get("code").and_then(Value::as_i64) {
        Some(code) => code,
        None => {
            return Err(handle_error(
                task,
                "Prepare response has no code".to_owned(),
            )
            .response(response.body))
        }
    };

    let message = match code {
        200 => None,
        404 => Some("The file has been deleted"),
        400 => Some("The file has expired"),
        _ => Some("The file cannot be downloaded"),
    };
    if let Some(message) = message {
        return Err(unavailable(task, message, Some(code.to_string()))
            .response(response.body));
    }

    let payload = &data[site.payload];
    let (token, download_url) = match (
        payload.get("token").and_then(Value::as_str),
        payload.get("downloadUrl").and_then(Value::as_str),
    ) {
        (Some(token), Some(url)) => (token, url),
        _ => {
            return Err(handle_error(
                task,
                format!(
                    "Prepare response lacks {}.token or {}.downloadUrl",
                    site.payload, site.payload
                ),
            )
            .response(response.body))
        }
    };

    if let Err(failure) = crawl.request(
        task,
        Method::Post,
        site.refresh,
        Some(&json!({ "linkKey": link_key, "token": token })),
    ) {
        log::debug!(
            "{} Ignoring failed token refresh: {}",
            crawl.log_prefix(),
            failure.kind
        );
    }

    Ok((Method::Get, download_url.to_owned()))
}

/// Sina serves a form which is submitted back to the same URL.
fn resolve_sina(
    crawl: &Crawl<'_>,
    task: &LargeAttachmentTask,
) -> Result<(Method, String), Failure> {
    let page = crawl.request(task, Method::Get, &task.payload.url, None)?;

    if !has_body_input(&page.body) {
        return Err(
            unavailable(task, DELETED_OR_EXPIRED, None).response(page.body)
        );
    }

    Ok((Method::Post, task.payload.url.clone()))
}

fn has_body_input(html: &str) -> bool {
    match Selector::parse("body input") {
        Ok(selector) => Html::parse_document(html)
            .select(&selector)
            .next()
            .is_some(),
        Err(_) => false,
    }
}
