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

//! Fetching resolved large attachments to disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

use crate::crawler::{HttpError, Method, ReqwestClient};
use crate::pipeline::orchestrator::Summary;
use crate::support::cancel::CancelToken;
use crate::support::error::Error;

/// Download every large attachment in `summary` into `dir`.
///
/// A failed download is reported and skipped. Only failure to use `dir` at
/// all, or cancellation, is an error.
pub(super) fn download_all(
    http: &ReqwestClient,
    cancel: &CancelToken,
    dir: &Path,
    summary: &Summary,
) -> Result<(), Error> {
    fs::create_dir_all(dir)?;

    for (_, attachments) in &summary.messages {
        for &(method, ref url) in &attachments.large_attachments {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match download(http, cancel, dir, method, url) {
                Ok(path) => println!("Saved {}", path.display()),
                Err(DownloadError::Http(HttpError::Cancelled)) => {
                    return Err(Error::Cancelled)
                }
                Err(e) => eprintln!("Failed to download {}: {}", url, e),
            }
        }
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum DownloadError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn download(
    http: &ReqwestClient,
    cancel: &CancelToken,
    dir: &Path,
    method: Method,
    url: &str,
) -> Result<PathBuf, DownloadError> {
    log::info!("Downloading {} {}", method, url);
    let mut response = http.open(method, url, cancel)?;

    let name = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_filename)
        .or_else(|| url_filename(response.url()))
        .unwrap_or_else(|| "attachment".to_owned());

    let (path, mut file) = create_unique(dir, &name)?;
    if let Err(e) = io::copy(&mut response, &mut file) {
        // Don't leave a truncated file behind
        drop(file);
        let _ = fs::remove_file(&path);
        return Err(e.into());
    }

    Ok(path)
}

lazy_static! {
    static ref DISPOSITION_FILENAME: Regex = Regex::new(
        r#"(?i)filename\*?\s*=\s*(?:UTF-8''([^;\s]+)|"([^"]*)"|([^;\s]+))"#
    )
    .unwrap();
}

/// Extract the file name from a `Content-Disposition` header value.
fn disposition_filename(value: &str) -> Option<String> {
    let captures = DISPOSITION_FILENAME.captures(value)?;
    let name = if let Some(encoded) = captures.get(1) {
        urlencoding::decode(encoded.as_str()).ok()?.into_owned()
    } else {
        captures.get(2).or_else(|| captures.get(3))?.as_str().to_owned()
    };
    sanitise(&crate::mime::encoded_word::decode_header(&name))
}

fn url_filename(url: &url::Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    sanitise(&urlencoding::decode(segment).ok()?)
}

/// Reduce `name` to a plain file name, or `None` if nothing usable remains.
fn sanitise(name: &str) -> Option<String> {
    let name = name
        .rsplit(|c| '/' == c || '\\' == c)
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    let name = name.trim();

    if name.is_empty() || "." == name || ".." == name {
        None
    } else {
        Some(name.to_owned())
    }
}

/// Create a new file in `dir` named `name`, or `name` with a numeric suffix
/// before the extension if that already exists.
fn create_unique(dir: &Path, name: &str) -> io::Result<(PathBuf, fs::File)> {
    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };

    for n in 0u32.. {
        let candidate = if 0 == n {
            name.to_owned()
        } else {
            format!("{} ({}){}", stem, n, extension)
        };
        let path = dir.join(candidate);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("No free file name for '{}'", name),
    ))
}
