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

use std::io;

use thiserror::Error;

use super::config::ConfigError;

/// Process-level failures.
///
/// Failures of individual tasks are never reported through this type; they
/// are delivered to the pipeline observer as `TaskError`s instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Logging setup failed: {0}")]
    Log(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
