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

use std::path::Path;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use super::error::Error;

const PATTERN: &str = "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}";

/// Build a log4rs configuration which writes everything at `level` or above
/// to standard error.
pub fn console_config(level: LevelFilter) -> Result<Config, Error> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|e| Error::Log(e.to_string()))
}

/// Initialise logging for the process.
///
/// If `config_file` is given, it is a log4rs TOML configuration and takes
/// precedence over `level`.
pub fn init(config_file: Option<&Path>, level: LevelFilter) -> Result<(), Error> {
    if let Some(config_file) = config_file {
        log4rs::init_file(config_file, log4rs::file::Deserializers::new())
            .map_err(|e| Error::Log(e.to_string()))
    } else {
        log4rs::init_config(console_config(level)?)
            .map(|_| ())
            .map_err(|e| Error::Log(e.to_string()))
    }
}
