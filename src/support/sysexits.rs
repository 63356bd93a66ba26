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

//! Exit codes from `sysexits.h`, and the mapping of process errors onto them.

use super::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }
}

impl From<&Error> for Sysexit {
    fn from(e: &Error) -> Self {
        match *e {
            Error::Cancelled => EX_TEMPFAIL,
            Error::Log(_) => EX_SOFTWARE,
            Error::Config(_) | Error::Toml(_) => EX_CONFIG,
            Error::Http(_) => EX_UNAVAILABLE,
            Error::Io(_) => EX_IOERR,
        }
    }
}
