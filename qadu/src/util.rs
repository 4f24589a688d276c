// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of qadu.
//
// qadu is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// qadu is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with qadu.  If not, see
// <http://www.gnu.org/licenses/>.

//! # util
//!
//! Odds & ends shared by the binaries.

use itertools::Itertools;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tap::Pipe;

/// General-purpose credentials-- presumably username, password
// Not sure that the username should be secret, but why not?
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials(pub (SecretString, SecretString));

// Lets configurations that carry credentials be compared across reloads
impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        let Credentials((user, pass)) = self;
        let Credentials((other_user, other_pass)) = other;
        user.expose_secret() == other_user.expose_secret()
            && pass.expose_secret() == other_pass.expose_secret()
    }
}

impl clap::builder::ValueParserFactory for Credentials {
    type Parser = CredentialsParser;

    fn value_parser() -> Self::Parser {
        CredentialsParser
    }
}

/// Parse "username,password" from the command line
#[derive(Clone, Debug)]
pub struct CredentialsParser;

impl clap::builder::TypedValueParser for CredentialsParser {
    type Value = Credentials;

    fn parse_ref(
        &self,
        _cmd: &clap::Command,
        _arg: Option<&clap::Arg>,
        value: &std::ffi::OsStr,
    ) -> std::result::Result<Self::Value, clap::Error> {
        use clap::error::ErrorKind;
        value
            .to_str()
            .ok_or(clap::Error::new(ErrorKind::InvalidValue))?
            .split(',')
            .collect_tuple::<(&str, &str)>()
            .ok_or(clap::Error::new(ErrorKind::WrongNumberOfValues))?
            .pipe(|(user, pass)| (user.into(), pass.into()))
            .pipe(Credentials)
            .pipe(Ok)
    }
}
