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

//! # qadu-schemas
//!
//! qadu-schemas creates & updates the ScyllaDB keyspace & tables required by [qadud].
//!
//! It's intended to be run at installation, and again as part of each upgrade. Each schema file
//! records its own version in `schema_migrations`; only those not yet applied are run.
//!
//! I could have used `cqlsh` to script this, but the convention in the ScyllaDB community seems to
//! be to define schemas in CQL files & execute them with whatever driver you're already using.
//!
//! [qadud]: ../qadud/index.html

use std::{fmt::Display, io, net::SocketAddr, ops::Deref, sync::Arc};

use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use futures::{StreamExt, future::BoxFuture, stream::iter};
use snafu::{Backtrace, prelude::*};
use tracing::{Level, info};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self},
    layer::SubscriberExt,
};

use qadu::{
    scylla::{create_client, create_schema, get_current_schema_version},
    util::Credentials,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        crate error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Application error type
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("While applying schema version {version}, {source}"))]
    CreateSchema {
        version: usize,
        source: qadu::scylla::Error,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("No ScyllaDB hosts specified"))]
    NoHosts { backtrace: Backtrace },
    #[snafu(display("When creating the Scylla client, {source}"))]
    ScyllaClient { source: qadu::scylla::Error },
    #[snafu(display("While fetching the current schema version, {source:#?}"))]
    ScyllaSchemaVersion { source: qadu::scylla::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////

fn configure_logging(debug: bool, verbose: bool, quiet: bool, plain: bool) -> Result<()> {
    let level = match (debug, verbose, quiet) {
        (true, _, _) => Level::TRACE,
        (false, true, _) => Level::DEBUG,
        (false, false, true) => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .context(EnvFilterSnafu)?;
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if plain {
        Box::new(
            fmt::Layer::default()
                .compact()
                .with_ansi(false)
                .with_writer(io::stdout),
        )
    } else {
        Box::new(fmt::Layer::default().json().with_writer(io::stdout))
    };
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   schema version management                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

const SCHEMA_VERSION: u32 = 0;

// Each function is expected to update `schema_migrations` on successful completion
pub type ScyllaDbSchemaUpdate =
    fn(Arc<scylla::client::session::Session>) -> BoxFuture<'static, Result<()>>;

const CQL_SCHEMAS: &[ScyllaDbSchemaUpdate] = &[|session| {
    Box::pin(async move {
        create_schema(session, include_str!("../../schemas/0.cql"))
            .await
            .context(CreateSchemaSnafu { version: 0usize })
    })
}];

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              main                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[tokio::main]
async fn main() -> Result<()> {
    const _: () = assert!(
        CQL_SCHEMAS.len() == SCHEMA_VERSION as usize + 1,
        "There is a mismatch between the number of CQL schema files and the current schema version."
    );

    let mut matches = Command::new("qadu-schemas")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Create or update the qadu ScyllaDB schema")
        .long_about(
            "Create the ScyllaDB keyspace & tables needed by qadud, or bring an existing keyspace \
             up to date.",
        )
        .arg(
            Arg::new("debug")
                .short('D')
                .long("debug")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("QADU_SCHEMAS_DEBUG")
                .help("produce debug output"),
        )
        .arg(
            Arg::new("plain")
                .short('p')
                .long("plain")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("QADU_SCHEMAS_PLAIN")
                .help("log in human-readable format, not JSON/structured logging"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("QADU_SCHEMAS_QUIET")
                .help("produce only error output"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("QADU_SCHEMAS_VERBOSE")
                .help("produce prolix output"),
        )
        .arg(
            Arg::new("creds")
                .short('c')
                .long("creds")
                .num_args(1)
                .env("QADU_SCHEMAS_CREDS")
                .value_parser(value_parser!(Credentials))
                .help("ScyllaDB credentials, given as \"username,password\""),
        )
        .arg(
            Arg::new("host")
                .num_args(1..)
                .value_parser(value_parser!(SocketAddr))
                .required(true)
                .help("ScyllaDB hosts, given as \"address:port\""),
        )
        .get_matches();

    configure_logging(
        matches.get_flag("debug"),
        matches.get_flag("verbose"),
        matches.get_flag("quiet"),
        matches.get_flag("plain"),
    )?;

    info!("qadu-schemas {}", crate_version!());

    let creds = matches.remove_one::<Credentials>("creds");
    let hosts = matches
        .remove_many::<SocketAddr>("host")
        .context(NoHostsSnafu)?;
    let client = Arc::new(create_client(hosts, &creds).await.context(ScyllaClientSnafu)?);
    // The keyspace won't exist in a new database, so this can't assume it does.
    let to_apply = get_current_schema_version(client.deref())
        .await
        .context(ScyllaSchemaVersionSnafu)?
        .map(|i| i + 1)
        .unwrap_or(0) as usize;
    if to_apply >= CQL_SCHEMAS.len() {
        info!("Schema version {} is already applied.", SCHEMA_VERSION);
        return Ok(());
    }
    iter(CQL_SCHEMAS[to_apply..].iter())
        .then(|f| f(client.clone()))
        .collect::<Vec<Result<()>>>()
        .await
        .into_iter()
        .collect::<Result<Vec<()>>>()?;
    info!("ScyllaDB configured through schema version {}.", SCHEMA_VERSION);
    Ok(())
}
