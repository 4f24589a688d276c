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

use std::{env, fs, io, net::SocketAddr, sync::Arc};

use futures::future::BoxFuture;
use libtest_mimic::Failed;
use serde::Deserialize;
use snafu::{IntoError, prelude::*};
use tap::Pipe;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

use qadu::{storage::Backend, util::Credentials};
use qadu_test::{
    Helper, at_least_once, cycles_do_not_overlap, deleted_videos_are_purged,
    departed_peers_are_purged, duplicates_collapse, fan_out, large_batches_are_retired,
    limits_cap_each_cycle, peers_take_turns, remote_updates_are_applied,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse {pth}: {source}"))]
    De {
        pth: String,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to read QADU_TEST_CONFIG: {source}"))]
    Env { source: std::env::VarError },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    Filter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to read {pth}: {source}"))]
    Read { pth: String, source: std::io::Error },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Where to find a ScyllaDB cluster with the qadu schema applied
#[derive(Clone, Debug, Deserialize)]
pub struct ScyllaConfig {
    pub hosts: Vec<SocketAddr>,
    pub credentials: Option<Credentials>,
}

/// Common test configuration
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Install a tracing subscriber (governed by `RUST_LOG`)
    pub logging: bool,
    /// If not given, tests requiring ScyllaDB are reported as ignored
    pub scylla: Option<ScyllaConfig>,
}

impl Configuration {
    /// Obtain a [Configuration]
    ///
    /// Check the `QADU_TEST_CONFIG` environment variable; if defined, attempt to parse a
    /// [Configuration] from the file named therein; else return a default instance.
    pub fn new() -> Result<Configuration> {
        match env::var("QADU_TEST_CONFIG") {
            Ok(f) => fs::read_to_string(&f)
                .context(ReadSnafu { pth: f.clone() })?
                .pipe(|s| toml::from_str::<Configuration>(&s))
                .context(DeSnafu { pth: f.clone() }),
            Err(env::VarError::NotPresent) => Ok(Configuration::default()),
            Err(err) => Err(EnvSnafu.into_error(err)),
        }
    }
    /// Install a compact, stdout subscriber if so configured
    pub fn configure_logging(&self) -> Result<()> {
        if self.logging {
            let filter = EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env()
                .context(FilterSnafu)?;
            tracing::subscriber::set_global_default(
                Registry::default()
                    .with(fmt::Layer::default().compact().with_writer(io::stdout))
                    .with(filter),
            )
            .context(SetGlobalDefaultSnafu)?;
        }
        Ok(())
    }
}

pub type TestFn = fn(Arc<dyn Backend>, Arc<dyn Helper>) -> BoxFuture<'static, std::result::Result<(), Failed>>;

#[derive(Debug)]
pub struct Test {
    pub name: &'static str,
    pub test_fn: TestFn,
}

inventory::collect!(Test);

inventory::submit!(Test {
    name: "010fan_out",
    test_fn: |backend, helper| Box::pin(fan_out(backend, helper)),
});

inventory::submit!(Test {
    name: "020duplicates_collapse",
    test_fn: |backend, helper| Box::pin(duplicates_collapse(backend, helper)),
});

inventory::submit!(Test {
    name: "030limits_cap_each_cycle",
    test_fn: |backend, helper| Box::pin(limits_cap_each_cycle(backend, helper)),
});

inventory::submit!(Test {
    name: "033peers_take_turns",
    test_fn: |backend, helper| Box::pin(peers_take_turns(backend, helper)),
});

inventory::submit!(Test {
    name: "036large_batches_are_retired",
    test_fn: |backend, helper| Box::pin(large_batches_are_retired(backend, helper)),
});

inventory::submit!(Test {
    name: "040at_least_once",
    test_fn: |backend, helper| Box::pin(at_least_once(backend, helper)),
});

inventory::submit!(Test {
    name: "050deleted_videos_are_purged",
    test_fn: |backend, helper| Box::pin(deleted_videos_are_purged(backend, helper)),
});

inventory::submit!(Test {
    name: "060departed_peers_are_purged",
    test_fn: |backend, helper| Box::pin(departed_peers_are_purged(backend, helper)),
});

inventory::submit!(Test {
    name: "070cycles_do_not_overlap",
    test_fn: |backend, helper| Box::pin(cycles_do_not_overlap(backend, helper)),
});

inventory::submit!(Test {
    name: "080remote_updates_are_applied",
    test_fn: |backend, helper| Box::pin(remote_updates_are_applied(backend, helper)),
});
