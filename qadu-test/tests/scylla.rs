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

//! # Quick-and-dirty update integration tests against ScyllaDB
//!
//! These need a cluster with the qadu schema applied (see `qadu-schemas`), named in the file given
//! by `QADU_TEST_CONFIG`:
//!
//! ```toml
//! [scylla]
//! hosts = ["127.0.0.1:9042"]
//! ```
//!
//! Absent that, every trial is reported as ignored. The trials share the one keyspace, so they're
//! run one at a time.

use std::{fmt::Display, sync::Arc};

use async_trait::async_trait;
use common::Configuration;
use itertools::Itertools;
use libtest_mimic::{Arguments, Failed, Trial};
use snafu::prelude::*;
use tokio::runtime::Runtime;

use qadu::{
    entities::{Peer, PeerId, VideoId, VideoUuid},
    scylla::Session,
    storage::Backend,
};
use qadu_test::Helper;

mod common;

#[derive(Snafu)]
enum Error {
    #[snafu(display("Error obtaining test configuration: {source}"))]
    Configuration { source: common::Error },
    #[snafu(display("Failed to build a Tokio runtime: {source}"))]
    Runtime { source: std::io::Error },
    #[snafu(display("Failed to create ScyllaDB session: {source}"))]
    Session { source: qadu::scylla::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

struct ScyllaHelper {
    session: Arc<Session>,
}

#[async_trait]
impl Helper for ScyllaHelper {
    async fn add_peer(&self, peer: &Peer) -> std::result::Result<(), Failed> {
        Ok(self.session.add_peer(peer).await?)
    }
    async fn remove_peer(&self, peer: &PeerId) -> std::result::Result<(), Failed> {
        Ok(self.session.remove_peer(peer).await?)
    }
    async fn add_video(
        &self,
        video_id: &VideoId,
        uuid: &VideoUuid,
    ) -> std::result::Result<(), Failed> {
        Ok(self.session.add_video(video_id, uuid).await?)
    }
    async fn delete_video(&self, video_id: &VideoId) -> std::result::Result<(), Failed> {
        self.session.delete_video(video_id).await?;
        Ok(())
    }
}

fn main() -> Result<()> {
    let rt = Arc::new(Runtime::new().context(RuntimeSnafu)?);

    // We have no way to augment the set of command-line arguments this program will accept, so
    // we'll examine an environment variable to determine where to get our configuration:
    let config = Configuration::new().context(ConfigurationSnafu)?;
    config.configure_logging().context(ConfigurationSnafu)?;

    let session = match &config.scylla {
        Some(scylla) => Some(Arc::new(
            rt.block_on(Session::new(scylla.hosts.clone(), &scylla.credentials))
                .context(SessionSnafu)?,
        )),
        None => None,
    };

    let mut args = Arguments::from_args();
    if !matches!(args.test_threads, Some(1)) {
        eprintln!("Overriding --test-threads to 1; these trials share a keyspace.");
        args.test_threads = Some(1);
    }

    let conclusion = libtest_mimic::run(
        &args,
        inventory::iter::<common::Test>
            .into_iter()
            .sorted_by_key(|t| t.name)
            .map(|test| match &session {
                Some(session) => Trial::test(test.name, {
                    let rt = rt.clone();
                    let session = session.clone();
                    move || {
                        let helper = Arc::new(ScyllaHelper {
                            session: session.clone(),
                        });
                        let result = rt.block_on((test.test_fn)(session.clone(), helper.clone()));
                        // Leave the keyspace as we found it, whatever the outcome:
                        if let Err(err) = rt.block_on(cleanup(session, helper)) {
                            eprintln!("Failed to clean-up after {}: {:?}", test.name, err);
                        }
                        result
                    }
                }),
                None => Trial::test(test.name, || Ok(())).with_ignored_flag(true),
            })
            .collect(),
    );

    conclusion.exit();
}

/// Drop everything the trial left behind
async fn cleanup(session: Arc<Session>, helper: Arc<dyn Helper>) -> std::result::Result<(), Failed> {
    session.truncate_requests().await?;
    let backend: Arc<dyn Backend> = session;
    qadu_test::reset(&backend, &helper).await
}
