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

//! # Quick-and-dirty video updates
//!
//! This is the front door. Request handlers that change a video's likes, dislikes or views call
//! [Qadu::create_request], which records (for every peer pod we know about) the fact that the
//! peer needs to hear about it. The [Scheduler] owned by [Qadu] eventually tells them.
//!
//! ```ignore
//! let mut txn = Transaction::new();
//! txn.set_counter(&video_id, QaduKind::Likes, likes + 1);
//! qadu.create_request(QaduKind::Likes, &video_id, Some(&mut txn)).await?;
//! backend.commit(txn).await?;
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};
use tracing::debug;

use crate::{
    builder::QaduBuilder,
    counter_add, define_metric,
    entities::{PeerId, PendingRequest, QaduKind, QaduVideoUpdate, RequestId, VideoId},
    gauge_setu,
    metrics::{Instruments, Sort},
    scheduler::{self, CycleOutcome, PendingStore, Processor, Scheduler},
    storage::{self, Backend, Transaction},
    transport::Transport,
};

/// How the quick-and-dirty update scheduler identifies itself in logs & metrics
pub const DESCRIPTION: &str = "video QADU requests";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to record {count} {kind} requests for video {video_id}: {source}"))]
    CreateRequests {
        kind: QaduKind,
        video_id: VideoId,
        count: usize,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to list peers: {source}"))]
    ListPeers {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Scheduler error: {source}"))]
    Scheduler {
        #[snafu(backtrace)]
        source: scheduler::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

define_metric! { "qadu.requests.created",  qadu_requests_created,  Sort::IntegralCounter }
define_metric! { "qadu.requests.selected", qadu_requests_selected, Sort::IntegralGauge }

pub type QaduScheduler = Scheduler<PendingRequest, QaduVideoUpdate>;

/// [PendingStore] over any qadu [Backend]
pub struct QaduStore {
    backend: Arc<dyn Backend>,
    instruments: Arc<Instruments>,
}

impl QaduStore {
    pub fn new(backend: Arc<dyn Backend>, instruments: Arc<Instruments>) -> QaduStore {
        QaduStore {
            backend,
            instruments,
        }
    }
}

#[async_trait]
impl PendingStore<PendingRequest> for QaduStore {
    async fn list_grouped_by_peer(
        &self,
        max_peers: usize,
        max_per_peer: usize,
    ) -> std::result::Result<HashMap<PeerId, Vec<PendingRequest>>, storage::Error> {
        let groups = self
            .backend
            .list_grouped_by_peer(max_peers, max_per_peer)
            .await?;
        gauge_setu!(
            self.instruments,
            qadu_requests_selected,
            groups.values().map(Vec::len).sum::<usize>() as u64,
            &[]
        );
        Ok(groups)
    }
    async fn retire(
        &self,
        peer: &PeerId,
        ids: &HashSet<RequestId>,
    ) -> std::result::Result<(), storage::Error> {
        self.backend.delete_requests(peer, ids).await
    }
}

/// Quick-and-dirty update propagation
pub struct Qadu {
    backend: Arc<dyn Backend>,
    scheduler: Arc<QaduScheduler>,
    instruments: Arc<Instruments>,
}

impl Qadu {
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn Transport<QaduVideoUpdate>>,
        config: scheduler::Config,
        instruments: Arc<Instruments>,
    ) -> Result<Qadu> {
        let scheduler = Scheduler::new(
            DESCRIPTION,
            Arc::new(QaduStore::new(backend.clone(), instruments.clone())),
            Arc::new(QaduBuilder::new(backend.clone(), instruments.clone())),
            transport,
            config,
            instruments.clone(),
        )
        .context(SchedulerSnafu)?;
        Ok(Qadu {
            backend,
            scheduler: Arc::new(scheduler),
            instruments,
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
    pub fn instruments(&self) -> &Arc<Instruments> {
        &self.instruments
    }
    pub fn scheduler(&self) -> &Arc<QaduScheduler> {
        &self.scheduler
    }

    /// Record that every peer pod needs to hear about a change to `video_id`'s `kind` counter
    ///
    /// One request is created per peer presently in the directory (none at all if there are no
    /// peers). If `txn` is given, the requests are added to it & will be written when the caller
    /// commits it; otherwise they're written here, atomically. Return the number of requests
    /// created.
    pub async fn create_request(
        &self,
        kind: QaduKind,
        video_id: &VideoId,
        txn: Option<&mut Transaction>,
    ) -> Result<usize> {
        let requests = self
            .backend
            .list_peer_ids()
            .await
            .context(ListPeersSnafu)?
            .iter()
            .map(|peer| PendingRequest::new(kind, video_id, peer))
            .collect::<Vec<_>>();
        let count = requests.len();
        if 0 == count {
            debug!("No peers; nothing to record for video {}.", video_id);
            return Ok(0);
        }

        match txn {
            Some(txn) => requests
                .into_iter()
                .for_each(|request| txn.insert_request(request)),
            None => self
                .backend
                .create_requests(requests)
                .await
                .context(CreateRequestsSnafu {
                    kind,
                    video_id: *video_id,
                    count,
                })?,
        }

        counter_add!(
            self.instruments,
            qadu_requests_created,
            count as u64,
            &[opentelemetry::KeyValue::new("kind", kind.as_str())]
        );
        Ok(count)
    }

    /// Run a cycle immediately, rather than waiting for the timer
    pub async fn force_send(&self) -> Result<CycleOutcome> {
        self.scheduler.run_cycle().await.context(SchedulerSnafu)
    }

    pub fn remaining_until_next_cycle(&self) -> Option<Duration> {
        self.scheduler.remaining_until_next_cycle()
    }

    /// Start the timer; must be called from within a Tokio runtime
    pub fn spawn(&self) -> Processor {
        scheduler::spawn(self.scheduler.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex;

    use url::Url;

    use crate::{
        entities::{Peer, VideoUuid},
        memory::InMemory,
        scheduler::CycleReport,
        transport,
    };

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(PeerId, Url, Vec<QaduVideoUpdate>)>>,
    }

    #[async_trait]
    impl Transport<QaduVideoUpdate> for Recorder {
        async fn deliver(
            &self,
            peer: &PeerId,
            endpoint: &Url,
            items: &[QaduVideoUpdate],
        ) -> std::result::Result<(), transport::Error> {
            self.sent
                .lock()
                .unwrap()
                .push((*peer, endpoint.clone(), items.to_vec()));
            Ok(())
        }
    }

    fn setup(npeers: usize) -> (Arc<InMemory>, Arc<Recorder>, Qadu, Vec<Peer>) {
        let store = Arc::new(InMemory::new());
        let peers = (0..npeers)
            .map(|n| {
                let peer = Peer::new(
                    PeerId::default(),
                    Url::parse(&format!("https://pod{n}.example.com")).unwrap(),
                );
                store.add_peer(peer.clone()).unwrap();
                peer
            })
            .collect::<Vec<_>>();
        let recorder = Arc::new(Recorder::default());
        let qadu = Qadu::new(
            store.clone(),
            recorder.clone(),
            scheduler::Config::default(),
            Arc::new(Instruments::new("qadu")),
        )
        .unwrap();
        (store, recorder, qadu, peers)
    }

    #[tokio::test]
    async fn fan_out() {
        let (store, _, qadu, peers) = setup(3);
        let video = VideoId::default();
        assert_eq!(
            qadu.create_request(QaduKind::Likes, &video, None)
                .await
                .unwrap(),
            3
        );
        let pending = store.pending().unwrap();
        let mut targets = pending.iter().map(|r| r.peer_id()).collect::<Vec<_>>();
        targets.sort();
        let mut expected = peers.iter().map(|p| p.id).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(targets, expected);
        assert!(
            pending
                .iter()
                .all(|r| r.video_id() == video && r.kind().unwrap() == QaduKind::Likes)
        );
    }

    #[tokio::test]
    async fn no_peers_no_requests() {
        let (store, _, qadu, _) = setup(0);
        assert_eq!(
            qadu.create_request(QaduKind::Views, &VideoId::default(), None)
                .await
                .unwrap(),
            0
        );
        assert!(store.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn requests_ride_along_with_the_transaction() {
        let (store, _, qadu, _) = setup(2);
        let (video, uuid) = (VideoId::default(), VideoUuid::default());
        store.add_video(&video, &uuid).unwrap();

        let mut txn = Transaction::new();
        txn.set_counter(&video, QaduKind::Dislikes, 1);
        qadu.create_request(QaduKind::Dislikes, &video, Some(&mut txn))
            .await
            .unwrap();
        assert_eq!(txn.len(), 3);
        // nothing's visible until the caller commits:
        assert!(store.pending().unwrap().is_empty());

        qadu.backend().commit(txn).await.unwrap();
        assert_eq!(store.pending().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn force_send_delivers_current_values() {
        let (store, recorder, qadu, peers) = setup(2);
        let (video, uuid) = (VideoId::default(), VideoUuid::default());
        store.add_video(&video, &uuid).unwrap();
        store.set_counter(&video, QaduKind::Views, 7).unwrap();
        qadu.create_request(QaduKind::Views, &video, None)
            .await
            .unwrap();
        // The value sent is the value at build time, not when the request was recorded:
        store.set_counter(&video, QaduKind::Views, 8).unwrap();

        let outcome = qadu.force_send().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Completed(CycleReport {
                peers: 2,
                delivered: 2,
                retired: 2,
                ..Default::default()
            })
        );
        assert!(store.pending().unwrap().is_empty());

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        for (peer, endpoint, items) in sent.iter() {
            let target = peers.iter().find(|p| p.id == *peer).unwrap();
            assert_eq!(endpoint, &target.endpoint().unwrap());
            let mut expected = QaduVideoUpdate::new(uuid);
            expected.views = Some(8);
            assert_eq!(items, &vec![expected]);
        }
    }
}
