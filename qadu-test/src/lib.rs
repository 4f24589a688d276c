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

//! # The qadu Integration Tests
//!
//! # Introduction
//!
//! Each integration test program in `tests` opts out of the default test harness (`harness =
//! false` in Cargo.toml) and drives its trials through [libtest-mimic], which lets it set up a
//! fixture (a datastore, say) once for the whole program.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! # Project Structure
//!
//! The scenarios themselves live here, written against the [Backend] trait, so that every
//! datastore runs the same ones. Peer pods are played by [wiremock] servers. What a scenario can't
//! do through [Backend] (adding peers & videos, e.g.) it asks of a [Helper], which each test
//! program implements for its datastore.
//!
//! Code relating to the test framework itself (the `Test` struct, e.g.) belongs in
//! `tests/common`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use libtest_mimic::Failed;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use qadu::{
    entities::{Peer, PeerId, QADU_ENDPOINT_PATH, QaduKind, QaduVideoUpdate, VideoId, VideoUuid},
    metrics::Instruments,
    qadu::Qadu,
    remote::apply_updates,
    scheduler::{self, CycleOutcome, CycleReport},
    storage::{Backend, PeerDirectory, RequestStore, Transaction, VideoCounters},
    transport::{self, HttpTransport},
};

/// Implementations of this trait will be passed to each test function to let them do the things
/// the [Backend] trait doesn't offer. Each integration test will need to provide an
/// implementation.
#[async_trait]
pub trait Helper: Send + Sync {
    async fn add_peer(&self, peer: &Peer) -> Result<(), Failed>;
    async fn remove_peer(&self, peer: &PeerId) -> Result<(), Failed>;
    async fn add_video(&self, video_id: &VideoId, uuid: &VideoUuid) -> Result<(), Failed>;
    async fn delete_video(&self, video_id: &VideoId) -> Result<(), Failed>;
}

// Big enough to see everything any scenario creates
const EVERYTHING: usize = 10_000;

/// Drop every pending request & every peer, so that a scenario starts from a known state
pub async fn reset(backend: &Arc<dyn Backend>, helper: &Arc<dyn Helper>) -> Result<(), Failed> {
    for (peer, requests) in backend.list_grouped_by_peer(EVERYTHING, EVERYTHING).await? {
        backend
            .delete_requests(&peer, &requests.iter().map(|r| r.id()).collect())
            .await?;
    }
    for peer in backend.list_peer_ids().await? {
        helper.remove_peer(&peer).await?;
    }
    Ok(())
}

/// Stand-up a peer pod that accepts whatever we send it with `status`
pub async fn peer_pod(
    helper: &Arc<dyn Helper>,
    status: u16,
    delay: Option<Duration>,
) -> Result<(MockServer, Peer), Failed> {
    let server = MockServer::start().await;
    let mut response = ResponseTemplate::new(status);
    if let Some(delay) = delay {
        response = response.set_delay(delay);
    }
    Mock::given(method("POST"))
        .and(path(QADU_ENDPOINT_PATH))
        .respond_with(response)
        .mount(&server)
        .await;
    let peer = Peer::new(PeerId::default(), Url::parse(&server.uri())?);
    helper.add_peer(&peer).await?;
    Ok((server, peer))
}

/// Every list of updates `server` has been sent, in order of receipt
pub async fn received(server: &MockServer) -> Result<Vec<Vec<QaduVideoUpdate>>, Failed> {
    let mut lists = Vec::new();
    for request in server.received_requests().await.unwrap_or_default() {
        lists.push(request.body_json::<Vec<QaduVideoUpdate>>()?);
    }
    Ok(lists)
}

/// The number of requests pending for `peer`
pub async fn pending(backend: &Arc<dyn Backend>, peer: &PeerId) -> Result<usize, Failed> {
    Ok(backend
        .list_grouped_by_peer(EVERYTHING, EVERYTHING)
        .await?
        .get(peer)
        .map(Vec::len)
        .unwrap_or(0))
}

/// Create a video with some counters set
pub async fn video(
    backend: &Arc<dyn Backend>,
    helper: &Arc<dyn Helper>,
    counters: &[(QaduKind, u64)],
) -> Result<(VideoId, VideoUuid), Failed> {
    let (video_id, uuid) = (VideoId::default(), VideoUuid::default());
    helper.add_video(&video_id, &uuid).await?;
    let mut txn = Transaction::new();
    counters
        .iter()
        .for_each(|(kind, value)| txn.set_counter(&video_id, *kind, *value));
    backend.commit(txn).await?;
    Ok((video_id, uuid))
}

/// Wire-up a [Qadu] that delivers over HTTP
pub fn make_qadu(backend: &Arc<dyn Backend>, config: scheduler::Config) -> Result<Qadu, Failed> {
    let instruments = Arc::new(Instruments::new("qadu-test"));
    let transport = HttpTransport::new(&transport::Config::default(), instruments.clone())?;
    Ok(Qadu::new(
        backend.clone(),
        Arc::new(transport),
        config,
        instruments,
    )?)
}

async fn completed(qadu: &Qadu) -> Result<CycleReport, Failed> {
    match qadu.force_send().await? {
        CycleOutcome::Completed(report) => Ok(report),
        CycleOutcome::Skipped => Err("the cycle was unexpectedly skipped".into()),
    }
}

/// A change is recorded for every peer & each of them is sent the current value
pub async fn fan_out(backend: Arc<dyn Backend>, helper: Arc<dyn Helper>) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let mut pods = Vec::new();
    for _ in 0..3 {
        pods.push(peer_pod(&helper, 204, None).await?);
    }
    let (video_id, uuid) = video(&backend, &helper, &[(QaduKind::Likes, 5)]).await?;

    let qadu = make_qadu(&backend, scheduler::Config::default())?;
    assert_eq!(
        qadu.create_request(QaduKind::Likes, &video_id, None).await?,
        3
    );
    for (_, peer) in &pods {
        assert_eq!(pending(&backend, &peer.id).await?, 1);
    }

    let report = completed(&qadu).await?;
    assert_eq!(report.peers, 3);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.retired, 3);

    let mut expected = QaduVideoUpdate::new(uuid);
    expected.likes = Some(5);
    for (server, peer) in &pods {
        assert_eq!(received(server).await?, vec![vec![expected.clone()]]);
        assert_eq!(pending(&backend, &peer.id).await?, 0);
    }
    Ok(())
}

/// Many requests for the same video collapse into one item carrying every touched counter
pub async fn duplicates_collapse(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let (server, peer) = peer_pod(&helper, 204, None).await?;
    let (first, first_uuid) = video(
        &backend,
        &helper,
        &[(QaduKind::Likes, 5), (QaduKind::Views, 9)],
    )
    .await?;
    let (second, second_uuid) = video(&backend, &helper, &[]).await?;

    let qadu = make_qadu(&backend, scheduler::Config::default())?;
    for kind in [QaduKind::Likes, QaduKind::Likes, QaduKind::Views] {
        qadu.create_request(kind, &first, None).await?;
    }
    qadu.create_request(QaduKind::Dislikes, &second, None)
        .await?;
    assert_eq!(pending(&backend, &peer.id).await?, 4);

    let report = completed(&qadu).await?;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.retired, 4);

    let lists = received(&server).await?;
    assert_eq!(lists.len(), 1);
    let mut items = lists[0].clone();
    items.sort_by_key(|item| item.uuid);
    let mut expected_first = QaduVideoUpdate::new(first_uuid);
    expected_first.likes = Some(5);
    expected_first.views = Some(9);
    // An unset counter goes out as zero:
    let mut expected_second = QaduVideoUpdate::new(second_uuid);
    expected_second.dislikes = Some(0);
    let mut expected = vec![expected_first, expected_second];
    expected.sort_by_key(|item| item.uuid);
    assert_eq!(items, expected);
    Ok(())
}

/// A cycle serves no more than `limit-pods` peers, & picks-up no more than `limit-per-pod`
/// requests for each
pub async fn limits_cap_each_cycle(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let mut pods = Vec::new();
    for _ in 0..3 {
        pods.push(peer_pod(&helper, 204, None).await?);
    }
    let (first, _) = video(&backend, &helper, &[(QaduKind::Views, 1)]).await?;
    let (second, _) = video(&backend, &helper, &[(QaduKind::Views, 2)]).await?;

    let config = scheduler::Config {
        limit_pods: 2usize.try_into()?,
        limit_per_pod: 1usize.try_into()?,
        ..Default::default()
    };
    let qadu = make_qadu(&backend, config)?;
    qadu.create_request(QaduKind::Views, &first, None).await?;
    qadu.create_request(QaduKind::Views, &second, None).await?;

    let report = completed(&qadu).await?;
    assert_eq!(report.peers, 2);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.retired, 2);

    let mut remaining = 0;
    for (server, peer) in &pods {
        let lists = received(server).await?;
        assert!(lists.len() <= 1);
        assert!(lists.iter().all(|list| list.len() == 1));
        remaining += pending(&backend, &peer.id).await?;
    }
    assert_eq!(remaining, 4);

    // Every peer is eventually served, whatever order the datastore picks them in:
    for _ in 0..4 {
        let report = completed(&qadu).await?;
        assert!(report.peers <= 2);
        assert!(report.retired <= 2);
    }
    for (_, peer) in &pods {
        assert_eq!(pending(&backend, &peer.id).await?, 0);
    }
    Ok(())
}

/// With more peers than `limit-pods` & fresh changes arriving every cycle, every peer still gets
/// its turn
pub async fn peers_take_turns(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let mut pods = Vec::new();
    for _ in 0..6 {
        pods.push(peer_pod(&helper, 204, None).await?);
    }
    let (video_id, _) = video(&backend, &helper, &[(QaduKind::Views, 1)]).await?;

    let config = scheduler::Config {
        limit_pods: 2usize.try_into()?,
        ..Default::default()
    };
    let qadu = make_qadu(&backend, config)?;
    for _ in 0..4 {
        // Every peer has something pending on every cycle.
        qadu.create_request(QaduKind::Views, &video_id, None).await?;
        let report = completed(&qadu).await?;
        assert_eq!(report.peers, 2);
        assert_eq!(report.delivered, 2);
    }

    for (server, peer) in &pods {
        assert!(
            !received(server).await?.is_empty(),
            "peer {} was never served",
            peer.id
        );
    }
    Ok(())
}

/// A delivery resolving more requests than fit in a single delete still retires all of them
pub async fn large_batches_are_retired(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let (server, peer) = peer_pod(&helper, 204, None).await?;
    let (video_id, _) = video(&backend, &helper, &[(QaduKind::Likes, 7)]).await?;

    let config = scheduler::Config {
        limit_per_pod: 150usize.try_into()?,
        ..Default::default()
    };
    let qadu = make_qadu(&backend, config)?;
    let mut txn = Transaction::new();
    for _ in 0..150 {
        qadu.create_request(QaduKind::Likes, &video_id, Some(&mut txn))
            .await?;
    }
    backend.commit(txn).await?;
    assert_eq!(pending(&backend, &peer.id).await?, 150);

    let report = completed(&qadu).await?;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.retired, 150);
    assert_eq!(pending(&backend, &peer.id).await?, 0);
    // All 150 collapse into one item:
    let lists = received(&server).await?;
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].len(), 1);
    Ok(())
}

/// Requests stay put until their peer acknowledges them
pub async fn at_least_once(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let (server, peer) = peer_pod(&helper, 503, None).await?;
    let (video_id, uuid) = video(&backend, &helper, &[(QaduKind::Dislikes, 2)]).await?;

    let qadu = make_qadu(&backend, scheduler::Config::default())?;
    qadu.create_request(QaduKind::Dislikes, &video_id, None)
        .await?;

    let report = completed(&qadu).await?;
    assert_eq!(report.failed, 1);
    assert_eq!(report.retired, 0);
    assert_eq!(pending(&backend, &peer.id).await?, 1);

    // The peer comes back...
    server.reset().await;
    Mock::given(method("POST"))
        .and(path(QADU_ENDPOINT_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // & is sent the same thing again.
    let report = completed(&qadu).await?;
    assert_eq!(report.delivered, 1);
    assert_eq!(pending(&backend, &peer.id).await?, 0);
    let mut expected = QaduVideoUpdate::new(uuid);
    expected.dislikes = Some(2);
    assert_eq!(received(&server).await?, vec![vec![expected]]);
    Ok(())
}

/// Requests for videos that have since been deleted are dropped without bothering the peer
pub async fn deleted_videos_are_purged(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let (server, peer) = peer_pod(&helper, 204, None).await?;
    let (video_id, _) = video(&backend, &helper, &[(QaduKind::Likes, 1)]).await?;

    let qadu = make_qadu(&backend, scheduler::Config::default())?;
    qadu.create_request(QaduKind::Likes, &video_id, None).await?;
    helper.delete_video(&video_id).await?;

    let report = completed(&qadu).await?;
    assert_eq!(report.purged, 1);
    assert_eq!(report.retired, 1);
    assert_eq!(pending(&backend, &peer.id).await?, 0);
    assert!(received(&server).await?.is_empty());
    Ok(())
}

/// Requests for a peer with which we no longer federate are dropped
pub async fn departed_peers_are_purged(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let (server, peer) = peer_pod(&helper, 204, None).await?;
    let (video_id, _) = video(&backend, &helper, &[(QaduKind::Views, 3)]).await?;

    let qadu = make_qadu(&backend, scheduler::Config::default())?;
    qadu.create_request(QaduKind::Views, &video_id, None).await?;
    helper.remove_peer(&peer.id).await?;

    let report = completed(&qadu).await?;
    assert_eq!(report.purged, 1);
    assert_eq!(pending(&backend, &peer.id).await?, 0);
    assert!(received(&server).await?.is_empty());
    Ok(())
}

/// A cycle requested while another is running is skipped
pub async fn cycles_do_not_overlap(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let (server, _) = peer_pod(&helper, 204, Some(Duration::from_millis(750))).await?;
    let (video_id, _) = video(&backend, &helper, &[(QaduKind::Likes, 1)]).await?;

    let qadu = Arc::new(make_qadu(&backend, scheduler::Config::default())?);
    qadu.create_request(QaduKind::Likes, &video_id, None).await?;

    let first = tokio::spawn({
        let qadu = qadu.clone();
        async move { qadu.force_send().await }
    });
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(qadu.scheduler().state(), scheduler::State::Running);
    assert_eq!(qadu.force_send().await?, CycleOutcome::Skipped);

    match first.await?? {
        CycleOutcome::Completed(report) => assert_eq!(report.delivered, 1),
        CycleOutcome::Skipped => return Err("the first cycle was skipped".into()),
    }
    assert_eq!(qadu.scheduler().state(), scheduler::State::Idle);
    assert_eq!(received(&server).await?.len(), 1);
    Ok(())
}

/// Updates received from a peer are applied to the videos we know about
pub async fn remote_updates_are_applied(
    backend: Arc<dyn Backend>,
    helper: Arc<dyn Helper>,
) -> Result<(), Failed> {
    reset(&backend, &helper).await?;
    let (video_id, uuid) = video(&backend, &helper, &[(QaduKind::Likes, 1)]).await?;

    let mut known = QaduVideoUpdate::new(uuid);
    known.likes = Some(11);
    known.views = Some(100);
    let mut unknown = QaduVideoUpdate::new(VideoUuid::default());
    unknown.dislikes = Some(4);

    let applied = apply_updates(
        backend.as_ref(),
        &[known, unknown],
        &Instruments::new("qadu-test"),
    )
    .await?;
    assert_eq!(applied.applied, 1);
    assert_eq!(applied.unknown, 1);

    let snapshot = backend
        .video_counters(&video_id)
        .await?
        .ok_or("the video disappeared")?;
    assert_eq!(snapshot.likes, Some(11));
    assert_eq!(snapshot.views, Some(100));
    assert_eq!(snapshot.dislikes, None);
    Ok(())
}
