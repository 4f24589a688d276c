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

//! # Building quick-and-dirty updates
//!
//! Turn a peer's pending requests into the list of [QaduVideoUpdate]s we'll send it.
//!
//! A pending request only says "this counter changed"; the value sent is read from the video at
//! build time. That means any number of requests for the same video collapse into a single update
//! carrying the latest value of each counter mentioned. For instance, given requests
//! `likes, likes, views` for one video whose counters presently read `likes: 5, views: 9`, the
//! peer gets the single item `{uuid, likes: 5, views: 9}` & all three requests are resolved by it.
//!
//! Requests that can't be turned into anything are handled as follows:
//!
//! - the video has since been deleted: resolved without producing an item
//! - the destination pod has left the directory: every request for it is resolved
//! - the kind isn't one we recognize: logged & left alone (neither sent nor resolved)

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use async_trait::async_trait;
use itertools::Itertools;
use tracing::{debug, error, warn};

use crate::{
    counter_add, define_metric,
    entities::{PeerId, PendingRequest, QaduVideoUpdate, RequestId, VideoCounterSnapshot, VideoId},
    metrics::{Instruments, Sort},
    scheduler::{BatchBuilder, OutgoingBatch},
    storage::{self, PeerDirectory, VideoCounters},
};

define_metric! { "qadu.requests.unknown_kind",  qadu_requests_unknown_kind,  Sort::IntegralCounter }
define_metric! { "qadu.requests.video_gone",    qadu_requests_video_gone,    Sort::IntegralCounter }
define_metric! { "qadu.requests.peer_gone",     qadu_requests_peer_gone,     Sort::IntegralCounter }
define_metric! { "qadu.snapshots.read",         qadu_snapshots_read,         Sort::IntegralCounter }

/// One item under construction, along with the requests that contributed to it
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedVideoUpdate {
    pub video_id: VideoId,
    pub update: QaduVideoUpdate,
    pub contributing: Vec<RequestId>,
}

/// Video snapshots read so far during this cycle; `None` records that the video is gone
///
/// Shared across every peer in a cycle so that a video that's popular with many peers is only read
/// once.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    snapshots: HashMap<VideoId, Option<VideoCounterSnapshot>>,
}

impl SnapshotCache {
    pub fn new() -> SnapshotCache {
        SnapshotCache::default()
    }
    async fn get<B: VideoCounters + ?Sized>(
        &mut self,
        backend: &B,
        video_id: &VideoId,
        instruments: &Instruments,
    ) -> Result<Option<VideoCounterSnapshot>, storage::Error> {
        match self.snapshots.entry(*video_id) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                counter_add!(instruments, qadu_snapshots_read, 1, &[]);
                let snapshot = backend.video_counters(video_id).await?;
                Ok(vacant.insert(snapshot).clone())
            }
        }
    }
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Merge one peer's requests into per-video updates
///
/// Return the updates (in order of each video's first appearance), the ids of requests for videos
/// that no longer exist & the number of requests of unrecognized kind.
pub async fn merge<B: VideoCounters + ?Sized>(
    backend: &B,
    peer: &PeerId,
    requests: Vec<PendingRequest>,
    cache: &mut SnapshotCache,
    instruments: &Instruments,
) -> Result<(Vec<AggregatedVideoUpdate>, Vec<RequestId>, usize), storage::Error> {
    let mut updates: Vec<AggregatedVideoUpdate> = Vec::new();
    let mut index: HashMap<VideoId, usize> = HashMap::new();
    let mut gone: Vec<RequestId> = Vec::new();
    let mut unknown = 0;

    for request in requests.into_iter().sorted_by_key(PendingRequest::id) {
        let video_id = request.video_id();
        let Some(snapshot) = cache.get(backend, &video_id, instruments).await? else {
            debug!(
                "Video {} is gone; dropping request {} for {}.",
                video_id,
                request.id(),
                peer
            );
            counter_add!(instruments, qadu_requests_video_gone, 1, &[]);
            gone.push(request.id());
            continue;
        };
        let kind = match request.kind() {
            Ok(kind) => kind,
            Err(err) => {
                error!(
                    "Request {} for {} (video {}): {}; skipping.",
                    request.id(),
                    peer,
                    video_id,
                    err
                );
                counter_add!(instruments, qadu_requests_unknown_kind, 1, &[]);
                unknown += 1;
                continue;
            }
        };
        let idx = *index.entry(video_id).or_insert_with(|| {
            updates.push(AggregatedVideoUpdate {
                video_id,
                update: QaduVideoUpdate::new(snapshot.uuid),
                contributing: Vec::new(),
            });
            updates.len() - 1
        });
        let agg = &mut updates[idx];
        agg.update.set(kind, snapshot.counter(kind).unwrap_or(0));
        agg.contributing.push(request.id());
    }

    Ok((updates, gone, unknown))
}

/// [BatchBuilder] for quick-and-dirty video updates
///
/// Generic over the backend so that it can be handed anything that can answer both peer & counter
/// questions (a concrete store, or a `dyn Backend`).
pub struct QaduBuilder<B: ?Sized> {
    backend: Arc<B>,
    instruments: Arc<Instruments>,
}

impl<B> QaduBuilder<B>
where
    B: PeerDirectory + VideoCounters + ?Sized,
{
    pub fn new(backend: Arc<B>, instruments: Arc<Instruments>) -> QaduBuilder<B> {
        QaduBuilder {
            backend,
            instruments,
        }
    }

    /// Build the batch for a single peer
    pub async fn build_batch(
        &self,
        peer: &PeerId,
        requests: Vec<PendingRequest>,
        cache: &mut SnapshotCache,
    ) -> Result<OutgoingBatch<QaduVideoUpdate>, storage::Error> {
        let Some(target) = self.backend.peer(peer).await? else {
            warn!(
                "Peer {} is no longer in the directory; discarding {} requests.",
                peer,
                requests.len()
            );
            counter_add!(
                self.instruments,
                qadu_requests_peer_gone,
                requests.len() as u64,
                &[]
            );
            let mut batch = OutgoingBatch::new(*peer, None);
            batch.resolved = requests.iter().map(PendingRequest::id).collect();
            return Ok(batch);
        };

        // With no endpoint the batch still carries its items, so that it's reported as a failed
        // delivery & everything stays pending until an operator fixes the origin.
        let endpoint = target
            .endpoint()
            .inspect_err(|err| error!("Peer {} has an unusable origin: {}", peer, err))
            .ok();

        let (updates, gone, unknown) =
            merge(&*self.backend, peer, requests, cache, &self.instruments).await?;

        let mut batch = OutgoingBatch::new(*peer, endpoint);
        batch.skipped = unknown;
        batch.resolved.extend(gone);
        updates.into_iter().for_each(|agg| {
            batch.resolved.extend(agg.contributing);
            batch.items.push(agg.update);
        });
        Ok(batch)
    }
}

#[async_trait]
impl<B> BatchBuilder<PendingRequest, QaduVideoUpdate> for QaduBuilder<B>
where
    B: PeerDirectory + VideoCounters + ?Sized,
{
    async fn build(
        &self,
        pending: HashMap<PeerId, Vec<PendingRequest>>,
    ) -> Result<Vec<OutgoingBatch<QaduVideoUpdate>>, storage::Error> {
        let mut cache = SnapshotCache::new();
        let mut batches = Vec::with_capacity(pending.len());
        for (peer, requests) in pending.into_iter().sorted_by_key(|(peer, _)| *peer) {
            batches.push(self.build_batch(&peer, requests, &mut cache).await?);
        }
        debug!(
            "Built {} batches from {} video snapshots.",
            batches.len(),
            cache.len()
        );
        Ok(batches)
    }
}
