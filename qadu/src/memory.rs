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

//! # memory
//!
//! [Storage] implementation that lives entirely in process memory.
//!
//! [Storage]: crate::storage
//!
//! Useful for a single pod kicking the tires, and for tests. Every operation takes the one lock, so
//! a [Transaction] is trivially atomic.

use std::{
    collections::{BTreeMap, HashMap, HashSet, hash_map::Entry},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};

use crate::{
    entities::{
        Peer, PeerId, PendingRequest, QaduKind, QaduVideoUpdate, RequestId, VideoCounterSnapshot,
        VideoId, VideoUuid,
    },
    storage::{self, PeerDirectory, RequestStore, Transaction, VideoCounters, Write},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A video with public id {uuid} already exists"))]
    DuplicateUuid { uuid: VideoUuid, backtrace: Backtrace },
    #[snafu(display("No such video: {video_id}"))]
    NoSuchVideo {
        video_id: VideoId,
        backtrace: Backtrace,
    },
    #[snafu(display("The in-memory store's lock was poisoned"))]
    Poisoned { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

#[derive(Clone, Debug)]
struct Video {
    uuid: VideoUuid,
    likes: Option<u64>,
    dislikes: Option<u64>,
    views: Option<u64>,
}

impl Video {
    fn set(&mut self, kind: QaduKind, value: u64) {
        match kind {
            QaduKind::Likes => self.likes = Some(value),
            QaduKind::Dislikes => self.dislikes = Some(value),
            QaduKind::Views => self.views = Some(value),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    peers: HashMap<PeerId, Peer>,
    videos: HashMap<VideoId, Video>,
    by_uuid: HashMap<VideoUuid, VideoId>,
    // `RequestId`s are time-ordered, so iterating this map walks the queue oldest-first.
    requests: BTreeMap<RequestId, PendingRequest>,
}

/// An in-memory qadu [Backend](crate::storage::Backend)
#[derive(Debug, Default)]
pub struct InMemory {
    state: Mutex<State>,
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| PoisonedSnafu.build())
    }

    /// Add (or replace) a peer
    pub fn add_peer(&self, peer: Peer) -> Result<()> {
        self.state()?.peers.insert(peer.id, peer);
        Ok(())
    }
    /// Stop federating with `peer`; return true if we were
    ///
    /// Any requests still pending for it are left in place; the next cycle to pick them up will
    /// discard them.
    pub fn remove_peer(&self, peer: &PeerId) -> Result<bool> {
        Ok(self.state()?.peers.remove(peer).is_some())
    }
    /// Add a video with all counters unset
    pub fn add_video(&self, video_id: &VideoId, uuid: &VideoUuid) -> Result<()> {
        let mut state = self.state()?;
        match state.by_uuid.entry(*uuid) {
            Entry::Occupied(_) => return DuplicateUuidSnafu { uuid: *uuid }.fail(),
            Entry::Vacant(vacant) => {
                vacant.insert(*video_id);
            }
        }
        state.videos.insert(
            *video_id,
            Video {
                uuid: *uuid,
                likes: None,
                dislikes: None,
                views: None,
            },
        );
        Ok(())
    }
    /// Delete a video; return true if it existed
    pub fn delete_video(&self, video_id: &VideoId) -> Result<bool> {
        let mut state = self.state()?;
        match state.videos.remove(video_id) {
            Some(video) => {
                state.by_uuid.remove(&video.uuid);
                Ok(true)
            }
            None => Ok(false),
        }
    }
    /// Set one of a video's counters outside of any [Transaction]
    pub fn set_counter(&self, video_id: &VideoId, kind: QaduKind, value: u64) -> Result<()> {
        self.state()?
            .videos
            .get_mut(video_id)
            .context(NoSuchVideoSnafu {
                video_id: *video_id,
            })?
            .set(kind, value);
        Ok(())
    }
    /// Every pending request, oldest first
    pub fn pending(&self) -> Result<Vec<PendingRequest>> {
        Ok(self.state()?.requests.values().cloned().collect())
    }
}

use storage::Error as StorError;

impl From<Error> for StorError {
    fn from(value: Error) -> Self {
        StorError::new(value)
    }
}

#[async_trait]
impl RequestStore for InMemory {
    async fn commit(&self, txn: Transaction) -> StdResult<(), StorError> {
        let mut state = self.state()?;
        // Validate everything before touching anything:
        if let Some(video_id) = txn.writes().find_map(|write| match write {
            Write::SetCounter { video_id, .. } if !state.videos.contains_key(video_id) => {
                Some(*video_id)
            }
            _ => None,
        }) {
            return Err(NoSuchVideoSnafu { video_id }.build().into());
        }
        txn.into_iter().for_each(|write| match write {
            Write::InsertRequest(request) => {
                state.requests.insert(request.id(), request);
            }
            Write::SetCounter {
                video_id,
                kind,
                value,
            } => {
                if let Some(video) = state.videos.get_mut(&video_id) {
                    video.set(kind, value);
                }
            }
        });
        Ok(())
    }

    async fn list_grouped_by_peer(
        &self,
        max_peers: usize,
        max_per_peer: usize,
    ) -> StdResult<HashMap<PeerId, Vec<PendingRequest>>, StorError> {
        let state = self.state()?;
        // Peers are chosen in the order of their oldest pending request:
        let mut groups: HashMap<PeerId, Vec<PendingRequest>> = HashMap::new();
        for request in state.requests.values() {
            match groups.get_mut(&request.peer_id()) {
                Some(group) => {
                    if group.len() < max_per_peer {
                        group.push(request.clone());
                    }
                }
                None => {
                    if groups.len() < max_peers && max_per_peer > 0 {
                        groups.insert(request.peer_id(), vec![request.clone()]);
                    }
                }
            }
        }
        Ok(groups)
    }

    async fn delete_requests(
        &self,
        peer: &PeerId,
        ids: &HashSet<RequestId>,
    ) -> StdResult<(), StorError> {
        let mut state = self.state()?;
        ids.iter().for_each(|id| {
            if state
                .requests
                .get(id)
                .is_some_and(|request| request.peer_id() == *peer)
            {
                state.requests.remove(id);
            }
        });
        Ok(())
    }
}

#[async_trait]
impl PeerDirectory for InMemory {
    async fn list_peer_ids(&self) -> StdResult<Vec<PeerId>, StorError> {
        let mut ids = self.state()?.peers.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }
    async fn peer(&self, id: &PeerId) -> StdResult<Option<Peer>, StorError> {
        Ok(self.state()?.peers.get(id).cloned())
    }
}

#[async_trait]
impl VideoCounters for InMemory {
    async fn video_counters(
        &self,
        video: &VideoId,
    ) -> StdResult<Option<VideoCounterSnapshot>, StorError> {
        Ok(self
            .state()?
            .videos
            .get(video)
            .map(|v| VideoCounterSnapshot {
                video_id: *video,
                uuid: v.uuid,
                likes: v.likes,
                dislikes: v.dislikes,
                views: v.views,
            }))
    }
    async fn apply_remote_update(&self, update: &QaduVideoUpdate) -> StdResult<bool, StorError> {
        let mut state = self.state()?;
        let Some(video_id) = state.by_uuid.get(&update.uuid).cloned() else {
            return Ok(false);
        };
        match state.videos.get_mut(&video_id) {
            Some(video) => {
                update
                    .counters()
                    .for_each(|(kind, value)| video.set(kind, value));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use url::Url;

    fn peer(n: u8) -> Peer {
        Peer::new(
            PeerId::default(),
            Url::parse(&format!("http://pod{n}.example.com")).unwrap(),
        )
    }

    #[tokio::test]
    async fn grouping_respects_caps() {
        let store = InMemory::new();
        let peers = (0..10).map(peer).collect::<Vec<_>>();
        let video = VideoId::default();
        // Twenty requests per peer, interleaved across peers:
        let mut created = Vec::new();
        for _ in 0..20 {
            for p in &peers {
                let req = PendingRequest::new(QaduKind::Views, &video, &p.id);
                created.push(req.clone());
                store.create_requests(vec![req]).await.unwrap();
            }
        }

        let groups = store.list_grouped_by_peer(3, 5).await.unwrap();
        assert_eq!(groups.len(), 3);
        for (peer_id, group) in groups {
            assert_eq!(group.len(), 5);
            // Must be the five oldest for that peer, oldest first:
            let expected = created
                .iter()
                .filter(|r| r.peer_id() == peer_id)
                .take(5)
                .cloned()
                .collect::<Vec<_>>();
            assert_eq!(group, expected);
        }

        // The peers chosen should be the three with the oldest requests:
        let groups = store.list_grouped_by_peer(3, 1).await.unwrap();
        let mut chosen = groups.into_keys().collect::<Vec<_>>();
        chosen.sort();
        let mut oldest = peers.iter().take(3).map(|p| p.id).collect::<Vec<_>>();
        oldest.sort();
        assert_eq!(chosen, oldest);
    }

    #[tokio::test]
    async fn empty_store_yields_nothing() {
        let store = InMemory::new();
        assert!(store.list_grouped_by_peer(10, 10).await.unwrap().is_empty());
        // deleting ids that aren't there is fine:
        let ids = HashSet::from([RequestId::generate()]);
        store.delete_requests(&PeerId::default(), &ids).await.unwrap();
    }

    #[tokio::test]
    async fn deletes_are_idempotent_and_scoped() {
        let store = InMemory::new();
        let (a, b) = (PeerId::default(), PeerId::default());
        let video = VideoId::default();
        let ra = PendingRequest::new(QaduKind::Likes, &video, &a);
        let rb = PendingRequest::new(QaduKind::Likes, &video, &b);
        store
            .create_requests(vec![ra.clone(), rb.clone()])
            .await
            .unwrap();

        // Asking to delete `rb` on behalf of peer `a` does nothing:
        store
            .delete_requests(&a, &HashSet::from([ra.id(), rb.id()]))
            .await
            .unwrap();
        assert_eq!(store.pending().unwrap(), vec![rb.clone()]);
        store
            .delete_requests(&a, &HashSet::from([ra.id()]))
            .await
            .unwrap();
        assert_eq!(store.pending().unwrap(), vec![rb]);
    }

    #[tokio::test]
    async fn transactions_are_all_or_nothing() {
        let store = InMemory::new();
        let (video, missing) = (VideoId::default(), VideoId::default());
        store.add_video(&video, &VideoUuid::default()).unwrap();
        let peer = PeerId::default();

        let mut txn = Transaction::new();
        txn.set_counter(&video, QaduKind::Likes, 3);
        txn.insert_request(PendingRequest::new(QaduKind::Likes, &video, &peer));
        txn.set_counter(&missing, QaduKind::Likes, 3);
        assert!(store.commit(txn).await.is_err());
        assert!(store.pending().unwrap().is_empty());
        assert_eq!(
            store.video_counters(&video).await.unwrap().unwrap().likes,
            None
        );

        let mut txn = Transaction::new();
        txn.set_counter(&video, QaduKind::Likes, 3);
        txn.insert_request(PendingRequest::new(QaduKind::Likes, &video, &peer));
        store.commit(txn).await.unwrap();
        assert_eq!(store.pending().unwrap().len(), 1);
        assert_eq!(
            store.video_counters(&video).await.unwrap().unwrap().likes,
            Some(3)
        );
    }

    #[tokio::test]
    async fn remote_updates() {
        let store = InMemory::new();
        let (video, uuid) = (VideoId::default(), VideoUuid::default());
        store.add_video(&video, &uuid).unwrap();
        store.set_counter(&video, QaduKind::Dislikes, 4).unwrap();

        let mut update = QaduVideoUpdate::new(uuid);
        update.set(QaduKind::Views, 100);
        assert!(store.apply_remote_update(&update).await.unwrap());
        let snapshot = store.video_counters(&video).await.unwrap().unwrap();
        assert_eq!(snapshot.views, Some(100));
        // untouched counters stay put
        assert_eq!(snapshot.dislikes, Some(4));

        assert!(
            !store
                .apply_remote_update(&QaduVideoUpdate::new(VideoUuid::default()))
                .await
                .unwrap()
        );
        assert!(store.add_video(&VideoId::default(), &uuid).is_err());
    }
}
