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

//! # storage
//!
//! Abstractions for the qadu storage layer.
//!
//! Three collaborators sit behind these traits: the queue of pending requests, the directory of
//! peer pods & the source of video counters. In practice all three live in the same datastore, so
//! [Backend] ties them together, but the [builder] & [scheduler] only ask for the piece they need.
//!
//! [builder]: crate::builder
//! [scheduler]: crate::scheduler

use crate::entities::{
    Peer, PeerId, PendingRequest, QaduKind, QaduVideoUpdate, RequestId, VideoCounterSnapshot,
    VideoId,
};

use async_trait::async_trait;

use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Transaction                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single write within a [Transaction]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Write {
    InsertRequest(PendingRequest),
    SetCounter {
        video_id: VideoId,
        kind: QaduKind,
        value: u64,
    },
}

/// A set of writes to be committed together, or not at all
///
/// This is how a request handler makes a counter change & the intent to propagate it durable as a
/// unit: it adds the counter update, hands the same [Transaction] to
/// [create_request](crate::qadu::Qadu::create_request) & then commits it via
/// [RequestStore::commit]. Nothing is written until then.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Transaction {
    writes: Vec<Write>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::default()
    }
    pub fn insert_request(&mut self, request: PendingRequest) {
        self.writes.push(Write::InsertRequest(request));
    }
    pub fn set_counter(&mut self, video_id: &VideoId, kind: QaduKind, value: u64) {
        self.writes.push(Write::SetCounter {
            video_id: *video_id,
            kind,
            value,
        });
    }
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
    pub fn len(&self) -> usize {
        self.writes.len()
    }
    pub fn writes(&self) -> impl Iterator<Item = &Write> {
        self.writes.iter()
    }
}

impl IntoIterator for Transaction {
    type Item = Write;
    type IntoIter = std::vec::IntoIter<Write>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

impl FromIterator<PendingRequest> for Transaction {
    fn from_iter<T: IntoIterator<Item = PendingRequest>>(iter: T) -> Self {
        Transaction {
            writes: iter.into_iter().map(Write::InsertRequest).collect(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             traits                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The durable queue of [PendingRequest]s
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Apply every write in `txn` atomically; on failure, none of them are applied
    async fn commit(&self, txn: Transaction) -> Result<(), Error>;
    /// Insert a batch of requests atomically
    async fn create_requests(&self, requests: Vec<PendingRequest>) -> Result<(), Error> {
        self.commit(requests.into_iter().collect()).await
    }
    /// Retrieve pending work, grouped by destination
    ///
    /// At most `max_peers` peers will appear in the result, and for each at most `max_per_peer` of
    /// its oldest requests, oldest first. Peers with nothing pending are simply absent.
    async fn list_grouped_by_peer(
        &self,
        max_peers: usize,
        max_per_peer: usize,
    ) -> Result<HashMap<PeerId, Vec<PendingRequest>>, Error>;
    /// Remove requests destined for `peer`
    ///
    /// Deleting a request that's already gone is not an error. I demand a [HashSet] to make the
    /// caller prove that there are no duplicates among the ids. Scoping the delete to a single peer
    /// lets implementations make it atomic.
    async fn delete_requests(&self, peer: &PeerId, ids: &HashSet<RequestId>) -> Result<(), Error>;
}

/// The directory of pods with which we federate
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// The id of every peer we presently know about
    async fn list_peer_ids(&self) -> Result<Vec<PeerId>, Error>;
    /// Look-up a single peer; `None` means we no longer federate with it
    async fn peer(&self, id: &PeerId) -> Result<Option<Peer>, Error>;
}

/// Read (& occasionally write) access to video counters
#[async_trait]
pub trait VideoCounters: Send + Sync {
    /// Read `video`'s present counters; `None` means the video no longer exists
    async fn video_counters(&self, video: &VideoId) -> Result<Option<VideoCounterSnapshot>, Error>;
    /// Apply a quick-and-dirty update received from a peer, identifying the video by its public id;
    /// return false if we don't know of any such video
    async fn apply_remote_update(&self, update: &QaduVideoUpdate) -> Result<bool, Error>;
}

/// Everything qadu needs from a datastore
pub trait Backend: RequestStore + PeerDirectory + VideoCounters {}

impl<T> Backend for T where T: RequestStore + PeerDirectory + VideoCounters {}
