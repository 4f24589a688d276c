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

//! # qadu entities
//!
//! The things we persist (or read from persistent storage), as opposed to the things we send over
//! the wire (for which see [qadu_shared]).

use chrono::{DateTime, Utc};
use scylla::DeserializeRow;
use serde::{Deserialize, Serialize};
use url::Url;

pub use qadu_shared::{
    PeerId, QADU_ENDPOINT_PATH, QaduKind, QaduVideoUpdate, RequestId, VideoId, VideoUuid,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         PendingRequest                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A durable record of the fact that `peer_id` needs to hear about a change to one of `video_id`'s
/// counters
///
/// Pending requests are never updated: they're inserted when a counter changes & deleted once a
/// batch including them has been accepted by the peer. Note that the request does *not* carry the
/// new counter value; the value sent is whatever the video holds at delivery time.
///
/// The kind is held in its stored textual form; whatever we read back from the database is what
/// we keep, & [PendingRequest::kind] reports anything we don't recognize.
#[derive(Clone, Debug, Deserialize, DeserializeRow, Eq, PartialEq, Serialize)]
pub struct PendingRequest {
    peer_id: PeerId,
    id: RequestId,
    kind: String,
    video_id: VideoId,
    created: DateTime<Utc>,
}

impl PendingRequest {
    /// Create a new request, assigning it a fresh, time-ordered [RequestId]
    pub fn new(kind: QaduKind, video_id: &VideoId, peer_id: &PeerId) -> PendingRequest {
        PendingRequest {
            peer_id: *peer_id,
            id: RequestId::generate(),
            kind: kind.to_string(),
            video_id: *video_id,
            created: Utc::now(),
        }
    }
    /// Reconstitute a request from its stored parts; `kind` is taken verbatim
    pub fn from_parts(
        id: RequestId,
        peer_id: PeerId,
        video_id: VideoId,
        kind: impl Into<String>,
        created: DateTime<Utc>,
    ) -> PendingRequest {
        PendingRequest {
            peer_id,
            id,
            kind: kind.into(),
            video_id,
            created,
        }
    }
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
    pub fn id(&self) -> RequestId {
        self.id
    }
    /// Interpret the stored kind
    pub fn kind(&self) -> Result<QaduKind, qadu_shared::Error> {
        self.kind.parse::<QaduKind>()
    }
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
    pub fn raw_kind(&self) -> &str {
        &self.kind
    }
    pub fn video_id(&self) -> VideoId {
        self.video_id
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Peer                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A pod with which we federate
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Peer {
    pub id: PeerId,
    /// Scheme, host & port at which the peer may be reached
    pub origin: Url,
}

impl Peer {
    pub fn new(id: PeerId, origin: Url) -> Peer {
        Peer { id, origin }
    }
    /// The URL to which quick-and-dirty updates for this peer should be posted
    pub fn endpoint(&self) -> Result<Url, qadu_shared::Error> {
        qadu_shared::qadu_endpoint(&self.origin)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      VideoCounterSnapshot                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A video's counters as of some instant
///
/// Counters that have never been set are `None`; they're reported to peers as zero.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VideoCounterSnapshot {
    pub video_id: VideoId,
    pub uuid: VideoUuid,
    pub likes: Option<u64>,
    pub dislikes: Option<u64>,
    pub views: Option<u64>,
}

impl VideoCounterSnapshot {
    pub fn counter(&self, kind: QaduKind) -> Option<u64> {
        match kind {
            QaduKind::Likes => self.likes,
            QaduKind::Dislikes => self.dislikes,
            QaduKind::Views => self.views,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_kinds_survive_the_round_trip() {
        let req = PendingRequest::from_parts(
            RequestId::generate(),
            PeerId::default(),
            VideoId::default(),
            "shares",
            Utc::now(),
        );
        assert_eq!(req.raw_kind(), "shares");
        assert!(req.kind().is_err());

        let req = PendingRequest::new(QaduKind::Views, &VideoId::default(), &PeerId::default());
        assert_eq!(req.raw_kind(), "views");
        assert_eq!(req.kind().unwrap(), QaduKind::Views);
    }
}
