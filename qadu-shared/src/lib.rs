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

//! # qadu-shared
//!
//! Types that both ends of a quick-and-dirty update exchange need to agree upon: the identifiers
//! for pods, videos & pending requests, the closed set of counters we propagate, and the payload
//! that travels over the wire. Anything that needs a database lives behind the `backend` feature
//! so that a pod which only *receives* updates needn't pull-in the ScyllaDB driver.

#[cfg(feature = "backend")]
use scylla::{
    deserialize::{DeserializationError, FrameSlice, TypeCheckError, value::DeserializeValue},
    frame::response::result::ColumnType,
    serialize::{
        SerializationError,
        value::SerializeValue,
        writers::{CellWriter, WrittenCellProof},
    },
};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use url::Url;
use uuid::Uuid;

use std::{fmt::Display, ops::Deref, str::FromStr};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to form the quick-and-dirty update endpoint for {origin}: {source}"))]
    Endpoint {
        origin: Url,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} is not a known quick-and-dirty update kind"))]
    UnknownKind { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "backend")]
#[macro_export]
macro_rules! __define_id {
    ($type_name:ident) => {
        // The derive macros don't handle newtype structs.
        impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for $type_name {
            fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
                Uuid::type_check(typ)
            }
            fn deserialize(
                typ: &'metadata ColumnType<'metadata>,
                v: Option<FrameSlice<'frame>>,
            ) -> StdResult<Self, DeserializationError> {
                Ok(Self(<Uuid as DeserializeValue>::deserialize(typ, v)?))
            }
        }
        impl SerializeValue for $type_name {
            fn serialize<'b>(
                &self,
                typ: &ColumnType<'_>,
                writer: CellWriter<'b>,
            ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
                SerializeValue::serialize(&self.0, typ, writer)
            }
        }
    };
}

#[cfg(not(feature = "backend"))]
#[macro_export]
macro_rules! __define_id {
    ($type_name:ident) => {};
}

/// Declare an opaque, [Uuid]-backed identifier
///
/// Pods, videos (both their local & their public identities) and pending requests are all named by
/// UUIDs. I don't want to be able to hand a [VideoId] to something expecting a [PeerId], so each
/// gets its own newtype. The generated type implements [Display], [FromStr], [Deref] to [Uuid],
/// serde (transparently) and, with the `backend` feature, the ScyllaDB value traits.
///
/// The identifiers are totally ordered; for [RequestId] that order is meaningful (see
/// [RequestId::generate]).
#[macro_export]
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new(s: &str) -> StdResult<$type_name, uuid::Error> {
                Ok($type_name(Uuid::parse_str(s)?))
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                $type_name(Uuid::new_v4())
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl FromStr for $type_name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }
        impl AsRef<Uuid> for $type_name {
            fn as_ref(&self) -> &Uuid {
                self.deref()
            }
        }
        impl Deref for $type_name {
            type Target = Uuid;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl From<Uuid> for $type_name {
            fn from(value: Uuid) -> Self {
                $type_name(value)
            }
        }
        impl From<$type_name> for Uuid {
            fn from(value: $type_name) -> Self {
                value.0
            }
        }
        $crate::__define_id!($type_name);
    };
}

define_id!(PeerId);
define_id!(VideoId);
define_id!(VideoUuid);
define_id!(RequestId);

impl RequestId {
    /// Assign a new, time-ordered [RequestId]
    ///
    /// These are version 7 UUIDs: the leading 48 bits are a Unix timestamp in milliseconds, so
    /// sorting request ids sorts requests by creation time (within a millisecond, the v7 counter
    /// keeps ids generated by this process monotonic). This is what lets the ScyllaDB table cluster
    /// on the id & hand back the oldest requests first.
    pub fn generate() -> RequestId {
        RequestId(Uuid::now_v7())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            QaduKind                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The counters we propagate
///
/// This is a closed set; anything else that turns-up in storage is reported as an
/// [Error::UnknownKind] when converting.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QaduKind {
    Likes,
    Dislikes,
    Views,
}

impl QaduKind {
    /// The textual form in which the kind is persisted
    pub fn as_str(&self) -> &'static str {
        match self {
            QaduKind::Likes => "likes",
            QaduKind::Dislikes => "dislikes",
            QaduKind::Views => "views",
        }
    }
}

impl Display for QaduKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QaduKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "likes" => Ok(QaduKind::Likes),
            "dislikes" => Ok(QaduKind::Dislikes),
            "views" => Ok(QaduKind::Views),
            _ => UnknownKindSnafu {
                text: s.to_owned(),
            }
            .fail(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         wire payload                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The path, relative to a pod's origin, at which it accepts quick-and-dirty updates
pub const QADU_ENDPOINT_PATH: &str = "/api/v1/remote/videos/qadu";

/// Form the quick-and-dirty update endpoint for the pod at `origin`
pub fn qadu_endpoint(origin: &Url) -> Result<Url> {
    origin
        .join(QADU_ENDPOINT_PATH)
        .context(EndpointSnafu {
            origin: origin.clone(),
        })
}

/// One video's worth of a quick-and-dirty update
///
/// The body of a delivery is a JSON array of these. A counter that's absent wasn't touched since
/// the last delivery & is omitted from the serialized form altogether (as opposed to being sent as
/// `null`). `uuid` is always the *public* video id; local ids mean nothing to the peer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QaduVideoUpdate {
    pub uuid: VideoUuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dislikes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<u64>,
}

impl QaduVideoUpdate {
    pub fn new(uuid: VideoUuid) -> QaduVideoUpdate {
        QaduVideoUpdate {
            uuid,
            likes: None,
            dislikes: None,
            views: None,
        }
    }
    pub fn get(&self, kind: QaduKind) -> Option<u64> {
        match kind {
            QaduKind::Likes => self.likes,
            QaduKind::Dislikes => self.dislikes,
            QaduKind::Views => self.views,
        }
    }
    pub fn set(&mut self, kind: QaduKind, value: u64) {
        match kind {
            QaduKind::Likes => self.likes = Some(value),
            QaduKind::Dislikes => self.dislikes = Some(value),
            QaduKind::Views => self.views = Some(value),
        }
    }
    /// Iterate over the counters actually present in this update
    pub fn counters(&self) -> impl Iterator<Item = (QaduKind, u64)> + '_ {
        [QaduKind::Likes, QaduKind::Dislikes, QaduKind::Views]
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|value| (kind, value)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    #[test]
    fn kinds() {
        assert_eq!("likes".parse::<QaduKind>().unwrap(), QaduKind::Likes);
        assert_eq!("dislikes".parse::<QaduKind>().unwrap(), QaduKind::Dislikes);
        assert_eq!("views".parse::<QaduKind>().unwrap(), QaduKind::Views);
        assert!("Likes".parse::<QaduKind>().is_err());
        assert!("shares".parse::<QaduKind>().is_err());
        assert!("".parse::<QaduKind>().is_err());
        assert_eq!(QaduKind::Dislikes.to_string(), "dislikes");
    }

    #[test]
    fn absent_counters_are_omitted() {
        let uuid = VideoUuid::new("5a5e4a3c-0f6c-4e8e-9b8e-6a4ef2d7c1b0").unwrap();
        let mut update = QaduVideoUpdate::new(uuid);
        update.set(QaduKind::Likes, 5);
        update.set(QaduKind::Views, 9);
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"uuid": "5a5e4a3c-0f6c-4e8e-9b8e-6a4ef2d7c1b0", "likes": 5, "views": 9})
        );
        assert_eq!(
            update.counters().collect::<Vec<_>>(),
            vec![(QaduKind::Likes, 5), (QaduKind::Views, 9)]
        );

        // A peer may well send us a body with only some counters:
        let update: QaduVideoUpdate = serde_json::from_value(
            json!({"uuid": "5a5e4a3c-0f6c-4e8e-9b8e-6a4ef2d7c1b0", "dislikes": 2}),
        )
        .unwrap();
        assert_eq!(update.dislikes, Some(2));
        assert!(update.likes.is_none() && update.views.is_none());
    }

    #[test]
    fn request_ids_sort_by_creation() {
        let ids = (0..64).map(|_| RequestId::generate()).collect::<Vec<_>>();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn endpoints() {
        let origin = Url::parse("https://pod.example.com").unwrap();
        assert_eq!(
            qadu_endpoint(&origin).unwrap().as_str(),
            "https://pod.example.com/api/v1/remote/videos/qadu"
        );
        // The path is absolute, so any path on the origin is replaced:
        let origin = Url::parse("https://pod.example.com/some/where/").unwrap();
        assert_eq!(
            qadu_endpoint(&origin).unwrap().as_str(),
            "https://pod.example.com/api/v1/remote/videos/qadu"
        );
    }
}
