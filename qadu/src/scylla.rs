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

//! # scylla
//!
//! [Storage] implementation for ScyllaDB.
//!
//! [Storage]: crate::storage
//!
//! Pending requests live in `qadu_requests`, partitioned by destination peer & clustered by request
//! id. Since request ids are version 7 UUIDs, reading a partition in clustering order yields that
//! peer's requests oldest-first. Deleting a peer's resolved requests touches a single partition, so
//! it's atomic & isolated.
//!
//! Picking *which* peers to serve can't be done oldest-first without scanning the table. Instead,
//! the [Session] walks the token ring: each selection resumes just past the last partition served
//! & wraps around to the start of the ring when it runs off the end. Under sustained fan-out every
//! peer has work on every cycle, so this rotation is what keeps peers late in token order from
//! starving.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enum_map::{Enum, EnumMap};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use scylla::{
    client::{session::Session as ScyllaSession, session_builder::SessionBuilder},
    errors::{
        DeserializationError, ExecutionError, IntoRowsResultError, NewSessionError,
        PrepareError, RowsError, SerializationError, UseKeyspaceError,
    },
    serialize::{
        row::{RowSerializationContext, SerializeRow},
        writers::RowWriter,
    },
    statement::{
        batch::{Batch, BatchType},
        prepared::PreparedStatement,
    },
};
use secrecy::ExposeSecret;
use snafu::{Backtrace, IntoError, prelude::*};
use tap::Pipe;
use tracing::{debug, info};
use url::Url;

use crate::{
    entities::{
        Peer, PeerId, PendingRequest, QaduKind, QaduVideoUpdate, RequestId, VideoCounterSnapshot,
        VideoId, VideoUuid,
    },
    storage::{self, PeerDirectory, RequestStore, Transaction, VideoCounters, Write},
    util::Credentials,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A query was expected to produce at most one row & did not."))]
    AtMostOneRow { backtrace: Backtrace },
    #[snafu(display(
        "The number of prepared statements isn't consistent; this is a bug & should be reported!"
    ))]
    BadPreparedStatementCount { backtrace: Backtrace },
    #[snafu(display("On conversion, {count} was too large to be converted to an i32: {source}"))]
    CountOOR {
        count: usize,
        source: std::num::TryFromIntError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialize a row: {source}"))]
    De {
        source: DeserializationError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to convert to a RowsResult: {source}"))]
    IntoRowsResult {
        source: IntoRowsResultError,
        backtrace: Backtrace,
    },
    #[snafu(display("Peer {peer} has an invalid origin {origin}: {source}"))]
    InvalidOrigin {
        peer: PeerId,
        origin: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to set keyspace: {source}"))]
    Keyspace {
        source: UseKeyspaceError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create a ScyllaDB session: {source}"))]
    NewSession {
        source: NewSessionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to prepare statement: {stmt}: {source}"))]
    Prepare {
        stmt: String,
        source: PrepareError,
        backtrace: Backtrace,
    },
    #[snafu(display("ScyllaDB query failed: {source}"))]
    Query {
        source: ExecutionError,
        backtrace: Backtrace,
    },
    #[snafu(display("While executing {stmt}, {source}"))]
    Schema {
        stmt: String,
        source: ExecutionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to type a RowResult: {source}"))]
    TypedRows {
        source: RowsError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   qadu ScyllaDB session type                                   //
////////////////////////////////////////////////////////////////////////////////////////////////////

const KEYSPACE: &str = "qadu";

/// The set of prepared statements used by qadu
///
/// Used both as a mnemonic tag identifying prepared statements and as the key type in a mapping
/// from said tags to the actual [PreparedStatement]s. The [Enum] implementation requires us to
/// provide an array of [PreparedStatement] of length exactly equal to the number of variants.
#[derive(Clone, Copy, Debug, Enum, Eq, PartialEq)]
enum PreparedStatements {
    InsertRequest,
    SelectPendingPeers,
    SelectPendingPeersAfter,
    SelectRequests,
    DeleteRequests,
    SelectPeerIds,
    SelectPeer,
    SelectVideo,
    SelectVideoByUuid,
    SetLikes,
    SetDislikes,
    SetViews,
}

impl PreparedStatements {
    fn set_counter(kind: QaduKind) -> PreparedStatements {
        match kind {
            QaduKind::Likes => PreparedStatements::SetLikes,
            QaduKind::Dislikes => PreparedStatements::SetDislikes,
            QaduKind::Views => PreparedStatements::SetViews,
        }
    }
}

/// Connect to a ScyllaDB cluster, without selecting a keyspace
pub async fn create_client(
    hosts: impl IntoIterator<Item = SocketAddr>,
    credentials: &Option<Credentials>,
) -> Result<ScyllaSession> {
    let mut builder = SessionBuilder::new().known_nodes_addr(hosts);
    if let Some(Credentials((user, pass))) = credentials {
        builder = builder.user(user.expose_secret(), pass.expose_secret())
    }
    builder.build().await.context(NewSessionSnafu)
}

/// qadu-specific ScyllaDB Session type
///
/// Instantiate this via [Session::new] with connection info & credentials if need be; when dropped
/// the ScyllaDB session will be terminated.
pub struct Session {
    session: ScyllaSession,
    prepared_statements: EnumMap<PreparedStatements, PreparedStatement>,
    // Token of the last partition handed out by `list_grouped_by_peer`
    cursor: Mutex<Option<i64>>,
}

impl Session {
    async fn prepare(scylla: &ScyllaSession, stmt: &str) -> Result<PreparedStatement> {
        scylla.prepare(stmt).await.context(PrepareSnafu {
            stmt: stmt.to_owned(),
        })
    }

    pub async fn new(
        hosts: impl IntoIterator<Item = SocketAddr>,
        credentials: &Option<Credentials>,
    ) -> Result<Session> {
        let scylla = create_client(hosts, credentials).await?;
        scylla
            .use_keyspace(KEYSPACE, false)
            .await
            .context(KeyspaceSnafu)?;

        let prepared_statements = stream::iter(vec![
            // In the same order as `PreparedStatements`:
            "insert into qadu_requests (peer_id,id,kind,video_id,created) values (?,?,?,?,?)",
            "select distinct token(peer_id),peer_id from qadu_requests limit ?",
            "select distinct token(peer_id),peer_id from qadu_requests where token(peer_id)>? limit ?",
            "select peer_id,id,kind,video_id,created from qadu_requests where peer_id=? limit ?",
            "delete from qadu_requests where peer_id=? and id in ?",
            "select id from pods",
            "select id,origin from pods where id=?",
            "select id,public_id,likes,dislikes,views from videos where id=?",
            "select id from videos_by_public_id where public_id=?",
            "update videos set likes=? where id=?",
            "update videos set dislikes=? where id=?",
            "update videos set views=? where id=?",
        ])
        .then(|s| async { Self::prepare(&scylla, s).await })
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<PreparedStatement>>>()?;
        let prepared_statements: [PreparedStatement; 12] = prepared_statements
            .try_into()
            .map_err(|_| BadPreparedStatementCountSnafu.build())?;

        Ok(Session {
            session: scylla,
            prepared_statements: EnumMap::from_array(prepared_statements),
            cursor: Mutex::new(None),
        })
    }

    fn statement(&self, which: PreparedStatements) -> &PreparedStatement {
        &self.prepared_statements[which]
    }

    /// Add (or replace) a peer
    pub async fn add_peer(&self, peer: &Peer) -> Result<()> {
        self.session
            .query_unpaged(
                "insert into pods (id,origin) values (?,?)",
                (peer.id, peer.origin.as_str()),
            )
            .await
            .context(QuerySnafu)?;
        Ok(())
    }
    /// Stop federating with `peer`
    pub async fn remove_peer(&self, peer: &PeerId) -> Result<()> {
        self.session
            .query_unpaged("delete from pods where id=?", (peer,))
            .await
            .context(QuerySnafu)?;
        Ok(())
    }
    /// Add a video with all counters unset
    pub async fn add_video(&self, video_id: &VideoId, uuid: &VideoUuid) -> Result<()> {
        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement("insert into videos (id,public_id) values (?,?)");
        batch.append_statement("insert into videos_by_public_id (public_id,id) values (?,?)");
        self.session
            .batch(&batch, ((video_id, uuid), (uuid, video_id)))
            .await
            .context(QuerySnafu)?;
        Ok(())
    }
    /// Delete a video; return true if it existed
    pub async fn delete_video(&self, video_id: &VideoId) -> Result<bool> {
        let Some(snapshot) = self.snapshot(video_id).await? else {
            return Ok(false);
        };
        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement("delete from videos where id=?");
        batch.append_statement("delete from videos_by_public_id where public_id=?");
        self.session
            .batch(&batch, ((video_id,), (snapshot.uuid,)))
            .await
            .context(QuerySnafu)?;
        Ok(true)
    }
    /// Remove every pending request
    pub async fn truncate_requests(&self) -> Result<()> {
        self.session
            .query_unpaged("truncate qadu_requests", ())
            .await
            .context(QuerySnafu)?;
        Ok(())
    }
    /// The schema version of the cluster to which we're connected
    pub async fn schema_version(&self) -> Result<Option<u32>> {
        get_current_schema_version(&self.session).await
    }

    /// Up to `limit` partitions with pending requests, in token order, starting just past `after`
    async fn pending_peers(
        &self,
        after: Option<i64>,
        limit: usize,
    ) -> StdResult<Vec<(i64, PeerId)>, StorError> {
        let limit = to_limit(limit)?;
        let result = match after {
            Some(token) => {
                self.session
                    .execute_unpaged(
                        self.statement(PreparedStatements::SelectPendingPeersAfter),
                        (token, limit),
                    )
                    .await?
            }
            None => {
                self.session
                    .execute_unpaged(
                        self.statement(PreparedStatements::SelectPendingPeers),
                        (limit,),
                    )
                    .await?
            }
        };
        Ok(result
            .into_rows_result()?
            .rows::<(i64, PeerId)>()?
            .collect::<StdResult<Vec<_>, _>>()?)
    }

    async fn snapshot(&self, video_id: &VideoId) -> Result<Option<VideoCounterSnapshot>> {
        type Row = (
            VideoId,
            Option<VideoUuid>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        );
        self.session
            .execute_unpaged(self.statement(PreparedStatements::SelectVideo), (video_id,))
            .await
            .context(QuerySnafu)?
            .into_rows_result()
            .context(IntoRowsResultSnafu)?
            .rows::<Row>()
            .context(TypedRowsSnafu)?
            .at_most_one()
            .map_err(|_| AtMostOneRowSnafu.build())?
            .transpose()
            .context(DeSnafu)?
            // A counter update can race a delete & leave behind a row with no public id; that's
            // as good as gone.
            .and_then(|(video_id, uuid, likes, dislikes, views)| {
                uuid.map(|uuid| VideoCounterSnapshot {
                    video_id,
                    uuid,
                    likes: likes.map(from_bigint),
                    dislikes: dislikes.map(from_bigint),
                    views: views.map(from_bigint),
                })
            })
            .pipe(Ok)
    }
}

fn from_bigint(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn to_bigint(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_limit(count: usize) -> Result<i32> {
    i32::try_from(count).context(CountOORSnafu { count })
}

/// ScyllaDB's default cap on the size of a clustering key `IN` list
/// (`max_clustering_key_restrictions_per_query`)
const MAX_IDS_PER_DELETE: usize = 100;

/// Split `ids` into lists small enough for a single `delete ... where id in ?`
fn delete_chunks(ids: &HashSet<RequestId>) -> Vec<Vec<RequestId>> {
    ids.iter()
        .copied()
        .sorted()
        .collect::<Vec<_>>()
        .chunks(MAX_IDS_PER_DELETE)
        .map(<[RequestId]>::to_vec)
        .collect()
}

/// A row in a batch built from a [Transaction]; the statements in such a batch take different
/// bind values, so we need a single type that can serialize as any of them.
enum BatchRow {
    Request((PeerId, RequestId, String, VideoId, DateTime<Utc>)),
    Counter((i64, VideoId)),
}

impl SerializeRow for BatchRow {
    fn serialize(
        &self,
        ctx: &RowSerializationContext<'_>,
        writer: &mut RowWriter<'_>,
    ) -> StdResult<(), SerializationError> {
        match self {
            BatchRow::Request(row) => row.serialize(ctx, writer),
            BatchRow::Counter(row) => row.serialize(ctx, writer),
        }
    }
    fn is_empty(&self) -> bool {
        false
    }
}

use storage::Error as StorError;

impl From<Error> for StorError {
    fn from(value: Error) -> Self {
        StorError::new(value)
    }
}

impl From<ExecutionError> for StorError {
    fn from(value: ExecutionError) -> Self {
        StorError::new(QuerySnafu.into_error(value))
    }
}

impl From<IntoRowsResultError> for StorError {
    fn from(value: IntoRowsResultError) -> Self {
        StorError::new(IntoRowsResultSnafu.into_error(value))
    }
}

impl From<RowsError> for StorError {
    fn from(value: RowsError) -> Self {
        StorError::new(TypedRowsSnafu.into_error(value))
    }
}

impl From<DeserializationError> for StorError {
    fn from(value: DeserializationError) -> Self {
        StorError::new(DeSnafu.into_error(value))
    }
}

#[async_trait]
impl RequestStore for Session {
    async fn commit(&self, txn: Transaction) -> StdResult<(), StorError> {
        if txn.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::new(BatchType::Logged);
        let mut values: Vec<BatchRow> = Vec::with_capacity(txn.len());
        txn.into_iter().for_each(|write| match write {
            Write::InsertRequest(request) => {
                batch.append_statement(self.statement(PreparedStatements::InsertRequest).clone());
                values.push(BatchRow::Request((
                    request.peer_id(),
                    request.id(),
                    request.raw_kind().to_owned(),
                    request.video_id(),
                    request.created(),
                )));
            }
            Write::SetCounter {
                video_id,
                kind,
                value,
            } => {
                batch.append_statement(
                    self.statement(PreparedStatements::set_counter(kind))
                        .clone(),
                );
                values.push(BatchRow::Counter((to_bigint(value), video_id)));
            }
        });
        self.session.batch(&batch, values).await?;
        Ok(())
    }

    async fn list_grouped_by_peer(
        &self,
        max_peers: usize,
        max_per_peer: usize,
    ) -> StdResult<HashMap<PeerId, Vec<PendingRequest>>, StorError> {
        if 0 == max_peers || 0 == max_per_peer {
            return Ok(HashMap::new());
        }
        let per_peer = to_limit(max_per_peer)?;

        // Resume where the last selection left off, wrapping around to the start of the ring if
        // we run off the end.
        let after = self.cursor.lock().ok().and_then(|cursor| *cursor);
        let mut peers = self.pending_peers(after, max_peers).await?;
        if after.is_some() && peers.len() < max_peers {
            let seen = peers.iter().map(|(_, peer)| *peer).collect::<HashSet<_>>();
            let wrapped = self.pending_peers(None, max_peers - peers.len()).await?;
            peers.extend(wrapped.into_iter().filter(|(_, peer)| !seen.contains(peer)));
        }
        if let Ok(mut cursor) = self.cursor.lock() {
            *cursor = peers.last().map(|(token, _)| *token);
        }

        let mut groups = HashMap::with_capacity(peers.len());
        for (_, peer) in peers {
            let requests = self
                .session
                .execute_unpaged(
                    self.statement(PreparedStatements::SelectRequests),
                    (peer, per_peer),
                )
                .await?
                .into_rows_result()?
                .rows::<PendingRequest>()?
                .collect::<StdResult<Vec<PendingRequest>, _>>()?;
            // The partition may have been emptied since we listed it.
            if !requests.is_empty() {
                groups.insert(peer, requests);
            }
        }
        debug!(
            "Selected {} pending requests for {} peers.",
            groups.values().map(Vec::len).sum::<usize>(),
            groups.len()
        );
        Ok(groups)
    }

    async fn delete_requests(
        &self,
        peer: &PeerId,
        ids: &HashSet<RequestId>,
    ) -> StdResult<(), StorError> {
        let mut chunks = delete_chunks(ids);
        match chunks.len() {
            0 => (),
            1 => {
                self.session
                    .execute_unpaged(
                        self.statement(PreparedStatements::DeleteRequests),
                        (peer, chunks.remove(0)),
                    )
                    .await?;
            }
            _ => {
                // Every statement targets the one partition, so the batch is atomic & isolated
                // without going through the batch log.
                let mut batch = Batch::new(BatchType::Unlogged);
                chunks.iter().for_each(|_| {
                    batch.append_statement(
                        self.statement(PreparedStatements::DeleteRequests).clone(),
                    )
                });
                let values = chunks
                    .into_iter()
                    .map(|chunk| (peer, chunk))
                    .collect::<Vec<_>>();
                self.session.batch(&batch, values).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PeerDirectory for Session {
    async fn list_peer_ids(&self) -> StdResult<Vec<PeerId>, StorError> {
        self.session
            .execute_unpaged(self.statement(PreparedStatements::SelectPeerIds), ())
            .await?
            .into_rows_result()?
            .rows::<(PeerId,)>()?
            .map(|row| row.map(|(peer,)| peer))
            .collect::<StdResult<Vec<PeerId>, _>>()?
            .into_iter()
            .sorted()
            .collect::<Vec<_>>()
            .pipe(Ok)
    }

    async fn peer(&self, id: &PeerId) -> StdResult<Option<Peer>, StorError> {
        self.session
            .execute_unpaged(self.statement(PreparedStatements::SelectPeer), (id,))
            .await?
            .into_rows_result()?
            .rows::<(PeerId, String)>()?
            .at_most_one()
            .map_err(|_| StorError::new(AtMostOneRowSnafu.build()))?
            .transpose()?
            .map(|(id, origin)| {
                Url::parse(&origin)
                    .context(InvalidOriginSnafu { peer: id, origin })
                    .map(|origin| Peer::new(id, origin))
            })
            .transpose()
            .map_err(StorError::new)
    }
}

#[async_trait]
impl VideoCounters for Session {
    async fn video_counters(
        &self,
        video: &VideoId,
    ) -> StdResult<Option<VideoCounterSnapshot>, StorError> {
        Ok(self.snapshot(video).await?)
    }

    async fn apply_remote_update(&self, update: &QaduVideoUpdate) -> StdResult<bool, StorError> {
        let video_id = self
            .session
            .execute_unpaged(
                self.statement(PreparedStatements::SelectVideoByUuid),
                (update.uuid,),
            )
            .await?
            .into_rows_result()?
            .rows::<(VideoId,)>()?
            .at_most_one()
            .map_err(|_| StorError::new(AtMostOneRowSnafu.build()))?
            .transpose()?
            .map(|(id,)| id);
        let Some(video_id) = video_id else {
            return Ok(false);
        };

        let mut batch = Batch::new(BatchType::Logged);
        let mut values = Vec::new();
        update.counters().for_each(|(kind, value)| {
            batch.append_statement(
                self.statement(PreparedStatements::set_counter(kind))
                    .clone(),
            );
            values.push((to_bigint(value), video_id));
        });
        if !values.is_empty() {
            self.session.batch(&batch, values).await?;
        }
        Ok(true)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       schema management                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Execute each statement in `cql`, in order
///
/// Statements are separated by semicolons; lines beginning with "--" are comments. The last
/// statement in each schema file is expected to record its version in `schema_migrations`.
pub async fn create_schema(session: Arc<ScyllaSession>, cql: &str) -> Result<()> {
    let text = cql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .join("\n");
    for stmt in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        debug!("Executing {stmt}");
        session
            .query_unpaged(stmt, ())
            .await
            .context(SchemaSnafu {
                stmt: stmt.to_owned(),
            })?;
    }
    info!("Applied {} statements.", text.split(';').filter(|s| !s.trim().is_empty()).count());
    Ok(())
}

/// The most recently applied schema version, or `None` if the keyspace hasn't been created yet
pub async fn get_current_schema_version(session: &ScyllaSession) -> Result<Option<u32>> {
    let exists = session
        .query_unpaged(
            "select keyspace_name from system_schema.keyspaces where keyspace_name=?",
            (KEYSPACE,),
        )
        .await
        .context(QuerySnafu)?
        .into_rows_result()
        .context(IntoRowsResultSnafu)?
        .rows_num()
        > 0;
    if !exists {
        return Ok(None);
    }
    session
        .query_unpaged("select version from qadu.schema_migrations", ())
        .await
        .context(QuerySnafu)?
        .into_rows_result()
        .context(IntoRowsResultSnafu)?
        .rows::<(i32,)>()
        .context(TypedRowsSnafu)?
        .map(|row| row.map(|(v,)| v))
        .collect::<StdResult<Vec<i32>, _>>()
        .context(DeSnafu)?
        .into_iter()
        .filter_map(|v| u32::try_from(v).ok())
        .max()
        .pipe(Ok)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deletes_are_chunked() {
        assert!(delete_chunks(&HashSet::new()).is_empty());

        let ids = (0..250).map(|_| RequestId::generate()).collect::<HashSet<_>>();
        let chunks = delete_chunks(&ids);
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![100, 100, 50]
        );
        assert_eq!(chunks.into_iter().flatten().collect::<HashSet<_>>(), ids);

        let ids = (0..MAX_IDS_PER_DELETE)
            .map(|_| RequestId::generate())
            .collect::<HashSet<_>>();
        assert_eq!(delete_chunks(&ids).len(), 1);
    }
}
