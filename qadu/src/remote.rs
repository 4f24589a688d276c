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

//! # Receiving quick-and-dirty updates
//!
//! The other end of [transport](crate::transport): peers POST lists of [QaduVideoUpdate]s to
//! [QADU_ENDPOINT_PATH] & we apply each to our copy of the video. Updates for videos we've never
//! heard of are ignored.
//!
//! Note that we don't authenticate the sending pod.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use tracing::{debug, error};

use crate::{
    counter_add, define_metric,
    entities::{QADU_ENDPOINT_PATH, QaduVideoUpdate},
    http::ErrorResponseBody,
    metrics::{Instruments, Sort},
    qadu::Qadu,
    storage::{self, VideoCounters},
};

define_metric! { "remote.updates.applied", remote_updates_applied, Sort::IntegralCounter }
define_metric! { "remote.updates.unknown", remote_updates_unknown, Sort::IntegralCounter }

/// What became of a list of incoming updates
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Applied {
    pub applied: usize,
    pub unknown: usize,
}

/// Apply `updates` in order, stopping at the first storage failure
pub async fn apply_updates<B: VideoCounters + ?Sized>(
    backend: &B,
    updates: &[QaduVideoUpdate],
    instruments: &Instruments,
) -> Result<Applied, storage::Error> {
    let mut result = Applied::default();
    for update in updates {
        if backend.apply_remote_update(update).await? {
            result.applied += 1;
        } else {
            debug!("No video with public id {}; ignoring.", update.uuid);
            result.unknown += 1;
        }
    }
    counter_add!(instruments, remote_updates_applied, result.applied as u64, &[]);
    counter_add!(instruments, remote_updates_unknown, result.unknown as u64, &[]);
    Ok(result)
}

async fn receive_updates(
    State(state): State<Arc<Qadu>>,
    Json(updates): Json<Vec<QaduVideoUpdate>>,
) -> axum::response::Response {
    match apply_updates(state.backend().as_ref(), &updates, state.instruments()).await {
        Ok(Applied { applied, unknown }) => {
            debug!("Applied {applied} remote updates ({unknown} for unknown videos).");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!("Failed to apply remote updates: {err}");
            ErrorResponseBody {
                error: format!("{err}"),
            }
            .with_status(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response()
        }
    }
}

pub fn make_router(state: Arc<Qadu>) -> Router {
    Router::new()
        .route(QADU_ENDPOINT_PATH, post(receive_updates))
        .with_state(state)
}
