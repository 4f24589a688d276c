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

//! # qadu
//!
//! Quick-and-dirty propagation of video counters across a federation of pods.
//!
//! When a video's likes, dislikes or views change on this pod, every peer pod that knows about the
//! video should eventually hear about it. Rather than push synchronously, request handlers record
//! durable "pending request" facts (one per peer) & a periodic [scheduler] drains them in bounded,
//! de-duplicated batches.
//!
//! The pieces, bottom-up:
//!
//! - [storage]: the traits through which everything else touches persistent state, with
//!   [memory] & [scylla] implementations
//! - [builder]: turns a peer's pending facts into one de-duplicated batch
//! - [scheduler]: a generic, periodic "read, build, deliver, retire" loop
//! - [transport]: delivery of a batch to a peer over HTTP
//! - [qadu]: wires the above together for video counters & offers [qadu::Qadu::create_request]
//! - [remote]: the receiving end of a delivery

pub mod builder;
pub mod entities;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod qadu;
pub mod remote;
pub mod scheduler;
pub mod scylla;
pub mod storage;
pub mod transport;
pub mod util;
