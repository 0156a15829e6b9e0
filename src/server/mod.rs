// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod batch;
pub mod conn;
pub mod ingest;
pub mod queue;

pub use batch::{BatchParser, IngestEvent, IngestSink};
pub use ingest::{IngestDeps, ServerHandle};
pub use queue::PacketQueue;
