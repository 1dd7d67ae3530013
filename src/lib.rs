// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements the coordination core of a rank-parallel job:
 * the small set of protocols that let N cooperating processes act like
 * one program with one progress bar and one output file. It has three
 * tightly related parts:
 *
 *   - A _progress aggregation protocol_: every worker process
 *     periodically reports fractional completion for named operations;
 *     a root merges the partial, unordered, asynchronously-arriving
 *     reports into a single best-known value per operation (the slowest
 *     rank wins, so progress is never overstated), forwards it to a
 *     controlling client, and guarantees a clean "nothing in flight"
 *     state at the end of a phase even when workers report late or
 *     never.
 *
 *   - A _value agreement collective_: before an operation that depends
 *     on per-process-opened resources, the ranks that actually computed
 *     a value (a version number, a table size) verify they all computed
 *     the same one, and the canonical copy is broadcast to every rank,
 *     including those that had nothing to compute it from.
 *
 *   - A _partitioned gather/reduce_ for output writing: ranks are split
 *     into IO groups, each group's partitions are gathered to an
 *     elected root, empty partitions are dropped, survivors are merged
 *     and a sequential writer produces one artifact per group.
 *
 * The price of this simplicity is a discipline the caller must keep:
 *
 *   - Collective calls are synchronous. Every rank of a group must make
 *     them in matching order or the group deadlocks; any code path that
 *     can skip one on some ranks must let the peers skip it too.
 *
 *   - Each rank is cooperative and single-threaded. Nothing here locks
 *     against concurrent mutation within a rank; a handler, its store
 *     and its pending receive belong to exactly one owner.
 *
 * Transport is abstracted behind a small controller trait. Injecting a
 * [`NullController`] runs the same code single-process; injecting
 * in-process [`MeshController`] handles runs a whole multi-rank job
 * inside one test binary, one thread per rank.
 *
 * ## Name
 *
 * Wiktionary:
 *
 * > entente: a friendly understanding or agreement between two or more
 * > parties, especially nations
 *
 * The parties here being worker ranks, which must come to a friendly
 * understanding about versions, partitions and how done the job is.
 */

mod agreement;
mod context;
mod controller;
mod error;
mod handler;
mod mesh;
mod observe;
mod store;
mod wire;
mod writer;

pub use agreement::ValueAgreement;
pub use context::ProcessContext;
pub use controller::{
    Controller, ControllerExt, NullController, PendingReceive, Rank, ReduceOp, StrayHandler, Tag,
};
pub use error::{ProtocolError, Result};
pub use handler::{PhaseEvent, ProgressHandler, ThrottleClock, DEFAULT_PROGRESS_FREQUENCY};
pub use mesh::MeshController;
pub use observe::{ProgressEvent, ProgressRegistry, ProgressReporter};
pub use store::{ObjectId, ProgressReading, ProgressStore};
pub use wire::{ProgressFrame, CLEANUP_TAG, FRAME_LEN, PROGRESS_EVENT_TAG, PROGRESS_TEXT_CAP};
pub use writer::{
    group_color, Dataset, GroupAssignment, MergeFn, PartitionedWriteCoordinator, Piece,
    PreGatherFn, SequentialWriter,
};
