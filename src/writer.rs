// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Partitioned gather/reduce for serial output writing.
//!
//! A group of ranks elects sub-group roots, gathers distributed
//! partitions of a dataset to those roots, merges them deterministically
//! and hands the merged result to a sequential writer -- with support for
//! partial participation (empty partitions are dropped) and for
//! sub-setting the IO fan-in (not every rank needs to write).

use crate::controller::{Controller, ControllerExt, NullController, Rank, ReduceOp};
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How ranks are assigned to IO groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupAssignment {
    /// Contiguous blocks of ranks, sized within one of each other.
    Contiguous,
    /// `rank % groups`.
    RoundRobin,
}

/// The group color of `rank` among `num_procs` ranks split into
/// `num_groups` groups. Contiguous assignment yields exactly `num_groups`
/// distinct colors with group sizes differing by at most one.
pub fn group_color(
    rank: Rank,
    num_procs: usize,
    num_groups: usize,
    assignment: GroupAssignment,
) -> usize {
    debug_assert!(num_groups >= 1 && num_groups <= num_procs && rank < num_procs);
    match assignment {
        GroupAssignment::RoundRobin => rank % num_groups,
        GroupAssignment::Contiguous => {
            let base = num_procs / num_groups;
            let remainder = num_procs % num_groups;
            // The first `remainder` blocks carry one extra rank.
            let big_span = (base + 1) * remainder;
            if rank < big_span {
                rank / (base + 1)
            } else {
                remainder + (rank - big_span) / base
            }
        }
    }
}

/// One writable partition of a dataset.
///
/// A piece is empty when every attribute association holds zero elements;
/// empty pieces are dropped before merging so they never produce spurious
/// output artifacts.
pub trait Piece: Clone + Serialize + DeserializeOwned + Send + 'static {
    fn is_empty(&self) -> bool;
}

/// A possibly-composite input: either one piece or a collection of
/// top-level blocks, each independently written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Dataset<P> {
    Piece(P),
    Composite(Vec<Dataset<P>>),
}

impl<P: Clone> Dataset<P> {
    pub fn top_level_blocks(&self) -> usize {
        match self {
            Dataset::Piece(_) => 1,
            Dataset::Composite(children) => children.len(),
        }
    }

    fn block(&self, index: usize) -> Option<&Dataset<P>> {
        match self {
            Dataset::Piece(_) => {
                if index == 0 {
                    Some(self)
                } else {
                    None
                }
            }
            Dataset::Composite(children) => children.get(index),
        }
    }

    /// Flatten nested composites into a flat piece list.
    pub fn flatten(&self) -> Vec<P> {
        match self {
            Dataset::Piece(p) => vec![p.clone()],
            Dataset::Composite(children) => {
                children.iter().flat_map(|c| c.flatten()).collect()
            }
        }
    }
}

/// A single-process writer producing one artifact per invocation.
pub trait SequentialWriter<P> {
    fn set_input(&mut self, data: P);
    fn set_file_name(&mut self, path: &str);
    fn write(&mut self) -> Result<()>;
}

pub type PreGatherFn<P> = Box<dyn Fn(P) -> P + Send>;
pub type MergeFn<P> = Box<dyn Fn(Vec<P>) -> P + Send>;

/// Coordinates one write operation across a process group.
///
/// Each write recomputes the IO-group layout from the current process
/// count and the configured IO-rank target, gathers each group's pieces
/// to the group root and hands the merged result to the sequential
/// writer; the layout is discarded when the operation ends.
pub struct PartitionedWriteCoordinator<P: Piece> {
    controller: Arc<dyn Controller>,
    file_name: String,
    num_io_ranks: usize,
    assignment: GroupAssignment,
    pre_gather: Option<PreGatherFn<P>>,
    merge: Option<MergeFn<P>>,
    time_steps: usize,
    my_color: Option<usize>,
}

impl<P: Piece> PartitionedWriteCoordinator<P> {
    pub fn new(controller: Arc<dyn Controller>, file_name: &str) -> Self {
        PartitionedWriteCoordinator {
            controller,
            file_name: file_name.to_string(),
            num_io_ranks: 1,
            assignment: GroupAssignment::Contiguous,
            pre_gather: None,
            merge: None,
            time_steps: 0,
            my_color: None,
        }
    }

    /// Target IO fan-in. Clamped to `1..=num_processes` at write time;
    /// `0` means every rank writes its own partition independently (no
    /// sub-grouping, no gather).
    pub fn set_number_of_io_ranks(&mut self, n: usize) {
        self.num_io_ranks = n;
    }

    pub fn set_group_assignment(&mut self, assignment: GroupAssignment) {
        self.assignment = assignment;
    }

    /// Transform applied to each local piece before it is gathered.
    pub fn set_pre_gather<F>(&mut self, f: F)
    where
        F: Fn(P) -> P + Send + 'static,
    {
        self.pre_gather = Some(Box::new(f));
    }

    /// Transform combining the gathered non-empty pieces of one group.
    /// Required whenever more than one piece survives; without it only
    /// the first survivor is written, with a warning.
    pub fn set_merge<F>(&mut self, f: F)
    where
        F: Fn(Vec<P>) -> P + Send + 'static,
    {
        self.merge = Some(Box::new(f));
    }

    /// Enable time-series mode with the given number of steps.
    pub fn set_number_of_time_steps(&mut self, n: usize) {
        self.time_steps = n;
    }

    /// The color this rank was assigned by the most recent write.
    pub fn io_group_color(&self) -> Option<usize> {
        self.my_color
    }

    /// Write one dataset. Collective: every rank of the controller's
    /// group must call it with a congruent input shape. A final barrier
    /// leaves all ranks observing a consistent post-write state.
    pub fn write(&mut self, input: &Dataset<P>, writer: &mut dyn SequentialWriter<P>) -> Result<()> {
        self.write_step(input, writer, None)?;
        self.controller.barrier()
    }

    /// Drive the request/continue cycle over the configured time steps:
    /// produce and write one dataset per step, signalling continuation
    /// until the count is exhausted, then synchronize all ranks.
    pub fn write_time_series<F>(
        &mut self,
        mut produce: F,
        writer: &mut dyn SequentialWriter<P>,
    ) -> Result<()>
    where
        F: FnMut(usize) -> Dataset<P>,
    {
        let steps = self.time_steps.max(1);
        for step in 0..steps {
            let input = produce(step);
            let stamp = if self.time_steps > 0 { Some(step) } else { None };
            self.write_step(&input, writer, stamp)?;
            trace!(
                "time step {} written, continue={}",
                step,
                step + 1 < steps
            );
        }
        self.controller.barrier()
    }

    fn write_step(
        &mut self,
        input: &Dataset<P>,
        writer: &mut dyn SequentialWriter<P>,
        time_step: Option<usize>,
    ) -> Result<()> {
        let num_procs = self.controller.num_processes();
        let rank = self.controller.local_process_id();

        // Resolve the fan-in; 0 is the every-rank-writes-itself mode.
        let independent = self.num_io_ranks == 0;
        let groups = if independent {
            num_procs
        } else {
            self.num_io_ranks.max(1).min(num_procs)
        };
        let color = if independent {
            rank
        } else {
            group_color(rank, num_procs, groups, self.assignment)
        };
        self.my_color = Some(color);

        // The group controller scopes the gather. One global root needs
        // no sub-communicator; independent mode gathers from nobody.
        let group: Arc<dyn Controller> = if independent {
            Arc::new(NullController)
        } else if groups == 1 {
            self.controller.clone()
        } else {
            self.controller.partition(color, rank)?
        };

        // Ranks may disagree on how many top-level blocks they carry;
        // writing is collective, so settle on the global maximum first.
        let local_blocks = input.top_level_blocks() as u64;
        let num_blocks = if independent {
            local_blocks as usize
        } else {
            self.controller
                .all_reduce_u64(local_blocks, ReduceOp::Max)? as usize
        };
        let indexed = num_blocks > 1 || matches!(input, Dataset::Composite(_));
        let digits = (num_blocks as f64).log10() as usize + 1;

        for block in 0..num_blocks {
            // Local contribution, pre-transformed and flattened. A rank
            // without this block still joins the gather, empty-handed.
            let mut local: Vec<P> = input
                .block(block)
                .map(|d| d.flatten())
                .unwrap_or_default();
            if let Some(f) = &self.pre_gather {
                local = local.into_iter().map(f).collect();
            }
            let gathered = group.gather(&local, 0)?;
            let parts = match gathered {
                Some(parts) => parts,
                None => continue, // not this group's root
            };
            let pieces: Vec<P> = parts
                .into_iter()
                .flatten()
                .filter(|p| !p.is_empty())
                .collect();
            if pieces.is_empty() {
                debug!("block {}: all pieces empty, nothing to write", block);
                continue;
            }
            let merged = self.merge_pieces(pieces);
            let name = derive_file_name(
                &self.file_name,
                if indexed { Some((block, digits)) } else { None },
                if groups > 1 { Some(color) } else { None },
                time_step,
            );
            trace!("group {} writing block {} to {}", color, block, name);
            writer.set_input(merged);
            writer.set_file_name(&name);
            writer.write()?;
        }
        Ok(())
    }

    fn merge_pieces(&self, mut pieces: Vec<P>) -> P {
        if pieces.len() == 1 {
            return pieces.remove(0);
        }
        match &self.merge {
            Some(merge) => merge(pieces),
            None => {
                warn!(
                    "{} gathered pieces but no merge helper; writing the first piece only",
                    pieces.len()
                );
                pieces.remove(0)
            }
        }
    }
}

// `stem[_<block>][.g<color>][.t<step>].ext`: the block index is
// zero-padded to the given width; the color suffix keeps distinct IO
// roots from colliding on one path.
fn derive_file_name(
    base: &str,
    block: Option<(usize, usize)>,
    color: Option<usize>,
    time_step: Option<usize>,
) -> String {
    let (stem, ext) = match base.rfind('.') {
        Some(dot) if dot > 0 => (&base[..dot], Some(&base[dot + 1..])),
        _ => (base, None),
    };
    let mut name = stem.to_string();
    if let Some((index, digits)) = block {
        name.push_str(&format!("_{:0width$}", index, width = digits));
    }
    if let Some(color) = color {
        name.push_str(&format!(".g{}", color));
    }
    if let Some(step) = time_step {
        name.push_str(&format!(".t{}", step));
    }
    if let Some(ext) = ext {
        name.push('.');
        name.push_str(ext);
    }
    name
}
