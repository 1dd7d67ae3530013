// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// A process's index within a parallel job, `0..num_processes`.
pub type Rank = usize;

/// Message tag. User-visible tags are non-negative; negative tags are
/// reserved for transport-internal collectives, so protocol traffic can
/// never be mistaken for collective plumbing.
pub type Tag = i32;

/// Reduction operators supported by `all_reduce_u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
}

/// Handler for frames whose tag differs from the one a blocking receive
/// asked for ("wrong tag" interception). Registered per tag; invoked with
/// the sender rank and the frame payload while some other receive or
/// collective is in progress on the same controller.
///
/// Handlers must not call back into the controller they are registered on.
pub type StrayHandler = Arc<dyn Fn(Rank, &[u8]) + Send + Sync>;

/// An outstanding non-blocking receive.
///
/// At most one of these is live per owner at a time; a completed request
/// must be fully drained before a new one is posted.
pub trait PendingReceive: Send {
    /// Poll for completion. On completion returns the sender rank and the
    /// payload; the request is then spent.
    fn test(&mut self) -> Option<(Rank, Vec<u8>)>;

    /// Abandon the request without consuming a message.
    fn cancel(self: Box<Self>);
}

/// Communication endpoint for one rank of a process group.
///
/// One instance exists per rank per group; sub-groups created by
/// `partition` get their own instances. Every collective method must be
/// called by every member of the group, in matching order, or the group
/// deadlocks: any code path that might skip a collective on some ranks
/// has to give the peer ranks a way to skip it too.
pub trait Controller: Send + Sync {
    fn num_processes(&self) -> usize;
    fn local_process_id(&self) -> Rank;

    /// Buffered point-to-point send; never blocks on the receiver.
    fn send_bytes(&self, buf: &[u8], dest: Rank, tag: Tag) -> Result<()>;

    /// Blocking tag-selective receive from `src`. Frames bearing a tag
    /// with a registered stray handler are dispatched while waiting.
    fn receive_bytes(&self, src: Rank, tag: Tag) -> Result<Vec<u8>>;

    /// Blocking receive of the next frame from `src` regardless of tag.
    fn receive_any_tag(&self, src: Rank) -> Result<(Tag, Vec<u8>)>;

    /// Post a non-blocking receive, from one rank or (with `None`) from
    /// any rank.
    fn post_receive(&self, src: Option<Rank>, tag: Tag) -> Result<Box<dyn PendingReceive>>;

    /// Gather every rank's buffer to `root`. Returns the per-rank buffers
    /// (indexed by rank) on the root, `None` elsewhere.
    fn gather_bytes(&self, buf: &[u8], root: Rank) -> Result<Option<Vec<Vec<u8>>>>;

    /// Broadcast the root's buffer to every rank. The root passes `Some`,
    /// everyone else `None`; all ranks return the root's buffer.
    fn broadcast_bytes(&self, buf: Option<Vec<u8>>, root: Rank) -> Result<Vec<u8>>;

    fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> Result<u64>;

    fn barrier(&self) -> Result<()>;

    /// Split the group by `color`: ranks sharing a color form a sub-group,
    /// ordered by `key` (ties broken by rank). Collective: every member
    /// must call it.
    fn partition(&self, color: usize, key: usize) -> Result<Arc<dyn Controller>>;

    /// Register the wrong-tag interception handler for `tag`, replacing
    /// any previous one.
    fn register_stray_handler(&self, tag: Tag, handler: StrayHandler);
}

/// Typed conveniences over the byte-level `Controller` interface.
pub trait ControllerExt: Controller {
    fn send<T: Serialize>(&self, value: &T, dest: Rank, tag: Tag) -> Result<()> {
        self.send_bytes(&bincode::serialize(value)?, dest, tag)
    }

    fn receive<T: DeserializeOwned>(&self, src: Rank, tag: Tag) -> Result<T> {
        Ok(bincode::deserialize(&self.receive_bytes(src, tag)?)?)
    }

    fn gather<T: Serialize + DeserializeOwned>(
        &self,
        value: &T,
        root: Rank,
    ) -> Result<Option<Vec<T>>> {
        match self.gather_bytes(&bincode::serialize(value)?, root)? {
            None => Ok(None),
            Some(parts) => {
                let mut values = Vec::with_capacity(parts.len());
                for part in &parts {
                    values.push(bincode::deserialize(part)?);
                }
                Ok(Some(values))
            }
        }
    }

    fn broadcast<T: Serialize + DeserializeOwned>(
        &self,
        value: Option<&T>,
        root: Rank,
    ) -> Result<T> {
        let buf = match value {
            Some(v) => Some(bincode::serialize(v)?),
            None => None,
        };
        Ok(bincode::deserialize(&self.broadcast_bytes(buf, root)?)?)
    }
}

impl<C: Controller + ?Sized> ControllerExt for C {}

/// The single-process strategy.
///
/// Single- and multi-process code paths share one implementation and are
/// distinguished only by which controller instance is injected; this one
/// has no peers, so collectives are local identities and point-to-point
/// traffic is a contract violation.
#[derive(Debug, Default)]
pub struct NullController;

impl Controller for NullController {
    fn num_processes(&self) -> usize {
        1
    }

    fn local_process_id(&self) -> Rank {
        0
    }

    fn send_bytes(&self, _buf: &[u8], dest: Rank, _tag: Tag) -> Result<()> {
        Err(ProtocolError::Transport(format!(
            "no peer rank {} in a single-process group",
            dest
        )))
    }

    fn receive_bytes(&self, src: Rank, _tag: Tag) -> Result<Vec<u8>> {
        Err(ProtocolError::Transport(format!(
            "no peer rank {} in a single-process group",
            src
        )))
    }

    fn receive_any_tag(&self, src: Rank) -> Result<(Tag, Vec<u8>)> {
        Err(ProtocolError::Transport(format!(
            "no peer rank {} in a single-process group",
            src
        )))
    }

    fn post_receive(&self, _src: Option<Rank>, _tag: Tag) -> Result<Box<dyn PendingReceive>> {
        Ok(Box::new(NeverReceive))
    }

    fn gather_bytes(&self, buf: &[u8], _root: Rank) -> Result<Option<Vec<Vec<u8>>>> {
        Ok(Some(vec![buf.to_vec()]))
    }

    fn broadcast_bytes(&self, buf: Option<Vec<u8>>, _root: Rank) -> Result<Vec<u8>> {
        buf.ok_or_else(|| {
            ProtocolError::Transport("broadcast root supplied no payload".to_string())
        })
    }

    fn all_reduce_u64(&self, value: u64, _op: ReduceOp) -> Result<u64> {
        Ok(value)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn partition(&self, _color: usize, _key: usize) -> Result<Arc<dyn Controller>> {
        Ok(Arc::new(NullController))
    }

    fn register_stray_handler(&self, _tag: Tag, _handler: StrayHandler) {}
}

// A receive that can never complete: there is nobody to send.
struct NeverReceive;

impl PendingReceive for NeverReceive {
    fn test(&mut self) -> Option<(Rank, Vec<u8>)> {
        None
    }

    fn cancel(self: Box<Self>) {}
}
