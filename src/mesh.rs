// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! In-process multi-rank transport.
//!
//! A `Fabric` holds one mailbox per (communicator, destination) pair;
//! every rank of every communicator built over the fabric owns a
//! `MeshController` handle. Handles are meant to be owned by a single
//! thread each, which keeps the per-rank discipline of the protocols
//! (cooperative, single-threaded per rank) intact while making blocking
//! collectives real: a collective call simply blocks its rank's thread
//! until the peers arrive.
//!
//! Collectives are composed from point-to-point transfers on reserved
//! negative tags, so they can never be confused with protocol traffic,
//! which uses non-negative tags.

use crate::controller::{Controller, ControllerExt, PendingReceive, Rank, ReduceOp, StrayHandler, Tag};
use crate::error::{ProtocolError, Result};
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use tracing::trace;

const GATHER_TAG: Tag = -1;
const BROADCAST_TAG: Tag = -2;
const BARRIER_ARRIVE_TAG: Tag = -3;
const BARRIER_COMPLETE_TAG: Tag = -4;

#[derive(Debug)]
struct Frame {
    src: Rank,
    tag: Tag,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Frame>>,
    arrived: Condvar,
}

/// Shared state behind every handle: the mailboxes and the
/// communicator-id counter.
pub struct Fabric {
    mailboxes: Mutex<HashMap<(u64, Rank), Arc<Mailbox>>>,
    next_comm: Mutex<u64>,
}

impl Fabric {
    fn new() -> Self {
        Fabric {
            mailboxes: Mutex::new(HashMap::new()),
            next_comm: Mutex::new(0),
        }
    }

    fn mailbox(&self, comm: u64, dest: Rank) -> Arc<Mailbox> {
        let mut map = self.mailboxes.lock().unwrap();
        map.entry((comm, dest)).or_default().clone()
    }

    // Reserve `count` consecutive communicator ids, returning the first.
    fn fresh_comms(&self, count: u64) -> u64 {
        let mut next = self.next_comm.lock().unwrap();
        let base = *next;
        *next += count;
        base
    }
}

/// One rank's endpoint of an in-process communicator.
pub struct MeshController {
    fabric: Arc<Fabric>,
    comm: u64,
    rank: Rank,
    size: usize,
    strays: Mutex<HashMap<Tag, StrayHandler>>,
}

impl MeshController {
    /// Create the world communicator: one handle per rank, all over one
    /// fresh fabric. Hand each handle to its own thread.
    pub fn world(size: usize) -> Vec<Arc<MeshController>> {
        assert!(size >= 1, "a process group has at least one member");
        let fabric = Arc::new(Fabric::new());
        let comm = fabric.fresh_comms(1);
        (0..size)
            .map(|rank| {
                Arc::new(MeshController {
                    fabric: fabric.clone(),
                    comm,
                    rank,
                    size,
                    strays: Mutex::new(HashMap::new()),
                })
            })
            .collect()
    }

    /// A connected two-process group, e.g. a client leg. Index 0 is
    /// conventionally the serving side.
    pub fn pair() -> (Arc<MeshController>, Arc<MeshController>) {
        let mut world = Self::world(2);
        let b = world.pop().unwrap();
        let a = world.pop().unwrap();
        (a, b)
    }

    fn own_mailbox(&self) -> Arc<Mailbox> {
        self.fabric.mailbox(self.comm, self.rank)
    }

    // Pull the first frame matching (src, tag) out of the queue. Frames
    // ahead of it whose tag has a registered stray handler are dispatched
    // and removed; anything else is left in place.
    fn pull_matching(
        &self,
        queue: &mut VecDeque<Frame>,
        src: Option<Rank>,
        tag: Option<Tag>,
    ) -> Option<Frame> {
        let strays = self.strays.lock().unwrap();
        let mut i = 0;
        while i < queue.len() {
            let wanted = tag.map_or(true, |t| queue[i].tag == t)
                && src.map_or(true, |s| queue[i].src == s);
            if wanted {
                return queue.remove(i);
            }
            match strays.get(&queue[i].tag) {
                Some(handler) => {
                    // remove() preserves the order of the rest.
                    if let Some(frame) = queue.remove(i) {
                        trace!(
                            "rank {} intercepted stray tag {} from {}",
                            self.rank,
                            frame.tag,
                            frame.src
                        );
                        let handler: &(dyn Fn(Rank, &[u8]) + Send + Sync) = &**handler;
                        handler(frame.src, &frame.bytes);
                    }
                }
                None => i += 1,
            }
        }
        None
    }

    fn blocking_receive(&self, src: Option<Rank>, tag: Option<Tag>) -> Result<Frame> {
        let mailbox = self.own_mailbox();
        let mut queue = mailbox.queue.lock().unwrap();
        loop {
            if let Some(frame) = self.pull_matching(&mut queue, src, tag) {
                return Ok(frame);
            }
            queue = mailbox.arrived.wait(queue).unwrap();
        }
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < self.size {
            Ok(())
        } else {
            Err(ProtocolError::Transport(format!(
                "rank {} out of range for a group of {}",
                rank, self.size
            )))
        }
    }
}

impl Controller for MeshController {
    fn num_processes(&self) -> usize {
        self.size
    }

    fn local_process_id(&self) -> Rank {
        self.rank
    }

    fn send_bytes(&self, buf: &[u8], dest: Rank, tag: Tag) -> Result<()> {
        self.check_rank(dest)?;
        let mailbox = self.fabric.mailbox(self.comm, dest);
        mailbox.queue.lock().unwrap().push_back(Frame {
            src: self.rank,
            tag,
            bytes: buf.to_vec(),
        });
        mailbox.arrived.notify_all();
        trace!("rank {} sent tag {} to {}", self.rank, tag, dest);
        Ok(())
    }

    fn receive_bytes(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        self.check_rank(src)?;
        Ok(self.blocking_receive(Some(src), Some(tag))?.bytes)
    }

    fn receive_any_tag(&self, src: Rank) -> Result<(Tag, Vec<u8>)> {
        self.check_rank(src)?;
        let frame = self.blocking_receive(Some(src), None)?;
        Ok((frame.tag, frame.bytes))
    }

    fn post_receive(&self, src: Option<Rank>, tag: Tag) -> Result<Box<dyn PendingReceive>> {
        if let Some(src) = src {
            self.check_rank(src)?;
        }
        Ok(Box::new(MeshPending {
            mailbox: self.own_mailbox(),
            src,
            tag,
        }))
    }

    fn gather_bytes(&self, buf: &[u8], root: Rank) -> Result<Option<Vec<Vec<u8>>>> {
        self.check_rank(root)?;
        if self.rank != root {
            self.send_bytes(buf, root, GATHER_TAG)?;
            return Ok(None);
        }
        let mut parts = vec![Vec::new(); self.size];
        parts[root] = buf.to_vec();
        for src in 0..self.size {
            if src != root {
                parts[src] = self.blocking_receive(Some(src), Some(GATHER_TAG))?.bytes;
            }
        }
        Ok(Some(parts))
    }

    fn broadcast_bytes(&self, buf: Option<Vec<u8>>, root: Rank) -> Result<Vec<u8>> {
        self.check_rank(root)?;
        if self.rank == root {
            let buf = buf.ok_or_else(|| {
                ProtocolError::Transport("broadcast root supplied no payload".to_string())
            })?;
            for dest in 0..self.size {
                if dest != root {
                    self.send_bytes(&buf, dest, BROADCAST_TAG)?;
                }
            }
            Ok(buf)
        } else {
            Ok(self.blocking_receive(Some(root), Some(BROADCAST_TAG))?.bytes)
        }
    }

    fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> Result<u64> {
        let gathered = self.gather(&value, 0)?;
        let reduced = gathered.map(|values| {
            values.into_iter().fold(value, |acc, v| match op {
                ReduceOp::Min => acc.min(v),
                ReduceOp::Max => acc.max(v),
            })
        });
        self.broadcast(reduced.as_ref(), 0)
    }

    fn barrier(&self) -> Result<()> {
        // Two-phase rendezvous through rank 0.
        if self.rank == 0 {
            for src in 1..self.size {
                self.blocking_receive(Some(src), Some(BARRIER_ARRIVE_TAG))?;
            }
            for dest in 1..self.size {
                self.send_bytes(&[], dest, BARRIER_COMPLETE_TAG)?;
            }
        } else {
            self.send_bytes(&[], 0, BARRIER_ARRIVE_TAG)?;
            self.blocking_receive(Some(0), Some(BARRIER_COMPLETE_TAG))?;
        }
        trace!("rank {} passed barrier", self.rank);
        Ok(())
    }

    fn partition(&self, color: usize, key: usize) -> Result<Arc<dyn Controller>> {
        // Rank 0 computes the grouping and reserves a fresh communicator
        // id per group, so every member agrees on sub-group identity.
        let gathered = self.gather(&(color as u64, key as u64), 0)?;
        let table: Vec<(u64, u64, u64)> = match gathered {
            Some(parts) => {
                let mut groups: BTreeMap<u64, Vec<(u64, Rank)>> = BTreeMap::new();
                for (rank, (color, key)) in parts.into_iter().enumerate() {
                    groups.entry(color).or_default().push((key, rank));
                }
                let base = self.fabric.fresh_comms(groups.len() as u64);
                let mut table = vec![(0u64, 0u64, 0u64); self.size];
                for (index, (_color, members)) in groups.into_iter().enumerate() {
                    let members = members.into_iter().sorted().collect::<Vec<_>>();
                    for (local, (_key, rank)) in members.iter().enumerate() {
                        table[*rank] = (base + index as u64, local as u64, members.len() as u64);
                    }
                }
                table
            }
            None => Vec::new(),
        };
        let table: Vec<(u64, u64, u64)> =
            self.broadcast(if self.rank == 0 { Some(&table) } else { None }, 0)?;
        let (comm, rank, size) = table[self.rank];
        trace!(
            "rank {} joins sub-communicator {} as rank {} of {}",
            self.rank,
            comm,
            rank,
            size
        );
        Ok(Arc::new(MeshController {
            fabric: self.fabric.clone(),
            comm,
            rank: rank as usize,
            size: size as usize,
            strays: Mutex::new(HashMap::new()),
        }))
    }

    fn register_stray_handler(&self, tag: Tag, handler: StrayHandler) {
        self.strays.lock().unwrap().insert(tag, handler);
    }
}

struct MeshPending {
    mailbox: Arc<Mailbox>,
    src: Option<Rank>,
    tag: Tag,
}

impl PendingReceive for MeshPending {
    fn test(&mut self) -> Option<(Rank, Vec<u8>)> {
        let mut queue = self.mailbox.queue.lock().unwrap();
        let position = queue
            .iter()
            .position(|f| f.tag == self.tag && self.src.map_or(true, |s| f.src == s))?;
        let frame = queue.remove(position)?;
        Some((frame.src, frame.bytes))
    }

    fn cancel(self: Box<Self>) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn run_ranks<F>(size: usize, f: F)
    where
        F: Fn(Arc<MeshController>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = MeshController::world(size)
            .into_iter()
            .map(|c| {
                let f = f.clone();
                thread::spawn(move || f(c))
            })
            .collect();
        for h in handles {
            h.join().expect("rank panicked");
        }
    }

    #[test]
    fn gather_orders_by_rank() {
        run_ranks(4, |c| {
            let rank = c.local_process_id() as u64;
            match c.gather(&rank, 0).unwrap() {
                Some(values) => assert_eq!(values, vec![0, 1, 2, 3]),
                None => assert_ne!(rank, 0),
            }
        });
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        run_ranks(3, |c| {
            let root = c.local_process_id() == 0;
            let v: u64 = c.broadcast(if root { Some(&42u64) } else { None }, 0).unwrap();
            assert_eq!(v, 42);
        });
    }

    #[test]
    fn all_reduce_min_max() {
        run_ranks(3, |c| {
            let rank = c.local_process_id() as u64;
            assert_eq!(c.all_reduce_u64(rank, ReduceOp::Max).unwrap(), 2);
            assert_eq!(c.all_reduce_u64(rank + 10, ReduceOp::Min).unwrap(), 10);
        });
    }

    #[test]
    fn partition_scopes_collectives_to_the_group() {
        run_ranks(6, |c| {
            let rank = c.local_process_id();
            let sub = c.partition(rank % 2, rank).unwrap();
            assert_eq!(sub.num_processes(), 3);
            // Sub-ranks are ordered by key: world 0,2,4 -> even group 0,1,2.
            assert_eq!(sub.local_process_id(), rank / 2);
            let gathered = sub.gather(&(rank as u64), 0).unwrap();
            if let Some(values) = gathered {
                let expect: Vec<u64> = if rank % 2 == 0 {
                    vec![0, 2, 4]
                } else {
                    vec![1, 3, 5]
                };
                assert_eq!(values, expect);
            }
            sub.barrier().unwrap();
        });
    }

    #[test]
    fn tag_selective_receive_skips_other_tags() {
        run_ranks(2, |c| {
            if c.local_process_id() == 0 {
                c.send_bytes(&[1], 1, 7).unwrap();
                c.send_bytes(&[2], 1, 8).unwrap();
            } else {
                // Ask for tag 8 first; the tag-7 frame stays queued.
                assert_eq!(c.receive_bytes(0, 8).unwrap(), vec![2]);
                assert_eq!(c.receive_bytes(0, 7).unwrap(), vec![1]);
            }
        });
    }

    #[test]
    fn stray_handler_intercepts_wrong_tag() {
        run_ranks(2, |c| {
            if c.local_process_id() == 0 {
                c.send_bytes(&[9], 1, 7).unwrap();
                c.send_bytes(&[0], 1, 8).unwrap();
            } else {
                let seen: Arc<Mutex<Vec<(Rank, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
                let sink = seen.clone();
                c.register_stray_handler(
                    7,
                    Arc::new(move |src: Rank, bytes: &[u8]| {
                        sink.lock().unwrap().push((src, bytes.to_vec()));
                    }),
                );
                // Blocking on tag 8 dispatches the tag-7 frame on the way.
                assert_eq!(c.receive_bytes(0, 8).unwrap(), vec![0]);
                assert_eq!(*seen.lock().unwrap(), vec![(0, vec![9])]);
            }
        });
    }

    #[test]
    fn pending_receive_completes_once() {
        run_ranks(2, |c| {
            if c.local_process_id() == 0 {
                c.barrier().unwrap();
                c.send_bytes(&[5], 1, 3).unwrap();
            } else {
                let mut req = c.post_receive(None, 3).unwrap();
                assert!(req.test().is_none());
                c.barrier().unwrap();
                loop {
                    if let Some((src, bytes)) = req.test() {
                        assert_eq!((src, bytes), (0, vec![5]));
                        break;
                    }
                    thread::yield_now();
                }
                assert!(req.test().is_none());
            }
        });
    }
}
