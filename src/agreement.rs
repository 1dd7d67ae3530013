// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::context::ProcessContext;
use crate::controller::{Controller, ControllerExt};
use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Establishes a shared fact before a parallel operation proceeds.
///
/// The first `num_pieces` ranks have each computed a value independently
/// (say, a format version read from their slice of a partitioned
/// dataset); the remaining ranks had nothing to compute one from.
/// `sync_values` verifies the computed values are identical and, if so,
/// makes the canonical value visible on every rank.
///
/// Stateless and purely synchronous: every rank must call `sync_values`
/// with the same vector length and the same `num_pieces`, in matching
/// order with its peers, or the group deadlocks. The did-it-succeed check
/// is itself part of the collective sequence, so all ranks always make
/// the same calls regardless of local success or failure.
pub struct ValueAgreement {
    controller: Option<Arc<dyn Controller>>,
}

impl ValueAgreement {
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        ValueAgreement {
            controller: Some(controller),
        }
    }

    pub fn from_context(ctx: &ProcessContext) -> Self {
        Self::new(ctx.controller().clone())
    }

    /// An agreement with no resolvable controller: every sync fails fast
    /// without attempting a collective (attempting one would hang peers).
    pub fn detached() -> Self {
        ValueAgreement { controller: None }
    }

    /// Compare `data` across the first `num_pieces` ranks and broadcast
    /// the canonical copy to all ranks on agreement.
    ///
    /// On `Err(Disagreement)` every rank observes the same outcome and
    /// `data` is unspecified; the caller is expected to abort the larger
    /// operation, not retry.
    pub fn sync_values<T>(&self, what: &str, data: &mut [T], num_pieces: usize) -> Result<()>
    where
        T: Serialize + DeserializeOwned + PartialEq + Clone + Debug,
    {
        let controller = match &self.controller {
            Some(c) => c,
            None => return Err(ProtocolError::MissingController("sync_values")),
        };
        let root = controller.local_process_id() == 0;

        // Step 1: everyone contributes, with num_pieces riding along so
        // that agreement about participation itself is checked too.
        let contribution = (num_pieces as u64, data.to_vec());
        let gathered = controller.gather(&contribution, 0)?;

        // Step 2: compare on the root only. Ranks at or beyond num_pieces
        // produced no meaningful value and are skipped entirely.
        let verdict: i32 = match gathered {
            Some(parts) => {
                let (root_pieces, root_values) = &parts[0];
                let mut ok = true;
                for (rank, (pieces, values)) in parts.iter().enumerate().skip(1) {
                    if rank as u64 >= *root_pieces {
                        continue;
                    }
                    if pieces != root_pieces || values != root_values {
                        debug!("rank {} disagrees about {}: {:?}", rank, what, values);
                        ok = false;
                        break;
                    }
                }
                if ok {
                    1
                } else {
                    0
                }
            }
            None => 0, // unused off-root
        };

        // Step 3: every rank learns the same verdict.
        let verdict: i32 = controller.broadcast(if root { Some(&verdict) } else { None }, 0)?;
        if verdict == 0 {
            return Err(ProtocolError::Disagreement {
                what: what.to_string(),
            });
        }

        // Step 4: only on agreement, the canonical vector reaches every
        // rank -- including those that computed none.
        let canonical_src = if root { Some(data.to_vec()) } else { None };
        let canonical: Vec<T> = controller.broadcast(canonical_src.as_ref(), 0)?;
        if canonical.len() != data.len() {
            return Err(ProtocolError::Transport(format!(
                "agreement on {} returned {} values for {} slots",
                what,
                canonical.len(),
                data.len()
            )));
        }
        data.clone_from_slice(&canonical);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::NullController;

    #[test]
    fn detached_agreement_fails_before_any_collective() {
        let agreement = ValueAgreement::detached();
        let mut data = vec![1u32];
        match agreement.sync_values("Version", &mut data, 1) {
            Err(ProtocolError::MissingController(_)) => {}
            other => panic!("expected MissingController, got {:?}", other),
        }
    }

    #[test]
    fn single_process_agrees_with_itself() {
        let agreement = ValueAgreement::new(Arc::new(NullController));
        let mut data = vec![6u32, 9];
        agreement.sync_values("Version", &mut data, 1).unwrap();
        assert_eq!(data, vec![6, 9]);
    }
}
