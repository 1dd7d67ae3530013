// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::context::ProcessContext;
use crate::controller::{Controller, PendingReceive, Rank};
use crate::observe::{ProgressRegistry, ProgressReporter};
use crate::store::{ObjectId, ProgressReading, ProgressStore};
use crate::wire::{ProgressFrame, CLEANUP_TAG, PROGRESS_EVENT_TAG};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Default minimum interval between forwarded progress updates, seconds.
pub const DEFAULT_PROGRESS_FREQUENCY: f64 = 2.0;

/// Rate limiter for one transmission direction.
///
/// Boundary readings (at or below 0, at or above 1) always pass, so the
/// start and completion of an operation are never dropped; everything in
/// between is limited to one transmission per period. Each direction
/// (to-root, to-client) owns its own clock.
#[derive(Debug)]
pub struct ThrottleClock {
    period: Duration,
    last: Option<Instant>,
}

impl ThrottleClock {
    pub fn new(period: Duration) -> Self {
        ThrottleClock { period, last: None }
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Would a reading of `fraction` be transmitted now? Advances the
    /// clock when it answers yes.
    pub fn permits(&mut self, fraction: f64) -> bool {
        if fraction <= 0.0 || fraction >= 1.0 {
            self.last = Some(Instant::now());
            return true;
        }
        match self.last {
            Some(t) if t.elapsed() < self.period => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Notifications emitted when a progress phase starts and ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    End,
}

/// Collects progress for one process of a parallel phase and moves it up
/// the process hierarchy: satellites -> local root -> client.
///
/// Lifecycle per phase: `prepare_progress` enables the handler,
/// `refresh_progress` runs on every locally observed report (and may be
/// called periodically), `cleanup_pending_progress` performs the teardown
/// handshake and guarantees no progress is left in flight even when some
/// workers report late or never.
///
/// Progress traffic is non-blocking so a worker that should be computing
/// is never stalled by reporting; only the teardown handshake blocks,
/// because teardown must not proceed until every party has drained its
/// queues.
pub struct ProgressHandler {
    ctx: ProcessContext,
    registry: ProgressRegistry,
    store: ProgressStore,
    handling_enabled: bool,
    enabled: bool,
    strays_attached: bool,
    strays: Arc<Mutex<VecDeque<Vec<u8>>>>,
    async_slot: Option<Box<dyn PendingReceive>>,
    force_async_received: bool,
    frames_delivered: usize,
    to_root_clock: ThrottleClock,
    to_client_clock: ThrottleClock,
    display: Option<Box<dyn FnMut(&ProgressReading) + Send>>,
    notify: Option<Box<dyn FnMut(PhaseEvent) + Send>>,
}

impl ProgressHandler {
    pub fn new(ctx: ProcessContext) -> Self {
        let ranks = ctx.num_ranks();
        let period = Duration::from_secs_f64(DEFAULT_PROGRESS_FREQUENCY);
        ProgressHandler {
            ctx,
            registry: ProgressRegistry::new(),
            store: ProgressStore::new(ranks),
            handling_enabled: true,
            enabled: false,
            strays_attached: false,
            strays: Arc::new(Mutex::new(VecDeque::new())),
            async_slot: None,
            force_async_received: false,
            frames_delivered: 0,
            to_root_clock: ThrottleClock::new(period),
            to_client_clock: ThrottleClock::new(period),
            display: None,
            notify: None,
        }
    }

    /// Minimum interval between transmitted mid-range updates.
    pub fn set_progress_frequency(&mut self, seconds: f64) {
        let period = Duration::from_secs_f64(seconds.max(0.0));
        self.to_root_clock.set_period(period);
        self.to_client_clock.set_period(period);
    }

    /// Global kill switch; a disabled handler ignores the whole phase
    /// lifecycle.
    pub fn set_handling_enabled(&mut self, yes: bool) {
        self.handling_enabled = yes;
    }

    /// Hook invoked with each delivered reading on processes holding the
    /// CLIENT role.
    pub fn on_display<F>(&mut self, f: F)
    where
        F: FnMut(&ProgressReading) + Send + 'static,
    {
        self.display = Some(Box::new(f));
    }

    /// Hook invoked at phase start and end.
    pub fn on_phase<F>(&mut self, f: F)
    where
        F: FnMut(PhaseEvent) + Send + 'static,
    {
        self.notify = Some(Box::new(f));
    }

    /// Register a locally observed operation under a caller-assigned id.
    pub fn register_source(&self, object_id: ObjectId) -> ProgressReporter {
        self.registry.register(object_id)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Rows currently tracked; an ended phase leaves none.
    pub fn pending_rows(&self) -> usize {
        self.store.len()
    }

    /// Frames received from peers over the handler's lifetime.
    pub fn frames_delivered(&self) -> usize {
        self.frames_delivered
    }

    /// Begin a parallel phase. A no-op when handling is globally disabled
    /// or when the session serves multiple simultaneous clients (there
    /// would be no single client to notify).
    pub fn prepare_progress(&mut self) {
        if !self.handling_enabled {
            debug!("progress handling disabled, not preparing");
            return;
        }
        if self.ctx.is_multi_clients() {
            debug!("multi-client session, progress reporting unsupported");
            return;
        }
        if let Some(notify) = &mut self.notify {
            notify(PhaseEvent::Start);
        }
        self.enabled = true;
        // Wrong-tag listeners go on the server legs exactly once per
        // handler lifetime: progress arriving while this process is
        // blocked in an unrelated exchange on those legs is intercepted
        // and parked for the next refresh.
        if !self.strays_attached {
            self.strays_attached = true;
            let legs = [
                self.ctx.data_server().cloned(),
                self.ctx.render_server().cloned(),
            ];
            for leg in legs.iter().flatten() {
                let parked = self.strays.clone();
                leg.register_stray_handler(
                    PROGRESS_EVENT_TAG,
                    Arc::new(move |_src: Rank, bytes: &[u8]| {
                        parked.lock().unwrap().push_back(bytes.to_vec());
                    }),
                );
            }
        }
        debug!("rank {} progress phase prepared", self.ctx.local_rank());
    }

    /// Move progress along: drain local reports into the store, exchange
    /// with peers, forward to the client, display locally.
    ///
    /// Called whenever a registered source reports, and safe to call
    /// periodically; a disabled handler ignores it.
    pub fn refresh_progress(&mut self) {
        if !self.enabled {
            return;
        }
        for event in self.registry.drain() {
            self.store
                .add_local_progress(event.object_id, &event.text, event.fraction);
        }
        self.gather_progress();

        // Only consume a reading where there is somewhere to put it: a
        // client leg to forward along or a local display.
        let has_client_leg = self.ctx.client().is_some();
        if !has_client_leg && !self.ctx.has_client_role() {
            return;
        }
        let reading = match self.store.try_get_progress() {
            Some(r) => r,
            None => return,
        };
        if let Some(client) = self.ctx.client().cloned() {
            if self.to_client_clock.permits(reading.fraction) {
                let frame = ProgressFrame::new(
                    self.ctx.local_rank(),
                    reading.object_id,
                    reading.fraction,
                    &reading.text,
                );
                let peer = ProcessContext::leg_peer(&client);
                // Reporting failures degrade to "no progress shown".
                if let Err(e) = client.send_bytes(&frame.encode(), peer, PROGRESS_EVENT_TAG) {
                    debug!("progress not forwarded to client: {}", e);
                }
            }
        }
        if self.ctx.has_client_role() {
            if let Some(display) = &mut self.display {
                display(&reading);
            }
        }
    }

    // Step one of a refresh: move per-rank readings toward the local
    // root, and collect anything peers or legs have already delivered.
    fn gather_progress(&mut self) {
        if self.ctx.num_ranks() > 1 {
            if self.ctx.is_local_root() {
                self.receive_progress_from_satellites();
            } else {
                self.send_progress_to_local_root();
            }
        }
        self.poll_server_legs();
        self.drain_parked_strays();
    }

    fn send_progress_to_local_root(&mut self) {
        let reading = match self.store.try_get_progress() {
            Some(r) => r,
            None => return,
        };
        if !self.to_root_clock.permits(reading.fraction) {
            return;
        }
        let controller = self.ctx.controller().clone();
        let frame = ProgressFrame::new(
            controller.local_process_id(),
            reading.object_id,
            reading.fraction,
            &reading.text,
        );
        if let Err(e) = controller.send_bytes(&frame.encode(), 0, PROGRESS_EVENT_TAG) {
            debug!("progress not sent to local root: {}", e);
        }
    }

    // Drain every buffered satellite message in one pass: consume the
    // completed receive, repost, and check again, so bursty arrivals do
    // not wait for further refresh calls. At most one receive is ever
    // outstanding.
    fn receive_progress_from_satellites(&mut self) {
        let controller = self.ctx.controller().clone();
        loop {
            if self.async_slot.is_none() {
                match controller.post_receive(None, PROGRESS_EVENT_TAG) {
                    Ok(request) => self.async_slot = Some(request),
                    Err(e) => {
                        debug!("cannot post satellite receive: {}", e);
                        return;
                    }
                }
            }
            match self.async_slot.as_mut().and_then(|r| r.test()) {
                Some((_src, bytes)) => {
                    self.async_slot = None;
                    self.deliver_frame(&bytes);
                }
                // Not completed; leave the receive posted for next time.
                None => return,
            }
        }
    }

    // Poll the server legs for progress that arrived without a blocking
    // receive in progress to intercept it.
    fn poll_server_legs(&mut self) {
        let legs = [
            self.ctx.data_server().cloned(),
            self.ctx.render_server().cloned(),
        ];
        for leg in legs.iter().flatten() {
            let peer = ProcessContext::leg_peer(leg);
            loop {
                let mut request = match leg.post_receive(Some(peer), PROGRESS_EVENT_TAG) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("cannot poll server leg: {}", e);
                        break;
                    }
                };
                match request.test() {
                    Some((_src, bytes)) => self.deliver_frame(&bytes),
                    None => {
                        request.cancel();
                        break;
                    }
                }
            }
        }
    }

    fn drain_parked_strays(&mut self) {
        loop {
            let bytes = match self.strays.lock().unwrap().pop_front() {
                Some(b) => b,
                None => break,
            };
            self.deliver_frame(&bytes);
        }
    }

    fn deliver_frame(&mut self, bytes: &[u8]) {
        match ProgressFrame::decode(bytes) {
            Ok(frame) => {
                trace!(
                    "rank {} got progress: object {} at {}% from rank {}",
                    self.ctx.local_rank(),
                    frame.object_id,
                    frame.percent,
                    frame.rank
                );
                self.frames_delivered += 1;
                self.store.add_remote_progress(
                    frame.rank.max(0) as Rank,
                    frame.object_id,
                    &frame.text,
                    frame.fraction(),
                );
            }
            Err(e) => debug!("discarding malformed progress frame: {}", e),
        }
    }

    /// End the phase: drain every queue, handshake with every party, and
    /// leave no progress in flight.
    ///
    /// Satellites hand the local root a cleanup token; the root consumes
    /// each satellite's trailing progress up to its token, replies to the
    /// client leg, and waits for the server legs' replies. The handshake
    /// receives are blocking by design -- teardown must not proceed until
    /// all parties are known drained -- which is exactly why ordinary
    /// progress receives are non-blocking and tagged differently.
    pub fn cleanup_pending_progress(&mut self) {
        if !self.handling_enabled {
            return;
        }
        if !self.enabled {
            // Contract violation by the caller, not a runtime failure.
            error!("cleanup requested before progress handling was enabled");
            return;
        }
        let controller = self.ctx.controller().clone();
        if controller.num_processes() > 1 {
            if self.ctx.is_local_root() {
                self.resolve_async_slot();
                for satellite in 1..controller.num_processes() {
                    self.drain_satellite_until_token(&*controller, satellite);
                }
            } else if let Err(e) = controller.send_bytes(&[0u8], 0, CLEANUP_TAG) {
                debug!("cleanup token not sent to local root: {}", e);
            }
        }
        if let Some(client) = self.ctx.client().cloned() {
            let peer = ProcessContext::leg_peer(&client);
            if let Err(e) = client.send_bytes(&[0u8], peer, CLEANUP_TAG) {
                debug!("cleanup token not sent to client: {}", e);
            }
        }
        let legs = [
            self.ctx.data_server().cloned(),
            self.ctx.render_server().cloned(),
        ];
        for leg in legs.iter().flatten() {
            let peer = ProcessContext::leg_peer(leg);
            // Progress still in flight on the leg is intercepted by the
            // wrong-tag listener while we block here.
            if let Err(e) = leg.receive_bytes(peer, CLEANUP_TAG) {
                debug!("no cleanup token from server leg: {}", e);
            }
        }
        self.drain_parked_strays();
        self.store.clear();
        self.force_async_received = false;
        self.to_root_clock.reset();
        self.to_client_clock.reset();
        self.enabled = false;
        if let Some(notify) = &mut self.notify {
            notify(PhaseEvent::End);
        }
        debug!("rank {} progress phase cleaned up", self.ctx.local_rank());
    }

    // A message that raced teardown is still delivered into the store
    // before the store is cleared; only a receive that never completed
    // (and was not force-marked received) is cancelled.
    fn resolve_async_slot(&mut self) {
        if let Some(mut request) = self.async_slot.take() {
            if self.force_async_received {
                drop(request);
            } else if let Some((_src, bytes)) = request.test() {
                self.deliver_frame(&bytes);
            } else {
                request.cancel();
            }
        }
    }

    fn drain_satellite_until_token(&mut self, controller: &dyn Controller, satellite: Rank) {
        loop {
            match controller.receive_any_tag(satellite) {
                Ok((CLEANUP_TAG, _)) => break,
                Ok((PROGRESS_EVENT_TAG, bytes)) => self.deliver_frame(&bytes),
                Ok((tag, _)) => {
                    debug!("discarding tag {} from rank {} during cleanup", tag, satellite)
                }
                Err(e) => {
                    debug!("satellite {} unreachable during cleanup: {}", satellite, e);
                    break;
                }
            }
        }
    }

    /// Declare the outstanding receive satisfied without data, unsticking
    /// cleanup when the caller knows no more is coming (e.g. the peer is
    /// gone).
    pub fn mark_async_request_received(&mut self) {
        self.force_async_received = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn throttle_always_passes_boundaries() {
        let mut clock = ThrottleClock::new(Duration::from_secs(3600));
        assert!(clock.permits(0.0));
        assert!(clock.permits(1.0));
        assert!(clock.permits(-0.5));
        assert!(clock.permits(2.0));
    }

    #[test]
    fn throttle_suppresses_mid_range_inside_period() {
        let mut clock = ThrottleClock::new(Duration::from_secs(3600));
        assert!(clock.permits(0.5));
        assert!(!clock.permits(0.6));
        assert!(!clock.permits(0.7));
        // Boundary still passes, and restarts the period.
        assert!(clock.permits(1.0));
        assert!(!clock.permits(0.1));
    }

    #[test]
    fn throttle_period_elapse_permits_again() {
        let mut clock = ThrottleClock::new(Duration::from_millis(10));
        assert!(clock.permits(0.5));
        assert!(!clock.permits(0.5));
        thread::sleep(Duration::from_millis(20));
        assert!(clock.permits(0.5));
    }

    #[test]
    fn standalone_phase_lifecycle() {
        let mut handler = ProgressHandler::new(ProcessContext::standalone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handler.on_display(move |r| sink.lock().unwrap().push(r.clone()));
        let phases = Arc::new(Mutex::new(Vec::new()));
        let psink = phases.clone();
        handler.on_phase(move |p| psink.lock().unwrap().push(p));

        handler.prepare_progress();
        assert!(handler.is_enabled());
        let reporter = handler.register_source(42);
        reporter.report("Filter A", 0.25);
        handler.refresh_progress();
        reporter.report("Filter A", 1.0);
        handler.refresh_progress();
        handler.cleanup_pending_progress();

        assert!(!handler.is_enabled());
        assert_eq!(handler.pending_rows(), 0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].fraction, 0.25);
        assert_eq!(seen[1].fraction, 1.0);
        assert_eq!(
            phases.lock().unwrap().as_slice(),
            &[PhaseEvent::Start, PhaseEvent::End]
        );
    }

    #[test]
    fn multi_client_session_never_enables() {
        let ctx = ProcessContext::standalone().with_multi_clients(true);
        let mut handler = ProgressHandler::new(ctx);
        handler.prepare_progress();
        assert!(!handler.is_enabled());
    }

    #[test]
    fn globally_disabled_handler_ignores_lifecycle() {
        let mut handler = ProgressHandler::new(ProcessContext::standalone());
        handler.set_handling_enabled(false);
        handler.prepare_progress();
        assert!(!handler.is_enabled());
        // Does not log the contract-violation path either; just returns.
        handler.cleanup_pending_progress();
    }

    #[test]
    fn cleanup_before_prepare_is_a_noop() {
        let mut handler = ProgressHandler::new(ProcessContext::standalone());
        handler.cleanup_pending_progress();
        assert!(!handler.is_enabled());
        assert_eq!(handler.pending_rows(), 0);
    }
}
