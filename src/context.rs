// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::controller::{Controller, NullController, Rank};
use std::sync::Arc;

/// The process-local view of a deployment: the intra-group controller
/// plus the optional point-to-point legs to named peer roles.
///
/// Any leg may be absent depending on topology -- standalone,
/// client/server, or client/data/render three-tier all thread through the
/// same code paths, and a missing leg means "that leg doesn't exist", not
/// an error. Passing a context in explicitly (rather than consulting
/// ambient global state) is what lets tests run several independent
/// instances side by side.
#[derive(Clone)]
pub struct ProcessContext {
    controller: Arc<dyn Controller>,
    client: Option<Arc<dyn Controller>>,
    data_server: Option<Arc<dyn Controller>>,
    render_server: Option<Arc<dyn Controller>>,
    multi_clients: bool,
    client_role: bool,
}

impl ProcessContext {
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        ProcessContext {
            controller,
            client: None,
            data_server: None,
            render_server: None,
            multi_clients: false,
            client_role: false,
        }
    }

    /// A single process playing every role at once.
    pub fn standalone() -> Self {
        Self::new(Arc::new(NullController)).with_client_role(true)
    }

    pub fn with_client_leg(mut self, leg: Arc<dyn Controller>) -> Self {
        self.client = Some(leg);
        self
    }

    pub fn with_data_server_leg(mut self, leg: Arc<dyn Controller>) -> Self {
        self.data_server = Some(leg);
        self
    }

    pub fn with_render_server_leg(mut self, leg: Arc<dyn Controller>) -> Self {
        self.render_server = Some(leg);
        self
    }

    pub fn with_multi_clients(mut self, yes: bool) -> Self {
        self.multi_clients = yes;
        self
    }

    pub fn with_client_role(mut self, yes: bool) -> Self {
        self.client_role = yes;
        self
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    pub fn client(&self) -> Option<&Arc<dyn Controller>> {
        self.client.as_ref()
    }

    pub fn data_server(&self) -> Option<&Arc<dyn Controller>> {
        self.data_server.as_ref()
    }

    pub fn render_server(&self) -> Option<&Arc<dyn Controller>> {
        self.render_server.as_ref()
    }

    pub fn is_multi_clients(&self) -> bool {
        self.multi_clients
    }

    pub fn has_client_role(&self) -> bool {
        self.client_role
    }

    pub fn local_rank(&self) -> Rank {
        self.controller.local_process_id()
    }

    pub fn num_ranks(&self) -> usize {
        self.controller.num_processes()
    }

    pub fn is_local_root(&self) -> bool {
        self.local_rank() == 0
    }

    /// The peer rank on a two-process leg.
    pub fn leg_peer(leg: &Arc<dyn Controller>) -> Rank {
        debug_assert_eq!(leg.num_processes(), 2, "legs are two-process groups");
        1 - leg.local_process_id()
    }
}
