// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One client connection: negotiate, authorize, then serve requests until the
//! client hangs up.
//!
//! Protocol violations end the connection without a response. Valid requests
//! that fail are answered with an `Error` carrying the full context chain.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use msd_proto::{FdTransport, Request, Response, accept_version};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthorizationGate, PeerCredentials};
use crate::gadget::Gadget;

/// State shared by every connection.
pub struct DaemonContext {
    gadget: Mutex<Gadget>,
    gate: Box<dyn AuthorizationGate>,
}

impl DaemonContext {
    pub fn new(gadget: Gadget, gate: Box<dyn AuthorizationGate>) -> Self {
        Self {
            gadget: Mutex::new(gadget),
            gate,
        }
    }

    /// All gadget access is serialized through this lock.
    pub fn gadget(&self) -> MutexGuard<'_, Gadget> {
        self.gadget.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn handle_client<T: FdTransport + ?Sized>(
    context: &DaemonContext,
    transport: &mut T,
    peer: &PeerCredentials,
) -> Result<()> {
    let session_id = msd_logging::correlation_id();

    let version = accept_version(transport).context("Failed to negotiate protocol version")?;
    debug!(operation = "handle_client", session_id = %session_id, version, "Protocol version accepted");

    // A refused connection still gets an answer to every request.
    let refusal = match context.gate.authorize(peer) {
        Ok(()) => None,
        Err(err) => {
            let message = format!("{err:#}");
            if peer.is_self() {
                error!(operation = "authorize", session_id = %session_id, error = %message, "Connected to self; SELinux rules are broken");
            } else {
                warn!(operation = "authorize", session_id = %session_id, error = %message, "Refusing requests on this connection");
            }
            Some(message)
        }
    };

    let mut served = 0usize;
    loop {
        let request = match Request::read_from(transport) {
            Ok(request) => request,
            Err(e) if e.is_eof() => {
                debug!(operation = "handle_client", session_id = %session_id, served, "Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to receive request"),
        };

        let response = match &refusal {
            None => dispatch(context, request, &session_id),
            Some(message) => Response::error(message.clone()),
        };
        response
            .write_to(transport)
            .with_context(|| format!("Failed to send response: {}", response.name()))?;
        served += 1;
    }
}

/// Run one request against the gadget. Received descriptors are closed when
/// this returns.
pub fn dispatch(context: &DaemonContext, request: Request, session_id: &str) -> Response {
    let name = request.name();
    debug!(operation = "dispatch", session_id = %session_id, request = name, "Processing request");

    let result = {
        let gadget = context.gadget();
        match &request {
            Request::GetFunctions => gadget.functions().map(Response::GetFunctionsResult),
            Request::SetMassStorage(devices) => {
                gadget.apply(devices).map(|()| Response::SetMassStorageAck)
            }
            Request::GetMassStorage => gadget.active_devices().map(Response::GetMassStorageResult),
        }
    };
    drop(request);

    let result = result.and_then(|response| {
        response.validate().context("Response cannot be encoded")?;
        Ok(response)
    });

    match result {
        Ok(response) => {
            info!(operation = "dispatch", session_id = %session_id, request = name, response = response.name(), "Request succeeded");
            response
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(operation = "dispatch", session_id = %session_id, request = name, error = %message, "Request failed");
            Response::error(message)
        }
    }
}
