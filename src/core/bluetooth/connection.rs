//! Peripheral connection state machine
//! Drives a peripheral through `Disconnected -> Connecting -> Ready ->
//! Disconnecting -> Disconnected`, retrying transient connect failures and
//! negotiating the MTU once per connection before reporting it ready.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::CentralConfig;
use crate::core::bluetooth::error::Error;
use crate::core::bluetooth::manager::Central;
use crate::core::bluetooth::queue::QueueHandle;
use crate::core::bluetooth::registry::{ConnectionHandler, PeripheralRecord, PeripheralState};
use crate::core::bluetooth::request::{Completion, Request};
use crate::core::bluetooth::transport::{ConnectionEventCallback, NativeTransport};
use crate::core::bluetooth::types::{
    ConnectionEvent, ConnectionEventReason, NativeHandle, PeripheralId, RequestOperation,
    RequestStatus,
};

/// Decides whether a failed connect attempt is silently re-issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectRetryPolicy {
    /// `None` retries until the connect request times out
    pub max_retries: Option<u32>,
}

impl ConnectRetryPolicy {
    pub fn new(max_retries: Option<u32>) -> Self {
        Self { max_retries }
    }

    /// Retries only `Timeout`/`AccessDenied` while the handle is valid and the
    /// request is still pending, up to `max_retries` times
    pub fn should_retry(
        &self,
        status: RequestStatus,
        retries_so_far: u32,
        handle_valid: bool,
        request_pending: bool,
    ) -> bool {
        status.is_transient_connect_failure()
            && handle_valid
            && request_pending
            && self.max_retries.is_none_or(|max| retries_so_far < max)
    }
}

impl From<&CentralConfig> for ConnectRetryPolicy {
    fn from(config: &CentralConfig) -> Self {
        Self::new(config.max_connect_retries)
    }
}

/// In-flight connect request of a peripheral
pub(crate) struct ConnectAttempt {
    completion: Completion<()>,
    retries: u32,
    /// The native connect primitive reported success
    acknowledged: bool,
}

impl ConnectAttempt {
    fn new(completion: Completion<()>) -> Self {
        Self {
            completion,
            retries: 0,
            acknowledged: false,
        }
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    fn finish(self, status: RequestStatus) {
        self.completion.settle_status(status);
    }
}

/// Native connection events, funneled onto the execution queue
fn connection_event_callback(
    queue: &QueueHandle<Central>,
    id: PeripheralId,
    handle_slot: Arc<OnceLock<NativeHandle>>,
) -> ConnectionEventCallback {
    let queue = queue.clone();
    Box::new(move |event, reason| {
        let handle = handle_slot.get().copied();
        let target = id.clone();
        queue.post_if_peripheral_known(id.clone(), move |central: &mut Central| {
            central.on_connection_event(&target, handle, event, reason);
        });
    })
}

/// Issues the native connect primitive and routes its result back to the queue
fn issue_connect(
    transport: &dyn NativeTransport,
    queue: &QueueHandle<Central>,
    id: &PeripheralId,
    record: &mut PeripheralRecord,
    handle: NativeHandle,
    auto_connect: bool,
) {
    record.state = PeripheralState::Connecting;

    let queue = queue.clone();
    let id = id.clone();
    transport.connect(
        handle,
        &record.required_services,
        auto_connect,
        Box::new(move |status| {
            let target = id.clone();
            queue.post_if_peripheral_known(id, move |central: &mut Central| {
                central.on_connect_result(&target, status);
            });
        }),
    );
}

/// Moves `record` to `Disconnected`, telling the caller if it was not already there
fn mark_disconnected(record: &mut PeripheralRecord) {
    record.mtu_requested = false;
    if record.state != PeripheralState::Disconnected {
        info!("[BLE:{}] Disconnected", record.name());
        record.state = PeripheralState::Disconnected;
        record.notify_connection(false);
    }
}

/// Invalidates the handle of `record` and drops the native connection behind it
fn release_handle(transport: &dyn NativeTransport, record: &mut PeripheralRecord) {
    let Some(handle) = record.handle.take() else {
        return;
    };
    let name = record.name().to_string();
    transport.disconnect(
        handle,
        Box::new(move |status| {
            debug!("[BLE:{}] Released native connection, result is `{:?}`", name, status);
        }),
    );
}

impl Central {
    /// Starts connecting `id`, creating its native handle if it has none
    pub(crate) fn begin_connect(
        &mut self,
        id: &PeripheralId,
        handler: ConnectionHandler,
        timeout: Duration,
    ) -> Result<Request<()>, Error> {
        let queue = self.queue.handle();
        let auto_connect = self.config.auto_connect;
        let transport = self.transport.clone();
        let record = self.registry.get_mut(id)?;

        if record.handle.is_none() {
            record.state = PeripheralState::Disconnected;
            record.mtu_requested = false;

            let handle_slot = Arc::new(OnceLock::new());
            let callback = connection_event_callback(&queue, id.clone(), handle_slot.clone());
            record.handle = transport.create_peripheral(&record.discovery, callback);
            match record.handle {
                Some(handle) => {
                    let _ = handle_slot.set(handle);
                    info!("[BLE:{}] Native peripheral created", record.name());
                }
                None => error!("[BLE:{}] Failed to create native peripheral", record.name()),
            }
        }

        let Some(handle) = record.handle else {
            return Ok(Request::failed(
                RequestOperation::ConnectPeripheral,
                RequestStatus::InvalidHandle,
            ));
        };

        if let Some(previous) = record.connect_attempt.take() {
            debug!("[BLE:{}] Superseding pending connect request", record.name());
            previous.finish(RequestStatus::Canceled);
        }

        let (request, completion) = Request::new(RequestOperation::ConnectPeripheral, timeout);
        let cancel_queue = queue.clone();
        let cancel_id = id.clone();
        let name = record.name().to_string();
        request.on_timeout(move || {
            warn!("[BLE:{}] Connection timeout, canceling...", name);
            cancel_queue.post_if_peripheral_known(cancel_id.clone(), move |central: &mut Central| {
                central.cancel_connect(&cancel_id);
            });
        });

        info!("[BLE:{}] Connecting with timeout of {:?}...", record.name(), timeout);
        record.connection_handler = Some(handler);
        record.connect_attempt = Some(ConnectAttempt::new(completion));
        issue_connect(transport.as_ref(), &queue, id, record, handle, auto_connect);

        self.track(&request);
        Ok(request)
    }

    /// Invalidates the handle of `id` right away and asks the native layer to disconnect
    pub(crate) fn begin_disconnect(
        &mut self,
        id: &PeripheralId,
        timeout: Duration,
    ) -> Result<Request<()>, Error> {
        let queue = self.queue.handle();
        let record = self.registry.get_mut(id)?;
        let handle = record.handle.take();

        if let Some(attempt) = record.connect_attempt.take() {
            attempt.finish(RequestStatus::Canceled);
        }

        let Some(handle) = handle else {
            debug!("[BLE:{}] Disconnect requested without a native handle", record.name());
            return Ok(Request::failed(
                RequestOperation::DisconnectPeripheral,
                RequestStatus::InvalidHandle,
            ));
        };

        info!("[BLE:{}] Disconnecting...", record.name());
        let (request, completion) = Request::new(RequestOperation::DisconnectPeripheral, timeout);
        self.transport
            .disconnect(handle, completion.status_callback(&queue));

        self.track(&request);
        Ok(request)
    }

    pub(crate) fn on_connect_result(&mut self, id: &PeripheralId, status: RequestStatus) {
        let queue = self.queue.handle();
        let auto_connect = self.config.auto_connect;
        let policy = self.retry_policy;
        let transport = self.transport.clone();
        let Ok(record) = self.registry.get_mut(id) else {
            return;
        };

        info!("[BLE:{}] Connect result is `{:?}`", record.name(), status);
        if record.connect_attempt.is_none() {
            debug!("[BLE:{}] No pending connect request", record.name());
            return;
        }
        let handle = record.handle;
        let Some(attempt) = record.connect_attempt.as_mut() else {
            return;
        };

        if policy.should_retry(status, attempt.retries, handle.is_some(), attempt.completion.is_pending()) {
            attempt.retries += 1;
            let retries = attempt.retries;
            info!("[BLE:{}] Re-connecting (retry {})...", record.name(), retries);
            if let Some(handle) = handle {
                issue_connect(transport.as_ref(), &queue, id, record, handle, auto_connect);
            }
        } else if status == RequestStatus::Success && handle.is_some() {
            attempt.acknowledged = true;
            if record.state == PeripheralState::Ready {
                if let Some(attempt) = record.connect_attempt.take() {
                    attempt.finish(RequestStatus::Success);
                }
            }
        } else if let Some(attempt) = record.connect_attempt.take() {
            // Give up, the request reports what the native layer said
            let expired = !attempt.completion.is_pending();
            attempt.finish(match status {
                RequestStatus::Success => RequestStatus::Canceled,
                status => status,
            });
            if expired {
                release_handle(transport.as_ref(), record);
            }
            mark_disconnected(record);
            self.subscriptions.remove_peripheral(id);
        }
    }

    pub(crate) fn on_connection_event(
        &mut self,
        id: &PeripheralId,
        handle: Option<NativeHandle>,
        event: ConnectionEvent,
        reason: ConnectionEventReason,
    ) {
        let queue = self.queue.handle();
        let max_mtu = self.config.max_mtu;
        let transport = self.transport.clone();
        let Ok(record) = self.registry.get_mut(id) else {
            return;
        };

        if let (Some(current), Some(handle)) = (record.handle, handle) {
            if current != handle {
                debug!("[BLE:{}] Ignoring `{:?}` from a released handle", record.name(), event);
                return;
            }
        }

        if reason == ConnectionEventReason::Success {
            info!(
                "[BLE:{}] Connection event `{:?}`, state was `{:?}`",
                record.name(),
                event,
                record.state
            );
        } else {
            info!(
                "[BLE:{}] Connection event `{:?}` with reason `{:?}`, state was `{:?}`",
                record.name(),
                event,
                reason,
                record.state
            );
        }

        match event {
            ConnectionEvent::Connecting => {
                // Native reconnect of a still valid handle
                if record.handle.is_some() && record.state == PeripheralState::Disconnected {
                    record.state = PeripheralState::Connecting;
                }
            }
            ConnectionEvent::Disconnecting => {
                if matches!(record.state, PeripheralState::Ready | PeripheralState::Connecting) {
                    record.state = PeripheralState::Disconnecting;
                }
            }
            ConnectionEvent::Ready => {
                let Some(handle) = record.handle else {
                    return;
                };
                if record.state == PeripheralState::Disconnected {
                    record.state = PeripheralState::Connecting;
                }
                if record.mtu_requested {
                    debug!("[BLE:{}] MTU already requested for this connection", record.name());
                    return;
                }
                record.mtu_requested = true;

                let target = id.clone();
                let id = id.clone();
                transport.request_mtu(
                    handle,
                    max_mtu,
                    Box::new(move |mtu, status| {
                        queue.post_if_peripheral_known(id, move |central: &mut Central| {
                            central.on_mtu_result(&target, mtu, status);
                        });
                    }),
                );
            }
            ConnectionEvent::Disconnected | ConnectionEvent::FailedToConnect => {
                mark_disconnected(record);
                self.subscriptions.remove_peripheral(id);
                if record
                    .connect_attempt
                    .as_ref()
                    .is_some_and(|attempt| attempt.acknowledged)
                {
                    if let Some(attempt) = record.connect_attempt.take() {
                        attempt.finish(RequestStatus::Disconnected);
                    }
                }
            }
        }
    }

    pub(crate) fn on_mtu_result(&mut self, id: &PeripheralId, mtu: u16, status: RequestStatus) {
        let Ok(record) = self.registry.get_mut(id) else {
            return;
        };

        let verb = if status == RequestStatus::Success { "changed to" } else { "kept at" };
        info!("[BLE:{}] MTU {} {} bytes", record.name(), verb, mtu);
        if !matches!(status, RequestStatus::Success | RequestStatus::NotSupported) {
            error!("[BLE:{}] Failed to change MTU, result is `{:?}`", record.name(), status);
        }

        if record.handle.is_none() {
            return;
        }
        if record.state != PeripheralState::Connecting {
            warn!(
                "[BLE:{}] MTU result while `{:?}`, not marking ready",
                record.name(),
                record.state
            );
            return;
        }

        info!("[BLE:{}] Ready", record.name());
        record.state = PeripheralState::Ready;
        record.notify_connection(true);

        if record
            .connect_attempt
            .as_ref()
            .is_some_and(|attempt| attempt.acknowledged)
        {
            if let Some(attempt) = record.connect_attempt.take() {
                attempt.finish(RequestStatus::Success);
            }
        }
    }

    /// Fails every pending connect request, used on shutdown
    pub(crate) fn abort_connect_attempts(&mut self) {
        for record in self.registry.iter_mut() {
            if let Some(attempt) = record.connect_attempt.take() {
                attempt.finish(RequestStatus::Canceled);
            }
        }
    }

    /// Ends the connection of `id` once its connect request timed out
    pub(crate) fn cancel_connect(&mut self, id: &PeripheralId) {
        let transport = self.transport.clone();
        let Ok(record) = self.registry.get_mut(id) else {
            return;
        };
        let timed_out = record
            .connect_attempt
            .as_ref()
            .is_some_and(|attempt| !attempt.completion.is_pending());
        if !timed_out {
            return;
        }
        if let Some(attempt) = record.connect_attempt.take() {
            debug!(
                "[BLE:{}] Connect request canceled after {} retries",
                record.name(),
                attempt.retries()
            );
        }
        release_handle(transport.as_ref(), record);
        mark_disconnected(record);
        self.subscriptions.remove_peripheral(id);
    }
}
