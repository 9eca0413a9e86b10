//! Characteristic subscriptions
//! Subscribing is a regular request (completed once the native layer
//! acknowledges it); value changes then flow through the execution queue to
//! the caller's handler until the characteristic is unsubscribed.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use log::{debug, info};

use crate::core::bluetooth::error::Error;
use crate::core::bluetooth::manager::Central;
use crate::core::bluetooth::request::Request;
use crate::core::bluetooth::types::{
    CharacteristicRef, PeripheralId, RequestOperation, RequestStatus,
};

/// Caller callback receiving the new value of a subscribed characteristic
pub type ValueHandler = Box<dyn FnMut(&[u8])>;

type SubscriptionKey = (PeripheralId, CharacteristicRef);

/// Value handlers per peripheral characteristic.
///
/// Each handler carries a token so values coming from a replaced
/// subscription never reach its successor.
#[derive(Default)]
pub(crate) struct Subscriptions {
    handlers: HashMap<SubscriptionKey, (u64, ValueHandler)>,
    next_token: u64,
}

impl Subscriptions {
    /// Registers `handler`, replacing any previous one, and returns its token
    pub(crate) fn insert(
        &mut self,
        id: PeripheralId,
        characteristic: CharacteristicRef,
        handler: ValueHandler,
    ) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        if self
            .handlers
            .insert((id, characteristic), (token, handler))
            .is_some()
        {
            debug!("[BLE] Replacing value handler of {:?}", characteristic.characteristic);
        }
        token
    }

    pub(crate) fn token(&self, id: &PeripheralId, characteristic: &CharacteristicRef) -> Option<u64> {
        self.handlers
            .get(&(id.clone(), *characteristic))
            .map(|(token, _)| *token)
    }

    /// Removes the handler only if it is still the one registered under `token`
    pub(crate) fn remove(&mut self, id: &PeripheralId, characteristic: &CharacteristicRef, token: u64) -> bool {
        match self.handlers.entry((id.clone(), *characteristic)) {
            Entry::Occupied(entry) if entry.get().0 == token => {
                entry.remove();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn dispatch(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
        token: u64,
        value: &[u8],
    ) -> bool {
        match self.handlers.get_mut(&(id.clone(), *characteristic)) {
            Some((current, handler)) if *current == token => {
                handler(value);
                true
            }
            _ => false,
        }
    }

    /// Drops every handler of `id`, their native streams ended with the connection
    pub(crate) fn remove_peripheral(&mut self, id: &PeripheralId) {
        self.handlers.retain(|(peripheral, _), _| peripheral != id);
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl Central {
    /// Subscribes to value changes of a characteristic.
    ///
    /// `on_value_changed` replaces any handler previously registered for the
    /// same characteristic and is dropped again if the subscription fails.
    pub fn subscribe_characteristic(
        &mut self,
        id: &PeripheralId,
        characteristic: CharacteristicRef,
        timeout: Duration,
        on_value_changed: impl FnMut(&[u8]) + 'static,
    ) -> Result<Request<()>, Error> {
        let record = self.registry.get(id)?;
        let Some(handle) = record.handle else {
            debug!("[BLE:{}] Subscribe rejected, no native handle", record.name());
            return Ok(Request::failed(
                RequestOperation::SubscribeCharacteristic,
                RequestStatus::InvalidHandle,
            ));
        };
        info!(
            "[BLE:{}] Subscribing to {} (instance {})",
            record.name(),
            characteristic.characteristic,
            characteristic.instance
        );

        let token = self
            .subscriptions
            .insert(id.clone(), characteristic, Box::new(on_value_changed));
        let (request, completion) = Request::new(RequestOperation::SubscribeCharacteristic, timeout);

        let values = {
            let queue = self.queue.handle();
            let id = id.clone();
            Box::new(move |value: Vec<u8>| {
                let target = id.clone();
                queue.post_if_peripheral_known(id.clone(), move |central: &mut Central| {
                    central
                        .subscriptions
                        .dispatch(&target, &characteristic, token, &value);
                });
            })
        };
        let on_result = {
            let queue = self.queue.handle();
            let id = id.clone();
            Box::new(move |status: RequestStatus| {
                queue.post(move |central: &mut Central| {
                    if status != RequestStatus::Success && completion.is_pending() {
                        central.subscriptions.remove(&id, &characteristic, token);
                    }
                    completion.settle_status(status);
                });
            })
        };
        self.transport
            .subscribe_characteristic(handle, &characteristic, values, on_result);

        self.track(&request);
        Ok(request)
    }

    /// Unsubscribes from a characteristic, its handler is dropped once the native layer confirms
    pub fn unsubscribe_characteristic(
        &mut self,
        id: &PeripheralId,
        characteristic: CharacteristicRef,
        timeout: Duration,
    ) -> Result<Request<()>, Error> {
        let record = self.registry.get(id)?;
        let Some(handle) = record.handle else {
            return Ok(Request::failed(
                RequestOperation::UnsubscribeCharacteristic,
                RequestStatus::InvalidHandle,
            ));
        };
        info!("[BLE:{}] Unsubscribing from {}", record.name(), characteristic.characteristic);

        let token = self.subscriptions.token(id, &characteristic);
        let (request, completion) = Request::new(RequestOperation::UnsubscribeCharacteristic, timeout);
        let queue = self.queue.handle();
        let id = id.clone();
        self.transport.unsubscribe_characteristic(
            handle,
            &characteristic,
            Box::new(move |status| {
                queue.post(move |central: &mut Central| {
                    if status == RequestStatus::Success {
                        if let Some(token) = token {
                            central.subscriptions.remove(&id, &characteristic, token);
                        }
                    }
                    completion.settle_status(status);
                });
            }),
        );

        self.track(&request);
        Ok(request)
    }

    /// Number of characteristics with a registered value handler
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
