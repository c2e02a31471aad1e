//! 服务与特征发现

use std::sync::Arc;

use log::{debug, warn};
use uuid::Uuid;

use super::central::{Inner, Outbox};
use super::characteristic::{Characteristic, CharacteristicEngine};
use super::codec::ProfileRegistry;
use super::transport::{DiscoveredCharacteristic, Request};
use super::{BleError, PeripheralId, ServiceRef, TransportError};
use crate::deferred::{Deferred, Promise};

/// 注册表中单个服务的状态
pub(crate) struct ServiceEntry {
    reference: ServiceRef,
    name: String,
    characteristics: Vec<CharacteristicEngine>,
    pending: Option<Promise<Vec<Uuid>>>,
}

impl ServiceEntry {
    pub(crate) fn new(peripheral: PeripheralId, uuid: Uuid, name: String) -> Self {
        Self {
            reference: ServiceRef::new(peripheral, uuid),
            name,
            characteristics: Vec::new(),
            pending: None,
        }
    }

    pub(crate) fn uuid(&self) -> Uuid {
        self.reference.uuid
    }

    pub(crate) fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicEngine> {
        self.characteristics.iter().find(|c| c.uuid() == *uuid)
    }

    pub(crate) fn characteristic_mut(&mut self, uuid: &Uuid) -> Option<&mut CharacteristicEngine> {
        self.characteristics.iter_mut().find(|c| c.uuid() == *uuid)
    }

    fn discover_characteristics(
        &mut self,
        uuids: Option<Vec<Uuid>>,
        outbox: &mut Outbox,
    ) -> Deferred<Vec<Uuid>> {
        let promise = Promise::new();
        let deferred = promise.deferred();
        if self.pending.replace(promise).is_some() {
            debug!("Superseding pending characteristic discovery on {}", self.reference);
        }
        outbox.request(Request::DiscoverCharacteristics {
            service: self.reference.clone(),
            uuids,
        });
        deferred
    }

    /// 以发现结果替换特征列表，并为有钩子的配置档安排回调
    pub(crate) fn did_discover_characteristics(
        &mut self,
        discovered: Vec<DiscoveredCharacteristic>,
        error: Option<TransportError>,
        profiles: &ProfileRegistry,
        outbox: &mut Outbox,
    ) {
        let pending = self.pending.take();
        if let Some(error) = error {
            warn!("Characteristic discovery on {} failed: {}", self.reference, error);
            if let Some(promise) = pending {
                promise.fail(BleError::Transport(error));
            }
            return;
        }

        let mut previous = std::mem::take(&mut self.characteristics);
        let mut uuids = Vec::with_capacity(discovered.len());
        for found in discovered {
            let engine = match previous.iter().position(|c| c.uuid() == found.uuid) {
                Some(index) => {
                    let mut engine = previous.swap_remove(index);
                    engine.set_properties(found.properties);
                    engine
                }
                None => {
                    let reference = self.reference.characteristic(found.uuid);
                    let profile = profiles.characteristic(&self.reference.uuid, &found.uuid);
                    if let Some(hook) = &profile.after_discovered {
                        outbox.discovered(hook.clone(), reference.clone());
                    }
                    CharacteristicEngine::new(reference, found.properties, profile)
                }
            };
            uuids.push(engine.uuid());
            self.characteristics.push(engine);
        }
        debug!(
            "Discovered {} characteristics on {}",
            uuids.len(),
            self.reference
        );
        if let Some(promise) = pending {
            promise.succeed(uuids);
        }
    }
}

/// 服务句柄
#[derive(Clone)]
pub struct Service {
    central: Arc<Inner>,
    reference: ServiceRef,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("reference", &self.reference)
            .finish()
    }
}

impl Service {
    pub(crate) fn new(central: Arc<Inner>, peripheral: PeripheralId, uuid: Uuid) -> Self {
        Self {
            central,
            reference: ServiceRef::new(peripheral, uuid),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.reference.uuid
    }

    pub fn reference(&self) -> &ServiceRef {
        &self.reference
    }

    pub fn name(&self) -> String {
        self.central
            .inspect(|registry| {
                registry
                    .peripheral(&self.reference.peripheral)
                    .and_then(|entry| entry.service(&self.reference.uuid))
                    .map(|entry| entry.name.clone())
            })
            .unwrap_or_else(|| self.central.profiles.service_name(&self.reference.uuid))
    }

    /// 发现该服务的特征（`None` 表示全部）
    pub fn discover_characteristics(
        &self,
        uuids: Option<Vec<Uuid>>,
    ) -> Deferred<Vec<Characteristic>> {
        let reference = self.reference.clone();
        let discovered = self.central.dispatch(|registry, outbox| {
            let Some(entry) = registry.existing_mut(&reference.peripheral) else {
                return Deferred::failed(BleError::PeripheralNotFound(reference.peripheral.clone()));
            };
            if !entry.is_connected() {
                return Deferred::failed(BleError::NotConnected(reference.peripheral.clone()));
            }
            match entry.service_mut(&reference.uuid) {
                Some(service) => service.discover_characteristics(uuids, outbox),
                None => Deferred::failed(BleError::ServiceNotFound(reference.uuid)),
            }
        });
        let central = self.central.clone();
        discovered.map(move |uuids| {
            uuids
                .into_iter()
                .map(|uuid| Characteristic::new(central.clone(), reference.characteristic(uuid)))
                .collect()
        })
    }

    /// 已发现的特征
    pub fn characteristics(&self) -> Vec<Characteristic> {
        let uuids: Vec<Uuid> = self.central.inspect(|registry| {
            registry
                .peripheral(&self.reference.peripheral)
                .and_then(|entry| entry.service(&self.reference.uuid))
                .map(|service| {
                    service
                        .characteristics
                        .iter()
                        .map(CharacteristicEngine::uuid)
                        .collect()
                })
                .unwrap_or_default()
        });
        uuids
            .into_iter()
            .map(|uuid| {
                Characteristic::new(self.central.clone(), self.reference.characteristic(uuid))
            })
            .collect()
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        let reference = self.reference.characteristic(uuid);
        let known = self
            .central
            .inspect(|registry| registry.characteristic(&reference).is_ok());
        known.then(|| Characteristic::new(self.central.clone(), reference))
    }
}
