//! Controllers by device serial
//!
//! The registry is the only state shared between devices. It refuses a
//! second claim on a serial that is already driven and forgets a controller
//! once it retires.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use super::controller::{ChainSettings, Controller};
use super::transport::Transport;
use crate::core::Work;
use crate::error::{Error, Result};

/// Active controllers keyed by serial
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    controllers: Mutex<HashMap<String, Arc<Controller>>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create and register a controller for `settings.serial`
    pub fn claim(
        self: &Arc<Self>,
        settings: ChainSettings,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Controller>> {
        let mut controllers = self.controllers.lock();
        if controllers.contains_key(&settings.serial) {
            return Err(Error::DeviceInUse(settings.serial));
        }

        let serial = settings.serial.clone();
        let model = settings.model;
        let controller = Controller::new(settings, transport);
        controller.attach(Arc::downgrade(self));
        controllers.insert(serial.clone(), Arc::clone(&controller));
        info!(serial = %serial, model = %model, "device claimed");
        Ok(controller)
    }

    /// Whether `serial` is driven by a controller
    pub fn in_use(&self, serial: &str) -> bool {
        self.controllers.lock().contains_key(serial)
    }

    /// Controller for `serial`
    pub fn get(&self, serial: &str) -> Option<Arc<Controller>> {
        self.controllers.lock().get(serial).cloned()
    }

    /// Forget `serial`; returns the controller if it was registered
    pub fn unregister(&self, serial: &str) -> Option<Arc<Controller>> {
        let removed = self.controllers.lock().remove(serial);
        if removed.is_some() {
            info!(serial = %serial, "device released");
        }
        removed
    }

    /// Registered serials, sorted
    pub fn serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.controllers.lock().keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Number of registered controllers
    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    /// Whether no controller is registered
    pub fn is_empty(&self) -> bool {
        self.controllers.lock().is_empty()
    }

    /// Give every controller its own copy of `work`.
    ///
    /// Each copy gets a differently shuffled version order so devices do not
    /// search the same headers. Returns how many controllers accepted it.
    pub fn update_work(&self, work: &Work) -> usize {
        let controllers: Vec<Arc<Controller>> = self.controllers.lock().values().cloned().collect();
        let mut rng = StdRng::from_os_rng();
        let mut accepted = 0;
        for controller in controllers {
            let mut copy = work.clone();
            copy.versions.shuffle(&mut rng);
            match controller.update_work(copy) {
                Ok(()) => accepted += 1,
                Err(err) => warn!(serial = %controller.serial(), error = %err, "work not delivered"),
            }
        }
        accepted
    }

    /// Close and forget every controller
    pub fn close_all(&self) {
        let drained: Vec<Arc<Controller>> = self.controllers.lock().drain().map(|(_, c)| c).collect();
        for controller in drained {
            if let Err(err) = controller.close() {
                warn!(serial = %controller.serial(), error = %err, "close failed");
            }
        }
    }
}
