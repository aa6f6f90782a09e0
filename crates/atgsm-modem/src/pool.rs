//! ModemPool -- one [`GsmModem`] per port, opened on first use.
//!
//! A gateway usually drives several modems. The pool keys them by port
//! name: the first [`open`](ModemPool::open) of a port builds the modem
//! from a template builder, runs [`GsmModem::initialize`], and caches it;
//! later calls return the cached handle.
//!
//! # Example
//!
//! ```no_run
//! use atgsm_core::driver::{Driver, DriverSet};
//! use atgsm_modem::{GsmModemBuilder, ModemPool};
//!
//! # async fn example() -> atgsm_core::Result<()> {
//! let mut drivers = DriverSet::new();
//! drivers.add(Driver::derive("Huawei", &Driver::generic()))?;
//!
//! let pool = ModemPool::new(GsmModemBuilder::new().detect_driver(drivers));
//! let first = pool.open("/dev/ttyUSB0").await?;
//! let second = pool.open("/dev/ttyUSB2").await?;
//! println!("{} {}", first.driver().name(), second.driver().name());
//! pool.disconnect_all().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use atgsm_core::error::Result;
use atgsm_core::transport::Transport;

use crate::builder::GsmModemBuilder;
use crate::modem::GsmModem;

/// Opens the stream behind a port name.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, port: &str) -> Result<Box<dyn Transport>>;
}

/// Registry of started modems keyed by port.
pub struct ModemPool {
    template: GsmModemBuilder,
    factory: Option<Arc<dyn TransportFactory>>,
    modems: Mutex<HashMap<String, Arc<GsmModem>>>,
}

impl ModemPool {
    /// A pool opening serial ports with the settings of `template`. Set
    /// [`detect_driver`](GsmModemBuilder::detect_driver) on the template
    /// to pick each modem's driver from its identification.
    pub fn new(template: GsmModemBuilder) -> Self {
        ModemPool {
            template,
            factory: None,
            modems: Mutex::new(HashMap::new()),
        }
    }

    /// A pool that gets its transports from `factory`.
    pub fn with_factory(template: GsmModemBuilder, factory: Arc<dyn TransportFactory>) -> Self {
        ModemPool {
            factory: Some(factory),
            ..Self::new(template)
        }
    }

    /// Return the modem on `port`, starting and initializing it first when
    /// the pool has none.
    ///
    /// The pool stays locked while a modem starts, so two opens of one port
    /// never start two modems. A modem that fails to initialize is
    /// disconnected and not cached.
    pub async fn open(&self, port: &str) -> Result<Arc<GsmModem>> {
        let mut modems = self.modems.lock().await;
        if let Some(modem) = modems.get(port) {
            return Ok(Arc::clone(modem));
        }

        info!(port, "opening modem");
        let builder = self.template.clone().name(port);
        let modem = match &self.factory {
            Some(factory) => {
                let transport = factory.open(port).await?;
                builder.build_with_transport(transport).await?
            }
            None => builder.serial_port(port).build().await?,
        };

        if let Err(e) = modem.initialize().await {
            warn!(port, error = %e, "modem initialization failed");
            let _ = modem.disconnect().await;
            return Err(e);
        }

        let details = modem.info().await;
        let state = modem.state();
        info!(
            port,
            driver = %modem.driver().name(),
            manufacturer = ?details.manufacturer,
            model = ?details.model,
            imsi = ?details.imsi,
            smsc = ?state.smsc,
            storage = ?state.storage,
            "modem ready"
        );

        let modem = Arc::new(modem);
        modems.insert(port.to_string(), Arc::clone(&modem));
        Ok(modem)
    }

    pub async fn get(&self, port: &str) -> Option<Arc<GsmModem>> {
        self.modems.lock().await.get(port).cloned()
    }

    /// Ports with a started modem, sorted.
    pub async fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.modems.lock().await.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Take the modem on `port` out of the pool without stopping it.
    pub async fn remove(&self, port: &str) -> Option<Arc<GsmModem>> {
        self.modems.lock().await.remove(port)
    }

    /// Remove and disconnect the modem on `port`. Returns whether there
    /// was one.
    pub async fn disconnect(&self, port: &str) -> Result<bool> {
        match self.remove(port).await {
            Some(modem) => {
                modem.disconnect().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Disconnect every modem. All are attempted; the first failure is
    /// returned.
    pub async fn disconnect_all(&self) -> Result<()> {
        let modems: Vec<(String, Arc<GsmModem>)> = self.modems.lock().await.drain().collect();
        let mut first_error = None;
        for (port, modem) in modems {
            if let Err(e) = modem.disconnect().await {
                warn!(port = %port, error = %e, "disconnect failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
