//! Transport factory wiring
//!
//! The OS pass-through adapters (SG_IO, NVMe admin, SAT and friends)
//! live in a separate crate and are linked in by distributions. This
//! build ships without one: every lookup reports the device type as
//! unsupported, which the registrar and quit policy then handle.

use diskwatch_common::{Error, Result};
use diskwatch_device::{AnyDevice, DeviceFactory, ScannedDevice};

pub struct UnlinkedFactory;

impl DeviceFactory for UnlinkedFactory {
    fn device(&self, name: &str, type_hint: &str) -> Result<AnyDevice> {
        Err(Error::unsupported(if type_hint.is_empty() {
            format!("no transport adapter linked, unable to autodetect device type: {name}")
        } else {
            format!("no transport adapter linked for device type '{type_hint}': {name}")
        }))
    }

    fn scan(&self, _types: &[String]) -> Result<Vec<ScannedDevice>> {
        Ok(Vec::new())
    }
}
