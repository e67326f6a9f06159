//! Scripted in-memory transport
//!
//! Devices whose responses come from a shared, mutable script. Tests
//! hold the script handle and change readings between check cycles; the
//! monitoring engine sees the device through the ordinary facade.

use crate::ata::{AtaIdentity, SelfTestLog, SmartThresholds, SmartValues};
use crate::nvme::{NvmeErrorEntry, NvmeIdentity, NvmeSelfTestLog, NvmeSmartLog};
use crate::scsi::{EcKind, ErrorCounters, IeStatus, LogPageSupport, ScsiIdentity};
use crate::transport::{
    AnyDevice, AtaDevice, AtaSetting, AtaTest, Device, DeviceFactory, HealthStatus, NvmeDevice,
    PowerMode, ScannedDevice, ScsiDevice, SelectiveMode,
};
use diskwatch_common::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

fn required<T: Clone>(value: &Option<T>, what: &str) -> Result<T> {
    value
        .clone()
        .ok_or_else(|| Error::unsupported(what.to_string()))
}

/// Script for an ATA device. `None` fields answer with
/// `UnsupportedCommand`.
#[derive(Default)]
pub struct AtaScript {
    pub identity: Option<AtaIdentity>,
    pub values: Option<SmartValues>,
    pub thresholds: Option<SmartThresholds>,
    pub health: Option<HealthStatus>,
    pub selftest_log: Option<SelfTestLog>,
    pub error_count: Option<u64>,
    pub ext_error_count: Option<u64>,
    pub power_mode: Option<PowerMode>,
    pub selective_span: (u64, u64),
    pub open_fails: bool,
    /// Records of commands issued by the engine.
    pub applied_settings: Vec<AtaSetting>,
    pub sct_erc: Option<(u16, u16)>,
    pub started_tests: Vec<AtaTest>,
    pub autosave_calls: Vec<bool>,
    pub auto_offline_calls: Vec<bool>,
}

pub type AtaHandle = Rc<RefCell<AtaScript>>;

pub struct MockAta {
    script: AtaHandle,
    open: bool,
}

impl MockAta {
    pub fn new(script: AtaScript) -> (Self, AtaHandle) {
        let handle = Rc::new(RefCell::new(script));
        (
            MockAta {
                script: handle.clone(),
                open: false,
            },
            handle,
        )
    }
}

impl Device for MockAta {
    fn open(&mut self) -> Result<()> {
        if self.script.borrow().open_fails {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such device",
            )));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl AtaDevice for MockAta {
    fn identify(&mut self) -> Result<AtaIdentity> {
        required(&self.script.borrow().identity, "IDENTIFY DEVICE")
    }

    fn read_smart_values(&mut self) -> Result<SmartValues> {
        required(&self.script.borrow().values, "SMART READ DATA")
    }

    fn read_smart_thresholds(&mut self) -> Result<SmartThresholds> {
        required(&self.script.borrow().thresholds, "SMART READ THRESHOLDS")
    }

    fn smart_status(&mut self) -> Result<HealthStatus> {
        required(&self.script.borrow().health, "SMART RETURN STATUS")
    }

    fn enable_smart(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_attribute_autosave(&mut self, enable: bool) -> Result<()> {
        self.script.borrow_mut().autosave_calls.push(enable);
        Ok(())
    }

    fn set_auto_offline(&mut self, enable: bool) -> Result<()> {
        self.script.borrow_mut().auto_offline_calls.push(enable);
        Ok(())
    }

    fn read_selftest_log(&mut self) -> Result<SelfTestLog> {
        required(&self.script.borrow().selftest_log, "SMART READ LOG 0x06")
    }

    fn read_error_count(&mut self, extended: bool) -> Result<u64> {
        let script = self.script.borrow();
        if extended {
            required(&script.ext_error_count, "READ LOG EXT 0x03")
        } else {
            required(&script.error_count, "SMART READ LOG 0x01")
        }
    }

    fn check_power_mode(&mut self) -> Result<PowerMode> {
        required(&self.script.borrow().power_mode, "CHECK POWER MODE")
    }

    fn apply_setting(&mut self, setting: AtaSetting) -> Result<()> {
        self.script.borrow_mut().applied_settings.push(setting);
        Ok(())
    }

    fn set_sct_erc(&mut self, read_time: u16, write_time: u16) -> Result<()> {
        self.script.borrow_mut().sct_erc = Some((read_time, write_time));
        Ok(())
    }

    fn start_selftest(&mut self, test: AtaTest) -> Result<()> {
        self.script.borrow_mut().started_tests.push(test);
        Ok(())
    }

    fn write_selective_span(
        &mut self,
        _mode: SelectiveMode,
        _prev_span: (u64, u64),
    ) -> Result<(u64, u64)> {
        Ok(self.script.borrow().selective_span)
    }
}

/// Script for a SCSI device.
#[derive(Default)]
pub struct ScsiScript {
    pub identity: Option<ScsiIdentity>,
    pub ie_enabled: Option<bool>,
    pub unit_ready: Option<Result<()>>,
    pub ie: Option<IeStatus>,
    pub log_pages: LogPageSupport,
    pub read_counters: Option<ErrorCounters>,
    pub write_counters: Option<ErrorCounters>,
    pub verify_counters: Option<ErrorCounters>,
    pub non_medium_errors: Option<u64>,
    pub failed_selftests: Option<(u8, u16)>,
    pub selftest_running: bool,
    pub open_fails: bool,
    pub started_tests: Vec<bool>,
    pub gltsd_calls: Vec<bool>,
}

pub type ScsiHandle = Rc<RefCell<ScsiScript>>;

pub struct MockScsi {
    script: ScsiHandle,
    open: bool,
}

impl MockScsi {
    pub fn new(script: ScsiScript) -> (Self, ScsiHandle) {
        let handle = Rc::new(RefCell::new(script));
        (
            MockScsi {
                script: handle.clone(),
                open: false,
            },
            handle,
        )
    }
}

impl Device for MockScsi {
    fn open(&mut self) -> Result<()> {
        if self.script.borrow().open_fails {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such device",
            )));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl ScsiDevice for MockScsi {
    fn inquiry(&mut self) -> Result<ScsiIdentity> {
        required(&self.script.borrow().identity, "INQUIRY")
    }

    fn test_unit_ready(&mut self) -> Result<()> {
        match &self.script.borrow().unit_ready {
            None | Some(Ok(())) => Ok(()),
            Some(Err(Error::NotReady)) => Err(Error::NotReady),
            Some(Err(Error::NoMedium)) => Err(Error::NoMedium),
            Some(Err(Error::BecomingReady)) => Err(Error::BecomingReady),
            Some(Err(_)) => Err(Error::bad_response("TEST UNIT READY")),
        }
    }

    fn ie_enabled(&mut self) -> Result<bool> {
        Ok(self.script.borrow().ie_enabled.unwrap_or(true))
    }

    fn check_ie(&mut self) -> Result<IeStatus> {
        required(&self.script.borrow().ie, "LOG SENSE IE page")
    }

    fn supported_log_pages(&mut self) -> Result<LogPageSupport> {
        Ok(self.script.borrow().log_pages)
    }

    fn error_counters(&mut self, kind: EcKind) -> Result<ErrorCounters> {
        let script = self.script.borrow();
        let counters = match kind {
            EcKind::Read => &script.read_counters,
            EcKind::Write => &script.write_counters,
            EcKind::Verify => &script.verify_counters,
        };
        required(counters, "LOG SENSE error counters")
    }

    fn non_medium_errors(&mut self) -> Result<u64> {
        required(
            &self.script.borrow().non_medium_errors,
            "LOG SENSE non-medium errors",
        )
    }

    fn count_failed_selftests(&mut self) -> Result<(u8, u16)> {
        required(
            &self.script.borrow().failed_selftests,
            "LOG SENSE self-test results",
        )
    }

    fn selftest_in_progress(&mut self) -> Result<bool> {
        Ok(self.script.borrow().selftest_running)
    }

    fn set_gltsd(&mut self, disable_save: bool) -> Result<()> {
        self.script.borrow_mut().gltsd_calls.push(disable_save);
        Ok(())
    }

    fn start_selftest(&mut self, extended: bool) -> Result<()> {
        self.script.borrow_mut().started_tests.push(extended);
        Ok(())
    }
}

/// Script for an NVMe device.
#[derive(Default)]
pub struct NvmeScript {
    pub identity: Option<NvmeIdentity>,
    pub nsid: u32,
    pub smart_log: Option<NvmeSmartLog>,
    pub error_log: Option<Vec<NvmeErrorEntry>>,
    pub selftest_log: Option<NvmeSelfTestLog>,
    pub open_fails: bool,
    pub started_tests: Vec<u8>,
}

pub type NvmeHandle = Rc<RefCell<NvmeScript>>;

pub struct MockNvme {
    script: NvmeHandle,
    open: bool,
}

impl MockNvme {
    pub fn new(script: NvmeScript) -> (Self, NvmeHandle) {
        let handle = Rc::new(RefCell::new(script));
        (
            MockNvme {
                script: handle.clone(),
                open: false,
            },
            handle,
        )
    }
}

impl Device for MockNvme {
    fn open(&mut self) -> Result<()> {
        if self.script.borrow().open_fails {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such device",
            )));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl NvmeDevice for MockNvme {
    fn identify_controller(&mut self) -> Result<NvmeIdentity> {
        required(&self.script.borrow().identity, "Identify Controller")
    }

    fn nsid(&self) -> u32 {
        self.script.borrow().nsid
    }

    fn smart_log(&mut self) -> Result<NvmeSmartLog> {
        required(&self.script.borrow().smart_log, "Get Log Page SMART/Health")
    }

    fn error_log(&mut self, max_entries: usize) -> Result<Vec<NvmeErrorEntry>> {
        let entries = required(&self.script.borrow().error_log, "Get Log Page Error Info")?;
        Ok(entries.into_iter().take(max_entries).collect())
    }

    fn selftest_log(&mut self) -> Result<NvmeSelfTestLog> {
        required(&self.script.borrow().selftest_log, "Get Log Page Self-test")
    }

    fn start_selftest(&mut self, code: u8) -> Result<()> {
        self.script.borrow_mut().started_tests.push(code);
        Ok(())
    }
}

/// Factory over a fixed set of scripted devices.
#[derive(Default)]
pub struct MockFactory {
    devices: RefCell<HashMap<String, AnyDevice>>,
    scan_list: RefCell<Vec<ScannedDevice>>,
}

impl MockFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, device: AnyDevice) {
        self.devices.borrow_mut().insert(name.to_string(), device);
    }

    pub fn add_scanned(&self, name: &str, dev_type: &str, device: AnyDevice) {
        self.scan_list.borrow_mut().push(ScannedDevice {
            name: name.to_string(),
            dev_type: dev_type.to_string(),
            device,
        });
    }
}

impl DeviceFactory for MockFactory {
    fn device(&self, name: &str, _type_hint: &str) -> Result<AnyDevice> {
        self.devices
            .borrow_mut()
            .remove(name)
            .ok_or_else(|| Error::unsupported(format!("unable to autodetect device type: {name}")))
    }

    fn scan(&self, _types: &[String]) -> Result<Vec<ScannedDevice>> {
        Ok(self.scan_list.borrow_mut().drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_ata_script() {
        let (mut dev, handle) = MockAta::new(AtaScript {
            health: Some(HealthStatus::Passed),
            ..Default::default()
        });
        dev.open().unwrap();
        assert!(dev.is_open());
        assert_eq!(dev.smart_status().unwrap(), HealthStatus::Passed);
        assert!(dev.read_smart_values().is_err());

        handle.borrow_mut().health = Some(HealthStatus::Failed);
        assert_eq!(dev.smart_status().unwrap(), HealthStatus::Failed);

        dev.start_selftest(AtaTest::Short).unwrap();
        assert_eq!(handle.borrow().started_tests, vec![AtaTest::Short]);
    }

    #[test]
    fn test_mock_factory() {
        let factory = MockFactory::new();
        let (dev, _) = MockNvme::new(NvmeScript::default());
        factory.add("/dev/nvme0", AnyDevice::Nvme(Box::new(dev)));

        assert!(factory.device("/dev/nvme0", "").is_ok());
        assert!(factory.device("/dev/nvme0", "").is_err());
        assert!(factory.device("/dev/sda", "").is_err());
    }

    #[test]
    fn test_mock_open_failure() {
        let (mut dev, _) = MockScsi::new(ScsiScript {
            open_fails: true,
            ..Default::default()
        });
        assert!(dev.open().is_err());
        assert!(!dev.is_open());
    }
}
