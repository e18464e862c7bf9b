//! Dense guest RAM, mapped from physical address zero.

use std::sync::Mutex;

use xenon_devices::device::{BusResult, DeviceInfo, SystemDevice};

pub struct Ram {
    info: DeviceInfo,
    data: Mutex<Box<[u8]>>,
}

impl Ram {
    pub fn new(size: u64) -> Self {
        Self {
            info: DeviceInfo::new("RAM", 0, size, true),
            data: Mutex::new(vec![0u8; size as usize].into_boxed_slice()),
        }
    }

    pub fn size(&self) -> u64 {
        self.info.size()
    }
}

impl SystemDevice for Ram {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> BusResult {
        let data = self.data.lock().unwrap();
        let start = addr as usize;
        let n = out.len().min(data.len().saturating_sub(start));
        out[..n].copy_from_slice(&data[start..start + n]);
        out[n..].fill(0xFF);
        Ok(())
    }

    fn write(&self, addr: u64, src: &[u8]) -> BusResult {
        let mut data = self.data.lock().unwrap();
        let start = addr as usize;
        let n = src.len().min(data.len().saturating_sub(start));
        data[start..start + n].copy_from_slice(&src[..n]);
        Ok(())
    }

    fn fill(&self, addr: u64, value: u8, len: u64) -> BusResult {
        let mut data = self.data.lock().unwrap();
        let start = addr as usize;
        let n = (len as usize).min(data.len().saturating_sub(start));
        data[start..start + n].fill(value);
        Ok(())
    }
}
