use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::MacAddress;
use crate::packet::MetaPacket;

/// Address-resolution bindings learned while transmitting.
#[derive(Clone, Debug, Default)]
pub struct ArpCache {
    entries: Arc<Mutex<HashMap<Ipv4Addr, MacAddress>>>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<MacAddress> {
        self.entries.lock().get(ip).copied()
    }

    pub fn merge(&self, delta: CacheDelta) {
        self.entries.lock().extend(delta.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Bindings one sender learned during a run, handed to the receiver once.
#[derive(Debug, Default, PartialEq)]
pub struct CacheDelta {
    entries: HashMap<Ipv4Addr, MacAddress>,
}

impl CacheDelta {
    pub fn learn(&mut self, frame: &MetaPacket) {
        if let Some((ip, mac)) = frame.learned_mapping() {
            self.entries.insert(ip, mac);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
