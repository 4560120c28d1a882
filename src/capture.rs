use std::path::PathBuf;

use log::error;

use crate::net::pcap;
use crate::packet::MetaPacket;

/// Packets backed by a capture file rather than a running operation.
#[derive(Debug, Default)]
pub struct StaticContext {
    cap_file: Option<PathBuf>,
    data: Vec<MetaPacket>,
    summary: String,
}

impl StaticContext {
    pub fn new(cap_file: Option<PathBuf>) -> Self {
        Self {
            cap_file,
            ..Default::default()
        }
    }

    pub fn data(&self) -> &[MetaPacket] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<MetaPacket>) {
        self.data = data;
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Replace the packets with the contents of the capture file.
    pub fn load(&mut self) -> bool {
        let Some(path) = self.cap_file.as_deref() else {
            return false;
        };
        match pcap::load(path) {
            Ok(packets) => {
                self.summary = format!("{} packets loaded.", packets.len());
                self.data = packets;
                true
            }
            Err(e) => {
                error!("Could not load {}: {}", path.display(), e);
                self.summary = e.to_string();
                false
            }
        }
    }

    /// Write the packets out, gzip-compressed when the file name ends in `.gz`.
    pub fn save(&mut self) -> bool {
        let Some(path) = self.cap_file.as_deref() else {
            return false;
        };
        match pcap::save(path, &self.data) {
            Ok(()) => {
                self.summary = format!("{} packets written.", self.data.len());
                true
            }
            Err(e) => {
                error!("Could not save {}: {}", path.display(), e);
                self.summary = e.to_string();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{echo_reply, echo_request};

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.pcap.gz");

        let mut out = StaticContext::new(Some(path.clone()));
        out.set_data(vec![echo_request(3, 1), echo_reply(3, 1)]);
        assert!(out.save());
        assert_eq!(out.summary(), "2 packets written.");

        let mut back = StaticContext::new(Some(path));
        assert!(back.load());
        assert_eq!(back.summary(), "2 packets loaded.");
        assert_eq!(back.data()[1].encode(), echo_reply(3, 1).encode());
    }

    #[test]
    fn needs_a_file() {
        let mut ctx = StaticContext::new(None);
        assert!(!ctx.load());
        assert!(!ctx.save());
        assert!(ctx.summary().is_empty());
    }

    #[test]
    fn load_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.pcap");
        let mut ctx = StaticContext::new(Some(path));
        assert!(!ctx.load());
        assert!(!ctx.summary().is_empty());
    }
}
