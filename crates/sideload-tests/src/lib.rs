#![forbid(unsafe_code)]

//! Shared harness for cross-crate integration tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use sideload_client::Client;
use sideload_runtime::hosted::HostedPlatform;
use sideload_runtime::{RuntimeConfig, Service};

/// An in-process device: bytes written by the client run straight through
/// the runtime service, and the responses queue up for the next read. The
/// whole exchange is synchronous on one thread, exactly like the real
/// single-worker device.
pub struct SimulatedDevice {
    service: Service<HostedPlatform>,
    outbound: VecDeque<u8>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            service: Service::new(HostedPlatform::new(), RuntimeConfig::default()),
            outbound: VecDeque::new(),
        }
    }

    pub fn platform_mut(&mut self) -> &mut HostedPlatform {
        self.service.dispatcher_mut().platform_mut()
    }

    /// Injects raw bytes as if line noise hit the device's receiver.
    pub fn inject_noise(&mut self, bytes: &[u8]) {
        let responses = self.service.feed(bytes);
        self.outbound.extend(responses);
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let responses = self.service.feed(buf);
        self.outbound.extend(responses);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.outbound.len());
        for b in buf.iter_mut().take(n) {
            // VecDeque is non-empty for each of the first n pops.
            *b = self.outbound.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

pub fn connect() -> Client<SimulatedDevice> {
    Client::new(SimulatedDevice::new())
}
