use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// First port probed when none is configured
pub const DEFAULT_PORT_START: u16 = 1024;
/// Last port probed, top of the registered port range
pub const PORT_CEILING: u16 = 49151;

/// Ports handed to fixtures of this process that are still alive
static RESERVED: Mutex<BTreeSet<u16>> = Mutex::new(BTreeSet::new());

/// Port reserved for one fixture, released on drop
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
}

impl PortReservation {
    /// Reserved port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Reserve a port chosen by the caller; `None` if another fixture holds it
    pub fn claim(port: u16) -> Option<Self> {
        let mut reserved = RESERVED.lock().unwrap_or_else(|e| e.into_inner());
        // a rejected reservation must never be built: its drop would
        // release the port held by the owner
        if reserved.insert(port) {
            Some(PortReservation { port })
        } else {
            None
        }
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        let mut reserved = RESERVED.lock().unwrap_or_else(|e| e.into_inner());
        reserved.remove(&self.port);
        debug!("released port {}", self.port);
    }
}

/// Find the first free TCP port in `start..=end`
///
/// Ports held by live fixtures of this process are skipped even if nothing
/// listens on them yet.
pub fn find_available(start: u16, end: u16) -> Result<PortReservation> {
    find_with(start, end, portpicker::is_free_tcp)
}

fn find_with(start: u16, end: u16, is_free: impl Fn(u16) -> bool) -> Result<PortReservation> {
    for port in start..=end {
        if !is_free(port) {
            continue;
        }
        if let Some(reservation) = PortReservation::claim(port) {
            debug!("selected port {port}");
            return Ok(reservation);
        }
    }
    Err(Error::PortExhaustion { start, end })
}
