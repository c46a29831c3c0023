// ABOUTME: Leases TCP ports for preview processes from a fixed inclusive range
// ABOUTME: The lease set is shared across tasks behind a mutex; release is idempotent

use crate::error::{Result, SandboxError};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub struct PortAllocator {
    start: u16,
    end: u16,
    leased: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            leased: Mutex::new(HashSet::new()),
        }
    }

    /// Lease the lowest port in range that is neither leased nor bound by
    /// another process on this host.
    pub async fn allocate(&self) -> Result<u16> {
        let mut leased = self.leased.lock().await;

        for port in self.start..=self.end {
            if leased.contains(&port) {
                continue;
            }
            if !is_port_available(port) {
                debug!("Port {} is bound by another process, skipping", port);
                continue;
            }
            leased.insert(port);
            info!("Leased port {}", port);
            return Ok(port);
        }

        error!("No available ports in range {}-{}", self.start, self.end);
        Err(SandboxError::ResourceExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Returns false when the port was not leased
    pub async fn release(&self, port: u16) -> bool {
        let released = self.leased.lock().await.remove(&port);
        if released {
            info!("Released port {}", port);
        } else {
            debug!("Port {} was not leased, nothing to release", port);
        }
        released
    }

    pub async fn is_leased(&self, port: u16) -> bool {
        self.leased.lock().await.contains(&port)
    }

    pub async fn leased_count(&self) -> usize {
        self.leased.lock().await.len()
    }
}

fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
