use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

/// A port held open by a placeholder listener.
///
/// The caller binds its real server and then calls [`release`](Self::release),
/// which closes the placeholder. Until then no other process (or other
/// orchestrator) can observe the port as free. Dropping the reservation
/// releases it as well.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    service: String,
    listeners: Vec<TcpListener>,
    held: Arc<Mutex<HashSet<u16>>>,
    released: bool,
}

impl PortReservation {
    /// Bind placeholders on loopback (required) and on the wildcard address
    /// (best effort; Linux refuses it once loopback is bound).
    pub(crate) fn bind(
        service: &str,
        port: u16,
        held: Arc<Mutex<HashSet<u16>>>,
    ) -> std::io::Result<Self> {
        let loopback = TcpListener::bind(("127.0.0.1", port))?;
        let mut listeners = vec![loopback];
        if let Ok(any) = TcpListener::bind(("0.0.0.0", port)) {
            listeners.push(any);
        }
        held.lock().insert(port);

        Ok(Self {
            port,
            service: service.to_string(),
            listeners,
            held,
            released: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Close the placeholder. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.listeners.clear();
        self.held.lock().remove(&self.port);
        self.released = true;
        tracing::debug!(service = %self.service, port = self.port, "Released port reservation");
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::is_port_available;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_reservation_holds_port_until_release() {
        let held = Arc::new(Mutex::new(HashSet::new()));
        let port = free_port();
        let mut reservation = PortReservation::bind("api", port, held.clone()).unwrap();

        assert!(!is_port_available(port));
        assert!(held.lock().contains(&port));

        reservation.release();
        assert!(reservation.is_released());
        assert!(is_port_available(port));
        assert!(held.lock().is_empty());

        reservation.release();
        assert!(reservation.is_released());
    }

    #[test]
    fn test_drop_releases() {
        let held = Arc::new(Mutex::new(HashSet::new()));
        let port = free_port();
        {
            let _reservation = PortReservation::bind("api", port, held.clone()).unwrap();
            assert!(held.lock().contains(&port));
        }
        assert!(held.lock().is_empty());
        assert!(is_port_available(port));
    }
}
