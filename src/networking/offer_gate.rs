use std::collections::HashMap;
use std::sync::{Arc, Mutex};

///
/// Per-file accept-offers gate. An offer for a file is only recorded while
/// that file's gate is open; the gate is opened by the originating
/// discovery send and closed when the response window elapses. Offers
/// seen while the gate is closed are dropped, never buffered.
///
/// Gate entries are created on first access and survive for the process
/// lifetime, so a later search for the same file reuses its entry.
///
pub struct OfferGate {
    entries: Mutex<HashMap<String, Arc<Mutex<bool>>>>,
}

impl OfferGate {
    pub fn new() -> OfferGate {
        OfferGate {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, file_name: &str) -> Arc<Mutex<bool>> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(file_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(false)))
            .clone()
    }

    pub fn open(&self, file_name: &str) {
        *self.entry(file_name).lock().unwrap() = true;
    }

    pub fn close(&self, file_name: &str) {
        *self.entry(file_name).lock().unwrap() = false;
    }

    pub fn is_open(&self, file_name: &str) -> bool {
        *self.entry(file_name).lock().unwrap()
    }
}

impl Default for OfferGate {
    fn default() -> Self {
        OfferGate::new()
    }
}
