//! Application state management

use streamtune_core::Engine;

use crate::device::AddressBook;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub addresses: AddressBook,
}

impl AppState {
    pub fn new(engine: Engine, addresses: AddressBook) -> Self {
        Self { engine, addresses }
    }
}
