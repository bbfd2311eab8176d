use std::sync::Arc;

use crate::azure_b2c::B2cClient;

#[derive(Clone)]
pub struct AppState {
    pub b2c: Arc<B2cClient>,
}
