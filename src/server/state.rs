use std::sync::Arc;

use crate::render_manager::RenderManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RenderManager>,
}

impl AppState {
    pub fn new(manager: Arc<RenderManager>) -> Self {
        Self { manager }
    }
}
