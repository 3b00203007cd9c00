use server_api::ApiContext;
use shared::protocol::ServerEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) events: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub(crate) fn publish(&self, event: ServerEvent) {
        // No receivers simply means no client is connected right now.
        let _ = self.events.send(event);
    }
}
