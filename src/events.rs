//! Events posted from worker tasks back to the operator console.

use tokio::sync::mpsc;

/// Everything the console front end may be asked to do. Workers never touch
/// UI state directly; they enqueue one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Show a modal alert to the operator.
    Alert(String),
    /// Append a line to the command output window.
    Print(String),
    /// The device registry changed; the device list should be redrawn.
    DeviceListRefreshed,
    /// The appliance key supply dropped below a warning threshold.
    LowKey(i64),
    /// An operation failed; carries the operation name and affected serials.
    OperationError {
        operation: String,
        serials: Vec<String>,
        message: String,
    },
    /// Ask the operator to pick a file matching the wildcard.
    SelectFile { message: String, wildcard: String },
    /// Ask the operator where to save a file with the suggested name.
    SaveFile { message: String, filename: String },
    /// The USB location mapping changed.
    MappingUpdated,
}

/// Cloneable handle used by every worker to post events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl EventSender {
    /// Create a sender/receiver pair. The receiver side belongs to whatever
    /// front end drains the queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post an event. Send failures mean the front end is gone (shutdown);
    /// workers finish their current step regardless, so the error is dropped.
    pub fn post(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn alert(&self, message: impl Into<String>) {
        self.post(UiEvent::Alert(message.into()));
    }

    pub fn print(&self, message: impl Into<String>) {
        self.post(UiEvent::Print(message.into()));
    }

    pub fn device_list_refreshed(&self) {
        self.post(UiEvent::DeviceListRefreshed);
    }

    pub fn low_key(&self, keys_left: i64) {
        self.post(UiEvent::LowKey(keys_left));
    }

    pub fn operation_error(
        &self,
        operation: impl Into<String>,
        serials: Vec<String>,
        message: impl Into<String>,
    ) {
        self.post(UiEvent::OperationError {
            operation: operation.into(),
            serials,
            message: message.into(),
        });
    }
}
