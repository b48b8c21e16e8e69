use tether_wire::ErrorKind;

pub type ErrorCallback = Box<dyn FnMut(ErrorKind, &str)>;

/// Per-device client state.
#[derive(Default)]
pub(crate) struct DeviceRecord {
    /// Taken out of the record while firing, then put back.
    pub error_callback: Option<ErrorCallback>,
}
