//! Lifecycle events announced by the supervision layer.

/// Browser process transitions, named after the destination state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    Starting,
    Started,
    Faulted,
    Stopping,
    Stopped,
}

/// Instance-level events: role changes, handle drain, main availability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceEvent {
    Started,
    Stopped,
    Main,
    Standby,
    /// The open-handle set transitioned to empty.
    Idle,
    MainOnline,
    MainOffline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TakeoverReason {
    Recycle,
    Fault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecycleResult {
    Recycled,
    Canceled,
    StandbyUnavailable,
}

/// Provider-level events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderEvent {
    Takeover { reason: TakeoverReason },
    Recycle { result: RecycleResult },
}
