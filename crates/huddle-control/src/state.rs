/// Conference controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    None,
    Idle,
    Incoming,
    WaitConfig,
    WaitConfigOutgoing,
    ConnSent,
    SetupRecv,
    Connecting,
    Connected,
    Active,
    Terminating,
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            CallState::None => "NONE",
            CallState::Idle => "IDLE",
            CallState::Incoming => "INCOMING",
            CallState::WaitConfig => "WAITCONFIG",
            CallState::WaitConfigOutgoing => "WAITCONFIG_OUTGOING",
            CallState::ConnSent => "CONNSENT",
            CallState::SetupRecv => "SETUPRECV",
            CallState::Connecting => "CONNECTING",
            CallState::Connected => "CONNECTED",
            CallState::Active => "ACTIVE",
            CallState::Terminating => "TERMINATING",
        }
    }

    pub fn is_waiting_config(&self) -> bool {
        matches!(self, CallState::WaitConfig | CallState::WaitConfigOutgoing)
    }
}
