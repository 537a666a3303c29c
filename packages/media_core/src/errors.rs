#[derive(Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u16)]
pub enum EngineErrors {
    SubscriberNotFound = 0x1001,
    SubscriberClosed = 0x1002,
    TrackNotFound = 0x2001,
    AlreadySubscribed = 0x2002,
    NotSubscribed = 0x2003,
}

impl std::fmt::Display for EngineErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for EngineErrors {}
