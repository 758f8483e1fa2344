#[derive(Debug, thiserror::Error)]
pub enum RtpErrorValue {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported rtp version {0}")]
    BadVersion(u8),
    #[error("invalid padding length")]
    BadPadding,
    #[error("fragmented unit lost: expected seq {expected}, got {got}")]
    FragmentLost { expected: u16, got: u16 },
    #[error("access unit with {0} nal units dropped after packet loss")]
    DamagedUnit(usize),
    #[error("fragment without start")]
    FragmentWithoutStart,
    #[error("malformed aggregation packet")]
    BadAggregation,
    #[error("unsupported nal unit type {0}")]
    UnsupportedNalType(u8),
    #[error("malformed au header section")]
    BadAuHeaders,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct RtpError {
    pub value: RtpErrorValue,
}

impl From<RtpErrorValue> for RtpError {
    fn from(val: RtpErrorValue) -> Self {
        Self { value: val }
    }
}
