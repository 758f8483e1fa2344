#[derive(Debug, thiserror::Error)]
pub enum Fmp4ErrorValue {
    #[error("at least one track is required")]
    NoTracks,
    #[error("track {0} is not declared in the init segment")]
    UnknownTrack(u32),
    #[error("{0} exceeds the 32-bit box size")]
    BoxTooLarge(&'static str),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct Fmp4Error {
    pub value: Fmp4ErrorValue,
}

impl From<Fmp4ErrorValue> for Fmp4Error {
    fn from(val: Fmp4ErrorValue) -> Self {
        Self { value: val }
    }
}
