#[derive(Debug, thiserror::Error)]
pub enum PsErrorValue {
    #[error("truncated {unit} at offset {offset}")]
    Truncated { unit: &'static str, offset: usize },
    #[error("no start code found")]
    NoStartCode,
    #[error("malformed pes header")]
    BadPesHeader,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct PsError {
    pub value: PsErrorValue,
}

impl From<PsErrorValue> for PsError {
    fn from(val: PsErrorValue) -> Self {
        Self { value: val }
    }
}
