#[derive(Debug, thiserror::Error)]
pub enum BitErrorValue {
    #[error("the size is bigger than 32")]
    TooBig,
    #[error("cannot read bit: end of data")]
    CannotReadBit,
    #[error("exp-golomb code longer than 32 bits")]
    BadExpGolomb,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct BitError {
    pub value: BitErrorValue,
}

impl From<BitErrorValue> for BitError {
    fn from(val: BitErrorValue) -> Self {
        Self { value: val }
    }
}
