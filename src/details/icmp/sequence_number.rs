type SequenceNumberInnerType = u16;

#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct SequenceNumber(SequenceNumberInnerType);

impl SequenceNumber {
    pub(crate) fn start_value() -> SequenceNumber {
        // ICMP sequence numbers start from 1.
        SequenceNumber(1)
    }

    /// The successor, or `None` once `limit` has been reached. Never wraps.
    pub(crate) fn next_within(self, limit: SequenceNumberInnerType) -> Option<SequenceNumber> {
        if self.0 >= limit {
            None
        } else {
            Some(SequenceNumber(self.0 + 1))
        }
    }
}

impl From<SequenceNumber> for SequenceNumberInnerType {
    fn from(value: SequenceNumber) -> Self {
        value.0
    }
}

impl From<SequenceNumberInnerType> for SequenceNumber {
    fn from(value: SequenceNumberInnerType) -> Self {
        SequenceNumber(value)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
