/// A single record as produced to or consumed from a partition.
///
/// The producer stamps `topic`, `partition` and `crc` before sending, and on
/// a successful produce writes the broker-assigned offsets back into the
/// batch (base offset into the first message, sequential offsets into the
/// rest). Callers therefore hand the producer a mutable batch and can read
/// the assigned offsets afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub offset: i64,
    pub crc: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub topic: String,
    pub partition: i32,
}

impl Message {
    /// A value-only message; key, topic and partition are filled in later.
    pub fn from_value(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    /// Fingerprint of the message payload, computed over key then value.
    pub fn checksum(&self) -> u32 {
        let crc = crc32c::crc32c(&self.key);
        crc32c::crc32c_append(crc, &self.value)
    }

    pub fn approximate_size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}
