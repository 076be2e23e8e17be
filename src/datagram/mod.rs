use bytes::Bytes;

pub mod datagram_id;
pub mod datagram_store;

pub type SubscriptionId = i32;

/// Priority class of an outgoing datagram: emergency datagrams are always sent before normal
///  ones.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DatagramType {
    Emergency,
    Normal,
}

impl DatagramType {
    pub fn is_emergency(&self) -> bool {
        matches!(self, DatagramType::Emergency)
    }
}

/// An opaque payload. The engine never looks inside, it only passes the bytes through.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    payload: Bytes,
}

impl Datagram {
    pub fn new(payload: impl Into<Bytes>) -> Datagram {
        Datagram {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// size rounded to the nearest multiple of 10 bytes, for logging transfer statistics
    ///  without exposing the exact payload length
    pub fn rounded_size_bytes(&self) -> usize {
        (self.payload.len() + 5) / 10 * 10
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(0, 0)]
    #[case(4, 0)]
    #[case(5, 10)]
    #[case(14, 10)]
    #[case(15, 20)]
    #[case(100, 100)]
    fn test_rounded_size(#[case] len: usize, #[case] expected: usize) {
        let datagram = Datagram::new(vec![7u8; len]);
        assert_eq!(datagram.len(), len);
        assert_eq!(datagram.is_empty(), len == 0);
        assert_eq!(datagram.payload().len(), len);
        assert_eq!(datagram.rounded_size_bytes(), expected);
    }

    #[rstest]
    #[case(DatagramType::Emergency, true)]
    #[case(DatagramType::Normal, false)]
    fn test_is_emergency(#[case] datagram_type: DatagramType, #[case] expected: bool) {
        assert_eq!(datagram_type.is_emergency(), expected);
    }
}
