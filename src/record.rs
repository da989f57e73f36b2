//! `Context` and `Record`: the addressing and per-call payload types that
//! sit between raw `Data` values and the packet wire format (§3.3, §4.D).

use crate::data::Data;

/// A context identifies a conversation between a client and a server: a
/// pair of `u32`s with no further structure imposed by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    pub high: u32,
    pub low: u32,
}

impl Context {
    #[must_use]
    pub fn new(high: u32, low: u32) -> Self {
        Self { high, low }
    }
}

/// A single request or response within a packet: a setting id and its
/// `Data` payload.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: u32,
    pub data: Data,
}

impl Record {
    #[must_use]
    pub fn new(id: u32, data: Data) -> Self {
        Self { id, data }
    }
}

impl PartialEq for Record {
    /// `Data` has no `PartialEq` of its own (two views of the same value
    /// may differ in storage layout but not content), so this compares
    /// type tag plus flattened bytes rather than deriving field-by-field.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.data.data_type() == other.data.data_type()
            && self.data.flatten() == other.data.flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    #[test]
    fn context_equality() {
        assert_eq!(Context::new(1, 2), Context::new(1, 2));
        assert_ne!(Context::new(1, 2), Context::new(2, 1));
    }

    #[test]
    fn record_holds_id_and_data() {
        let mut data = Data::new(Type::parse("i").unwrap());
        data.set_int(42, &[]).unwrap();
        let record = Record::new(7, data);
        assert_eq!(record.id, 7);
        assert_eq!(record.data.get_int(&[]).unwrap(), 42);
    }

    #[test]
    fn record_equality_compares_id_and_flattened_data() {
        let mut a = Data::new(Type::parse("i").unwrap());
        a.set_int(42, &[]).unwrap();
        let mut b = Data::new(Type::parse("i").unwrap());
        b.set_int(42, &[]).unwrap();
        assert_eq!(Record::new(7, a.clone()), Record::new(7, b.clone()));
        assert_ne!(Record::new(8, a.clone()), Record::new(7, b.clone()));

        let mut c = Data::new(Type::parse("i").unwrap());
        c.set_int(99, &[]).unwrap();
        assert_ne!(Record::new(7, a), Record::new(7, c));
    }
}
