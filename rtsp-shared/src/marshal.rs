use bytes::{Buf, Bytes};

use crate::error::Result;

pub trait MarshalSize {
    fn marshal_size(&self) -> usize;
}

pub trait Marshal: MarshalSize {
    /// Writes the binary encoding into `buf`, returning the number of bytes
    /// written. `buf` must be at least `marshal_size()` bytes long.
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize>;

    fn marshal(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; self.marshal_size()];
        let n = self.marshal_to(&mut buf)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

pub trait Unmarshal: MarshalSize {
    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self>
    where
        Self: Sized;
}
