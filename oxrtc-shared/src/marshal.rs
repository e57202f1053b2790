use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

pub trait MarshalSize {
    fn marshal_size(&self) -> usize;
}

pub trait Marshal: MarshalSize {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize>;

    fn marshal(&self) -> Result<BytesMut> {
        let l = self.marshal_size();
        let mut buf = BytesMut::with_capacity(l);
        buf.resize(l, 0);
        let n = self.marshal_to(&mut buf)?;
        if n != l {
            return Err(Error::ErrBufferTooSmall);
        }
        Ok(buf)
    }
}

pub trait Unmarshal: MarshalSize {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf;
}

#[cfg(test)]
mod test {
    use super::*;

    struct Tag(u16);

    impl MarshalSize for Tag {
        fn marshal_size(&self) -> usize {
            2
        }
    }

    impl Marshal for Tag {
        fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
            if buf.len() < 2 {
                return Err(Error::ErrBufferTooSmall);
            }
            buf[..2].copy_from_slice(&self.0.to_be_bytes());
            Ok(2)
        }
    }

    #[test]
    fn test_marshal_checks_size() {
        let t = Tag(0xBEEF);
        let raw = t.marshal().unwrap();
        assert_eq!(&raw[..], &[0xBE, 0xEF]);
    }
}
