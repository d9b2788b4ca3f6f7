use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};

//NB: the checked getters are named differently from `bytes`' own `try_get_*` to avoid
//     ambiguity with the trait methods that newer versions of `bytes` provide

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked deserialization helpers. All lengths and numbers are in network byte order (BE).
pub trait BufExt: Buf {
    get_checked_impl!(get_u8_checked, u8, get_u8);
    get_checked_impl!(get_u32_checked, u32, get_u32);
    get_checked_impl!(get_u64_checked, u64, get_u64);

    /// a `u32` length prefix followed by that many bytes
    fn try_get_len_prefixed(&mut self) -> anyhow::Result<Bytes> {
        let len = self.get_u32_checked()? as usize;
        if self.remaining() < len {
            bail!("buffer underflow: declared length {} exceeds remaining {} bytes", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_get_string(&mut self) -> anyhow::Result<String> {
        let raw = self.try_get_len_prefixed()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

pub trait BufMutExt: BufMut {
    fn put_len_prefixed(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32); //TODO guard against > 4GB
        self.put_slice(data);
    }

    fn put_string(&mut self, s: &str) {
        self.put_len_prefixed(s.as_bytes());
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
