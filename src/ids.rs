use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::util::buf::{BufExt, BufMutExt};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $debug_prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(id: impl AsRef<str>) -> $name {
                $name(Arc::from(id.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn ser(&self, buf: &mut impl BufMut) {
                buf.put_string(&self.0);
            }

            pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<$name> {
                Ok($name::new(buf.try_get_string()?))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "[{}:{}]", $debug_prefix, self.0)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(Arc::from(value))
            }
        }
    }
}

string_id!(
    /// Identifies a participant. It is opaque to this crate and stable for the lifetime of a
    ///  client session; a restarted client may reuse it (see link epochs in [crate::pool]).
    PeerId, "peer"
);

string_id!(
    /// Distinguishes one logical overlay network among several that share a peer pool.
    NetworkId, "net"
);

string_id!(
    /// Names one notification / request stream of a router.
    ChannelId, "chan"
);

/// Correlates a request with its response. Unique per requesting router, never reused
///  within a session - but two different requesters may well use the same id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RequestId(pub u64);

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
