//! Opaque random handles

use std::fmt;

use rand::RngCore;

use crate::{IfdError, Result};

macro_rules! random_handle {
    ($(#[$meta:meta])* $name:ident, $len:expr, $err:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Handle length in bytes
            pub const LEN: usize = $len;

            /// Generate a fresh random handle
            pub fn generate() -> Self {
                let mut bytes = [0u8; $len];
                rand::rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Parse a handle supplied by a caller
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                <[u8; $len]>::try_from(bytes).map(Self).map_err(|_| $err)
            }

            /// Raw handle bytes
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

random_handle!(
    /// Handle of the active context
    ContextHandle,
    16,
    IfdError::InvalidContextHandle
);

random_handle!(
    /// Handle naming one slave channel
    SlotHandle,
    24,
    IfdError::slot("malformed slot handle")
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_random() {
        let a = SlotHandle::generate();
        let b = SlotHandle::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), 24);
        assert_eq!(ContextHandle::generate().as_ref().len(), 16);
    }

    #[test]
    fn test_parse() {
        let handle = SlotHandle::generate();
        assert_eq!(SlotHandle::from_slice(handle.as_ref()).unwrap(), handle);
        assert_eq!(handle.to_string().len(), 48);
        assert!(matches!(
            SlotHandle::from_slice(&[0u8; 16]),
            Err(IfdError::InvalidSlotHandle(_))
        ));
        assert_eq!(
            ContextHandle::from_slice(&[]).unwrap_err(),
            IfdError::InvalidContextHandle
        );
    }
}
