use serde::{Deserialize, Serialize};

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl Handle {
    pub const INVALID: Handle = Handle(u64::MAX);
}

pub trait AsHandle {
    #[must_use]
    fn as_handle(&self) -> Handle;
}

impl AsHandle for u64 {
    #[inline]
    fn as_handle(&self) -> Handle {
        Handle(*self)
    }
}
