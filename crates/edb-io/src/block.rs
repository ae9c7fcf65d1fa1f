//! Scoped "blocking" flag.
//!
//! While a guard is alive the owning optimizer is issuing its own internal
//! transport call; the flag is cleared when the guard drops, including on an
//! early `?` return.

pub(crate) struct BlockGuard<'a> {
    flag: &'a mut bool,
}

impl<'a> BlockGuard<'a> {
    pub(crate) fn engage(flag: &'a mut bool) -> Self {
        *flag = true;
        Self { flag }
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        *self.flag = false;
    }
}
