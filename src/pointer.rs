use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::address::{AddressTranslator, Translator};

static IDENTITY: Lazy<Arc<Translator>> = Lazy::new(|| Arc::new(Translator::zero()));

/// Decodes 32-bit pointers stored at 4-byte granularity into a 64-bit address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerExpander {
    magic: i64,
}

impl PointerExpander {
    pub fn new(magic: i64) -> Self {
        Self { magic }
    }
    pub fn magic(&self) -> i64 {
        self.magic
    }
    pub fn expand(&self, compressed: i32) -> i64 {
        ((compressed as i64) << 2) + self.magic
    }
    pub fn contract(&self, address: i64) -> i32 {
        ((address - self.magic) >> 2) as i32
    }
}

/// A stored 32-bit pointer and the translator that gives it meaning.
#[derive(Clone)]
pub struct Pointer {
    value: i32,
    translator: Arc<Translator>,
    expander: Option<Arc<PointerExpander>>,
}

impl Pointer {
    pub fn new(value: i32, translator: Arc<Translator>) -> Self {
        Self {
            value,
            translator,
            expander: None,
        }
    }
    pub fn with_expander(value: i32, translator: Arc<Translator>, expander: Arc<PointerExpander>) -> Self {
        Self {
            value,
            translator,
            expander: Some(expander),
        }
    }
    /// Raw stored value.
    pub fn value(&self) -> i32 {
        self.value
    }
    /// Stored value after expansion, in the translator's pointer domain.
    pub fn expanded(&self) -> i64 {
        match &self.expander {
            Some(expander) => expander.expand(self.value),
            None => self.value as i64,
        }
    }
    pub fn address(&self) -> i64 {
        self.translator.get_address(self.expanded())
    }
    pub fn translator(&self) -> &Arc<Translator> {
        &self.translator
    }
    /// Same stored value interpreted through another translator.
    pub fn rebind(&self, translator: Arc<Translator>) -> Self {
        Self {
            value: self.value,
            translator,
            expander: self.expander.clone(),
        }
    }
}

impl Default for Pointer {
    fn default() -> Self {
        Self::new(0, IDENTITY.clone())
    }
}

impl Debug for Pointer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pointer({:#x} -> {:#x})", self.value, self.address())
    }
}

/// A stored 64-bit pointer.
#[derive(Clone)]
pub struct Pointer64 {
    value: i64,
    translator: Arc<Translator>,
}

impl Pointer64 {
    pub fn new(value: i64, translator: Arc<Translator>) -> Self {
        Self { value, translator }
    }
    pub fn value(&self) -> i64 {
        self.value
    }
    pub fn address(&self) -> i64 {
        self.translator.get_address(self.value)
    }
    pub fn translator(&self) -> &Arc<Translator> {
        &self.translator
    }
    /// Same stored value interpreted through another translator.
    pub fn rebind(&self, translator: Arc<Translator>) -> Self {
        Self::new(self.value, translator)
    }
}

impl Default for Pointer64 {
    fn default() -> Self {
        Self::new(0, IDENTITY.clone())
    }
}

impl Debug for Pointer64 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pointer64({:#x} -> {:#x})", self.value, self.address())
    }
}

impl From<Pointer> for Pointer64 {
    fn from(pointer: Pointer) -> Self {
        Pointer64::new(pointer.expanded(), pointer.translator)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_expander() {
        let expander = PointerExpander::new(0x50000000);
        assert_eq!(expander.expand(0x100), 0x50000400);
        assert_eq!(expander.contract(0x50000400), 0x100);
        for c in [0, 1, 0x1234, 0x3fff_ffff, -1] {
            assert_eq!(expander.contract(expander.expand(c)), c);
        }
    }

    #[test]
    fn test_pointer_address() {
        let translator = Arc::new(Translator::tag_data(0x100000, 0x100));
        let pointer = Pointer::new(0x100040, translator.clone());
        assert_eq!(pointer.value(), 0x100040);
        assert_eq!(pointer.address(), 0x140);

        let expanded = Pointer::with_expander(0x40010, translator, Arc::new(PointerExpander::new(0)));
        assert_eq!(expanded.value(), 0x40010);
        assert_eq!(expanded.address(), 0x140);

        let wide: Pointer64 = expanded.into();
        assert_eq!(wide.value(), 0x100040);
        assert_eq!(wide.rebind(Arc::new(Translator::zero())).address(), 0x100040);
        assert_eq!(Pointer::default().address(), 0);
    }
}
