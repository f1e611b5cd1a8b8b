use derivative::Derivative;
use std::marker::PhantomData;

/// Any handle which can address an index inside a container
pub trait Slot: Copy {
    fn id(&self) -> u64;

    fn set_id(&mut self, id: u64);

    fn new(id: u64) -> Self;
}

/// A [`Slot`] which additionally carries a generation so stale handles can be detected
pub trait SlotWithGeneration: Slot {
    /// Largest generation the handle can represent
    const MAX_GENERATION: u64 = u64::MAX;

    fn generation(&self) -> u64;

    fn set_generation(&mut self, generation: u64);

    fn new_with_gen(id: u64, generation: u64) -> Self;
}

/// Packs a 32-bit index and a 32-bit generation into a single u64.
///
/// Typed over `T` purely so handles into different maps cannot be mixed up.
#[derive(Derivative)]
#[derivative(Debug, PartialEq, Eq, Hash)]
pub struct DefaultSlot<T> {
    packed: u64,
    #[derivative(
        Debug = "ignore",
        PartialEq = "ignore",
        Hash = "ignore"
    )]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DefaultSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DefaultSlot<T> {}

impl<T> DefaultSlot<T> {
    /// Raw packed representation, `generation << 32 | id`
    pub fn to_bits(&self) -> u64 {
        self.packed
    }

    pub fn from_bits(packed: u64) -> Self {
        Self {
            packed,
            _marker: PhantomData,
        }
    }
}

impl<T> Slot for DefaultSlot<T> {
    fn id(&self) -> u64 {
        self.packed & 0xFFFFFFFF
    }

    fn set_id(&mut self, id: u64) {
        assert!(id <= 0xFFFFFFFF, "ID must fit within 32 bits");
        self.packed = (self.packed & 0xFFFFFFFF00000000) | (id & 0xFFFFFFFF);
    }

    fn new(id: u64) -> Self {
        assert!(id <= 0xFFFFFFFF, "ID must fit within 32 bits");
        Self::from_bits(id)
    }
}

impl<T> SlotWithGeneration for DefaultSlot<T> {
    const MAX_GENERATION: u64 = 0xFFFFFFFF;

    fn generation(&self) -> u64 {
        self.packed >> 32
    }

    fn set_generation(&mut self, generation: u64) {
        assert!(
            generation <= 0xFFFFFFFF,
            "Generation must fit within 32 bits"
        );
        self.packed = (self.packed & 0x00000000FFFFFFFF) | (generation << 32);
    }

    fn new_with_gen(id: u64, generation: u64) -> Self {
        assert!(id <= 0xFFFFFFFF, "ID must fit within 32 bits");
        assert!(
            generation <= 0xFFFFFFFF,
            "Generation must fit within 32 bits"
        );
        Self::from_bits((generation << 32) | (id & 0xFFFFFFFF))
    }
}
