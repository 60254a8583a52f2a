/// A core register identified by its hardware encoding number
/// (0 = rax/eax .. 15 = r15). Width is decided per operation, the way
/// the encoders map one id to 8/16/32/64-bit views.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CoreRegister(pub u8);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FloatRegister(pub u8);

impl CoreRegister {
    pub fn spill_bit(self) -> u32 {
        1u32 << self.0
    }
}

impl FloatRegister {
    pub fn spill_bit(self) -> u32 {
        1u32 << self.0
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ManagedRegister {
    Core(CoreRegister),
    Float(FloatRegister),
    /// Low/high halves of a 64-bit value on 32-bit targets (long return).
    CorePair(CoreRegister, CoreRegister),
}

impl ManagedRegister {
    pub fn is_core(&self) -> bool {
        matches!(self, ManagedRegister::Core(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ManagedRegister::Float(_))
    }

    pub fn as_core(&self) -> CoreRegister {
        match self {
            ManagedRegister::Core(reg) => *reg,
            other => panic!("not a core register: {:?}", other),
        }
    }
}

impl From<CoreRegister> for ManagedRegister {
    fn from(reg: CoreRegister) -> ManagedRegister {
        ManagedRegister::Core(reg)
    }
}

impl From<FloatRegister> for ManagedRegister {
    fn from(reg: FloatRegister) -> ManagedRegister {
        ManagedRegister::Float(reg)
    }
}
