//! x86-64 conventions. The managed runtime enters the stub with the
//! method record in RDI and arguments in RSI, RDX, RCX, R8, R9 / XMM0-7;
//! native code is called with the System V ABI. The thread pointer lives
//! in R15 and is never an argument register.

use bridge_common::registers::{CoreRegister, FloatRegister, ManagedRegister};
use bridge_common::shorty::{Shorty, ShortyType};
use bridge_common::{round_up, FrameOffset, PointerSize, OBJECT_REFERENCE_SIZE};

use crate::{
    managed_param_list, native_param_list, ManagedRuntimeConvention, NativeCallConvention,
    ParamSlot,
};

pub const RAX: CoreRegister = CoreRegister(0);
pub const RCX: CoreRegister = CoreRegister(1);
pub const RDX: CoreRegister = CoreRegister(2);
pub const RBX: CoreRegister = CoreRegister(3);
pub const RBP: CoreRegister = CoreRegister(5);
pub const RSI: CoreRegister = CoreRegister(6);
pub const RDI: CoreRegister = CoreRegister(7);
pub const R8: CoreRegister = CoreRegister(8);
pub const R9: CoreRegister = CoreRegister(9);
pub const R12: CoreRegister = CoreRegister(12);
pub const R13: CoreRegister = CoreRegister(13);
pub const R14: CoreRegister = CoreRegister(14);
pub const R15: CoreRegister = CoreRegister(15);

pub const XMM0: FloatRegister = FloatRegister(0);
pub const XMM12: FloatRegister = FloatRegister(12);
pub const XMM13: FloatRegister = FloatRegister(13);
pub const XMM14: FloatRegister = FloatRegister(14);
pub const XMM15: FloatRegister = FloatRegister(15);

const MANAGED_CORE_ARG_REGISTERS: &[CoreRegister] = &[RSI, RDX, RCX, R8, R9];
const NATIVE_CORE_ARG_REGISTERS: &[CoreRegister] = &[RDI, RSI, RDX, RCX, R8, R9];
const FP_ARG_REGISTER_COUNT: u8 = 8;

const CALLEE_SAVES: &[ManagedRegister] = &[
    ManagedRegister::Core(RBX),
    ManagedRegister::Core(RBP),
    ManagedRegister::Core(R12),
    ManagedRegister::Core(R13),
    ManagedRegister::Core(R14),
    ManagedRegister::Core(R15),
    ManagedRegister::Float(XMM12),
    ManagedRegister::Float(XMM13),
    ManagedRegister::Float(XMM14),
    ManagedRegister::Float(XMM15),
];

const CALLEE_SAVE_SCRATCH: &[ManagedRegister] = &[
    ManagedRegister::Core(R12),
    ManagedRegister::Core(R13),
    ManagedRegister::Core(R14),
];

/// Method slot + return-value spill slot + padding + XMM saves + core
/// saves + return address.
const MANAGED_FRAME_SIZE: usize = 8 + 8 + 8 + 4 * 8 + 6 * 8 + 8;

const PTR: usize = PointerSize::K64.size();

fn return_register_for(ty: ShortyType) -> Option<ManagedRegister> {
    match ty {
        ShortyType::Void => None,
        ShortyType::Float | ShortyType::Double => Some(ManagedRegister::Float(XMM0)),
        _ => Some(ManagedRegister::Core(RAX)),
    }
}

pub struct X86_64ManagedConvention {
    slots: Vec<ParamSlot>,
    itr: usize,
    displacement: FrameOffset,
    return_type: ShortyType,
}

impl X86_64ManagedConvention {
    pub fn new(is_static: bool, shorty: &Shorty) -> X86_64ManagedConvention {
        let params = managed_param_list(is_static, shorty);
        let mut slots = Vec::with_capacity(params.len());
        let mut gprs = 0usize;
        let mut fprs = 0u8;
        let mut vreg_slot = 0u32;
        for param in params {
            let register = if param.is_floating_point() {
                let reg = (fprs < FP_ARG_REGISTER_COUNT)
                    .then(|| ManagedRegister::Float(FloatRegister(fprs)));
                fprs += 1;
                reg
            } else {
                let reg = MANAGED_CORE_ARG_REGISTERS
                    .get(gprs)
                    .map(|&r| ManagedRegister::Core(r));
                gprs += 1;
                reg
            };
            slots.push(ParamSlot {
                param,
                register,
                stack_rel: (PTR as u32) + 4 * vreg_slot,
            });
            vreg_slot += if param.is_long_or_double() { 2 } else { 1 };
        }
        X86_64ManagedConvention {
            slots,
            itr: 0,
            displacement: FrameOffset(0),
            return_type: shorty.return_type(),
        }
    }

    fn current(&self) -> &ParamSlot {
        &self.slots[self.itr]
    }
}

impl ManagedRuntimeConvention for X86_64ManagedConvention {
    fn reset_iterator(&mut self, displacement: FrameOffset) {
        self.displacement = displacement;
        self.itr = 0;
    }

    fn has_next(&self) -> bool {
        self.itr < self.slots.len()
    }

    fn next(&mut self) {
        self.itr += 1;
    }

    fn is_current_param_in_register(&self) -> bool {
        self.current().register.is_some()
    }

    fn current_param_register(&self) -> ManagedRegister {
        self.current().register.expect("parameter is on the stack")
    }

    fn current_param_stack_offset(&self) -> FrameOffset {
        FrameOffset(self.displacement.0 + self.current().stack_rel)
    }

    fn is_current_param_a_reference(&self) -> bool {
        self.current().param.is_reference()
    }

    fn is_current_param_long_or_double(&self) -> bool {
        self.current().param.is_long_or_double()
    }

    fn method_register(&self) -> ManagedRegister {
        ManagedRegister::Core(RDI)
    }

    fn return_register(&self) -> Option<ManagedRegister> {
        return_register_for(self.return_type)
    }

    fn size_of_return_value(&self) -> usize {
        match self.return_type {
            ShortyType::Reference => OBJECT_REFERENCE_SIZE,
            ty => ty.component_size(),
        }
    }
}

pub struct X86_64NativeConvention {
    slots: Vec<ParamSlot>,
    itr: usize,
    displacement: FrameOffset,
    return_type: ShortyType,
    is_fast_native: bool,
    is_critical_native: bool,
    out_frame_size: usize,
}

impl X86_64NativeConvention {
    pub fn new(
        is_static: bool,
        is_fast_native: bool,
        is_critical_native: bool,
        shorty: &Shorty,
    ) -> X86_64NativeConvention {
        let params = native_param_list(is_static, is_critical_native, shorty);
        let mut slots = Vec::with_capacity(params.len());
        let mut gprs = 0usize;
        let mut fprs = 0u8;
        let mut stack_args = 0u32;
        for param in params {
            let register = if param.is_floating_point() {
                let reg = (fprs < FP_ARG_REGISTER_COUNT)
                    .then(|| ManagedRegister::Float(FloatRegister(fprs)));
                fprs += 1;
                reg
            } else {
                let reg = NATIVE_CORE_ARG_REGISTERS
                    .get(gprs)
                    .map(|&r| ManagedRegister::Core(r));
                gprs += 1;
                reg
            };
            let stack_rel = match register {
                Some(_) => u32::MAX,
                None => {
                    let rel = 8 * stack_args;
                    stack_args += 1;
                    rel
                }
            };
            slots.push(ParamSlot {
                param,
                register,
                stack_rel,
            });
        }
        let stack_bytes = 8 * stack_args as usize;
        let out_frame_size = if is_critical_native {
            // Counts the return-address slot so the whole critical frame
            // is the out-args area.
            round_up(stack_bytes + 8, 16)
        } else {
            round_up(stack_bytes, 16)
        };
        assert!(CALLEE_SAVE_SCRATCH.len() >= 3);
        X86_64NativeConvention {
            slots,
            itr: 0,
            displacement: FrameOffset(0),
            return_type: shorty.return_type(),
            is_fast_native,
            is_critical_native,
            out_frame_size,
        }
    }

    fn current(&self) -> &ParamSlot {
        &self.slots[self.itr]
    }
}

impl NativeCallConvention for X86_64NativeConvention {
    fn reset_iterator(&mut self, displacement: FrameOffset) {
        self.displacement = displacement;
        self.itr = 0;
    }

    fn has_next(&self) -> bool {
        self.itr < self.slots.len()
    }

    fn next(&mut self) {
        self.itr += 1;
    }

    fn is_current_param_in_register(&self) -> bool {
        self.current().register.is_some()
    }

    fn current_param_register(&self) -> ManagedRegister {
        self.current().register.expect("parameter is on the stack")
    }

    fn current_param_stack_offset(&self) -> FrameOffset {
        let slot = self.current();
        assert_ne!(slot.stack_rel, u32::MAX, "parameter is in a register");
        // The iterator is reset with the out-args size; stack parameters
        // start at the stack pointer.
        FrameOffset(self.displacement.0 - self.out_frame_size as u32 + slot.stack_rel)
    }

    fn is_current_param_a_reference(&self) -> bool {
        self.current().param.is_reference()
    }

    fn frame_size(&self) -> usize {
        if self.is_critical_native {
            0
        } else {
            MANAGED_FRAME_SIZE
        }
    }

    fn out_frame_size(&self) -> usize {
        self.out_frame_size
    }

    fn callee_save_registers(&self) -> &[ManagedRegister] {
        if self.is_critical_native {
            &[]
        } else {
            CALLEE_SAVES
        }
    }

    fn callee_save_scratch_registers(&self) -> &[ManagedRegister] {
        CALLEE_SAVE_SCRATCH
    }

    fn core_spill_mask(&self) -> u32 {
        if self.is_critical_native {
            0
        } else {
            CALLEE_SAVES
                .iter()
                .filter_map(|reg| match reg {
                    ManagedRegister::Core(core) => Some(core.spill_bit()),
                    _ => None,
                })
                .fold(0, |mask, bit| mask | bit)
        }
    }

    fn fp_spill_mask(&self) -> u32 {
        if self.is_critical_native {
            0
        } else {
            CALLEE_SAVES
                .iter()
                .filter_map(|reg| match reg {
                    ManagedRegister::Float(fp) => Some(fp.spill_bit()),
                    _ => None,
                })
                .fold(0, |mask, bit| mask | bit)
        }
    }

    fn return_type(&self) -> ShortyType {
        self.return_type
    }

    fn return_register(&self) -> Option<ManagedRegister> {
        return_register_for(self.return_type)
    }

    fn size_of_return_value(&self) -> usize {
        match self.return_type {
            ShortyType::Reference => PTR,
            ty => ty.component_size(),
        }
    }

    fn spills_return_value(&self) -> bool {
        !self.is_critical_native
            && !self.is_fast_native
            && self.size_of_return_value() != 0
            && !self.is_return_a_reference()
    }

    fn return_value_save_location(&self) -> FrameOffset {
        FrameOffset((self.out_frame_size + PTR) as u32)
    }

    fn hidden_argument_register(&self) -> ManagedRegister {
        ManagedRegister::Core(RAX)
    }

    fn use_tail_call(&self) -> bool {
        assert!(self.is_critical_native);
        // The 64-bit stub keeps a frame even for critical natives.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(is_static: bool, critical: bool, shorty: &str) -> X86_64NativeConvention {
        X86_64NativeConvention::new(is_static, false, critical, &Shorty::parse(shorty))
    }

    #[test]
    fn native_leaders_take_first_registers() {
        let mut conv = native(true, false, "V");
        conv.reset_iterator(FrameOffset(0));
        // JNIEnv* in RDI.
        assert_eq!(conv.current_param_register(), ManagedRegister::Core(RDI));
        conv.next();
        // jclass in RSI.
        assert_eq!(conv.current_param_register(), ManagedRegister::Core(RSI));
        conv.next();
        assert!(!conv.has_next());
    }

    #[test]
    fn fp_and_core_pools_are_independent() {
        let mut conv = native(false, false, "VIJFD");
        conv.reset_iterator(FrameOffset(0));
        conv.next(); // env (RDI)
        conv.next(); // this (RSI)
        assert_eq!(conv.current_param_register(), ManagedRegister::Core(RDX));
        conv.next();
        assert_eq!(conv.current_param_register(), ManagedRegister::Core(RCX));
        conv.next();
        assert_eq!(
            conv.current_param_register(),
            ManagedRegister::Float(FloatRegister(0))
        );
        conv.next();
        assert_eq!(
            conv.current_param_register(),
            ManagedRegister::Float(FloatRegister(1))
        );
    }

    #[test]
    fn overflow_args_take_sequential_stack_slots() {
        // env + this + 5 ints exhaust RDI..R9, the rest go to stack.
        let mut conv = native(false, false, "VIIIIIII");
        let out = conv.out_frame_size() as u32;
        conv.reset_iterator(FrameOffset(out));
        for _ in 0..6 {
            assert!(conv.is_current_param_in_register());
            conv.next();
        }
        assert!(conv.is_current_param_on_stack());
        assert_eq!(conv.current_param_stack_offset(), FrameOffset(0));
        conv.next();
        assert_eq!(conv.current_param_stack_offset(), FrameOffset(8));
        conv.next();
        assert_eq!(conv.current_param_stack_offset(), FrameOffset(16));
        assert_eq!(conv.out_frame_size(), 32);
    }

    #[test]
    fn critical_frames_are_out_args_only() {
        let conv = native(true, true, "II");
        assert_eq!(conv.frame_size(), 0);
        assert_eq!(conv.out_frame_size(), 16);
        assert!(conv.callee_save_registers().is_empty());
        assert!(!conv.use_tail_call());
    }

    #[test]
    fn spill_masks_cover_callee_saves() {
        let conv = native(true, false, "V");
        assert_eq!(conv.core_spill_mask(), 0xF028);
        assert_eq!(conv.fp_spill_mask(), 0xF000);
        assert!(conv.callee_save_scratch_registers().len() >= 3);
    }

    #[test]
    fn managed_args_shadow_the_caller_frame() {
        let shorty = Shorty::parse("VIJI");
        let mut conv = X86_64ManagedConvention::new(false, &shorty);
        conv.reset_iterator(FrameOffset(112));
        // this
        assert_eq!(conv.current_param_register(), ManagedRegister::Core(RSI));
        assert_eq!(conv.current_param_stack_offset(), FrameOffset(112 + 8));
        conv.next();
        // int
        assert_eq!(conv.current_param_register(), ManagedRegister::Core(RDX));
        assert_eq!(conv.current_param_stack_offset(), FrameOffset(112 + 12));
        conv.next();
        // long takes two vreg slots
        assert!(conv.is_current_param_long_or_double());
        assert_eq!(conv.current_param_stack_offset(), FrameOffset(112 + 16));
        conv.next();
        assert_eq!(conv.current_param_stack_offset(), FrameOffset(112 + 24));
    }

    #[test]
    fn return_value_spilling() {
        assert!(native(true, false, "I").spills_return_value());
        assert!(!native(true, false, "V").spills_return_value());
        assert!(!native(false, false, "L").spills_return_value());
        assert!(!native(true, true, "I").spills_return_value());
        let conv = native(true, false, "D");
        assert!(conv.spills_return_value());
        assert_eq!(conv.return_value_save_location(), FrameOffset(8));
    }
}
