//! x86 conventions. The managed runtime enters the stub with the method
//! record in EAX and int-like arguments in ECX, EDX, EBX; wide and
//! floating-point arguments stay in their vreg slots. Plain and fast
//! natives are called cdecl; critical natives are registered with the
//! register-based variant (ECX, EDX) so argument-free targets can be
//! tail-called. The thread is reached through the FS segment.

use bridge_common::registers::{CoreRegister, FloatRegister, ManagedRegister};
use bridge_common::shorty::{Shorty, ShortyType};
use bridge_common::{round_up, FrameOffset, PointerSize, OBJECT_REFERENCE_SIZE};

use crate::{
    managed_param_list, native_param_list, ManagedRuntimeConvention, NativeCallConvention, Param,
    ParamSlot,
};

pub const EAX: CoreRegister = CoreRegister(0);
pub const ECX: CoreRegister = CoreRegister(1);
pub const EDX: CoreRegister = CoreRegister(2);
pub const EBX: CoreRegister = CoreRegister(3);
pub const EBP: CoreRegister = CoreRegister(5);
pub const ESI: CoreRegister = CoreRegister(6);
pub const EDI: CoreRegister = CoreRegister(7);

pub const XMM0: FloatRegister = FloatRegister(0);

const MANAGED_CORE_ARG_REGISTERS: &[CoreRegister] = &[ECX, EDX, EBX];
const CRITICAL_CORE_ARG_REGISTERS: &[CoreRegister] = &[ECX, EDX];

const CALLEE_SAVES: &[ManagedRegister] = &[
    ManagedRegister::Core(EBP),
    ManagedRegister::Core(ESI),
    ManagedRegister::Core(EDI),
];

/// Method slot + return-value spill slot + padding + core saves + return
/// address.
const MANAGED_FRAME_SIZE: usize = 4 + 8 + 4 + 3 * 4 + 4;

const PTR: usize = PointerSize::K32.size();

fn return_register_for(ty: ShortyType) -> Option<ManagedRegister> {
    match ty {
        ShortyType::Void => None,
        ShortyType::Long => Some(ManagedRegister::CorePair(EAX, EDX)),
        ShortyType::Float | ShortyType::Double => Some(ManagedRegister::Float(XMM0)),
        _ => Some(ManagedRegister::Core(EAX)),
    }
}

fn param_stack_bytes(param: Param) -> u32 {
    if param.is_long_or_double() {
        8
    } else {
        4
    }
}

pub struct X86ManagedConvention {
    slots: Vec<ParamSlot>,
    itr: usize,
    displacement: FrameOffset,
    return_type: ShortyType,
}

impl X86ManagedConvention {
    pub fn new(is_static: bool, shorty: &Shorty) -> X86ManagedConvention {
        let params = managed_param_list(is_static, shorty);
        let mut slots = Vec::with_capacity(params.len());
        let mut gprs = 0usize;
        let mut vreg_slot = 0u32;
        for param in params {
            let register = if param.is_floating_point() || param.is_long_or_double() {
                None
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
        X86ManagedConvention {
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

impl ManagedRuntimeConvention for X86ManagedConvention {
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
        ManagedRegister::Core(EAX)
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

pub struct X86NativeConvention {
    slots: Vec<ParamSlot>,
    itr: usize,
    displacement: FrameOffset,
    return_type: ShortyType,
    is_fast_native: bool,
    is_critical_native: bool,
    out_frame_size: usize,
}

impl X86NativeConvention {
    pub fn new(
        is_static: bool,
        is_fast_native: bool,
        is_critical_native: bool,
        shorty: &Shorty,
    ) -> X86NativeConvention {
        let params = native_param_list(is_static, is_critical_native, shorty);
        let mut slots = Vec::with_capacity(params.len());
        let mut gprs = 0usize;
        let mut stack_bytes = 0u32;
        for param in params {
            let register = if is_critical_native
                && !param.is_floating_point()
                && !param.is_long_or_double()
            {
                let reg = CRITICAL_CORE_ARG_REGISTERS
                    .get(gprs)
                    .map(|&r| ManagedRegister::Core(r));
                gprs += 1;
                reg
            } else {
                None
            };
            let stack_rel = match register {
                Some(_) => u32::MAX,
                None => {
                    let rel = stack_bytes;
                    stack_bytes += param_stack_bytes(param);
                    rel
                }
            };
            slots.push(ParamSlot {
                param,
                register,
                stack_rel,
            });
        }
        let out_frame_size = if is_critical_native {
            if stack_bytes == 0 {
                // The return-address slot is the whole frame; the call
                // becomes a tail call.
                PTR
            } else {
                round_up(stack_bytes as usize + PTR, 16)
            }
        } else {
            round_up(stack_bytes as usize, 16)
        };
        assert!(CALLEE_SAVES.len() >= 3);
        X86NativeConvention {
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

impl NativeCallConvention for X86NativeConvention {
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
            round_up(MANAGED_FRAME_SIZE, 16)
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
        CALLEE_SAVES
    }

    fn core_spill_mask(&self) -> u32 {
        if self.is_critical_native {
            0
        } else {
            CALLEE_SAVES
                .iter()
                .map(|reg| reg.as_core().spill_bit())
                .fold(0, |mask, bit| mask | bit)
        }
    }

    fn fp_spill_mask(&self) -> u32 {
        0
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

    fn requires_small_result_type_extension(&self) -> bool {
        // The register-based critical ABI hands back small results
        // already widened, which keeps tail calls legal.
        self.has_small_return_type() && !self.is_critical_native
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
        ManagedRegister::Core(EAX)
    }

    fn use_tail_call(&self) -> bool {
        assert!(self.is_critical_native);
        self.out_frame_size == PTR
    }
}
