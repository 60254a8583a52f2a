//! Calling-convention iterators for the two ABIs a native-call stub
//! bridges: the managed runtime convention the stub is entered with, and
//! the native convention of the target function. One iterator walks one
//! argument list; the emission script resets and replays them as needed.

use bridge_common::registers::ManagedRegister;
use bridge_common::shorty::{Shorty, ShortyType};
use bridge_common::{FrameOffset, InstructionSet};

pub mod x86;
pub mod x86_64;

/// Walks the arguments as the managed caller delivered them. Every
/// argument owns a vreg shadow slot in the caller's outgoing area even
/// when it arrived in a register.
pub trait ManagedRuntimeConvention {
    fn reset_iterator(&mut self, displacement: FrameOffset);
    fn has_next(&self) -> bool;
    fn next(&mut self);
    fn is_current_param_in_register(&self) -> bool;
    fn is_current_param_on_stack(&self) -> bool {
        !self.is_current_param_in_register()
    }
    fn current_param_register(&self) -> ManagedRegister;
    fn current_param_stack_offset(&self) -> FrameOffset;
    fn is_current_param_a_reference(&self) -> bool;
    fn is_current_param_long_or_double(&self) -> bool;

    /// Register holding the method record on entry.
    fn method_register(&self) -> ManagedRegister;
    /// Shadow slot of the method record, relative to the stub frame base.
    fn method_stack_offset(&self) -> FrameOffset {
        FrameOffset(0)
    }

    fn return_register(&self) -> Option<ManagedRegister>;
    fn size_of_return_value(&self) -> usize;
}

/// Walks the arguments as the native callee expects them, including the
/// synthetic `JNIEnv*` and `jclass`/`this` leaders for non-critical
/// methods, and answers the frame-layout queries for the stub.
pub trait NativeCallConvention {
    fn reset_iterator(&mut self, displacement: FrameOffset);
    fn has_next(&self) -> bool;
    fn next(&mut self);
    fn is_current_param_in_register(&self) -> bool;
    fn is_current_param_on_stack(&self) -> bool {
        !self.is_current_param_in_register()
    }
    fn current_param_register(&self) -> ManagedRegister;
    fn current_param_stack_offset(&self) -> FrameOffset;
    fn is_current_param_a_reference(&self) -> bool;

    /// Size of the stub's own (managed-visible) frame: method slot,
    /// return-value spill slot, callee saves and the return address.
    /// Zero for critical natives.
    fn frame_size(&self) -> usize;
    /// Size of the outgoing-arguments area for the call this convention
    /// describes.
    fn out_frame_size(&self) -> usize;

    fn callee_save_registers(&self) -> &[ManagedRegister];
    /// Callee-save registers the emission script may claim for its own
    /// bookkeeping once the frame is built. Every supported architecture
    /// provides at least three.
    fn callee_save_scratch_registers(&self) -> &[ManagedRegister];
    fn core_spill_mask(&self) -> u32;
    fn fp_spill_mask(&self) -> u32;

    fn return_type(&self) -> ShortyType;
    fn return_register(&self) -> Option<ManagedRegister>;
    fn size_of_return_value(&self) -> usize;
    fn is_return_a_reference(&self) -> bool {
        self.return_type().is_reference()
    }
    fn has_small_return_type(&self) -> bool {
        self.return_type().is_small()
    }
    fn requires_small_result_type_extension(&self) -> bool {
        self.has_small_return_type()
    }

    /// Whether the return value must be saved across the method-end
    /// runtime call. Reference results flow through that call instead.
    fn spills_return_value(&self) -> bool;
    fn return_value_save_location(&self) -> FrameOffset;

    /// Register carrying the method record into a critical-native call.
    fn hidden_argument_register(&self) -> ManagedRegister;
    /// Whether the critical-native call doubles as the stub's return.
    fn use_tail_call(&self) -> bool;
}

/// Argument list entry, after expanding the synthetic leaders.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Param {
    JniEnv,
    DeclaringClass,
    This,
    Value(ShortyType),
}

impl Param {
    pub(crate) fn is_reference(self) -> bool {
        match self {
            Param::JniEnv => false,
            Param::DeclaringClass | Param::This => true,
            Param::Value(ty) => ty.is_reference(),
        }
    }

    pub(crate) fn is_long_or_double(self) -> bool {
        matches!(self, Param::Value(ty) if ty.is_long_or_double())
    }

    pub(crate) fn is_floating_point(self) -> bool {
        matches!(self, Param::Value(ty) if ty.is_floating_point())
    }
}

/// One precomputed argument location. Stack offsets are stored relative
/// to the iterator displacement and rebased on every query.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ParamSlot {
    pub(crate) param: Param,
    pub(crate) register: Option<ManagedRegister>,
    pub(crate) stack_rel: u32,
}

pub(crate) fn managed_param_list(is_static: bool, shorty: &Shorty) -> Vec<Param> {
    let mut params = Vec::with_capacity(shorty.num_params() + 1);
    if !is_static {
        params.push(Param::This);
    }
    params.extend(shorty.params().iter().map(|&ty| Param::Value(ty)));
    params
}

pub(crate) fn native_param_list(
    is_static: bool,
    is_critical_native: bool,
    shorty: &Shorty,
) -> Vec<Param> {
    let mut params = Vec::with_capacity(shorty.num_params() + 2);
    if !is_critical_native {
        params.push(Param::JniEnv);
        params.push(if is_static {
            Param::DeclaringClass
        } else {
            Param::This
        });
    }
    params.extend(shorty.params().iter().map(|&ty| Param::Value(ty)));
    params
}

pub fn managed_convention(
    is_static: bool,
    is_synchronized: bool,
    shorty: &Shorty,
    instruction_set: InstructionSet,
) -> Box<dyn ManagedRuntimeConvention> {
    let _ = is_synchronized;
    match instruction_set {
        InstructionSet::X86 => Box::new(x86::X86ManagedConvention::new(is_static, shorty)),
        InstructionSet::X86_64 => Box::new(x86_64::X86_64ManagedConvention::new(is_static, shorty)),
    }
}

pub fn native_convention(
    is_static: bool,
    is_synchronized: bool,
    is_fast_native: bool,
    is_critical_native: bool,
    shorty: &Shorty,
    instruction_set: InstructionSet,
) -> Box<dyn NativeCallConvention> {
    let _ = is_synchronized;
    match instruction_set {
        InstructionSet::X86 => Box::new(x86::X86NativeConvention::new(
            is_static,
            is_fast_native,
            is_critical_native,
            shorty,
        )),
        InstructionSet::X86_64 => Box::new(x86_64::X86_64NativeConvention::new(
            is_static,
            is_fast_native,
            is_critical_native,
            shorty,
        )),
    }
}
