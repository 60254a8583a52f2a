//! Compiles the trampoline that adapts a managed call to a native method
//! implementation: frame setup, thread-state transition, local-reference
//! frame management, the dual-convention argument shuffle, the native
//! call itself and exception propagation on the way out.

use log::{debug, trace};

use bridge_common::layout::QuickEntrypoint;
use bridge_common::options::{CompilerOptions, MethodTable};
use bridge_common::shorty::Shorty;
use bridge_common::{
    InstructionSet, PointerSize, ACC_CRITICAL_NATIVE, ACC_FAST_NATIVE, ACC_NATIVE, ACC_STATIC,
    ACC_SYNCHRONIZED,
};
use calling_convention::{managed_convention, native_convention};
use macro_assembler::{create_assembler, AssemblerError};

mod emitter;

pub use emitter::emit_bridge;

/// Boolean method attributes driving the emission script, derived once
/// from the access flags and the signature.
#[derive(Clone, Debug)]
pub struct MethodAttributes {
    pub is_static: bool,
    pub is_synchronized: bool,
    pub is_fast_native: bool,
    pub is_critical_native: bool,
    pub shorty: Shorty,
}

impl MethodAttributes {
    pub fn from_access_flags(access_flags: u32, shorty: Shorty) -> MethodAttributes {
        assert!(access_flags & ACC_NATIVE != 0);
        let attrs = MethodAttributes {
            is_static: access_flags & ACC_STATIC != 0,
            is_synchronized: access_flags & ACC_SYNCHRONIZED != 0,
            is_fast_native: access_flags & ACC_FAST_NATIVE != 0,
            is_critical_native: access_flags & ACC_CRITICAL_NATIVE != 0,
            shorty,
        };
        attrs.validate();
        attrs
    }

    /// Attribute combinations ruled out by the annotation contract.
    /// Release builds trust the class-file verifier and skip this.
    fn validate(&self) {
        debug_assert!(
            !(self.is_fast_native && self.is_critical_native),
            "a native method cannot be both fast and critical"
        );
        debug_assert!(
            !(self.is_fast_native && self.is_synchronized),
            "synchronized natives cannot be fast, the start and end calls perform the locking"
        );
        if self.is_critical_native {
            debug_assert!(
                self.is_static,
                "critical natives cannot be virtual, that would need a this reference"
            );
            debug_assert!(
                !self.is_synchronized,
                "critical natives cannot be synchronized, that would need a lock reference"
            );
            debug_assert!(
                self.shorty.all().iter().all(|ty| !ty.is_reference()),
                "critical natives cannot take or return references"
            );
        }
    }
}

/// Finished stub: fresh code bytes plus the frame metadata the runtime
/// records next to the method.
#[derive(Clone, Debug)]
pub struct CompiledBridgeMethod {
    pub instruction_set: InstructionSet,
    pub code: Vec<u8>,
    pub managed_frame_size: usize,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub cfi: Vec<u8>,
}

/// Shorty of the method-end runtime callback: the decoded reference
/// result and the unlock object are the only possible arguments.
pub fn end_call_shorty(reference_return: bool, is_synchronized: bool) -> &'static str {
    if reference_return && is_synchronized {
        "IL"
    } else if reference_return {
        "I"
    } else {
        "V"
    }
}

pub(crate) fn jni_start_entrypoint(is_synchronized: bool) -> QuickEntrypoint {
    if is_synchronized {
        QuickEntrypoint::JniMethodStartSynchronized
    } else {
        QuickEntrypoint::JniMethodStart
    }
}

pub(crate) fn jni_end_entrypoint(reference_return: bool, is_synchronized: bool) -> QuickEntrypoint {
    match (reference_return, is_synchronized) {
        (false, false) => QuickEntrypoint::JniMethodEnd,
        (false, true) => QuickEntrypoint::JniMethodEndSynchronized,
        (true, false) => QuickEntrypoint::JniMethodEndWithReference,
        (true, true) => QuickEntrypoint::JniMethodEndWithReferenceSynchronized,
    }
}

pub fn compile_native_bridge(
    options: &CompilerOptions,
    access_flags: u32,
    method_idx: u32,
    table: &dyn MethodTable,
) -> Result<CompiledBridgeMethod, AssemblerError> {
    trace!(
        "compiling native bridge for {} (flags {:#x})",
        table.pretty(method_idx),
        access_flags
    );
    let shorty = Shorty::parse(table.shorty(method_idx));
    let attrs = MethodAttributes::from_access_flags(access_flags, shorty);
    if attrs.is_fast_native {
        debug!("fast native method: {}", table.pretty(method_idx));
    }
    if attrs.is_critical_native {
        debug!("critical native method: {}", table.pretty(method_idx));
    }
    if options.instruction_set.is_64bit() {
        compile_internal(PointerSize::K64, options, &attrs)
    } else {
        compile_internal(PointerSize::K32, options, &attrs)
    }
}

fn compile_internal(
    ptr_size: PointerSize,
    options: &CompilerOptions,
    attrs: &MethodAttributes,
) -> Result<CompiledBridgeMethod, AssemblerError> {
    let isa = options.instruction_set;
    debug_assert_eq!(isa.pointer_size(), ptr_size);

    let mut mr = managed_convention(attrs.is_static, attrs.is_synchronized, &attrs.shorty, isa);
    let mut main = native_convention(
        attrs.is_static,
        attrs.is_synchronized,
        attrs.is_fast_native,
        attrs.is_critical_native,
        &attrs.shorty,
        isa,
    );
    let reference_return = attrs.shorty.return_type().is_reference();
    let end_shorty = Shorty::parse(end_call_shorty(reference_return, attrs.is_synchronized));
    let mut end = native_convention(
        attrs.is_static,
        attrs.is_synchronized,
        attrs.is_fast_native,
        attrs.is_critical_native,
        &end_shorty,
        isa,
    );

    let mut asm = create_assembler(isa);
    asm.cfi().set_enabled(options.generate_debug_info);

    emit_bridge(
        asm.as_mut(),
        mr.as_mut(),
        main.as_mut(),
        end.as_mut(),
        attrs,
        options,
    )
}

#[cfg(test)]
mod tests;
