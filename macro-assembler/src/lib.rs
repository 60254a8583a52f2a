//! Op-level macro assembler driven by the bridge emission script. One
//! trait call is one logical stub operation; the per-architecture
//! implementations lower them to machine instructions, the recording
//! implementation logs them for golden-trace tests.

use thiserror::Error;

use bridge_common::registers::ManagedRegister;
use bridge_common::{FrameOffset, InstructionSet, MemberOffset, ThreadOffset};

pub mod cfi;
pub mod recording;
pub mod x86;
pub mod x86_64;

pub use cfi::DebugFrameOpCodeWriter;

#[derive(Error, Debug)]
pub enum AssemblerError {
    #[error("instruction encoding failed: {0}")]
    Encode(String),
    #[error("code has not been finalized")]
    NotFinalized,
    #[error("output buffer holds {have} bytes, code needs {needed}")]
    BufferTooSmall { needed: usize, have: usize },
}

/// Opaque label handle minted by `create_label`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MacroLabel(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum UnaryCondition {
    Zero,
    NotZero,
}

/// Where one argument lives, together with its width in bytes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ArgumentLocation {
    Register { reg: ManagedRegister, size: usize },
    Stack { offset: FrameOffset, size: usize },
}

impl ArgumentLocation {
    pub fn size(&self) -> usize {
        match self {
            ArgumentLocation::Register { size, .. } => *size,
            ArgumentLocation::Stack { size, .. } => *size,
        }
    }

    pub fn register(&self) -> Option<ManagedRegister> {
        match self {
            ArgumentLocation::Register { reg, .. } => Some(*reg),
            ArgumentLocation::Stack { .. } => None,
        }
    }
}

/// How one argument travels between the two conventions.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ArgumentMoveKind {
    /// Plain copy at the stated width.
    Value,
    /// Raw reference spill with no handle conversion.
    RefInPlace,
    /// Convert the reference to an indirect handle; the handle points at
    /// `managed_slot`, the frame slot holding the raw reference.
    RefToHandle { managed_slot: FrameOffset },
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ArgumentMove {
    pub src: ArgumentLocation,
    pub dest: ArgumentLocation,
    pub kind: ArgumentMoveKind,
}

pub trait BridgeAssembler {
    fn cfi(&mut self) -> &mut DebugFrameOpCodeWriter;

    /// Build the stub frame: save callee saves, store the method record
    /// at the frame base, leave the stack pointer `frame_size` below the
    /// return address.
    fn build_frame(
        &mut self,
        frame_size: usize,
        method_register: Option<ManagedRegister>,
        callee_saves: &[ManagedRegister],
    );
    fn remove_frame(&mut self, frame_size: usize, callee_saves: &[ManagedRegister], may_suspend: bool);
    fn increase_frame_size(&mut self, adjust: usize);
    fn decrease_frame_size(&mut self, adjust: usize);

    fn store_stack_pointer_to_thread(&mut self, offset: ThreadOffset);

    /// Realize a whole argument shuffle atomically. The first move of a
    /// `RefToHandle` sequence is treated as statically non-null.
    fn move_arguments(&mut self, moves: &[ArgumentMove]);

    fn move_reg(&mut self, dest: ManagedRegister, src: ManagedRegister, size: usize);
    fn load(&mut self, dest: ManagedRegister, src: FrameOffset, size: usize);
    fn store(&mut self, dest: FrameOffset, src: ManagedRegister, size: usize);
    fn load_from(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offset: MemberOffset,
        size: usize,
    );
    fn store_to(
        &mut self,
        base: ManagedRegister,
        offset: MemberOffset,
        src: ManagedRegister,
        size: usize,
    );
    fn load_raw_ptr_from_thread(&mut self, dest: ManagedRegister, offset: ThreadOffset);
    fn store_raw_ptr(&mut self, dest: FrameOffset, src: ManagedRegister);
    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize);

    fn sign_extend(&mut self, reg: ManagedRegister, size: usize);
    fn zero_extend(&mut self, reg: ManagedRegister, size: usize);

    fn get_current_thread_to_register(&mut self, dest: ManagedRegister);
    fn get_current_thread_to_stack(&mut self, dest: FrameOffset);

    /// Turn the raw reference at `spilled_reference` into an indirect
    /// handle in `dest`. A register source is spilled to the slot first.
    fn create_jobject_in_register(
        &mut self,
        dest: ManagedRegister,
        spilled_reference: FrameOffset,
        src: Option<ManagedRegister>,
        null_allowed: bool,
    );
    fn create_jobject_on_stack(
        &mut self,
        dest: FrameOffset,
        spilled_reference: FrameOffset,
        null_allowed: bool,
    );

    /// Indirect call through `[base + offset]`.
    fn call(&mut self, base: ManagedRegister, offset: MemberOffset);
    fn call_from_thread(&mut self, offset: ThreadOffset);
    /// Indirect tail jump through `[base + offset]`.
    fn jump(&mut self, base: ManagedRegister, offset: MemberOffset);

    fn create_label(&mut self) -> MacroLabel;
    fn bind(&mut self, label: MacroLabel);
    fn jump_to(&mut self, label: MacroLabel);

    fn test_gc_marking(&mut self, label: MacroLabel, condition: UnaryCondition);
    fn test_mark_bit(&mut self, reg: ManagedRegister, label: MacroLabel, condition: UnaryCondition);
    fn exception_poll(&mut self, label: MacroLabel);
    fn deliver_pending_exception(&mut self);
    fn suspend_check(&mut self, label: MacroLabel);

    fn finalize_code(&mut self) -> Result<(), AssemblerError>;
    fn code_size(&self) -> usize;
    fn finalize_instructions(&mut self, out: &mut [u8]) -> Result<(), AssemblerError>;
}

pub fn create_assembler(instruction_set: InstructionSet) -> Box<dyn BridgeAssembler> {
    match instruction_set {
        InstructionSet::X86 => Box::new(x86::X86Assembler::new()),
        InstructionSet::X86_64 => Box::new(x86_64::X86_64Assembler::new()),
    }
}
