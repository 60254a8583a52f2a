//! An assembler that records the operation stream instead of encoding
//! it. Golden-trace tests compare the recorded ops; frame bookkeeping is
//! still tracked so the emission script's balance asserts hold.

use bridge_common::registers::ManagedRegister;
use bridge_common::{FrameOffset, MemberOffset, ThreadOffset};

use crate::{
    ArgumentMove, AssemblerError, BridgeAssembler, DebugFrameOpCodeWriter, MacroLabel,
    UnaryCondition,
};

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum AsmOp {
    BuildFrame {
        frame_size: usize,
        method_register: Option<ManagedRegister>,
        callee_saves: Vec<ManagedRegister>,
    },
    RemoveFrame {
        frame_size: usize,
        may_suspend: bool,
    },
    IncreaseFrameSize(usize),
    DecreaseFrameSize(usize),
    StoreStackPointerToThread(ThreadOffset),
    MoveArguments(Vec<ArgumentMove>),
    Move {
        dest: ManagedRegister,
        src: ManagedRegister,
        size: usize,
    },
    Load {
        dest: ManagedRegister,
        src: FrameOffset,
        size: usize,
    },
    Store {
        dest: FrameOffset,
        src: ManagedRegister,
        size: usize,
    },
    LoadFrom {
        dest: ManagedRegister,
        base: ManagedRegister,
        offset: MemberOffset,
        size: usize,
    },
    StoreTo {
        base: ManagedRegister,
        offset: MemberOffset,
        src: ManagedRegister,
        size: usize,
    },
    LoadRawPtrFromThread {
        dest: ManagedRegister,
        offset: ThreadOffset,
    },
    StoreRawPtr {
        dest: FrameOffset,
        src: ManagedRegister,
    },
    Copy {
        dest: FrameOffset,
        src: FrameOffset,
        size: usize,
    },
    SignExtend {
        reg: ManagedRegister,
        size: usize,
    },
    ZeroExtend {
        reg: ManagedRegister,
        size: usize,
    },
    GetCurrentThreadToRegister(ManagedRegister),
    GetCurrentThreadToStack(FrameOffset),
    CreateJObjectInRegister {
        dest: ManagedRegister,
        spilled_reference: FrameOffset,
        src: Option<ManagedRegister>,
        null_allowed: bool,
    },
    CreateJObjectOnStack {
        dest: FrameOffset,
        spilled_reference: FrameOffset,
        null_allowed: bool,
    },
    Call {
        base: ManagedRegister,
        offset: MemberOffset,
    },
    CallFromThread(ThreadOffset),
    Jump {
        base: ManagedRegister,
        offset: MemberOffset,
    },
    Bind(MacroLabel),
    JumpTo(MacroLabel),
    TestGcMarking {
        label: MacroLabel,
        condition: UnaryCondition,
    },
    TestMarkBit {
        reg: ManagedRegister,
        label: MacroLabel,
        condition: UnaryCondition,
    },
    ExceptionPoll(MacroLabel),
    DeliverPendingException,
    SuspendCheck(MacroLabel),
}

pub struct RecordingAssembler {
    ops: Vec<AsmOp>,
    cfi: DebugFrameOpCodeWriter,
    next_label: u32,
    finalized: bool,
}

impl RecordingAssembler {
    pub fn new() -> RecordingAssembler {
        let mut cfi = DebugFrameOpCodeWriter::new();
        cfi.set_initial_cfa_offset(0);
        RecordingAssembler {
            ops: Vec::new(),
            cfi,
            next_label: 0,
            finalized: false,
        }
    }

    pub fn ops(&self) -> &[AsmOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<AsmOp> {
        self.ops
    }
}

impl Default for RecordingAssembler {
    fn default() -> RecordingAssembler {
        RecordingAssembler::new()
    }
}

impl BridgeAssembler for RecordingAssembler {
    fn cfi(&mut self) -> &mut DebugFrameOpCodeWriter {
        &mut self.cfi
    }

    fn build_frame(
        &mut self,
        frame_size: usize,
        method_register: Option<ManagedRegister>,
        callee_saves: &[ManagedRegister],
    ) {
        self.cfi.def_cfa_offset(frame_size as i32);
        self.ops.push(AsmOp::BuildFrame {
            frame_size,
            method_register,
            callee_saves: callee_saves.to_vec(),
        });
    }

    fn remove_frame(
        &mut self,
        frame_size: usize,
        _callee_saves: &[ManagedRegister],
        may_suspend: bool,
    ) {
        assert_eq!(self.cfi.current_cfa_offset(), frame_size as i32);
        self.ops.push(AsmOp::RemoveFrame {
            frame_size,
            may_suspend,
        });
    }

    fn increase_frame_size(&mut self, adjust: usize) {
        self.cfi.adjust_cfa_offset(adjust as i32);
        self.ops.push(AsmOp::IncreaseFrameSize(adjust));
    }

    fn decrease_frame_size(&mut self, adjust: usize) {
        self.cfi.adjust_cfa_offset(-(adjust as i32));
        self.ops.push(AsmOp::DecreaseFrameSize(adjust));
    }

    fn store_stack_pointer_to_thread(&mut self, offset: ThreadOffset) {
        self.ops.push(AsmOp::StoreStackPointerToThread(offset));
    }

    fn move_arguments(&mut self, moves: &[ArgumentMove]) {
        self.ops.push(AsmOp::MoveArguments(moves.to_vec()));
    }

    fn move_reg(&mut self, dest: ManagedRegister, src: ManagedRegister, size: usize) {
        self.ops.push(AsmOp::Move { dest, src, size });
    }

    fn load(&mut self, dest: ManagedRegister, src: FrameOffset, size: usize) {
        self.ops.push(AsmOp::Load { dest, src, size });
    }

    fn store(&mut self, dest: FrameOffset, src: ManagedRegister, size: usize) {
        self.ops.push(AsmOp::Store { dest, src, size });
    }

    fn load_from(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offset: MemberOffset,
        size: usize,
    ) {
        self.ops.push(AsmOp::LoadFrom {
            dest,
            base,
            offset,
            size,
        });
    }

    fn store_to(
        &mut self,
        base: ManagedRegister,
        offset: MemberOffset,
        src: ManagedRegister,
        size: usize,
    ) {
        self.ops.push(AsmOp::StoreTo {
            base,
            offset,
            src,
            size,
        });
    }

    fn load_raw_ptr_from_thread(&mut self, dest: ManagedRegister, offset: ThreadOffset) {
        self.ops.push(AsmOp::LoadRawPtrFromThread { dest, offset });
    }

    fn store_raw_ptr(&mut self, dest: FrameOffset, src: ManagedRegister) {
        self.ops.push(AsmOp::StoreRawPtr { dest, src });
    }

    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        self.ops.push(AsmOp::Copy { dest, src, size });
    }

    fn sign_extend(&mut self, reg: ManagedRegister, size: usize) {
        self.ops.push(AsmOp::SignExtend { reg, size });
    }

    fn zero_extend(&mut self, reg: ManagedRegister, size: usize) {
        self.ops.push(AsmOp::ZeroExtend { reg, size });
    }

    fn get_current_thread_to_register(&mut self, dest: ManagedRegister) {
        self.ops.push(AsmOp::GetCurrentThreadToRegister(dest));
    }

    fn get_current_thread_to_stack(&mut self, dest: FrameOffset) {
        self.ops.push(AsmOp::GetCurrentThreadToStack(dest));
    }

    fn create_jobject_in_register(
        &mut self,
        dest: ManagedRegister,
        spilled_reference: FrameOffset,
        src: Option<ManagedRegister>,
        null_allowed: bool,
    ) {
        self.ops.push(AsmOp::CreateJObjectInRegister {
            dest,
            spilled_reference,
            src,
            null_allowed,
        });
    }

    fn create_jobject_on_stack(
        &mut self,
        dest: FrameOffset,
        spilled_reference: FrameOffset,
        null_allowed: bool,
    ) {
        self.ops.push(AsmOp::CreateJObjectOnStack {
            dest,
            spilled_reference,
            null_allowed,
        });
    }

    fn call(&mut self, base: ManagedRegister, offset: MemberOffset) {
        self.ops.push(AsmOp::Call { base, offset });
    }

    fn call_from_thread(&mut self, offset: ThreadOffset) {
        self.ops.push(AsmOp::CallFromThread(offset));
    }

    fn jump(&mut self, base: ManagedRegister, offset: MemberOffset) {
        self.ops.push(AsmOp::Jump { base, offset });
    }

    fn create_label(&mut self) -> MacroLabel {
        let label = MacroLabel(self.next_label);
        self.next_label += 1;
        label
    }

    fn bind(&mut self, label: MacroLabel) {
        self.ops.push(AsmOp::Bind(label));
    }

    fn jump_to(&mut self, label: MacroLabel) {
        self.ops.push(AsmOp::JumpTo(label));
    }

    fn test_gc_marking(&mut self, label: MacroLabel, condition: UnaryCondition) {
        self.ops.push(AsmOp::TestGcMarking { label, condition });
    }

    fn test_mark_bit(
        &mut self,
        reg: ManagedRegister,
        label: MacroLabel,
        condition: UnaryCondition,
    ) {
        self.ops.push(AsmOp::TestMarkBit {
            reg,
            label,
            condition,
        });
    }

    fn exception_poll(&mut self, label: MacroLabel) {
        self.ops.push(AsmOp::ExceptionPoll(label));
    }

    fn deliver_pending_exception(&mut self) {
        self.ops.push(AsmOp::DeliverPendingException);
    }

    fn suspend_check(&mut self, label: MacroLabel) {
        self.ops.push(AsmOp::SuspendCheck(label));
    }

    fn finalize_code(&mut self) -> Result<(), AssemblerError> {
        self.finalized = true;
        Ok(())
    }

    fn code_size(&self) -> usize {
        0
    }

    fn finalize_instructions(&mut self, _out: &mut [u8]) -> Result<(), AssemblerError> {
        if !self.finalized {
            return Err(AssemblerError::NotFinalized);
        }
        Ok(())
    }
}
