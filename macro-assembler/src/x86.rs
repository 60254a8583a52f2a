//! x86 encoder. The runtime thread is reached through the FS segment;
//! EBX doubles as the internal scratch register once the incoming
//! argument registers have been spilled, which the shuffle passes below
//! guarantee. Long values split into EAX:EDX pairs.

use iced_x86::code_asm::{
    al, ax, bl, bp, bx, byte_ptr, cl, cx, di, dl, dword_ptr, dx, eax, ebp, ebx, ecx, edi, edx,
    esi, esp, si, sp, word_ptr, xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, AsmRegister16,
    AsmRegister32, AsmRegister8, AsmRegisterXmm, CodeAssembler, CodeLabel,
};

use bridge_common::layout::{
    ObjectLayout, QuickEntrypoint, ThreadLayout, MARK_BIT_SHIFT, SUSPEND_REQUEST_FLAG,
};
use bridge_common::registers::{CoreRegister, FloatRegister, ManagedRegister};
use bridge_common::{FrameOffset, MemberOffset, PointerSize, ThreadOffset};

use crate::{
    ArgumentLocation, ArgumentMove, ArgumentMoveKind, AssemblerError, BridgeAssembler,
    DebugFrameOpCodeWriter, MacroLabel, UnaryCondition,
};

const PTR: PointerSize = PointerSize::K32;

fn gpr32(reg: CoreRegister) -> AsmRegister32 {
    match reg.0 {
        0 => eax,
        1 => ecx,
        2 => edx,
        3 => ebx,
        4 => esp,
        5 => ebp,
        6 => esi,
        7 => edi,
        _ => panic!("bad core register encoding: {}", reg.0),
    }
}

fn gpr16(reg: CoreRegister) -> AsmRegister16 {
    match reg.0 {
        0 => ax,
        1 => cx,
        2 => dx,
        3 => bx,
        4 => sp,
        5 => bp,
        6 => si,
        7 => di,
        _ => panic!("bad core register encoding: {}", reg.0),
    }
}

fn gpr8(reg: CoreRegister) -> AsmRegister8 {
    match reg.0 {
        0 => al,
        1 => cl,
        2 => dl,
        3 => bl,
        _ => panic!("unsupported 8-bit register encoding: {}", reg.0),
    }
}

fn xmm(reg: FloatRegister) -> AsmRegisterXmm {
    match reg.0 {
        0 => xmm0,
        1 => xmm1,
        2 => xmm2,
        3 => xmm3,
        4 => xmm4,
        5 => xmm5,
        6 => xmm6,
        7 => xmm7,
        _ => panic!("bad xmm register encoding: {}", reg.0),
    }
}

fn fs_dword(offset: ThreadOffset) -> iced_x86::code_asm::AsmMemoryOperand {
    dword_ptr(offset.0 as u64).fs()
}

/// x86 DWARF numbering: eax, ecx, edx, ebx, esp, ebp, esi, edi.
fn dwarf_core(reg: CoreRegister) -> u32 {
    reg.0 as u32
}

const SCRATCH: CoreRegister = CoreRegister(3); // ebx

pub struct X86Assembler {
    asm: CodeAssembler,
    cfi: DebugFrameOpCodeWriter,
    labels: Vec<CodeLabel>,
    code: Option<Vec<u8>>,
}

impl X86Assembler {
    pub fn new() -> X86Assembler {
        let mut cfi = DebugFrameOpCodeWriter::new();
        cfi.set_initial_cfa_offset(4);
        X86Assembler {
            asm: CodeAssembler::new(32).unwrap(),
            cfi,
            labels: Vec::new(),
            code: None,
        }
    }

    fn cores(callee_saves: &[ManagedRegister]) -> Vec<CoreRegister> {
        callee_saves.iter().map(|reg| reg.as_core()).collect()
    }

    fn store_core_sized(&mut self, dest: FrameOffset, src: CoreRegister, size: usize) {
        let disp = dest.0 as i32;
        match size {
            1 => self.asm.mov(byte_ptr(esp + disp), gpr8(src)).unwrap(),
            2 => self.asm.mov(word_ptr(esp + disp), gpr16(src)).unwrap(),
            4 => self.asm.mov(dword_ptr(esp + disp), gpr32(src)).unwrap(),
            _ => panic!("bad store size: {}", size),
        }
    }

    fn stack_copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        debug_assert!(size == 4 || size == 8);
        let mut moved = 0i32;
        while moved < size as i32 {
            self.asm
                .mov(gpr32(SCRATCH), dword_ptr(esp + (src.0 as i32 + moved)))
                .unwrap();
            self.asm
                .mov(dword_ptr(esp + (dest.0 as i32 + moved)), gpr32(SCRATCH))
                .unwrap();
            moved += 4;
        }
    }
}

impl Default for X86Assembler {
    fn default() -> X86Assembler {
        X86Assembler::new()
    }
}

impl BridgeAssembler for X86Assembler {
    fn cfi(&mut self) -> &mut DebugFrameOpCodeWriter {
        &mut self.cfi
    }

    fn build_frame(
        &mut self,
        frame_size: usize,
        method_register: Option<ManagedRegister>,
        callee_saves: &[ManagedRegister],
    ) {
        debug_assert!(frame_size == 4 || frame_size % 16 == 0);
        let cores = Self::cores(callee_saves);
        for &core in &cores {
            self.asm.push(gpr32(core)).unwrap();
            self.cfi.adjust_cfa_offset(4);
            let cfa_offset = self.cfi.current_cfa_offset();
            self.cfi.rel_offset(dwarf_core(core), cfa_offset);
        }
        let rest = frame_size - 4 - 4 * cores.len();
        if rest != 0 {
            self.asm.sub(esp, rest as i32).unwrap();
            self.cfi.adjust_cfa_offset(rest as i32);
        }
        if let Some(method) = method_register {
            self.asm
                .mov(dword_ptr(esp), gpr32(method.as_core()))
                .unwrap();
        }
    }

    fn remove_frame(
        &mut self,
        frame_size: usize,
        callee_saves: &[ManagedRegister],
        _may_suspend: bool,
    ) {
        assert_eq!(self.cfi.current_cfa_offset(), frame_size as i32);
        let cores = Self::cores(callee_saves);
        self.cfi.remember_state();
        let rest = frame_size - 4 - 4 * cores.len();
        if rest != 0 {
            self.asm.add(esp, rest as i32).unwrap();
            self.cfi.adjust_cfa_offset(-(rest as i32));
        }
        for &core in cores.iter().rev() {
            self.asm.pop(gpr32(core)).unwrap();
            self.cfi.adjust_cfa_offset(-4);
            self.cfi.restore(dwarf_core(core));
        }
        self.asm.ret().unwrap();
        self.cfi.restore_state();
        self.cfi.def_cfa_offset(frame_size as i32);
    }

    fn increase_frame_size(&mut self, adjust: usize) {
        if adjust != 0 {
            self.asm.sub(esp, adjust as i32).unwrap();
            self.cfi.adjust_cfa_offset(adjust as i32);
        }
    }

    fn decrease_frame_size(&mut self, adjust: usize) {
        if adjust != 0 {
            self.asm.add(esp, adjust as i32).unwrap();
            self.cfi.adjust_cfa_offset(-(adjust as i32));
        }
    }

    fn store_stack_pointer_to_thread(&mut self, offset: ThreadOffset) {
        self.asm.mov(fs_dword(offset), esp).unwrap();
    }

    fn move_arguments(&mut self, moves: &[ArgumentMove]) {
        // Register-to-register traffic first (critical-native only; the
        // pools line up, so these are identity moves in practice).
        for arg_move in moves {
            if let (Some(src), Some(dest)) = (arg_move.src.register(), arg_move.dest.register()) {
                self.move_reg(dest, src, arg_move.dest.size());
            }
        }
        // Spill every register source to the stack, including the raw
        // spill half of handle conversions. After this pass the incoming
        // argument registers are dead and EBX is safe to scratch.
        for arg_move in moves {
            if let Some(reg) = arg_move.src.register() {
                match arg_move.dest {
                    ArgumentLocation::Stack { offset, size } => match arg_move.kind {
                        ArgumentMoveKind::Value | ArgumentMoveKind::RefInPlace => {
                            self.store(offset, reg, size)
                        }
                        ArgumentMoveKind::RefToHandle { managed_slot } => {
                            self.store_core_sized(managed_slot, reg.as_core(), 4)
                        }
                    },
                    ArgumentLocation::Register { .. } => {}
                }
            }
        }
        // Handle conversions and the remaining stack traffic.
        for (i, arg_move) in moves.iter().enumerate() {
            match (arg_move.kind, arg_move.dest) {
                (ArgumentMoveKind::RefToHandle { managed_slot }, ArgumentLocation::Stack { offset, .. }) => {
                    self.create_jobject_on_stack(offset, managed_slot, i != 0);
                }
                (
                    ArgumentMoveKind::RefToHandle { managed_slot },
                    ArgumentLocation::Register { reg, .. },
                ) => {
                    self.create_jobject_in_register(reg, managed_slot, None, i != 0);
                }
                (_, ArgumentLocation::Register { reg, size }) => {
                    if let ArgumentLocation::Stack { offset, .. } = arg_move.src {
                        self.load(reg, offset, size);
                    }
                }
                (_, ArgumentLocation::Stack { offset, size }) => {
                    if let ArgumentLocation::Stack { offset: src, .. } = arg_move.src {
                        if src != offset {
                            self.stack_copy(offset, src, size);
                        }
                    }
                }
            }
        }
    }

    fn move_reg(&mut self, dest: ManagedRegister, src: ManagedRegister, size: usize) {
        if dest == src {
            return;
        }
        match (dest, src) {
            (ManagedRegister::Core(d), ManagedRegister::Core(s)) => {
                self.asm.mov(gpr32(d), gpr32(s)).unwrap();
            }
            (ManagedRegister::Float(d), ManagedRegister::Float(s)) => {
                if size <= 4 {
                    self.asm.movss(xmm(d), xmm(s)).unwrap();
                } else {
                    self.asm.movsd_2(xmm(d), xmm(s)).unwrap();
                }
            }
            _ => panic!("unsupported register move"),
        }
    }

    fn load(&mut self, dest: ManagedRegister, src: FrameOffset, size: usize) {
        let disp = src.0 as i32;
        match dest {
            ManagedRegister::Core(core) => {
                debug_assert_eq!(size, 4);
                self.asm.mov(gpr32(core), dword_ptr(esp + disp)).unwrap();
            }
            ManagedRegister::CorePair(lo, hi) => {
                debug_assert_eq!(size, 8);
                self.asm.mov(gpr32(lo), dword_ptr(esp + disp)).unwrap();
                self.asm.mov(gpr32(hi), dword_ptr(esp + disp + 4)).unwrap();
            }
            ManagedRegister::Float(fp) => {
                let reg = xmm(fp);
                if size <= 4 {
                    self.asm.movss(reg, dword_ptr(esp + disp)).unwrap();
                } else {
                    self.asm.movsd_2(reg, dword_ptr(esp + disp)).unwrap();
                }
            }
        }
    }

    fn store(&mut self, dest: FrameOffset, src: ManagedRegister, size: usize) {
        let disp = dest.0 as i32;
        match src {
            ManagedRegister::Core(core) => self.store_core_sized(dest, core, size),
            ManagedRegister::CorePair(lo, hi) => {
                debug_assert_eq!(size, 8);
                self.asm.mov(dword_ptr(esp + disp), gpr32(lo)).unwrap();
                self.asm.mov(dword_ptr(esp + disp + 4), gpr32(hi)).unwrap();
            }
            ManagedRegister::Float(fp) => {
                let reg = xmm(fp);
                if size <= 4 {
                    self.asm.movss(dword_ptr(esp + disp), reg).unwrap();
                } else {
                    self.asm.movsd_2(dword_ptr(esp + disp), reg).unwrap();
                }
            }
        }
    }

    fn load_from(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offset: MemberOffset,
        size: usize,
    ) {
        debug_assert_eq!(size, 4);
        let _ = size;
        self.asm
            .mov(
                gpr32(dest.as_core()),
                dword_ptr(gpr32(base.as_core()) + offset.0 as i32),
            )
            .unwrap();
    }

    fn store_to(
        &mut self,
        base: ManagedRegister,
        offset: MemberOffset,
        src: ManagedRegister,
        size: usize,
    ) {
        debug_assert_eq!(size, 4);
        let _ = size;
        self.asm
            .mov(
                dword_ptr(gpr32(base.as_core()) + offset.0 as i32),
                gpr32(src.as_core()),
            )
            .unwrap();
    }

    fn load_raw_ptr_from_thread(&mut self, dest: ManagedRegister, offset: ThreadOffset) {
        self.asm.mov(gpr32(dest.as_core()), fs_dword(offset)).unwrap();
    }

    fn store_raw_ptr(&mut self, dest: FrameOffset, src: ManagedRegister) {
        self.store_core_sized(dest, src.as_core(), PTR.size());
    }

    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        self.stack_copy(dest, src, size);
    }

    fn sign_extend(&mut self, reg: ManagedRegister, size: usize) {
        let core = reg.as_core();
        match size {
            1 => self.asm.movsx(gpr32(core), gpr8(core)).unwrap(),
            2 => self.asm.movsx(gpr32(core), gpr16(core)).unwrap(),
            _ => panic!("bad extension size: {}", size),
        }
    }

    fn zero_extend(&mut self, reg: ManagedRegister, size: usize) {
        let core = reg.as_core();
        match size {
            1 => self.asm.movzx(gpr32(core), gpr8(core)).unwrap(),
            2 => self.asm.movzx(gpr32(core), gpr16(core)).unwrap(),
            _ => panic!("bad extension size: {}", size),
        }
    }

    fn get_current_thread_to_register(&mut self, dest: ManagedRegister) {
        self.asm
            .mov(gpr32(dest.as_core()), fs_dword(ThreadLayout::self_offset(PTR)))
            .unwrap();
    }

    fn get_current_thread_to_stack(&mut self, dest: FrameOffset) {
        self.asm
            .mov(gpr32(SCRATCH), fs_dword(ThreadLayout::self_offset(PTR)))
            .unwrap();
        self.asm
            .mov(dword_ptr(esp + dest.0 as i32), gpr32(SCRATCH))
            .unwrap();
    }

    fn create_jobject_in_register(
        &mut self,
        dest: ManagedRegister,
        spilled_reference: FrameOffset,
        src: Option<ManagedRegister>,
        null_allowed: bool,
    ) {
        let dest = dest.as_core();
        let slot = spilled_reference.0 as i32;
        if let Some(src_reg) = src {
            self.asm
                .mov(dword_ptr(esp + slot), gpr32(src_reg.as_core()))
                .unwrap();
        }
        if null_allowed {
            match src {
                Some(src_reg) => {
                    let s = gpr32(src_reg.as_core());
                    self.asm.test(s, s).unwrap();
                }
                None => self.asm.cmp(dword_ptr(esp + slot), 0).unwrap(),
            }
            let mut done = self.asm.create_label();
            self.asm.lea(gpr32(dest), dword_ptr(esp + slot)).unwrap();
            self.asm.jne(done).unwrap();
            self.asm.xor(gpr32(dest), gpr32(dest)).unwrap();
            self.asm.set_label(&mut done).unwrap();
            self.asm.zero_bytes().unwrap();
        } else {
            self.asm.lea(gpr32(dest), dword_ptr(esp + slot)).unwrap();
        }
    }

    fn create_jobject_on_stack(
        &mut self,
        dest: FrameOffset,
        spilled_reference: FrameOffset,
        null_allowed: bool,
    ) {
        let slot = spilled_reference.0 as i32;
        self.asm.lea(gpr32(SCRATCH), dword_ptr(esp + slot)).unwrap();
        if null_allowed {
            self.asm.cmp(dword_ptr(esp + slot), 0).unwrap();
            let mut done = self.asm.create_label();
            self.asm.jne(done).unwrap();
            self.asm.xor(gpr32(SCRATCH), gpr32(SCRATCH)).unwrap();
            self.asm.set_label(&mut done).unwrap();
            self.asm.zero_bytes().unwrap();
        }
        self.asm
            .mov(dword_ptr(esp + dest.0 as i32), gpr32(SCRATCH))
            .unwrap();
    }

    fn call(&mut self, base: ManagedRegister, offset: MemberOffset) {
        self.asm
            .call(dword_ptr(gpr32(base.as_core()) + offset.0 as i32))
            .unwrap();
    }

    fn call_from_thread(&mut self, offset: ThreadOffset) {
        self.asm.call(fs_dword(offset)).unwrap();
    }

    fn jump(&mut self, base: ManagedRegister, offset: MemberOffset) {
        self.asm
            .jmp(dword_ptr(gpr32(base.as_core()) + offset.0 as i32))
            .unwrap();
    }

    fn create_label(&mut self) -> MacroLabel {
        let label = MacroLabel(self.labels.len() as u32);
        self.labels.push(self.asm.create_label());
        label
    }

    fn bind(&mut self, label: MacroLabel) {
        self.asm
            .set_label(&mut self.labels[label.0 as usize])
            .unwrap();
        self.asm.zero_bytes().unwrap();
    }

    fn jump_to(&mut self, label: MacroLabel) {
        let target = self.labels[label.0 as usize];
        self.asm.jmp(target).unwrap();
    }

    fn test_gc_marking(&mut self, label: MacroLabel, condition: UnaryCondition) {
        self.asm
            .cmp(fs_dword(ThreadLayout::is_gc_marking_offset()), 0)
            .unwrap();
        let target = self.labels[label.0 as usize];
        match condition {
            UnaryCondition::Zero => self.asm.je(target).unwrap(),
            UnaryCondition::NotZero => self.asm.jne(target).unwrap(),
        }
    }

    fn test_mark_bit(
        &mut self,
        reg: ManagedRegister,
        label: MacroLabel,
        condition: UnaryCondition,
    ) {
        let monitor = ObjectLayout::monitor_offset().0 as i32;
        self.asm
            .test(
                dword_ptr(gpr32(reg.as_core()) + monitor),
                1i32 << MARK_BIT_SHIFT,
            )
            .unwrap();
        let target = self.labels[label.0 as usize];
        match condition {
            UnaryCondition::Zero => self.asm.je(target).unwrap(),
            UnaryCondition::NotZero => self.asm.jne(target).unwrap(),
        }
    }

    fn exception_poll(&mut self, label: MacroLabel) {
        self.asm
            .cmp(fs_dword(ThreadLayout::exception_offset(PTR)), 0)
            .unwrap();
        let target = self.labels[label.0 as usize];
        self.asm.jne(target).unwrap();
    }

    fn deliver_pending_exception(&mut self) {
        self.asm
            .call(fs_dword(QuickEntrypoint::DeliverException.thread_offset(PTR)))
            .unwrap();
        self.asm.int3().unwrap();
    }

    fn suspend_check(&mut self, label: MacroLabel) {
        self.asm
            .test(
                fs_dword(ThreadLayout::flags_offset()),
                SUSPEND_REQUEST_FLAG as i32,
            )
            .unwrap();
        let target = self.labels[label.0 as usize];
        self.asm.jne(target).unwrap();
    }

    fn finalize_code(&mut self) -> Result<(), AssemblerError> {
        let code = self
            .asm
            .assemble(0)
            .map_err(|e| AssemblerError::Encode(e.to_string()))?;
        self.code = Some(code);
        Ok(())
    }

    fn code_size(&self) -> usize {
        self.code.as_ref().map(|code| code.len()).unwrap_or(0)
    }

    fn finalize_instructions(&mut self, out: &mut [u8]) -> Result<(), AssemblerError> {
        let code = self.code.as_ref().ok_or(AssemblerError::NotFinalized)?;
        if out.len() < code.len() {
            return Err(AssemblerError::BufferTooSmall {
                needed: code.len(),
                have: out.len(),
            });
        }
        out[..code.len()].copy_from_slice(code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalize(mut asm: X86Assembler) -> Vec<u8> {
        asm.finalize_code().unwrap();
        let mut code = vec![0u8; asm.code_size()];
        asm.finalize_instructions(&mut code).unwrap();
        code
    }

    #[test]
    fn tail_frame_emits_no_adjustment() {
        let mut asm = X86Assembler::new();
        asm.build_frame(4, None, &[]);
        assert_eq!(asm.cfi().current_cfa_offset(), 4);
        asm.jump(
            ManagedRegister::Core(CoreRegister(0)),
            MemberOffset(20),
        );
        // Only the indirect jump itself.
        assert_eq!(finalize(asm), vec![0xff, 0x60, 0x14]);
    }

    #[test]
    fn pair_store_splits_the_halves() {
        let mut asm = X86Assembler::new();
        asm.store(
            FrameOffset(20),
            ManagedRegister::CorePair(CoreRegister(0), CoreRegister(2)),
            8,
        );
        let code = finalize(asm);
        // mov [esp+20], eax; mov [esp+24], edx
        assert_eq!(
            code,
            vec![0x89, 0x44, 0x24, 0x14, 0x89, 0x54, 0x24, 0x18]
        );
    }

    #[test]
    fn frame_round_trip_balances_cfa() {
        let saves = [
            ManagedRegister::Core(CoreRegister(5)),
            ManagedRegister::Core(CoreRegister(6)),
            ManagedRegister::Core(CoreRegister(7)),
        ];
        let mut asm = X86Assembler::new();
        asm.build_frame(32, Some(ManagedRegister::Core(CoreRegister(0))), &saves);
        assert_eq!(asm.cfi().current_cfa_offset(), 32);
        asm.remove_frame(32, &saves, true);
        assert_eq!(asm.cfi().current_cfa_offset(), 32);
        assert!(!finalize(asm).is_empty());
    }
}
