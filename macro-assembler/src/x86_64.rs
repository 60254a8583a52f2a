//! x86-64 encoder. The runtime thread pointer is pinned in R15; R11 is
//! the internal scratch register (never an argument, never the method
//! register). Lowering uses the iced CodeAssembler and defers fix-ups to
//! block encoding at finalization.

use iced_x86::code_asm::{
    al, ax, bl, bp, bpl, bx, byte_ptr, cl, cx, di, dil, dl, dword_ptr, dx, eax, ebp, ebx, ecx,
    edi, edx, esi, esp, qword_ptr, r10, r10b, r10d, r10w, r11, r11b, r11d, r11w, r12, r12b, r12d,
    r12w, r13, r13b, r13d, r13w, r14, r14b, r14d, r14w, r15, r15b, r15d, r15w, r8, r8b, r8d, r8w,
    r9, r9b, r9d, r9w, rax, rbp, rbx, rcx, rdi, rdx, rsi, rsp, si, sil, sp, word_ptr, xmm0, xmm1,
    xmm10, xmm11, xmm12, xmm13, xmm14, xmm15, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9,
    AsmRegister16, AsmRegister32, AsmRegister64, AsmRegister8, AsmRegisterXmm, CodeAssembler,
    CodeLabel,
};

use bridge_common::layout::{
    ObjectLayout, ThreadLayout, MARK_BIT_SHIFT, SUSPEND_REQUEST_FLAG,
};
use bridge_common::registers::{CoreRegister, FloatRegister, ManagedRegister};
use bridge_common::{FrameOffset, MemberOffset, PointerSize, ThreadOffset};

use crate::{
    ArgumentLocation, ArgumentMove, ArgumentMoveKind, AssemblerError, BridgeAssembler,
    DebugFrameOpCodeWriter, MacroLabel, UnaryCondition,
};

const PTR: PointerSize = PointerSize::K64;

fn gpr64(reg: CoreRegister) -> AsmRegister64 {
    match reg.0 {
        0 => rax,
        1 => rcx,
        2 => rdx,
        3 => rbx,
        4 => rsp,
        5 => rbp,
        6 => rsi,
        7 => rdi,
        8 => r8,
        9 => r9,
        10 => r10,
        11 => r11,
        12 => r12,
        13 => r13,
        14 => r14,
        15 => r15,
        _ => panic!("bad core register encoding: {}", reg.0),
    }
}

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
        8 => r8d,
        9 => r9d,
        10 => r10d,
        11 => r11d,
        12 => r12d,
        13 => r13d,
        14 => r14d,
        15 => r15d,
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
        8 => r8w,
        9 => r9w,
        10 => r10w,
        11 => r11w,
        12 => r12w,
        13 => r13w,
        14 => r14w,
        15 => r15w,
        _ => panic!("unsupported 16-bit register encoding: {}", reg.0),
    }
}

fn gpr8(reg: CoreRegister) -> AsmRegister8 {
    match reg.0 {
        0 => al,
        1 => cl,
        2 => dl,
        3 => bl,
        5 => bpl,
        6 => sil,
        7 => dil,
        8 => r8b,
        9 => r9b,
        10 => r10b,
        11 => r11b,
        12 => r12b,
        13 => r13b,
        14 => r14b,
        15 => r15b,
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
        8 => xmm8,
        9 => xmm9,
        10 => xmm10,
        11 => xmm11,
        12 => xmm12,
        13 => xmm13,
        14 => xmm14,
        15 => xmm15,
        _ => panic!("bad xmm register encoding: {}", reg.0),
    }
}

/// x86-64 DWARF register numbering differs from the hardware encoding.
fn dwarf_core(reg: CoreRegister) -> u32 {
    match reg.0 {
        0 => 0,  // rax
        1 => 2,  // rcx
        2 => 1,  // rdx
        3 => 3,  // rbx
        4 => 7,  // rsp
        5 => 6,  // rbp
        6 => 4,  // rsi
        7 => 5,  // rdi
        n => n as u32, // r8..r15
    }
}

fn dwarf_xmm(reg: FloatRegister) -> u32 {
    17 + reg.0 as u32
}

const SCRATCH: CoreRegister = CoreRegister(11); // r11

pub struct X86_64Assembler {
    asm: CodeAssembler,
    cfi: DebugFrameOpCodeWriter,
    labels: Vec<CodeLabel>,
    code: Option<Vec<u8>>,
}

impl X86_64Assembler {
    pub fn new() -> X86_64Assembler {
        let mut cfi = DebugFrameOpCodeWriter::new();
        cfi.set_initial_cfa_offset(8);
        X86_64Assembler {
            asm: CodeAssembler::new(64).unwrap(),
            cfi,
            labels: Vec::new(),
            code: None,
        }
    }

    fn split_saves(
        callee_saves: &[ManagedRegister],
    ) -> (Vec<CoreRegister>, Vec<FloatRegister>) {
        let mut cores = Vec::new();
        let mut floats = Vec::new();
        for reg in callee_saves {
            match reg {
                ManagedRegister::Core(core) => cores.push(*core),
                ManagedRegister::Float(fp) => floats.push(*fp),
                ManagedRegister::CorePair(..) => panic!("unexpected register pair"),
            }
        }
        (cores, floats)
    }

    fn store_core_sized(&mut self, dest: FrameOffset, src: CoreRegister, size: usize) {
        let disp = dest.0 as i32;
        match size {
            1 => self.asm.mov(byte_ptr(rsp + disp), gpr8(src)).unwrap(),
            2 => self.asm.mov(word_ptr(rsp + disp), gpr16(src)).unwrap(),
            4 => self.asm.mov(dword_ptr(rsp + disp), gpr32(src)).unwrap(),
            8 => self.asm.mov(qword_ptr(rsp + disp), gpr64(src)).unwrap(),
            _ => panic!("bad store size: {}", size),
        }
    }

    fn load_core_sized(&mut self, dest: CoreRegister, src: FrameOffset, size: usize) {
        let disp = src.0 as i32;
        match size {
            4 => self.asm.mov(gpr32(dest), dword_ptr(rsp + disp)).unwrap(),
            8 => self.asm.mov(gpr64(dest), qword_ptr(rsp + disp)).unwrap(),
            _ => panic!("bad load size: {}", size),
        }
    }

    fn store_float_sized(&mut self, dest: FrameOffset, src: FloatRegister, size: usize) {
        let disp = dest.0 as i32;
        match size {
            4 => self.asm.movss(dword_ptr(rsp + disp), xmm(src)).unwrap(),
            8 => self.asm.movsd_2(qword_ptr(rsp + disp), xmm(src)).unwrap(),
            _ => panic!("bad float store size: {}", size),
        }
    }

    fn load_float_sized(&mut self, dest: FloatRegister, src: FrameOffset, size: usize) {
        let disp = src.0 as i32;
        match size {
            4 => self.asm.movss(xmm(dest), dword_ptr(rsp + disp)).unwrap(),
            8 => self.asm.movsd_2(xmm(dest), qword_ptr(rsp + disp)).unwrap(),
            _ => panic!("bad float load size: {}", size),
        }
    }

    fn stack_copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        match size {
            4 => {
                self.asm
                    .mov(gpr32(SCRATCH), dword_ptr(rsp + src.0 as i32))
                    .unwrap();
                self.asm
                    .mov(dword_ptr(rsp + dest.0 as i32), gpr32(SCRATCH))
                    .unwrap();
            }
            8 => {
                self.asm
                    .mov(gpr64(SCRATCH), qword_ptr(rsp + src.0 as i32))
                    .unwrap();
                self.asm
                    .mov(qword_ptr(rsp + dest.0 as i32), gpr64(SCRATCH))
                    .unwrap();
            }
            _ => panic!("bad copy size: {}", size),
        }
    }

    fn move_reads_register(candidate: &ArgumentMove, reg: ManagedRegister) -> bool {
        candidate.src.register() == Some(reg)
    }

    fn emit_move_to_stack(&mut self, arg_move: &ArgumentMove, non_null: bool) {
        let (dest, dest_size) = match arg_move.dest {
            ArgumentLocation::Stack { offset, size } => (offset, size),
            ArgumentLocation::Register { .. } => unreachable!(),
        };
        match arg_move.kind {
            ArgumentMoveKind::Value | ArgumentMoveKind::RefInPlace => match arg_move.src {
                ArgumentLocation::Register { reg, .. } => match reg {
                    ManagedRegister::Core(core) => self.store_core_sized(dest, core, dest_size),
                    ManagedRegister::Float(fp) => self.store_float_sized(dest, fp, dest_size),
                    ManagedRegister::CorePair(..) => panic!("unexpected register pair"),
                },
                ArgumentLocation::Stack { offset, .. } => {
                    if offset != dest {
                        self.stack_copy(dest, offset, dest_size);
                    }
                }
            },
            ArgumentMoveKind::RefToHandle { managed_slot } => {
                if let Some(ManagedRegister::Core(core)) = arg_move.src.register() {
                    // Make the raw reference visible in its frame slot
                    // before taking its address.
                    self.asm
                        .mov(dword_ptr(rsp + managed_slot.0 as i32), gpr32(core))
                        .unwrap();
                }
                self.create_jobject_on_stack(dest, managed_slot, !non_null);
            }
        }
    }

    fn emit_move_to_register(&mut self, arg_move: &ArgumentMove, non_null: bool) {
        let dest = arg_move.dest.register().unwrap();
        match arg_move.kind {
            ArgumentMoveKind::Value | ArgumentMoveKind::RefInPlace => match arg_move.src {
                ArgumentLocation::Register { reg, size } => self.move_reg(dest, reg, size),
                ArgumentLocation::Stack { offset, size } => self.load(dest, offset, size),
            },
            ArgumentMoveKind::RefToHandle { managed_slot } => {
                let src = match arg_move.src.register() {
                    Some(ManagedRegister::Core(_)) => arg_move.src.register(),
                    _ => None,
                };
                self.create_jobject_in_register(dest, managed_slot, src, !non_null);
            }
        }
    }
}

impl Default for X86_64Assembler {
    fn default() -> X86_64Assembler {
        X86_64Assembler::new()
    }
}

impl BridgeAssembler for X86_64Assembler {
    fn cfi(&mut self) -> &mut DebugFrameOpCodeWriter {
        &mut self.cfi
    }

    fn build_frame(
        &mut self,
        frame_size: usize,
        method_register: Option<ManagedRegister>,
        callee_saves: &[ManagedRegister],
    ) {
        debug_assert_eq!(frame_size % 16, 0);
        let (cores, floats) = Self::split_saves(callee_saves);
        for &core in &cores {
            self.asm.push(gpr64(core)).unwrap();
            self.cfi.adjust_cfa_offset(8);
            let cfa_offset = self.cfi.current_cfa_offset();
            self.cfi.rel_offset(dwarf_core(core), cfa_offset);
        }
        let rest = frame_size - 8 - 8 * cores.len();
        if rest != 0 {
            self.asm.sub(rsp, rest as i32).unwrap();
            self.cfi.adjust_cfa_offset(rest as i32);
        }
        let fp_base = rest - 8 * floats.len();
        for (i, &fp) in floats.iter().enumerate() {
            let disp = (fp_base + 8 * i) as i32;
            self.asm.movsd_2(qword_ptr(rsp + disp), xmm(fp)).unwrap();
            self.cfi
                .rel_offset(dwarf_xmm(fp), frame_size as i32 - disp);
        }
        if let Some(method) = method_register {
            self.asm.mov(qword_ptr(rsp), gpr64(method.as_core())).unwrap();
        }
    }

    fn remove_frame(
        &mut self,
        frame_size: usize,
        callee_saves: &[ManagedRegister],
        _may_suspend: bool,
    ) {
        assert_eq!(self.cfi.current_cfa_offset(), frame_size as i32);
        let (cores, floats) = Self::split_saves(callee_saves);
        self.cfi.remember_state();
        let rest = frame_size - 8 - 8 * cores.len();
        let fp_base = rest - 8 * floats.len();
        for (i, &fp) in floats.iter().enumerate() {
            let disp = (fp_base + 8 * i) as i32;
            self.asm.movsd_2(xmm(fp), qword_ptr(rsp + disp)).unwrap();
            self.cfi.restore(dwarf_xmm(fp));
        }
        if rest != 0 {
            self.asm.add(rsp, rest as i32).unwrap();
            self.cfi.adjust_cfa_offset(-(rest as i32));
        }
        for &core in cores.iter().rev() {
            self.asm.pop(gpr64(core)).unwrap();
            self.cfi.adjust_cfa_offset(-8);
            self.cfi.restore(dwarf_core(core));
        }
        self.asm.ret().unwrap();
        self.cfi.restore_state();
        self.cfi.def_cfa_offset(frame_size as i32);
    }

    fn increase_frame_size(&mut self, adjust: usize) {
        if adjust != 0 {
            self.asm.sub(rsp, adjust as i32).unwrap();
            self.cfi.adjust_cfa_offset(adjust as i32);
        }
    }

    fn decrease_frame_size(&mut self, adjust: usize) {
        if adjust != 0 {
            self.asm.add(rsp, adjust as i32).unwrap();
            self.cfi.adjust_cfa_offset(-(adjust as i32));
        }
    }

    fn store_stack_pointer_to_thread(&mut self, offset: ThreadOffset) {
        self.asm
            .mov(qword_ptr(r15 + offset.0 as i32), rsp)
            .unwrap();
    }

    fn move_arguments(&mut self, moves: &[ArgumentMove]) {
        // Stack destinations first; dest slots sit in the out-args area
        // (or are identity spills) and never alias a pending source.
        for (i, arg_move) in moves.iter().enumerate() {
            if matches!(arg_move.dest, ArgumentLocation::Stack { .. }) {
                self.emit_move_to_stack(arg_move, i == 0);
            }
        }
        // Register destinations, scheduled so no pending source register
        // is clobbered early. The conventions never produce a cycle.
        let mut pending: Vec<(usize, &ArgumentMove)> = moves
            .iter()
            .enumerate()
            .filter(|(_, m)| matches!(m.dest, ArgumentLocation::Register { .. }))
            .collect();
        while !pending.is_empty() {
            let pos = pending
                .iter()
                .position(|&(idx, candidate)| {
                    let dest = candidate.dest.register().unwrap();
                    !pending.iter().any(|&(other_idx, other)| {
                        other_idx != idx && Self::move_reads_register(other, dest)
                    })
                })
                .expect("cyclic argument shuffle");
            let (idx, arg_move) = pending.remove(pos);
            self.emit_move_to_register(arg_move, idx == 0);
        }
    }

    fn move_reg(&mut self, dest: ManagedRegister, src: ManagedRegister, size: usize) {
        if dest == src {
            return;
        }
        match (dest, src) {
            (ManagedRegister::Core(d), ManagedRegister::Core(s)) => {
                if size <= 4 {
                    self.asm.mov(gpr32(d), gpr32(s)).unwrap();
                } else {
                    self.asm.mov(gpr64(d), gpr64(s)).unwrap();
                }
            }
            (ManagedRegister::Float(d), ManagedRegister::Float(s)) => {
                if size <= 4 {
                    self.asm.movss(xmm(d), xmm(s)).unwrap();
                } else {
                    self.asm.movsd_2(xmm(d), xmm(s)).unwrap();
                }
            }
            (ManagedRegister::Float(d), ManagedRegister::Core(s)) => {
                if size <= 4 {
                    self.asm.movd(xmm(d), gpr32(s)).unwrap();
                } else {
                    self.asm.movq(xmm(d), gpr64(s)).unwrap();
                }
            }
            (ManagedRegister::Core(d), ManagedRegister::Float(s)) => {
                if size <= 4 {
                    self.asm.movd(gpr32(d), xmm(s)).unwrap();
                } else {
                    self.asm.movq(gpr64(d), xmm(s)).unwrap();
                }
            }
            _ => panic!("unexpected register pair"),
        }
    }

    fn load(&mut self, dest: ManagedRegister, src: FrameOffset, size: usize) {
        match dest {
            ManagedRegister::Core(core) => self.load_core_sized(core, src, size),
            ManagedRegister::Float(fp) => self.load_float_sized(fp, src, size),
            ManagedRegister::CorePair(..) => panic!("unexpected register pair"),
        }
    }

    fn store(&mut self, dest: FrameOffset, src: ManagedRegister, size: usize) {
        match src {
            ManagedRegister::Core(core) => self.store_core_sized(dest, core, size),
            ManagedRegister::Float(fp) => self.store_float_sized(dest, fp, size),
            ManagedRegister::CorePair(..) => panic!("unexpected register pair"),
        }
    }

    fn load_from(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offset: MemberOffset,
        size: usize,
    ) {
        let base = gpr64(base.as_core());
        let disp = offset.0 as i32;
        match (dest, size) {
            (ManagedRegister::Core(d), 4) => self.asm.mov(gpr32(d), dword_ptr(base + disp)).unwrap(),
            (ManagedRegister::Core(d), 8) => self.asm.mov(gpr64(d), qword_ptr(base + disp)).unwrap(),
            _ => panic!("bad member load"),
        }
    }

    fn store_to(
        &mut self,
        base: ManagedRegister,
        offset: MemberOffset,
        src: ManagedRegister,
        size: usize,
    ) {
        let base = gpr64(base.as_core());
        let disp = offset.0 as i32;
        match size {
            4 => self
                .asm
                .mov(dword_ptr(base + disp), gpr32(src.as_core()))
                .unwrap(),
            8 => self
                .asm
                .mov(qword_ptr(base + disp), gpr64(src.as_core()))
                .unwrap(),
            _ => panic!("bad member store"),
        }
    }

    fn load_raw_ptr_from_thread(&mut self, dest: ManagedRegister, offset: ThreadOffset) {
        self.asm
            .mov(gpr64(dest.as_core()), qword_ptr(r15 + offset.0 as i32))
            .unwrap();
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
        self.asm.mov(gpr64(dest.as_core()), r15).unwrap();
    }

    fn get_current_thread_to_stack(&mut self, dest: FrameOffset) {
        self.asm.mov(qword_ptr(rsp + dest.0 as i32), r15).unwrap();
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
                .mov(dword_ptr(rsp + slot), gpr32(src_reg.as_core()))
                .unwrap();
        }
        if null_allowed {
            match src {
                Some(src_reg) => {
                    let s = gpr32(src_reg.as_core());
                    self.asm.test(s, s).unwrap();
                }
                None => self.asm.cmp(dword_ptr(rsp + slot), 0).unwrap(),
            }
            let mut done = self.asm.create_label();
            // Flags survive the lea.
            self.asm.lea(gpr64(dest), qword_ptr(rsp + slot)).unwrap();
            self.asm.jne(done).unwrap();
            self.asm.xor(gpr32(dest), gpr32(dest)).unwrap();
            self.asm.set_label(&mut done).unwrap();
            self.asm.zero_bytes().unwrap();
        } else {
            self.asm.lea(gpr64(dest), qword_ptr(rsp + slot)).unwrap();
        }
    }

    fn create_jobject_on_stack(
        &mut self,
        dest: FrameOffset,
        spilled_reference: FrameOffset,
        null_allowed: bool,
    ) {
        let slot = spilled_reference.0 as i32;
        self.asm.lea(gpr64(SCRATCH), qword_ptr(rsp + slot)).unwrap();
        if null_allowed {
            self.asm.cmp(dword_ptr(rsp + slot), 0).unwrap();
            let mut done = self.asm.create_label();
            self.asm.jne(done).unwrap();
            self.asm.xor(gpr32(SCRATCH), gpr32(SCRATCH)).unwrap();
            self.asm.set_label(&mut done).unwrap();
            self.asm.zero_bytes().unwrap();
        }
        self.asm
            .mov(qword_ptr(rsp + dest.0 as i32), gpr64(SCRATCH))
            .unwrap();
    }

    fn call(&mut self, base: ManagedRegister, offset: MemberOffset) {
        self.asm
            .call(qword_ptr(gpr64(base.as_core()) + offset.0 as i32))
            .unwrap();
    }

    fn call_from_thread(&mut self, offset: ThreadOffset) {
        self.asm.call(qword_ptr(r15 + offset.0 as i32)).unwrap();
    }

    fn jump(&mut self, base: ManagedRegister, offset: MemberOffset) {
        self.asm
            .jmp(qword_ptr(gpr64(base.as_core()) + offset.0 as i32))
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
        let offset = ThreadLayout::is_gc_marking_offset().0 as i32;
        self.asm.cmp(dword_ptr(r15 + offset), 0).unwrap();
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
                dword_ptr(gpr64(reg.as_core()) + monitor),
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
        let offset = ThreadLayout::exception_offset(PTR).0 as i32;
        self.asm.cmp(qword_ptr(r15 + offset), 0).unwrap();
        let target = self.labels[label.0 as usize];
        self.asm.jne(target).unwrap();
    }

    fn deliver_pending_exception(&mut self) {
        let offset =
            bridge_common::layout::QuickEntrypoint::DeliverException.thread_offset(PTR);
        self.asm.call(qword_ptr(r15 + offset.0 as i32)).unwrap();
        self.asm.int3().unwrap();
    }

    fn suspend_check(&mut self, label: MacroLabel) {
        let offset = ThreadLayout::flags_offset().0 as i32;
        self.asm
            .test(dword_ptr(r15 + offset), SUSPEND_REQUEST_FLAG as i32)
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

    fn finalize(mut asm: X86_64Assembler) -> Vec<u8> {
        asm.finalize_code().unwrap();
        let mut code = vec![0u8; asm.code_size()];
        asm.finalize_instructions(&mut code).unwrap();
        code
    }

    #[test]
    fn frame_round_trip_balances_cfa() {
        let saves = [
            ManagedRegister::Core(CoreRegister(3)),
            ManagedRegister::Core(CoreRegister(5)),
            ManagedRegister::Float(FloatRegister(12)),
        ];
        let mut asm = X86_64Assembler::new();
        asm.build_frame(96, Some(ManagedRegister::Core(CoreRegister(7))), &saves);
        assert_eq!(asm.cfi().current_cfa_offset(), 96);
        asm.increase_frame_size(32);
        assert_eq!(asm.cfi().current_cfa_offset(), 128);
        asm.decrease_frame_size(32);
        asm.remove_frame(96, &saves, true);
        assert_eq!(asm.cfi().current_cfa_offset(), 96);
        assert!(!finalize(asm).is_empty());
    }

    #[test]
    fn jobject_creation_null_checks_only_when_allowed() {
        let mut asm = X86_64Assembler::new();
        asm.create_jobject_in_register(
            ManagedRegister::Core(CoreRegister(6)),
            FrameOffset(16),
            None,
            false,
        );
        let unconditional = finalize(asm).len();

        let mut asm = X86_64Assembler::new();
        asm.create_jobject_in_register(
            ManagedRegister::Core(CoreRegister(6)),
            FrameOffset(16),
            None,
            true,
        );
        assert!(finalize(asm).len() > unconditional);
    }

    #[test]
    fn shuffle_orders_register_moves_by_dependency() {
        // rsi -> rdx while rdx -> rcx: the rdx read must happen first.
        let moves = [
            ArgumentMove {
                src: ArgumentLocation::Register {
                    reg: ManagedRegister::Core(CoreRegister(6)),
                    size: 4,
                },
                dest: ArgumentLocation::Register {
                    reg: ManagedRegister::Core(CoreRegister(2)),
                    size: 4,
                },
                kind: ArgumentMoveKind::Value,
            },
            ArgumentMove {
                src: ArgumentLocation::Register {
                    reg: ManagedRegister::Core(CoreRegister(2)),
                    size: 4,
                },
                dest: ArgumentLocation::Register {
                    reg: ManagedRegister::Core(CoreRegister(1)),
                    size: 4,
                },
                kind: ArgumentMoveKind::Value,
            },
        ];
        let mut asm = X86_64Assembler::new();
        asm.move_arguments(&moves);
        let code = finalize(asm);
        // mov ecx, edx must precede mov edx, esi, whichever mov form the
        // encoder picks.
        assert!(
            code == vec![0x8b, 0xca, 0x8b, 0xd6] || code == vec![0x89, 0xd1, 0x89, 0xf2],
            "unexpected encoding: {:02x?}",
            code
        );
    }
}
