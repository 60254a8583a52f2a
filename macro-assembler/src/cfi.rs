//! Streaming writer for DWARF debug-frame opcodes. The CFA offset is
//! tracked even when opcode emission is disabled so the emission script
//! can assert frame balance at its checkpoints.

const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
const DW_CFA_RESTORE_STATE: u8 = 0x0b;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_RESTORE: u8 = 0xc0;

/// Data alignment factor assumed by the factored offsets below.
pub const DATA_ALIGNMENT: i32 = 4;

pub struct DebugFrameOpCodeWriter {
    enabled: bool,
    data: Vec<u8>,
    current_cfa_offset: i32,
    current_pc: usize,
    state_stack: Vec<i32>,
}

impl DebugFrameOpCodeWriter {
    pub fn new() -> DebugFrameOpCodeWriter {
        DebugFrameOpCodeWriter {
            enabled: false,
            data: Vec::new(),
            current_cfa_offset: 0,
            current_pc: 0,
            state_stack: Vec::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn current_cfa_offset(&self) -> i32 {
        self.current_cfa_offset
    }

    /// Seed the CFA offset at stub entry (return-address slot only).
    pub fn set_initial_cfa_offset(&mut self, offset: i32) {
        self.current_cfa_offset = offset;
    }

    /// Record that subsequent directives apply from `pc` onward.
    pub fn advance_pc(&mut self, pc: usize) {
        if self.enabled && pc > self.current_pc {
            let delta = (pc - self.current_pc) as u32;
            if delta <= u8::MAX as u32 {
                self.data.push(DW_CFA_ADVANCE_LOC1);
                self.data.push(delta as u8);
            } else if delta <= u16::MAX as u32 {
                self.data.push(DW_CFA_ADVANCE_LOC2);
                self.data.extend_from_slice(&(delta as u16).to_le_bytes());
            } else {
                self.data.push(DW_CFA_ADVANCE_LOC4);
                self.data.extend_from_slice(&delta.to_le_bytes());
            }
        }
        if pc > self.current_pc {
            self.current_pc = pc;
        }
    }

    pub fn def_cfa_offset(&mut self, offset: i32) {
        self.current_cfa_offset = offset;
        if self.enabled {
            self.data.push(DW_CFA_DEF_CFA_OFFSET);
            self.push_uleb128(offset as u32);
        }
    }

    pub fn adjust_cfa_offset(&mut self, delta: i32) {
        if delta != 0 {
            self.def_cfa_offset(self.current_cfa_offset + delta);
        }
    }

    /// Register `reg` was saved at CFA - `offset_from_cfa`.
    pub fn rel_offset(&mut self, reg: u32, offset_from_cfa: i32) {
        if self.enabled {
            debug_assert_eq!(offset_from_cfa % DATA_ALIGNMENT, 0);
            if reg < 0x40 {
                self.data.push(DW_CFA_OFFSET | reg as u8);
            } else {
                // Large register numbers take the two-operand form.
                self.data.push(0x05);
                self.push_uleb128(reg);
            }
            self.push_uleb128((offset_from_cfa / DATA_ALIGNMENT) as u32);
        }
    }

    pub fn restore(&mut self, reg: u32) {
        if self.enabled {
            if reg < 0x40 {
                self.data.push(DW_CFA_RESTORE | reg as u8);
            } else {
                self.data.push(DW_CFA_RESTORE_EXTENDED);
                self.push_uleb128(reg);
            }
        }
    }

    pub fn remember_state(&mut self) {
        self.state_stack.push(self.current_cfa_offset);
        if self.enabled {
            self.data.push(DW_CFA_REMEMBER_STATE);
        }
    }

    pub fn restore_state(&mut self) {
        self.current_cfa_offset = self
            .state_stack
            .pop()
            .expect("restore_state without remember_state");
        if self.enabled {
            self.data.push(DW_CFA_RESTORE_STATE);
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn push_uleb128(&mut self, mut value: u32) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.data.push(byte);
            if value == 0 {
                break;
            }
        }
    }
}

impl Default for DebugFrameOpCodeWriter {
    fn default() -> DebugFrameOpCodeWriter {
        DebugFrameOpCodeWriter::new()
    }
}
