use itertools::iproduct;

use bridge_common::layout::{JniEnvLayout, QuickEntrypoint};
use bridge_common::options::{CompilerOptions, MethodTable, ReadBarrierConfig};
use bridge_common::registers::{CoreRegister, ManagedRegister};
use bridge_common::shorty::{Shorty, ShortyType};
use bridge_common::{
    FrameOffset, InstructionSet, MemberOffset, PointerSize, ACC_CRITICAL_NATIVE, ACC_FAST_NATIVE,
    ACC_NATIVE, ACC_STATIC, ACC_SYNCHRONIZED,
};
use calling_convention::{managed_convention, native_convention, NativeCallConvention};
use macro_assembler::recording::{AsmOp, RecordingAssembler};
use macro_assembler::{ArgumentLocation, ArgumentMove, ArgumentMoveKind};

use crate::{compile_native_bridge, emit_bridge, end_call_shorty, MethodAttributes};

const RAX: ManagedRegister = ManagedRegister::Core(CoreRegister(0));
const EAX: ManagedRegister = RAX;
const ECX: ManagedRegister = ManagedRegister::Core(CoreRegister(1));
const RDI: ManagedRegister = ManagedRegister::Core(CoreRegister(7));

fn options(isa: InstructionSet, read_barrier: ReadBarrierConfig) -> CompilerOptions {
    CompilerOptions::new(isa, read_barrier)
}

fn trace(
    isa: InstructionSet,
    read_barrier: ReadBarrierConfig,
    access_flags: u32,
    shorty: &str,
) -> Vec<AsmOp> {
    let options = options(isa, read_barrier);
    let attrs = MethodAttributes::from_access_flags(access_flags | ACC_NATIVE, Shorty::parse(shorty));
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
    let mut asm = RecordingAssembler::new();
    emit_bridge(
        &mut asm,
        mr.as_mut(),
        main.as_mut(),
        end.as_mut(),
        &attrs,
        &options,
    )
    .unwrap();
    asm.into_ops()
}

#[track_caller]
fn assert_in_order(trace: &[AsmOp], steps: &[(&str, &dyn Fn(&AsmOp) -> bool)]) {
    let mut from = 0;
    for (name, matcher) in steps {
        match trace[from..].iter().position(|op| matcher(op)) {
            Some(i) => from += i + 1,
            None => panic!("step `{}` missing after index {}:\n{:#?}", name, from, trace),
        }
    }
}

fn calls_entrypoint(op: &AsmOp, entrypoint: QuickEntrypoint, ptr_size: PointerSize) -> bool {
    let offset = entrypoint.thread_offset(ptr_size);
    match op {
        AsmOp::CallFromThread(thread_offset) => *thread_offset == offset,
        AsmOp::Call { offset: member, .. } => member.0 == offset.0,
        _ => false,
    }
}

// Scenario: static `()V` critical native on 64-bit. Bare frame, hidden
// argument, indirect call, no transition machinery at all.
#[test]
fn critical_static_void_64() {
    let ops = trace(
        InstructionSet::X86_64,
        ReadBarrierConfig::Baker,
        ACC_STATIC | ACC_CRITICAL_NATIVE,
        "V",
    );
    assert_eq!(
        ops,
        vec![
            AsmOp::BuildFrame {
                frame_size: 16,
                method_register: None,
                callee_saves: vec![],
            },
            AsmOp::MoveArguments(vec![ArgumentMove {
                src: ArgumentLocation::Register { reg: RDI, size: 8 },
                dest: ArgumentLocation::Register { reg: RAX, size: 8 },
                kind: ArgumentMoveKind::Value,
            }]),
            AsmOp::Call {
                base: RAX,
                offset: MemberOffset(24),
            },
            AsmOp::RemoveFrame {
                frame_size: 16,
                may_suspend: false,
            },
        ]
    );
}

// Scenario: critical native with the tail-call ABI (32-bit register
// variant, no stack arguments): the call is the return.
#[test]
fn critical_tail_call_32() {
    let ops = trace(
        InstructionSet::X86,
        ReadBarrierConfig::Off,
        ACC_STATIC | ACC_CRITICAL_NATIVE,
        "II",
    );
    assert_eq!(
        ops,
        vec![
            AsmOp::BuildFrame {
                frame_size: 4,
                method_register: None,
                callee_saves: vec![],
            },
            AsmOp::MoveArguments(vec![
                ArgumentMove {
                    src: ArgumentLocation::Register { reg: EAX, size: 4 },
                    dest: ArgumentLocation::Register { reg: EAX, size: 4 },
                    kind: ArgumentMoveKind::Value,
                },
                ArgumentMove {
                    src: ArgumentLocation::Register { reg: ECX, size: 4 },
                    dest: ArgumentLocation::Register { reg: ECX, size: 4 },
                    kind: ArgumentMoveKind::Value,
                },
            ]),
            AsmOp::Jump {
                base: EAX,
                offset: MemberOffset(20),
            },
        ]
    );
}

// Scenario: instance `(L)I`, plain native, synchronized, 32-bit. The
// full transition protocol in order.
#[test]
fn synchronized_instance_32() {
    let ptr = PointerSize::K32;
    let ops = trace(
        InstructionSet::X86,
        ReadBarrierConfig::Off,
        ACC_SYNCHRONIZED,
        "IL",
    );
    assert_in_order(
        &ops,
        &[
            ("build frame", &|op| {
                matches!(op, AsmOp::BuildFrame { frame_size: 32, method_register: Some(_), .. })
            }),
            ("publish stack top", &|op| {
                matches!(op, AsmOp::StoreStackPointerToThread(_))
            }),
            ("out args", &|op| matches!(op, AsmOp::IncreaseFrameSize(16))),
            ("spill shuffle", &|op| {
                matches!(op, AsmOp::MoveArguments(moves)
                    if matches!(moves[0].kind, ArgumentMoveKind::RefInPlace)
                        && matches!(moves[1].kind, ArgumentMoveKind::RefToHandle { .. }))
            }),
            ("lock object", &|op| {
                matches!(op, AsmOp::CreateJObjectOnStack { dest: FrameOffset(0), null_allowed: false, .. })
            }),
            ("thread arg", &|op| {
                matches!(op, AsmOp::GetCurrentThreadToStack(FrameOffset(4)))
            }),
            ("start call", &|op| {
                calls_entrypoint(op, QuickEntrypoint::JniMethodStartSynchronized, ptr)
            }),
            ("monitor poll", &|op| matches!(op, AsmOp::ExceptionPoll(_))),
            ("env load", &|op| matches!(op, AsmOp::LoadRawPtrFromThread { .. })),
            ("push cookie", &|op| {
                matches!(op, AsmOp::StoreTo { offset, .. }
                    if *offset == JniEnvLayout::local_ref_cookie_offset(ptr))
            }),
            ("reload method", &|op| {
                matches!(op, AsmOp::Load { src: FrameOffset(16), size: 4, .. })
            }),
            ("this handle", &|op| {
                matches!(op, AsmOp::MoveArguments(moves)
                    if matches!(moves[0].kind, ArgumentMoveKind::RefToHandle { .. }))
            }),
            ("env arg", &|op| {
                matches!(op, AsmOp::Store { dest: FrameOffset(0), size: 4, .. })
            }),
            ("native call", &|op| {
                matches!(op, AsmOp::Call { offset: MemberOffset(20), .. })
            }),
            ("spill return", &|op| {
                matches!(op, AsmOp::Store { dest: FrameOffset(20), src, size: 4 } if *src == EAX)
            }),
            ("end call", &|op| {
                calls_entrypoint(op, QuickEntrypoint::JniMethodEndSynchronized, ptr)
            }),
            ("reload return", &|op| {
                matches!(op, AsmOp::Load { src: FrameOffset(20), size: 4, dest } if *dest == EAX)
            }),
            ("pop cookie", &|op| {
                matches!(op, AsmOp::StoreTo { offset, .. }
                    if *offset == JniEnvLayout::segment_state_offset(ptr))
            }),
            ("drop out args", &|op| matches!(op, AsmOp::DecreaseFrameSize(16))),
            ("exception poll", &|op| matches!(op, AsmOp::ExceptionPoll(_))),
            ("remove frame", &|op| {
                matches!(op, AsmOp::RemoveFrame { frame_size: 32, may_suspend: true })
            }),
            ("monitor slow path", &|op| matches!(op, AsmOp::Bind(_))),
            ("monitor rewind", &|op| matches!(op, AsmOp::DecreaseFrameSize(16))),
            ("deliver", &|op| matches!(op, AsmOp::DeliverPendingException)),
        ],
    );
    assert!(!ops
        .iter()
        .any(|op| calls_entrypoint(op, QuickEntrypoint::JniMethodEndWithReference, ptr)));
}

// Scenario: static `()Ljava/lang/String;` fast native on 64-bit with the
// Baker read barrier: early polls, reference decode, read-barrier
// trailer jumping back to the main path.
#[test]
fn fast_native_reference_return_64() {
    let ptr = PointerSize::K64;
    let ops = trace(
        InstructionSet::X86_64,
        ReadBarrierConfig::Baker,
        ACC_STATIC | ACC_FAST_NATIVE,
        "L",
    );
    assert_in_order(
        &ops,
        &[
            ("marking check", &|op| {
                matches!(op, AsmOp::TestGcMarking { .. })
            }),
            ("return bind", &|op| matches!(op, AsmOp::Bind(_))),
            ("native call", &|op| {
                matches!(op, AsmOp::Call { offset: MemberOffset(24), .. })
            }),
            ("early exception poll", &|op| matches!(op, AsmOp::ExceptionPoll(_))),
            ("early suspend check", &|op| matches!(op, AsmOp::SuspendCheck(_))),
            ("decode result", &|op| {
                calls_entrypoint(op, QuickEntrypoint::JniDecodeReferenceResult, ptr)
            }),
            ("pop cookie", &|op| {
                matches!(op, AsmOp::StoreTo { offset, .. }
                    if *offset == JniEnvLayout::segment_state_offset(ptr))
            }),
            ("remove frame", &|op| {
                matches!(op, AsmOp::RemoveFrame { may_suspend: true, .. })
            }),
            ("mark-bit fast path", &|op| matches!(op, AsmOp::TestMarkBit { .. })),
            ("read barrier call", &|op| {
                calls_entrypoint(op, QuickEntrypoint::ReadBarrierJni, ptr)
            }),
            ("back to main path", &|op| matches!(op, AsmOp::JumpTo(_))),
            ("suspend slow call", &|op| {
                calls_entrypoint(op, QuickEntrypoint::TestSuspend, ptr)
            }),
            ("restore stack top", &|op| {
                matches!(op, AsmOp::StoreStackPointerToThread(_))
            }),
            ("pop cookie on exception", &|op| {
                matches!(op, AsmOp::StoreTo { offset, .. }
                    if *offset == JniEnvLayout::segment_state_offset(ptr))
            }),
            ("deliver", &|op| matches!(op, AsmOp::DeliverPendingException)),
        ],
    );
    // Fast natives never call JniMethodStart or JniMethodEnd.
    for entrypoint in [
        QuickEntrypoint::JniMethodStart,
        QuickEntrypoint::JniMethodStartSynchronized,
        QuickEntrypoint::JniMethodEnd,
        QuickEntrypoint::JniMethodEndWithReference,
    ] {
        assert!(!ops.iter().any(|op| calls_entrypoint(op, entrypoint, ptr)));
    }
}

// Scenario: instance `(IJFD)V`, plain native, 32-bit: wide arguments
// keep their 8-byte width, `this` stays at reference width, and the
// plain method-end entrypoint is chosen.
#[test]
fn wide_arguments_keep_width_32() {
    let ptr = PointerSize::K32;
    let ops = trace(InstructionSet::X86, ReadBarrierConfig::Off, 0, "VIJFD");
    let spill = ops
        .iter()
        .find_map(|op| match op {
            AsmOp::MoveArguments(moves) => Some(moves.clone()),
            _ => None,
        })
        .unwrap();
    // this + 4 parameters.
    assert_eq!(spill.len(), 5);
    assert_eq!(spill[0].kind, ArgumentMoveKind::RefInPlace);
    assert_eq!(spill[0].src.size(), 4);
    let sizes: Vec<(usize, usize)> = spill[1..]
        .iter()
        .map(|m| (m.src.size(), m.dest.size()))
        .collect();
    assert_eq!(sizes, vec![(4, 4), (8, 8), (4, 4), (8, 8)]);
    assert!(ops
        .iter()
        .any(|op| calls_entrypoint(op, QuickEntrypoint::JniMethodEnd, ptr)));
    assert!(!ops
        .iter()
        .any(|op| calls_entrypoint(op, QuickEntrypoint::JniMethodEndWithReference, ptr)));
}

/// End-call convention with an inflated out-args area, to force the
/// frame growth path before the method-end call.
struct WideOutEndConvention {
    itr: usize,
    displacement: FrameOffset,
}

impl WideOutEndConvention {
    const OUT_SIZE: usize = 32;

    fn new() -> WideOutEndConvention {
        WideOutEndConvention {
            itr: 0,
            displacement: FrameOffset(0),
        }
    }
}

impl NativeCallConvention for WideOutEndConvention {
    fn reset_iterator(&mut self, displacement: FrameOffset) {
        self.displacement = displacement;
        self.itr = 0;
    }

    fn has_next(&self) -> bool {
        self.itr < 3
    }

    fn next(&mut self) {
        self.itr += 1;
    }

    fn is_current_param_in_register(&self) -> bool {
        false
    }

    fn current_param_register(&self) -> ManagedRegister {
        panic!("all parameters are on the stack")
    }

    fn current_param_stack_offset(&self) -> FrameOffset {
        FrameOffset(self.displacement.0 - Self::OUT_SIZE as u32 + 8 * self.itr as u32)
    }

    fn is_current_param_a_reference(&self) -> bool {
        false
    }

    fn frame_size(&self) -> usize {
        0
    }

    fn out_frame_size(&self) -> usize {
        Self::OUT_SIZE
    }

    fn callee_save_registers(&self) -> &[ManagedRegister] {
        &[]
    }

    fn callee_save_scratch_registers(&self) -> &[ManagedRegister] {
        &[]
    }

    fn core_spill_mask(&self) -> u32 {
        0
    }

    fn fp_spill_mask(&self) -> u32 {
        0
    }

    fn return_type(&self) -> ShortyType {
        ShortyType::Void
    }

    fn return_register(&self) -> Option<ManagedRegister> {
        None
    }

    fn size_of_return_value(&self) -> usize {
        0
    }

    fn spills_return_value(&self) -> bool {
        false
    }

    fn return_value_save_location(&self) -> FrameOffset {
        FrameOffset(0)
    }

    fn hidden_argument_register(&self) -> ManagedRegister {
        panic!("not a critical-native convention")
    }

    fn use_tail_call(&self) -> bool {
        false
    }
}

// Scenario: a method-end convention that needs more out-args space than
// the main call grows the frame first, and the return-value save
// location moves by the same amount.
#[test]
fn end_call_growth_adjusts_return_save_location() {
    let isa = InstructionSet::X86_64;
    let options = options(isa, ReadBarrierConfig::Off);
    let attrs = MethodAttributes::from_access_flags(ACC_NATIVE | ACC_SYNCHRONIZED, Shorty::parse("I"));
    let mut mr = managed_convention(false, true, &attrs.shorty, isa);
    let mut main = native_convention(false, true, false, false, &attrs.shorty, isa);
    let mut end = WideOutEndConvention::new();
    let mut asm = RecordingAssembler::new();
    emit_bridge(&mut asm, mr.as_mut(), main.as_mut(), &mut end, &attrs, &options).unwrap();
    let ops = asm.into_ops();

    // Main call has no stack args, so the save slot starts at 8 and
    // moves to 40 once the 32-byte end area is attached.
    assert_in_order(
        &ops,
        &[
            ("native call", &|op| {
                matches!(op, AsmOp::Call { offset: MemberOffset(24), .. })
            }),
            ("spill return", &|op| {
                matches!(op, AsmOp::Store { dest: FrameOffset(8), size: 4, .. })
            }),
            ("grow for end call", &|op| matches!(op, AsmOp::IncreaseFrameSize(32))),
            ("end call", &|op| {
                calls_entrypoint(
                    op,
                    QuickEntrypoint::JniMethodEndSynchronized,
                    PointerSize::K64,
                )
            }),
            ("reload return from moved slot", &|op| {
                matches!(op, AsmOp::Load { src: FrameOffset(40), size: 4, .. })
            }),
            ("drop grown out args", &|op| matches!(op, AsmOp::DecreaseFrameSize(32))),
            ("remove frame", &|op| {
                matches!(op, AsmOp::RemoveFrame { frame_size: 112, .. })
            }),
        ],
    );
}

fn method_kinds() -> Vec<u32> {
    vec![0, ACC_FAST_NATIVE, ACC_CRITICAL_NATIVE]
}

fn valid_combination(access_flags: u32, return_type: char) -> bool {
    if access_flags & ACC_CRITICAL_NATIVE == 0 {
        return true;
    }
    access_flags & ACC_STATIC != 0
        && access_flags & ACC_SYNCHRONIZED == 0
        && return_type != 'L'
}

// Every valid attribute combination compiles and respects the script's
// structural invariants.
#[test]
fn attribute_cross_product_invariants() {
    for (isa, static_flag, sync_flag, kind, ret) in iproduct!(
        [InstructionSet::X86, InstructionSet::X86_64],
        [0, ACC_STATIC],
        [0, ACC_SYNCHRONIZED],
        method_kinds(),
        ['V', 'I', 'J', 'F', 'L']
    ) {
        let access_flags = static_flag | sync_flag | kind;
        if !valid_combination(access_flags, ret) {
            continue;
        }
        // Fast/critical synchronized natives are not a supported shape
        // for the start/end protocol; synchronized stays plain.
        if sync_flag != 0 && kind != 0 {
            continue;
        }
        let is_critical = kind == ACC_CRITICAL_NATIVE;
        let params = if is_critical { "IJFD" } else { "ILJFDII" };
        let shorty = format!("{}{}", ret, params);
        let ptr = isa.pointer_size();
        let ops = trace(isa, ReadBarrierConfig::Baker, access_flags, &shorty);

        let pushes = ops
            .iter()
            .filter(|op| matches!(op, AsmOp::LoadRawPtrFromThread { .. }))
            .count();
        let cookie_restores = ops
            .iter()
            .filter(|op| {
                matches!(op, AsmOp::StoreTo { offset, src, .. }
                    if *offset == JniEnvLayout::local_ref_cookie_offset(ptr)
                        && ops.iter().any(|other| matches!(other, AsmOp::LoadFrom { dest, .. } if dest == src)))
            })
            .count();
        if is_critical {
            // No reference machinery, no transition, no polls at all.
            assert_eq!(pushes, 0);
            assert!(ops.iter().all(|op| !matches!(
                op,
                AsmOp::CreateJObjectInRegister { .. }
                    | AsmOp::CreateJObjectOnStack { .. }
                    | AsmOp::ExceptionPoll(_)
                    | AsmOp::SuspendCheck(_)
                    | AsmOp::StoreStackPointerToThread(_)
                    | AsmOp::GetCurrentThreadToRegister(_)
                    | AsmOp::GetCurrentThreadToStack(_)
            )));
        } else {
            assert_eq!(pushes, 1, "one local-reference frame push: {:?}", shorty);
            assert!(cookie_restores >= 1, "every push has a pop: {:?}", shorty);
        }

        let starts = ops
            .iter()
            .filter(|op| {
                calls_entrypoint(op, QuickEntrypoint::JniMethodStart, ptr)
                    || calls_entrypoint(op, QuickEntrypoint::JniMethodStartSynchronized, ptr)
            })
            .count();
        let decodes = ops
            .iter()
            .filter(|op| calls_entrypoint(op, QuickEntrypoint::JniDecodeReferenceResult, ptr))
            .count();
        match kind {
            0 => assert_eq!(starts, 1),
            _ => assert_eq!(starts, 0),
        }
        assert_eq!(decodes, (kind == ACC_FAST_NATIVE && ret == 'L') as usize);
    }
}

struct TestMethodTable {
    shorty: &'static str,
}

impl MethodTable for TestMethodTable {
    fn shorty(&self, _method_idx: u32) -> &str {
        self.shorty
    }

    fn pretty(&self, method_idx: u32) -> String {
        format!("TestClass.nativeMethod{}", method_idx)
    }
}

// The public entry point drives the real encoders end to end.
#[test]
fn compiles_to_machine_code() {
    for (isa, flags, shorty) in [
        (InstructionSet::X86_64, ACC_STATIC, "ILJFD"),
        (InstructionSet::X86_64, ACC_SYNCHRONIZED, "JI"),
        (InstructionSet::X86_64, ACC_STATIC | ACC_CRITICAL_NATIVE, "IIJ"),
        (InstructionSet::X86, ACC_FAST_NATIVE, "LI"),
        (InstructionSet::X86, ACC_STATIC, "DLJ"),
        (InstructionSet::X86, ACC_STATIC | ACC_CRITICAL_NATIVE, "II"),
    ] {
        let table = TestMethodTable { shorty };
        let mut opts = options(isa, ReadBarrierConfig::Baker);
        opts.generate_debug_info = true;
        let compiled = compile_native_bridge(&opts, ACC_NATIVE | flags, 7, &table).unwrap();
        assert_eq!(compiled.instruction_set, isa);
        if flags & ACC_CRITICAL_NATIVE != 0 {
            assert_eq!(compiled.managed_frame_size, 0);
            assert_eq!(compiled.core_spill_mask, 0);
        } else {
            assert!(compiled.managed_frame_size > 0);
            assert_ne!(compiled.core_spill_mask, 0);
            assert!(!compiled.cfi.is_empty());
        }
        assert!(!compiled.code.is_empty(), "{} on {}", shorty, isa);
    }
}

#[test]
fn end_call_shorty_selection() {
    assert_eq!(end_call_shorty(true, true), "IL");
    assert_eq!(end_call_shorty(true, false), "I");
    assert_eq!(end_call_shorty(false, true), "V");
    assert_eq!(end_call_shorty(false, false), "V");
}

#[cfg(debug_assertions)]
mod validation {
    use super::*;

    #[test]
    #[should_panic(expected = "both fast and critical")]
    fn rejects_fast_and_critical() {
        MethodAttributes::from_access_flags(
            ACC_NATIVE | ACC_STATIC | ACC_FAST_NATIVE | ACC_CRITICAL_NATIVE,
            Shorty::parse("V"),
        );
    }

    #[test]
    #[should_panic(expected = "cannot be fast")]
    fn rejects_synchronized_fast() {
        MethodAttributes::from_access_flags(
            ACC_NATIVE | ACC_FAST_NATIVE | ACC_SYNCHRONIZED,
            Shorty::parse("V"),
        );
    }

    #[test]
    #[should_panic(expected = "cannot be virtual")]
    fn rejects_virtual_critical() {
        MethodAttributes::from_access_flags(
            ACC_NATIVE | ACC_CRITICAL_NATIVE,
            Shorty::parse("V"),
        );
    }

    #[test]
    #[should_panic(expected = "references")]
    fn rejects_critical_with_references() {
        MethodAttributes::from_access_flags(
            ACC_NATIVE | ACC_STATIC | ACC_CRITICAL_NATIVE,
            Shorty::parse("VL"),
        );
    }
}
