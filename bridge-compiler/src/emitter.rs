//! The nine-phase emission script. Phases run in order; critical natives
//! skip the whole transition machinery, fast natives skip the
//! `JniMethodStart`/`JniMethodEnd` runtime calls but keep the
//! local-reference frame and the suspend/exception polls.

use bridge_common::layout::{
    JniEnvLayout, MethodRecordLayout, QuickEntrypoint, ThreadLayout, IRT_COOKIE_SIZE,
};
use bridge_common::options::CompilerOptions;
use bridge_common::registers::ManagedRegister;
use bridge_common::{FrameOffset, MemberOffset, PointerSize, OBJECT_REFERENCE_SIZE};
use calling_convention::{ManagedRuntimeConvention, NativeCallConvention};
use macro_assembler::{
    ArgumentLocation, ArgumentMove, ArgumentMoveKind, AssemblerError, BridgeAssembler,
    UnaryCondition,
};

use crate::{jni_end_entrypoint, jni_start_entrypoint, CompiledBridgeMethod, MethodAttributes};

/// Liveness of the register holding the method record. The register is
/// clobbered by the `JniMethodStart` call and by the main native call;
/// reading it afterwards is a bug the sum type makes unrepresentable.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum MethodRegisterState {
    Live(ManagedRegister),
    Empty,
}

impl MethodRegisterState {
    fn live(self) -> ManagedRegister {
        match self {
            MethodRegisterState::Live(reg) => reg,
            MethodRegisterState::Empty => panic!("method register already clobbered"),
        }
    }

    fn is_live(self) -> bool {
        matches!(self, MethodRegisterState::Live(_))
    }

    fn as_option(self) -> Option<ManagedRegister> {
        match self {
            MethodRegisterState::Live(reg) => Some(reg),
            MethodRegisterState::Empty => None,
        }
    }
}

/// Drive the whole script against explicit collaborators. The public
/// entry point builds the conventions and the assembler; tests inject a
/// recording assembler or synthetic conventions here.
pub fn emit_bridge(
    asm: &mut dyn BridgeAssembler,
    mr: &mut dyn ManagedRuntimeConvention,
    main: &mut dyn NativeCallConvention,
    end: &mut dyn NativeCallConvention,
    attrs: &MethodAttributes,
    options: &CompilerOptions,
) -> Result<CompiledBridgeMethod, AssemblerError> {
    let ptr_size = options.instruction_set.pointer_size();
    let raw_ptr = ptr_size.size();
    let is_static = attrs.is_static;
    let is_synchronized = attrs.is_synchronized;
    let is_fast_native = attrs.is_fast_native;
    let is_critical_native = attrs.is_critical_native;
    let reference_return = main.is_return_a_reference();
    let read_barrier = options.read_barrier;

    // 1. Build and register the stub frame.

    // 1.1. For critical natives the frame is the out-args area alone,
    //      otherwise the full managed frame.
    let managed_frame_size = main.frame_size();
    let main_out_arg_size = main.out_frame_size();
    let mut current_frame_size = if is_critical_native {
        main_out_arg_size
    } else {
        managed_frame_size
    };
    let mut method_register = if is_critical_native {
        MethodRegisterState::Empty
    } else {
        MethodRegisterState::Live(mr.method_register())
    };
    let callee_saves = main.callee_save_registers().to_vec();
    asm.build_frame(current_frame_size, method_register.as_option(), &callee_saves);
    debug_assert_eq!(asm.cfi().current_cfa_offset(), current_frame_size as i32);

    // 1.2. The declaring class passed as `jclass` to a static method may
    //      need a read barrier while the collector is marking.
    let mut jclass_rb_slow_path = None;
    let mut jclass_rb_return = None;
    if read_barrier.is_enabled() && is_static && !is_critical_native {
        let slow = asm.create_label();
        let ret = asm.create_label();
        asm.test_gc_marking(slow, UnaryCondition::NotZero);
        asm.bind(ret);
        jclass_rb_slow_path = Some(slow);
        jclass_rb_return = Some(ret);
    }

    // 1.3. Publish the top of the managed stack. Collections cannot run
    //      under a critical native, which therefore skips this.
    if !is_critical_native {
        asm.store_stack_pointer_to_thread(ThreadLayout::top_of_managed_stack_offset(ptr_size));
    }

    // 2. Transition out of Runnable for plain natives.

    // 2.1. Make room for outgoing args of both the start call and the
    //      main call. The critical frame already is that area.
    let mut current_out_arg_size = main_out_arg_size;
    if is_critical_native {
        debug_assert_eq!(main_out_arg_size, current_frame_size);
    } else {
        asm.increase_frame_size(main_out_arg_size);
        current_frame_size += main_out_arg_size;
    }

    // 2.2. Spill register arguments across the start call. Stack-bound
    //      native args go straight to their argument slots as handles;
    //      register-bound ones are spilled raw into their vreg slots.
    let mut moves: Vec<ArgumentMove> = Vec::new();
    if !is_critical_native && !is_fast_native {
        mr.reset_iterator(FrameOffset(current_frame_size as u32));
        main.reset_iterator(FrameOffset(main_out_arg_size as u32));
        main.next(); // JNIEnv*
        if is_static {
            main.next(); // jclass
            // Occupy the leading slot so a reference parameter is never
            // first in the sequence and mistaken for non-null.
            let method = method_register.live();
            moves.push(ArgumentMove {
                src: ArgumentLocation::Register {
                    reg: method,
                    size: raw_ptr,
                },
                dest: ArgumentLocation::Register {
                    reg: method,
                    size: raw_ptr,
                },
                kind: ArgumentMoveKind::Value,
            });
        } else {
            // `this` is spilled raw, never converted here; it cannot be
            // null and the later shuffle wants to see it first.
            debug_assert!(mr.has_next());
            debug_assert!(main.has_next());
            debug_assert!(mr.is_current_param_a_reference());
            let this_slot = mr.current_param_stack_offset();
            let src = if mr.is_current_param_in_register() {
                ArgumentLocation::Register {
                    reg: mr.current_param_register(),
                    size: OBJECT_REFERENCE_SIZE,
                }
            } else {
                ArgumentLocation::Stack {
                    offset: this_slot,
                    size: OBJECT_REFERENCE_SIZE,
                }
            };
            moves.push(ArgumentMove {
                src,
                dest: ArgumentLocation::Stack {
                    offset: this_slot,
                    size: OBJECT_REFERENCE_SIZE,
                },
                kind: ArgumentMoveKind::RefInPlace,
            });
            mr.next();
            main.next();
        }
        while mr.has_next() {
            debug_assert!(main.has_next());
            let is_reference = mr.is_current_param_a_reference();
            let spill_jobject = is_reference && !main.is_current_param_in_register();
            let src_size = if !is_reference && mr.is_current_param_long_or_double() {
                8
            } else {
                4
            };
            let dest_size = if spill_jobject { raw_ptr } else { src_size };
            let src = if mr.is_current_param_in_register() {
                ArgumentLocation::Register {
                    reg: mr.current_param_register(),
                    size: src_size,
                }
            } else {
                ArgumentLocation::Stack {
                    offset: mr.current_param_stack_offset(),
                    size: src_size,
                }
            };
            let dest_offset = if main.is_current_param_in_register() {
                mr.current_param_stack_offset()
            } else {
                main.current_param_stack_offset()
            };
            let kind = if spill_jobject {
                ArgumentMoveKind::RefToHandle {
                    managed_slot: mr.current_param_stack_offset(),
                }
            } else if is_reference {
                ArgumentMoveKind::RefInPlace
            } else {
                ArgumentMoveKind::Value
            };
            moves.push(ArgumentMove {
                src,
                dest: ArgumentLocation::Stack {
                    offset: dest_offset,
                    size: dest_size,
                },
                kind,
            });
            mr.next();
            main.next();
        }
        asm.move_arguments(&moves);
    }

    // 2.3. Call `JniMethodStart*`, passing the lock object first when
    //      synchronized and the current thread last. The native
    //      convention is reused for this call; it always fits two
    //      pointer arguments.
    let monitor_enter_slow_path = if is_synchronized {
        Some(asm.create_label())
    } else {
        None
    };
    if !is_critical_native && !is_fast_native {
        let jni_start = jni_start_entrypoint(is_synchronized).thread_offset(ptr_size);
        main.reset_iterator(FrameOffset(main_out_arg_size as u32));
        if is_synchronized {
            if is_static {
                // The method record doubles as the declaring-class
                // handle: the class reference sits at its offset zero.
                debug_assert_eq!(MethodRecordLayout::declaring_class_offset().value(), 0);
                set_native_parameter(asm, main, method_register.live(), raw_ptr);
            } else {
                mr.reset_iterator(FrameOffset(current_frame_size as u32));
                let this_offset = mr.current_param_stack_offset();
                if main.is_current_param_on_stack() {
                    asm.create_jobject_on_stack(main.current_param_stack_offset(), this_offset, false);
                } else {
                    asm.create_jobject_in_register(
                        main.current_param_register(),
                        this_offset,
                        None,
                        false,
                    );
                }
            }
            main.next();
        }
        if main.is_current_param_in_register() {
            let thread_reg = main.current_param_register();
            asm.get_current_thread_to_register(thread_reg);
            asm.call(thread_reg, MemberOffset(jni_start.0));
        } else {
            asm.get_current_thread_to_stack(main.current_param_stack_offset());
            asm.call_from_thread(jni_start);
        }
        method_register = MethodRegisterState::Empty; // Clobbered by the call.
        if is_synchronized {
            asm.exception_poll(monitor_enter_slow_path.unwrap());
        }
    }

    // 3. Push the local reference frame. The environment pointer and the
    //    saved cookie stay in callee-save scratch registers across the
    //    native call.
    let mut jni_env_reg = None;
    let mut saved_cookie_reg = None;
    let mut callee_save_temp = None;
    if !is_critical_native {
        let scratch = main.callee_save_scratch_registers();
        assert!(scratch.len() >= 3);
        let env = scratch[0];
        let cookie = scratch[1];
        let temp = scratch[2];
        asm.load_raw_ptr_from_thread(env, ThreadLayout::jni_env_offset(ptr_size));
        push_local_reference_frame(asm, env, cookie, temp, ptr_size);
        jni_env_reg = Some(env);
        saved_cookie_reg = Some(cookie);
        callee_save_temp = Some(temp);
    }

    // 4. The main native call.

    // 4.1. Fill every argument except `JNIEnv*`.
    moves.clear();
    mr.reset_iterator(FrameOffset(current_frame_size as u32));
    main.reset_iterator(FrameOffset(main_out_arg_size as u32));
    if is_critical_native {
        // The method record rides the hidden argument register, placed
        // ahead of any normal argument dispatch.
        moves.push(ArgumentMove {
            src: ArgumentLocation::Register {
                reg: mr.method_register(),
                size: raw_ptr,
            },
            dest: ArgumentLocation::Register {
                reg: main.hidden_argument_register(),
                size: raw_ptr,
            },
            kind: ArgumentMoveKind::Value,
        });
    } else {
        main.next(); // JNIEnv*
        let method_offset =
            FrameOffset(current_out_arg_size as u32 + mr.method_stack_offset().0);
        if !is_static || main.is_current_param_on_stack() {
            // The `jclass` register cannot carry the method into the
            // call, so materialize it in the callee-save temp. Fast
            // natives still hold it in the incoming register; for plain
            // natives the start call clobbered it, reload from the frame.
            let new_method_reg = callee_save_temp.unwrap();
            if is_fast_native {
                asm.move_reg(new_method_reg, method_register.live(), raw_ptr);
            } else {
                debug_assert!(!method_register.is_live());
                asm.load(new_method_reg, method_offset, raw_ptr);
            }
            method_register = MethodRegisterState::Live(new_method_reg);
        }
        if is_static {
            // The method value becomes the `jclass` argument.
            debug_assert_eq!(MethodRecordLayout::declaring_class_offset().value(), 0);
            let src = match method_register {
                MethodRegisterState::Live(reg) => ArgumentLocation::Register {
                    reg,
                    size: raw_ptr,
                },
                MethodRegisterState::Empty => {
                    debug_assert!(main.is_current_param_in_register());
                    ArgumentLocation::Stack {
                        offset: method_offset,
                        size: raw_ptr,
                    }
                }
            };
            let dest = if main.is_current_param_in_register() {
                // The `jclass` register is the method register the
                // indirect call will use.
                let jclass_reg = main.current_param_register();
                method_register = MethodRegisterState::Live(jclass_reg);
                ArgumentLocation::Register {
                    reg: jclass_reg,
                    size: raw_ptr,
                }
            } else {
                ArgumentLocation::Stack {
                    offset: main.current_param_stack_offset(),
                    size: raw_ptr,
                }
            };
            moves.push(ArgumentMove {
                src,
                dest,
                kind: ArgumentMoveKind::Value,
            });
            main.next();
        } else {
            // `this` goes first so the shuffle treats it as non-null. It
            // has not been converted to a handle yet.
            debug_assert!(mr.has_next());
            debug_assert!(main.has_next());
            debug_assert!(mr.is_current_param_a_reference());
            let this_slot = mr.current_param_stack_offset();
            let src = if is_fast_native && mr.is_current_param_in_register() {
                ArgumentLocation::Register {
                    reg: mr.current_param_register(),
                    size: OBJECT_REFERENCE_SIZE,
                }
            } else {
                ArgumentLocation::Stack {
                    offset: this_slot,
                    size: OBJECT_REFERENCE_SIZE,
                }
            };
            let dest = if main.is_current_param_in_register() {
                ArgumentLocation::Register {
                    reg: main.current_param_register(),
                    size: raw_ptr,
                }
            } else {
                ArgumentLocation::Stack {
                    offset: main.current_param_stack_offset(),
                    size: raw_ptr,
                }
            };
            moves.push(ArgumentMove {
                src,
                dest,
                kind: ArgumentMoveKind::RefToHandle {
                    managed_slot: this_slot,
                },
            });
            mr.next();
            main.next();
        }
    }
    while mr.has_next() {
        debug_assert!(main.has_next());
        let dest_in_reg = main.is_current_param_in_register();
        if !is_critical_native && !is_fast_native && !dest_in_reg {
            // Stack arguments of a plain native were planted in 2.2.
            mr.next();
            main.next();
            continue;
        }
        let is_reference = mr.is_current_param_a_reference();
        let src_size = if !is_reference && mr.is_current_param_long_or_double() {
            8
        } else {
            4
        };
        let dest_size = if is_reference { raw_ptr } else { src_size };
        let src = if (is_critical_native || is_fast_native) && mr.is_current_param_in_register() {
            ArgumentLocation::Register {
                reg: mr.current_param_register(),
                size: src_size,
            }
        } else {
            ArgumentLocation::Stack {
                offset: mr.current_param_stack_offset(),
                size: src_size,
            }
        };
        let dest = if dest_in_reg {
            ArgumentLocation::Register {
                reg: main.current_param_register(),
                size: dest_size,
            }
        } else {
            ArgumentLocation::Stack {
                offset: main.current_param_stack_offset(),
                size: dest_size,
            }
        };
        let kind = if is_reference {
            ArgumentMoveKind::RefToHandle {
                managed_slot: mr.current_param_stack_offset(),
            }
        } else {
            ArgumentMoveKind::Value
        };
        moves.push(ArgumentMove { src, dest, kind });
        mr.next();
        main.next();
    }
    debug_assert!(!main.has_next());
    asm.move_arguments(&moves);

    // 4.2. The environment pointer is always the first native argument.
    if !is_critical_native {
        main.reset_iterator(FrameOffset(main_out_arg_size as u32));
        let env = jni_env_reg.unwrap();
        if main.is_current_param_in_register() {
            asm.move_reg(main.current_param_register(), env, raw_ptr);
        } else {
            asm.store(main.current_param_stack_offset(), env, raw_ptr);
        }
    }

    // 4.3. The indirect call through the method record.
    let jni_entrypoint_offset = MethodRecordLayout::entrypoint_from_native_offset(ptr_size);
    if is_critical_native {
        if main.use_tail_call() {
            asm.jump(main.hidden_argument_register(), jni_entrypoint_offset);
        } else {
            asm.call(main.hidden_argument_register(), jni_entrypoint_offset);
        }
    } else {
        asm.call(method_register.live(), jni_entrypoint_offset);
        // The register may be the callee-save temp and gets reused
        // below; make stale reads impossible.
        method_register = MethodRegisterState::Empty;
    }

    // 4.4. Widen small results to a full register.
    if main.requires_small_result_type_extension() {
        debug_assert!(main.has_small_return_type());
        assert!(!is_critical_native || !main.use_tail_call());
        let return_type = main.return_type();
        let return_reg = main.return_register().expect("small return without register");
        if return_type == bridge_common::shorty::ShortyType::Byte
            || return_type == bridge_common::shorty::ShortyType::Short
        {
            asm.sign_extend(return_reg, return_type.component_size());
        } else {
            asm.zero_extend(return_reg, return_type.component_size());
        }
    }

    // 5. Transition back to Runnable.

    // 5.1. Keep the return value away from the method-end call: spill it
    //      for plain natives, or move it between the two conventions'
    //      return registers when they differ.
    let spill_return_value = main.spills_return_value();
    let mut return_save_location = if spill_return_value {
        main.return_value_save_location()
    } else {
        FrameOffset(0)
    };
    if spill_return_value {
        debug_assert!(!is_critical_native);
        assert!(return_save_location.value() < current_frame_size);
        asm.store(
            return_save_location,
            main.return_register().expect("spill of a void return"),
            main.size_of_return_value(),
        );
    } else if (is_fast_native || is_critical_native) && main.size_of_return_value() != 0 {
        let jni_return_reg = main.return_register().unwrap();
        let mr_return_reg = mr.return_register().unwrap();
        if jni_return_reg != mr_return_reg {
            assert!(!is_critical_native || !main.use_tail_call());
            asm.move_reg(mr_return_reg, jni_return_reg, main.size_of_return_value());
        }
    }

    // 5.2. Fast natives returning a reference poll for exceptions early
    //      so the decode call below runs on the clean path only.
    let exception_slow_path = if !is_critical_native {
        Some(asm.create_label())
    } else {
        None
    };
    if is_fast_native && reference_return {
        asm.exception_poll(exception_slow_path.unwrap());
    }

    // 5.3. And an early suspend check, so the decoded reference does not
    //      have to survive a later safepoint.
    let suspend_check_slow_path = if is_fast_native {
        Some(asm.create_label())
    } else {
        None
    };
    let suspend_check_resume = if is_fast_native {
        Some(asm.create_label())
    } else {
        None
    };
    if is_fast_native && reference_return {
        asm.suspend_check(suspend_check_slow_path.unwrap());
        asm.bind(suspend_check_resume.unwrap());
    }

    if !is_critical_native {
        // 5.4. The method-end call may need a bigger out-args area.
        let end_out_arg_size = end.out_frame_size();
        if end_out_arg_size > current_out_arg_size {
            debug_assert!(!is_fast_native);
            let out_arg_size_diff = end_out_arg_size - current_out_arg_size;
            current_out_arg_size = end_out_arg_size;
            asm.increase_frame_size(out_arg_size_diff);
            current_frame_size += out_arg_size_diff;
            return_save_location = FrameOffset(return_save_location.0 + out_arg_size_diff as u32);
        }
        end.reset_iterator(FrameOffset(end_out_arg_size as u32));

        // 5.5. Call `JniMethodEnd*`; fast natives only decode the
        //      reference result.
        if !is_fast_native || reference_return {
            let jni_end = if is_fast_native {
                QuickEntrypoint::JniDecodeReferenceResult.thread_offset(ptr_size)
            } else {
                jni_end_entrypoint(reference_return, is_synchronized).thread_offset(ptr_size)
            };
            if reference_return {
                // Pass the result; it sits in the end convention's
                // return register already.
                let result_reg = end.return_register().unwrap();
                set_native_parameter(asm, end, result_reg, raw_ptr);
                end.next();
            }
            if is_synchronized {
                // Pass the object to unlock.
                if is_static {
                    // The method register is long clobbered; reload the
                    // record from the frame, it doubles as the handle.
                    let method_offset =
                        FrameOffset(current_out_arg_size as u32 + mr.method_stack_offset().0);
                    debug_assert_eq!(MethodRecordLayout::declaring_class_offset().value(), 0);
                    if end.is_current_param_on_stack() {
                        asm.copy(end.current_param_stack_offset(), method_offset, raw_ptr);
                    } else {
                        asm.load(end.current_param_register(), method_offset, raw_ptr);
                    }
                } else {
                    mr.reset_iterator(FrameOffset(current_frame_size as u32));
                    let this_offset = mr.current_param_stack_offset();
                    if end.is_current_param_on_stack() {
                        asm.create_jobject_on_stack(
                            end.current_param_stack_offset(),
                            this_offset,
                            false,
                        );
                    } else {
                        asm.create_jobject_in_register(
                            end.current_param_register(),
                            this_offset,
                            None,
                            false,
                        );
                    }
                }
                end.next();
            }
            if end.is_current_param_in_register() {
                let thread_reg = end.current_param_register();
                asm.get_current_thread_to_register(thread_reg);
                asm.call(thread_reg, MemberOffset(jni_end.0));
            } else {
                asm.get_current_thread_to_stack(end.current_param_stack_offset());
                asm.call_from_thread(jni_end);
            }
        }

        // 5.6. Reload the spilled return value.
        if spill_return_value {
            asm.load(
                mr.return_register().unwrap(),
                return_save_location,
                mr.size_of_return_value(),
            );
        }
    }

    // 6. Pop the local reference frame.
    if !is_critical_native {
        pop_local_reference_frame(
            asm,
            jni_env_reg.unwrap(),
            saved_cookie_reg.unwrap(),
            callee_save_temp.unwrap(),
            ptr_size,
        );
    }

    // 7. Return from the stub.

    // 7.1. Done with the out-args area. Critical natives drop it
    //      together with the frame.
    if !is_critical_native {
        asm.decrease_frame_size(current_out_arg_size);
        current_frame_size -= current_out_arg_size;
    }

    // 7.2. Pending exceptions from the call or the monitor exit. Fast
    //      natives with a reference return polled earlier.
    if !is_critical_native && (!is_fast_native || !reference_return) {
        asm.exception_poll(exception_slow_path.unwrap());
    }

    // 7.3. Fast natives never left Runnable; poll for a requested
    //      suspend unless done above.
    if is_fast_native && !reference_return {
        asm.suspend_check(suspend_check_slow_path.unwrap());
        asm.bind(suspend_check_resume.unwrap());
    }

    // 7.4. Drop the frame. The collector may have moved the callee-save
    //      contents, so they must be reloaded.
    debug_assert_eq!(asm.cfi().current_cfa_offset(), current_frame_size as i32);
    if !is_critical_native || !main.use_tail_call() {
        let may_suspend = !is_critical_native;
        asm.remove_frame(current_frame_size, &callee_saves, may_suspend);
        debug_assert_eq!(asm.cfi().current_cfa_offset(), current_frame_size as i32);
    }

    // 8. Out-of-line slow paths.

    // 8.1. Read barrier for the declaring class of a static method.
    if read_barrier.is_enabled() && is_static && !is_critical_native {
        asm.bind(jclass_rb_slow_path.unwrap());
        if read_barrier.is_baker() {
            // Entered with the method register intact and callee saves
            // spilled; a scratch register is free for the mark check.
            let method_reg = mr.method_register();
            let temp = main.callee_save_scratch_registers()[0];
            asm.load_from(
                temp,
                method_reg,
                MethodRecordLayout::declaring_class_offset(),
                OBJECT_REFERENCE_SIZE,
            );
            asm.test_mark_bit(temp, jclass_rb_return.unwrap(), UnaryCondition::NotZero);
        }
        asm.call_from_thread(QuickEntrypoint::ReadBarrierJni.thread_offset(ptr_size));
        asm.jump_to(jclass_rb_return.unwrap());
    }

    // 8.2. Suspend-check slow path for fast natives. On the
    //      reference-return path the poll ran with the out-args area
    //      still attached, so rewind around the runtime call.
    if is_fast_native {
        asm.bind(suspend_check_slow_path.unwrap());
        let rewound = if reference_return { main_out_arg_size } else { 0 };
        with_frame_rewound(asm, rewound, |asm| {
            asm.call_from_thread(QuickEntrypoint::TestSuspend.thread_offset(ptr_size));
            if reference_return {
                // The suspend entrypoint clobbers the recorded top of
                // the managed stack; the decode call still needs it.
                asm.store_stack_pointer_to_thread(ThreadLayout::top_of_managed_stack_offset(
                    ptr_size,
                ));
            }
        });
        asm.jump_to(suspend_check_resume.unwrap());
    }

    // 8.3. Exception delivery.
    if !is_critical_native {
        if is_synchronized {
            debug_assert!(!is_fast_native);
            asm.bind(monitor_enter_slow_path.unwrap());
            rewind_frame(asm, main_out_arg_size);
        }
        asm.bind(exception_slow_path.unwrap());
        if is_fast_native && reference_return {
            // The early poll fired with the out-args area and the
            // local-reference frame still live.
            rewind_frame(asm, main_out_arg_size);
            pop_local_reference_frame(
                asm,
                jni_env_reg.unwrap(),
                saved_cookie_reg.unwrap(),
                callee_save_temp.unwrap(),
                ptr_size,
            );
        }
        debug_assert_eq!(asm.cfi().current_cfa_offset(), current_frame_size as i32);
        asm.deliver_pending_exception();
    }

    // 9. Finalize.
    asm.finalize_code()?;
    let code_size = asm.code_size();
    let mut code = vec![0u8; code_size];
    asm.finalize_instructions(&mut code)?;

    Ok(CompiledBridgeMethod {
        instruction_set: options.instruction_set,
        code,
        managed_frame_size,
        core_spill_mask: main.core_spill_mask(),
        fp_spill_mask: main.fp_spill_mask(),
        cfi: asm.cfi().data().to_vec(),
    })
}

/// Save the environment's local-reference cookie and advance it to the
/// current segment state. Reversed by `pop_local_reference_frame`.
fn push_local_reference_frame(
    asm: &mut dyn BridgeAssembler,
    jni_env_reg: ManagedRegister,
    saved_cookie_reg: ManagedRegister,
    temp_reg: ManagedRegister,
    ptr_size: PointerSize,
) {
    let cookie_offset = JniEnvLayout::local_ref_cookie_offset(ptr_size);
    let segment_state_offset = JniEnvLayout::segment_state_offset(ptr_size);
    asm.load_from(saved_cookie_reg, jni_env_reg, cookie_offset, IRT_COOKIE_SIZE);
    asm.load_from(temp_reg, jni_env_reg, segment_state_offset, IRT_COOKIE_SIZE);
    asm.store_to(jni_env_reg, cookie_offset, temp_reg, IRT_COOKIE_SIZE);
}

fn pop_local_reference_frame(
    asm: &mut dyn BridgeAssembler,
    jni_env_reg: ManagedRegister,
    saved_cookie_reg: ManagedRegister,
    temp_reg: ManagedRegister,
    ptr_size: PointerSize,
) {
    let cookie_offset = JniEnvLayout::local_ref_cookie_offset(ptr_size);
    let segment_state_offset = JniEnvLayout::segment_state_offset(ptr_size);
    asm.load_from(temp_reg, jni_env_reg, cookie_offset, IRT_COOKIE_SIZE);
    asm.store_to(jni_env_reg, segment_state_offset, temp_reg, IRT_COOKIE_SIZE);
    asm.store_to(jni_env_reg, cookie_offset, saved_cookie_reg, IRT_COOKIE_SIZE);
}

/// Put one register value into the convention's current parameter,
/// eliding a move onto itself.
fn set_native_parameter(
    asm: &mut dyn BridgeAssembler,
    conv: &mut dyn NativeCallConvention,
    in_reg: ManagedRegister,
    size: usize,
) {
    if conv.is_current_param_on_stack() {
        asm.store_raw_ptr(conv.current_param_stack_offset(), in_reg);
    } else if conv.current_param_register() != in_reg {
        asm.move_reg(conv.current_param_register(), in_reg, size);
    }
}

/// Run `body` with the out-args area rewound, keeping the emitted frame
/// directives and the CFA bookkeeping paired in both directions.
fn with_frame_rewound(
    asm: &mut dyn BridgeAssembler,
    size: usize,
    body: impl FnOnce(&mut dyn BridgeAssembler),
) {
    if size != 0 {
        asm.cfi().adjust_cfa_offset(size as i32);
        asm.decrease_frame_size(size);
    }
    body(&mut *asm);
    if size != 0 {
        asm.increase_frame_size(size);
        asm.cfi().adjust_cfa_offset(-(size as i32));
    }
}

/// One-way rewind for paths that never return (exception delivery).
fn rewind_frame(asm: &mut dyn BridgeAssembler, size: usize) {
    if size != 0 {
        asm.cfi().adjust_cfa_offset(size as i32);
        asm.decrease_frame_size(size);
    }
}
