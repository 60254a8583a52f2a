//! Offsets into the runtime structures the emitted stub touches. All of
//! them depend only on the target pointer size, never on host layout.

use crate::{MemberOffset, PointerSize, ThreadOffset};

/// Width of one saved local-reference cookie.
pub const IRT_COOKIE_SIZE: usize = 4;

/// Bit in `Thread::flags` that requests a cooperative suspend.
pub const SUSPEND_REQUEST_FLAG: u32 = 1 << 0;

/// Bit in the object monitor word that marks an object as visited by the
/// concurrent collector.
pub const MARK_BIT_SHIFT: u32 = 29;

/// Runtime `Thread` structure:
/// flags and the gc-marking word first, then pointer-sized fields, then
/// the entrypoint table.
pub struct ThreadLayout;

impl ThreadLayout {
    pub const fn flags_offset() -> ThreadOffset {
        ThreadOffset(0)
    }

    pub const fn is_gc_marking_offset() -> ThreadOffset {
        ThreadOffset(4)
    }

    pub const fn exception_offset(ptr_size: PointerSize) -> ThreadOffset {
        let _ = ptr_size;
        ThreadOffset(8)
    }

    pub const fn top_of_managed_stack_offset(ptr_size: PointerSize) -> ThreadOffset {
        ThreadOffset(8 + ptr_size.size() as u32)
    }

    pub const fn jni_env_offset(ptr_size: PointerSize) -> ThreadOffset {
        ThreadOffset(8 + 2 * ptr_size.size() as u32)
    }

    /// The thread stores a pointer to itself so 32-bit code can
    /// materialize it out of the segment register.
    pub const fn self_offset(ptr_size: PointerSize) -> ThreadOffset {
        ThreadOffset(8 + 3 * ptr_size.size() as u32)
    }

    pub const fn entrypoint_table_offset(ptr_size: PointerSize) -> ThreadOffset {
        ThreadOffset(8 + 4 * ptr_size.size() as u32)
    }
}

/// Runtime entrypoints the stub reaches through thread-relative indirect
/// calls. Table order is ABI.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum QuickEntrypoint {
    JniMethodStart = 0,
    JniMethodStartSynchronized,
    JniMethodEnd,
    JniMethodEndWithReference,
    JniMethodEndSynchronized,
    JniMethodEndWithReferenceSynchronized,
    JniDecodeReferenceResult,
    ReadBarrierJni,
    TestSuspend,
    DeliverException,
}

impl QuickEntrypoint {
    pub fn thread_offset(self, ptr_size: PointerSize) -> ThreadOffset {
        let base = ThreadLayout::entrypoint_table_offset(ptr_size).0;
        ThreadOffset(base + (self as u32) * ptr_size.size() as u32)
    }
}

/// The JNI environment record handed to native code. The function table
/// pointer sits first per the JNI contract.
pub struct JniEnvLayout;

impl JniEnvLayout {
    pub const fn functions_offset() -> MemberOffset {
        MemberOffset(0)
    }

    pub const fn thread_offset(ptr_size: PointerSize) -> MemberOffset {
        MemberOffset(ptr_size.size() as u32)
    }

    pub const fn local_ref_cookie_offset(ptr_size: PointerSize) -> MemberOffset {
        MemberOffset(2 * ptr_size.size() as u32)
    }

    pub const fn segment_state_offset(ptr_size: PointerSize) -> MemberOffset {
        MemberOffset(2 * ptr_size.size() as u32 + IRT_COOKIE_SIZE as u32)
    }
}

/// The per-method runtime record. The declaring-class reference must stay
/// at offset zero: a pointer to the record doubles as the `jclass` handle
/// passed to static native methods.
pub struct MethodRecordLayout;

impl MethodRecordLayout {
    pub const fn declaring_class_offset() -> MemberOffset {
        MemberOffset(0)
    }

    pub const fn access_flags_offset() -> MemberOffset {
        MemberOffset(4)
    }

    pub const fn data_offset(ptr_size: PointerSize) -> MemberOffset {
        let _ = ptr_size;
        MemberOffset(16)
    }

    pub const fn entrypoint_from_native_offset(ptr_size: PointerSize) -> MemberOffset {
        MemberOffset(16 + ptr_size.size() as u32)
    }
}

/// Managed object header.
pub struct ObjectLayout;

impl ObjectLayout {
    pub const fn class_offset() -> MemberOffset {
        MemberOffset(0)
    }

    pub const fn monitor_offset() -> MemberOffset {
        MemberOffset(4)
    }
}
