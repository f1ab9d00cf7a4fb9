//! Lazy-compilation stubs
//!
//! Each internal function gets a 10-byte stub: a near jump whose
//! displacement starts at zero (falling through) followed by a near call to
//! the module's shared resolver. The resolver saves the argument registers,
//! calls the compile-on-request trampoline with the stub return address,
//! restores, drops the return address, and tail-jumps to the compiled code.
//! Once compilation finishes, the jump displacement is rewritten atomically
//! so later calls bypass the resolver entirely.

use crate::code_memory::{CodeMemory, Protection, PAGE_SIZE};
use crate::EngineError;

/// Size of one per-function stub: `E9 dd dd dd dd  E8 dd dd dd dd`.
pub const STUB_SIZE: usize = 10;

/// Called by the resolver on first invocation of a function. Receives the
/// patched-in state pointer and the stub return address (which points just
/// past the calling stub); returns the compiled code address to enter.
pub type ResolverTrampoline =
    unsafe extern "C" fn(state: *mut core::ffi::c_void, stub_ret_addr: *const u8) -> *const u8;

pub struct StubBuilder {
    stubs_ptr: *mut u8,
    num_functions: u32,
    resolver_ptr: *mut u8,
}

// Safety: raw pointers into the module-owned code region; writes are
// serialized by the lazy scheduler and the documented atomic patch.
unsafe impl Send for StubBuilder {}
unsafe impl Sync for StubBuilder {}

impl StubBuilder {
    pub fn new() -> Self {
        StubBuilder {
            stubs_ptr: std::ptr::null_mut(),
            num_functions: 0,
            resolver_ptr: std::ptr::null_mut(),
        }
    }

    /// Reserve `num_functions * STUB_SIZE` bytes of stub space. The area
    /// stays writable+executable: displacements are patched while other
    /// threads may be running through the stubs.
    pub fn allocate_stub_space(
        &mut self,
        memory: &mut CodeMemory,
        num_functions: u32,
    ) -> Result<(), EngineError> {
        let total = num_functions as usize * STUB_SIZE;
        let ptr = memory.allocate(total, PAGE_SIZE)?;
        memory.protect(ptr, total, Protection::ReadWriteExec)?;
        self.stubs_ptr = ptr;
        self.num_functions = num_functions;
        Ok(())
    }

    /// Copy the resolver template into the module's code region, patching
    /// in the state pointer and trampoline address, then make it
    /// read/execute.
    pub fn compile_stub_resolver(
        &mut self,
        memory: &mut CodeMemory,
        state: *mut core::ffi::c_void,
        trampoline: ResolverTrampoline,
    ) -> Result<(), EngineError> {
        let (template, state_patch, trampoline_patch) = resolver_template();
        let ptr = memory.allocate(template.len(), PAGE_SIZE)?;
        // Safety: freshly allocated RW range of template length
        unsafe {
            std::ptr::copy_nonoverlapping(template.as_ptr(), ptr, template.len());
            let state_bytes = (state as u64).to_le_bytes();
            std::ptr::copy_nonoverlapping(state_bytes.as_ptr(), ptr.add(state_patch), 8);
            let trampoline_bytes = (trampoline as usize as u64).to_le_bytes();
            std::ptr::copy_nonoverlapping(
                trampoline_bytes.as_ptr(),
                ptr.add(trampoline_patch),
                8,
            );
        }
        memory.protect(ptr, template.len(), Protection::ReadExec)?;
        self.resolver_ptr = ptr;
        Ok(())
    }

    /// Write one function's stub: a zero-displacement jump (fall through)
    /// followed by a call into the shared resolver.
    pub fn compile_function_to_stub(&mut self, func_idx: u32) {
        debug_assert!(!self.resolver_ptr.is_null());
        let stub = self.func_stub_code_ptr(func_idx);
        // call displacement is relative to the end of the call instruction
        let call_site = unsafe { stub.add(5) };
        let rel = self.resolver_ptr as i64 - call_site as i64 - 5;
        debug_assert!(rel >= i32::MIN as i64 && rel <= i32::MAX as i64);
        let rel32 = (rel as i32).to_le_bytes();

        // Safety: stub points into the W+X stub area
        unsafe {
            stub.write(0xE9);
            std::ptr::write_bytes(stub.add(1), 0, 4);
            call_site.write(0xE8);
            std::ptr::copy_nonoverlapping(rel32.as_ptr(), call_site.add(1), 4);
        }
    }

    pub fn func_stub_code_ptr(&self, func_idx: u32) -> *mut u8 {
        debug_assert!(func_idx < self.num_functions);
        // Safety: within the allocated stub area
        unsafe { self.stubs_ptr.add(func_idx as usize * STUB_SIZE) }
    }

    pub fn func_idx_by_stub_code_ptr(&self, stub: *const u8) -> u32 {
        ((stub as usize - self.stubs_ptr as usize) / STUB_SIZE) as u32
    }

    /// Atomically rewrite a stub's jump displacement to point at `target`.
    ///
    /// A plain 4-byte store may be split by the compiler or the CPU; the
    /// displacement is written with an `xchg`, which is locked on x86, so
    /// concurrent executors observe either the old or the new jump.
    ///
    /// # Safety
    /// `stub` must point at a live stub within this module's stub area and
    /// `target` must stay within ±2 GiB of it.
    pub unsafe fn update_stub_jmp_target_ptr(stub: *mut u8, target: *const u8) {
        let rel = target as i64 - stub as i64 - 5;
        debug_assert!(rel >= i32::MIN as i64 && rel <= i32::MAX as i64);
        let rel32 = rel as i32;

        #[cfg(target_arch = "x86_64")]
        {
            let disp = stub.add(1);
            let mut value = rel32;
            core::arch::asm!(
                "xchg dword ptr [{disp}], {value:e}",
                disp = in(reg) disp,
                value = inout(reg) value,
                options(nostack, preserves_flags)
            );
            let _ = value;
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = rel32;
            unimplemented!("stub patching is x86-64 only");
        }
    }

    pub fn num_functions(&self) -> u32 {
        self.num_functions
    }
}

impl Default for StubBuilder {
    fn default() -> Self {
        StubBuilder::new()
    }
}

/// The resolver code template plus the byte offsets of its two 64-bit patch
/// points (state pointer, trampoline address).
fn resolver_template() -> (Vec<u8>, usize, usize) {
    let mut code: Vec<u8> = Vec::with_capacity(128);

    // save the six integer argument registers
    code.extend_from_slice(&[0x57, 0x56, 0x52, 0x51, 0x41, 0x50, 0x41, 0x51]);
    // sub rsp, 0x80 and save xmm0-7
    code.extend_from_slice(&[0x48, 0x81, 0xEC, 0x80, 0x00, 0x00, 0x00]);
    for (i, modrm) in [0x04u8, 0x4C, 0x54, 0x5C, 0x64, 0x6C, 0x74, 0x7C].iter().enumerate() {
        code.extend_from_slice(&[0x0F, 0x11, *modrm, 0x24]);
        if i > 0 {
            code.push((i * 0x10) as u8);
        }
    }
    // mov rsi, [rsp + 0xB0]  (the stub return address pushed by the call)
    code.extend_from_slice(&[0x48, 0x8B, 0xB4, 0x24, 0xB0, 0x00, 0x00, 0x00]);
    // movabs rdi, <state>
    code.extend_from_slice(&[0x48, 0xBF]);
    let state_patch = code.len();
    code.extend_from_slice(&[0; 8]);
    // movabs rax, <trampoline>
    code.extend_from_slice(&[0x48, 0xB8]);
    let trampoline_patch = code.len();
    code.extend_from_slice(&[0; 8]);
    // call rax
    code.extend_from_slice(&[0xFF, 0xD0]);
    // restore xmm0-7, add rsp, 0x80
    for (i, modrm) in [0x04u8, 0x4C, 0x54, 0x5C, 0x64, 0x6C, 0x74, 0x7C].iter().enumerate() {
        code.extend_from_slice(&[0x0F, 0x10, *modrm, 0x24]);
        if i > 0 {
            code.push((i * 0x10) as u8);
        }
    }
    code.extend_from_slice(&[0x48, 0x81, 0xC4, 0x80, 0x00, 0x00, 0x00]);
    // restore the integer argument registers
    code.extend_from_slice(&[0x41, 0x59, 0x41, 0x58, 0x59, 0x5A, 0x5E, 0x5F]);
    // drop the stub return address and enter the compiled code
    code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x08]);
    code.extend_from_slice(&[0xFF, 0xE0]);

    (code, state_patch, trampoline_patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn dummy_trampoline(
        _state: *mut core::ffi::c_void,
        _ret: *const u8,
    ) -> *const u8 {
        std::ptr::null()
    }

    #[cfg(unix)]
    fn builder_with(num: u32) -> (CodeMemory, StubBuilder) {
        let mut memory = CodeMemory::new(16 * PAGE_SIZE).unwrap();
        let mut builder = StubBuilder::new();
        builder.allocate_stub_space(&mut memory, num).unwrap();
        builder
            .compile_stub_resolver(&mut memory, std::ptr::null_mut(), dummy_trampoline)
            .unwrap();
        (memory, builder)
    }

    #[cfg(unix)]
    #[test]
    fn test_stub_template_bytes() {
        let (_memory, mut builder) = builder_with(4);
        builder.compile_function_to_stub(2);
        let stub = builder.func_stub_code_ptr(2);
        let bytes = unsafe { std::slice::from_raw_parts(stub, STUB_SIZE) };
        // jmp +0 (fall through), then call <resolver>
        assert_eq!(&bytes[0..5], &[0xE9, 0, 0, 0, 0]);
        assert_eq!(bytes[5], 0xE8);
        let rel = i32::from_le_bytes(bytes[6..10].try_into().unwrap());
        let resolved = (stub as i64 + STUB_SIZE as i64) + rel as i64;
        assert_eq!(resolved as usize, builder.resolver_ptr as usize);
    }

    #[cfg(unix)]
    #[test]
    fn test_stub_addressing_roundtrip() {
        let (_memory, builder) = builder_with(8);
        for idx in [0u32, 3, 7] {
            let stub = builder.func_stub_code_ptr(idx);
            assert_eq!(builder.func_idx_by_stub_code_ptr(stub), idx);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_patch_rewrites_displacement() {
        let (memory, mut builder) = builder_with(2);
        builder.compile_function_to_stub(0);
        let stub = builder.func_stub_code_ptr(0);
        // pretend some code got compiled elsewhere in the region
        let target = unsafe { memory.base().add(8 * PAGE_SIZE) };
        unsafe { StubBuilder::update_stub_jmp_target_ptr(stub, target) };

        let bytes = unsafe { std::slice::from_raw_parts(stub, STUB_SIZE) };
        assert_eq!(bytes[0], 0xE9);
        let rel = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!((stub as i64 + 5 + rel as i64) as usize, target as usize);
        // the call half of the stub is untouched
        assert_eq!(bytes[5], 0xE8);
    }

    #[test]
    fn test_resolver_template_patch_points() {
        let (code, state_patch, trampoline_patch) = resolver_template();
        // both patch points sit right after their movabs opcodes
        assert_eq!(&code[state_patch - 2..state_patch], &[0x48, 0xBF]);
        assert_eq!(&code[trampoline_patch - 2..trampoline_patch], &[0x48, 0xB8]);
        // template ends with the tail jump through rax
        assert_eq!(&code[code.len() - 2..], &[0xFF, 0xE0]);
    }
}
