//! Compile scheduling
//!
//! Eager mode compiles every function on the invoking thread and publishes
//! one read/execute region. Lazy mode publishes stubs immediately and
//! compiles per function — in the background through the thread pool, or
//! synchronously when a stub's resolver fires first. A per-function atomic
//! status cell (`None → Pending → InProgress → Done`) keeps the two paths
//! from compiling a function twice; the code pointer is published with
//! release ordering before the stub is patched.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

use kiln_codegen::{CodeEmitter, EmittedCode, RelocTarget};
use kiln_mir::{CompileContext, MirFunction};

use crate::code_memory::{CodeMemory, Protection};
use crate::config::{CompileConfig, DispatchStrategy};
use crate::module::WasmModule;
use crate::pool::ThreadPool;
use crate::stub::{StubBuilder, STUB_SIZE};
use crate::EngineError;

/// Supplies MIR per internal function, normally by driving
/// `FunctionBuilder` with decoded bytecode events.
pub trait FunctionSource: Send + Sync {
    fn build_mir(
        &self,
        ctx: &mut CompileContext,
        module: &WasmModule,
        config: &CompileConfig,
        internal_idx: u32,
    ) -> Result<MirFunction, EngineError>;
}

/// Builds one encoder per compile thread.
pub type EmitterFactory = Arc<dyn Fn() -> Box<dyn CodeEmitter> + Send + Sync>;

/// Per-thread compile state: interners plus the thread's encoder.
pub struct CompileTaskContext {
    pub ctx: CompileContext,
    pub emitter: Box<dyn CodeEmitter>,
}

const STATUS_NONE: u8 = 0;
const STATUS_PENDING: u8 = 1;
const STATUS_IN_PROGRESS: u8 = 2;
const STATUS_DONE: u8 = 3;

// ==================== Eager mode ====================

/// Every function's code, linked into one executable region.
pub struct CompiledModule {
    region: CodeMemory,
    entries: Vec<*const u8>,
}

// Safety: entries point into the owned, finalized R+X region.
unsafe impl Send for CompiledModule {}
unsafe impl Sync for CompiledModule {}

impl CompiledModule {
    pub fn entry(&self, internal_idx: u32) -> *const u8 {
        self.entries[internal_idx as usize]
    }

    pub fn num_functions(&self) -> usize {
        self.entries.len()
    }

    pub fn code_size(&self) -> usize {
        self.region.used()
    }
}

pub struct EagerCompiler {
    module: Arc<WasmModule>,
    config: CompileConfig,
    source: Arc<dyn FunctionSource>,
    emitter_factory: EmitterFactory,
}

impl EagerCompiler {
    pub fn new(
        module: Arc<WasmModule>,
        config: CompileConfig,
        source: Arc<dyn FunctionSource>,
        emitter_factory: EmitterFactory,
    ) -> Self {
        EagerCompiler {
            module,
            config,
            source,
            emitter_factory,
        }
    }

    /// Compile every internal function in order on this thread, then link
    /// and seal the region.
    pub fn compile(&self) -> Result<CompiledModule, EngineError> {
        let num_functions = self.module.num_internal_functions();
        let mut ctx = CompileContext::new();
        let mut emitter = (self.emitter_factory)();

        let mut emitted: Vec<EmittedCode> = Vec::with_capacity(num_functions as usize);
        for internal_idx in 0..num_functions {
            let mir = self
                .source
                .build_mir(&mut ctx, &self.module, &self.config, internal_idx)?;
            let cg = kiln_codegen::compile_mir_function(&ctx, &mir)?;
            emitted.push(emitter.emit_function(&cg)?);
        }

        let total: usize = emitted.iter().map(|e| e.code.len().next_multiple_of(16)).sum();
        let mut region = CodeMemory::new(total.max(16))?;
        let mut entries: Vec<*const u8> = Vec::with_capacity(emitted.len());
        for code in &emitted {
            let ptr = region.allocate(code.code.len().max(1), 16)?;
            // Safety: freshly allocated RW range
            unsafe {
                std::ptr::copy_nonoverlapping(code.code.as_ptr(), ptr, code.code.len());
            }
            entries.push(ptr);
        }

        for (code, &entry) in emitted.iter().zip(&entries) {
            for reloc in &code.relocs {
                let target = match reloc.target {
                    RelocTarget::Func(callee) => entries[callee as usize] as u64,
                    RelocTarget::Abs(addr) => addr,
                };
                // Safety: reloc offsets are within this function's bytes
                unsafe {
                    patch_rel32(entry as *mut u8, reloc.offset, target);
                }
            }
        }

        region.protect(region.base(), region.used(), Protection::ReadExec)?;
        Ok(CompiledModule { region, entries })
    }
}

/// Write the 4-byte PC-relative displacement at `code + offset`.
///
/// # Safety
/// `offset + 4` must be within the emitted bytes of `code`.
unsafe fn patch_rel32(code: *mut u8, offset: usize, target: u64) {
    let site = code.add(offset);
    let rel = target as i64 - (site as i64 + 4);
    debug_assert!(rel >= i32::MIN as i64 && rel <= i32::MAX as i64);
    let bytes = (rel as i32).to_le_bytes();
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), site, 4);
}

// ==================== Lazy mode ====================

struct LazyShared {
    module: Arc<WasmModule>,
    config: CompileConfig,
    source: Arc<dyn FunctionSource>,
    statuses: Vec<AtomicU8>,
    code_ptrs: Vec<AtomicPtr<u8>>,
    memory: Mutex<CodeMemory>,
    stubs: Mutex<StubBuilder>,
    main_context: Mutex<Option<CompileTaskContext>>,
    failed: AtomicBool,
    wait_lock: Mutex<()>,
    done_cv: Condvar,
}

impl LazyShared {
    fn request(
        &self,
        task_ctx: &mut CompileTaskContext,
        internal_idx: u32,
    ) -> Result<*const u8, EngineError> {
        let status = &self.statuses[internal_idx as usize];
        loop {
            if self.failed.load(Ordering::Acquire) {
                return Err(EngineError::ModuleFailed);
            }
            match status.load(Ordering::Acquire) {
                STATUS_DONE => {
                    let ptr = self.code_ptrs[internal_idx as usize].load(Ordering::Acquire);
                    if ptr.is_null() {
                        return Err(EngineError::ModuleFailed);
                    }
                    return Ok(ptr);
                }
                STATUS_IN_PROGRESS => {
                    // another worker owns the compile; block until published
                    let mut guard = self.wait_lock.lock();
                    if status.load(Ordering::Acquire) == STATUS_IN_PROGRESS {
                        self.done_cv.wait(&mut guard);
                    }
                }
                current => {
                    if status
                        .compare_exchange(
                            current,
                            STATUS_IN_PROGRESS,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return self.compile_and_publish(task_ctx, internal_idx);
                    }
                }
            }
        }
    }

    fn compile_and_publish(
        &self,
        task_ctx: &mut CompileTaskContext,
        internal_idx: u32,
    ) -> Result<*const u8, EngineError> {
        let result = self.compile_one(task_ctx, internal_idx);
        match result {
            Ok(ptr) => {
                self.code_ptrs[internal_idx as usize].store(ptr, Ordering::Release);
                {
                    let stubs = self.stubs.lock();
                    let stub = stubs.func_stub_code_ptr(internal_idx);
                    // Safety: stub and code live in this module's region
                    unsafe {
                        StubBuilder::update_stub_jmp_target_ptr(stub, ptr);
                    }
                }
                self.statuses[internal_idx as usize].store(STATUS_DONE, Ordering::Release);
                let _guard = self.wait_lock.lock();
                self.done_cv.notify_all();
                Ok(ptr as *const u8)
            }
            Err(err) => {
                // a single failure poisons the whole module
                self.failed.store(true, Ordering::Release);
                self.statuses[internal_idx as usize].store(STATUS_DONE, Ordering::Release);
                let _guard = self.wait_lock.lock();
                self.done_cv.notify_all();
                Err(err)
            }
        }
    }

    fn compile_one(
        &self,
        task_ctx: &mut CompileTaskContext,
        internal_idx: u32,
    ) -> Result<*mut u8, EngineError> {
        let mir =
            self.source
                .build_mir(&mut task_ctx.ctx, &self.module, &self.config, internal_idx)?;
        let cg = kiln_codegen::compile_mir_function(&task_ctx.ctx, &mir)?;
        let code = task_ctx.emitter.emit_function(&cg)?;

        let mut memory = self.memory.lock();
        let ptr = memory.allocate(code.code.len().max(1), 16)?;
        // Safety: allocated range within the region
        unsafe {
            std::ptr::copy_nonoverlapping(code.code.as_ptr(), ptr, code.code.len());
        }
        {
            let stubs = self.stubs.lock();
            for reloc in &code.relocs {
                let target = match reloc.target {
                    // calls between internal functions land on stubs, so
                    // callees may stay uncompiled
                    RelocTarget::Func(callee) => stubs.func_stub_code_ptr(callee) as u64,
                    RelocTarget::Abs(addr) => addr,
                };
                // Safety: reloc offsets are within this function's bytes
                unsafe {
                    patch_rel32(ptr, reloc.offset, target);
                }
            }
        }
        memory.protect(ptr, code.code.len().max(1), Protection::ReadWriteExec)?;
        Ok(ptr)
    }
}

/// Resolver entry: identify the stub from the return address, compile
/// synchronously (or wait for the in-flight compile), and hand back the
/// code pointer for the tail jump.
unsafe extern "C" fn compile_on_request_trampoline(
    state: *mut core::ffi::c_void,
    stub_ret_addr: *const u8,
) -> *const u8 {
    let shared = &*(state as *const LazyShared);
    let stub = stub_ret_addr.sub(STUB_SIZE);
    let internal_idx = shared.stubs.lock().func_idx_by_stub_code_ptr(stub);

    let mut main_context = shared.main_context.lock();
    let task_ctx = main_context.as_mut().expect("lazy compiler torn down");
    match shared.request(task_ctx, internal_idx) {
        Ok(ptr) => ptr,
        // nothing sane to jump to; the runtime treats this as fatal
        Err(_) => std::process::abort(),
    }
}

pub struct LazyCompiler {
    shared: Arc<LazyShared>,
    pool: ThreadPool<CompileTaskContext>,
}

impl LazyCompiler {
    /// Publish the module: allocate the stub region, copy the resolver, and
    /// point every function's entry at its stub.
    pub fn new(
        module: Arc<WasmModule>,
        config: CompileConfig,
        source: Arc<dyn FunctionSource>,
        emitter_factory: EmitterFactory,
        region_size: usize,
    ) -> Result<Self, EngineError> {
        let num_functions = module.num_internal_functions();
        let memory = CodeMemory::new(region_size)?;

        let shared = Arc::new(LazyShared {
            module,
            config,
            source,
            statuses: (0..num_functions).map(|_| AtomicU8::new(STATUS_NONE)).collect(),
            code_ptrs: (0..num_functions)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            memory: Mutex::new(memory),
            stubs: Mutex::new(StubBuilder::new()),
            main_context: Mutex::new(Some(CompileTaskContext {
                ctx: CompileContext::new(),
                emitter: emitter_factory(),
            })),
            failed: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            done_cv: Condvar::new(),
        });

        {
            let mut memory = shared.memory.lock();
            let mut stubs = shared.stubs.lock();
            stubs.allocate_stub_space(&mut memory, num_functions)?;
            let state = Arc::as_ptr(&shared) as *mut core::ffi::c_void;
            stubs.compile_stub_resolver(&mut memory, state, compile_on_request_trampoline)?;
            for internal_idx in 0..num_functions {
                stubs.compile_function_to_stub(internal_idx);
            }
        }

        let factory = Arc::clone(&emitter_factory);
        let pool = ThreadPool::new(
            0,
            move |_worker| CompileTaskContext {
                ctx: CompileContext::new(),
                emitter: factory(),
            },
            None,
        );

        Ok(LazyCompiler { shared, pool })
    }

    /// The callable entry for a function: its compiled code once published,
    /// its stub until then.
    pub fn function_entry(&self, internal_idx: u32) -> *const u8 {
        let ptr = self.shared.code_ptrs[internal_idx as usize].load(Ordering::Acquire);
        if !ptr.is_null() {
            return ptr;
        }
        self.shared.stubs.lock().func_stub_code_ptr(internal_idx)
    }

    /// Kick off background compilation per the configured strategy.
    pub fn precompile(&self) {
        match self.shared.config.dispatch {
            DispatchStrategy::InOrder => {
                for internal_idx in 0..self.shared.module.num_internal_functions() {
                    self.dispatch_compile_task(internal_idx);
                }
            }
            DispatchStrategy::DepthFirst => {
                let mut visited: FxHashSet<u32> = FxHashSet::default();
                let mut stack: Vec<u32> = self.shared.module.entry_points.clone();
                while let Some(internal_idx) = stack.pop() {
                    if !visited.insert(internal_idx) {
                        continue;
                    }
                    self.dispatch_compile_task(internal_idx);
                    let callees = &self.shared.module.functions[internal_idx as usize].callees;
                    for &callee in callees.iter().rev() {
                        stack.push(callee);
                    }
                }
            }
            DispatchStrategy::EntryOnly => {
                for &internal_idx in &self.shared.module.entry_points {
                    self.dispatch_compile_task(internal_idx);
                }
            }
        }
    }

    /// Queue one background compile; a lost CAS means someone already owns
    /// the function.
    pub fn dispatch_compile_task(&self, internal_idx: u32) {
        let status = &self.shared.statuses[internal_idx as usize];
        if status
            .compare_exchange(
                STATUS_NONE,
                STATUS_PENDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.pool.push_task(move |task_ctx| {
            let status = &shared.statuses[internal_idx as usize];
            if status
                .compare_exchange(
                    STATUS_PENDING,
                    STATUS_IN_PROGRESS,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // an on-request compile got here first
                return;
            }
            let _ = shared.compile_and_publish(task_ctx, internal_idx);
        });
    }

    /// Synchronous compile used by the stub resolver; also callable
    /// directly by a runtime that resolved the stub itself.
    pub fn compile_function_on_request(
        &self,
        func_stub_code_ptr: *const u8,
    ) -> Result<*const u8, EngineError> {
        let internal_idx = self
            .shared
            .stubs
            .lock()
            .func_idx_by_stub_code_ptr(func_stub_code_ptr);
        let mut main_context = self.shared.main_context.lock();
        let task_ctx = main_context.as_mut().expect("lazy compiler torn down");
        self.shared.request(task_ctx, internal_idx)
    }

    /// Drain the background queue.
    pub fn wait_for_background_tasks(&self) {
        self.pool.wait_for_tasks();
    }

    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn is_compiled(&self, internal_idx: u32) -> bool {
        self.shared.statuses[internal_idx as usize].load(Ordering::Acquire) == STATUS_DONE
            && !self.shared.code_ptrs[internal_idx as usize]
                .load(Ordering::Acquire)
                .is_null()
    }
}
