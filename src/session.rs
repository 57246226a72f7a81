//! Session: the single owning object for one target's instrumentation state,
//! and the trait-based external interfaces the core consumes.
//!
//! A real caller is the out-of-scope module-notifier glue: it builds a
//! [`Session`], registers an [`EventHandler`], a [`LocalStorageAllocator`],
//! and any function-handler table up front, then calls
//! [`Session::instrument_target`]/[`Session::remove_target`] from its
//! module-load/unload callbacks.

use std::sync::{Arc, Mutex};

use kedr_asm::Bitness;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::deploy::{self, DetourBuffer};
use crate::error::{Error, FunctionError, Result};
use crate::fallback::{self, FallbackArea};
use crate::function::FunctionRecord;
use crate::ir;
use crate::module::ModuleImage;
use crate::runtime::{LocalStorageAllocator, WrapperTable};
use crate::{block, discovery, emit, transform};

/// Memory-event kind reported to [`EventHandler::on_memory_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemEventKind {
    Read,
    Write,
    Update,
}

/// Memory-barrier kind reported to [`EventHandler::on_barrier_pre`]/
/// [`EventHandler::on_barrier_post`], shared with [`crate::ir::BarrierKind`]
/// by name but kept as its own type since this one crosses the plugin
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    Full,
    Load,
    Store,
}

/// Lock/unlock kind reported to [`EventHandler::on_lock_pre`]/
/// [`EventHandler::on_unlock_pre`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Mutex,
    Spinlock,
}

/// The event handler plugin contract: one set registered at a time,
/// invoked at every contracted point. The core pins the providing module in
/// memory for the duration of each callback; default method bodies are
/// no-ops so a plugin only interested in a few events doesn't have to spell
/// out the rest.
pub trait EventHandler: Send + Sync {
    fn on_target_load(&self, _target: &str) {}
    fn on_target_unload(&self, _target: &str) {}
    fn on_function_entry(&self, _thread_id: u64, _orig_addr: u64) {}
    fn on_function_exit(&self, _thread_id: u64, _orig_addr: u64) {}
    fn on_call_pre(&self, _thread_id: u64, _pc: u64, _target_addr: u64) {}
    fn on_call_post(&self, _thread_id: u64, _pc: u64, _target_addr: u64) {}
    fn on_memory_event(&self, _thread_id: u64, _pc: u64, _addr: u64, _size: u8, _kind: MemEventKind) {}
    fn on_locked_op_pre(&self, _thread_id: u64, _pc: u64) {}
    fn on_locked_op_post(&self, _thread_id: u64, _pc: u64, _kind: MemEventKind) {}
    fn on_io_mem_op_pre(&self, _thread_id: u64, _pc: u64) {}
    fn on_io_mem_op_post(&self, _thread_id: u64, _pc: u64) {}
    fn on_barrier_pre(&self, _thread_id: u64, _pc: u64, _kind: BarrierKind) {}
    fn on_barrier_post(&self, _thread_id: u64, _pc: u64, _kind: BarrierKind) {}
    fn on_alloc_pre(&self, _thread_id: u64, _size: u64) {}
    fn on_alloc_post(&self, _thread_id: u64, _addr: u64) {}
    fn on_free_pre(&self, _thread_id: u64, _addr: u64) {}
    fn on_free_post(&self, _thread_id: u64, _addr: u64) {}
    fn on_lock_pre(&self, _thread_id: u64, _kind: LockKind) {}
    fn on_lock_post(&self, _thread_id: u64, _kind: LockKind) {}
    fn on_unlock_pre(&self, _thread_id: u64, _kind: LockKind) {}
    fn on_unlock_post(&self, _thread_id: u64, _kind: LockKind) {}
    fn on_signal_pre(&self, _thread_id: u64) {}
    fn on_signal_post(&self, _thread_id: u64) {}
    fn on_wait_pre(&self, _thread_id: u64) {}
    fn on_wait_post(&self, _thread_id: u64) {}
    fn on_thread_create(&self, _thread_id: u64, _new_thread_id: u64) {}
    fn on_thread_join(&self, _thread_id: u64, _joined_thread_id: u64) {}
}

/// One function-handler plugin's table entry: `original_address` keys
/// a binary search the core runs once at session start to fill each call
/// descriptor's `pre_handler`/`post_handler`/`replacement` slots.
#[derive(Debug, Clone, Copy)]
pub struct FunctionHandlerEntry {
    pub original_address: u64,
    pub pre_handler: u64,
    pub post_handler: u64,
    pub replacement: u64,
}

/// The section-resolver contract: invoked with the target's module
/// name, returns a `section_name -> base_address` map which the core
/// validates against the target's init/core area before trusting it.
pub trait SectionResolver: Send + Sync {
    fn resolve(&self, target_name: &str) -> Result<std::collections::HashMap<String, u64>>;
}

/// Everything built for one loaded target, held for the lifetime of its
/// instrumentation so [`Session::remove_target`] can find it again.
struct Target {
    module: ModuleImage,
    records: Vec<FunctionRecord>,
    fallback_areas: Vec<FallbackArea>,
    detour: DetourBuffer,
}

#[derive(Default)]
struct Registrations {
    event_handler: Option<Arc<dyn EventHandler>>,
    allocator: Option<Arc<dyn LocalStorageAllocator>>,
    function_handlers: Vec<FunctionHandlerEntry>,
}

/// Owns one target's instrumentation lifecycle plus the plugin
/// registrations that feed it. Every external entry point takes one of two
/// coarse locks: registration calls and the instrument/remove lifecycle all
/// serialize through `target`, and no target may be (un)loaded while a
/// registration call holds it.
pub struct Session {
    config: SessionConfig,
    wrappers: WrapperTable,
    registrations: Mutex<Registrations>,
    target: Mutex<Option<Target>>,
}

impl Session {
    pub fn new(config: SessionConfig, wrappers: WrapperTable) -> Self {
        Session {
            config,
            wrappers,
            registrations: Mutex::new(Registrations::default()),
            target: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register the single event handler plugin. Rejected while a
    /// target is loaded, matching `target`'s "no registration changes
    /// while a target is instrumented" discipline.
    pub fn register_event_handler(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let _target = self.target.lock().expect("target mutex poisoned");
        if _target.is_some() {
            return Err(Error::LifecycleConflict("cannot change the event handler while a target is loaded"));
        }
        self.registrations.lock().expect("registrations mutex poisoned").event_handler = Some(handler);
        Ok(())
    }

    /// Register the single local-storage allocator.
    pub fn register_allocator(&self, allocator: Arc<dyn LocalStorageAllocator>) -> Result<()> {
        let _target = self.target.lock().expect("target mutex poisoned");
        if _target.is_some() {
            return Err(Error::LifecycleConflict("cannot change the allocator while a target is loaded"));
        }
        self.registrations.lock().expect("registrations mutex poisoned").allocator = Some(allocator);
        Ok(())
    }

    /// Register a function-handler plugin's table. Fails if any entry's
    /// `original_address` is already claimed by a previously registered
    /// plugin.
    pub fn register_function_handlers(&self, entries: Vec<FunctionHandlerEntry>) -> Result<()> {
        let mut regs = self.registrations.lock().expect("registrations mutex poisoned");
        for new_entry in &entries {
            if regs.function_handlers.iter().any(|e| e.original_address == new_entry.original_address) {
                return Err(Error::LifecycleConflict("two function-handler plugins claim the same address"));
            }
        }
        regs.function_handlers.extend(entries);
        Ok(())
    }

    /// Run the full pipeline over a freshly loaded target and
    /// install the result: discover functions, build the fallback copies,
    /// build and transform each function's IR, emit and deploy. Per-function
    /// failures are skipped with a warning; a global allocation or
    /// layout failure aborts the whole instrumentation and the target is
    /// left unmodified.
    #[tracing::instrument(skip(self, module, fallback_bases), fields(target = %module.name))]
    pub fn instrument_target(
        &self,
        mut module: ModuleImage,
        bitness: Bitness,
        fallback_bases: std::collections::HashMap<String, u64>,
        detour_base: u64,
        init_addr: Option<u64>,
        exit_addr: Option<u64>,
    ) -> Result<()> {
        let mut target_slot = self.target.lock().expect("target mutex poisoned");
        if target_slot.is_some() {
            return Err(Error::LifecycleConflict("target is already instrumented"));
        }

        let regs = self.registrations.lock().expect("registrations mutex poisoned");
        let mut function_handlers = regs.function_handlers.clone();
        drop(regs);
        function_handlers.sort_by_key(|e| e.original_address);

        let mut records = discovery::discover_functions(&module, bitness);
        debug!(candidates = records.len(), "discovery complete");

        let mut fallback_areas = fallback::build_fallback_copies(&module, bitness, &mut records, &fallback_bases)?;

        let mut surviving = Vec::with_capacity(records.len());
        for mut record in records {
            match build_and_transform_one(&module, bitness, &self.wrappers, &function_handlers, &mut record) {
                Ok(()) => surviving.push(record),
                Err(err) => {
                    warn!(
                        addr = format_args!("{:#x}", record.orig_addr),
                        name = ?record.name,
                        error = %err,
                        "skipping function, target runs unmodified for it"
                    );
                }
            }
        }

        let (_, total) = deploy::layout_detour_buffer(&surviving);
        let mut detour = DetourBuffer::new(detour_base, total);

        let init_hook = init_addr.map(|addr| (addr, self.wrappers.on_function_entry));
        let exit_hook = exit_addr.map(|addr| (addr, self.wrappers.on_function_exit));

        deploy::deploy_functions(
            &mut module,
            bitness,
            &mut surviving,
            &mut fallback_areas,
            &mut detour,
            init_hook,
            exit_hook,
        )?;

        debug!(instrumented = surviving.len(), "deployment complete");
        *target_slot = Some(Target { module, records: surviving, fallback_areas, detour });
        Ok(())
    }

    /// Tear down the currently loaded target's instrumentation state.
    /// Since nothing here is pinned externally beyond this struct's own
    /// fields, tearing down is just dropping them in the reverse order they
    /// were acquired.
    pub fn remove_target(&self) -> Result<()> {
        let mut target_slot = self.target.lock().expect("target mutex poisoned");
        if target_slot.take().is_none() {
            return Err(Error::LifecycleConflict("no target is currently loaded"));
        }
        Ok(())
    }

    pub fn has_target(&self) -> bool {
        self.target.lock().expect("target mutex poisoned").is_some()
    }
}

/// Run one function through the per-function portion of the pipeline:
/// build IR, analyze blocks, pick `%base`, transform, and emit. Any failure
/// here is a [`FunctionError`] the caller skips.
fn build_and_transform_one(
    module: &ModuleImage,
    bitness: Bitness,
    wrappers: &WrapperTable,
    function_handlers: &[FunctionHandlerEntry],
    record: &mut FunctionRecord,
) -> std::result::Result<(), FunctionError> {
    let to_function_error = |record: &FunctionRecord, err: Error| FunctionError::new(record.orig_addr, record.name.clone(), err);

    if !record.has_minimum_size() {
        return Err(to_function_error(
            record,
            Error::UnsupportedInstruction("function is smaller than a near jump"),
        ));
    }

    let (nodes, jump_tables) = ir::build_function_ir(module, bitness, record.orig_addr, record.orig_size)
        .map_err(|e| to_function_error(record, e))?;
    record.nodes = nodes;
    record.jump_tables = jump_tables;

    record.blocks = block::analyze_blocks(&mut record.nodes, &record.jump_tables);

    let base = block::select_base_register(&record.nodes, bitness).map_err(|e| to_function_error(record, e))?;

    bind_call_descriptors(record, function_handlers);

    transform::transform_function(record, bitness, base, wrappers);
    emit::emit_function(record, bitness);

    Ok(())
}

/// Fill each call descriptor's plugin hooks from the concatenated,
/// address-sorted function-handler table, binary-searching it by
/// `original_address`.
fn bind_call_descriptors(record: &mut FunctionRecord, function_handlers: &[FunctionHandlerEntry]) {
    for call in record.calls.iter_mut() {
        if let Ok(idx) = function_handlers.binary_search_by_key(&call.target_addr, |e| e.original_address) {
            let entry = function_handlers[idx];
            call.pre_handler = entry.pre_handler;
            call.post_handler = entry.post_handler;
            call.replacement = entry.replacement;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Section;

    struct CountingHandler {
        entries: std::sync::atomic::AtomicU32,
    }

    impl EventHandler for CountingHandler {
        fn on_function_entry(&self, _thread_id: u64, _orig_addr: u64) {
            self.entries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn probe_module(bytes: &[u8]) -> ModuleImage {
        ModuleImage::new("probe")
            .with_section(Section::new(".text", 0x1000, bytes.to_vec()))
            .with_symbol("probe_fn", 0x1000)
    }

    #[test]
    fn rejects_registering_a_second_event_handler_while_a_target_is_loaded() {
        let config = SessionConfig::new("probe").unwrap();
        let session = Session::new(config, WrapperTable::unresolved());
        let handler = Arc::new(CountingHandler { entries: std::sync::atomic::AtomicU32::new(0) });
        session.register_event_handler(handler.clone()).unwrap();

        let bytes = vec![0x48, 0x8B, 0x07, 0xC3, 0xC3, 0xC3, 0xC3, 0xC3];
        let module = probe_module(&bytes);
        let bases = std::collections::HashMap::from([(".text".to_string(), 0x9000_0000u64)]);
        session.instrument_target(module, Bitness::X64, bases, 0xA000_0000, None, None).unwrap();

        assert!(session.register_event_handler(handler).is_err());
    }

    #[test]
    fn rejects_instrumenting_twice_without_removal() {
        let config = SessionConfig::new("probe").unwrap();
        let session = Session::new(config, WrapperTable::unresolved());

        let bytes = vec![0x48, 0x8B, 0x07, 0xC3, 0xC3, 0xC3, 0xC3, 0xC3];
        let bases = std::collections::HashMap::from([(".text".to_string(), 0x9000_0000u64)]);

        session.instrument_target(probe_module(&bytes), Bitness::X64, bases.clone(), 0xA000_0000, None, None).unwrap();
        assert!(session.instrument_target(probe_module(&bytes), Bitness::X64, bases, 0xA000_0000, None, None).is_err());

        session.remove_target().unwrap();
        assert!(!session.has_target());
    }

    #[test]
    fn rejects_two_function_handler_plugins_claiming_the_same_address() {
        let config = SessionConfig::new("probe").unwrap();
        let session = Session::new(config, WrapperTable::unresolved());
        let entry = FunctionHandlerEntry { original_address: 0x2000, pre_handler: 1, post_handler: 2, replacement: 0 };
        session.register_function_handlers(vec![entry]).unwrap();
        assert!(session.register_function_handlers(vec![entry]).is_err());
    }
}
