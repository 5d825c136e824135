// The runtime: roots, lifecycle, and the garbage collector driver.
//
// A runtime bundles a heap, the deep frozen roots object, the mutable
// roots, the module registry, the builtin table, and the pluggable
// system collaborators. Initialization bootstraps the self-describing
// species graph, builds a species for every family and mode, interns
// the keys and singletons, installs the builtins, and finally freezes
// and deep-freeze-validates the roots so the bulk of species dispatch
// only ever reaches frozen memory.

use std::collections::HashSet;

use serde::Deserialize;

use crate::behavior::{self, Behavior, Family, Mode, ALL_FAMILIES};
use crate::clock::{Clock, FileSystem, NativeClock, NativeFileSystem};
use crate::freeze;
use crate::heap::{GcFuzzer, Heap, SafeValue, TrackerFlag};
use crate::interp;
use crate::object::{self, Division, generic_validate};
use crate::plugin;
use crate::util::PseudoRandom;
use crate::value::{
    self, Cause, Condition, Result, SystemError, Value, is_nothing, nothing,
};


// --- C o n f i g u r a t i o n ---

// The complete set of runtime options. The numeric options can also
// be loaded from a RON file; collaborators are plugged in through
// RuntimeBuilder-style setters on the config.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    // Size in bytes of each semispace.
    pub semispace_size_bytes: u64,
    // Hard ceiling across all allocations.
    pub system_memory_limit: u64,
    // Mean allocations between fuzzed failures; zero disables.
    pub gc_fuzz_freq: u64,
    pub gc_fuzz_seed: u64,
    // Seeds the runtime's pseudo-random stream.
    pub random_seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            semispace_size_bytes: 1024 * 1024,
            system_memory_limit: 100 * 1024 * 1024,
            gc_fuzz_freq: 0,
            gc_fuzz_seed: 0,
            random_seed: 0x9D5C326B950E060E,
        }
    }
}

pub fn load_config(path: &str) -> std::result::Result<RuntimeConfig, String> {
    let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    ron::de::from_reader(file).map_err(|e| e.to_string())
}

// The least number of allocations between forced fuzzer failures.
pub const GC_FUZZER_MIN_FREQUENCY: u64 = 64;


// --- R o o t s   l a y o u t ---

// The roots object is one big heap object: first a species table with
// five slots per family (one compact slot, then fluid, mutable,
// frozen and deep frozen), then the named singletons below.

pub const SPECIES_SLOTS_PER_FAMILY: u64 = 5;
pub const ROOTS_SPECIES_TABLE_OFFSET: u64 = 1;
pub const ROOTS_NAMED_OFFSET: u64 =
    ROOTS_SPECIES_TABLE_OFFSET + (behavior::FAMILY_COUNT as u64) * SPECIES_SLOTS_PER_FAMILY;
pub const ROOTS_SIZE: u64 = ROOTS_NAMED_OFFSET + NAMED_ROOT_COUNT as u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NamedRoot {
    SubjectKey = 0,
    SelectorKey = 1,
    EmptyArray = 2,
    EmptyArrayBuffer = 3,
    EmptyPath = 4,
    EmptyBlob = 5,
    EmptyCodeBlock = 6,
    EmptyInstanceSpecies = 7,
    AnyGuard = 8,
    BuiltinImpls = 9,
    BuiltinMethodspace = 10,
    OpCall = 11,
    StackBottomCodeBlock = 12,
    StackPieceBottomCodeBlock = 13,
    IntegerType = 14,
    StringType = 15,
    BooleanType = 16,
    NullType = 17,
    ArrayType = 18,
    LambdaType = 19,
    BlockType = 20,
    CallDataType = 21,
    PromiseType = 22,
    PluginFactories = 23,
}

pub const NAMED_ROOT_COUNT: usize = 24;

fn species_root_index(family: Family, slot: u64) -> u64 {
    ROOTS_SPECIES_TABLE_OFFSET + (family as u64) * SPECIES_SLOTS_PER_FAMILY + slot
}

fn named_root_index(root: NamedRoot) -> u64 {
    ROOTS_NAMED_OFFSET + root as u64
}

// The commonly needed roots resolved into one struct for ergonomic
// access; hot paths read individual roots instead.
pub struct RootsView {
    pub subject_key: Value,
    pub selector_key: Value,
    pub empty_array: Value,
    pub empty_array_buffer: Value,
    pub empty_path: Value,
    pub empty_blob: Value,
    pub empty_code_block: Value,
    pub empty_instance_species: Value,
    pub any_guard: Value,
    pub builtin_impls: Value,
    pub builtin_methodspace: Value,
    pub op_call: Value,
    pub stack_bottom_code_block: Value,
    pub stack_piece_bottom_code_block: Value,
    pub integer_type: Value,
    pub string_type: Value,
    pub boolean_type: Value,
    pub null_type: Value,
    pub array_type: Value,
    pub lambda_type: Value,
    pub block_type: Value,
    pub call_data_type: Value,
    pub promise_type: Value,
    pub plugin_factories: Value,
}


pub const MUTABLE_ROOTS_TRIE_OFFSET: u64 = 1;
pub const MUTABLE_ROOTS_SIZE: u64 = 2;


pub struct Runtime {
    pub heap: Heap,
    roots: Value,
    mutable_roots: Value,
    // Modules by name; held through a tracker so collections keep it.
    module_registry: Option<SafeValue>,
    pub builtins: Vec<interp::BuiltinImpl>,
    pub services: Vec<plugin::ServiceBinding>,
    random: PseudoRandom,
    next_key_index: i64,
    pub file_system: Box<dyn FileSystem>,
    pub clock: Box<dyn Clock>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish()
    }
}

impl Runtime {
    pub fn new(config: &RuntimeConfig) -> Result<Runtime> {
        Runtime::with_collaborators(
            config,
            Box::new(NativeFileSystem),
            Box::new(NativeClock),
            &[],
        )
    }

    pub fn with_default_config() -> Result<Runtime> {
        Runtime::new(&RuntimeConfig::default())
    }

    pub fn with_collaborators(
        config: &RuntimeConfig,
        file_system: Box<dyn FileSystem>,
        clock: Box<dyn Clock>,
        plugins: &[plugin::ServiceDescriptor],
    ) -> Result<Runtime> {
        let semispace_words = config.semispace_size_bytes / 8;
        if config.semispace_size_bytes * 2 > config.system_memory_limit {
            return Err(Condition::system_error(SystemError::AllocationFailed));
        }
        let mut runtime = Runtime {
            heap: Heap::new(semispace_words),
            roots: nothing(),
            mutable_roots: nothing(),
            module_registry: None,
            builtins: Vec::new(),
            services: Vec::new(),
            random: PseudoRandom::new(config.random_seed),
            next_key_index: 0,
            file_system,
            clock,
        };
        runtime.hard_init()?;
        runtime.soft_init(plugins)?;
        runtime.freeze_shared_state()?;
        runtime.validate()?;
        // Fuzzing starts after initialization so bootstrap is exempt.
        if config.gc_fuzz_freq > 0 {
            runtime.heap.fuzzer = Some(GcFuzzer::new(
                GC_FUZZER_MIN_FREQUENCY,
                config.gc_fuzz_freq,
                config.gc_fuzz_seed,
            ));
        }
        Ok(runtime)
    }

    // --- A l l o c a t i o n ---

    pub fn alloc_heap_object(&mut self, size: u64, species: Value) -> Result<Value> {
        if self.heap.fuzz_tick() {
            return Err(Condition::heap_exhausted(size));
        }
        let addr = self.heap.try_alloc(size)?;
        let result = Value::new_heap_object(addr);
        object::set_header(&mut self.heap, result, species);
        Ok(result)
    }

    // Allocation used during bootstrap, before any species exists.
    fn alloc_raw(&mut self, size: u64) -> Result<Value> {
        let addr = self.heap.try_alloc(size)?;
        Ok(Value::new_heap_object(addr))
    }

    // --- R o o t   a c c e s s ---

    pub fn roots_object(&self) -> Value {
        self.roots
    }

    pub fn root(&self, root: NamedRoot) -> Value {
        self.heap
            .value_at(self.roots.as_heap_object() + named_root_index(root))
    }

    fn set_root(&mut self, root: NamedRoot, value: Value) {
        let addr = self.roots.as_heap_object() + named_root_index(root);
        self.heap.set_value_at(addr, value);
    }

    pub fn species_for(&self, family: Family, mode: Mode) -> Value {
        let behavior = behavior::family_behavior(family);
        let slot = match behavior.division {
            Division::Compact => 0,
            Division::Modal => 1 + mode as u64,
            Division::Instance | Division::CObject => {
                panic!("species of {} are created per type", family.name())
            }
        };
        self.heap
            .value_at(self.roots.as_heap_object() + species_root_index(family, slot))
    }

    // The header to stamp on newly made species.
    pub fn species_species(&self) -> Value {
        self.species_for(Family::Species, Mode::Mutable)
    }

    // Mode transitions on modal species look up the sibling with the
    // wanted mode through the base root recorded in the species.
    pub fn modal_species_sibling(&self, species: Value, mode: Mode) -> Value {
        let base = object::get_modal_species_base_root(&self.heap, species);
        self.heap
            .value_at(self.roots.as_heap_object() + base + (mode as u64))
    }

    pub fn roots(&self) -> RootsView {
        RootsView {
            subject_key: self.root(NamedRoot::SubjectKey),
            selector_key: self.root(NamedRoot::SelectorKey),
            empty_array: self.root(NamedRoot::EmptyArray),
            empty_array_buffer: self.root(NamedRoot::EmptyArrayBuffer),
            empty_path: self.root(NamedRoot::EmptyPath),
            empty_blob: self.root(NamedRoot::EmptyBlob),
            empty_code_block: self.root(NamedRoot::EmptyCodeBlock),
            empty_instance_species: self.root(NamedRoot::EmptyInstanceSpecies),
            any_guard: self.root(NamedRoot::AnyGuard),
            builtin_impls: self.root(NamedRoot::BuiltinImpls),
            builtin_methodspace: self.root(NamedRoot::BuiltinMethodspace),
            op_call: self.root(NamedRoot::OpCall),
            stack_bottom_code_block: self.root(NamedRoot::StackBottomCodeBlock),
            stack_piece_bottom_code_block: self.root(NamedRoot::StackPieceBottomCodeBlock),
            integer_type: self.root(NamedRoot::IntegerType),
            string_type: self.root(NamedRoot::StringType),
            boolean_type: self.root(NamedRoot::BooleanType),
            null_type: self.root(NamedRoot::NullType),
            array_type: self.root(NamedRoot::ArrayType),
            lambda_type: self.root(NamedRoot::LambdaType),
            block_type: self.root(NamedRoot::BlockType),
            call_data_type: self.root(NamedRoot::CallDataType),
            promise_type: self.root(NamedRoot::PromiseType),
            plugin_factories: self.root(NamedRoot::PluginFactories),
        }
    }

    pub fn argument_map_trie_root(&self) -> Value {
        self.heap
            .value_at(self.mutable_roots.as_heap_object() + MUTABLE_ROOTS_TRIE_OFFSET)
    }

    pub fn next_key_id(&mut self) -> i64 {
        let id = self.next_key_index;
        self.next_key_index += 1;
        id
    }

    pub fn next_random(&mut self) -> u64 {
        self.random.next_u64()
    }

    pub fn module_registry(&self) -> Value {
        match self.module_registry {
            Some(safe) => self.heap.deref(safe),
            None => nothing(),
        }
    }

    pub fn install_plugin_factories(&mut self, array: Value) {
        self.set_root(NamedRoot::PluginFactories, array);
    }

    // Ingests a serialized library: a tagged instance holding a map
    // of named modules. The modules land in the registry under the
    // library's display name. An exhausted first attempt is redone
    // once after a collection.
    pub fn load_library_from_stream(&mut self, data: &[u8], display_name: &str) -> Result<()> {
        self.retry_after_gc(|runtime| {
            let deserialized = crate::plankton::deserialize(runtime, data)?;
            if !object::in_family(&runtime.heap, Family::Instance, deserialized) {
                return Err(Condition::invalid_input());
            }
            let modules_key = object::new_heap_utf8(runtime, "modules")?;
            let modules = object::get_instance_field(&runtime.heap, deserialized, modules_key)
                .map_err(|_| Condition::invalid_input())?;
            let name_value = object::new_heap_utf8(runtime, display_name)?;
            let library = object::new_heap_library(runtime, name_value)?;
            let library_modules = object::get_library_modules(&runtime.heap, library);
            for (key, module) in object::id_hash_map_entries(&runtime.heap, modules) {
                object::set_id_hash_map_at(runtime, library_modules, key, module)?;
            }
            let registry = runtime.module_registry();
            object::set_id_hash_map_at(runtime, registry, name_value, library)
        })
    }

    // --- B o o t s t r a p ---

    // Builds the heap state the rest of initialization relies on: the
    // self-describing meta species, a species for every family, the
    // roots object with all its named entries, and the mutable roots.
    fn hard_init(&mut self) -> Result<()> {
        // The four metas describe species themselves. Their headers
        // all point at the mutable meta, the mutable meta's header at
        // itself; the loop is what makes the graph self-describing.
        let mutable_meta = self.alloc_raw(object::MODAL_SPECIES_SIZE)?;
        self.init_modal_species_fields(mutable_meta, Family::Species, Mode::Mutable);
        object::set_header(&mut self.heap, mutable_meta, mutable_meta);
        let mut metas = [nothing(); 4];
        for &mode in [Mode::Fluid, Mode::Mutable, Mode::Frozen, Mode::DeepFrozen].iter() {
            let meta = if mode == Mode::Mutable {
                mutable_meta
            } else {
                let meta = self.alloc_raw(object::MODAL_SPECIES_SIZE)?;
                self.init_modal_species_fields(meta, Family::Species, mode);
                object::set_header(&mut self.heap, meta, mutable_meta);
                meta
            };
            metas[mode as usize] = meta;
        }
        // The roots species must exist before the roots object.
        let mut roots_species = [nothing(); 4];
        for &mode in [Mode::Fluid, Mode::Mutable, Mode::Frozen, Mode::DeepFrozen].iter() {
            let species = self.alloc_raw(object::MODAL_SPECIES_SIZE)?;
            self.init_modal_species_fields(species, Family::Roots, mode);
            object::set_header(&mut self.heap, species, mutable_meta);
            roots_species[mode as usize] = species;
        }
        // Reserve the roots object and clear every field.
        let roots = self.alloc_raw(ROOTS_SIZE)?;
        object::set_header(&mut self.heap, roots, roots_species[Mode::Mutable as usize]);
        for index in 1..ROOTS_SIZE {
            self.heap
                .set_value_at(roots.as_heap_object() + index, nothing());
        }
        self.roots = roots;
        for &mode in [Mode::Fluid, Mode::Mutable, Mode::Frozen, Mode::DeepFrozen].iter() {
            self.set_species_root(Family::Species, 1 + mode as u64, metas[mode as usize]);
            self.set_species_root(Family::Roots, 1 + mode as u64, roots_species[mode as usize]);
        }
        // Create the species for every remaining family.
        for &family in ALL_FAMILIES.iter() {
            if family == Family::Species || family == Family::Roots {
                continue;
            }
            match behavior::family_behavior(family).division {
                Division::Modal => {
                    for &mode in
                        [Mode::Fluid, Mode::Mutable, Mode::Frozen, Mode::DeepFrozen].iter()
                    {
                        let species = self.alloc_heap_object(
                            object::MODAL_SPECIES_SIZE,
                            mutable_meta,
                        )?;
                        self.init_modal_species_fields(species, family, mode);
                        self.set_species_root(family, 1 + mode as u64, species);
                    }
                }
                Division::Compact => {
                    let species =
                        self.alloc_heap_object(object::COMPACT_SPECIES_SIZE, mutable_meta)?;
                    let heap = &mut self.heap;
                    let addr = species.as_heap_object();
                    heap.set_value_at(
                        addr + object::SPECIES_DIVISION_OFFSET,
                        Value::new_integer(Division::Compact as i64),
                    );
                    heap.set_value_at(
                        addr + object::SPECIES_FAMILY_OFFSET,
                        Value::new_integer(family as i64),
                    );
                    self.set_species_root(family, 0, species);
                }
                // Per-type species are created on demand.
                Division::Instance | Division::CObject => {}
            }
        }
        self.init_named_roots()?;
        // The mutable roots hold the state that must keep mutating
        // after the freeze, chiefly the argument map trie.
        let empty = self.root(NamedRoot::EmptyArray);
        let trie = crate::method::new_heap_argument_map_trie(self, empty)?;
        let species = self.species_for(Family::MutableRoots, Mode::Mutable);
        let mutable_roots = self.alloc_heap_object(MUTABLE_ROOTS_SIZE, species)?;
        self.heap
            .set_value_at(mutable_roots.as_heap_object() + MUTABLE_ROOTS_TRIE_OFFSET, trie);
        self.mutable_roots = mutable_roots;
        Ok(())
    }

    fn init_modal_species_fields(&mut self, species: Value, family: Family, mode: Mode) {
        let heap = &mut self.heap;
        let addr = species.as_heap_object();
        heap.set_value_at(
            addr + object::SPECIES_DIVISION_OFFSET,
            Value::new_integer(Division::Modal as i64),
        );
        heap.set_value_at(
            addr + object::SPECIES_FAMILY_OFFSET,
            Value::new_integer(family as i64),
        );
        heap.set_value_at(addr + object::SPECIES_MODE_OFFSET, Value::new_integer(mode as i64));
        // Mode transitions find their sibling relative to the fluid
        // slot.
        heap.set_value_at(
            addr + object::MODAL_SPECIES_BASE_ROOT_OFFSET,
            Value::new_integer(species_root_index(family, 1 + Mode::Fluid as u64) as i64),
        );
    }

    fn set_species_root(&mut self, family: Family, slot: u64, species: Value) {
        let addr = self.roots.as_heap_object() + species_root_index(family, slot);
        self.heap.set_value_at(addr, species);
    }

    fn init_named_roots(&mut self) -> Result<()> {
        // The subject and selector keys get ids 0 and 1 so call tag
        // entries sort them before everything else.
        let subject_name = object::new_heap_utf8(self, "subject")?;
        let subject_key = object::new_heap_key(self, subject_name)?;
        self.set_root(NamedRoot::SubjectKey, subject_key);
        let selector_name = object::new_heap_utf8(self, "selector")?;
        let selector_key = object::new_heap_key(self, selector_name)?;
        self.set_root(NamedRoot::SelectorKey, selector_key);

        let empty_array = object::new_heap_array(self, 0)?;
        self.set_root(NamedRoot::EmptyArray, empty_array);
        let empty_buffer = object::new_heap_array_buffer(self, 0)?;
        self.set_root(NamedRoot::EmptyArrayBuffer, empty_buffer);
        let empty_path = object::new_heap_path(self, nothing(), nothing())?;
        self.set_root(NamedRoot::EmptyPath, empty_path);
        let empty_blob = object::new_heap_blob(self, 0)?;
        self.set_root(NamedRoot::EmptyBlob, empty_blob);
        let empty_code = object::new_heap_code_block(self, empty_blob, empty_array, 1)?;
        self.set_root(NamedRoot::EmptyCodeBlock, empty_code);

        let any_guard = crate::method::new_heap_guard(
            self,
            crate::method::GuardType::Any,
            value::null(),
        )?;
        self.set_root(NamedRoot::AnyGuard, any_guard);

        let builtin_impls = object::new_heap_id_hash_map(self, 256)?;
        self.set_root(NamedRoot::BuiltinImpls, builtin_impls);
        let builtin_space = crate::method::new_heap_methodspace(self, nothing())?;
        self.set_root(NamedRoot::BuiltinMethodspace, builtin_space);

        let op_call = object::new_heap_operation(self, object::OperationType::Call, value::null())?;
        self.set_root(NamedRoot::OpCall, op_call);

        // The capping code blocks: returning into the bottom frames
        // executes these single opcodes.
        let stack_bottom = interp::new_capping_code_block(self, interp::Opcode::StackBottom)?;
        self.set_root(NamedRoot::StackBottomCodeBlock, stack_bottom);
        let piece_bottom =
            interp::new_capping_code_block(self, interp::Opcode::StackPieceBottom)?;
        self.set_root(NamedRoot::StackPieceBottomCodeBlock, piece_bottom);

        for &(root, name) in [
            (NamedRoot::IntegerType, "Integer"),
            (NamedRoot::StringType, "String"),
            (NamedRoot::BooleanType, "Bool"),
            (NamedRoot::NullType, "Null"),
            (NamedRoot::ArrayType, "Array"),
            (NamedRoot::LambdaType, "Lambda"),
            (NamedRoot::BlockType, "Block"),
            (NamedRoot::CallDataType, "CallData"),
            (NamedRoot::PromiseType, "Promise"),
        ]
        .iter()
        {
            let display_name = object::new_heap_utf8(self, name)?;
            let type_value = object::new_heap_type(self, display_name)?;
            self.set_root(root, type_value);
        }

        let empty_type = self.root(NamedRoot::NullType);
        let instance_species =
            object::new_heap_instance_species(self, empty_type, nothing(), Mode::Mutable)?;
        self.set_root(NamedRoot::EmptyInstanceSpecies, instance_species);

        self.set_root(NamedRoot::PluginFactories, empty_array);
        Ok(())
    }

    // Initialization that relies on the runtime being functional.
    fn soft_init(&mut self, plugins: &[plugin::ServiceDescriptor]) -> Result<()> {
        let registry = object::new_heap_id_hash_map(self, 16)?;
        let safe = self.heap.protect(registry);
        self.module_registry = Some(safe);
        interp::install_builtin_implementations(self)?;
        plugin::install_services(self, plugins)?;
        Ok(())
    }

    // Freezes everything reachable from the roots and validates the
    // deep frozen bit. After this, shared state only changes through
    // the sanctioned freeze cheats.
    fn freeze_shared_state(&mut self) -> Result<()> {
        let roots = self.roots;
        let mut visited = HashSet::new();
        self.deep_freeze(roots, &mut visited)?;
        freeze::validate_deep_frozen(self, roots)
    }

    fn deep_freeze(&mut self, value: Value, visited: &mut HashSet<u64>) -> Result<()> {
        if !value.is_heap_object() || !visited.insert(value.raw()) {
            return Ok(());
        }
        freeze::ensure_frozen(self, value)?;
        let behavior = object::get_behavior(&self.heap, value);
        if !behavior.deep_frozen_field_validation {
            return Ok(());
        }
        let layout = behavior::object_layout(&self.heap, value);
        let base = value.as_heap_object();
        for offset in std::iter::once(0).chain(layout.value_offset..layout.size) {
            let field = self.heap.value_at(base + offset);
            self.deep_freeze(field, visited)?;
        }
        Ok(())
    }

    // --- P r i m a r y   t y p e s ---

    pub fn get_primary_type(&self, value: Value) -> Result<Value> {
        match value.domain() {
            value::Domain::Integer => Ok(self.root(NamedRoot::IntegerType)),
            value::Domain::CustomTagged => match value.phylum() {
                value::Phylum::Boolean => Ok(self.root(NamedRoot::BooleanType)),
                value::Phylum::Null => Ok(self.root(NamedRoot::NullType)),
                phylum => Err(Condition::unsupported_behavior(phylum as u32, 1)),
            },
            value::Domain::HeapObject => {
                let behavior = object::get_behavior(&self.heap, value);
                if let Some(get) = behavior.get_primary_type {
                    return Ok(get(self, value));
                }
                match object::get_family(&self.heap, value) {
                    Family::Utf8 => Ok(self.root(NamedRoot::StringType)),
                    Family::Array => Ok(self.root(NamedRoot::ArrayType)),
                    Family::Lambda => Ok(self.root(NamedRoot::LambdaType)),
                    Family::Block => Ok(self.root(NamedRoot::BlockType)),
                    Family::CallData => Ok(self.root(NamedRoot::CallDataType)),
                    Family::Promise => Ok(self.root(NamedRoot::PromiseType)),
                    family => Err(Condition::unsupported_behavior(family as u32, 1)),
                }
            }
            _ => Err(Condition::wat()),
        }
    }

    // --- G a r b a g e   c o l l e c t i o n ---

    pub fn garbage_collect(&mut self) -> Result<()> {
        self.heap.check_thread();
        self.validate()?;
        // Resolve the weakness of maybe-weak trackers for this cycle.
        for handle in self.heap.tracker_handles() {
            let tracker = self.heap.tracker(handle);
            if tracker.flags.contains(TrackerFlag::MaybeWeak) {
                if let Some(predicate) = tracker.predicate {
                    let value = tracker.value;
                    let weak = predicate(&self.heap, value);
                    self.heap.tracker_mut(handle).acts_weak = weak;
                }
            }
        }
        self.heap.prepare_garbage_collection();
        let mut gc = GcState { pending_fixups: Vec::new() };
        // Shallow-migrate the root slots and non-weak tracker values.
        self.roots = migrate_value(&mut self.heap, &mut gc, self.roots);
        self.mutable_roots = migrate_value(&mut self.heap, &mut gc, self.mutable_roots);
        for handle in self.heap.tracker_handles() {
            let (acts_weak, value) = {
                let tracker = self.heap.tracker(handle);
                (tracker.acts_weak, tracker.value)
            };
            if acts_weak {
                continue;
            }
            let migrated = migrate_value(&mut self.heap, &mut gc, value);
            self.heap.tracker_mut(handle).value = migrated;
        }
        // Sweep to-space in allocation order until the scan pointer
        // catches the allocation pointer.
        let mut scan = self.heap.to_space().start();
        while scan < self.heap.to_space().next_free() {
            let object = Value::new_heap_object(scan);
            let layout = behavior::object_layout(&self.heap, object);
            // The header is a field like any other.
            for offset in std::iter::once(0).chain(layout.value_offset..layout.size) {
                let field = self.heap.value_at(scan + offset);
                let migrated = migrate_value(&mut self.heap, &mut gc, field);
                self.heap.set_value_at(scan + offset, migrated);
            }
            scan += layout.size;
        }
        // Post-process the weak trackers now that liveness is known.
        for handle in self.heap.tracker_handles() {
            let (acts_weak, value, flags) = {
                let tracker = self.heap.tracker(handle);
                (tracker.acts_weak, tracker.value, tracker.flags)
            };
            if !acts_weak || !value.is_heap_object() {
                continue;
            }
            let header = self.heap.value_at(value.as_heap_object());
            if header.is_moved_object() {
                self.heap.tracker_mut(handle).value = header.moved_object_target();
            } else {
                // The referent was not migrated, so it is garbage.
                if flags.contains(TrackerFlag::Finalize) {
                    self.finalize_dead_object(value);
                }
                let tracker = self.heap.tracker_mut(handle);
                tracker.value = nothing();
                tracker.is_garbage = true;
                if flags.contains(TrackerFlag::SelfDestruct) {
                    self.heap.dispose_tracker(handle);
                }
            }
        }
        // Per-family fixups run when everything has been migrated.
        for (new_object, old_object) in gc.pending_fixups {
            let behavior = object::get_behavior(&self.heap, new_object);
            if let Some(fixup) = behavior.post_migrate_fixup {
                fixup(&mut self.heap, new_object, old_object);
            }
        }
        self.heap.complete_garbage_collection();
        self.validate()
    }

    // Runs the family finalizer on an object that did not survive the
    // collection. The from-space copy is still intact enough for the
    // finalizer to read its layout.
    fn finalize_dead_object(&mut self, value: Value) {
        let mut species = self.heap.value_at(value.as_heap_object());
        if species.is_moved_object() {
            species = species.moved_object_target();
        }
        let family = object::get_species_family(&self.heap, species);
        if let Some(finalize) = behavior::family_behavior(family).finalize {
            finalize(&mut self.heap, value);
        }
    }

    pub fn protect_value(&mut self, value: Value) -> SafeValue {
        self.heap.protect(value)
    }

    pub fn dispose_safe_value(&mut self, safe: SafeValue) {
        self.heap.dispose_safe_value(safe);
    }

    // Retries a heap-exhausted operation once after forcing a
    // collection, with fuzzing suspended so the retry is not failed
    // artificially. A second exhaustion becomes OutOfMemory.
    pub fn retry_after_gc<T, F>(&mut self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut Runtime) -> Result<T>,
    {
        match op(self) {
            Err(condition) if condition.cause() == Cause::HeapExhausted => {
                let fuzzing = self.heap.fuzzer.as_ref().map_or(false, |f| f.is_enabled());
                if fuzzing {
                    self.heap.toggle_fuzzing(false);
                }
                let collect = self.garbage_collect();
                let result = match collect {
                    Ok(()) => op(self),
                    Err(error) => Err(error),
                };
                if fuzzing {
                    self.heap.toggle_fuzzing(true);
                }
                result.map_err(|condition| {
                    if condition.cause() == Cause::HeapExhausted {
                        Condition::out_of_memory()
                    } else {
                        condition
                    }
                })
            }
            other => other,
        }
    }

    // --- V a l i d a t i o n ---

    // Walks the whole to-space checking headers and per-family
    // invariants.
    pub fn validate(&self) -> Result<()> {
        let mut scan = self.heap.to_space().start();
        while scan < self.heap.to_space().next_free() {
            let object = Value::new_heap_object(scan);
            let header = object::get_header(&self.heap, object);
            if !header.is_heap_object() {
                return Err(Condition::validation_failed());
            }
            if object::get_family(&self.heap, header) != Family::Species {
                return Err(Condition::validation_failed());
            }
            (object::get_behavior(&self.heap, object).validate)(&self.heap, object)?;
            scan += behavior::object_layout(&self.heap, object).size;
        }
        Ok(())
    }

    // --- S h u t d o w n ---

    // Releases the registry reference and runs remaining finalizers.
    // The runtime must not be used afterwards.
    pub fn dispose(&mut self) -> Result<()> {
        self.validate()?;
        if let Some(safe) = self.module_registry.take() {
            self.heap.dispose_safe_value(safe);
        }
        for handle in self.heap.tracker_handles() {
            let tracker = self.heap.tracker(handle);
            if tracker.flags.contains(TrackerFlag::Finalize) && !tracker.is_garbage {
                let value = tracker.value;
                self.finalize_dead_object(value);
            }
            self.heap.dispose_tracker(handle);
        }
        Ok(())
    }
}


struct GcState {
    pending_fixups: Vec<(Value, Value)>,
}

// Copies the object raw into to-space, leaves a forwarding pointer in
// the old header, and schedules a fixup if the family wants one. An
// already-moved object just resolves through its forwarding pointer.
fn ensure_heap_object_migrated(heap: &mut Heap, gc: &mut GcState, old_object: Value) -> Value {
    let old_header = heap.value_at(old_object.as_heap_object());
    if old_header.is_moved_object() {
        return old_header.moved_object_target();
    }
    debug_assert!(old_header.is_heap_object(), "migrating corrupt object");
    debug_assert!(heap.in_from_space(old_object.as_heap_object()));
    // The old object is about to be clobbered; this is the last point
    // it can answer questions about itself.
    let layout = behavior::object_layout(heap, old_object);
    let needs_fixup = object::get_behavior(heap, old_object).post_migrate_fixup.is_some();
    let target = heap.migration_alloc(layout.size);
    heap.copy_words(old_object.as_heap_object(), target, layout.size);
    let new_object = Value::new_heap_object(target);
    if needs_fixup {
        gc.pending_fixups.push((new_object, old_object));
    }
    heap.set_value_at(
        old_object.as_heap_object(),
        Value::new_moved_object(new_object),
    );
    new_object
}

// A derived pointer migrates by migrating its host and recomputing
// the address from the anchor offset, which is invariant.
fn migrate_derived_object(heap: &mut Heap, gc: &mut GcState, old_derived: Value) -> Value {
    let old_host = crate::stack::get_derived_object_host(heap, old_derived);
    let delta = old_derived.as_derived_object() - old_host.as_heap_object();
    let new_host = ensure_heap_object_migrated(heap, gc, old_host);
    Value::new_derived_object(new_host.as_heap_object() + delta)
}

fn migrate_value(heap: &mut Heap, gc: &mut GcState, value: Value) -> Value {
    match value.domain() {
        value::Domain::HeapObject => {
            if heap.in_from_space(value.as_heap_object()) {
                ensure_heap_object_migrated(heap, gc, value)
            } else {
                value
            }
        }
        value::Domain::DerivedObject => {
            if heap.in_from_space(value.as_derived_object()) {
                migrate_derived_object(heap, gc, value)
            } else {
                value
            }
        }
        _ => value,
    }
}


// --- B e h a v i o r   s t a t i c s ---

pub static ROOTS_BEHAVIOR: Behavior = Behavior::base(
    |_, _| behavior::ObjectLayout { size: ROOTS_SIZE, value_offset: 1 },
    generic_validate,
)
.modal();

pub static MUTABLE_ROOTS_BEHAVIOR: Behavior = Behavior::base(
    |_, _| behavior::ObjectLayout { size: MUTABLE_ROOTS_SIZE, value_offset: 1 },
    generic_validate,
);


#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::TrackerFlag;
    use crate::object::{
        get_array_at, get_array_length, new_heap_array, new_heap_utf8, set_array_at,
    };
    use crate::stack::{self, Frame};

    #[test]
    fn test_runtime_initializes_and_validates() {
        let runtime = Runtime::with_default_config().unwrap();
        runtime.validate().unwrap();
        // The roots are deep frozen after initialization.
        assert!(freeze::peek_deep_frozen(&runtime.heap, runtime.roots_object()));
    }

    #[test]
    fn test_species_table_is_complete() {
        let runtime = Runtime::with_default_config().unwrap();
        for &family in ALL_FAMILIES.iter() {
            match behavior::family_behavior(family).division {
                Division::Modal => {
                    for &mode in
                        [Mode::Fluid, Mode::Mutable, Mode::Frozen, Mode::DeepFrozen].iter()
                    {
                        let species = runtime.species_for(family, mode);
                        assert!(species.is_heap_object(), "{} missing species", family.name());
                        assert_eq!(object::get_species_family(&runtime.heap, species), family);
                        assert_eq!(object::get_species_mode(&runtime.heap, species), mode);
                    }
                }
                Division::Compact => {
                    let species = runtime.species_for(family, Mode::Mutable);
                    assert!(species.is_heap_object());
                    assert_eq!(object::get_species_family(&runtime.heap, species), family);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_species_graph_is_self_describing() {
        let runtime = Runtime::with_default_config().unwrap();
        let meta = runtime.species_for(Family::Species, Mode::DeepFrozen);
        // After the freeze the metas head themselves through the deep
        // frozen meta.
        let header = object::get_header(&runtime.heap, meta);
        assert_eq!(object::get_species_family(&runtime.heap, header), Family::Species);
    }

    #[test]
    fn test_gc_preserves_tracked_values() {
        let mut runtime = Runtime::with_default_config().unwrap();
        let array = new_heap_array(&mut runtime, 3).unwrap();
        set_array_at(&mut runtime.heap, array, 0, Value::new_integer(42));
        let string = new_heap_utf8(&mut runtime, "persistent").unwrap();
        set_array_at(&mut runtime.heap, array, 1, string);
        let safe = runtime.protect_value(array);
        let before = runtime.heap.deref(safe);

        runtime.garbage_collect().unwrap();

        let after = runtime.heap.deref(safe);
        // The object moved but its contents survived.
        assert!(!after.is_same(before));
        assert_eq!(get_array_length(&runtime.heap, after), 3);
        assert_eq!(get_array_at(&runtime.heap, after, 0).as_integer(), 42);
        let migrated_string = get_array_at(&runtime.heap, after, 1);
        assert_eq!(object::get_utf8_contents(&runtime.heap, migrated_string), "persistent");
        runtime.dispose_safe_value(safe);
    }

    #[test]
    fn test_gc_collects_unreachable_objects() {
        let mut runtime = Runtime::with_default_config().unwrap();
        let used_before = runtime.heap.to_space().next_free() - runtime.heap.to_space().start();
        for _ in 0..100 {
            new_heap_array(&mut runtime, 50).unwrap();
        }
        runtime.garbage_collect().unwrap();
        let used_after = runtime.heap.to_space().next_free() - runtime.heap.to_space().start();
        // Everything unreachable went away; the live prefix stays
        // about the size it was.
        assert!(used_after <= used_before + 64);
    }

    #[test]
    fn test_weak_trackers_clear_on_death() {
        let mut runtime = Runtime::with_default_config().unwrap();
        let doomed = new_heap_array(&mut runtime, 1).unwrap();
        let weak = runtime
            .heap
            .protect_with_flags(doomed, TrackerFlag::Weak.into(), None);
        runtime.garbage_collect().unwrap();
        assert!(is_nothing(runtime.heap.deref(weak)));
        runtime.dispose_safe_value(weak);

        // A weakly-tracked object that is also strongly reachable
        // survives and the weak reference follows it.
        let kept = new_heap_array(&mut runtime, 1).unwrap();
        let strong = runtime.protect_value(kept);
        let weak = runtime
            .heap
            .protect_with_flags(kept, TrackerFlag::Weak.into(), None);
        runtime.garbage_collect().unwrap();
        let via_strong = runtime.heap.deref(strong);
        let via_weak = runtime.heap.deref(weak);
        assert!(via_weak.is_same(via_strong));
        runtime.dispose_safe_value(strong);
        runtime.dispose_safe_value(weak);
    }

    #[test]
    fn test_maybe_weak_resolves_per_collection() {
        fn always_weak(_heap: &crate::heap::Heap, _value: Value) -> bool {
            true
        }
        let mut runtime = Runtime::with_default_config().unwrap();
        let doomed = new_heap_array(&mut runtime, 1).unwrap();
        let maybe = runtime.heap.protect_with_flags(
            doomed,
            TrackerFlag::MaybeWeak.into(),
            Some(always_weak),
        );
        // Starts out strong; the predicate decides at collection time.
        assert!(!runtime.heap.deref(maybe).is_same(value::nothing()));
        runtime.garbage_collect().unwrap();
        assert!(is_nothing(runtime.heap.deref(maybe)));
        runtime.dispose_safe_value(maybe);
    }

    #[test]
    fn test_gc_relocates_derived_pointers() {
        let mut runtime = Runtime::with_default_config().unwrap();
        let stack = stack::new_heap_stack(&mut runtime, 64).unwrap();
        let code = {
            let blob = object::new_heap_blob(&mut runtime, 0).unwrap();
            let empty = runtime.roots().empty_array;
            object::new_heap_code_block(&mut runtime, blob, empty, 16).unwrap()
        };
        let empty_map = runtime.roots().empty_array;
        let mut frame = Frame::open(&runtime.heap, stack);
        stack::push_stack_frame(&mut runtime, &mut frame, code, 0, empty_map).unwrap();
        let frame_pointer = frame.frame_pointer;
        let barrier = stack::push_barrier(
            &mut runtime.heap,
            &mut frame,
            value::Genus::EnsureSection,
            Value::new_integer(7),
            &[Value::new_integer(frame_pointer as i64), nothing()],
        );
        frame.close(&mut runtime.heap);
        let host_before = stack::get_derived_object_host(&runtime.heap, barrier);
        let delta_before = barrier.as_derived_object() - host_before.as_heap_object();
        let safe = runtime.protect_value(stack);

        runtime.garbage_collect().unwrap();

        let stack_after = runtime.heap.deref(safe);
        let barrier_after = stack::get_stack_top_barrier(&runtime.heap, stack_after);
        assert!(barrier_after.is_derived_object());
        let host_after = stack::get_derived_object_host(&runtime.heap, barrier_after);
        // The host was recovered through the anchor and the offset is
        // invariant.
        let delta_after = barrier_after.as_derived_object() - host_after.as_heap_object();
        assert_eq!(delta_before, delta_after);
        assert!(host_after.is_same(stack::get_stack_top_piece(&runtime.heap, stack_after)));
        assert_eq!(
            stack::get_barrier_payload(&runtime.heap, barrier_after).as_integer(),
            7
        );
        runtime.dispose_safe_value(safe);
    }

    #[test]
    fn test_gc_survives_repeated_fuzz_pressure() {
        let config = RuntimeConfig {
            semispace_size_bytes: 1024 * 1024,
            gc_fuzz_freq: 16,
            gc_fuzz_seed: 99,
            ..RuntimeConfig::default()
        };
        let mut runtime = Runtime::new(&config).unwrap();
        let keep = new_heap_array(&mut runtime, 10).unwrap();
        let safe = runtime.protect_value(keep);
        for _ in 0..1000 {
            runtime
                .retry_after_gc(|runtime| new_heap_array(runtime, 10))
                .unwrap();
        }
        let kept = runtime.heap.deref(safe);
        assert_eq!(get_array_length(&runtime.heap, kept), 10);
        for i in 0..10 {
            assert!(value::is_null(get_array_at(&runtime.heap, kept, i)));
        }
        runtime.dispose_safe_value(safe);
    }

    #[test]
    fn test_exhaustion_becomes_out_of_memory() {
        let config = RuntimeConfig {
            semispace_size_bytes: 64 * 1024,
            ..RuntimeConfig::default()
        };
        let mut runtime = Runtime::new(&config).unwrap();
        // A request bigger than the whole semispace can never be met,
        // even after collecting.
        let err = runtime
            .retry_after_gc(|runtime| new_heap_array(runtime, 1 << 20))
            .unwrap_err();
        assert_eq!(err.cause(), Cause::OutOfMemory);
    }

    #[test]
    fn test_primary_types() {
        let mut runtime = Runtime::with_default_config().unwrap();
        let int_type = runtime.get_primary_type(Value::new_integer(3)).unwrap();
        assert!(int_type.is_same(runtime.root(NamedRoot::IntegerType)));
        let string = new_heap_utf8(&mut runtime, "s").unwrap();
        let string_type = runtime.get_primary_type(string).unwrap();
        assert!(string_type.is_same(runtime.root(NamedRoot::StringType)));
        let bool_type = runtime.get_primary_type(value::yes()).unwrap();
        assert!(bool_type.is_same(runtime.root(NamedRoot::BooleanType)));
    }

    #[test]
    fn test_config_defaults_and_clamp() {
        let config = RuntimeConfig::default();
        assert_eq!(config.semispace_size_bytes, 1024 * 1024);
        assert_eq!(config.gc_fuzz_freq, 0);
        let too_small_limit = RuntimeConfig {
            semispace_size_bytes: 1024 * 1024,
            system_memory_limit: 1024,
            ..RuntimeConfig::default()
        };
        let err = Runtime::new(&too_small_limit).unwrap_err();
        assert_eq!(err.cause(), Cause::SystemError);
    }

    #[test]
    fn test_dispose_releases_trackers() {
        let mut runtime = Runtime::with_default_config().unwrap();
        let array = new_heap_array(&mut runtime, 1).unwrap();
        let _safe = runtime.protect_value(array);
        runtime.dispose().unwrap();
        assert_eq!(runtime.heap.tracker_count(), 0);
    }

    #[test]
    fn test_key_ids_stay_unique() {
        let mut runtime = Runtime::with_default_config().unwrap();
        let name = new_heap_utf8(&mut runtime, "k").unwrap();
        let a = object::new_heap_key(&mut runtime, name).unwrap();
        let b = object::new_heap_key(&mut runtime, name).unwrap();
        assert_ne!(
            object::get_key_id(&runtime.heap, a),
            object::get_key_id(&runtime.heap, b)
        );
    }
}
