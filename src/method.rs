// Multi-method dispatch.
//
// An invocation carries a call tags record mapping tag to argument
// stack offset. Lookup matches the call against every candidate
// signature in the relevant signature maps, scores each argument, and
// keeps the running argument-wise maximum; the unique candidate whose
// scores equal the max on every argument wins. No unique winner means
// Ambiguity, no candidate at all means NoMatch.
//
// The lookup machinery is used in a few different ways, with
// different inputs and outputs, but the algorithm is always the same:
// inputs abstract where argument values come from (a stack frame, a
// frame with next-guards, a call data object), outputs abstract how
// matches are aggregated (unique best, first best with its handler),
// and thunks abstract which signature maps get visited (the
// methodspace chain, one methodspace, the signal handler barriers).

use enumflags2::BitFlags;

use crate::behavior::{self, Behavior};
use crate::freeze;
use crate::heap::Heap;
use crate::object::{self, generic_validate};
use crate::runtime::Runtime;
use crate::stack::{barrier_previous, get_barrier_genus, get_barrier_payload, Frame};
use crate::value::{
    self, Condition, Genus, LookupError, Result, Value, is_nothing, nothing, null,
};


// The most arguments a single lookup can carry. Calls beyond this are
// refused with a clear condition rather than silently truncated.
pub const MAX_LOOKUP_ARGUMENT_COUNT: usize = 8;

// Marks a parameter that received no argument in the offsets vector.
pub const NO_OFFSET: u64 = u64::max_value();


// --- G u a r d ---

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GuardType {
    // The argument must be identical to a fixed value.
    Eq = 0,
    // The argument's primary type must descend from a fixed type.
    Is = 1,
    // Anything goes.
    Any = 2,
}

impl GuardType {
    pub fn from_i64(raw: i64) -> GuardType {
        match raw {
            0 => GuardType::Eq,
            1 => GuardType::Is,
            2 => GuardType::Any,
            _ => panic!("invalid guard type {}", raw),
        }
    }
}

pub const GUARD_TYPE_OFFSET: u64 = 1;
pub const GUARD_VALUE_OFFSET: u64 = 2;
pub const GUARD_SIZE: u64 = 3;

pub fn get_guard_type(heap: &Heap, guard: Value) -> GuardType {
    GuardType::from_i64(
        heap.value_at(guard.as_heap_object() + GUARD_TYPE_OFFSET).as_integer(),
    )
}

pub fn get_guard_value(heap: &Heap, guard: Value) -> Value {
    heap.value_at(guard.as_heap_object() + GUARD_VALUE_OFFSET)
}

pub fn new_heap_guard(
    runtime: &mut Runtime,
    guard_type: GuardType,
    value: Value,
) -> Result<Value> {
    let species = runtime.species_for(behavior::Family::Guard, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(GUARD_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        result.as_heap_object() + GUARD_TYPE_OFFSET,
        Value::new_integer(guard_type as i64),
    );
    heap.set_value_at(result.as_heap_object() + GUARD_VALUE_OFFSET, value);
    Ok(result)
}

fn best_score(a: Value, b: Value) -> Value {
    if value::is_score_better(a, b) { a } else { b }
}

// Climbs the inheritance map looking for the target type, worsening
// the score one step per hop. All parents are searched so the best
// path wins.
fn find_best_match(
    runtime: &Runtime,
    current: Value,
    target: Value,
    current_score: Value,
    space: Value,
) -> Result<Value> {
    if behavior::value_identity_compare(&runtime.heap, current, target)? {
        return Ok(current_score);
    }
    let parents = get_type_parents(runtime, space, current);
    let length = object::get_array_buffer_length(&runtime.heap, parents);
    let mut score = value::new_no_match_score();
    for i in 0..length {
        let parent = object::get_array_buffer_at(&runtime.heap, parents, i);
        let next = find_best_match(
            runtime,
            parent,
            target,
            value::get_score_successor(current_score),
            space,
        )?;
        score = best_score(score, next);
    }
    Ok(score)
}

pub fn guard_match(
    runtime: &Runtime,
    guard: Value,
    value: Value,
    space: Value,
) -> Result<Value> {
    match get_guard_type(&runtime.heap, guard) {
        GuardType::Eq => {
            let guard_value = get_guard_value(&runtime.heap, guard);
            let matched = behavior::value_identity_compare(&runtime.heap, guard_value, value)?;
            Ok(if matched {
                value::new_identical_match_score()
            } else {
                value::new_no_match_score()
            })
        }
        GuardType::Is => {
            let primary = runtime.get_primary_type(value)?;
            let target = get_guard_value(&runtime.heap, guard);
            find_best_match(runtime, primary, target, value::new_perfect_is_match_score(), space)
        }
        GuardType::Any => Ok(value::new_any_match_score()),
    }
}


// --- P a r a m e t e r ---

pub const PARAMETER_GUARD_OFFSET: u64 = 1;
pub const PARAMETER_TAGS_OFFSET: u64 = 2;
pub const PARAMETER_IS_OPTIONAL_OFFSET: u64 = 3;
pub const PARAMETER_INDEX_OFFSET: u64 = 4;
pub const PARAMETER_SIZE: u64 = 5;

pub fn get_parameter_guard(heap: &Heap, parameter: Value) -> Value {
    heap.value_at(parameter.as_heap_object() + PARAMETER_GUARD_OFFSET)
}

pub fn get_parameter_tags(heap: &Heap, parameter: Value) -> Value {
    heap.value_at(parameter.as_heap_object() + PARAMETER_TAGS_OFFSET)
}

pub fn get_parameter_is_optional(heap: &Heap, parameter: Value) -> bool {
    heap.value_at(parameter.as_heap_object() + PARAMETER_IS_OPTIONAL_OFFSET)
        .as_integer()
        != 0
}

pub fn get_parameter_index(heap: &Heap, parameter: Value) -> u64 {
    heap.value_at(parameter.as_heap_object() + PARAMETER_INDEX_OFFSET)
        .as_integer() as u64
}

pub fn new_heap_parameter(
    runtime: &mut Runtime,
    guard: Value,
    tags: Value,
    is_optional: bool,
    index: u64,
) -> Result<Value> {
    let species = runtime.species_for(behavior::Family::Parameter, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(PARAMETER_SIZE, species)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + PARAMETER_GUARD_OFFSET, guard);
    heap.set_value_at(addr + PARAMETER_TAGS_OFFSET, tags);
    heap.set_value_at(addr + PARAMETER_IS_OPTIONAL_OFFSET, Value::new_integer(is_optional as i64));
    heap.set_value_at(addr + PARAMETER_INDEX_OFFSET, Value::new_integer(index as i64));
    Ok(result)
}


// --- S i g n a t u r e ---

pub const SIGNATURE_TAGS_OFFSET: u64 = 1;
pub const SIGNATURE_PARAMETER_COUNT_OFFSET: u64 = 2;
pub const SIGNATURE_MANDATORY_COUNT_OFFSET: u64 = 3;
pub const SIGNATURE_ALLOW_EXTRA_OFFSET: u64 = 4;
pub const SIGNATURE_SIZE: u64 = 5;

pub fn get_signature_tags(heap: &Heap, signature: Value) -> Value {
    heap.value_at(signature.as_heap_object() + SIGNATURE_TAGS_OFFSET)
}

pub fn get_signature_parameter_count(heap: &Heap, signature: Value) -> u64 {
    heap.value_at(signature.as_heap_object() + SIGNATURE_PARAMETER_COUNT_OFFSET)
        .as_integer() as u64
}

pub fn get_signature_mandatory_count(heap: &Heap, signature: Value) -> u64 {
    heap.value_at(signature.as_heap_object() + SIGNATURE_MANDATORY_COUNT_OFFSET)
        .as_integer() as u64
}

pub fn get_signature_allow_extra(heap: &Heap, signature: Value) -> bool {
    heap.value_at(signature.as_heap_object() + SIGNATURE_ALLOW_EXTRA_OFFSET)
        .as_integer()
        != 0
}

pub fn get_signature_parameter_at(heap: &Heap, signature: Value, index: u64) -> Value {
    object::get_pair_array_second_at(heap, get_signature_tags(heap, signature), index)
}

pub fn get_signature_tag_at(heap: &Heap, signature: Value, index: u64) -> Value {
    object::get_pair_array_first_at(heap, get_signature_tags(heap, signature), index)
}

// Builds a signature from (tag, guard, optional) triples given in
// declaration order. Parameter indexes follow declaration order; the
// tag array is co-sorted for binary search.
pub fn new_heap_signature(
    runtime: &mut Runtime,
    params: &[(Value, Value, bool)],
    allow_extra: bool,
) -> Result<Value> {
    let tags = object::new_heap_pair_array(runtime, params.len() as u64)?;
    let mut mandatory = 0;
    for (i, &(tag, guard, is_optional)) in params.iter().enumerate() {
        let param_tags = object::new_heap_array_with_contents(runtime, &[tag])?;
        let parameter =
            new_heap_parameter(runtime, guard, param_tags, is_optional, i as u64)?;
        object::set_pair_array_first_at(&mut runtime.heap, tags, i as u64, tag);
        object::set_pair_array_second_at(&mut runtime.heap, tags, i as u64, parameter);
        if !is_optional {
            mandatory += 1;
        }
    }
    object::co_sort_pair_array(&mut runtime.heap, tags);
    let species = runtime.species_for(behavior::Family::Signature, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(SIGNATURE_SIZE, species)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + SIGNATURE_TAGS_OFFSET, tags);
    heap.set_value_at(
        addr + SIGNATURE_PARAMETER_COUNT_OFFSET,
        Value::new_integer(params.len() as i64),
    );
    heap.set_value_at(addr + SIGNATURE_MANDATORY_COUNT_OFFSET, Value::new_integer(mandatory));
    heap.set_value_at(addr + SIGNATURE_ALLOW_EXTRA_OFFSET, Value::new_integer(allow_extra as i64));
    Ok(result)
}


// --- M e t h o d ---

#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum MethodFlag {
    // Resolving this method reroutes lookup to the subject lambda's
    // private methodspace.
    LambdaDelegate = 0b01,
    // Ditto for the subject block's captured methodspace.
    BlockDelegate = 0b10,
}

pub const METHOD_SIGNATURE_OFFSET: u64 = 1;
pub const METHOD_CODE_PTR_OFFSET: u64 = 2;
pub const METHOD_SYNTAX_OFFSET: u64 = 3;
pub const METHOD_MODULE_FRAGMENT_OFFSET: u64 = 4;
pub const METHOD_FLAGS_OFFSET: u64 = 5;
pub const METHOD_SIZE: u64 = 6;

pub fn get_method_signature(heap: &Heap, method: Value) -> Value {
    heap.value_at(method.as_heap_object() + METHOD_SIGNATURE_OFFSET)
}

// The code pointer lives behind a freeze cheat so method bodies can
// be installed lazily without unfreezing the method.
pub fn get_method_code_ptr(heap: &Heap, method: Value) -> Value {
    heap.value_at(method.as_heap_object() + METHOD_CODE_PTR_OFFSET)
}

pub fn get_method_code(heap: &Heap, method: Value) -> Value {
    object::get_freeze_cheat_value(heap, get_method_code_ptr(heap, method))
}

pub fn set_method_code(heap: &mut Heap, method: Value, code: Value) {
    let cheat = get_method_code_ptr(heap, method);
    object::set_freeze_cheat_value(heap, cheat, code);
}

pub fn get_method_syntax(heap: &Heap, method: Value) -> Value {
    heap.value_at(method.as_heap_object() + METHOD_SYNTAX_OFFSET)
}

pub fn get_method_module_fragment(heap: &Heap, method: Value) -> Value {
    heap.value_at(method.as_heap_object() + METHOD_MODULE_FRAGMENT_OFFSET)
}

pub fn get_method_flags(heap: &Heap, method: Value) -> BitFlags<MethodFlag> {
    value::get_flag_set(heap.value_at(method.as_heap_object() + METHOD_FLAGS_OFFSET))
}

pub fn new_heap_method(
    runtime: &mut Runtime,
    signature: Value,
    syntax: Value,
    code: Value,
    fragment: Value,
    flags: BitFlags<MethodFlag>,
) -> Result<Value> {
    let code_ptr = object::new_heap_freeze_cheat(runtime, code)?;
    let species = runtime.species_for(behavior::Family::Method, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(METHOD_SIZE, species)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + METHOD_SIGNATURE_OFFSET, signature);
    heap.set_value_at(addr + METHOD_CODE_PTR_OFFSET, code_ptr);
    heap.set_value_at(addr + METHOD_SYNTAX_OFFSET, syntax);
    heap.set_value_at(addr + METHOD_MODULE_FRAGMENT_OFFSET, fragment);
    heap.set_value_at(addr + METHOD_FLAGS_OFFSET, value::new_flag_set(flags));
    Ok(result)
}


// --- S i g n a t u r e   m a p ---

pub const SIGNATURE_MAP_ENTRIES_OFFSET: u64 = 1;
pub const SIGNATURE_MAP_SIZE: u64 = 2;

pub fn get_signature_map_entries(heap: &Heap, map: Value) -> Value {
    heap.value_at(map.as_heap_object() + SIGNATURE_MAP_ENTRIES_OFFSET)
}

pub fn new_heap_signature_map(runtime: &mut Runtime) -> Result<Value> {
    let entries = object::new_heap_array_buffer(runtime, 8)?;
    let species = runtime.species_for(behavior::Family::SignatureMap, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(SIGNATURE_MAP_SIZE, species)?;
    runtime
        .heap
        .set_value_at(result.as_heap_object() + SIGNATURE_MAP_ENTRIES_OFFSET, entries);
    Ok(result)
}

pub fn add_to_signature_map(
    runtime: &mut Runtime,
    map: Value,
    signature: Value,
    value: Value,
) -> Result<()> {
    let entries = get_signature_map_entries(&runtime.heap, map);
    object::add_to_pair_array_buffer(runtime, entries, signature, value)
}


// --- M e t h o d s p a c e ---

pub const METHODSPACE_INHERITANCE_OFFSET: u64 = 1;
pub const METHODSPACE_METHODS_OFFSET: u64 = 2;
pub const METHODSPACE_PARENT_OFFSET: u64 = 3;
pub const METHODSPACE_CACHE_PTR_OFFSET: u64 = 4;
pub const METHODSPACE_SIZE: u64 = 5;

pub fn get_methodspace_inheritance(heap: &Heap, space: Value) -> Value {
    heap.value_at(space.as_heap_object() + METHODSPACE_INHERITANCE_OFFSET)
}

pub fn get_methodspace_methods(heap: &Heap, space: Value) -> Value {
    heap.value_at(space.as_heap_object() + METHODSPACE_METHODS_OFFSET)
}

pub fn get_methodspace_parent(heap: &Heap, space: Value) -> Value {
    heap.value_at(space.as_heap_object() + METHODSPACE_PARENT_OFFSET)
}

pub fn get_methodspace_cache_ptr(heap: &Heap, space: Value) -> Value {
    heap.value_at(space.as_heap_object() + METHODSPACE_CACHE_PTR_OFFSET)
}

pub fn new_heap_methodspace(runtime: &mut Runtime, parent: Value) -> Result<Value> {
    let inheritance = object::new_heap_id_hash_map(runtime, 16)?;
    let methods = new_heap_signature_map(runtime)?;
    let cache_ptr = object::new_heap_freeze_cheat(runtime, nothing())?;
    let species = runtime.species_for(behavior::Family::Methodspace, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(METHODSPACE_SIZE, species)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + METHODSPACE_INHERITANCE_OFFSET, inheritance);
    heap.set_value_at(addr + METHODSPACE_METHODS_OFFSET, methods);
    heap.set_value_at(addr + METHODSPACE_PARENT_OFFSET, parent);
    heap.set_value_at(addr + METHODSPACE_CACHE_PTR_OFFSET, cache_ptr);
    Ok(result)
}

pub fn add_methodspace_method(runtime: &mut Runtime, space: Value, method: Value) -> Result<()> {
    debug_assert!(freeze::is_mutable(&runtime.heap, space));
    invalidate_methodspace_caches(&mut runtime.heap, space);
    let signature = get_method_signature(&runtime.heap, method);
    let methods = get_methodspace_methods(&runtime.heap, space);
    add_to_signature_map(runtime, methods, signature, method)
}

pub fn add_methodspace_inheritance(
    runtime: &mut Runtime,
    space: Value,
    subtype: Value,
    supertype: Value,
) -> Result<()> {
    debug_assert!(freeze::is_mutable(&runtime.heap, space));
    let inheritance = get_methodspace_inheritance(&runtime.heap, space);
    let parents = match object::get_id_hash_map_at(&runtime.heap, inheritance, subtype) {
        Ok(parents) => parents,
        Err(_) => {
            // Most types have few direct parents.
            let parents = object::new_heap_array_buffer(runtime, 4)?;
            object::set_id_hash_map_at(runtime, inheritance, subtype, parents)?;
            parents
        }
    };
    invalidate_methodspace_caches(&mut runtime.heap, space);
    object::add_to_array_buffer(runtime, parents, supertype)
}

pub fn get_type_parents(runtime: &Runtime, space: Value, type_value: Value) -> Value {
    let inheritance = get_methodspace_inheritance(&runtime.heap, space);
    match object::get_id_hash_map_at(&runtime.heap, inheritance, type_value) {
        Ok(parents) => parents,
        Err(_) => runtime.roots().empty_array_buffer,
    }
}

// Any method addition or parent change blows the whole selector
// cache.
pub fn invalidate_methodspace_caches(heap: &mut Heap, space: Value) {
    let cache_ptr = get_methodspace_cache_ptr(heap, space);
    object::set_freeze_cheat_value(heap, cache_ptr, nothing());
}

// True if the signature could match some invocation that binds the
// given tag to the given value.
fn can_match_eq(heap: &Heap, signature: Value, tag: Value, value: Value) -> Result<bool> {
    let paramc = get_signature_parameter_count(heap, signature);
    let mut matched = nothing();
    for i in 0..paramc {
        let param = get_signature_parameter_at(heap, signature, i);
        let tags = get_parameter_tags(heap, param);
        if object::in_array(heap, tags, tag) {
            matched = param;
            break;
        }
    }
    if is_nothing(matched) {
        return Ok(get_signature_allow_extra(heap, signature));
    }
    let guard = get_parameter_guard(heap, matched);
    if get_guard_type(heap, guard) == GuardType::Eq {
        behavior::value_identity_compare(heap, get_guard_value(heap, guard), value)
    } else {
        Ok(true)
    }
}

// Walks the methodspace chain collecting every entry whose signature
// admits the selector, producing the sigmap slice the cache holds.
fn create_methodspace_selector_slice(
    runtime: &mut Runtime,
    space: Value,
    selector: Value,
) -> Result<Value> {
    let result = new_heap_signature_map(runtime)?;
    let selector_key = runtime.roots().selector_key;
    let mut current = space;
    while !is_nothing(current) {
        let methods = get_methodspace_methods(&runtime.heap, current);
        let entries = get_signature_map_entries(&runtime.heap, methods);
        let count = object::get_pair_array_buffer_length(&runtime.heap, entries);
        for i in 0..count {
            let signature = object::get_pair_array_buffer_first_at(&runtime.heap, entries, i);
            if can_match_eq(&runtime.heap, signature, selector_key, selector)? {
                let method = object::get_pair_array_buffer_second_at(&runtime.heap, entries, i);
                add_to_signature_map(runtime, result, signature, method)?;
            }
        }
        current = get_methodspace_parent(&runtime.heap, current);
    }
    Ok(result)
}

// The selector cache sits behind a freeze cheat so it can grow
// through deep frozen methodspaces.
pub fn get_or_create_methodspace_selector_slice(
    runtime: &mut Runtime,
    space: Value,
    selector: Value,
) -> Result<Value> {
    let cache_ptr = get_methodspace_cache_ptr(&runtime.heap, space);
    let mut cache = object::get_freeze_cheat_value(&runtime.heap, cache_ptr);
    if is_nothing(cache) {
        cache = object::new_heap_id_hash_map(runtime, 128)?;
        object::set_freeze_cheat_value(&mut runtime.heap, cache_ptr, cache);
    }
    match object::get_id_hash_map_at(&runtime.heap, cache, selector) {
        Ok(slice) => Ok(slice),
        Err(_) => {
            let slice = create_methodspace_selector_slice(runtime, space, selector)?;
            // The cache map is reached through the cheat, not owned by
            // a frozen object, so it can extend freely.
            let map_is_mutable = freeze::is_mutable(&runtime.heap, cache);
            debug_assert!(map_is_mutable);
            object::set_id_hash_map_at(runtime, cache, selector, slice)?;
            Ok(slice)
        }
    }
}


// --- C a l l   t a g s ---

pub const CALL_TAGS_ENTRIES_OFFSET: u64 = 1;
pub const CALL_TAGS_SUBJECT_OFFSET_OFFSET: u64 = 2;
pub const CALL_TAGS_SELECTOR_OFFSET_OFFSET: u64 = 3;
pub const CALL_TAGS_SIZE: u64 = 4;

pub fn get_call_tags_entries(heap: &Heap, tags: Value) -> Value {
    heap.value_at(tags.as_heap_object() + CALL_TAGS_ENTRIES_OFFSET)
}

pub fn get_call_tags_entry_count(heap: &Heap, tags: Value) -> u64 {
    object::get_pair_array_length(heap, get_call_tags_entries(heap, tags))
}

pub fn get_call_tags_tag_at(heap: &Heap, tags: Value, index: u64) -> Value {
    object::get_pair_array_first_at(heap, get_call_tags_entries(heap, tags), index)
}

pub fn get_call_tags_offset_at(heap: &Heap, tags: Value, index: u64) -> u64 {
    object::get_pair_array_second_at(heap, get_call_tags_entries(heap, tags), index)
        .as_integer() as u64
}

// The stack offset of the subject argument, or nothing.
pub fn get_call_tags_subject_offset(heap: &Heap, tags: Value) -> Value {
    heap.value_at(tags.as_heap_object() + CALL_TAGS_SUBJECT_OFFSET_OFFSET)
}

pub fn get_call_tags_selector_offset(heap: &Heap, tags: Value) -> Value {
    heap.value_at(tags.as_heap_object() + CALL_TAGS_SELECTOR_OFFSET_OFFSET)
}

// Builds the canonical entries for an invocation whose tags are given
// in evaluation order. The argument evaluated last sits on top of the
// stack, so offsets count down from the end; the entries are then
// sorted by tag so the subject and selector keys land first.
pub fn build_call_tags_entries(runtime: &mut Runtime, tags: Value) -> Result<Value> {
    let tag_count = object::get_array_length(&runtime.heap, tags);
    let result = object::new_heap_pair_array(runtime, tag_count)?;
    for i in 0..tag_count {
        let tag = object::get_array_at(&runtime.heap, tags, i);
        object::set_pair_array_first_at(&mut runtime.heap, result, i, tag);
        let offset = tag_count - i - 1;
        object::set_pair_array_second_at(
            &mut runtime.heap,
            result,
            i,
            Value::new_integer(offset as i64),
        );
    }
    object::co_sort_pair_array(&mut runtime.heap, result);
    Ok(result)
}

pub fn new_heap_call_tags(runtime: &mut Runtime, entries: Value) -> Result<Value> {
    let species = runtime.species_for(behavior::Family::CallTags, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(CALL_TAGS_SIZE, species)?;
    let subject_key = runtime.roots().subject_key;
    let selector_key = runtime.roots().selector_key;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + CALL_TAGS_ENTRIES_OFFSET, entries);
    let mut subject_offset = nothing();
    let mut selector_offset = nothing();
    let count = object::get_pair_array_length(heap, entries);
    for i in 0..count {
        let tag = object::get_pair_array_first_at(heap, entries, i);
        if tag.is_same(subject_key) {
            subject_offset = object::get_pair_array_second_at(heap, entries, i);
        } else if tag.is_same(selector_key) {
            selector_offset = object::get_pair_array_second_at(heap, entries, i);
        }
    }
    heap.set_value_at(result.as_heap_object() + CALL_TAGS_SUBJECT_OFFSET_OFFSET, subject_offset);
    heap.set_value_at(result.as_heap_object() + CALL_TAGS_SELECTOR_OFFSET_OFFSET, selector_offset);
    Ok(result)
}

pub fn new_heap_call_tags_from_evaluation_order(
    runtime: &mut Runtime,
    tags: Value,
) -> Result<Value> {
    let entries = build_call_tags_entries(runtime, tags)?;
    new_heap_call_tags(runtime, entries)
}


// --- C a l l   d a t a ---

pub const CALL_DATA_TAGS_OFFSET: u64 = 1;
pub const CALL_DATA_VALUES_OFFSET: u64 = 2;
pub const CALL_DATA_SIZE: u64 = 3;

pub fn get_call_data_tags(heap: &Heap, call_data: Value) -> Value {
    heap.value_at(call_data.as_heap_object() + CALL_DATA_TAGS_OFFSET)
}

pub fn get_call_data_values(heap: &Heap, call_data: Value) -> Value {
    heap.value_at(call_data.as_heap_object() + CALL_DATA_VALUES_OFFSET)
}

// The value bound to the index'th call tag entry. Values are stored
// in evaluation order with the last evaluated at index zero offsets,
// mirroring how they'd sit on the stack.
pub fn get_call_data_value_at(heap: &Heap, call_data: Value, index: u64) -> Value {
    let tags = get_call_data_tags(heap, call_data);
    let offset = get_call_tags_offset_at(heap, tags, index);
    let values = get_call_data_values(heap, call_data);
    let length = object::get_array_length(heap, values);
    object::get_array_at(heap, values, length - 1 - offset)
}

pub fn new_heap_call_data(runtime: &mut Runtime, tags: Value, values: Value) -> Result<Value> {
    let species = runtime.species_for(behavior::Family::CallData, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(CALL_DATA_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + CALL_DATA_TAGS_OFFSET, tags);
    heap.set_value_at(result.as_heap_object() + CALL_DATA_VALUES_OFFSET, values);
    Ok(result)
}


// --- A r g u m e n t   m a p   t r i e ---
//
// Memoizes the reordering arrays dispatch produces: walking the trie
// with an offset vector always yields the same array object, so
// identical vectors share one map.

pub const ARGUMENT_MAP_TRIE_VALUE_OFFSET: u64 = 1;
pub const ARGUMENT_MAP_TRIE_CHILDREN_OFFSET: u64 = 2;
pub const ARGUMENT_MAP_TRIE_SIZE: u64 = 3;

pub fn get_argument_map_trie_value(heap: &Heap, trie: Value) -> Value {
    heap.value_at(trie.as_heap_object() + ARGUMENT_MAP_TRIE_VALUE_OFFSET)
}

fn get_argument_map_trie_children(heap: &Heap, trie: Value) -> Value {
    heap.value_at(trie.as_heap_object() + ARGUMENT_MAP_TRIE_CHILDREN_OFFSET)
}

pub fn new_heap_argument_map_trie(runtime: &mut Runtime, value: Value) -> Result<Value> {
    let children = object::new_heap_id_hash_map(runtime, 4)?;
    let species = runtime.species_for(behavior::Family::ArgumentMapTrie, behavior::Mode::Mutable);
    let result = runtime.alloc_heap_object(ARGUMENT_MAP_TRIE_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + ARGUMENT_MAP_TRIE_VALUE_OFFSET, value);
    heap.set_value_at(result.as_heap_object() + ARGUMENT_MAP_TRIE_CHILDREN_OFFSET, children);
    Ok(result)
}

fn get_argument_map_trie_child(runtime: &mut Runtime, trie: Value, key: Value) -> Result<Value> {
    let children = get_argument_map_trie_children(&runtime.heap, trie);
    if let Ok(child) = object::get_id_hash_map_at(&runtime.heap, children, key) {
        return Ok(child);
    }
    // Extend this node's map with the key appended.
    let parent_map = get_argument_map_trie_value(&runtime.heap, trie);
    let parent_length = object::get_array_length(&runtime.heap, parent_map);
    let child_map = object::new_heap_array(runtime, parent_length + 1)?;
    for i in 0..parent_length {
        let element = object::get_array_at(&runtime.heap, parent_map, i);
        object::set_array_at(&mut runtime.heap, child_map, i, element);
    }
    object::set_array_at(&mut runtime.heap, child_map, parent_length, key);
    let child = new_heap_argument_map_trie(runtime, child_map)?;
    object::set_id_hash_map_at(runtime, children, key, child)?;
    Ok(child)
}

// Turns an offsets vector into the canonical reordering array, shared
// across lookups that produce the same vector.
pub fn build_argument_map(runtime: &mut Runtime, offsets: &[u64]) -> Result<Value> {
    let mut current = runtime.argument_map_trie_root();
    for &offset in offsets {
        let key = if offset == NO_OFFSET {
            null()
        } else {
            Value::new_integer(offset as i64)
        };
        current = get_argument_map_trie_child(runtime, current, key)?;
    }
    Ok(get_argument_map_trie_value(&runtime.heap, current))
}


// --- S i g n a t u r e   m a t c h i n g ---

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchResult {
    MissingArgument,
    UnexpectedArgument,
    RedundantArgument,
    GuardRejected,
    Match,
    ExtraMatch,
}

impl MatchResult {
    pub fn is_match(self) -> bool {
        match self {
            MatchResult::Match | MatchResult::ExtraMatch => true,
            _ => false,
        }
    }
}

pub struct MatchInfo {
    pub scores: [Value; MAX_LOOKUP_ARGUMENT_COUNT],
    pub offsets: [u64; MAX_LOOKUP_ARGUMENT_COUNT],
}

impl MatchInfo {
    pub fn new() -> MatchInfo {
        MatchInfo {
            scores: [value::new_no_match_score(); MAX_LOOKUP_ARGUMENT_COUNT],
            offsets: [NO_OFFSET; MAX_LOOKUP_ARGUMENT_COUNT],
        }
    }
}

// Where lookup reads its argument values from.
pub trait SigmapInput {
    fn argument_count(&self) -> u64;
    fn tag_at(&self, heap: &Heap, index: u64) -> Value;
    fn offset_at(&self, heap: &Heap, index: u64) -> u64;
    fn value_at(&self, heap: &Heap, index: u64) -> Value;
    fn match_value_at(
        &self,
        runtime: &Runtime,
        index: u64,
        guard: Value,
        space: Value,
    ) -> Result<Value>;
}

// Matches the input against one signature, filling per-argument
// scores and per-parameter offsets.
pub fn generic_match_signature<I: SigmapInput>(
    runtime: &Runtime,
    signature: Value,
    input: &I,
    space: Value,
    info: &mut MatchInfo,
) -> Result<MatchResult> {
    let heap = &runtime.heap;
    let argc = input.argument_count();
    debug_assert!(argc as usize <= MAX_LOOKUP_ARGUMENT_COUNT);
    let mandatory_count = get_signature_mandatory_count(heap, signature);
    if argc < mandatory_count {
        return Ok(MatchResult::MissingArgument);
    }
    let param_count = get_signature_parameter_count(heap, signature);
    if param_count as usize > MAX_LOOKUP_ARGUMENT_COUNT {
        return Err(Condition::invalid_input_hint("parc"));
    }
    let allow_extra = get_signature_allow_extra(heap, signature);
    if !allow_extra && argc > param_count {
        return Ok(MatchResult::UnexpectedArgument);
    }
    let mut params_seen = [false; MAX_LOOKUP_ARGUMENT_COUNT];
    let mut mandatory_seen = 0;
    let mut on_match = MatchResult::Match;
    for i in 0..argc as usize {
        info.scores[i] = value::new_no_match_score();
        info.offsets[i] = NO_OFFSET;
    }
    let tags = get_signature_tags(heap, signature);
    for i in 0..argc {
        let tag = input.tag_at(heap, i);
        let param = match object::binary_search_pair_array(heap, tags, tag) {
            Ok(param) => param,
            Err(_) => {
                // The tag wasn't found in this signature.
                if allow_extra {
                    on_match = MatchResult::ExtraMatch;
                    info.scores[i as usize] = value::new_extra_match_score();
                    continue;
                } else {
                    return Ok(MatchResult::UnexpectedArgument);
                }
            }
        };
        let index = get_parameter_index(heap, param);
        if params_seen[index as usize] {
            // Two tags matched the same parameter.
            return Ok(MatchResult::RedundantArgument);
        }
        let guard = get_parameter_guard(heap, param);
        let score = input.match_value_at(runtime, i, guard, space)?;
        if !value::is_score_match(score) {
            return Ok(MatchResult::GuardRejected);
        }
        params_seen[index as usize] = true;
        info.scores[i as usize] = score;
        info.offsets[index as usize] = input.offset_at(heap, i);
        if !get_parameter_is_optional(heap, param) {
            mandatory_seen += 1;
        }
    }
    if mandatory_seen < mandatory_count {
        Ok(MatchResult::MissingArgument)
    } else {
        Ok(on_match)
    }
}


// --- S c o r e   j o i n i n g ---

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinStatus {
    // The vectors were equal.
    Equal = 0,
    // The source was strictly worse on some argument and better on
    // none.
    Worse = 1,
    // The source strictly improved on some argument; target updated.
    Better = 2,
    // Each was better somewhere; the target now holds the max.
    Ambiguous = 3,
}

pub fn join_score_vectors(target: &mut [Value], source: &[Value], length: usize) -> JoinStatus {
    // The bit fiddling works because of how the discriminants are
    // chosen: worse is bit 0, better is bit 1.
    let mut result = 0u8;
    for i in 0..length {
        if value::is_score_better(target[i], source[i]) {
            result |= 1;
        } else if value::is_score_better(source[i], target[i]) {
            result |= 2;
            target[i] = source[i];
        }
    }
    match result {
        0 => JoinStatus::Equal,
        1 => JoinStatus::Worse,
        2 => JoinStatus::Better,
        _ => JoinStatus::Ambiguous,
    }
}


// --- L o o k u p   s t a t e ---

// How lookup results are collected.
pub trait SigmapOutput {
    fn reset(&mut self);
    // The running result, a method or an in-band lookup condition.
    fn result(&self) -> Value;
    fn add_better(&mut self, value: Value);
    fn add_ambiguous(&mut self, value: Value);
}

// Picks the unique best match; two distinct incomparable candidates
// degrade the result to Ambiguity.
pub struct UniqueBestOutput {
    result: Value,
}

impl UniqueBestOutput {
    pub fn new() -> UniqueBestOutput {
        UniqueBestOutput {
            result: Condition::lookup_error(LookupError::NoMatch).to_value(),
        }
    }
}

impl SigmapOutput for UniqueBestOutput {
    fn reset(&mut self) {
        self.result = Condition::lookup_error(LookupError::NoMatch).to_value();
    }

    fn result(&self) -> Value {
        self.result
    }

    fn add_better(&mut self, value: Value) {
        self.result = value;
    }

    fn add_ambiguous(&mut self, value: Value) {
        // Hitting the same entry again, which happens when a map is
        // traversed twice, is not a real ambiguity.
        if !value.is_same(self.result) {
            self.result = Condition::lookup_error(LookupError::Ambiguity).to_value();
        }
    }
}

// Keeps the first best match and the handler it came from. Later
// equally-good matches are ignored: they sit further down the stack
// and are less relevant.
pub struct SignalHandlerOutput {
    result: Value,
    result_handler: Value,
    current_handler: Value,
}

impl SignalHandlerOutput {
    pub fn new() -> SignalHandlerOutput {
        SignalHandlerOutput {
            result: Condition::lookup_error(LookupError::NoMatch).to_value(),
            result_handler: nothing(),
            current_handler: nothing(),
        }
    }

    pub fn set_current_handler(&mut self, handler: Value) {
        self.current_handler = handler;
    }

    pub fn result_handler(&self) -> Value {
        self.result_handler
    }
}

impl SigmapOutput for SignalHandlerOutput {
    fn reset(&mut self) {
        self.result = Condition::lookup_error(LookupError::NoMatch).to_value();
        self.result_handler = nothing();
        self.current_handler = nothing();
    }

    fn result(&self) -> Value {
        self.result
    }

    fn add_better(&mut self, value: Value) {
        self.result = value;
        self.result_handler = self.current_handler;
    }

    fn add_ambiguous(&mut self, _value: Value) {}
}

pub struct SigmapState<'i, 'o, I: SigmapInput, O: SigmapOutput> {
    pub input: &'i I,
    pub output: &'o mut O,
    max_score: [Value; MAX_LOOKUP_ARGUMENT_COUNT],
    result_offsets: [u64; MAX_LOOKUP_ARGUMENT_COUNT],
    max_is_synthetic: bool,
}

impl<'i, 'o, I: SigmapInput, O: SigmapOutput> SigmapState<'i, 'o, I, O> {
    fn new(input: &'i I, output: &'o mut O) -> SigmapState<'i, 'o, I, O> {
        let mut state = SigmapState {
            input,
            output,
            max_score: [value::new_no_match_score(); MAX_LOOKUP_ARGUMENT_COUNT],
            result_offsets: [NO_OFFSET; MAX_LOOKUP_ARGUMENT_COUNT],
            max_is_synthetic: false,
        };
        state.reset();
        state
    }

    pub fn reset(&mut self) {
        self.output.reset();
        self.max_is_synthetic = false;
        for i in 0..MAX_LOOKUP_ARGUMENT_COUNT {
            self.max_score[i] = value::new_no_match_score();
        }
    }

    pub fn result_offsets(&self) -> &[u64] {
        &self.result_offsets[..self.input.argument_count() as usize]
    }
}

// Includes one signature map in the lookup.
pub fn continue_sigmap_lookup<I: SigmapInput, O: SigmapOutput>(
    runtime: &Runtime,
    state: &mut SigmapState<I, O>,
    sigmap: Value,
    space: Value,
) -> Result<()> {
    let entries = get_signature_map_entries(&runtime.heap, sigmap);
    let entry_count = object::get_pair_array_buffer_length(&runtime.heap, entries);
    let argc = state.input.argument_count() as usize;
    let mut info = MatchInfo::new();
    for current in 0..entry_count {
        let signature = object::get_pair_array_buffer_first_at(&runtime.heap, entries, current);
        let value = object::get_pair_array_buffer_second_at(&runtime.heap, entries, current);
        let matched = generic_match_signature(runtime, signature, state.input, space, &mut info)?;
        if !matched.is_match() {
            continue;
        }
        let status = join_score_vectors(&mut state.max_score, &info.scores, argc);
        if status == JoinStatus::Better
            || (state.max_is_synthetic && status == JoinStatus::Equal)
        {
            // Either strictly better than the best so far, or equal to
            // a synthetic max which nothing actually achieved.
            state.output.add_better(value);
            state.max_is_synthetic = false;
            state.result_offsets = info.offsets;
        } else if status != JoinStatus::Worse {
            state.output.add_ambiguous(value);
            state.max_is_synthetic = status == JoinStatus::Ambiguous;
        }
    }
    Ok(())
}

fn check_lookup_argument_count(argc: u64) -> Result<()> {
    if argc as usize > MAX_LOOKUP_ARGUMENT_COUNT {
        Err(Condition::invalid_input_hint("argc"))
    } else {
        Ok(())
    }
}


// --- I n p u t s ---

// Reads argument values off the evaluation stack of a frame whose
// pending invocation pushed them.
pub struct FrameSigmapInput {
    tags: Value,
    frame: Frame,
    count: u64,
}

impl FrameSigmapInput {
    pub fn new_counted(heap: &Heap, tags: Value, frame: Frame) -> FrameSigmapInput {
        let count = get_call_tags_entry_count(heap, tags);
        FrameSigmapInput { tags, frame, count }
    }
}

impl SigmapInput for FrameSigmapInput {
    fn argument_count(&self) -> u64 {
        self.count
    }

    fn tag_at(&self, heap: &Heap, index: u64) -> Value {
        get_call_tags_tag_at(heap, self.tags, index)
    }

    fn offset_at(&self, heap: &Heap, index: u64) -> u64 {
        get_call_tags_offset_at(heap, self.tags, index)
    }

    fn value_at(&self, heap: &Heap, index: u64) -> Value {
        let offset = self.offset_at(heap, index);
        self.frame.peek(heap, offset)
    }

    fn match_value_at(
        &self,
        runtime: &Runtime,
        index: u64,
        guard: Value,
        space: Value,
    ) -> Result<Value> {
        let value = self.value_at(&runtime.heap, index);
        guard_match(runtime, guard, value, space)
    }
}

// Frame input that honors next-guards: a candidate only scores if it
// is strictly worse than the guard the previous method matched with,
// which is what makes next-method dispatch skip the current method.
pub struct FrameWithNextsSigmapInput {
    inner: FrameSigmapInput,
    next_guards: Value,
}

impl FrameWithNextsSigmapInput {
    pub fn new_counted(
        heap: &Heap,
        tags: Value,
        frame: Frame,
        next_guards: Value,
    ) -> FrameWithNextsSigmapInput {
        debug_assert!(!is_nothing(next_guards));
        FrameWithNextsSigmapInput {
            inner: FrameSigmapInput::new_counted(heap, tags, frame),
            next_guards,
        }
    }
}

impl SigmapInput for FrameWithNextsSigmapInput {
    fn argument_count(&self) -> u64 {
        self.inner.argument_count()
    }

    fn tag_at(&self, heap: &Heap, index: u64) -> Value {
        self.inner.tag_at(heap, index)
    }

    fn offset_at(&self, heap: &Heap, index: u64) -> u64 {
        self.inner.offset_at(heap, index)
    }

    fn value_at(&self, heap: &Heap, index: u64) -> Value {
        self.inner.value_at(heap, index)
    }

    fn match_value_at(
        &self,
        runtime: &Runtime,
        index: u64,
        guard: Value,
        space: Value,
    ) -> Result<Value> {
        let value = self.value_at(&runtime.heap, index);
        let score = guard_match(runtime, guard, value, space)?;
        let next_guard = object::get_array_at(&runtime.heap, self.next_guards, index);
        if is_nothing(next_guard) {
            return Ok(score);
        }
        let next_score = guard_match(runtime, next_guard, value, space)?;
        if value::is_score_better(next_score, score) {
            Ok(score)
        } else {
            Ok(value::new_no_match_score())
        }
    }
}

// Reads argument values out of a call data object.
pub struct CallDataSigmapInput {
    call_data: Value,
    tags: Value,
    count: u64,
}

impl CallDataSigmapInput {
    pub fn new_counted(heap: &Heap, call_data: Value) -> CallDataSigmapInput {
        let tags = get_call_data_tags(heap, call_data);
        let count = get_call_tags_entry_count(heap, tags);
        CallDataSigmapInput { call_data, tags, count }
    }
}

impl SigmapInput for CallDataSigmapInput {
    fn argument_count(&self) -> u64 {
        self.count
    }

    fn tag_at(&self, heap: &Heap, index: u64) -> Value {
        get_call_tags_tag_at(heap, self.tags, index)
    }

    fn offset_at(&self, heap: &Heap, index: u64) -> u64 {
        get_call_tags_offset_at(heap, self.tags, index)
    }

    fn value_at(&self, heap: &Heap, index: u64) -> Value {
        get_call_data_value_at(heap, self.call_data, index)
    }

    fn match_value_at(
        &self,
        runtime: &Runtime,
        index: u64,
        guard: Value,
        space: Value,
    ) -> Result<Value> {
        let value = self.value_at(&runtime.heap, index);
        guard_match(runtime, guard, value, space)
    }
}


// --- T h u n k s   a n d   s p e c i a l i z a t i o n s ---

// The outcome of a lookup: the winning method (or in-band lookup
// condition) and the offsets the match bound, from which the caller
// builds the argument map.
#[derive(Debug)]
pub struct LookupOutcome {
    pub result: Value,
    pub offsets: Vec<u64>,
}

// Walks the methodspace chain from the given space to its root.
fn lookup_through_chain<I: SigmapInput, O: SigmapOutput>(
    runtime: &Runtime,
    state: &mut SigmapState<I, O>,
    space: Value,
) -> Result<()> {
    let mut current = space;
    while !is_nothing(current) {
        let sigmap = get_methodspace_methods(&runtime.heap, current);
        continue_sigmap_lookup(runtime, state, sigmap, current)?;
        current = get_methodspace_parent(&runtime.heap, current);
    }
    Ok(())
}

// The subject sorts lowest, so when present it is entry zero.
fn get_invocation_subject<I: SigmapInput>(runtime: &Runtime, input: &I) -> Result<Value> {
    if input.argument_count() == 0 {
        return Err(Condition::not_found());
    }
    let tag_zero = input.tag_at(&runtime.heap, 0);
    if tag_zero.is_same(runtime.roots().subject_key) {
        Ok(input.value_at(&runtime.heap, 0))
    } else {
        Err(Condition::not_found())
    }
}

// Full invocation lookup: the methodspace chain, then one more round
// through the subject's private methodspace when the winner carries a
// delegate flag.
fn invocation_lookup<I: SigmapInput, O: SigmapOutput>(
    runtime: &Runtime,
    input: &I,
    output: &mut O,
    space: Value,
) -> Result<LookupOutcome> {
    check_lookup_argument_count(input.argument_count())?;
    let mut state = SigmapState::new(input, output);
    lookup_through_chain(runtime, &mut state, space)?;
    let result = state.output.result();
    if object::in_family(&runtime.heap, behavior::Family::Method, result) {
        let flags = get_method_flags(&runtime.heap, result);
        if !flags.is_empty() {
            let subject = get_invocation_subject(runtime, input)?;
            let delegate_space = if flags.contains(MethodFlag::LambdaDelegate) {
                object::get_lambda_methods(&runtime.heap, subject)
            } else {
                let section = object::get_block_section(&runtime.heap, subject);
                crate::stack::get_block_section_methodspace(&runtime.heap, section)
            };
            state.reset();
            continue_sigmap_lookup(
                runtime,
                &mut state,
                get_methodspace_methods(&runtime.heap, delegate_space),
                delegate_space,
            )?;
        }
    }
    Ok(LookupOutcome {
        result: state.output.result(),
        offsets: state.result_offsets().to_vec(),
    })
}

pub fn lookup_method_full_from_frame(
    runtime: &Runtime,
    space: Value,
    tags: Value,
    frame: Frame,
    next_guards: Value,
) -> Result<LookupOutcome> {
    let mut output = UniqueBestOutput::new();
    if is_nothing(next_guards) {
        let input = FrameSigmapInput::new_counted(&runtime.heap, tags, frame);
        invocation_lookup(runtime, &input, &mut output, space)
    } else {
        let input = FrameWithNextsSigmapInput::new_counted(&runtime.heap, tags, frame, next_guards);
        invocation_lookup(runtime, &input, &mut output, space)
    }
}

pub fn lookup_method_full_from_call_data(
    runtime: &Runtime,
    space: Value,
    call_data: Value,
) -> Result<LookupOutcome> {
    let mut output = UniqueBestOutput::new();
    let input = CallDataSigmapInput::new_counted(&runtime.heap, call_data);
    invocation_lookup(runtime, &input, &mut output, space)
}

// Lookup confined to one methodspace, used for delegate dispatch and
// for lookups through a cached selector slice.
pub fn lookup_methodspace_method_from_frame(
    runtime: &Runtime,
    space: Value,
    tags: Value,
    frame: Frame,
    next_guards: Value,
) -> Result<LookupOutcome> {
    let mut output = UniqueBestOutput::new();
    if is_nothing(next_guards) {
        let input = FrameSigmapInput::new_counted(&runtime.heap, tags, frame);
        check_lookup_argument_count(input.argument_count())?;
        let mut state = SigmapState::new(&input, &mut output);
        continue_sigmap_lookup(
            runtime,
            &mut state,
            get_methodspace_methods(&runtime.heap, space),
            space,
        )?;
        Ok(LookupOutcome {
            result: state.output.result(),
            offsets: state.result_offsets().to_vec(),
        })
    } else {
        let input = FrameWithNextsSigmapInput::new_counted(&runtime.heap, tags, frame, next_guards);
        check_lookup_argument_count(input.argument_count())?;
        let mut state = SigmapState::new(&input, &mut output);
        continue_sigmap_lookup(
            runtime,
            &mut state,
            get_methodspace_methods(&runtime.heap, space),
            space,
        )?;
        Ok(LookupOutcome {
            result: state.output.result(),
            offsets: state.result_offsets().to_vec(),
        })
    }
}

// Lookup through a cached selector slice; inheritance still resolves
// against the originating space.
pub fn lookup_sigmap_method_from_frame(
    runtime: &Runtime,
    sigmap: Value,
    space: Value,
    tags: Value,
    frame: Frame,
) -> Result<LookupOutcome> {
    let mut output = UniqueBestOutput::new();
    let input = FrameSigmapInput::new_counted(&runtime.heap, tags, frame);
    check_lookup_argument_count(input.argument_count())?;
    let mut state = SigmapState::new(&input, &mut output);
    continue_sigmap_lookup(runtime, &mut state, sigmap, space)?;
    Ok(LookupOutcome {
        result: state.output.result(),
        offsets: state.result_offsets().to_vec(),
    })
}

pub struct SignalLookupOutcome {
    pub result: Value,
    pub handler: Value,
    pub offsets: Vec<u64>,
}

// Walks the barriers from the given frame outward, consulting each
// signal handler section's methodspace. The first handler to produce
// a best match wins; ties further out are ignored.
pub fn lookup_signal_handler_method_from_frame(
    runtime: &Runtime,
    tags: Value,
    frame: Frame,
) -> Result<SignalLookupOutcome> {
    let input = FrameSigmapInput::new_counted(&runtime.heap, tags, frame);
    check_lookup_argument_count(input.argument_count())?;
    let mut output = SignalHandlerOutput::new();
    let mut state = SigmapState::new(&input, &mut output);
    let mut barrier = frame.top_barrier(&runtime.heap);
    while !is_nothing(barrier) {
        if get_barrier_genus(&runtime.heap, barrier) == Genus::SignalHandlerSection {
            state.output.set_current_handler(barrier);
            let methods = get_barrier_payload(&runtime.heap, barrier);
            let sigmap = get_methodspace_methods(&runtime.heap, methods);
            continue_sigmap_lookup(runtime, &mut state, sigmap, methods)?;
        }
        barrier = barrier_previous(&runtime.heap, barrier);
    }
    let offsets = state.result_offsets().to_vec();
    let result = state.output.result();
    let handler = state.output.result_handler();
    Ok(SignalLookupOutcome { result, handler, offsets })
}


// --- B e h a v i o r   s t a t i c s ---

fn sized_layout(size: u64) -> behavior::ObjectLayout {
    behavior::ObjectLayout { size, value_offset: 1 }
}

pub static GUARD_BEHAVIOR: Behavior =
    Behavior::base(|_, _| sized_layout(GUARD_SIZE), generic_validate).modal();

pub static PARAMETER_BEHAVIOR: Behavior =
    Behavior::base(|_, _| sized_layout(PARAMETER_SIZE), generic_validate).modal();

pub static SIGNATURE_BEHAVIOR: Behavior = Behavior::base(
    |_, _| sized_layout(SIGNATURE_SIZE),
    generic_validate,
)
.modal()
.with_owned_freeze(|runtime, value| {
    let tags = get_signature_tags(&runtime.heap, value);
    freeze::ensure_frozen(runtime, tags)
});

pub static SIGNATURE_MAP_BEHAVIOR: Behavior = Behavior::base(
    |_, _| sized_layout(SIGNATURE_MAP_SIZE),
    generic_validate,
)
.modal()
.with_owned_freeze(|runtime, value| {
    let entries = get_signature_map_entries(&runtime.heap, value);
    freeze::ensure_frozen(runtime, entries)
});

pub static METHOD_BEHAVIOR: Behavior =
    Behavior::base(|_, _| sized_layout(METHOD_SIZE), generic_validate).modal();

pub static METHODSPACE_BEHAVIOR: Behavior = Behavior::base(
    |_, _| sized_layout(METHODSPACE_SIZE),
    generic_validate,
)
.modal()
.with_owned_freeze(|runtime, value| {
    let inheritance = get_methodspace_inheritance(&runtime.heap, value);
    freeze::ensure_id_hash_map_frozen(
        runtime,
        inheritance,
        freeze::MapFreezeFlag::FreezeValues.into(),
    )?;
    let methods = get_methodspace_methods(&runtime.heap, value);
    freeze::ensure_frozen(runtime, methods)
});

pub static CALL_TAGS_BEHAVIOR: Behavior = Behavior::base(
    |_, _| sized_layout(CALL_TAGS_SIZE),
    generic_validate,
)
.modal()
.with_owned_freeze(|runtime, value| {
    let entries = get_call_tags_entries(&runtime.heap, value);
    freeze::ensure_frozen(runtime, entries)
})
.with_hash(|heap, value, stream, detector| {
    detector.enter(value)?;
    let result =
        behavior::hash_value_into(heap, get_call_tags_entries(heap, value), stream, detector);
    detector.leave();
    result
})
.with_compare(|heap, a, b, detector| {
    detector.enter(a)?;
    let result = behavior::compare_values_inner(
        heap,
        get_call_tags_entries(heap, a),
        get_call_tags_entries(heap, b),
        detector,
    );
    detector.leave();
    result
});

pub static CALL_DATA_BEHAVIOR: Behavior =
    Behavior::base(|_, _| sized_layout(CALL_DATA_SIZE), generic_validate);

pub static ARGUMENT_MAP_TRIE_BEHAVIOR: Behavior =
    Behavior::base(|_, _| sized_layout(ARGUMENT_MAP_TRIE_SIZE), generic_validate);


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{NamedRoot, Runtime};
    use crate::stack::{new_heap_stack, push_barrier, push_stack_frame};
    use enumflags2::BitFlags;

    fn new_test_runtime() -> Runtime {
        Runtime::with_default_config().expect("runtime creation failed")
    }

    fn new_selector(runtime: &mut Runtime, name: &str) -> Value {
        let name_value = object::new_heap_utf8(runtime, name).unwrap();
        object::new_heap_operation(runtime, object::OperationType::Infix, name_value).unwrap()
    }

    fn is_guard(runtime: &mut Runtime, type_value: Value) -> Value {
        new_heap_guard(runtime, GuardType::Is, type_value).unwrap()
    }

    fn eq_guard(runtime: &mut Runtime, value: Value) -> Value {
        new_heap_guard(runtime, GuardType::Eq, value).unwrap()
    }

    // A method whose signature is (subject, selector, positionals),
    // with a live empty code block so invocation paths don't stumble.
    fn add_method(
        runtime: &mut Runtime,
        space: Value,
        subject_guard: Value,
        selector: Value,
        positional_guards: &[Value],
    ) -> Value {
        let subject_key = runtime.roots().subject_key;
        let selector_key = runtime.roots().selector_key;
        let selector_guard = eq_guard(runtime, selector);
        let mut params = vec![
            (subject_key, subject_guard, false),
            (selector_key, selector_guard, false),
        ];
        for (i, &guard) in positional_guards.iter().enumerate() {
            params.push((Value::new_integer(i as i64), guard, false));
        }
        let signature = new_heap_signature(runtime, &params, false).unwrap();
        let code = runtime.roots().empty_code_block;
        let method = new_heap_method(
            runtime,
            signature,
            nothing(),
            code,
            nothing(),
            BitFlags::empty(),
        )
        .unwrap();
        add_methodspace_method(runtime, space, method).unwrap();
        method
    }

    // Canonical tags for a (subject, selector, positional...) call.
    fn call_tags(runtime: &mut Runtime, positional_count: u64) -> Value {
        let subject_key = runtime.roots().subject_key;
        let selector_key = runtime.roots().selector_key;
        let tag_array =
            object::new_heap_array(runtime, 2 + positional_count).unwrap();
        object::set_array_at(&mut runtime.heap, tag_array, 0, subject_key);
        object::set_array_at(&mut runtime.heap, tag_array, 1, selector_key);
        for i in 0..positional_count {
            object::set_array_at(
                &mut runtime.heap,
                tag_array,
                2 + i,
                Value::new_integer(i as i64),
            );
        }
        new_heap_call_tags_from_evaluation_order(runtime, tag_array).unwrap()
    }

    // A frame whose evaluation stack holds the given pending
    // arguments.
    fn frame_with_args(runtime: &mut Runtime, values: &[Value]) -> Frame {
        let stack = new_heap_stack(runtime, 512).unwrap();
        let blob = object::new_heap_blob(runtime, 0).unwrap();
        let empty = runtime.roots().empty_array;
        let code = object::new_heap_code_block(runtime, blob, empty, 64).unwrap();
        let mut frame = Frame::open(&runtime.heap, stack);
        push_stack_frame(runtime, &mut frame, code, 0, empty).unwrap();
        for &value in values {
            frame.push(&mut runtime.heap, value);
        }
        frame
    }

    #[test]
    fn test_call_tags_canonicalization() {
        let mut runtime = new_test_runtime();
        let subject_key = runtime.roots().subject_key;
        let selector_key = runtime.roots().selector_key;
        // Evaluation order deliberately scrambled.
        let tag_array = object::new_heap_array_with_contents(
            &mut runtime,
            &[
                Value::new_integer(1),
                selector_key,
                Value::new_integer(0),
                subject_key,
            ],
        )
        .unwrap();
        let tags = new_heap_call_tags_from_evaluation_order(&mut runtime, tag_array).unwrap();
        // Sorted: subject, selector, then integers ascending, each
        // exactly once.
        assert!(get_call_tags_tag_at(&runtime.heap, tags, 0).is_same(subject_key));
        assert!(get_call_tags_tag_at(&runtime.heap, tags, 1).is_same(selector_key));
        assert_eq!(get_call_tags_tag_at(&runtime.heap, tags, 2).as_integer(), 0);
        assert_eq!(get_call_tags_tag_at(&runtime.heap, tags, 3).as_integer(), 1);
        // Offsets count back from the top of the stack: the last tag
        // evaluated has offset zero.
        assert_eq!(get_call_tags_offset_at(&runtime.heap, tags, 0), 0);
        assert_eq!(get_call_tags_offset_at(&runtime.heap, tags, 1), 2);
        assert_eq!(get_call_tags_offset_at(&runtime.heap, tags, 2), 1);
        assert_eq!(get_call_tags_offset_at(&runtime.heap, tags, 3), 3);
        assert_eq!(
            get_call_tags_subject_offset(&runtime.heap, tags).as_integer(),
            0
        );
        assert_eq!(
            get_call_tags_selector_offset(&runtime.heap, tags).as_integer(),
            2
        );
    }

    #[test]
    fn test_guard_scores() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let integer_type = runtime.root(NamedRoot::IntegerType);

        let any = runtime.roots().any_guard;
        let score = guard_match(&runtime, any, Value::new_integer(1), space).unwrap();
        assert_eq!(value::get_score_category(score), value::ScoreCategory::Any);

        let eq = eq_guard(&mut runtime, Value::new_integer(7));
        let hit = guard_match(&runtime, eq, Value::new_integer(7), space).unwrap();
        assert_eq!(value::get_score_category(hit), value::ScoreCategory::Eq);
        let miss = guard_match(&runtime, eq, Value::new_integer(8), space).unwrap();
        assert!(!value::is_score_match(miss));

        let is = is_guard(&mut runtime, integer_type);
        let perfect = guard_match(&runtime, is, Value::new_integer(1), space).unwrap();
        assert!(perfect.is_same(value::new_perfect_is_match_score()));
        // Eq beats Is beats Any.
        assert!(value::is_score_better(hit, perfect));
        assert!(value::is_score_better(perfect, score));
    }

    #[test]
    fn test_is_guard_walks_inheritance() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let child_name = object::new_heap_utf8(&mut runtime, "Child").unwrap();
        let child = object::new_heap_type(&mut runtime, child_name).unwrap();
        let parent_name = object::new_heap_utf8(&mut runtime, "Parent").unwrap();
        let parent = object::new_heap_type(&mut runtime, parent_name).unwrap();
        add_methodspace_inheritance(&mut runtime, space, child, parent).unwrap();
        let species =
            object::new_heap_instance_species(&mut runtime, child, nothing(), crate::behavior::Mode::Mutable)
                .unwrap();
        let instance = object::new_heap_instance(&mut runtime, species).unwrap();

        let child_guard = is_guard(&mut runtime, child);
        let direct = guard_match(&runtime, child_guard, instance, space).unwrap();
        assert_eq!(value::get_score_subscore(direct), 0);

        // One hop up costs one subscore step.
        let parent_guard = is_guard(&mut runtime, parent);
        let inherited = guard_match(&runtime, parent_guard, instance, space).unwrap();
        assert_eq!(value::get_score_category(inherited), value::ScoreCategory::Is);
        assert_eq!(value::get_score_subscore(inherited), 1);
        assert!(value::is_score_better(direct, inherited));

        // Unrelated types don't match at all.
        let other_name = object::new_heap_utf8(&mut runtime, "Other").unwrap();
        let other = object::new_heap_type(&mut runtime, other_name).unwrap();
        let other_guard = is_guard(&mut runtime, other);
        let unrelated = guard_match(&runtime, other_guard, instance, space).unwrap();
        assert!(!value::is_score_match(unrelated));
    }

    #[test]
    fn test_unique_best_lookup() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let plus = new_selector(&mut runtime, "+");
        let integer_type = runtime.root(NamedRoot::IntegerType);
        let any = runtime.roots().any_guard;
        let general = add_method(&mut runtime, space, any, plus, &[any]);
        let int_guard = is_guard(&mut runtime, integer_type);
        let any2 = runtime.roots().any_guard;
        let specific = add_method(&mut runtime, space, int_guard, plus, &[any2]);

        let tags = call_tags(&mut runtime, 1);
        let frame = frame_with_args(
            &mut runtime,
            &[Value::new_integer(1), plus, Value::new_integer(2)],
        );
        let outcome =
            lookup_method_full_from_frame(&runtime, space, tags, frame, nothing()).unwrap();
        let winner = outcome.result.to_result().unwrap();
        assert!(winner.is_same(specific));
        assert!(!winner.is_same(general));
        // The offsets bind parameters to stack offsets: subject was
        // pushed first of three.
        assert_eq!(outcome.offsets[0], 2);
        assert_eq!(outcome.offsets[1], 1);
        assert_eq!(outcome.offsets[2], 0);
    }

    #[test]
    fn test_lookup_failure_modes() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let plus = new_selector(&mut runtime, "+");
        let tags = call_tags(&mut runtime, 1);
        let frame = frame_with_args(
            &mut runtime,
            &[Value::new_integer(1), plus, Value::new_integer(2)],
        );
        // Empty space: no match.
        let outcome =
            lookup_method_full_from_frame(&runtime, space, tags, frame, nothing()).unwrap();
        let err = outcome.result.to_result().unwrap_err();
        assert_eq!(err.lookup_error_cause(), LookupError::NoMatch);

        // Two incomparable candidates: ambiguity.
        let integer_type = runtime.root(NamedRoot::IntegerType);
        let any = runtime.roots().any_guard;
        let int_guard_a = is_guard(&mut runtime, integer_type);
        add_method(&mut runtime, space, int_guard_a, plus, &[any]);
        let int_guard_b = is_guard(&mut runtime, integer_type);
        let any2 = runtime.roots().any_guard;
        add_method(&mut runtime, space, any2, plus, &[int_guard_b]);
        let outcome =
            lookup_method_full_from_frame(&runtime, space, tags, frame, nothing()).unwrap();
        let err = outcome.result.to_result().unwrap_err();
        assert_eq!(err.lookup_error_cause(), LookupError::Ambiguity);
    }

    #[test]
    fn test_dispatch_is_deterministic_and_cache_independent() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let plus = new_selector(&mut runtime, "+");
        let minus = new_selector(&mut runtime, "-");
        let integer_type = runtime.root(NamedRoot::IntegerType);
        let int_guard = is_guard(&mut runtime, integer_type);
        let any = runtime.roots().any_guard;
        let plus_method = add_method(&mut runtime, space, int_guard, plus, &[any]);
        let int_guard2 = is_guard(&mut runtime, integer_type);
        let any2 = runtime.roots().any_guard;
        let _minus_method = add_method(&mut runtime, space, int_guard2, minus, &[any2]);

        let tags = call_tags(&mut runtime, 1);
        let frame = frame_with_args(
            &mut runtime,
            &[Value::new_integer(1), plus, Value::new_integer(2)],
        );
        let full = lookup_method_full_from_frame(&runtime, space, tags, frame, nothing())
            .unwrap()
            .result
            .to_result()
            .unwrap();
        // Through the selector slice cache the same method wins.
        let slice =
            get_or_create_methodspace_selector_slice(&mut runtime, space, plus).unwrap();
        // The slice keeps only the candidates that can match the
        // selector.
        let entries = get_signature_map_entries(&runtime.heap, slice);
        assert_eq!(object::get_pair_array_buffer_length(&runtime.heap, entries), 1);
        let cached = lookup_sigmap_method_from_frame(&runtime, slice, space, tags, frame)
            .unwrap()
            .result
            .to_result()
            .unwrap();
        assert!(full.is_same(cached));
        assert!(full.is_same(plus_method));
        // Repeating gives the same answer.
        for _ in 0..3 {
            let again = lookup_method_full_from_frame(&runtime, space, tags, frame, nothing())
                .unwrap()
                .result
                .to_result()
                .unwrap();
            assert!(again.is_same(full));
        }
    }

    #[test]
    fn test_method_addition_invalidates_cache() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let plus = new_selector(&mut runtime, "+");
        let any = runtime.roots().any_guard;
        add_method(&mut runtime, space, any, plus, &[]);
        let _slice =
            get_or_create_methodspace_selector_slice(&mut runtime, space, plus).unwrap();
        let cache_ptr = get_methodspace_cache_ptr(&runtime.heap, space);
        assert!(!is_nothing(object::get_freeze_cheat_value(&runtime.heap, cache_ptr)));
        // Any method addition blows the whole cache.
        let any2 = runtime.roots().any_guard;
        add_method(&mut runtime, space, any2, plus, &[]);
        assert!(is_nothing(object::get_freeze_cheat_value(&runtime.heap, cache_ptr)));
    }

    #[test]
    fn test_argument_maps_are_memoized() {
        let mut runtime = new_test_runtime();
        let first = build_argument_map(&mut runtime, &[2, 1, 0]).unwrap();
        let second = build_argument_map(&mut runtime, &[2, 1, 0]).unwrap();
        assert!(first.is_same(second));
        let different = build_argument_map(&mut runtime, &[0, 1, 2]).unwrap();
        assert!(!different.is_same(first));
        // Missing parameters map to null slots.
        let with_hole = build_argument_map(&mut runtime, &[1, NO_OFFSET]).unwrap();
        assert_eq!(object::get_array_length(&runtime.heap, with_hole), 2);
        assert!(value::is_null(object::get_array_at(&runtime.heap, with_hole, 1)));
    }

    #[test]
    fn test_next_guards_skip_the_current_method() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let plus = new_selector(&mut runtime, "+");
        let integer_type = runtime.root(NamedRoot::IntegerType);
        let any = runtime.roots().any_guard;
        let general = add_method(&mut runtime, space, any, plus, &[]);
        let int_guard = is_guard(&mut runtime, integer_type);
        let specific = add_method(&mut runtime, space, int_guard, plus, &[]);

        let tags = call_tags(&mut runtime, 0);
        let frame = frame_with_args(&mut runtime, &[Value::new_integer(1), plus]);
        // Plain lookup prefers the specific method.
        let plain = lookup_method_full_from_frame(&runtime, space, tags, frame, nothing())
            .unwrap()
            .result
            .to_result()
            .unwrap();
        assert!(plain.is_same(specific));

        // With the specific method's guards as next-guards, only
        // strictly worse candidates remain in play.
        let subject_next = is_guard(&mut runtime, integer_type);
        let next_guards = object::new_heap_array(&mut runtime, 2).unwrap();
        object::set_array_at(&mut runtime.heap, next_guards, 0, subject_next);
        object::set_array_at(&mut runtime.heap, next_guards, 1, nothing());
        let next = lookup_method_full_from_frame(&runtime, space, tags, frame, next_guards)
            .unwrap()
            .result
            .to_result()
            .unwrap();
        assert!(next.is_same(general));
    }

    #[test]
    fn test_signal_handler_lookup_prefers_innermost() {
        let mut runtime = new_test_runtime();
        let boom = new_selector(&mut runtime, "boom");
        // Two handler spaces, both able to handle the signal.
        let selector_key = runtime.roots().selector_key;
        let mut spaces = Vec::new();
        let mut methods = Vec::new();
        for _ in 0..2 {
            let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
            let selector_guard = eq_guard(&mut runtime, boom);
            let params = [(selector_key, selector_guard, false)];
            let signature = new_heap_signature(&mut runtime, &params, false).unwrap();
            let code = runtime.roots().empty_code_block;
            let method = new_heap_method(
                &mut runtime,
                signature,
                nothing(),
                code,
                nothing(),
                BitFlags::empty(),
            )
            .unwrap();
            add_methodspace_method(&mut runtime, space, method).unwrap();
            spaces.push(space);
            methods.push(method);
        }

        // The raise site: the selector is the only pending argument.
        let mut frame = frame_with_args(&mut runtime, &[]);
        let zero = Value::new_integer(0);
        let outer = push_barrier(
            &mut runtime.heap,
            &mut frame,
            value::Genus::SignalHandlerSection,
            spaces[0],
            &[zero, zero, zero],
        );
        let inner = push_barrier(
            &mut runtime.heap,
            &mut frame,
            value::Genus::SignalHandlerSection,
            spaces[1],
            &[zero, zero, zero],
        );
        frame.push(&mut runtime.heap, boom);

        let tag_array = object::new_heap_array_with_contents(&mut runtime, &[selector_key]).unwrap();
        let tags = new_heap_call_tags_from_evaluation_order(&mut runtime, tag_array).unwrap();
        let outcome = lookup_signal_handler_method_from_frame(&runtime, tags, frame).unwrap();
        let winner = outcome.result.to_result().unwrap();
        // First best wins: the innermost handler's method, paired
        // with the innermost barrier.
        assert!(winner.is_same(methods[1]));
        assert!(outcome.handler.is_same(inner));
        assert!(!outcome.handler.is_same(outer));
    }

    #[test]
    fn test_call_data_lookup() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let plus = new_selector(&mut runtime, "+");
        let any = runtime.roots().any_guard;
        let method = add_method(&mut runtime, space, any, plus, &[any]);

        let tags = call_tags(&mut runtime, 1);
        let values = object::new_heap_array_with_contents(
            &mut runtime,
            &[Value::new_integer(5), plus, Value::new_integer(6)],
        )
        .unwrap();
        let call_data = new_heap_call_data(&mut runtime, tags, values).unwrap();
        // Entry order is subject, selector, positional; values read
        // back through the offsets.
        assert_eq!(get_call_data_value_at(&runtime.heap, call_data, 0).as_integer(), 5);
        assert_eq!(get_call_data_value_at(&runtime.heap, call_data, 2).as_integer(), 6);

        let outcome = lookup_method_full_from_call_data(&runtime, space, call_data).unwrap();
        assert!(outcome.result.to_result().unwrap().is_same(method));
    }

    #[test]
    fn test_too_many_arguments_is_refused() {
        let mut runtime = new_test_runtime();
        let space = new_heap_methodspace(&mut runtime, nothing()).unwrap();
        let plus = new_selector(&mut runtime, "+");
        let tags = call_tags(&mut runtime, 7);
        let mut args = vec![Value::new_integer(0), plus];
        for i in 0..7 {
            args.push(Value::new_integer(i));
        }
        let frame = frame_with_args(&mut runtime, &args);
        let err =
            lookup_method_full_from_frame(&runtime, space, tags, frame, nothing()).unwrap_err();
        assert_eq!(err.cause(), value::Cause::InvalidInput);
    }
}
