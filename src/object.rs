// Heap object families: species and the core data structures.
//
// Every heap object starts with a header word pointing at its species.
// The species records the object's family and, for modal families, its
// current mode. Everything else about an object's layout is derived
// from the species through the family behavior table in behavior.rs.
//
// Offsets below are in words from the start of the object; offset 0 is
// always the header.

use enumflags2::BitFlags;

use crate::behavior::{self, Behavior, Family, Mode, ObjectLayout};
use crate::freeze;
use crate::heap::Heap;
use crate::runtime::Runtime;
use crate::value::{
    self, Condition, Result, Value, is_nothing, nothing, null,
};


// --- H e a d e r s ---

pub fn get_header(heap: &Heap, obj: Value) -> Value {
    heap.value_at(obj.as_heap_object())
}

pub fn set_header(heap: &mut Heap, obj: Value, header: Value) {
    heap.set_value_at(obj.as_heap_object(), header);
}

// The species of an object. During a collection the header may
// temporarily be a forwarding pointer; normal code never sees that.
pub fn get_species(heap: &Heap, obj: Value) -> Value {
    let header = get_header(heap, obj);
    debug_assert!(header.is_heap_object(), "header is not a species");
    header
}

pub fn get_family(heap: &Heap, obj: Value) -> Family {
    get_species_family(heap, get_species(heap, obj))
}

pub fn in_family(heap: &Heap, family: Family, value: Value) -> bool {
    value.is_heap_object() && get_family(heap, value) == family
}

pub fn in_family_opt(heap: &Heap, family: Family, value: Value) -> bool {
    is_nothing(value) || in_family(heap, family, value)
}

pub fn get_behavior(heap: &Heap, obj: Value) -> &'static Behavior {
    behavior::family_behavior(get_family(heap, obj))
}


// --- S p e c i e s ---

// Which division a species belongs to: how many species the family
// has and what extra state they carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Division {
    // One species shared by every instance of the family.
    Compact = 0,
    // One species per (family, mode) pair.
    Modal = 1,
    // One species per user-defined type.
    Instance = 2,
    // One species per c-object factory.
    CObject = 3,
}

impl Division {
    pub fn from_i64(raw: i64) -> Division {
        match raw {
            0 => Division::Compact,
            1 => Division::Modal,
            2 => Division::Instance,
            3 => Division::CObject,
            _ => panic!("invalid division {}", raw),
        }
    }
}

pub const SPECIES_DIVISION_OFFSET: u64 = 1;
pub const SPECIES_FAMILY_OFFSET: u64 = 2;
// Modal, instance and c-object species put their mode here.
pub const SPECIES_MODE_OFFSET: u64 = 3;
// Modal: the roots field index of the family's fluid sibling.
pub const MODAL_SPECIES_BASE_ROOT_OFFSET: u64 = 4;
// Instance: the primary type and type manager.
pub const INSTANCE_SPECIES_TYPE_OFFSET: u64 = 4;
pub const INSTANCE_SPECIES_MANAGER_OFFSET: u64 = 5;
// CObject: layout description and type.
pub const C_OBJECT_SPECIES_DATA_SIZE_OFFSET: u64 = 4;
pub const C_OBJECT_SPECIES_VALUE_COUNT_OFFSET: u64 = 5;
pub const C_OBJECT_SPECIES_TYPE_OFFSET: u64 = 6;
pub const C_OBJECT_SPECIES_TAG_OFFSET: u64 = 7;

pub const COMPACT_SPECIES_SIZE: u64 = 3;
pub const MODAL_SPECIES_SIZE: u64 = 5;
pub const INSTANCE_SPECIES_SIZE: u64 = 6;
pub const C_OBJECT_SPECIES_SIZE: u64 = 8;

pub fn get_species_division(heap: &Heap, species: Value) -> Division {
    Division::from_i64(
        heap.value_at(species.as_heap_object() + SPECIES_DIVISION_OFFSET)
            .as_integer(),
    )
}

pub fn get_species_family(heap: &Heap, species: Value) -> Family {
    Family::from_u8(
        heap.value_at(species.as_heap_object() + SPECIES_FAMILY_OFFSET)
            .as_integer() as u8,
    )
}

pub fn get_species_mode(heap: &Heap, species: Value) -> Mode {
    debug_assert!(get_species_division(heap, species) != Division::Compact);
    Mode::from_i64(
        heap.value_at(species.as_heap_object() + SPECIES_MODE_OFFSET)
            .as_integer(),
    )
}

pub fn get_modal_species_base_root(heap: &Heap, species: Value) -> u64 {
    debug_assert!(get_species_division(heap, species) == Division::Modal);
    heap.value_at(species.as_heap_object() + MODAL_SPECIES_BASE_ROOT_OFFSET)
        .as_integer() as u64
}

pub fn get_instance_species_primary_type(heap: &Heap, species: Value) -> Value {
    heap.value_at(species.as_heap_object() + INSTANCE_SPECIES_TYPE_OFFSET)
}

pub fn get_c_object_species_data_size(heap: &Heap, species: Value) -> u64 {
    heap.value_at(species.as_heap_object() + C_OBJECT_SPECIES_DATA_SIZE_OFFSET)
        .as_integer() as u64
}

pub fn get_c_object_species_value_count(heap: &Heap, species: Value) -> u64 {
    heap.value_at(species.as_heap_object() + C_OBJECT_SPECIES_VALUE_COUNT_OFFSET)
        .as_integer() as u64
}

pub fn get_c_object_species_type(heap: &Heap, species: Value) -> Value {
    heap.value_at(species.as_heap_object() + C_OBJECT_SPECIES_TYPE_OFFSET)
}

pub fn get_species_layout(heap: &Heap, species: Value) -> ObjectLayout {
    let size = match get_species_division(heap, species) {
        Division::Compact => COMPACT_SPECIES_SIZE,
        Division::Modal => MODAL_SPECIES_SIZE,
        Division::Instance => INSTANCE_SPECIES_SIZE,
        Division::CObject => C_OBJECT_SPECIES_SIZE,
    };
    ObjectLayout { size, value_offset: 1 }
}

pub fn species_validate(heap: &Heap, species: Value) -> Result<()> {
    if !in_family(heap, Family::Species, species) {
        return Err(Condition::validation_failed());
    }
    Ok(())
}


// --- A r r a y ---

pub const ARRAY_LENGTH_OFFSET: u64 = 1;
pub const ARRAY_ELEMENTS_OFFSET: u64 = 2;

pub fn array_size(length: u64) -> u64 {
    ARRAY_ELEMENTS_OFFSET + length
}

pub fn get_array_length(heap: &Heap, array: Value) -> u64 {
    debug_assert!(in_family(heap, Family::Array, array));
    heap.value_at(array.as_heap_object() + ARRAY_LENGTH_OFFSET)
        .as_integer() as u64
}

pub fn get_array_at(heap: &Heap, array: Value, index: u64) -> Value {
    debug_assert!(index < get_array_length(heap, array));
    heap.value_at(array.as_heap_object() + ARRAY_ELEMENTS_OFFSET + index)
}

pub fn set_array_at(heap: &mut Heap, array: Value, index: u64, value: Value) {
    debug_assert!(index < get_array_length(heap, array));
    heap.set_value_at(array.as_heap_object() + ARRAY_ELEMENTS_OFFSET + index, value);
}

// True if any element is identical to the given value.
pub fn in_array(heap: &Heap, array: Value, value: Value) -> bool {
    let length = get_array_length(heap, array);
    (0..length).any(|i| get_array_at(heap, array, i).is_same(value))
}

pub fn new_heap_array(runtime: &mut Runtime, length: u64) -> Result<Value> {
    let species = runtime.species_for(Family::Array, Mode::Fluid);
    let result = runtime.alloc_heap_object(array_size(length), species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        result.as_heap_object() + ARRAY_LENGTH_OFFSET,
        Value::new_integer(length as i64),
    );
    for i in 0..length {
        set_array_at(heap, result, i, null());
    }
    Ok(result)
}

pub fn new_heap_array_with_contents(runtime: &mut Runtime, values: &[Value]) -> Result<Value> {
    let result = new_heap_array(runtime, values.len() as u64)?;
    for (i, &value) in values.iter().enumerate() {
        set_array_at(&mut runtime.heap, result, i as u64, value);
    }
    Ok(result)
}


// --- P a i r   a r r a y s ---
//
// A pair array is an ordinary array of even length holding (first,
// second) pairs. Call tag entries and signature tag lists are stored
// this way so they can be co-sorted and binary searched.

pub fn get_pair_array_length(heap: &Heap, array: Value) -> u64 {
    get_array_length(heap, array) / 2
}

pub fn get_pair_array_first_at(heap: &Heap, array: Value, index: u64) -> Value {
    get_array_at(heap, array, index * 2)
}

pub fn get_pair_array_second_at(heap: &Heap, array: Value, index: u64) -> Value {
    get_array_at(heap, array, index * 2 + 1)
}

pub fn set_pair_array_first_at(heap: &mut Heap, array: Value, index: u64, value: Value) {
    set_array_at(heap, array, index * 2, value);
}

pub fn set_pair_array_second_at(heap: &mut Heap, array: Value, index: u64, value: Value) {
    set_array_at(heap, array, index * 2 + 1, value);
}

pub fn new_heap_pair_array(runtime: &mut Runtime, pairs: u64) -> Result<Value> {
    new_heap_array(runtime, pairs * 2)
}

// Sorts the pairs by their first components, moving the second
// components along. Insertion sort: pair arrays are small and the
// order must be deterministic.
pub fn co_sort_pair_array(heap: &mut Heap, array: Value) {
    let length = get_pair_array_length(heap, array);
    for i in 1..length {
        let mut j = i;
        while j > 0 {
            let prev = get_pair_array_first_at(heap, array, j - 1);
            let this = get_pair_array_first_at(heap, array, j);
            if value::relation_to_integer(behavior::value_ordering_compare(heap, prev, this)) <= 0 {
                break;
            }
            swap_pairs(heap, array, j - 1, j);
            j -= 1;
        }
    }
}

fn swap_pairs(heap: &mut Heap, array: Value, a: u64, b: u64) {
    let first_a = get_pair_array_first_at(heap, array, a);
    let second_a = get_pair_array_second_at(heap, array, a);
    let first_b = get_pair_array_first_at(heap, array, b);
    let second_b = get_pair_array_second_at(heap, array, b);
    set_pair_array_first_at(heap, array, a, first_b);
    set_pair_array_second_at(heap, array, a, second_b);
    set_pair_array_first_at(heap, array, b, first_a);
    set_pair_array_second_at(heap, array, b, second_a);
}

// Finds the pair whose first component is identical to the key and
// returns its second component. The array must be co-sorted.
pub fn binary_search_pair_array(heap: &Heap, array: Value, key: Value) -> Result<Value> {
    let mut low = 0i64;
    let mut high = get_pair_array_length(heap, array) as i64 - 1;
    while low <= high {
        let mid = (low + high) / 2;
        let current = get_pair_array_first_at(heap, array, mid as u64);
        if current.is_same(key) {
            return Ok(get_pair_array_second_at(heap, array, mid as u64));
        }
        let relation = behavior::value_ordering_compare(heap, current, key);
        if value::relation_to_integer(relation) < 0 {
            low = mid + 1;
        } else {
            high = mid - 1;
        }
    }
    Err(Condition::not_found())
}


// --- A r r a y   b u f f e r ---

pub const ARRAY_BUFFER_LENGTH_OFFSET: u64 = 1;
pub const ARRAY_BUFFER_STORAGE_OFFSET: u64 = 2;
pub const ARRAY_BUFFER_SIZE: u64 = 3;

pub fn get_array_buffer_length(heap: &Heap, buffer: Value) -> u64 {
    debug_assert!(in_family(heap, Family::ArrayBuffer, buffer));
    heap.value_at(buffer.as_heap_object() + ARRAY_BUFFER_LENGTH_OFFSET)
        .as_integer() as u64
}

pub fn get_array_buffer_storage(heap: &Heap, buffer: Value) -> Value {
    heap.value_at(buffer.as_heap_object() + ARRAY_BUFFER_STORAGE_OFFSET)
}

pub fn get_array_buffer_at(heap: &Heap, buffer: Value, index: u64) -> Value {
    debug_assert!(index < get_array_buffer_length(heap, buffer));
    get_array_at(heap, get_array_buffer_storage(heap, buffer), index)
}

pub fn set_array_buffer_at(heap: &mut Heap, buffer: Value, index: u64, value: Value) {
    debug_assert!(index < get_array_buffer_length(heap, buffer));
    let storage = get_array_buffer_storage(heap, buffer);
    set_array_at(heap, storage, index, value);
}

pub fn new_heap_array_buffer(runtime: &mut Runtime, initial_capacity: u64) -> Result<Value> {
    let storage = new_heap_array(runtime, initial_capacity)?;
    let species = runtime.species_for(Family::ArrayBuffer, Mode::Mutable);
    let result = runtime.alloc_heap_object(ARRAY_BUFFER_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        result.as_heap_object() + ARRAY_BUFFER_LENGTH_OFFSET,
        Value::new_integer(0),
    );
    heap.set_value_at(result.as_heap_object() + ARRAY_BUFFER_STORAGE_OFFSET, storage);
    Ok(result)
}

// Appends by doubling the storage array when it is full. The fresh
// storage replaces the old one wholesale.
pub fn add_to_array_buffer(runtime: &mut Runtime, buffer: Value, value: Value) -> Result<()> {
    debug_assert!(freeze::is_mutable(&runtime.heap, buffer));
    let length = get_array_buffer_length(&runtime.heap, buffer);
    let storage = get_array_buffer_storage(&runtime.heap, buffer);
    let capacity = get_array_length(&runtime.heap, storage);
    if length == capacity {
        let new_capacity = if capacity == 0 { 4 } else { capacity * 2 };
        let new_storage = new_heap_array(runtime, new_capacity)?;
        for i in 0..length {
            let old = get_array_at(&runtime.heap, storage, i);
            set_array_at(&mut runtime.heap, new_storage, i, old);
        }
        runtime.heap.set_value_at(
            buffer.as_heap_object() + ARRAY_BUFFER_STORAGE_OFFSET,
            new_storage,
        );
    }
    let heap = &mut runtime.heap;
    let storage = get_array_buffer_storage(heap, buffer);
    set_array_at(heap, storage, length, value);
    heap.set_value_at(
        buffer.as_heap_object() + ARRAY_BUFFER_LENGTH_OFFSET,
        Value::new_integer(length as i64 + 1),
    );
    Ok(())
}

// Pair-buffer view: entries are (first, second) pairs flattened into
// the buffer, so entry i sits at indices 2i and 2i+1.
pub fn get_pair_array_buffer_length(heap: &Heap, buffer: Value) -> u64 {
    get_array_buffer_length(heap, buffer) / 2
}

pub fn get_pair_array_buffer_first_at(heap: &Heap, buffer: Value, index: u64) -> Value {
    get_array_buffer_at(heap, buffer, index * 2)
}

pub fn get_pair_array_buffer_second_at(heap: &Heap, buffer: Value, index: u64) -> Value {
    get_array_buffer_at(heap, buffer, index * 2 + 1)
}

pub fn add_to_pair_array_buffer(
    runtime: &mut Runtime,
    buffer: Value,
    first: Value,
    second: Value,
) -> Result<()> {
    add_to_array_buffer(runtime, buffer, first)?;
    add_to_array_buffer(runtime, buffer, second)
}


// --- I d   h a s h   m a p ---
//
// Open addressing with linear probing over a flat entry array of
// (hash, key, value) triples. Capacity is a power of two. A vacant
// slot has nothing in the hash field; a deleted slot has null there
// and still counts as occupied, which is why occupied >= size.

pub const ID_HASH_MAP_SIZE_OFFSET: u64 = 1;
pub const ID_HASH_MAP_CAPACITY_OFFSET: u64 = 2;
pub const ID_HASH_MAP_OCCUPIED_OFFSET: u64 = 3;
pub const ID_HASH_MAP_ENTRIES_OFFSET: u64 = 4;
pub const ID_HASH_MAP_SIZE: u64 = 5;

pub const ID_HASH_MAP_ENTRY_FIELDS: u64 = 3;

pub fn get_id_hash_map_size(heap: &Heap, map: Value) -> u64 {
    debug_assert!(in_family(heap, Family::IdHashMap, map));
    heap.value_at(map.as_heap_object() + ID_HASH_MAP_SIZE_OFFSET)
        .as_integer() as u64
}

pub fn get_id_hash_map_capacity(heap: &Heap, map: Value) -> u64 {
    heap.value_at(map.as_heap_object() + ID_HASH_MAP_CAPACITY_OFFSET)
        .as_integer() as u64
}

pub fn get_id_hash_map_occupied_count(heap: &Heap, map: Value) -> u64 {
    heap.value_at(map.as_heap_object() + ID_HASH_MAP_OCCUPIED_OFFSET)
        .as_integer() as u64
}

pub fn get_id_hash_map_entry_array(heap: &Heap, map: Value) -> Value {
    heap.value_at(map.as_heap_object() + ID_HASH_MAP_ENTRIES_OFFSET)
}

fn set_id_hash_map_counters(heap: &mut Heap, map: Value, size: u64, occupied: u64) {
    heap.set_value_at(
        map.as_heap_object() + ID_HASH_MAP_SIZE_OFFSET,
        Value::new_integer(size as i64),
    );
    heap.set_value_at(
        map.as_heap_object() + ID_HASH_MAP_OCCUPIED_OFFSET,
        Value::new_integer(occupied as i64),
    );
}

pub fn new_heap_id_hash_map(runtime: &mut Runtime, initial_capacity: u64) -> Result<Value> {
    let capacity = initial_capacity.next_power_of_two().max(4);
    let entries = new_heap_id_hash_map_entry_array(runtime, capacity)?;
    let species = runtime.species_for(Family::IdHashMap, Mode::Mutable);
    let result = runtime.alloc_heap_object(ID_HASH_MAP_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        result.as_heap_object() + ID_HASH_MAP_CAPACITY_OFFSET,
        Value::new_integer(capacity as i64),
    );
    heap.set_value_at(result.as_heap_object() + ID_HASH_MAP_ENTRIES_OFFSET, entries);
    set_id_hash_map_counters(heap, result, 0, 0);
    Ok(result)
}

fn new_heap_id_hash_map_entry_array(runtime: &mut Runtime, capacity: u64) -> Result<Value> {
    let entries = new_heap_array(runtime, capacity * ID_HASH_MAP_ENTRY_FIELDS)?;
    let heap = &mut runtime.heap;
    for i in 0..capacity {
        set_array_at(heap, entries, i * ID_HASH_MAP_ENTRY_FIELDS, nothing());
    }
    Ok(entries)
}

// The slot walk shared by lookup, insertion and deletion. Returns
// (slot of the key, first deleted slot on the probe path).
fn probe_id_hash_map(
    heap: &Heap,
    map: Value,
    key: Value,
    hash: i64,
) -> Result<(Option<u64>, Option<u64>)> {
    let capacity = get_id_hash_map_capacity(heap, map);
    let entries = get_id_hash_map_entry_array(heap, map);
    let mask = capacity - 1;
    let mut slot = (hash as u64) & mask;
    let mut first_deleted = None;
    for _ in 0..capacity {
        let slot_hash = get_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS);
        if is_nothing(slot_hash) {
            return Ok((None, first_deleted));
        }
        if value::is_null(slot_hash) {
            if first_deleted.is_none() {
                first_deleted = Some(slot);
            }
        } else if slot_hash.as_integer() == hash {
            let slot_key = get_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 1);
            if behavior::value_identity_compare(heap, slot_key, key)? {
                return Ok((Some(slot), first_deleted));
            }
        }
        slot = (slot + 1) & mask;
    }
    Ok((None, first_deleted))
}

pub fn get_id_hash_map_at(heap: &Heap, map: Value, key: Value) -> Result<Value> {
    let hash = behavior::value_transient_identity_hash(heap, key)?;
    let (found, _) = probe_id_hash_map(heap, map, key, hash)?;
    match found {
        Some(slot) => {
            let entries = get_id_hash_map_entry_array(heap, map);
            Ok(get_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 2))
        }
        None => Err(Condition::not_found()),
    }
}

pub fn has_id_hash_map_at(heap: &Heap, map: Value, key: Value) -> bool {
    get_id_hash_map_at(heap, map, key).is_ok()
}

// Inserts without extending; reports MapFull at the density limit so
// the caller can allocate a bigger entry array and retry.
pub fn try_set_id_hash_map_at(
    heap: &mut Heap,
    map: Value,
    key: Value,
    value: Value,
) -> Result<()> {
    let hash = behavior::value_transient_identity_hash(heap, key)?;
    let capacity = get_id_hash_map_capacity(heap, map);
    let occupied = get_id_hash_map_occupied_count(heap, map);
    let size = get_id_hash_map_size(heap, map);
    let entries = get_id_hash_map_entry_array(heap, map);
    let (found, first_deleted) = probe_id_hash_map(heap, map, key, hash)?;
    if let Some(slot) = found {
        set_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 2, value);
        return Ok(());
    }
    // Reusing a deleted slot doesn't raise occupancy.
    let (slot, new_occupied) = match first_deleted {
        Some(slot) => (slot, occupied),
        None => {
            if (occupied + 1) * 4 > capacity * 3 {
                return Err(Condition::map_full());
            }
            let mask = capacity - 1;
            let mut slot = (hash as u64) & mask;
            loop {
                let slot_hash = get_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS);
                if is_nothing(slot_hash) {
                    break;
                }
                slot = (slot + 1) & mask;
            }
            (slot, occupied + 1)
        }
    };
    set_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS, Value::new_integer(hash));
    set_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 1, key);
    set_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 2, value);
    set_id_hash_map_counters(heap, map, size + 1, new_occupied);
    Ok(())
}

// Re-inserts everything into a doubled entry array.
fn extend_id_hash_map(runtime: &mut Runtime, map: Value) -> Result<()> {
    let old_capacity = get_id_hash_map_capacity(&runtime.heap, map);
    let old_entries = get_id_hash_map_entry_array(&runtime.heap, map);
    let new_capacity = old_capacity * 2;
    let new_entries = new_heap_id_hash_map_entry_array(runtime, new_capacity)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        map.as_heap_object() + ID_HASH_MAP_CAPACITY_OFFSET,
        Value::new_integer(new_capacity as i64),
    );
    heap.set_value_at(map.as_heap_object() + ID_HASH_MAP_ENTRIES_OFFSET, new_entries);
    set_id_hash_map_counters(heap, map, 0, 0);
    for slot in 0..old_capacity {
        let slot_hash = get_array_at(heap, old_entries, slot * ID_HASH_MAP_ENTRY_FIELDS);
        if is_nothing(slot_hash) || value::is_null(slot_hash) {
            continue;
        }
        let key = get_array_at(heap, old_entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 1);
        let value = get_array_at(heap, old_entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 2);
        // Everything fit in the smaller array so this cannot fail.
        try_set_id_hash_map_at(heap, map, key, value)
            .expect("rehash into larger entry array failed");
    }
    Ok(())
}

pub fn set_id_hash_map_at(
    runtime: &mut Runtime,
    map: Value,
    key: Value,
    value: Value,
) -> Result<()> {
    debug_assert!(freeze::is_mutable(&runtime.heap, map));
    match try_set_id_hash_map_at(&mut runtime.heap, map, key, value) {
        Err(cond) if cond.cause() == value::Cause::MapFull => {
            extend_id_hash_map(runtime, map)?;
            try_set_id_hash_map_at(&mut runtime.heap, map, key, value)
        }
        other => other,
    }
}

pub fn delete_id_hash_map_at(heap: &mut Heap, map: Value, key: Value) -> Result<()> {
    let hash = behavior::value_transient_identity_hash(heap, key)?;
    let (found, _) = probe_id_hash_map(heap, map, key, hash)?;
    match found {
        Some(slot) => {
            let entries = get_id_hash_map_entry_array(heap, map);
            // The hash slot goes to null, not nothing: probe chains
            // passing through this slot must keep working.
            set_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS, null());
            set_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 1, null());
            set_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 2, null());
            let size = get_id_hash_map_size(heap, map);
            let occupied = get_id_hash_map_occupied_count(heap, map);
            set_id_hash_map_counters(heap, map, size - 1, occupied);
            Ok(())
        }
        None => Err(Condition::not_found()),
    }
}

// Snapshot of the live (key, value) pairs in slot order.
pub fn id_hash_map_entries(heap: &Heap, map: Value) -> Vec<(Value, Value)> {
    let capacity = get_id_hash_map_capacity(heap, map);
    let entries = get_id_hash_map_entry_array(heap, map);
    let mut result = Vec::new();
    for slot in 0..capacity {
        let slot_hash = get_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS);
        if is_nothing(slot_hash) || value::is_null(slot_hash) {
            continue;
        }
        let key = get_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 1);
        let value = get_array_at(heap, entries, slot * ID_HASH_MAP_ENTRY_FIELDS + 2);
        result.push((key, value));
    }
    result
}


// --- F i f o   b u f f e r ---
//
// Fixed-width records linked through two rings rooted at reserved
// sentinel nodes: node 0 roots the occupied ring, node 1 the free
// ring. Each node is (next, prev, data x width) flattened into the
// nodes array.

pub const FIFO_BUFFER_SIZE_OFFSET: u64 = 1;
pub const FIFO_BUFFER_WIDTH_OFFSET: u64 = 2;
pub const FIFO_BUFFER_NODES_OFFSET: u64 = 3;
pub const FIFO_BUFFER_SIZE: u64 = 4;

pub const FIFO_BUFFER_OCCUPIED_ROOT: u64 = 0;
pub const FIFO_BUFFER_FREE_ROOT: u64 = 1;
pub const FIFO_BUFFER_RESERVED_NODES: u64 = 2;
pub const FIFO_BUFFER_NODE_HEADER: u64 = 2;

fn fifo_buffer_node_length(width: u64) -> u64 {
    width + FIFO_BUFFER_NODE_HEADER
}

pub fn get_fifo_buffer_size(heap: &Heap, buffer: Value) -> u64 {
    debug_assert!(in_family(heap, Family::FifoBuffer, buffer));
    heap.value_at(buffer.as_heap_object() + FIFO_BUFFER_SIZE_OFFSET)
        .as_integer() as u64
}

pub fn get_fifo_buffer_width(heap: &Heap, buffer: Value) -> u64 {
    heap.value_at(buffer.as_heap_object() + FIFO_BUFFER_WIDTH_OFFSET)
        .as_integer() as u64
}

fn get_fifo_buffer_nodes(heap: &Heap, buffer: Value) -> Value {
    heap.value_at(buffer.as_heap_object() + FIFO_BUFFER_NODES_OFFSET)
}

fn fifo_buffer_capacity(heap: &Heap, buffer: Value) -> u64 {
    let nodes = get_fifo_buffer_nodes(heap, buffer);
    let width = get_fifo_buffer_width(heap, buffer);
    get_array_length(heap, nodes) / fifo_buffer_node_length(width)
}

fn get_fifo_node_next(heap: &Heap, buffer: Value, node: u64) -> u64 {
    let nodes = get_fifo_buffer_nodes(heap, buffer);
    let width = get_fifo_buffer_width(heap, buffer);
    get_array_at(heap, nodes, node * fifo_buffer_node_length(width)).as_integer() as u64
}

fn get_fifo_node_prev(heap: &Heap, buffer: Value, node: u64) -> u64 {
    let nodes = get_fifo_buffer_nodes(heap, buffer);
    let width = get_fifo_buffer_width(heap, buffer);
    get_array_at(heap, nodes, node * fifo_buffer_node_length(width) + 1).as_integer() as u64
}

fn set_fifo_node_next(heap: &mut Heap, buffer: Value, node: u64, next: u64) {
    let nodes = get_fifo_buffer_nodes(heap, buffer);
    let width = get_fifo_buffer_width(heap, buffer);
    set_array_at(
        heap,
        nodes,
        node * fifo_buffer_node_length(width),
        Value::new_integer(next as i64),
    );
}

fn set_fifo_node_prev(heap: &mut Heap, buffer: Value, node: u64, prev: u64) {
    let nodes = get_fifo_buffer_nodes(heap, buffer);
    let width = get_fifo_buffer_width(heap, buffer);
    set_array_at(
        heap,
        nodes,
        node * fifo_buffer_node_length(width) + 1,
        Value::new_integer(prev as i64),
    );
}

fn get_fifo_node_value(heap: &Heap, buffer: Value, node: u64, index: u64) -> Value {
    let nodes = get_fifo_buffer_nodes(heap, buffer);
    let width = get_fifo_buffer_width(heap, buffer);
    debug_assert!(index < width);
    get_array_at(heap, nodes, node * fifo_buffer_node_length(width) + FIFO_BUFFER_NODE_HEADER + index)
}

fn set_fifo_node_value(heap: &mut Heap, buffer: Value, node: u64, index: u64, value: Value) {
    let nodes = get_fifo_buffer_nodes(heap, buffer);
    let width = get_fifo_buffer_width(heap, buffer);
    debug_assert!(index < width);
    set_array_at(
        heap,
        nodes,
        node * fifo_buffer_node_length(width) + FIFO_BUFFER_NODE_HEADER + index,
        value,
    );
}

fn unlink_fifo_node(heap: &mut Heap, buffer: Value, node: u64) {
    let next = get_fifo_node_next(heap, buffer, node);
    let prev = get_fifo_node_prev(heap, buffer, node);
    set_fifo_node_next(heap, buffer, prev, next);
    set_fifo_node_prev(heap, buffer, next, prev);
}

// Links the node in immediately before the given ring root, which for
// the occupied ring means at the back of the queue.
fn link_fifo_node_before(heap: &mut Heap, buffer: Value, root: u64, node: u64) {
    let prev = get_fifo_node_prev(heap, buffer, root);
    set_fifo_node_next(heap, buffer, prev, node);
    set_fifo_node_prev(heap, buffer, node, prev);
    set_fifo_node_next(heap, buffer, node, root);
    set_fifo_node_prev(heap, buffer, root, node);
}

fn init_fifo_buffer_chains(heap: &mut Heap, buffer: Value, first_free: u64) {
    let capacity = fifo_buffer_capacity(heap, buffer);
    set_fifo_node_next(heap, buffer, FIFO_BUFFER_OCCUPIED_ROOT, FIFO_BUFFER_OCCUPIED_ROOT);
    set_fifo_node_prev(heap, buffer, FIFO_BUFFER_OCCUPIED_ROOT, FIFO_BUFFER_OCCUPIED_ROOT);
    set_fifo_node_next(heap, buffer, FIFO_BUFFER_FREE_ROOT, FIFO_BUFFER_FREE_ROOT);
    set_fifo_node_prev(heap, buffer, FIFO_BUFFER_FREE_ROOT, FIFO_BUFFER_FREE_ROOT);
    for node in first_free..capacity {
        link_fifo_node_before(heap, buffer, FIFO_BUFFER_FREE_ROOT, node);
    }
}

pub fn new_heap_fifo_buffer(
    runtime: &mut Runtime,
    width: u64,
    initial_capacity: u64,
) -> Result<Value> {
    let capacity = initial_capacity + FIFO_BUFFER_RESERVED_NODES;
    let nodes = new_heap_array(runtime, capacity * fifo_buffer_node_length(width))?;
    let species = runtime.species_for(Family::FifoBuffer, Mode::Mutable);
    let result = runtime.alloc_heap_object(FIFO_BUFFER_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        result.as_heap_object() + FIFO_BUFFER_SIZE_OFFSET,
        Value::new_integer(0),
    );
    heap.set_value_at(
        result.as_heap_object() + FIFO_BUFFER_WIDTH_OFFSET,
        Value::new_integer(width as i64),
    );
    heap.set_value_at(result.as_heap_object() + FIFO_BUFFER_NODES_OFFSET, nodes);
    init_fifo_buffer_chains(heap, result, FIFO_BUFFER_RESERVED_NODES);
    Ok(result)
}

pub fn is_fifo_buffer_empty(heap: &Heap, buffer: Value) -> bool {
    get_fifo_node_next(heap, buffer, FIFO_BUFFER_OCCUPIED_ROOT) == FIFO_BUFFER_OCCUPIED_ROOT
}

// Writes the record into a node pulled from the free ring, growing
// the nodes array when the free ring is empty.
pub fn offer_to_fifo_buffer(runtime: &mut Runtime, buffer: Value, values: &[Value]) -> Result<()> {
    let width = get_fifo_buffer_width(&runtime.heap, buffer);
    debug_assert!(values.len() as u64 == width);
    let mut node = get_fifo_node_next(&runtime.heap, buffer, FIFO_BUFFER_FREE_ROOT);
    if node == FIFO_BUFFER_FREE_ROOT {
        extend_fifo_buffer(runtime, buffer)?;
        node = get_fifo_node_next(&runtime.heap, buffer, FIFO_BUFFER_FREE_ROOT);
        debug_assert!(node != FIFO_BUFFER_FREE_ROOT);
    }
    let heap = &mut runtime.heap;
    unlink_fifo_node(heap, buffer, node);
    for (i, &value) in values.iter().enumerate() {
        set_fifo_node_value(heap, buffer, node, i as u64, value);
    }
    link_fifo_node_before(heap, buffer, FIFO_BUFFER_OCCUPIED_ROOT, node);
    let size = get_fifo_buffer_size(heap, buffer);
    heap.set_value_at(
        buffer.as_heap_object() + FIFO_BUFFER_SIZE_OFFSET,
        Value::new_integer(size as i64 + 1),
    );
    Ok(())
}

// Takes the oldest record, in insertion order.
pub fn take_from_fifo_buffer(heap: &mut Heap, buffer: Value) -> Result<Vec<Value>> {
    let node = get_fifo_node_next(heap, buffer, FIFO_BUFFER_OCCUPIED_ROOT);
    if node == FIFO_BUFFER_OCCUPIED_ROOT {
        return Err(Condition::not_found());
    }
    let width = get_fifo_buffer_width(heap, buffer);
    let mut values = Vec::with_capacity(width as usize);
    for i in 0..width {
        values.push(get_fifo_node_value(heap, buffer, node, i));
        set_fifo_node_value(heap, buffer, node, i, null());
    }
    unlink_fifo_node(heap, buffer, node);
    link_fifo_node_before(heap, buffer, FIFO_BUFFER_FREE_ROOT, node);
    let size = get_fifo_buffer_size(heap, buffer);
    heap.set_value_at(
        buffer.as_heap_object() + FIFO_BUFFER_SIZE_OFFSET,
        Value::new_integer(size as i64 - 1),
    );
    Ok(values)
}

// Doubles the node array and re-chains: occupied nodes keep their
// order, everything new joins the free ring.
fn extend_fifo_buffer(runtime: &mut Runtime, buffer: Value) -> Result<()> {
    let heap = &runtime.heap;
    let width = get_fifo_buffer_width(heap, buffer);
    let old_capacity = fifo_buffer_capacity(heap, buffer);
    // Collect the occupied records in order before rebuilding.
    let mut pending = Vec::new();
    let mut node = get_fifo_node_next(heap, buffer, FIFO_BUFFER_OCCUPIED_ROOT);
    while node != FIFO_BUFFER_OCCUPIED_ROOT {
        let mut record = Vec::with_capacity(width as usize);
        for i in 0..width {
            record.push(get_fifo_node_value(heap, buffer, node, i));
        }
        pending.push(record);
        node = get_fifo_node_next(heap, buffer, node);
    }
    let new_capacity = old_capacity * 2;
    let nodes = new_heap_array(runtime, new_capacity * fifo_buffer_node_length(width))?;
    let heap = &mut runtime.heap;
    heap.set_value_at(buffer.as_heap_object() + FIFO_BUFFER_NODES_OFFSET, nodes);
    init_fifo_buffer_chains(heap, buffer, FIFO_BUFFER_RESERVED_NODES);
    heap.set_value_at(
        buffer.as_heap_object() + FIFO_BUFFER_SIZE_OFFSET,
        Value::new_integer(0),
    );
    for record in &pending {
        let node = get_fifo_node_next(heap, buffer, FIFO_BUFFER_FREE_ROOT);
        unlink_fifo_node(heap, buffer, node);
        for (i, &value) in record.iter().enumerate() {
            set_fifo_node_value(heap, buffer, node, i as u64, value);
        }
        link_fifo_node_before(heap, buffer, FIFO_BUFFER_OCCUPIED_ROOT, node);
    }
    heap.set_value_at(
        buffer.as_heap_object() + FIFO_BUFFER_SIZE_OFFSET,
        Value::new_integer(pending.len() as i64),
    );
    Ok(())
}


// --- B l o b ---

pub const BLOB_LENGTH_OFFSET: u64 = 1;
pub const BLOB_DATA_OFFSET: u64 = 2;

pub fn blob_size(byte_length: u64) -> u64 {
    BLOB_DATA_OFFSET + (byte_length + 7) / 8
}

pub fn get_blob_length(heap: &Heap, blob: Value) -> u64 {
    heap.value_at(blob.as_heap_object() + BLOB_LENGTH_OFFSET)
        .as_integer() as u64
}

pub fn get_blob_byte_at(heap: &Heap, blob: Value, index: u64) -> u8 {
    debug_assert!(index < get_blob_length(heap, blob));
    let word = heap.word(blob.as_heap_object() + BLOB_DATA_OFFSET + index / 8);
    (word >> ((index % 8) * 8)) as u8
}

pub fn set_blob_byte_at(heap: &mut Heap, blob: Value, index: u64, byte: u8) {
    debug_assert!(index < get_blob_length(heap, blob));
    let addr = blob.as_heap_object() + BLOB_DATA_OFFSET + index / 8;
    let shift = (index % 8) * 8;
    let word = heap.word(addr);
    heap.set_word(addr, (word & !(0xFFu64 << shift)) | ((byte as u64) << shift));
}

pub fn get_blob_data(heap: &Heap, blob: Value) -> Vec<u8> {
    let length = get_blob_length(heap, blob);
    (0..length).map(|i| get_blob_byte_at(heap, blob, i)).collect()
}

pub fn new_heap_blob(runtime: &mut Runtime, byte_length: u64) -> Result<Value> {
    let species = runtime.species_for(Family::Blob, Mode::Mutable);
    let result = runtime.alloc_heap_object(blob_size(byte_length), species)?;
    runtime.heap.set_value_at(
        result.as_heap_object() + BLOB_LENGTH_OFFSET,
        Value::new_integer(byte_length as i64),
    );
    Ok(result)
}

pub fn new_heap_blob_with_data(runtime: &mut Runtime, data: &[u8]) -> Result<Value> {
    let result = new_heap_blob(runtime, data.len() as u64)?;
    for (i, &byte) in data.iter().enumerate() {
        set_blob_byte_at(&mut runtime.heap, result, i as u64, byte);
    }
    Ok(result)
}


// --- U t f 8 ---
//
// A length-prefixed byte sequence with a trailing NUL for interop.
// The recorded length does not include the NUL.

pub const UTF8_LENGTH_OFFSET: u64 = 1;
pub const UTF8_CHARS_OFFSET: u64 = 2;

pub fn utf8_size(byte_length: u64) -> u64 {
    UTF8_CHARS_OFFSET + (byte_length + 1 + 7) / 8
}

pub fn get_utf8_length(heap: &Heap, string: Value) -> u64 {
    heap.value_at(string.as_heap_object() + UTF8_LENGTH_OFFSET)
        .as_integer() as u64
}

pub fn get_utf8_contents(heap: &Heap, string: Value) -> String {
    let length = get_utf8_length(heap, string);
    let mut bytes = Vec::with_capacity(length as usize);
    for i in 0..length {
        let word = heap.word(string.as_heap_object() + UTF8_CHARS_OFFSET + i / 8);
        bytes.push((word >> ((i % 8) * 8)) as u8);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn new_heap_utf8(runtime: &mut Runtime, contents: &str) -> Result<Value> {
    let bytes = contents.as_bytes();
    let species = runtime.species_for(Family::Utf8, Mode::DeepFrozen);
    let result = runtime.alloc_heap_object(utf8_size(bytes.len() as u64), species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        result.as_heap_object() + UTF8_LENGTH_OFFSET,
        Value::new_integer(bytes.len() as i64),
    );
    for (i, &byte) in bytes.iter().enumerate() {
        let addr = result.as_heap_object() + UTF8_CHARS_OFFSET + (i as u64) / 8;
        let shift = ((i as u64) % 8) * 8;
        let word = heap.word(addr);
        heap.set_word(addr, (word & !(0xFFu64 << shift)) | ((byte as u64) << shift));
    }
    // The trailing NUL is already there: fresh words are zero.
    Ok(result)
}

pub fn utf8_equals(heap: &Heap, a: Value, b: Value) -> bool {
    if get_utf8_length(heap, a) != get_utf8_length(heap, b) {
        return false;
    }
    let length = get_utf8_length(heap, a);
    for i in 0..length {
        let word_a = heap.word(a.as_heap_object() + UTF8_CHARS_OFFSET + i / 8);
        let word_b = heap.word(b.as_heap_object() + UTF8_CHARS_OFFSET + i / 8);
        let shift = (i % 8) * 8;
        if (word_a >> shift) as u8 != (word_b >> shift) as u8 {
            return false;
        }
    }
    true
}

pub fn utf8_ordering_compare(heap: &Heap, a: Value, b: Value) -> Value {
    let a_str = get_utf8_contents(heap, a);
    let b_str = get_utf8_contents(heap, b);
    match a_str.cmp(&b_str) {
        std::cmp::Ordering::Less => value::less_than(),
        std::cmp::Ordering::Equal => value::equal(),
        std::cmp::Ordering::Greater => value::greater_than(),
    }
}


// --- I n s t a n c e ---

pub const INSTANCE_FIELDS_OFFSET: u64 = 1;
pub const INSTANCE_SIZE: u64 = 2;

pub fn get_instance_fields(heap: &Heap, instance: Value) -> Value {
    heap.value_at(instance.as_heap_object() + INSTANCE_FIELDS_OFFSET)
}

pub fn get_instance_field(heap: &Heap, instance: Value, key: Value) -> Result<Value> {
    get_id_hash_map_at(heap, get_instance_fields(heap, instance), key)
}

pub fn set_instance_field(
    runtime: &mut Runtime,
    instance: Value,
    key: Value,
    value: Value,
) -> Result<()> {
    debug_assert!(freeze::is_mutable(&runtime.heap, instance));
    let fields = get_instance_fields(&runtime.heap, instance);
    set_id_hash_map_at(runtime, fields, key, value)
}

pub fn new_heap_instance_species(
    runtime: &mut Runtime,
    primary_type: Value,
    manager: Value,
    mode: Mode,
) -> Result<Value> {
    let meta = runtime.species_species();
    let result = runtime.alloc_heap_object(INSTANCE_SPECIES_SIZE, meta)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + SPECIES_DIVISION_OFFSET, Value::new_integer(Division::Instance as i64));
    heap.set_value_at(addr + SPECIES_FAMILY_OFFSET, Value::new_integer(Family::Instance as i64));
    heap.set_value_at(addr + SPECIES_MODE_OFFSET, Value::new_integer(mode as i64));
    heap.set_value_at(addr + INSTANCE_SPECIES_TYPE_OFFSET, primary_type);
    heap.set_value_at(addr + INSTANCE_SPECIES_MANAGER_OFFSET, manager);
    Ok(result)
}

pub fn new_heap_instance(runtime: &mut Runtime, species: Value) -> Result<Value> {
    let fields = new_heap_id_hash_map(runtime, 16)?;
    let result = runtime.alloc_heap_object(INSTANCE_SIZE, species)?;
    runtime
        .heap
        .set_value_at(result.as_heap_object() + INSTANCE_FIELDS_OFFSET, fields);
    Ok(result)
}


// --- C   o b j e c t ---
//
// The species describes an aligned raw data region followed by a
// value region; both sizes are fixed per factory.

pub fn c_object_size(heap: &Heap, species: Value) -> u64 {
    1 + get_c_object_species_data_size(heap, species)
        + get_c_object_species_value_count(heap, species)
}

pub fn get_c_object_value_at(heap: &Heap, object: Value, index: u64) -> Value {
    let species = get_species(heap, object);
    debug_assert!(index < get_c_object_species_value_count(heap, species));
    let data_size = get_c_object_species_data_size(heap, species);
    heap.value_at(object.as_heap_object() + 1 + data_size + index)
}

pub fn set_c_object_value_at(heap: &mut Heap, object: Value, index: u64, value: Value) {
    let species = get_species(heap, object);
    let data_size = get_c_object_species_data_size(heap, species);
    heap.set_value_at(object.as_heap_object() + 1 + data_size + index, value);
}

pub fn get_c_object_data_word(heap: &Heap, object: Value, index: u64) -> u64 {
    let species = get_species(heap, object);
    debug_assert!(index < get_c_object_species_data_size(heap, species));
    heap.word(object.as_heap_object() + 1 + index)
}

pub fn set_c_object_data_word(heap: &mut Heap, object: Value, index: u64, word: u64) {
    heap.set_word(object.as_heap_object() + 1 + index, word);
}

pub fn new_heap_c_object_species(
    runtime: &mut Runtime,
    data_size: u64,
    value_count: u64,
    primary_type: Value,
    tag: Value,
) -> Result<Value> {
    let meta = runtime.species_species();
    let result = runtime.alloc_heap_object(C_OBJECT_SPECIES_SIZE, meta)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + SPECIES_DIVISION_OFFSET, Value::new_integer(Division::CObject as i64));
    heap.set_value_at(addr + SPECIES_FAMILY_OFFSET, Value::new_integer(Family::CObject as i64));
    heap.set_value_at(addr + SPECIES_MODE_OFFSET, Value::new_integer(Mode::Mutable as i64));
    heap.set_value_at(addr + C_OBJECT_SPECIES_DATA_SIZE_OFFSET, Value::new_integer(data_size as i64));
    heap.set_value_at(addr + C_OBJECT_SPECIES_VALUE_COUNT_OFFSET, Value::new_integer(value_count as i64));
    heap.set_value_at(addr + C_OBJECT_SPECIES_TYPE_OFFSET, primary_type);
    heap.set_value_at(addr + C_OBJECT_SPECIES_TAG_OFFSET, tag);
    Ok(result)
}

pub fn new_heap_c_object(runtime: &mut Runtime, species: Value) -> Result<Value> {
    let size = c_object_size(&runtime.heap, species);
    let result = runtime.alloc_heap_object(size, species)?;
    let value_count = get_c_object_species_value_count(&runtime.heap, species);
    for i in 0..value_count {
        set_c_object_value_at(&mut runtime.heap, result, i, null());
    }
    Ok(result)
}


// --- R e f e r e n c e ---

pub const REFERENCE_VALUE_OFFSET: u64 = 1;
pub const REFERENCE_SIZE: u64 = 2;

pub fn get_reference_value(heap: &Heap, reference: Value) -> Value {
    debug_assert!(in_family(heap, Family::Reference, reference));
    heap.value_at(reference.as_heap_object() + REFERENCE_VALUE_OFFSET)
}

pub fn set_reference_value(heap: &mut Heap, reference: Value, value: Value) {
    heap.set_value_at(reference.as_heap_object() + REFERENCE_VALUE_OFFSET, value);
}

pub fn new_heap_reference(runtime: &mut Runtime, value: Value) -> Result<Value> {
    let species = runtime.species_for(Family::Reference, Mode::Mutable);
    let result = runtime.alloc_heap_object(REFERENCE_SIZE, species)?;
    set_reference_value(&mut runtime.heap, result, value);
    Ok(result)
}


// --- F r e e z e   c h e a t ---
//
// A one-word cell whose species claims deep frozen while the slot
// stays writable. The sanctioned uses are method code pointers and
// methodspace caches; anything else needs a very good reason.

pub const FREEZE_CHEAT_VALUE_OFFSET: u64 = 1;
pub const FREEZE_CHEAT_SIZE: u64 = 2;

pub fn get_freeze_cheat_value(heap: &Heap, cheat: Value) -> Value {
    debug_assert!(in_family(heap, Family::FreezeCheat, cheat));
    heap.value_at(cheat.as_heap_object() + FREEZE_CHEAT_VALUE_OFFSET)
}

pub fn set_freeze_cheat_value(heap: &mut Heap, cheat: Value, value: Value) {
    heap.set_value_at(cheat.as_heap_object() + FREEZE_CHEAT_VALUE_OFFSET, value);
}

pub fn new_heap_freeze_cheat(runtime: &mut Runtime, value: Value) -> Result<Value> {
    let species = runtime.species_for(Family::FreezeCheat, Mode::DeepFrozen);
    let result = runtime.alloc_heap_object(FREEZE_CHEAT_SIZE, species)?;
    set_freeze_cheat_value(&mut runtime.heap, result, value);
    Ok(result)
}


// --- C o d e   b l o c k ---

pub const CODE_BLOCK_BYTECODE_OFFSET: u64 = 1;
pub const CODE_BLOCK_VALUE_POOL_OFFSET: u64 = 2;
pub const CODE_BLOCK_HIGH_WATER_MARK_OFFSET: u64 = 3;
pub const CODE_BLOCK_SIZE: u64 = 4;

pub fn get_code_block_bytecode(heap: &Heap, block: Value) -> Value {
    debug_assert!(in_family(heap, Family::CodeBlock, block));
    heap.value_at(block.as_heap_object() + CODE_BLOCK_BYTECODE_OFFSET)
}

pub fn get_code_block_value_pool(heap: &Heap, block: Value) -> Value {
    heap.value_at(block.as_heap_object() + CODE_BLOCK_VALUE_POOL_OFFSET)
}

pub fn get_code_block_high_water_mark(heap: &Heap, block: Value) -> u64 {
    heap.value_at(block.as_heap_object() + CODE_BLOCK_HIGH_WATER_MARK_OFFSET)
        .as_integer() as u64
}

pub fn new_heap_code_block(
    runtime: &mut Runtime,
    bytecode: Value,
    value_pool: Value,
    high_water_mark: u64,
) -> Result<Value> {
    let species = runtime.species_for(Family::CodeBlock, Mode::Mutable);
    let result = runtime.alloc_heap_object(CODE_BLOCK_SIZE, species)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + CODE_BLOCK_BYTECODE_OFFSET, bytecode);
    heap.set_value_at(addr + CODE_BLOCK_VALUE_POOL_OFFSET, value_pool);
    heap.set_value_at(
        addr + CODE_BLOCK_HIGH_WATER_MARK_OFFSET,
        Value::new_integer(high_water_mark as i64),
    );
    Ok(result)
}


// --- T y p e ---

pub const TYPE_DISPLAY_NAME_OFFSET: u64 = 1;
pub const TYPE_SIZE: u64 = 2;

pub fn get_type_display_name(heap: &Heap, type_value: Value) -> Value {
    heap.value_at(type_value.as_heap_object() + TYPE_DISPLAY_NAME_OFFSET)
}

pub fn new_heap_type(runtime: &mut Runtime, display_name: Value) -> Result<Value> {
    let species = runtime.species_for(Family::Type, Mode::Fluid);
    let result = runtime.alloc_heap_object(TYPE_SIZE, species)?;
    runtime
        .heap
        .set_value_at(result.as_heap_object() + TYPE_DISPLAY_NAME_OFFSET, display_name);
    Ok(result)
}


// --- K e y ---
//
// Keys are identity tokens ordered by a runtime-assigned id. The
// subject and selector keys get ids 0 and 1 so call tag entries sort
// them before everything else.

pub const KEY_ID_OFFSET: u64 = 1;
pub const KEY_DISPLAY_NAME_OFFSET: u64 = 2;
pub const KEY_SIZE: u64 = 3;

pub fn get_key_id(heap: &Heap, key: Value) -> i64 {
    debug_assert!(in_family(heap, Family::Key, key));
    heap.value_at(key.as_heap_object() + KEY_ID_OFFSET).as_integer()
}

pub fn get_key_display_name(heap: &Heap, key: Value) -> Value {
    heap.value_at(key.as_heap_object() + KEY_DISPLAY_NAME_OFFSET)
}

pub fn new_heap_key(runtime: &mut Runtime, display_name: Value) -> Result<Value> {
    let id = runtime.next_key_id();
    let species = runtime.species_for(Family::Key, Mode::Fluid);
    let result = runtime.alloc_heap_object(KEY_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + KEY_ID_OFFSET, Value::new_integer(id));
    heap.set_value_at(result.as_heap_object() + KEY_DISPLAY_NAME_OFFSET, display_name);
    Ok(result)
}


// --- O p e r a t i o n ---

// The selector shapes an invocation can carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationType {
    Call = 0,
    Index = 1,
    Infix = 2,
    Prefix = 3,
    Suffix = 4,
    Assign = 5,
}

impl OperationType {
    pub fn from_i64(raw: i64) -> OperationType {
        match raw {
            0 => OperationType::Call,
            1 => OperationType::Index,
            2 => OperationType::Infix,
            3 => OperationType::Prefix,
            4 => OperationType::Suffix,
            5 => OperationType::Assign,
            _ => panic!("invalid operation type {}", raw),
        }
    }
}

pub const OPERATION_TYPE_OFFSET: u64 = 1;
pub const OPERATION_VALUE_OFFSET: u64 = 2;
pub const OPERATION_SIZE: u64 = 3;

pub fn get_operation_type(heap: &Heap, operation: Value) -> OperationType {
    OperationType::from_i64(
        heap.value_at(operation.as_heap_object() + OPERATION_TYPE_OFFSET)
            .as_integer(),
    )
}

pub fn get_operation_value(heap: &Heap, operation: Value) -> Value {
    heap.value_at(operation.as_heap_object() + OPERATION_VALUE_OFFSET)
}

pub fn new_heap_operation(
    runtime: &mut Runtime,
    operation_type: OperationType,
    value: Value,
) -> Result<Value> {
    let species = runtime.species_for(Family::Operation, Mode::Fluid);
    let result = runtime.alloc_heap_object(OPERATION_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        result.as_heap_object() + OPERATION_TYPE_OFFSET,
        Value::new_integer(operation_type as i64),
    );
    heap.set_value_at(result.as_heap_object() + OPERATION_VALUE_OFFSET, value);
    Ok(result)
}


// --- P a t h ---

pub const PATH_HEAD_OFFSET: u64 = 1;
pub const PATH_TAIL_OFFSET: u64 = 2;
pub const PATH_SIZE: u64 = 3;

pub fn get_path_head(heap: &Heap, path: Value) -> Value {
    heap.value_at(path.as_heap_object() + PATH_HEAD_OFFSET)
}

pub fn get_path_tail(heap: &Heap, path: Value) -> Value {
    heap.value_at(path.as_heap_object() + PATH_TAIL_OFFSET)
}

pub fn is_path_empty(heap: &Heap, path: Value) -> bool {
    is_nothing(get_path_head(heap, path))
}

pub fn new_heap_path(runtime: &mut Runtime, head: Value, tail: Value) -> Result<Value> {
    let species = runtime.species_for(Family::Path, Mode::Fluid);
    let result = runtime.alloc_heap_object(PATH_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + PATH_HEAD_OFFSET, head);
    heap.set_value_at(result.as_heap_object() + PATH_TAIL_OFFSET, tail);
    Ok(result)
}


// --- P r o m i s e ---

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PromiseState {
    Pending = 0,
    Fulfilled = 1,
    Rejected = 2,
}

impl PromiseState {
    pub fn from_i64(raw: i64) -> PromiseState {
        match raw {
            0 => PromiseState::Pending,
            1 => PromiseState::Fulfilled,
            2 => PromiseState::Rejected,
            _ => panic!("invalid promise state {}", raw),
        }
    }
}

pub const PROMISE_STATE_OFFSET: u64 = 1;
pub const PROMISE_VALUE_OFFSET: u64 = 2;
pub const PROMISE_SIZE: u64 = 3;

pub fn get_promise_state(heap: &Heap, promise: Value) -> PromiseState {
    PromiseState::from_i64(
        heap.value_at(promise.as_heap_object() + PROMISE_STATE_OFFSET)
            .as_integer(),
    )
}

pub fn get_promise_value(heap: &Heap, promise: Value) -> Value {
    heap.value_at(promise.as_heap_object() + PROMISE_VALUE_OFFSET)
}

pub fn fulfill_promise(heap: &mut Heap, promise: Value, value: Value) {
    debug_assert!(get_promise_state(heap, promise) == PromiseState::Pending);
    heap.set_value_at(
        promise.as_heap_object() + PROMISE_STATE_OFFSET,
        Value::new_integer(PromiseState::Fulfilled as i64),
    );
    heap.set_value_at(promise.as_heap_object() + PROMISE_VALUE_OFFSET, value);
}

pub fn reject_promise(heap: &mut Heap, promise: Value, error: Value) {
    debug_assert!(get_promise_state(heap, promise) == PromiseState::Pending);
    heap.set_value_at(
        promise.as_heap_object() + PROMISE_STATE_OFFSET,
        Value::new_integer(PromiseState::Rejected as i64),
    );
    heap.set_value_at(promise.as_heap_object() + PROMISE_VALUE_OFFSET, error);
}

pub fn new_heap_pending_promise(runtime: &mut Runtime) -> Result<Value> {
    let species = runtime.species_for(Family::Promise, Mode::Mutable);
    let result = runtime.alloc_heap_object(PROMISE_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(
        result.as_heap_object() + PROMISE_STATE_OFFSET,
        Value::new_integer(PromiseState::Pending as i64),
    );
    heap.set_value_at(result.as_heap_object() + PROMISE_VALUE_OFFSET, nothing());
    Ok(result)
}


// --- N a m e s p a c e ,   m o d u l e s ---

pub const NAMESPACE_BINDINGS_OFFSET: u64 = 1;
pub const NAMESPACE_SIZE: u64 = 2;

pub fn get_namespace_bindings(heap: &Heap, namespace: Value) -> Value {
    heap.value_at(namespace.as_heap_object() + NAMESPACE_BINDINGS_OFFSET)
}

pub fn new_heap_namespace(runtime: &mut Runtime) -> Result<Value> {
    let bindings = new_heap_id_hash_map(runtime, 16)?;
    let species = runtime.species_for(Family::Namespace, Mode::Fluid);
    let result = runtime.alloc_heap_object(NAMESPACE_SIZE, species)?;
    runtime
        .heap
        .set_value_at(result.as_heap_object() + NAMESPACE_BINDINGS_OFFSET, bindings);
    Ok(result)
}

// Looks up a name along a path through namespace bindings.
pub fn namespace_lookup(heap: &Heap, namespace: Value, path: Value) -> Result<Value> {
    let head = get_path_head(heap, path);
    if is_nothing(head) {
        return Err(Condition::lookup_error(value::LookupError::Namespace));
    }
    let bindings = get_namespace_bindings(heap, namespace);
    let bound = get_id_hash_map_at(heap, bindings, head)
        .map_err(|_| Condition::lookup_error(value::LookupError::Namespace))?;
    let tail = get_path_tail(heap, path);
    if is_nothing(tail) || is_path_empty(heap, tail) {
        Ok(bound)
    } else if in_family(heap, Family::Namespace, bound) {
        namespace_lookup(heap, bound, tail)
    } else {
        Err(Condition::lookup_error(value::LookupError::Namespace))
    }
}

pub const MODULE_FRAGMENT_STAGE_OFFSET: u64 = 1;
pub const MODULE_FRAGMENT_NAMESPACE_OFFSET: u64 = 2;
pub const MODULE_FRAGMENT_METHODSPACE_OFFSET: u64 = 3;
pub const MODULE_FRAGMENT_SIZE: u64 = 4;

pub fn get_module_fragment_stage(heap: &Heap, fragment: Value) -> Value {
    heap.value_at(fragment.as_heap_object() + MODULE_FRAGMENT_STAGE_OFFSET)
}

pub fn get_module_fragment_namespace(heap: &Heap, fragment: Value) -> Value {
    heap.value_at(fragment.as_heap_object() + MODULE_FRAGMENT_NAMESPACE_OFFSET)
}

pub fn get_module_fragment_methodspace(heap: &Heap, fragment: Value) -> Value {
    heap.value_at(fragment.as_heap_object() + MODULE_FRAGMENT_METHODSPACE_OFFSET)
}

pub fn new_heap_module_fragment(
    runtime: &mut Runtime,
    stage: Value,
    namespace: Value,
    methodspace: Value,
) -> Result<Value> {
    let species = runtime.species_for(Family::ModuleFragment, Mode::Fluid);
    let result = runtime.alloc_heap_object(MODULE_FRAGMENT_SIZE, species)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + MODULE_FRAGMENT_STAGE_OFFSET, stage);
    heap.set_value_at(addr + MODULE_FRAGMENT_NAMESPACE_OFFSET, namespace);
    heap.set_value_at(addr + MODULE_FRAGMENT_METHODSPACE_OFFSET, methodspace);
    Ok(result)
}

pub const MODULE_PATH_OFFSET: u64 = 1;
pub const MODULE_FRAGMENTS_OFFSET: u64 = 2;
pub const MODULE_SIZE: u64 = 3;

pub fn get_module_path(heap: &Heap, module: Value) -> Value {
    heap.value_at(module.as_heap_object() + MODULE_PATH_OFFSET)
}

pub fn get_module_fragments(heap: &Heap, module: Value) -> Value {
    heap.value_at(module.as_heap_object() + MODULE_FRAGMENTS_OFFSET)
}

// Finds the fragment at the given stage offset.
pub fn get_module_fragment_at(heap: &Heap, module: Value, stage: Value) -> Result<Value> {
    let fragments = get_module_fragments(heap, module);
    let count = get_array_buffer_length(heap, fragments);
    for i in 0..count {
        let fragment = get_array_buffer_at(heap, fragments, i);
        if get_module_fragment_stage(heap, fragment).is_same(stage) {
            return Ok(fragment);
        }
    }
    Err(Condition::lookup_error(value::LookupError::NoSuchStage))
}

pub fn new_heap_module(runtime: &mut Runtime, path: Value) -> Result<Value> {
    let fragments = new_heap_array_buffer(runtime, 4)?;
    let species = runtime.species_for(Family::Module, Mode::Fluid);
    let result = runtime.alloc_heap_object(MODULE_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + MODULE_PATH_OFFSET, path);
    heap.set_value_at(result.as_heap_object() + MODULE_FRAGMENTS_OFFSET, fragments);
    Ok(result)
}

pub const LIBRARY_DISPLAY_NAME_OFFSET: u64 = 1;
pub const LIBRARY_MODULES_OFFSET: u64 = 2;
pub const LIBRARY_SIZE: u64 = 3;

pub fn get_library_display_name(heap: &Heap, library: Value) -> Value {
    heap.value_at(library.as_heap_object() + LIBRARY_DISPLAY_NAME_OFFSET)
}

pub fn set_library_display_name(heap: &mut Heap, library: Value, name: Value) {
    heap.set_value_at(library.as_heap_object() + LIBRARY_DISPLAY_NAME_OFFSET, name);
}

pub fn get_library_modules(heap: &Heap, library: Value) -> Value {
    heap.value_at(library.as_heap_object() + LIBRARY_MODULES_OFFSET)
}

pub fn new_heap_library(runtime: &mut Runtime, display_name: Value) -> Result<Value> {
    let modules = new_heap_id_hash_map(runtime, 16)?;
    let species = runtime.species_for(Family::Library, Mode::Mutable);
    let result = runtime.alloc_heap_object(LIBRARY_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + LIBRARY_DISPLAY_NAME_OFFSET, display_name);
    heap.set_value_at(result.as_heap_object() + LIBRARY_MODULES_OFFSET, modules);
    Ok(result)
}


// --- B u i l t i n   i m p l e m e n t a t i o n ---
//
// The implementation index points into the runtime's table of native
// functions; heap words can't hold function pointers.

pub const BUILTIN_IMPLEMENTATION_NAME_OFFSET: u64 = 1;
pub const BUILTIN_IMPLEMENTATION_INDEX_OFFSET: u64 = 2;
pub const BUILTIN_IMPLEMENTATION_ARGC_OFFSET: u64 = 3;
pub const BUILTIN_IMPLEMENTATION_FLAGS_OFFSET: u64 = 4;
pub const BUILTIN_IMPLEMENTATION_SIZE: u64 = 5;

pub fn get_builtin_implementation_name(heap: &Heap, builtin: Value) -> Value {
    heap.value_at(builtin.as_heap_object() + BUILTIN_IMPLEMENTATION_NAME_OFFSET)
}

pub fn get_builtin_implementation_index(heap: &Heap, builtin: Value) -> u64 {
    heap.value_at(builtin.as_heap_object() + BUILTIN_IMPLEMENTATION_INDEX_OFFSET)
        .as_integer() as u64
}

pub fn get_builtin_implementation_argc(heap: &Heap, builtin: Value) -> u64 {
    heap.value_at(builtin.as_heap_object() + BUILTIN_IMPLEMENTATION_ARGC_OFFSET)
        .as_integer() as u64
}

pub fn get_builtin_implementation_flags(heap: &Heap, builtin: Value) -> Value {
    heap.value_at(builtin.as_heap_object() + BUILTIN_IMPLEMENTATION_FLAGS_OFFSET)
}

pub fn new_heap_builtin_implementation(
    runtime: &mut Runtime,
    name: Value,
    index: u64,
    argc: u64,
    flags: Value,
) -> Result<Value> {
    let species = runtime.species_for(Family::BuiltinImplementation, Mode::Mutable);
    let result = runtime.alloc_heap_object(BUILTIN_IMPLEMENTATION_SIZE, species)?;
    let heap = &mut runtime.heap;
    let addr = result.as_heap_object();
    heap.set_value_at(addr + BUILTIN_IMPLEMENTATION_NAME_OFFSET, name);
    heap.set_value_at(addr + BUILTIN_IMPLEMENTATION_INDEX_OFFSET, Value::new_integer(index as i64));
    heap.set_value_at(addr + BUILTIN_IMPLEMENTATION_ARGC_OFFSET, Value::new_integer(argc as i64));
    heap.set_value_at(addr + BUILTIN_IMPLEMENTATION_FLAGS_OFFSET, flags);
    Ok(result)
}


// --- L a m b d a   a n d   b l o c k ---

pub const LAMBDA_METHODS_OFFSET: u64 = 1;
pub const LAMBDA_CAPTURES_OFFSET: u64 = 2;
pub const LAMBDA_SIZE: u64 = 3;

pub fn get_lambda_methods(heap: &Heap, lambda: Value) -> Value {
    debug_assert!(in_family(heap, Family::Lambda, lambda));
    heap.value_at(lambda.as_heap_object() + LAMBDA_METHODS_OFFSET)
}

pub fn get_lambda_captures(heap: &Heap, lambda: Value) -> Value {
    heap.value_at(lambda.as_heap_object() + LAMBDA_CAPTURES_OFFSET)
}

pub fn get_lambda_capture(heap: &Heap, lambda: Value, index: u64) -> Value {
    get_array_at(heap, get_lambda_captures(heap, lambda), index)
}

pub fn new_heap_lambda(runtime: &mut Runtime, methods: Value, captures: Value) -> Result<Value> {
    let species = runtime.species_for(Family::Lambda, Mode::Mutable);
    let result = runtime.alloc_heap_object(LAMBDA_SIZE, species)?;
    let heap = &mut runtime.heap;
    heap.set_value_at(result.as_heap_object() + LAMBDA_METHODS_OFFSET, methods);
    heap.set_value_at(result.as_heap_object() + LAMBDA_CAPTURES_OFFSET, captures);
    Ok(result)
}

pub const BLOCK_IS_LIVE_OFFSET: u64 = 1;
pub const BLOCK_SECTION_OFFSET: u64 = 2;
pub const BLOCK_SIZE: u64 = 3;

pub fn is_block_live(heap: &Heap, block: Value) -> bool {
    debug_assert!(in_family(heap, Family::Block, block));
    value::get_boolean_value(heap.value_at(block.as_heap_object() + BLOCK_IS_LIVE_OFFSET))
}

pub fn set_block_live(heap: &mut Heap, block: Value, live: bool) {
    heap.set_value_at(
        block.as_heap_object() + BLOCK_IS_LIVE_OFFSET,
        value::new_boolean(live),
    );
}

// The block section is a derived pointer into the stack piece that
// holds the block's refraction state.
pub fn get_block_section(heap: &Heap, block: Value) -> Value {
    heap.value_at(block.as_heap_object() + BLOCK_SECTION_OFFSET)
}

pub fn set_block_section(heap: &mut Heap, block: Value, section: Value) {
    heap.set_value_at(block.as_heap_object() + BLOCK_SECTION_OFFSET, section);
}

pub fn new_heap_block(runtime: &mut Runtime, section: Value) -> Result<Value> {
    let species = runtime.species_for(Family::Block, Mode::Mutable);
    let result = runtime.alloc_heap_object(BLOCK_SIZE, species)?;
    set_block_live(&mut runtime.heap, result, true);
    set_block_section(&mut runtime.heap, result, section);
    Ok(result)
}


// --- B e h a v i o r   s t a t i c s ---

fn all_values_layout(size: u64) -> ObjectLayout {
    ObjectLayout { size, value_offset: 1 }
}

pub fn generic_validate(heap: &Heap, value: Value) -> Result<()> {
    if !value.is_heap_object() {
        return Err(Condition::validation_failed());
    }
    if !get_header(heap, value).is_heap_object() {
        return Err(Condition::validation_failed());
    }
    Ok(())
}

pub static SPECIES_BEHAVIOR: Behavior =
    Behavior::base(get_species_layout, species_validate).modal();

pub static ARRAY_BEHAVIOR: Behavior = Behavior::base(
    |heap, value| all_values_layout(array_size(get_array_length(heap, value))),
    generic_validate,
)
.modal()
.with_hash(behavior::array_transient_identity_hash)
.with_compare(behavior::array_identity_compare);

pub static ARRAY_BUFFER_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(ARRAY_BUFFER_SIZE),
    generic_validate,
)
.modal()
.with_owned_freeze(|runtime, value| {
    let storage = get_array_buffer_storage(&runtime.heap, value);
    freeze::ensure_frozen(runtime, storage)
});

pub static ID_HASH_MAP_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(ID_HASH_MAP_SIZE),
    generic_validate,
)
.modal()
.with_owned_freeze(|runtime, value| {
    let entries = get_id_hash_map_entry_array(&runtime.heap, value);
    freeze::ensure_frozen(runtime, entries)
});

pub static FIFO_BUFFER_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(FIFO_BUFFER_SIZE), generic_validate);

pub static BLOB_BEHAVIOR: Behavior = Behavior::base(
    |heap, value| {
        let size = blob_size(get_blob_length(heap, value));
        ObjectLayout { size, value_offset: size }
    },
    generic_validate,
)
.modal();

pub static UTF8_BEHAVIOR: Behavior = Behavior::base(
    |heap, value| {
        let size = utf8_size(get_utf8_length(heap, value));
        ObjectLayout { size, value_offset: size }
    },
    generic_validate,
)
.modal()
.with_hash(|heap, value, stream, _| {
    stream.write_u64(get_utf8_length(heap, value));
    for byte in get_utf8_contents(heap, value).bytes() {
        stream.write_u64(byte as u64);
    }
    Ok(())
})
.with_compare(|heap, a, b, _| Ok(utf8_equals(heap, a, b)))
.with_ordering(utf8_ordering_compare)
.with_print(|heap, value, buffer| {
    buffer.push('"');
    buffer.push_str(&get_utf8_contents(heap, value));
    buffer.push('"');
});

pub static INSTANCE_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(INSTANCE_SIZE),
    generic_validate,
)
.instance_division()
.with_primary_type(|runtime, value| {
    get_instance_species_primary_type(&runtime.heap, get_species(&runtime.heap, value))
});

pub static C_OBJECT_BEHAVIOR: Behavior = Behavior::base(
    |heap, value| {
        let species = get_species(heap, value);
        ObjectLayout {
            size: c_object_size(heap, species),
            value_offset: 1 + get_c_object_species_data_size(heap, species),
        }
    },
    generic_validate,
)
.c_object_division()
.with_primary_type(|runtime, value| {
    get_c_object_species_type(&runtime.heap, get_species(&runtime.heap, value))
});

pub static REFERENCE_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(REFERENCE_SIZE), generic_validate);

// Freeze cheats claim deep frozen-ness while staying writable, so the
// deep freeze validator must not look at their fields.
pub static FREEZE_CHEAT_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(FREEZE_CHEAT_SIZE),
    generic_validate,
)
.fixed_mode(Mode::DeepFrozen)
.no_deep_frozen_field_validation();

pub static CODE_BLOCK_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(CODE_BLOCK_SIZE), generic_validate).modal();

pub static TYPE_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(TYPE_SIZE),
    generic_validate,
)
.modal()
.with_print(|heap, value, buffer| {
    let name = get_type_display_name(heap, value);
    if name.is_heap_object() && in_family(heap, Family::Utf8, name) {
        buffer.push_str(&get_utf8_contents(heap, name));
    } else {
        buffer.push_str("#<Type>");
    }
});

pub static KEY_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(KEY_SIZE),
    generic_validate,
)
.modal()
.with_ordering(|heap, a, b| {
    value::compare_signed_integers(get_key_id(heap, a), get_key_id(heap, b))
});

pub static OPERATION_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(OPERATION_SIZE),
    generic_validate,
)
.modal()
.with_hash(|heap, value, stream, detector| {
    detector.enter(value)?;
    stream.write_u64(get_operation_type(heap, value) as u64);
    let result =
        behavior::hash_value_into(heap, get_operation_value(heap, value), stream, detector);
    detector.leave();
    result
})
.with_compare(|heap, a, b, detector| {
    if get_operation_type(heap, a) != get_operation_type(heap, b) {
        return Ok(false);
    }
    detector.enter(a)?;
    let result = behavior::compare_values_inner(
        heap,
        get_operation_value(heap, a),
        get_operation_value(heap, b),
        detector,
    );
    detector.leave();
    result
});

pub static PATH_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(PATH_SIZE),
    generic_validate,
)
.modal()
.with_hash(|heap, value, stream, detector| {
    detector.enter(value)?;
    let head = behavior::hash_value_into(heap, get_path_head(heap, value), stream, detector);
    let result = match head {
        Ok(()) => behavior::hash_value_into(heap, get_path_tail(heap, value), stream, detector),
        err => err,
    };
    detector.leave();
    result
})
.with_compare(|heap, a, b, detector| {
    detector.enter(a)?;
    let heads = behavior::compare_values_inner(
        heap,
        get_path_head(heap, a),
        get_path_head(heap, b),
        detector,
    );
    let result = match heads {
        Ok(true) => behavior::compare_values_inner(
            heap,
            get_path_tail(heap, a),
            get_path_tail(heap, b),
            detector,
        ),
        other => other,
    };
    detector.leave();
    result
});

pub static PROMISE_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(PROMISE_SIZE), generic_validate);

pub static NAMESPACE_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(NAMESPACE_SIZE), generic_validate).modal();

pub static MODULE_FRAGMENT_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(MODULE_FRAGMENT_SIZE), generic_validate).modal();

pub static MODULE_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(MODULE_SIZE), generic_validate).modal();

pub static LIBRARY_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(LIBRARY_SIZE), generic_validate).modal();

pub static BUILTIN_IMPLEMENTATION_BEHAVIOR: Behavior = Behavior::base(
    |_, _| all_values_layout(BUILTIN_IMPLEMENTATION_SIZE),
    generic_validate,
)
.modal();

pub static LAMBDA_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(LAMBDA_SIZE), generic_validate);

pub static BLOCK_BEHAVIOR: Behavior =
    Behavior::base(|_, _| all_values_layout(BLOCK_SIZE), generic_validate);


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn new_test_runtime() -> Runtime {
        Runtime::with_default_config().expect("runtime creation failed")
    }

    #[test]
    fn test_allocator_identity() {
        let mut runtime = new_test_runtime();
        for &length in &[0u64, 1, 7, 100] {
            let array = new_heap_array(&mut runtime, length).unwrap();
            assert_eq!(get_family(&runtime.heap, array), Family::Array);
            assert_eq!(get_array_length(&runtime.heap, array), length);
            let layout = (get_behavior(&runtime.heap, array).layout)(&runtime.heap, array);
            assert_eq!(layout.size, array_size(length));
        }
    }

    #[test]
    fn test_array_element_round_trip() {
        let mut runtime = new_test_runtime();
        let array = new_heap_array(&mut runtime, 3).unwrap();
        for i in 0..3 {
            assert!(value::is_null(get_array_at(&runtime.heap, array, i)));
        }
        set_array_at(&mut runtime.heap, array, 1, Value::new_integer(13));
        assert_eq!(get_array_at(&runtime.heap, array, 1).as_integer(), 13);
    }

    #[test]
    fn test_array_buffer_growth() {
        let mut runtime = new_test_runtime();
        let buffer = new_heap_array_buffer(&mut runtime, 2).unwrap();
        for i in 0..20 {
            add_to_array_buffer(&mut runtime, buffer, Value::new_integer(i)).unwrap();
        }
        assert_eq!(get_array_buffer_length(&runtime.heap, buffer), 20);
        for i in 0..20 {
            assert_eq!(
                get_array_buffer_at(&runtime.heap, buffer, i as u64).as_integer(),
                i as i64
            );
        }
    }

    #[test]
    fn test_id_hash_map_round_trip() {
        let mut runtime = new_test_runtime();
        let map = new_heap_id_hash_map(&mut runtime, 4).unwrap();
        // Insert enough distinct keys to force several extensions.
        for i in 0..64 {
            set_id_hash_map_at(
                &mut runtime,
                map,
                Value::new_integer(i),
                Value::new_integer(i * 10),
            )
            .unwrap();
        }
        assert_eq!(get_id_hash_map_size(&runtime.heap, map), 64);
        for i in 0..64 {
            let got = get_id_hash_map_at(&runtime.heap, map, Value::new_integer(i)).unwrap();
            assert_eq!(got.as_integer(), i * 10);
        }
        // Capacity stays a power of two.
        let capacity = get_id_hash_map_capacity(&runtime.heap, map);
        assert!(capacity.is_power_of_two());
        // Overwriting keeps size fixed and returns the last value.
        set_id_hash_map_at(&mut runtime, map, Value::new_integer(7), Value::new_integer(1234))
            .unwrap();
        assert_eq!(get_id_hash_map_size(&runtime.heap, map), 64);
        assert_eq!(
            get_id_hash_map_at(&runtime.heap, map, Value::new_integer(7))
                .unwrap()
                .as_integer(),
            1234
        );
    }

    #[test]
    fn test_id_hash_map_deletion() {
        let mut runtime = new_test_runtime();
        let map = new_heap_id_hash_map(&mut runtime, 8).unwrap();
        for i in 0..6 {
            set_id_hash_map_at(&mut runtime, map, Value::new_integer(i), Value::new_integer(i))
                .unwrap();
        }
        delete_id_hash_map_at(&mut runtime.heap, map, Value::new_integer(3)).unwrap();
        assert_eq!(get_id_hash_map_size(&runtime.heap, map), 5);
        // Deleted slots stay occupied.
        assert!(get_id_hash_map_occupied_count(&runtime.heap, map) >= 6);
        assert!(get_id_hash_map_at(&runtime.heap, map, Value::new_integer(3)).is_err());
        // Probe chains across the deleted slot keep working.
        for i in [0i64, 1, 2, 4, 5].iter() {
            assert!(get_id_hash_map_at(&runtime.heap, map, Value::new_integer(*i)).is_ok());
        }
        // The deleted slot is reusable.
        set_id_hash_map_at(&mut runtime, map, Value::new_integer(3), Value::new_integer(33))
            .unwrap();
        assert_eq!(
            get_id_hash_map_at(&runtime.heap, map, Value::new_integer(3))
                .unwrap()
                .as_integer(),
            33
        );
    }

    #[test]
    fn test_string_keys_in_map() {
        let mut runtime = new_test_runtime();
        let map = new_heap_id_hash_map(&mut runtime, 4).unwrap();
        let foo_a = new_heap_utf8(&mut runtime, "foo").unwrap();
        let foo_b = new_heap_utf8(&mut runtime, "foo").unwrap();
        let bar = new_heap_utf8(&mut runtime, "bar").unwrap();
        set_id_hash_map_at(&mut runtime, map, foo_a, Value::new_integer(1)).unwrap();
        // Different heap object, identical contents: same map entry.
        let got = get_id_hash_map_at(&runtime.heap, map, foo_b).unwrap();
        assert_eq!(got.as_integer(), 1);
        assert!(get_id_hash_map_at(&runtime.heap, map, bar).is_err());
    }

    #[test]
    fn test_fifo_buffer_order_and_growth() {
        let mut runtime = new_test_runtime();
        let buffer = new_heap_fifo_buffer(&mut runtime, 2, 2).unwrap();
        for i in 0..10 {
            offer_to_fifo_buffer(
                &mut runtime,
                buffer,
                &[Value::new_integer(i), Value::new_integer(i * 2)],
            )
            .unwrap();
        }
        assert_eq!(get_fifo_buffer_size(&runtime.heap, buffer), 10);
        // Taken in insertion order.
        for i in 0..10 {
            let record = take_from_fifo_buffer(&mut runtime.heap, buffer).unwrap();
            assert_eq!(record[0].as_integer(), i);
            assert_eq!(record[1].as_integer(), i * 2);
        }
        assert!(is_fifo_buffer_empty(&runtime.heap, buffer));
        assert!(take_from_fifo_buffer(&mut runtime.heap, buffer).is_err());
    }

    #[test]
    fn test_blob_bytes() {
        let mut runtime = new_test_runtime();
        let blob = new_heap_blob_with_data(&mut runtime, &[1, 2, 3, 250, 255]).unwrap();
        assert_eq!(get_blob_length(&runtime.heap, blob), 5);
        assert_eq!(get_blob_data(&runtime.heap, blob), vec![1, 2, 3, 250, 255]);
        set_blob_byte_at(&mut runtime.heap, blob, 0, 9);
        assert_eq!(get_blob_byte_at(&runtime.heap, blob, 0), 9);
        assert_eq!(get_blob_byte_at(&runtime.heap, blob, 1), 2);
    }

    #[test]
    fn test_utf8_contents() {
        let mut runtime = new_test_runtime();
        let string = new_heap_utf8(&mut runtime, "hello, world").unwrap();
        assert_eq!(get_utf8_contents(&runtime.heap, string), "hello, world");
        let other = new_heap_utf8(&mut runtime, "hello, world").unwrap();
        assert!(utf8_equals(&runtime.heap, string, other));
        let different = new_heap_utf8(&mut runtime, "hello, there").unwrap();
        assert!(!utf8_equals(&runtime.heap, string, different));
    }

    #[test]
    fn test_pair_array_sort_and_search() {
        let mut runtime = new_test_runtime();
        let array = new_heap_pair_array(&mut runtime, 4).unwrap();
        let keys = [7i64, 1, 5, 3];
        for (i, &k) in keys.iter().enumerate() {
            set_pair_array_first_at(&mut runtime.heap, array, i as u64, Value::new_integer(k));
            set_pair_array_second_at(
                &mut runtime.heap,
                array,
                i as u64,
                Value::new_integer(k * 100),
            );
        }
        co_sort_pair_array(&mut runtime.heap, array);
        let mut previous = i64::min_value();
        for i in 0..4 {
            let first = get_pair_array_first_at(&runtime.heap, array, i).as_integer();
            assert!(previous < first);
            previous = first;
        }
        for &k in &keys {
            let found = binary_search_pair_array(&runtime.heap, array, Value::new_integer(k)).unwrap();
            assert_eq!(found.as_integer(), k * 100);
        }
        assert!(binary_search_pair_array(&runtime.heap, array, Value::new_integer(2)).is_err());
    }

    #[test]
    fn test_reference_cell() {
        let mut runtime = new_test_runtime();
        let reference = new_heap_reference(&mut runtime, Value::new_integer(5)).unwrap();
        assert_eq!(get_reference_value(&runtime.heap, reference).as_integer(), 5);
        set_reference_value(&mut runtime.heap, reference, Value::new_integer(6));
        assert_eq!(get_reference_value(&runtime.heap, reference).as_integer(), 6);
    }

    #[test]
    fn test_promise_transitions() {
        let mut runtime = new_test_runtime();
        let promise = new_heap_pending_promise(&mut runtime).unwrap();
        assert_eq!(get_promise_state(&runtime.heap, promise), PromiseState::Pending);
        fulfill_promise(&mut runtime.heap, promise, Value::new_integer(9));
        assert_eq!(get_promise_state(&runtime.heap, promise), PromiseState::Fulfilled);
        assert_eq!(get_promise_value(&runtime.heap, promise).as_integer(), 9);
    }

    #[test]
    fn test_key_ordering() {
        let mut runtime = new_test_runtime();
        let subject = runtime.roots().subject_key;
        let selector = runtime.roots().selector_key;
        assert_eq!(get_key_id(&runtime.heap, subject), 0);
        assert_eq!(get_key_id(&runtime.heap, selector), 1);
        let relation = behavior::value_ordering_compare(&runtime.heap, subject, selector);
        assert!(relation.is_same(value::less_than()));
    }

    #[test]
    fn test_instance_fields() {
        let mut runtime = new_test_runtime();
        let species = runtime.roots().empty_instance_species;
        let instance = new_heap_instance(&mut runtime, species).unwrap();
        let key = new_heap_utf8(&mut runtime, "x").unwrap();
        set_instance_field(&mut runtime, instance, key, Value::new_integer(3)).unwrap();
        assert_eq!(
            get_instance_field(&runtime.heap, instance, key).unwrap().as_integer(),
            3
        );
    }
}
