// Value freezing.
//
// Any value is in one of four modes, Fluid < Mutable < Frozen <
// DeepFrozen, and only ever moves up. Fluid allows structural change,
// Mutable allows field writes, Frozen forbids writes, and DeepFrozen
// asserts that everything transitively reachable is frozen too. Deep
// frozen-ness is a graph property: it is established by an explicit
// validation pass and only reported afterwards.
//
// Freezing an object also freezes the values it owns outright (an id
// hash map owns its entry array, an array buffer its storage): those
// are implementation details a caller shouldn't have to know exist.

use enumflags2::BitFlags;

use crate::behavior::{self, Mode, ModeRule};
use crate::heap::Heap;
use crate::object;
use crate::runtime::Runtime;
use crate::value::{Condition, Result, Value};


pub fn is_mutable(heap: &Heap, value: Value) -> bool {
    behavior::get_value_mode(heap, value) <= Mode::Mutable
}

pub fn is_frozen(heap: &Heap, value: Value) -> bool {
    behavior::get_value_mode(heap, value) >= Mode::Frozen
}

// Reports the previously-validated bit only; it never traverses.
pub fn peek_deep_frozen(heap: &Heap, value: Value) -> bool {
    behavior::get_value_mode(heap, value) == Mode::DeepFrozen
}

// Moves the value to the given mode without checking the lattice
// direction. For modal species this swaps in the sibling species of
// the target mode; for instance and c-object species it stamps a
// fresh species; fixed-mode families only accept their fixed mode.
pub fn set_value_mode_unchecked(runtime: &mut Runtime, value: Value, mode: Mode) -> Result<()> {
    if value.is_immediate() {
        return if mode == Mode::DeepFrozen {
            Ok(())
        } else {
            Err(Condition::invalid_mode_change(Mode::DeepFrozen as u32))
        };
    }
    let behavior = object::get_behavior(&runtime.heap, value);
    match behavior.mode_rule {
        ModeRule::Fixed(fixed) => {
            if mode == fixed {
                Ok(())
            } else {
                Err(Condition::invalid_mode_change(fixed as u32))
            }
        }
        ModeRule::FromSpecies => {
            let species = object::get_species(&runtime.heap, value);
            match object::get_species_division(&runtime.heap, species) {
                object::Division::Modal => {
                    // The sibling with the target mode sits next to
                    // this species' base root.
                    let sibling = runtime.modal_species_sibling(species, mode);
                    object::set_header(&mut runtime.heap, value, sibling);
                    Ok(())
                }
                object::Division::Instance => {
                    let primary_type =
                        object::get_instance_species_primary_type(&runtime.heap, species);
                    let manager = runtime.heap.value_at(
                        species.as_heap_object() + object::INSTANCE_SPECIES_MANAGER_OFFSET,
                    );
                    let sibling =
                        object::new_heap_instance_species(runtime, primary_type, manager, mode)?;
                    object::set_header(&mut runtime.heap, value, sibling);
                    Ok(())
                }
                object::Division::CObject => {
                    runtime.heap.set_value_at(
                        species.as_heap_object() + object::SPECIES_MODE_OFFSET,
                        Value::new_integer(mode as i64),
                    );
                    Ok(())
                }
                object::Division::Compact => {
                    panic!("compact species with species-driven mode")
                }
            }
        }
    }
}

// The checked version: transitions must go up the lattice.
pub fn set_value_mode(runtime: &mut Runtime, value: Value, mode: Mode) -> Result<()> {
    let current = behavior::get_value_mode(&runtime.heap, value);
    if mode < current {
        return Err(Condition::invalid_mode_change(current as u32));
    }
    if mode == current {
        return Ok(());
    }
    set_value_mode_unchecked(runtime, value, mode)
}

// Freezes the immediate object only; owned and referenced values are
// left alone.
pub fn ensure_shallow_frozen(runtime: &mut Runtime, value: Value) -> Result<()> {
    if is_frozen(&runtime.heap, value) {
        Ok(())
    } else {
        set_value_mode_unchecked(runtime, value, Mode::Frozen)
    }
}

// Freezes the object and everything it owns.
pub fn ensure_frozen(runtime: &mut Runtime, value: Value) -> Result<()> {
    if is_frozen(&runtime.heap, value) {
        return Ok(());
    }
    ensure_shallow_frozen(runtime, value)?;
    if value.is_heap_object() {
        if let Some(freeze_owned) = object::get_behavior(&runtime.heap, value).ensure_owned_values_frozen {
            freeze_owned(runtime, value)?;
        }
    }
    Ok(())
}


// What ensure_id_hash_map_frozen freezes besides the map itself.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum MapFreezeFlag {
    FreezeKeys = 0b01,
    FreezeValues = 0b10,
}

pub fn ensure_id_hash_map_frozen(
    runtime: &mut Runtime,
    map: Value,
    flags: BitFlags<MapFreezeFlag>,
) -> Result<()> {
    ensure_frozen(runtime, map)?;
    let entries = object::id_hash_map_entries(&runtime.heap, map);
    for (key, value) in entries {
        if flags.contains(MapFreezeFlag::FreezeKeys) {
            ensure_shallow_frozen(runtime, key)?;
        }
        if flags.contains(MapFreezeFlag::FreezeValues) {
            ensure_shallow_frozen(runtime, value)?;
        }
    }
    Ok(())
}


// Establishes deep frozen-ness. The object is tentatively upgraded,
// then its fields are scanned and validated recursively; on failure
// the object is restored to Frozen and the first offender reported.
// A successful traversal leaves the whole reachable sub-graph marked.
pub fn try_validate_deep_frozen(
    runtime: &mut Runtime,
    value: Value,
) -> std::result::Result<(), Value> {
    let mode = behavior::get_value_mode(&runtime.heap, value);
    if mode == Mode::DeepFrozen {
        return Ok(());
    }
    if mode < Mode::Frozen {
        return Err(value);
    }
    // Mark before recursing so cycles terminate.
    if set_value_mode_unchecked(runtime, value, Mode::DeepFrozen).is_err() {
        return Err(value);
    }
    let behavior = object::get_behavior(&runtime.heap, value);
    if behavior.deep_frozen_field_validation {
        // The species counts too: it must be frozen before any of its
        // instances can be deep frozen.
        let layout = behavior::object_layout(&runtime.heap, value);
        let base = value.as_heap_object();
        for offset in std::iter::once(0).chain(layout.value_offset..layout.size) {
            let field = runtime.heap.value_at(base + offset);
            if field.is_derived_object() {
                restore_frozen(runtime, value);
                return Err(field);
            }
            if !field.is_heap_object() {
                continue;
            }
            if let Err(offender) = try_validate_deep_frozen(runtime, field) {
                restore_frozen(runtime, value);
                return Err(offender);
            }
        }
    }
    Ok(())
}

fn restore_frozen(runtime: &mut Runtime, value: Value) {
    set_value_mode_unchecked(runtime, value, Mode::Frozen)
        .expect("restoring frozen mode failed");
}

pub fn validate_deep_frozen(runtime: &mut Runtime, value: Value) -> Result<()> {
    match try_validate_deep_frozen(runtime, value) {
        Ok(()) => Ok(()),
        Err(_offender) => Err(Condition::not_deep_frozen()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{
        get_freeze_cheat_value, new_heap_array, new_heap_freeze_cheat, new_heap_pending_promise,
        set_array_at, set_freeze_cheat_value,
    };
    use crate::value::{self, Cause};

    fn new_test_runtime() -> Runtime {
        Runtime::with_default_config().expect("runtime creation failed")
    }

    #[test]
    fn test_freeze_lattice_monotone() {
        let mut runtime = new_test_runtime();
        let array = new_heap_array(&mut runtime, 2).unwrap();
        assert!(is_mutable(&runtime.heap, array));
        assert!(!is_frozen(&runtime.heap, array));

        ensure_shallow_frozen(&mut runtime, array).unwrap();
        assert!(is_frozen(&runtime.heap, array));
        assert!(!is_mutable(&runtime.heap, array));

        // Freezing again is harmless.
        ensure_shallow_frozen(&mut runtime, array).unwrap();
        ensure_frozen(&mut runtime, array).unwrap();
        assert!(is_frozen(&runtime.heap, array));

        // Going back down is refused and reports the current mode.
        let err = set_value_mode(&mut runtime, array, Mode::Mutable).unwrap_err();
        assert_eq!(err.cause(), Cause::InvalidModeChange);
        assert_eq!(err.details(), Mode::Frozen as u32);
        assert!(is_frozen(&runtime.heap, array));
    }

    #[test]
    fn test_fixed_mode_families_refuse_freezing() {
        let mut runtime = new_test_runtime();
        let promise = new_heap_pending_promise(&mut runtime).unwrap();
        let err = ensure_shallow_frozen(&mut runtime, promise).unwrap_err();
        assert_eq!(err.cause(), Cause::InvalidModeChange);
    }

    #[test]
    fn test_immediates_are_deep_frozen() {
        let runtime = new_test_runtime();
        assert!(peek_deep_frozen(&runtime.heap, Value::new_integer(3)));
        assert!(peek_deep_frozen(&runtime.heap, value::yes()));
        assert!(peek_deep_frozen(&runtime.heap, value::nothing()));
    }

    #[test]
    fn test_deep_frozen_is_transitive() {
        let mut runtime = new_test_runtime();
        let inner = new_heap_array(&mut runtime, 1).unwrap();
        let outer = new_heap_array(&mut runtime, 2).unwrap();
        set_array_at(&mut runtime.heap, outer, 0, inner);
        set_array_at(&mut runtime.heap, outer, 1, Value::new_integer(3));

        // Validation refuses while the graph is still mutable.
        assert!(try_validate_deep_frozen(&mut runtime, outer).is_err());
        assert!(!peek_deep_frozen(&runtime.heap, outer));

        ensure_frozen(&mut runtime, outer).unwrap();
        // Inner is reachable but not owned, so it is still mutable and
        // the graph is not deep frozen; outer is restored to frozen.
        assert!(try_validate_deep_frozen(&mut runtime, outer).is_err());
        assert!(!peek_deep_frozen(&runtime.heap, outer));
        assert!(is_frozen(&runtime.heap, outer));

        ensure_frozen(&mut runtime, inner).unwrap();
        try_validate_deep_frozen(&mut runtime, outer).unwrap();
        // Everything reachable carries the bit now.
        assert!(peek_deep_frozen(&runtime.heap, outer));
        assert!(peek_deep_frozen(&runtime.heap, inner));
    }

    #[test]
    fn test_validation_reports_offender() {
        let mut runtime = new_test_runtime();
        let mutable = new_heap_array(&mut runtime, 1).unwrap();
        let outer = new_heap_array(&mut runtime, 1).unwrap();
        set_array_at(&mut runtime.heap, outer, 0, mutable);
        ensure_frozen(&mut runtime, outer).unwrap();
        let offender = try_validate_deep_frozen(&mut runtime, outer).unwrap_err();
        assert!(offender.is_same(mutable));
        let err = validate_deep_frozen(&mut runtime, outer).unwrap_err();
        assert_eq!(err.cause(), Cause::NotDeepFrozen);
    }

    #[test]
    fn test_freeze_cheat_mutable_inside_deep_frozen() {
        let mut runtime = new_test_runtime();
        let mutable = new_heap_array(&mut runtime, 1).unwrap();
        let cheat = new_heap_freeze_cheat(&mut runtime, mutable).unwrap();
        let outer = new_heap_array(&mut runtime, 1).unwrap();
        set_array_at(&mut runtime.heap, outer, 0, cheat);
        ensure_frozen(&mut runtime, outer).unwrap();
        // The cheat hides its mutable contents from validation.
        try_validate_deep_frozen(&mut runtime, outer).unwrap();
        assert!(peek_deep_frozen(&runtime.heap, outer));
        // And it can still be written through.
        set_freeze_cheat_value(&mut runtime.heap, cheat, Value::new_integer(1));
        assert_eq!(get_freeze_cheat_value(&runtime.heap, cheat).as_integer(), 1);
    }

    #[test]
    fn test_map_freeze_modes() {
        let mut runtime = new_test_runtime();
        let map = crate::object::new_heap_id_hash_map(&mut runtime, 4).unwrap();
        let key = new_heap_array(&mut runtime, 0).unwrap();
        let value = new_heap_array(&mut runtime, 0).unwrap();
        crate::object::set_id_hash_map_at(&mut runtime, map, key, value).unwrap();
        ensure_id_hash_map_frozen(&mut runtime, map, MapFreezeFlag::FreezeValues.into()).unwrap();
        assert!(is_frozen(&runtime.heap, map));
        // The entry array is owned, so it froze too.
        let entries = crate::object::get_id_hash_map_entry_array(&runtime.heap, map);
        assert!(is_frozen(&runtime.heap, entries));
        assert!(is_frozen(&runtime.heap, value));
        assert!(!is_frozen(&runtime.heap, key));
    }
}
